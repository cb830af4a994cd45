use const_format::concatcp;
use serde_json::json;
use webpilot_providers::Tool;

const VISION_GUIDANCE: &str = "# Working with screenshots
When a tool result mentions an attached screenshot, the image follows in the \
next message. Inspect it before acting: verify the page actually shows what \
you expect, read visible error banners, and locate the element you are about \
to interact with. If the page looks wrong, take a fresh snapshot before \
retrying.";

const TAB_GUIDANCE: &str = "# Tab management
Work in a single tab whenever possible. Tab indices are renumbered when a tab \
closes, so always re-check the current tab list before addressing a tab by \
index. The session enforces a tab limit; if a tool call is refused because of \
it, close a tab you no longer need and try again.";

const RECOVERY_GUIDANCE: &str = "# Error recovery
A failed tool call is reported in its result; it does not end the task. Read \
the error, re-snapshot the page if the state is unclear, and try a different \
selector or approach. If the same action fails repeatedly, change strategy \
instead of repeating it.";

/// Fixed guidance appended to the caller's system instructions for every task.
pub const DEFAULT_GUIDANCE: &str = concatcp!(
    VISION_GUIDANCE,
    "\n\n",
    TAB_GUIDANCE,
    "\n\n",
    RECOVERY_GUIDANCE
);

pub const COMPLETION_CHECK_INSTRUCTIONS: &str = "You judge whether a browser \
task has been completed, based on the task description and the current page \
state. Report your verdict with the report_completion tool. Only report \
complete when the page state clearly shows the task is done; when in doubt, \
report not complete.";

pub const REPORT_COMPLETION_TOOL: &str = "report_completion";

/// Schema for the forced-choice completion verdict.
pub fn completion_report_tool() -> Tool {
    Tool {
        name: REPORT_COMPLETION_TOOL.to_string(),
        description: "Report whether the task is complete".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "complete": {
                    "type": "boolean",
                    "description": "True only if the page state shows the task is done"
                },
                "summary": {
                    "type": "string",
                    "description": "One-sentence justification for the verdict"
                }
            },
            "required": ["complete"]
        }),
    }
}
