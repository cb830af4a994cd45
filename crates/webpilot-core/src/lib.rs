//! Agentic browser-driving loop.
//!
//! The [`Agent`] owns one conversation at a time and turns the model's tool
//! calls into browser operations through a [`SessionGovernor`]: fetch live
//! tab context, ask the model for the next step, execute the requested tools
//! strictly in order, fold the results (text and screenshots) back into the
//! conversation, prune history to a retention window, and stop when the model
//! answers with plain text or the turn budget runs out.

pub mod prompts;
pub mod ui_writer;

pub use ui_writer::{NullUiWriter, UiWriter};

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webpilot_browser::{
    ContentBlock, GatewayError, SessionGovernor, ToolBackend, ToolResult, SNAPSHOT_TOOL,
};
use webpilot_config::Config;
use webpilot_providers::{
    complete_with_retry, ChatProvider, CompletionRequest, Message, MessageRole, ProviderError,
    RetryPolicy, TokenUsage, Tool, ToolCall, ToolChoice,
};

/// Placeholder inserted in a tool message where an image was; the raw image
/// travels in the user message that immediately follows.
const IMAGE_PLACEHOLDER: &str = "[screenshot captured — see the attached image]";

#[derive(Debug, Clone)]
pub struct TaskResult {
    /// The model's final free-text answer. May be empty.
    pub response: String,
    pub turns: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The model kept calling tools past the turn ceiling. The caller may
    /// retry the whole task once; within this call it is a hard stop.
    #[error("turn budget of {0} exceeded")]
    TurnBudgetExceeded(usize),
    #[error("task cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Ordered message log for one in-flight task. The first two messages
/// (system instructions, task) are permanent; everything between them and
/// the retention window can be collapsed into a single placeholder.
pub struct Conversation {
    messages: Vec<Message>,
    /// Whether messages[2] is a collapse placeholder from an earlier prune.
    collapsed: bool,
    /// Total messages removed across all prunes of this conversation.
    pruned_total: usize,
}

impl Conversation {
    pub fn new(system: Message, task: Message) -> Self {
        Self {
            messages: vec![system, task],
            collapsed: false,
            pruned_total: 0,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn assistant_turns(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .count()
    }

    /// Collapse everything between the two permanent seed messages and the
    /// most recent `window` assistant turns into one placeholder. Returns the
    /// number of messages removed by this call; stable once the turn count is
    /// back at the window boundary.
    pub fn prune(&mut self, window: usize) -> usize {
        if window == 0 {
            return 0;
        }
        let turns = self.assistant_turns();
        if turns <= window {
            return 0;
        }

        // Index of the oldest assistant turn to keep verbatim
        let mut to_skip = turns - window;
        let mut keep_from = self.messages.len();
        for (i, message) in self.messages.iter().enumerate().skip(2) {
            if message.role == MessageRole::Assistant {
                if to_skip == 0 {
                    keep_from = i;
                    break;
                }
                to_skip -= 1;
            }
        }

        let region_len = keep_from.saturating_sub(2);
        if region_len == 0 {
            return 0;
        }
        let removed = if self.collapsed {
            region_len - 1
        } else {
            region_len
        };
        self.pruned_total += removed;

        let placeholder = Message::text(
            MessageRole::System,
            format!(
                "[{} earlier messages removed to conserve context]",
                self.pruned_total
            ),
        );
        self.messages.splice(2..keep_from, [placeholder]);
        self.collapsed = true;
        removed
    }
}

#[derive(Debug, Deserialize)]
struct CompletionReport {
    complete: bool,
    #[serde(default)]
    summary: String,
}

pub struct Agent<B: ToolBackend, W: UiWriter> {
    provider: Arc<dyn ChatProvider>,
    session: SessionGovernor<B>,
    ui_writer: W,
    config: Config,
    retry_policy: RetryPolicy,
    usage: TokenUsage,
    tool_call_metrics: Vec<(String, Duration, bool)>,
}

impl<B: ToolBackend, W: UiWriter> Agent<B, W> {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        session: SessionGovernor<B>,
        config: Config,
        ui_writer: W,
    ) -> Self {
        let retry_policy = RetryPolicy {
            max_attempts: config.agent.max_retry_attempts,
            base_delay: Duration::from_millis(config.agent.retry_base_delay_ms),
        };
        Self {
            provider,
            session,
            ui_writer,
            config,
            retry_policy,
            usage: TokenUsage::default(),
            tool_call_metrics: Vec::new(),
        }
    }

    /// Cumulative token usage across every call made through this agent.
    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    pub fn tool_call_metrics(&self) -> &[(String, Duration, bool)] {
        &self.tool_call_metrics
    }

    pub fn session(&self) -> &SessionGovernor<B> {
        &self.session
    }

    pub fn stats(&self) -> String {
        let succeeded = self
            .tool_call_metrics
            .iter()
            .filter(|(_, _, ok)| *ok)
            .count();
        format!(
            "Tokens: {} prompt + {} completion = {} total | Tool calls: {} ({} succeeded)",
            self.usage.prompt_tokens,
            self.usage.completion_tokens,
            self.usage.total_tokens,
            self.tool_call_metrics.len(),
            succeeded
        )
    }

    pub async fn run_task(
        &mut self,
        task: &str,
        system_instructions: &str,
    ) -> Result<TaskResult, TaskError> {
        self.run_task_cancellable(task, system_instructions, CancellationToken::new())
            .await
    }

    /// Drive the task to completion. Cancellation is observed between loop
    /// iterations only; an in-flight model or tool call runs to completion.
    pub async fn run_task_cancellable(
        &mut self,
        task: &str,
        system_instructions: &str,
        cancellation_token: CancellationToken,
    ) -> Result<TaskResult, TaskError> {
        let system = format!("{}\n\n{}", system_instructions, prompts::DEFAULT_GUIDANCE);
        let mut conversation = Conversation::new(
            Message::text(MessageRole::System, system),
            Message::text(MessageRole::User, task),
        );

        let tools = self.load_tools().await?;
        let max_turns = self.config.agent.max_turns;
        let mut turn = 0;

        loop {
            turn += 1;
            if turn > max_turns {
                warn!("Turn budget of {} exceeded, aborting task", max_turns);
                return Err(TaskError::TurnBudgetExceeded(max_turns));
            }
            if cancellation_token.is_cancelled() {
                info!("Cancellation observed after {} turns", turn - 1);
                return Err(TaskError::Cancelled);
            }

            debug!("Turn {}/{}", turn, max_turns);

            // Fresh context, not accumulated history: the tab note is
            // rebuilt every turn and never appended to the conversation.
            let mut request_messages = conversation.messages().to_vec();
            if let Some(note) = self.tab_note().await {
                request_messages.push(Message::text(MessageRole::System, note));
            }

            let request = CompletionRequest {
                messages: request_messages,
                max_tokens: None,
                temperature: None,
                tools: Some(tools.clone()),
                tool_choice: None,
            };
            let response =
                complete_with_retry(self.provider.as_ref(), &request, &self.retry_policy).await?;
            if let Some(usage) = &response.usage {
                self.usage.accumulate(usage);
            }

            conversation.push(Message::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            if response.tool_calls.is_empty() {
                info!("Task completed after {} turns", turn);
                self.ui_writer.print_agent_response(&response.content);
                self.ui_writer.flush();
                return Ok(TaskResult {
                    response: response.content,
                    turns: turn,
                });
            }

            if !response.content.is_empty() {
                // Narration alongside tool calls never ends the loop
                self.ui_writer.print_agent_response(&response.content);
            }

            // Strictly sequential: a later call may depend on the DOM state
            // left by an earlier one in the same turn.
            for call in &response.tool_calls {
                self.execute_tool_call(call, &mut conversation).await;
            }

            let removed = conversation.prune(self.config.agent.history_window);
            if removed > 0 {
                debug!("Pruned {} messages from history", removed);
                self.ui_writer
                    .print_context_status(&format!("Condensed {} earlier messages", removed));
            }
        }
    }

    /// One tool call, resolved into exactly one tool message (plus one user
    /// message per captured image). Never propagates a failure: the loop must
    /// survive malformed arguments and dead transports alike.
    async fn execute_tool_call(&mut self, call: &ToolCall, conversation: &mut Conversation) {
        self.ui_writer.print_tool_header(&call.name);
        let start = Instant::now();

        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(value) => value,
            Err(e) => {
                warn!("Malformed arguments for tool {}: {}", call.name, e);
                conversation.push(Message::tool_result(
                    &call.id,
                    format!("Error: could not parse tool arguments: {}", e),
                ));
                self.tool_call_metrics
                    .push((call.name.clone(), start.elapsed(), false));
                return;
            }
        };

        match self.session.invoke(&call.name, &args).await {
            Ok(result) => {
                let succeeded = !result.is_error;
                self.append_tool_result(conversation, &call.id, result);
                self.tool_call_metrics
                    .push((call.name.clone(), start.elapsed(), succeeded));
            }
            Err(e) => {
                warn!("Tool {} failed at transport level: {}", call.name, e);
                conversation.push(Message::tool_result(
                    &call.id,
                    format!("Error: tool execution failed: {}", e),
                ));
                self.tool_call_metrics
                    .push((call.name.clone(), start.elapsed(), false));
            }
        }
    }

    /// Fold a tool result into the conversation. The tool-result channel is
    /// text-only, so each image block becomes a placeholder there and the raw
    /// image is injected as an immediately-following user message for the
    /// model to inspect next turn.
    fn append_tool_result(&self, conversation: &mut Conversation, call_id: &str, result: ToolResult) {
        let mut text_parts = Vec::new();
        let mut images = Vec::new();
        for block in result.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text),
                ContentBlock::Image { media_type, data } => {
                    text_parts.push(IMAGE_PLACEHOLDER.to_string());
                    images.push((media_type, data));
                }
            }
        }

        let mut text = text_parts.join("\n");
        if text.is_empty() {
            text = "(no output)".to_string();
        }
        if result.is_error {
            text = format!("Tool failed: {}", text);
        }
        if let Some(line) = text.lines().next() {
            self.ui_writer.print_tool_output_line(line);
        }

        conversation.push(Message::tool_result(call_id, text));
        for (media_type, data) in images {
            conversation.push(Message::user_image(media_type, data));
        }
    }

    async fn tab_note(&self) -> Option<String> {
        match self.session.tabs().await {
            Ok(tabs) if !tabs.is_empty() => {
                let mut note = String::from("Current browser tabs:\n");
                for tab in &tabs {
                    let marker = if tab.active { "(current) " } else { "" };
                    note.push_str(&format!(
                        "- {}: {}{} ({})\n",
                        tab.index, marker, tab.title, tab.url
                    ));
                }
                Some(note)
            }
            Ok(_) => None,
            Err(e) => {
                debug!("Could not fetch tab context: {}", e);
                None
            }
        }
    }

    async fn load_tools(&self) -> Result<Vec<Tool>, TaskError> {
        let schemas = self.session.list_tools().await?;
        Ok(schemas
            .into_iter()
            .map(|schema| Tool {
                name: schema.name,
                description: schema.description,
                input_schema: schema.input_schema,
            })
            .collect())
    }

    /// Single-shot completion verdict from a snapshot of the current page.
    /// Conservative on every failure path: a false negative only costs the
    /// caller another loop iteration, a false positive ends the task early.
    pub async fn check_if_complete(&mut self, task: &str) -> bool {
        match self.try_check_complete(task).await {
            Ok(complete) => complete,
            Err(e) => {
                warn!("Completion check failed, assuming not complete: {}", e);
                false
            }
        }
    }

    async fn try_check_complete(&mut self, task: &str) -> anyhow::Result<bool> {
        let snapshot = self.session.invoke(SNAPSHOT_TOOL, &json!({})).await?;
        if snapshot.is_error {
            anyhow::bail!("snapshot failed: {}", snapshot.text_content());
        }

        let messages = vec![
            Message::text(MessageRole::System, prompts::COMPLETION_CHECK_INSTRUCTIONS),
            Message::text(
                MessageRole::User,
                format!(
                    "Task: {}\n\nCurrent page state:\n{}",
                    task,
                    snapshot.text_content()
                ),
            ),
        ];
        let request = CompletionRequest {
            messages,
            max_tokens: None,
            temperature: None,
            tools: Some(vec![prompts::completion_report_tool()]),
            tool_choice: Some(ToolChoice::Tool(prompts::REPORT_COMPLETION_TOOL.to_string())),
        };
        let response =
            complete_with_retry(self.provider.as_ref(), &request, &self.retry_policy).await?;
        if let Some(usage) = &response.usage {
            self.usage.accumulate(usage);
        }

        let call = response
            .tool_calls
            .first()
            .ok_or_else(|| anyhow::anyhow!("model did not report a completion verdict"))?;
        let report: CompletionReport = serde_json::from_str(&call.arguments)?;
        info!(complete = report.complete, "Completion check: {}", report.summary);
        Ok(report.complete)
    }
}
