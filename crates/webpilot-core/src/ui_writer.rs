/// Interface for UI output operations.
/// Abstracts operator-facing narration so the loop is not coupled to a
/// specific output device (console, machine-readable log, none).
pub trait UiWriter: Send + Sync {
    /// Print a message with a newline
    fn println(&self, message: &str);

    /// Print the model's narration for the current turn
    fn print_agent_response(&self, content: &str);

    /// Print a tool execution header
    fn print_tool_header(&self, tool_name: &str);

    /// Print a tool output line
    fn print_tool_output_line(&self, line: &str);

    /// Print a context-management status message
    fn print_context_status(&self, message: &str);

    /// Flush any buffered output
    fn flush(&self);
}

/// A no-op implementation for when UI output is not needed
pub struct NullUiWriter;

impl UiWriter for NullUiWriter {
    fn println(&self, _message: &str) {}
    fn print_agent_response(&self, _content: &str) {}
    fn print_tool_header(&self, _tool_name: &str) {}
    fn print_tool_output_line(&self, _line: &str) {}
    fn print_context_status(&self, _message: &str) {}
    fn flush(&self) {}
}
