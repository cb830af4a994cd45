use std::io::{self, Write};
use webpilot_core::ui_writer::UiWriter;

/// Console implementation of UiWriter that prints to stdout
pub struct ConsoleUiWriter;

impl ConsoleUiWriter {
    pub fn new() -> Self {
        Self
    }
}

impl UiWriter for ConsoleUiWriter {
    fn println(&self, message: &str) {
        println!("{}", message);
    }

    fn print_agent_response(&self, content: &str) {
        println!("\x1b[1m●\x1b[0m {}", content);
    }

    fn print_tool_header(&self, tool_name: &str) {
        println!("\x1b[36m▸ {}\x1b[0m", tool_name);
    }

    fn print_tool_output_line(&self, line: &str) {
        println!("\x1b[2m  {}\x1b[0m", line);
    }

    fn print_context_status(&self, message: &str) {
        println!("\x1b[2m{}\x1b[0m", message);
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}
