//! Browser tool execution for the webpilot agent.
//!
//! Two layers: [`gateway::BrowserGateway`] talks to a browser automation
//! server (an MCP stdio child process) and knows nothing about policy;
//! [`session::SessionGovernor`] wraps any [`ToolBackend`] and enforces tab
//! hygiene — page ceilings, idle-tab closure, forced session restarts —
//! independent of what the model asks for.

pub mod gateway;
pub mod session;

pub use gateway::{BrowserGateway, GatewayConfig};
pub use session::{SessionGovernor, SessionLimits, TabRecord};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Tool names in the browser automation vocabulary the governor must
/// recognise. Everything else passes through untouched.
pub const NAVIGATE_TOOL: &str = "browser_navigate";
pub const TAB_LIST_TOOL: &str = "browser_tab_list";
pub const TAB_NEW_TOOL: &str = "browser_tab_new";
pub const TAB_CLOSE_TOOL: &str = "browser_tab_close";
pub const SNAPSHOT_TOOL: &str = "browser_snapshot";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContentBlock {
    Text { text: String },
    Image { media_type: String, data: String },
}

/// Structured output of one tool execution. Tool-level failures (bad
/// selector, navigation timeout) are ordinary results with `is_error` set,
/// so the model can read the explanation and adapt; only transport-level
/// failures become a [`GatewayError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Concatenated text blocks, ignoring images.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("browser endpoint not connected")]
    NotConnected,
    #[error("browser endpoint closed: {0}")]
    Closed(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transport seam between the governor and the remote tool endpoint.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn connect(&self) -> Result<(), GatewayError>;

    async fn list_tools(&self) -> Result<Vec<ToolSchema>, GatewayError>;

    /// Execute a named tool. Errs only on transport failure; a failed tool
    /// run comes back as `Ok(ToolResult { is_error: true, .. })`.
    async fn invoke(&self, name: &str, args: &Value) -> Result<ToolResult, GatewayError>;

    async fn close(&self) -> Result<(), GatewayError>;

    /// Tear down and re-establish the underlying session.
    async fn restart(&self) -> Result<(), GatewayError>;
}
