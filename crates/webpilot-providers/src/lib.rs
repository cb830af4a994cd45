//! Chat-completion provider abstraction for the webpilot agent.
//!
//! A provider takes a full conversation plus the available tool schemas and
//! returns the model's next message: free text (terminal for the loop) and/or
//! tool calls (continuation). Transient failures are retried with exponential
//! backoff via [`complete_with_retry`]; everything else surfaces as a typed
//! [`ProviderError`] the caller can match on.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One piece of message content. Tool results and user messages may carry
/// inline images alongside text; everything else is plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContentPart {
    Text { text: String },
    Image { media_type: String, data: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
    /// Tool calls requested by an assistant message. Empty otherwise.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// For `Tool` messages: the id of the call this message resolves.
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::Text { text }]
        };
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: vec![ContentPart::Text { text: text.into() }],
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// A user message carrying a single inline image.
    pub fn user_image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentPart::Image {
                media_type: media_type.into(),
                data: data.into(),
            }],
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Concatenated text parts, ignoring images.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool invocation requested by the model. `arguments` is the raw JSON
/// string exactly as emitted; parsing it is the loop controller's job so a
/// malformed payload can be reported back to the model instead of failing
/// the completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    /// Force the model to call the named tool.
    Tool(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Option<Vec<Tool>>,
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Concatenated text content of the assistant message.
    pub content: String,
    /// Tool calls requested this turn, in the order the model emitted them.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Classify an HTTP error status. 429 and 5xx are transient; any other
    /// 4xx is the caller's fault and retrying will not help.
    pub fn from_status(status: u16, message: String) -> Self {
        if status == 429 {
            ProviderError::RateLimited(message)
        } else if (500..600).contains(&status) {
            ProviderError::Server { status, message }
        } else {
            ProviderError::Api { status, message }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Server { .. }
                | ProviderError::Network(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Network(err.to_string())
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    fn name(&self) -> &str;

    fn model(&self) -> &str;
}

/// Registry of configured providers, keyed by name, with a default selection.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        let name = provider.name().to_string();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), ProviderError> {
        if !self.providers.contains_key(name) {
            return Err(ProviderError::InvalidResponse(format!(
                "provider '{}' is not registered",
                name
            )));
        }
        self.default_provider = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn ChatProvider>, ProviderError> {
        let name = name
            .map(|n| n.to_string())
            .or_else(|| self.default_provider.clone())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("no default provider configured".to_string())
            })?;
        self.providers.get(&name).cloned().ok_or_else(|| {
            ProviderError::InvalidResponse(format!("provider '{}' is not registered", name))
        })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following the given 1-based attempt: the base
    /// delay doubled for each attempt already made.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Call `complete`, retrying transient failures with exponential backoff.
/// Non-retryable errors surface immediately.
pub async fn complete_with_retry(
    provider: &dyn ChatProvider,
    request: &CompletionRequest,
    policy: &RetryPolicy,
) -> Result<CompletionResponse, ProviderError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provider.complete(request.clone()).await {
            Ok(response) => {
                if attempt > 1 {
                    info!("Completion succeeded after {} attempts", attempt);
                }
                return Ok(response);
            }
            Err(e) if attempt < policy.max_attempts && e.is_retryable() => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "Recoverable error on attempt {}/{}: {}. Retrying in {:?}...",
                    attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
