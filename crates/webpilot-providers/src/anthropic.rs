//! Anthropic Claude provider implementation for the webpilot-providers crate.
//!
//! Implements the [`ChatProvider`] trait against the Anthropic Messages API,
//! with native tool calling, forced tool choice, and inline image content
//! blocks (the agent feeds screenshots back to the model as user messages).

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::{
    ChatProvider, CompletionRequest, CompletionResponse, ContentPart, Message, MessageRole,
    ProviderError, TokenUsage, Tool, ToolCall, ToolChoice,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn new(
        api_key: String,
        model: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to create HTTP client: {}", e)))?;

        let model = model.unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string());

        debug!("Initialized Anthropic provider with model: {}", model);

        Ok(Self {
            client,
            api_key,
            model,
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.1),
        })
    }

    fn create_request_builder(&self) -> RequestBuilder {
        self.client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
    }

    fn convert_tools(&self, tools: &[Tool]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect()
    }

    fn convert_content(parts: &[ContentPart]) -> Vec<AnthropicContent> {
        parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => AnthropicContent::Text { text: text.clone() },
                ContentPart::Image { media_type, data } => AnthropicContent::Image {
                    source: AnthropicImageSource {
                        source_type: "base64".to_string(),
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                },
            })
            .collect()
    }

    fn convert_messages(
        &self,
        messages: &[Message],
    ) -> Result<(Option<String>, Vec<AnthropicMessage>), ProviderError> {
        let mut system_message: Option<String> = None;
        let mut anthropic_messages = Vec::new();

        for message in messages {
            match message.role {
                MessageRole::System => {
                    // Concatenate system messages instead of replacing
                    let text = message.text_content();
                    system_message = Some(match system_message {
                        Some(existing) => format!("{}\n\n{}", existing, text),
                        None => text,
                    });
                }
                MessageRole::User => {
                    anthropic_messages.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: Self::convert_content(&message.content),
                    });
                }
                MessageRole::Assistant => {
                    let mut content = Self::convert_content(&message.content);
                    for call in &message.tool_calls {
                        // The wire format wants the parsed argument object; a
                        // payload that never parsed cannot have reached the
                        // conversation, but fall back to an empty object
                        // rather than failing the whole request.
                        let input = serde_json::from_str(&call.arguments)
                            .unwrap_or_else(|_| serde_json::json!({}));
                        content.push(AnthropicContent::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input,
                        });
                    }
                    anthropic_messages.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content,
                    });
                }
                MessageRole::Tool => {
                    let id = message.tool_call_id.clone().ok_or_else(|| {
                        ProviderError::InvalidResponse(
                            "tool message without a tool_call_id".to_string(),
                        )
                    })?;
                    anthropic_messages.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: vec![AnthropicContent::ToolResult {
                            tool_use_id: id,
                            content: message.text_content(),
                        }],
                    });
                }
            }
        }

        Ok((system_message, anthropic_messages))
    }

    fn convert_tool_choice(choice: &ToolChoice) -> serde_json::Value {
        match choice {
            ToolChoice::Auto => serde_json::json!({ "type": "auto" }),
            ToolChoice::Tool(name) => serde_json::json!({ "type": "tool", "name": name }),
        }
    }
}

#[async_trait::async_trait]
impl ChatProvider for AnthropicProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        debug!(
            "Processing Anthropic completion request with {} messages",
            request.messages.len()
        );

        let (system, messages) = self.convert_messages(&request.messages)?;

        let request_body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature.unwrap_or(self.temperature),
            system,
            messages,
            tools: request.tools.as_deref().map(|t| self.convert_tools(t)),
            tool_choice: request.tool_choice.as_ref().map(Self::convert_tool_choice),
        };

        debug!(
            "Sending request to Anthropic API: model={}, max_tokens={}, temperature={}",
            request_body.model, request_body.max_tokens, request_body.temperature
        );

        let response = self
            .create_request_builder()
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::from_status(status.as_u16(), error_text));
        }

        let anthropic_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in &anthropic_response.content {
            match block {
                AnthropicContent::Text { text } => content.push_str(text),
                AnthropicContent::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.to_string(),
                    });
                }
                _ => {}
            }
        }

        let usage = TokenUsage {
            prompt_tokens: anthropic_response.usage.input_tokens,
            completion_tokens: anthropic_response.usage.output_tokens,
            total_tokens: anthropic_response.usage.input_tokens
                + anthropic_response.usage.output_tokens,
        };

        debug!(
            "Anthropic completion successful: {} tokens generated, {} tool calls",
            usage.completion_tokens,
            tool_calls.len()
        );

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage: Some(usage),
            model: anthropic_response.model,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// Anthropic API request/response structures

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    model: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
