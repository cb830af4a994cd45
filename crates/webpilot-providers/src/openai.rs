//! OpenAI-compatible provider implementation for the webpilot-providers crate.
//!
//! Speaks the Chat Completions API, so it also works against compatible
//! gateways (set `base_url`). Images are sent as `image_url` data URIs;
//! tool calls use the function-calling format.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::{
    ChatProvider, CompletionRequest, CompletionResponse, ContentPart, Message, MessageRole,
    ProviderError, TokenUsage, Tool, ToolCall, ToolChoice,
};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to create HTTP client: {}", e)))?;

        let base_url = base_url
            .unwrap_or_else(|| OPENAI_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        debug!(
            "Initialized OpenAI provider with model: {} at {}",
            model, base_url
        );

        Ok(Self {
            client,
            api_key,
            base_url,
            model,
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.1),
        })
    }

    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|message| match message.role {
                MessageRole::System => json!({
                    "role": "system",
                    "content": message.text_content(),
                }),
                MessageRole::User => {
                    let has_image = message
                        .content
                        .iter()
                        .any(|p| matches!(p, ContentPart::Image { .. }));
                    if has_image {
                        let parts: Vec<Value> = message
                            .content
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => {
                                    json!({ "type": "text", "text": text })
                                }
                                ContentPart::Image { media_type, data } => json!({
                                    "type": "image_url",
                                    "image_url": {
                                        "url": format!("data:{};base64,{}", media_type, data)
                                    }
                                }),
                            })
                            .collect();
                        json!({ "role": "user", "content": parts })
                    } else {
                        json!({ "role": "user", "content": message.text_content() })
                    }
                }
                MessageRole::Assistant => {
                    let mut obj = json!({
                        "role": "assistant",
                        "content": message.text_content(),
                    });
                    if message.has_tool_calls() {
                        let calls: Vec<Value> = message
                            .tool_calls
                            .iter()
                            .map(|call| {
                                json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments,
                                    }
                                })
                            })
                            .collect();
                        obj["tool_calls"] = Value::Array(calls);
                    }
                    obj
                }
                MessageRole::Tool => json!({
                    "role": "tool",
                    "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.text_content(),
                }),
            })
            .collect()
    }

    fn convert_tools(tools: &[Tool]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect()
    }

    fn convert_tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Tool(name) => json!({
                "type": "function",
                "function": { "name": name }
            }),
        }
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        debug!(
            "Processing OpenAI completion request with {} messages",
            request.messages.len()
        );

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "temperature": request.temperature.unwrap_or(self.temperature),
            "messages": Self::convert_messages(&request.messages),
        });
        if let Some(tools) = &request.tools {
            body["tools"] = Value::Array(Self::convert_tools(tools));
        }
        if let Some(choice) = &request.tool_choice {
            body["tool_choice"] = Self::convert_tool_choice(choice);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
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

        let openai_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let choice = openai_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("response had no choices".to_string()))?;

        let content = choice.message.content.unwrap_or_default();
        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect::<Vec<_>>();

        let usage = openai_response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        debug!(
            "OpenAI completion successful: {} tool calls",
            tool_calls.len()
        );

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage,
            model: openai_response.model,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize, Serialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
