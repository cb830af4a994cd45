use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use webpilot_browser::{
    ContentBlock, GatewayError, SessionGovernor, SessionLimits, ToolBackend, ToolResult,
    ToolSchema, SNAPSHOT_TOOL, TAB_LIST_TOOL,
};
use webpilot_config::Config;
use webpilot_core::{Agent, NullUiWriter, TaskError};
use webpilot_providers::{
    ChatProvider, CompletionRequest, CompletionResponse, ContentPart, MessageRole, ProviderError,
    TokenUsage, ToolCall,
};

/// Provider that replays scripted responses and records every request it saw.
struct ScriptedProvider {
    responses: Mutex<VecDeque<CompletionResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
    /// When the script runs dry, keep emitting a click tool call.
    repeat_tool_calls: bool,
}

impl ScriptedProvider {
    fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            repeat_tool_calls: false,
        }
    }

    fn always_calling_tools() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            repeat_tool_calls: true,
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> CompletionRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(response) = self.responses.lock().unwrap().pop_front() {
            return Ok(response);
        }
        if self.repeat_tool_calls {
            return Ok(tool_call_response("call-again", "browser_click", r#"{"selector":"a"}"#));
        }
        Err(ProviderError::InvalidResponse(
            "script exhausted".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "mock"
    }
}

/// Backend that replays scripted tool results; tab listings always come back
/// empty so the loop's ephemeral tab note stays out of the way.
#[derive(Default)]
struct ScriptedBackend {
    invokes: Mutex<Vec<(String, Value)>>,
    results: Mutex<VecDeque<Result<ToolResult, GatewayError>>>,
}

impl ScriptedBackend {
    fn with_results(results: Vec<Result<ToolResult, GatewayError>>) -> Self {
        Self {
            invokes: Mutex::new(Vec::new()),
            results: Mutex::new(results.into()),
        }
    }

    fn invoked_tools(&self) -> Vec<String> {
        self.invokes
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| name != TAB_LIST_TOOL)
            .collect()
    }
}

#[async_trait]
impl ToolBackend for ScriptedBackend {
    async fn connect(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSchema>, GatewayError> {
        Ok(vec![ToolSchema {
            name: "browser_click".to_string(),
            description: "Click an element".to_string(),
            input_schema: json!({"type": "object"}),
        }])
    }

    async fn invoke(&self, name: &str, args: &Value) -> Result<ToolResult, GatewayError> {
        self.invokes
            .lock()
            .unwrap()
            .push((name.to_string(), args.clone()));
        if name == TAB_LIST_TOOL {
            return Ok(ToolResult::text(""));
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ToolResult::text("ok")))
    }

    async fn close(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn restart(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

fn tool_call_response(id: &str, name: &str, arguments: &str) -> CompletionResponse {
    CompletionResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }],
        usage: Some(TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 10,
            total_tokens: 110,
        }),
        model: "mock".to_string(),
    }
}

fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        content: text.to_string(),
        tool_calls: Vec::new(),
        usage: Some(TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 10,
            total_tokens: 110,
        }),
        model: "mock".to_string(),
    }
}

#[tokio::test]
async fn test_click_then_done_scenario() {
    let provider = std::sync::Arc::new(ScriptedProvider::new(vec![
        tool_call_response("call-1", "browser_click", r#"{"selector":"text=Surveys"}"#),
        text_response("Done clicking Surveys"),
    ]));
    let backend = ScriptedBackend::with_results(vec![Ok(ToolResult::text("Clicked"))]);

    let mut config = Config::default();
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    let result = agent.run_task("click Surveys", "You drive a browser.").await.unwrap();

    assert_eq!(result.response, "Done clicking Surveys");
    assert_eq!(result.turns, 2);
    assert_eq!(provider.request_count(), 2);

    // The second request carries the permanent history so far: system, task,
    // assistant tool call, tool result — the final assistant text makes five.
    let second = provider.request(1);
    assert_eq!(second.messages.len(), 4);
    assert_eq!(second.messages[0].role, MessageRole::System);
    assert_eq!(second.messages[1].role, MessageRole::User);
    assert_eq!(second.messages[1].text_content(), "click Surveys");
    assert_eq!(second.messages[2].role, MessageRole::Assistant);
    assert_eq!(second.messages[2].tool_calls[0].name, "browser_click");
    assert_eq!(second.messages[3].role, MessageRole::Tool);
    assert_eq!(second.messages[3].text_content(), "Clicked");

    // The governor forwarded exactly the one click
    assert_eq!(
        agent.session().backend().invoked_tools(),
        vec!["browser_click".to_string()]
    );

    // Usage accumulated across both turns
    assert_eq!(agent.usage().total_tokens, 220);
}

#[tokio::test]
async fn test_turn_budget_exhaustion_is_fatal() {
    let provider = std::sync::Arc::new(ScriptedProvider::always_calling_tools());
    let backend = ScriptedBackend::default();

    let mut config = Config::default();
    config.agent.max_turns = 3;
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    let err = agent.run_task("never finishes", "sys").await.unwrap_err();
    assert!(matches!(err, TaskError::TurnBudgetExceeded(3)));
    // Three model turns happened, the fourth iteration tripped the budget
    assert_eq!(provider.request_count(), 3);
}

#[tokio::test]
async fn test_image_result_is_split_into_placeholder_and_user_message() {
    let provider = std::sync::Arc::new(ScriptedProvider::new(vec![
        tool_call_response("call-1", "browser_take_screenshot", "{}"),
        text_response("done"),
    ]));
    let backend = ScriptedBackend::with_results(vec![Ok(ToolResult {
        content: vec![
            ContentBlock::Text {
                text: "Captured the page".to_string(),
            },
            ContentBlock::Image {
                media_type: "image/png".to_string(),
                data: "aGVsbG8=".to_string(),
            },
        ],
        is_error: false,
    })]);

    let mut config = Config::default();
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    agent.run_task("screenshot the page", "sys").await.unwrap();

    let second = provider.request(1);
    // system, task, assistant, tool placeholder, injected image message
    assert_eq!(second.messages.len(), 5);

    let tool_message = &second.messages[3];
    assert_eq!(tool_message.role, MessageRole::Tool);
    assert!(tool_message.text_content().contains("attached image"));
    assert!(tool_message
        .content
        .iter()
        .all(|part| matches!(part, ContentPart::Text { .. })));

    let image_message = &second.messages[4];
    assert_eq!(image_message.role, MessageRole::User);
    assert!(matches!(
        image_message.content[0],
        ContentPart::Image { ref media_type, .. } if media_type == "image/png"
    ));
}

#[tokio::test]
async fn test_malformed_arguments_recover_without_aborting_the_turn() {
    let first_turn = CompletionResponse {
        content: String::new(),
        tool_calls: vec![
            ToolCall {
                id: "bad".to_string(),
                name: "browser_click".to_string(),
                arguments: "{not json".to_string(),
            },
            ToolCall {
                id: "good".to_string(),
                name: "browser_click".to_string(),
                arguments: r##"{"selector":"#next"}"##.to_string(),
            },
        ],
        usage: None,
        model: "mock".to_string(),
    };
    let provider = std::sync::Arc::new(ScriptedProvider::new(vec![
        first_turn,
        text_response("done"),
    ]));
    let backend = ScriptedBackend::with_results(vec![Ok(ToolResult::text("clicked next"))]);

    let mut config = Config::default();
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    agent.run_task("click things", "sys").await.unwrap();

    // Only the well-formed call reached the backend
    assert_eq!(
        agent.session().backend().invoked_tools(),
        vec!["browser_click".to_string()]
    );

    // Both calls were resolved, in order: an error result then a real one
    let second = provider.request(1);
    assert_eq!(second.messages.len(), 5);
    let bad_result = &second.messages[3];
    assert_eq!(bad_result.role, MessageRole::Tool);
    assert_eq!(bad_result.tool_call_id.as_deref(), Some("bad"));
    assert!(bad_result.text_content().contains("could not parse"));
    let good_result = &second.messages[4];
    assert_eq!(good_result.tool_call_id.as_deref(), Some("good"));
    assert_eq!(good_result.text_content(), "clicked next");
}

#[tokio::test]
async fn test_transport_failure_becomes_error_result_and_loop_survives() {
    let provider = std::sync::Arc::new(ScriptedProvider::new(vec![
        tool_call_response("call-1", "browser_click", "{}"),
        text_response("recovered"),
    ]));
    let backend = ScriptedBackend::with_results(vec![Err(GatewayError::Closed(
        "pipe broke".to_string(),
    ))]);

    let mut config = Config::default();
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    let result = agent.run_task("click", "sys").await.unwrap();
    assert_eq!(result.response, "recovered");

    let second = provider.request(1);
    let tool_message = &second.messages[3];
    assert!(tool_message.text_content().contains("tool execution failed"));
}

#[tokio::test]
async fn test_pruning_preserves_seed_messages_and_collapses_middle() {
    let mut responses = Vec::new();
    for i in 0..4 {
        responses.push(tool_call_response(
            &format!("call-{}", i),
            "browser_click",
            "{}",
        ));
    }
    responses.push(text_response("done"));
    let provider = std::sync::Arc::new(ScriptedProvider::new(responses));
    let backend = ScriptedBackend::default();

    let mut config = Config::default();
    config.agent.history_window = 2;
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    agent.run_task("long task", "system instructions").await.unwrap();
    assert_eq!(provider.request_count(), 5);

    let last = provider.request(4);
    // First two permanent messages are untouched by pruning
    assert_eq!(last.messages[0].role, MessageRole::System);
    assert!(last.messages[0].text_content().contains("system instructions"));
    assert_eq!(last.messages[1].text_content(), "long task");

    // The collapsed middle is a single placeholder with a cumulative count
    assert_eq!(last.messages[2].role, MessageRole::System);
    assert!(last.messages[2]
        .text_content()
        .contains("4 earlier messages removed"));

    // seed (2) + placeholder + two retained turns of (assistant, tool) = 7
    assert_eq!(last.messages.len(), 7);

    // Stabilised: the previous request was the same length
    assert_eq!(provider.request(3).messages.len(), 7);
}

#[tokio::test]
async fn test_check_if_complete_false_when_snapshot_fails() {
    let provider = std::sync::Arc::new(ScriptedProvider::new(vec![]));
    let backend = ScriptedBackend::with_results(vec![Err(GatewayError::Closed(
        "browser gone".to_string(),
    ))]);

    let mut config = Config::default();
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    assert!(!agent.check_if_complete("finish the survey").await);
    // The model was never consulted
    assert_eq!(provider.request_count(), 0);
}

#[tokio::test]
async fn test_check_if_complete_uses_forced_tool_choice() {
    let verdict = CompletionResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: "verdict-1".to_string(),
            name: "report_completion".to_string(),
            arguments: r#"{"complete":true,"summary":"Thank-you page is shown"}"#.to_string(),
        }],
        usage: None,
        model: "mock".to_string(),
    };
    let provider = std::sync::Arc::new(ScriptedProvider::new(vec![verdict]));
    let backend =
        ScriptedBackend::with_results(vec![Ok(ToolResult::text("heading: Thank you"))]);

    let mut config = Config::default();
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    assert!(agent.check_if_complete("finish the survey").await);

    let request = provider.request(0);
    assert!(matches!(
        request.tool_choice,
        Some(webpilot_providers::ToolChoice::Tool(ref name)) if name == "report_completion"
    ));
    // The snapshot was taken through the governed session
    assert_eq!(
        agent.session().backend().invoked_tools(),
        vec![SNAPSHOT_TOOL.to_string()]
    );
}

#[tokio::test]
async fn test_model_failure_during_check_returns_false() {
    // Script is empty, so the provider errors after a successful snapshot
    let provider = std::sync::Arc::new(ScriptedProvider::new(vec![]));
    let backend = ScriptedBackend::with_results(vec![Ok(ToolResult::text("page state"))]);

    let mut config = Config::default();
    config.agent.retry_base_delay_ms = 1;
    let session = SessionGovernor::new(backend, SessionLimits::default(), Vec::new());
    let mut agent = Agent::new(provider.clone(), session, config, NullUiWriter);

    assert!(!agent.check_if_complete("finish").await);
}
