use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use webpilot_providers::{
    complete_with_retry, ChatProvider, CompletionRequest, CompletionResponse, Message,
    MessageRole, ProviderError, ProviderRegistry, RetryPolicy, TokenUsage,
};

/// Provider that fails a scripted number of times before succeeding.
struct FlakyProvider {
    calls: AtomicU32,
    failures_before_success: u32,
    error_factory: fn() -> ProviderError,
}

impl FlakyProvider {
    fn new(failures_before_success: u32, error_factory: fn() -> ProviderError) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures_before_success,
            error_factory,
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for FlakyProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            Err((self.error_factory)())
        } else {
            Ok(CompletionResponse {
                content: "ok".to_string(),
                tool_calls: Vec::new(),
                usage: Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                model: "mock".to_string(),
            })
        }
    }

    fn name(&self) -> &str {
        "flaky"
    }

    fn model(&self) -> &str {
        "mock"
    }
}

fn request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message::text(MessageRole::User, "hello")],
        max_tokens: None,
        temperature: None,
        tools: None,
        tool_choice: None,
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn test_retryable_errors_are_retried_until_success() {
    let provider = FlakyProvider::new(2, || ProviderError::RateLimited("slow down".to_string()));
    let response = complete_with_retry(&provider, &request(), &fast_policy())
        .await
        .unwrap();
    assert_eq!(response.content, "ok");
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn test_fatal_errors_surface_immediately() {
    let provider = FlakyProvider::new(u32::MAX, || {
        ProviderError::from_status(401, "bad key".to_string())
    });
    let err = complete_with_retry(&provider, &request(), &fast_policy())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 401, .. }));
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn test_attempt_cap_is_enforced() {
    let provider = FlakyProvider::new(u32::MAX, || ProviderError::Server {
        status: 503,
        message: "unavailable".to_string(),
    });
    let err = complete_with_retry(&provider, &request(), &fast_policy())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(provider.call_count(), 5);
}

#[test]
fn test_error_classification_by_status() {
    assert!(ProviderError::from_status(429, String::new()).is_retryable());
    assert!(ProviderError::from_status(500, String::new()).is_retryable());
    assert!(ProviderError::from_status(529, String::new()).is_retryable());
    assert!(!ProviderError::from_status(400, String::new()).is_retryable());
    assert!(!ProviderError::from_status(404, String::new()).is_retryable());
    assert!(ProviderError::Network("reset".to_string()).is_retryable());
}

#[test]
fn test_backoff_doubles_per_attempt() {
    let policy = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_secs(1),
    };
    assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
}

#[tokio::test]
async fn test_registry_default_and_lookup() {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(FlakyProvider::new(0, || {
        ProviderError::Network("unused".to_string())
    })));

    // First registration becomes the default
    let provider = registry.get(None).unwrap();
    assert_eq!(provider.name(), "flaky");

    assert!(registry.get(Some("missing")).is_err());
    assert!(registry.set_default("missing").is_err());
    registry.set_default("flaky").unwrap();
}

#[test]
fn test_message_text_content_skips_images() {
    let mut message = Message::text(MessageRole::User, "before");
    message.content.push(webpilot_providers::ContentPart::Image {
        media_type: "image/png".to_string(),
        data: "aGVsbG8=".to_string(),
    });
    message.content.push(webpilot_providers::ContentPart::Text {
        text: " after".to_string(),
    });
    assert_eq!(message.text_content(), "before after");
}

#[test]
fn test_usage_accumulation_is_monotonic() {
    let mut total = TokenUsage::default();
    for _ in 0..3 {
        total.accumulate(&TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        });
    }
    assert_eq!(total.prompt_tokens, 300);
    assert_eq!(total.completion_tokens, 60);
    assert_eq!(total.total_tokens, 360);
}
