// SPDX-License-Identifier: MIT OR Apache-2.0
//! The LLM provider contract (§4.9): `{promptText, modeLabel, model} → {rawText,
//! mementoDraft}` plus the typed error taxonomy providers map onto.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// One provider invocation's input.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt_text: String,
    pub mode_label: String,
    pub model: String,
}

/// One provider invocation's output.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub raw_text: String,
    pub memento_draft: Option<Value>,
}

/// Typed provider failures (§7 "Provider" category).
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("OPENAI_API_KEY is not configured")]
    OpenaiApiKeyMissing,
    #[error("OPENAI_MODEL is not configured")]
    OpenaiModelMissing,
    #[error("provider rejected the request as invalid")]
    InvalidRequest,
    #[error("provider upstream call failed")]
    UpstreamFailed,
    #[error("provider call failed")]
    Failed,
    #[error("provider call timed out")]
    Timeout { retry_after_ms: Option<u64> },
}

impl ProviderError {
    /// Whether a second model attempt is worth making for this failure.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::UpstreamFailed | Self::Failed | Self::Timeout { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::OpenaiApiKeyMissing => "openai_api_key_missing",
            Self::OpenaiModelMissing => "openai_model_missing",
            Self::InvalidRequest => "provider_invalid_request",
            Self::UpstreamFailed => "provider_upstream_failed",
            Self::Failed => "provider_failed",
            Self::Timeout { .. } => "PROVIDER_TIMEOUT",
        }
    }
}

/// An LLM provider adapter. Network transport is out of scope (§1); this
/// trait exists so the orchestrator's retry/timeout handling is testable
/// against a deterministic implementation.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Stable provider name used in `run_started` SSE and retry gating (only
    /// `"openai"` is eligible for the output-contract retry, §4.9 step 6).
    fn name(&self) -> &'static str;
}

/// Deterministic provider used in tests and when `LLM_PROVIDER=fake`. Echoes
/// a well-formed envelope derived from the prompt text, with an optional
/// failure-injection mode for exercising the error taxonomy.
#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    pub inject_failure: Option<FakeFailure>,
}

/// Failure modes a test can force on the next [`FakeProvider::generate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    InvalidRequest,
    UpstreamFailed,
    Failed,
    Timeout,
    MalformedJson,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure(failure: FakeFailure) -> Self {
        Self { inject_failure: Some(failure) }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.inject_failure {
            Some(FakeFailure::InvalidRequest) => return Err(ProviderError::InvalidRequest),
            Some(FakeFailure::UpstreamFailed) => return Err(ProviderError::UpstreamFailed),
            Some(FakeFailure::Failed) => return Err(ProviderError::Failed),
            Some(FakeFailure::Timeout) => {
                return Err(ProviderError::Timeout { retry_after_ms: Some(500) })
            }
            Some(FakeFailure::MalformedJson) => {
                return Ok(ProviderResponse { raw_text: "not json".to_string(), memento_draft: None })
            }
            None => {}
        }

        let assistant_text = format!(
            "[{}] acknowledging: {}",
            request.mode_label,
            request.prompt_text.chars().take(120).collect::<String>()
        );
        let raw_text = serde_json::json!({ "assistant_text": assistant_text }).to_string();
        Ok(ProviderResponse { raw_text, memento_draft: None })
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Stub adapter for the `openai` provider. Actual network I/O is out of
/// scope (§1); this type performs the contract's credential validation and
/// error mapping so the orchestrator's retry/timeout logic is exercised the
/// same way regardless of which provider is configured.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    api_key: Option<String>,
    model: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, model: Option<String>) -> Self {
        Self { api_key, model }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn generate(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        if self.api_key.as_deref().unwrap_or_default().is_empty() {
            return Err(ProviderError::OpenaiApiKeyMissing);
        }
        if self.model.as_deref().unwrap_or_default().is_empty() {
            return Err(ProviderError::OpenaiModelMissing);
        }
        // Network transport is out of scope (§1): no live call is made.
        Err(ProviderError::UpstreamFailed)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> ProviderRequest {
        ProviderRequest {
            prompt_text: "hello there".to_string(),
            mode_label: "Chat-mode".to_string(),
            model: "fake-model".to_string(),
        }
    }

    #[tokio::test]
    async fn fake_provider_echoes_prompt() {
        let provider = FakeProvider::new();
        let response = provider.generate(req()).await.unwrap();
        assert!(response.raw_text.contains("hello there"));
    }

    #[tokio::test]
    async fn fake_provider_injects_timeout() {
        let provider = FakeProvider::with_failure(FakeFailure::Timeout);
        let err = provider.generate(req()).await.unwrap_err();
        assert!(err.retryable());
        assert_eq!(err.code(), "PROVIDER_TIMEOUT");
    }

    #[tokio::test]
    async fn openai_provider_requires_api_key() {
        let provider = OpenAiProvider::new(None, Some("gpt".to_string()));
        let err = provider.generate(req()).await.unwrap_err();
        assert_eq!(err.code(), "openai_api_key_missing");
    }

    #[tokio::test]
    async fn openai_provider_requires_model() {
        let provider = OpenAiProvider::new(Some("sk-x".to_string()), None);
        let err = provider.generate(req()).await.unwrap_err();
        assert_eq!(err.code(), "openai_model_missing");
    }
}
