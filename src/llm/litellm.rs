//! OpenAI-compatible chat-completions client.
//!
//! Used for both the agent policy and the answer grader. Any endpoint that
//! speaks `/chat/completions` works: a LiteLLM proxy, OpenRouter, vLLM.

use std::env;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A chat-completions call. An empty `model` means the client's default.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            stop: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop(mut self, stop: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }
}

/// Token accounting reported by the endpoint (zero when it reports none).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// The first choice of a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub model: String,
    /// `None` when the endpoint returned null content.
    pub text: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

impl GenerationResponse {
    /// Builds a completed response, for scripted providers.
    pub fn from_text(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            text: Some(text.into()),
            finish_reason: Some("stop".to_string()),
            usage: Usage::default(),
        }
    }

    /// The generated text, unless it is missing or blank.
    pub fn content(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Generation hit the token limit.
    pub fn is_truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Client for OpenAI-compatible APIs.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http: Client,
}

impl std::fmt::Debug for LiteLlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiteLlmClient")
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

impl LiteLlmClient {
    /// `api_base` is the URL prefix that `/chat/completions` is appended to,
    /// for example `http://localhost:4000/v1`.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("building HTTP client: {}", e)))?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            http,
        })
    }

    /// # Errors
    ///
    /// Returns `LlmError::MissingApiKey` if `key_env` is not set.
    pub fn from_key_env(
        api_base: impl Into<String>,
        key_env: &str,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let api_key = env::var(key_env).map_err(|_| LlmError::MissingApiKey(key_env.to_string()))?;
        Self::new(api_base, Some(api_key), default_model, timeout)
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    /// Null for some reasoning models that only return tool calls.
    #[serde(default)]
    content: Option<String>,
}

impl CompletionBody {
    fn into_response(self) -> Result<GenerationResponse, LlmError> {
        let choice = self.choices.into_iter().next().ok_or(LlmError::EmptyResponse)?;
        Ok(GenerationResponse {
            model: self.model,
            text: choice.message.content,
            finish_reason: choice.finish_reason,
            usage: self.usage.unwrap_or_default(),
        })
    }
}

/// Pulls `error.message` out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, mut request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        if request.model.is_empty() {
            request.model = self.default_model.clone();
        }

        let mut http_request = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .json(&request);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited(error_message(&body)));
        }
        if !status.is_success() {
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message: error_message(&body),
            });
        }

        let parsed: CompletionBody = serde_json::from_str(&body)
            .map_err(|e| LlmError::ParseError(format!("completion body: {}", e)))?;
        let response = parsed.into_response()?;
        debug!(
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            finish_reason = ?response.finish_reason,
            "Completion received"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roles_serialize_lowercase() {
        let json = serde_json::to_value(Message::system("s")).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role.as_str(), "assistant");
    }

    #[test]
    fn test_request_omits_unset_fields() {
        let request = GenerationRequest::new("m", vec![Message::user("hi")]).with_temperature(0.7);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"temperature\":0.7"));
        assert!(!json.contains("max_tokens"));
        assert!(!json.contains("stop"));

        let json = serde_json::to_string(&request.with_stop(["</answer>"])).unwrap();
        assert!(json.contains("\"stop\":[\"</answer>\"]"));
    }

    #[test]
    fn test_completion_body_takes_first_choice() {
        let body = r#"{"model":"m","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"length"},{"message":{"content":"other"}}],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#;
        let response = serde_json::from_str::<CompletionBody>(body)
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(response.content(), Some("hi"));
        assert!(response.is_truncated());
        assert_eq!(response.usage.total(), 5);
    }

    #[test]
    fn test_null_or_blank_content_is_none() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        let response = serde_json::from_str::<CompletionBody>(body)
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(response.content(), None);
        assert_eq!(response.usage, Usage::default());

        assert_eq!(GenerationResponse::from_text("m", "  \n").content(), None);
    }

    #[test]
    fn test_no_choices_is_empty_response() {
        let body: CompletionBody = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(body.into_response(), Err(LlmError::EmptyResponse)));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(error_message("upstream down\n"), "upstream down");
    }

    #[test]
    fn test_client_trims_base() {
        let client = LiteLlmClient::new(
            "http://localhost:4000/v1/",
            Some("test-key".to_string()),
            "gpt-4o-mini",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.api_base(), "http://localhost:4000/v1");
        assert_eq!(client.default_model(), "gpt-4o-mini");
        assert!(client.has_api_key());
    }

    #[test]
    fn test_from_key_env_missing() {
        let result = LiteLlmClient::from_key_env(
            "http://localhost:4000",
            "TRACEFORGE_TEST_KEY_THAT_IS_NEVER_SET",
            "gpt-4o-mini",
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(LlmError::MissingApiKey(_))));
    }

    #[tokio::test]
    async fn test_generate_connection_error() {
        let client =
            LiteLlmClient::new("http://127.0.0.1:9", None, "m", Duration::from_secs(5)).unwrap();
        let err = client
            .generate(GenerationRequest::new("", vec![Message::user("test")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed(_)));
    }
}
