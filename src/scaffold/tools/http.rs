//! Remote tool backed by a JSON-over-HTTP endpoint.
//!
//! Each configured tool (search, browse, rerank, ...) is served by a small
//! HTTP service that accepts the agent's arguments as the request body and
//! answers with JSON.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::{Tool, ToolError};

/// Longest error body kept in a tool error message.
const MAX_ERROR_BODY: usize = 512;

pub struct HttpTool {
    name: String,
    description: String,
    endpoint: String,
    schema: Value,
    api_key: Option<String>,
    timeout: Duration,
    client: Client,
}

impl HttpTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        endpoint: impl Into<String>,
        schema: Value,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            endpoint: endpoint.into(),
            schema,
            api_key: None,
            timeout,
            client: Client::new(),
        }
    }

    /// Sends `Authorization: Bearer <key>` with every call.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        if !args.is_object() {
            return Err(ToolError::InvalidArguments(format!(
                "expected a JSON object, got {}",
                args
            )));
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&args);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_transport(e))?;

        if status.is_client_error() {
            return Err(ToolError::Rejected(format!(
                "{} returned {}: {}",
                self.name,
                status,
                truncate(&body)
            )));
        }
        if !status.is_success() {
            return Err(ToolError::Unavailable(format!(
                "{} returned {}: {}",
                self.name,
                status,
                truncate(&body)
            )));
        }

        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

impl HttpTool {
    fn map_transport(&self, error: reqwest::Error) -> ToolError {
        if error.is_timeout() {
            ToolError::Timeout {
                seconds: self.timeout.as_secs(),
            }
        } else {
            ToolError::Transport(format!("{}: {}", self.name, error))
        }
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
