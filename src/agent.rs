//! LLM Sub-agent Gateway (C6): the `callAgent` structured-output call
//!
//! Adapted from the bearer-auth/`error_for_status`/`json::<Value>` reqwest
//! pattern used for outbound API calls in the reference pack, ported to
//! async `reqwest` and pointed at Anthropic's Messages API with a single
//! forced tool call standing in for "structured output" (spec.md §4.6).

use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::errors::{AppError, AppResult};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const RESPONSE_TOOL_NAME: &str = "emit_structured_response";

/// Model alias accepted by listener rule files, resolved to a concrete
/// Anthropic model id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAlias {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelAlias {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "sonnet" => Self::Sonnet,
            "opus" => Self::Opus,
            _ => Self::Haiku,
        }
    }

    fn model_id(self) -> &'static str {
        match self {
            Self::Haiku => "claude-haiku-4-5",
            Self::Sonnet => "claude-sonnet-4-5",
            Self::Opus => "claude-opus-4-1",
        }
    }
}

/// A single structured-output request a listener may issue via
/// `Context::call_agent`
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub schema: Value,
    pub model: ModelAlias,
}

/// Executes a single bounded-wall-time `callAgent` invocation
pub struct AgentGateway {
    client: Client,
    api_key: Option<SecretString>,
    call_timeout: Duration,
}

impl AgentGateway {
    pub fn new(api_key: Option<SecretString>, call_timeout_ms: u64) -> Self {
        Self {
            client: Client::new(),
            api_key,
            call_timeout: Duration::from_millis(call_timeout_ms),
        }
    }

    /// Call the LLM asking for exactly one structured response matching
    /// `request.schema`
    ///
    /// # Errors
    ///
    /// - `Validation` if no API key is configured, or the response contains
    ///   no matching tool-use block
    /// - `Timeout` if the call exceeds the configured wall-time budget
    /// - `Internal` for transport/HTTP failures
    pub async fn call(&self, request: &AgentRequest) -> AppResult<Value> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AppError::Validation("no LLM API key configured".to_owned()))?;

        let body = json!({
            "model": request.model.model_id(),
            "max_tokens": 1024,
            "messages": [{ "role": "user", "content": request.prompt }],
            "tools": [{
                "name": RESPONSE_TOOL_NAME,
                "description": "Emit the structured classification result.",
                "input_schema": request.schema,
            }],
            "tool_choice": { "type": "tool", "name": RESPONSE_TOOL_NAME },
        });

        let response = tokio::time::timeout(
            self.call_timeout,
            self.client
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| AppError::Timeout("callAgent exceeded its wall-time budget".to_owned()))?
        .map_err(|e| AppError::Internal(format!("callAgent request failed: {e}")))?;

        let response = response
            .error_for_status()
            .map_err(|e| AppError::Internal(format!("callAgent received an error status: {e}")))?;

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("failed to parse callAgent response: {e}")))?;

        extract_tool_input(&parsed)
    }
}

/// Pull the structured `input` object out of the first matching `tool_use`
/// content block
///
/// # Errors
///
/// `Validation` if the response contains no such block.
fn extract_tool_input(response: &Value) -> AppResult<Value> {
    response
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
        .and_then(|block| block.get("input"))
        .cloned()
        .ok_or_else(|| {
            AppError::Validation(
                "callAgent response contained no structured tool_use block".to_owned(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_alias_defaults_to_haiku() {
        assert_eq!(ModelAlias::parse("unknown"), ModelAlias::Haiku);
        assert_eq!(ModelAlias::parse("Opus"), ModelAlias::Opus);
    }

    #[test]
    fn extracts_tool_use_input() {
        let response = json!({
            "content": [
                { "type": "text", "text": "thinking..." },
                { "type": "tool_use", "name": RESPONSE_TOOL_NAME, "input": { "is_urgent": true } },
            ]
        });
        let extracted = extract_tool_input(&response).unwrap();
        assert_eq!(extracted["is_urgent"], true);
    }

    #[test]
    fn missing_tool_use_block_is_a_validation_error() {
        let response = json!({ "content": [{ "type": "text", "text": "no tool" }] });
        assert!(matches!(
            extract_tool_input(&response),
            Err(AppError::Validation(_))
        ));
    }
}

