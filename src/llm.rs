//! Completion client abstraction and the OpenRouter-compatible implementation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ModelConfig;
use crate::error::{Result, TurnloopError};
use crate::message::{Message, ToolCall};
use crate::tool::ToolDescription;
use crate::usage::Usage;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Batch response of a chat completion request, in wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
}

impl CompletionResponse {
    pub fn from_message(message: Message) -> Self {
        Self {
            choices: vec![CompletionChoice {
                message,
                finish_reason: None,
            }],
            usage: None,
            error: None,
        }
    }

    /// A plain assistant reply.
    pub fn text(content: impl Into<String>) -> Self {
        Self::from_message(Message::assistant(content))
    }

    /// An assistant turn requesting tools.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::from_message(Message::assistant_tool_calls(calls))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(ProviderError {
                message: message.into(),
                code: None,
            }),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = Some(Usage::new(prompt_tokens, completion_tokens));
        self
    }

    /// The first choice's message and the reported usage, or the provider error.
    pub fn into_message(self) -> Result<(Message, Usage)> {
        if let Some(error) = self.error {
            return Err(TurnloopError::Provider(error.message));
        }
        let usage = self.usage.unwrap_or_default();
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TurnloopError::Protocol("completion returned no choices".into()))?;
        Ok((choice.message, usage))
    }
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<CompletionResponse>;
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> TurnloopError {
    // Error payloads in the completion shape carry a better message than the raw body.
    if let Ok(CompletionResponse {
        error: Some(error), ..
    }) = serde_json::from_str::<CompletionResponse>(body)
    {
        return TurnloopError::Provider(format!("{provider} returned {status}: {}", error.message));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return TurnloopError::LanguageModel(format!("{provider} rate limit exceeded: {body}"));
    }
    TurnloopError::LanguageModel(format!("{provider} request failed with {status}: {body}"))
}

pub(crate) fn to_wire_tools(tools: &[ToolDescription]) -> Option<Vec<WireTool>> {
    if tools.is_empty() {
        return None;
    }

    Some(
        tools
            .iter()
            .map(|tool| WireTool {
                r#type: "function".to_string(),
                function: WireFunction {
                    name: tool.name.clone(),
                    description: Some(tool.description.clone()),
                    parameters: Some(
                        tool.parameters
                            .clone()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    ),
                },
            })
            .collect(),
    )
}

pub(crate) fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|err| TurnloopError::LanguageModel(format!("http client error: {err}")))
}

/// Client for OpenRouter and other OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
    reasoning_max_tokens: Option<u32>,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: build_http_client(120)?,
            model: model.into(),
            api_key: api_key.into(),
            base_url: OPENROUTER_BASE_URL.to_string(),
            reasoning_max_tokens: None,
        })
    }

    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg.api_key.clone().ok_or_else(|| {
            TurnloopError::Config("missing OpenRouter API key in model config".into())
        })?;
        Ok(Self {
            http: build_http_client(cfg.timeout_secs)?,
            model: cfg.model.clone(),
            api_key,
            base_url: cfg.base_url.clone(),
            reasoning_max_tokens: cfg.reasoning_max_tokens.filter(|tokens| *tokens > 0),
        })
    }

    pub fn with_reasoning_max_tokens(mut self, max_tokens: u32) -> Self {
        self.reasoning_max_tokens = Some(max_tokens);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn request_body(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        stream: bool,
    ) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(tools) = to_wire_tools(tools) {
            payload["tools"] = json!(tools);
        }
        if let Some(max_tokens) = self.reasoning_max_tokens {
            payload["reasoning"] = json!({ "max_tokens": max_tokens });
            payload["include_reasoning"] = Value::Bool(true);
        }
        payload
    }

    pub(crate) async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(payload)
            .send()
            .await
            .map_err(|err| TurnloopError::LanguageModel(format!("OpenRouter request error: {err}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(coalesce_error(status, &body, "openrouter"));
        }
        Ok(resp)
    }
}

#[async_trait]
impl CompletionClient for OpenRouterClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<CompletionResponse> {
        let payload = self.request_body(messages, tools, false);
        let resp = self.post(&payload).await?;
        resp.json().await.map_err(|err| {
            TurnloopError::LanguageModel(format!("OpenRouter response parse error: {err}"))
        })
    }
}

/// A deterministic client used for tests and demos. Replays canned responses
/// in order and records every request it receives.
pub struct ScriptedClient {
    responses: Mutex<VecDeque<Result<CompletionResponse>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<CompletionResponse>) -> Arc<Self> {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(responses: Vec<Result<CompletionResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Histories sent so far, one entry per `complete` call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDescription],
    ) -> Result<CompletionResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| TurnloopError::LanguageModel("scripted client poisoned".into()))?;
        responses.pop_front().unwrap_or_else(|| {
            Err(TurnloopError::LanguageModel(
                "ScriptedClient ran out of scripted responses".into(),
            ))
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireTool {
    r#type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}
