//! Web search through the Tavily search API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, TurnloopError};
use crate::llm::build_http_client;
use crate::tool::{Tool, ToolContext};

pub const TAVILY_BASE_URL: &str = "https://api.tavily.com";
const SNIPPET_CHARS: usize = 200;

#[derive(Clone, Debug)]
pub struct WebSearchConfig {
    /// Without a key the tool answers with an error string.
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_results: usize,
    pub timeout_secs: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: TAVILY_BASE_URL.to_string(),
            max_results: 5,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

pub struct WebSearchTool {
    config: WebSearchConfig,
}

impl WebSearchTool {
    pub fn new(config: WebSearchConfig) -> Self {
        Self { config }
    }

    async fn search(&self, api_key: &str, query: &str) -> Result<SearchResponse> {
        let http = build_http_client(self.config.timeout_secs)?;
        let resp = http
            .post(format!("{}/search", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&json!({
                "query": query,
                "search_depth": "basic",
                "max_results": self.config.max_results,
                "include_answer": true,
            }))
            .send()
            .await
            .map_err(|err| TurnloopError::ToolInvocation {
                name: self.name().into(),
                source: Box::new(err),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TurnloopError::ToolInvocation {
                name: self.name().into(),
                source: format!("search failed with {status}: {body}").into(),
            });
        }
        resp.json().await.map_err(|err| TurnloopError::ToolInvocation {
            name: self.name().into(),
            source: Box::new(err),
        })
    }
}

fn render(response: &SearchResponse) -> String {
    let mut out = String::new();
    if let Some(answer) = response.answer.as_deref().filter(|answer| !answer.is_empty()) {
        out.push_str(&format!("Summary: {answer}\n\n"));
    }
    out.push_str("Sources:\n");
    let sources: Vec<String> = response
        .results
        .iter()
        .map(|hit| {
            let snippet: String = hit.content.chars().take(SNIPPET_CHARS).collect();
            format!("- {}\n  {}\n  {snippet}...", hit.title, hit.url)
        })
        .collect();
    out.push_str(&sources.join("\n\n"));
    out
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current documentation, code examples, or technical information. Use when you need up-to-date information beyond your training data."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query"}
            },
            "required": ["query"]
        }))
    }

    async fn call(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
        let Some(api_key) = self.config.api_key.as_deref().filter(|key| !key.is_empty()) else {
            return Ok(Value::String("Error: TAVILY_API_KEY not configured".into()));
        };
        let query = input.get("query").and_then(Value::as_str).unwrap_or_default();

        tracing::debug!(query, "searching the web");
        let response = self.search(api_key, query).await?;
        Ok(Value::String(render(&response)))
    }
}
