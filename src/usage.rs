//! Token accounting and per-model pricing.

use std::ops::{Add, AddAssign};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::error::{Result, TurnloopError};
use crate::llm::build_http_client;
use crate::telemetry::RetryPolicy;

/// Token counters reported by the completion service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Cost in the pricing table's currency unit.
    pub fn cost(&self, pricing: &ModelPricing) -> f64 {
        self.prompt_tokens as f64 * pricing.prompt + self.completion_tokens as f64 * pricing.completion
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

/// Price per token for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub name: String,
    pub prompt: f64,
    pub completion: f64,
}

impl ModelPricing {
    pub fn prompt_per_million(&self) -> f64 {
        self.prompt * 1_000_000.0
    }

    pub fn completion_per_million(&self) -> f64 {
        self.completion * 1_000_000.0
    }
}

/// Where pricing comes from. `Ok(None)` means the model is not listed.
#[async_trait]
pub trait PricingSource: Send + Sync {
    async fn fetch(&self, model: &str) -> Result<Option<ModelPricing>>;
}

/// Reads the public OpenRouter model catalog.
#[derive(Clone)]
pub struct OpenRouterPricing {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OpenRouterPricing {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: build_http_client(30)?,
            base_url: base_url.into(),
            retry: RetryPolicy::default_external_call(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_catalog(&self) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/models", self.base_url.trim_end_matches('/')))
            .send()
            .await
            .map_err(|err| TurnloopError::LanguageModel(format!("pricing request error: {err}")))?;
        if !resp.status().is_success() {
            return Err(TurnloopError::LanguageModel(format!(
                "pricing request failed with {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|err| TurnloopError::LanguageModel(format!("pricing parse error: {err}")))
    }
}

#[async_trait]
impl PricingSource for OpenRouterPricing {
    async fn fetch(&self, model: &str) -> Result<Option<ModelPricing>> {
        let catalog = self.retry.retry("pricing", |_| self.fetch_catalog()).await?;
        Ok(pricing_from_catalog(&catalog, model))
    }
}

/// Pick `model` out of a `{"data": [{"id", "name", "pricing": {...}}]}` catalog.
/// Prices are decimal strings; anything unparsable counts as zero.
pub fn pricing_from_catalog(catalog: &Value, model: &str) -> Option<ModelPricing> {
    let entry = catalog
        .get("data")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("id").and_then(Value::as_str) == Some(model))?;

    let price = |key: &str| -> f64 {
        match entry.pointer(&format!("/pricing/{key}")) {
            Some(Value::String(raw)) => raw.parse().unwrap_or(0.0),
            Some(Value::Number(num)) => num.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    };

    Some(ModelPricing {
        model: model.to_string(),
        name: entry
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        prompt: price("prompt"),
        completion: price("completion"),
    })
}

/// Lazily fetches pricing for one model and keeps the answer for the life of
/// the cache, including a miss or a failed fetch.
pub struct PricingCache {
    source: Arc<dyn PricingSource>,
    model: String,
    cell: OnceCell<Option<ModelPricing>>,
}

impl PricingCache {
    pub fn new(source: Arc<dyn PricingSource>, model: impl Into<String>) -> Self {
        Self {
            source,
            model: model.into(),
            cell: OnceCell::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn get(&self) -> Option<&ModelPricing> {
        self.cell
            .get_or_init(|| async {
                match self.source.fetch(&self.model).await {
                    Ok(Some(pricing)) => Some(pricing),
                    Ok(None) => {
                        tracing::warn!(model = %self.model, "model not found in pricing catalog");
                        None
                    }
                    Err(err) => {
                        tracing::warn!(model = %self.model, error = %err, "failed to fetch model pricing");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    /// Cost of `usage`, if pricing is known.
    pub async fn cost(&self, usage: &Usage) -> Option<f64> {
        self.get().await.map(|pricing| usage.cost(pricing))
    }
}
