//! Logging setup and retry helpers for calls to external services.

use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Result, TurnloopError};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `cfg.level`. Logs go to stderr so stdout stays free
/// for answers. Fails if a subscriber is already installed.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .map_err(|err| TurnloopError::Config(format!("invalid log level `{}`: {err}", cfg.level)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if cfg.json {
        registry
            .with(fmt::layer().json().flatten_event(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|err| TurnloopError::Config(format!("failed to install tracing subscriber: {err}")))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn default_external_call() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(250),
        }
    }

    /// Run `f` until it succeeds or retries run out, backing off linearly.
    pub async fn retry<F, Fut, T>(&self, label: &str, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries => {
                    tracing::warn!(call = label, attempt, error = %err, "retrying external call");
                    attempt += 1;
                    sleep(self.backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
