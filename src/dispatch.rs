//! Resolving and running tool calls.
//!
//! Every outcome of a call, including unknown tools, malformed arguments and
//! tool failures, is folded into the string that becomes the tool message, so
//! the model can react to it on the next round.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::TurnloopError;
use crate::message::ToolCall;
use crate::schema;
use crate::tool::{ToolContext, ToolDescription, ToolRegistry};

/// Runs tool calls on behalf of the turn engine.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run one call. Never fails: errors are reported in the returned text.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> String;

    /// Schemas of every tool this executor can run.
    fn schemas(&self) -> Vec<ToolDescription>;

    /// Run a batch concurrently, returning results in call order.
    async fn execute_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<String> {
        join_all(calls.iter().map(|call| self.execute(call, ctx))).await
    }
}

/// Text returned for a call naming a tool that is not registered.
pub fn unknown_tool_message(name: &str) -> String {
    format!("Error: Unknown tool {name}")
}

/// Registry-backed executor.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    fn parse_arguments(call: &ToolCall) -> Result<Value, TurnloopError> {
        let arguments = call.arguments().map_err(|err| TurnloopError::InvalidArguments {
            name: call.name.clone(),
            reason: format!("arguments are not valid JSON ({err})"),
        })?;
        if !arguments.is_object() {
            return Err(TurnloopError::InvalidArguments {
                name: call.name.clone(),
                reason: format!("expected a JSON object, got `{arguments}`"),
            });
        }
        Ok(arguments)
    }
}

#[async_trait]
impl ToolExecutor for ToolDispatcher {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> String {
        let Some(tool) = self.registry.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model requested an unknown tool");
            return unknown_tool_message(&call.name);
        };

        let arguments = match Self::parse_arguments(call) {
            Ok(arguments) => arguments,
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "rejected tool arguments");
                return format!("Error: {err}");
            }
        };

        if let Some(parameters) = tool.parameters() {
            let found = schema::violations(&parameters, &arguments);
            if !found.is_empty() {
                let err = TurnloopError::InvalidArguments {
                    name: call.name.clone(),
                    reason: found.join("; "),
                };
                tracing::warn!(tool = %call.name, error = %err, "rejected tool arguments");
                return format!("Error: {err}");
            }
        }

        tracing::debug!(tool = %call.name, call_id = %call.id, depth = ctx.depth(), "executing tool");
        // Each call runs on its own task so a panicking tool only loses its own result.
        let ctx = ctx.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move { tool.call(arguments, &ctx).await }));
        match (&mut task.0).await {
            Ok(Ok(Value::String(text))) => text,
            Ok(Ok(other)) => other.to_string(),
            Ok(Err(err)) => {
                tracing::warn!(tool = %call.name, error = %err, "tool failed");
                format!("Error: {err}")
            }
            Err(join_err) => {
                tracing::error!(tool = %call.name, error = %join_err, "tool task panicked");
                format!("Error: tool `{}` panicked", call.name)
            }
        }
    }

    fn schemas(&self) -> Vec<ToolDescription> {
        self.registry.describe()
    }
}

/// Aborts the task when the awaiting caller goes away.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::tool::Tool;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the `text` field"
        }

        fn parameters(&self) -> Option<Value> {
            Some(json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }))
        }

        async fn call(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(input["text"].clone())
        }
    }

    struct Structured;

    #[async_trait]
    impl Tool for Structured {
        fn name(&self) -> &str {
            "structured"
        }

        fn description(&self) -> &str {
            "Returns a JSON object"
        }

        async fn call(&self, _input: Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(json!({"ok": true}))
        }
    }

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        async fn call(&self, _input: Value, _ctx: &ToolContext) -> Result<Value> {
            Err(TurnloopError::Protocol("disk on fire".into()))
        }
    }

    struct Sleepy {
        name: &'static str,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Sleeps then reports its name"
        }

        async fn call(&self, _input: Value, _ctx: &ToolContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(Value::String(self.name.to_string()))
        }
    }

    fn dispatcher() -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);
        registry.register(Structured);
        registry.register(Failing);
        ToolDispatcher::new(registry)
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_thrown() {
        let out = dispatcher()
            .execute(&ToolCall::new("c1", "foo_tool", "{}"), &ToolContext::new())
            .await;
        assert_eq!(out, "Error: Unknown tool foo_tool");
    }

    #[tokio::test]
    async fn string_results_pass_through_and_others_are_serialized() {
        let dispatcher = dispatcher();
        let ctx = ToolContext::new();

        let text = dispatcher
            .execute(&ToolCall::new("c1", "echo", r#"{"text":"hi"}"#), &ctx)
            .await;
        let object = dispatcher
            .execute(&ToolCall::new("c2", "structured", "{}"), &ctx)
            .await;

        assert_eq!(text, "hi");
        assert_eq!(object, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn tool_errors_become_error_strings() {
        let out = dispatcher()
            .execute(&ToolCall::new("c1", "failing", "{}"), &ToolContext::new())
            .await;
        assert_eq!(out, "Error: protocol error: disk on fire");
    }

    #[tokio::test]
    async fn malformed_json_is_reported() {
        let out = dispatcher()
            .execute(&ToolCall::new("c1", "echo", "{not json"), &ToolContext::new())
            .await;
        assert!(out.starts_with("Error: Invalid arguments for echo: arguments are not valid JSON"));
    }

    #[tokio::test]
    async fn schema_violations_skip_the_tool() {
        let out = dispatcher()
            .execute(&ToolCall::new("c1", "echo", r#"{"text": 3}"#), &ToolContext::new())
            .await;
        assert_eq!(
            out,
            "Error: Invalid arguments for echo: field `text` should be string, got number"
        );
    }

    #[tokio::test]
    async fn batch_results_keep_submission_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Sleepy { name: "slow", delay_ms: 60 });
        registry.register(Sleepy { name: "fast", delay_ms: 1 });
        let dispatcher = ToolDispatcher::new(registry);
        let calls = vec![
            ToolCall::new("c1", "slow", "{}"),
            ToolCall::new("c2", "fast", "{}"),
        ];

        let results = dispatcher.execute_all(&calls, &ToolContext::new()).await;

        assert_eq!(results, vec!["slow".to_string(), "fast".to_string()]);
    }
}
