//! Sub-agent delegation.
//!
//! The `delegate` tool runs a nested turn for a named role with a fresh
//! history and that role's tool subset, and hands the nested final answer
//! back as its result.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::AgentProfile;
use crate::dispatch::{unknown_tool_message, ToolExecutor};
use crate::engine::TurnEngine;
use crate::error::{Result, TurnloopError};
use crate::message::{Message, ToolCall};
use crate::tool::{Tool, ToolContext, ToolDescription};

pub const DEFAULT_MAX_DEPTH: usize = 3;

pub struct DelegateTool {
    profiles: BTreeMap<String, AgentProfile>,
    max_depth: usize,
    max_rounds: Option<usize>,
}

impl DelegateTool {
    pub fn new(profiles: BTreeMap<String, AgentProfile>) -> Self {
        Self {
            profiles,
            max_depth: DEFAULT_MAX_DEPTH,
            max_rounds: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: Option<usize>) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn roles(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    async fn run_nested(&self, agent: &str, task: &str, ctx: &ToolContext) -> Result<String> {
        let profile = self.profiles.get(agent).ok_or_else(|| {
            TurnloopError::Protocol(format!(
                "unknown agent `{agent}` (available: {})",
                self.roles().join(", ")
            ))
        })?;
        if ctx.depth() >= self.max_depth {
            return Err(TurnloopError::Protocol(format!(
                "delegation depth limit of {} reached",
                self.max_depth
            )));
        }
        let client = ctx
            .client()
            .ok_or_else(|| TurnloopError::Protocol("no completion client available for sub-agents".into()))?;
        let executor = ctx
            .executor()
            .ok_or_else(|| TurnloopError::Protocol("no tool executor available for sub-agents".into()))?;

        let scoped = Arc::new(ScopedExecutor {
            inner: executor.clone(),
            allowed: profile.tools.clone(),
        });
        let tools = scoped.schemas();

        let depth = ctx.depth() + 1;
        let mut engine = TurnEngine::new(client.clone(), scoped)
            .with_context(ctx.clone())
            .at_depth(depth);
        if let Some(max_rounds) = self.max_rounds {
            engine = engine.with_max_rounds(max_rounds);
        }

        tracing::info!(agent, depth, tools = tools.len(), "delegating to sub-agent");
        let history = vec![Message::system(&profile.system_prompt), Message::user(task)];
        let result = engine.run_turn(&history, &tools).await?;
        tracing::info!(
            agent,
            depth,
            prompt_tokens = result.usage.prompt_tokens,
            completion_tokens = result.usage.completion_tokens,
            "sub-agent finished"
        );
        Ok(result.final_text().to_string())
    }
}

/// Executor limited to a role's tools. Anything else reads as an unknown tool.
struct ScopedExecutor {
    inner: Arc<dyn ToolExecutor>,
    allowed: Vec<String>,
}

#[async_trait]
impl ToolExecutor for ScopedExecutor {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> String {
        if !self.allowed.iter().any(|name| name == &call.name) {
            tracing::warn!(tool = %call.name, depth = ctx.depth(), "sub-agent called a tool outside its role");
            return unknown_tool_message(&call.name);
        }
        self.inner.execute(call, ctx).await
    }

    fn schemas(&self) -> Vec<ToolDescription> {
        let available = self.inner.schemas();
        self.allowed
            .iter()
            .filter_map(|name| available.iter().find(|tool| &tool.name == name).cloned())
            .collect()
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Delegate a task to a specialized subagent"
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "enum": self.roles(),
                    "description": "The name of the subagent to run"
                },
                "task": {
                    "type": "string",
                    "description": "The task description for the subagent"
                }
            },
            "required": ["agent", "task"]
        }))
    }

    async fn call(&self, input: Value, ctx: &ToolContext) -> Result<Value> {
        let agent = input.get("agent").and_then(Value::as_str).unwrap_or_default();
        let task = input.get("task").and_then(Value::as_str).unwrap_or_default();

        // Nothing inside the nested turn escapes as an error.
        let text = match self.run_nested(agent, task, ctx).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(agent, depth = ctx.depth(), error = %err, "sub-agent failed");
                format!("Error: sub-agent `{agent}` failed: {err}")
            }
        };
        Ok(Value::String(text))
    }
}
