use std::sync::Arc;

use crate::dispatch::ToolExecutor;
use crate::error::{Result, TurnloopError};
use crate::hooks::TurnHook;
use crate::llm::CompletionClient;
use crate::message::{Message, ToolCall};
use crate::tool::{ToolContext, ToolDescription};
use crate::usage::Usage;

/// Outcome of a completed turn: the full history, caller's prefix included,
/// and the tokens spent producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub messages: Vec<Message>,
    pub usage: Usage,
}

impl TurnResult {
    /// Content of the final assistant message.
    pub fn final_text(&self) -> &str {
        self.messages.last().map(Message::text).unwrap_or_default()
    }
}

/// Drives completion rounds until the model answers without tool calls.
#[derive(Clone)]
pub struct TurnEngine {
    client: Arc<dyn CompletionClient>,
    executor: Arc<dyn ToolExecutor>,
    hooks: Vec<Arc<dyn TurnHook>>,
    max_rounds: Option<usize>,
    context: ToolContext,
}

impl TurnEngine {
    pub fn new(client: Arc<dyn CompletionClient>, executor: Arc<dyn ToolExecutor>) -> Self {
        let context = ToolContext::new()
            .with_client(client.clone())
            .with_executor(executor.clone());
        Self {
            client,
            executor,
            hooks: Vec::new(),
            max_rounds: None,
            context,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn TurnHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Abort a turn that would need more than `max_rounds` completion calls.
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = Some(max_rounds.max(1));
        self
    }

    /// Base context handed to tools. The engine's client and executor always win.
    pub fn with_context(mut self, context: ToolContext) -> Self {
        self.context = context
            .with_client(self.client.clone())
            .with_executor(self.executor.clone());
        self
    }

    pub fn at_depth(mut self, depth: usize) -> Self {
        self.context = self.context.at_depth(depth);
        self
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub fn executor(&self) -> &Arc<dyn ToolExecutor> {
        &self.executor
    }

    /// Run one turn over a copy of `history`.
    ///
    /// Fails fast on transport or provider errors; the returned
    /// [`TurnloopError::TurnAborted`] carries everything committed before the
    /// failing round.
    pub async fn run_turn(&self, history: &[Message], tools: &[ToolDescription]) -> Result<TurnResult> {
        let depth = self.context.depth();
        let mut messages = history.to_vec();
        let mut usage = Usage::default();
        let mut round = 0usize;

        tracing::info!(depth, history = messages.len(), tools = tools.len(), "starting turn");

        loop {
            if let Some(max_rounds) = self.max_rounds {
                if round >= max_rounds {
                    tracing::warn!(depth, max_rounds, "turn hit the round limit");
                    let err = TurnloopError::Protocol(format!(
                        "turn did not finish within {max_rounds} rounds"
                    ));
                    return Err(TurnloopError::aborted(err, messages, usage));
                }
            }
            round += 1;

            for hook in &self.hooks {
                if let Err(err) = hook.before_completion(&messages).await {
                    tracing::warn!(error = %err, "turn hook failed before completion");
                }
            }

            let reply = match self.client.complete(&messages, tools).await {
                Ok(response) => response.into_message(),
                Err(err) => Err(err),
            };
            let (reply, delta) = match reply {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(depth, round, error = %err, "completion failed, aborting turn");
                    return Err(TurnloopError::aborted(err, messages, usage));
                }
            };
            usage += delta;
            tracing::debug!(
                depth,
                round,
                prompt_tokens = delta.prompt_tokens,
                completion_tokens = delta.completion_tokens,
                tool_calls = reply.tool_calls.len(),
                "completion received"
            );

            if !reply.has_tool_calls() {
                let answer = Message::assistant(reply.content.unwrap_or_default())
                    .with_reasoning_details(reply.reasoning_details);
                self.commit(&mut messages, answer).await;
                tracing::info!(
                    depth,
                    rounds = round,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "turn finished"
                );
                return Ok(TurnResult { messages, usage });
            }

            let calls: Vec<ToolCall> = reply.tool_calls.into_iter().map(ensure_call_id).collect();
            let request = Message::assistant_tool_calls(calls.clone())
                .with_reasoning_details(reply.reasoning_details);
            self.commit(&mut messages, request).await;

            let results = self.executor.execute_all(&calls, &self.context).await;
            for (call, result) in calls.into_iter().zip(results) {
                self.commit(&mut messages, Message::tool(call.id, call.name, result))
                    .await;
            }
        }
    }

    async fn commit(&self, messages: &mut Vec<Message>, message: Message) {
        messages.push(message);
        for hook in &self.hooks {
            if let Err(err) = hook.on_message(messages).await {
                tracing::warn!(error = %err, "turn hook failed on message");
            }
        }
    }
}

// Providers occasionally omit ids; every call still needs one to pair with its result.
fn ensure_call_id(mut call: ToolCall) -> ToolCall {
    if call.id.is_empty() {
        call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
    }
    call
}
