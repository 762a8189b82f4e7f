//! Streaming turns.
//!
//! The engine consumes a [`ChatSession`] and reports progress as
//! [`TurnEvent`]s on a bounded channel, so a slow reader applies back
//! pressure all the way to the provider stream.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::chat::{ChatSession, FunctionCall, FunctionResponse, StreamRequest};
use crate::dispatch::ToolExecutor;
use crate::error::{Result, TurnloopError};
use crate::llm::CompletionClient;
use crate::tool::ToolContext;
use crate::usage::Usage;

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    TextChunk(String),
    ToolStart { name: String },
    ToolResult { name: String, preview: String },
    /// `text` is every text chunk of the turn, concatenated.
    Finished { text: String, usage: Usage },
    Failed(String),
}

impl fmt::Display for TurnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnEvent::TextChunk(text) => f.write_str(text),
            TurnEvent::ToolStart { name } => writeln!(f, "\n[Executing {name}...]"),
            TurnEvent::ToolResult { preview, .. } => writeln!(f, "[Result: {preview}]"),
            TurnEvent::Finished { .. } => Ok(()),
            TurnEvent::Failed(message) => writeln!(f, "\nError: {message}"),
        }
    }
}

/// First hundred characters of a tool result, with `...` when cut.
pub fn preview(result: &str) -> String {
    match result.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &result[..cut]),
        None => result.to_string(),
    }
}

#[derive(Clone)]
pub struct StreamingEngine {
    session: Arc<dyn ChatSession>,
    executor: Arc<dyn ToolExecutor>,
    client: Option<Arc<dyn CompletionClient>>,
    context: ToolContext,
    buffer: usize,
}

impl StreamingEngine {
    pub fn new(session: Arc<dyn ChatSession>, executor: Arc<dyn ToolExecutor>) -> Self {
        let context = ToolContext::new().with_executor(executor.clone());
        Self {
            session,
            executor,
            client: None,
            context,
            buffer: 32,
        }
    }

    /// Batch client handed to tools that run nested turns, such as `delegate`.
    pub fn with_client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.context = self.context.with_client(client.clone());
        self.client = Some(client);
        self
    }

    /// Base context handed to tools. The engine's executor and client always win.
    pub fn with_context(mut self, context: ToolContext) -> Self {
        let context = context.with_executor(self.executor.clone());
        self.context = match &self.client {
            Some(client) => context.with_client(client.clone()),
            None => context,
        };
        self
    }

    /// Channel capacity between the driver task and the reader.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Start a streaming turn for `input` on a background task.
    ///
    /// The stream always ends with exactly one `Finished` or `Failed` event.
    pub fn run(&self, input: impl Into<String>) -> ReceiverStream<TurnEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let engine = self.clone();
        let input = input.into();
        tokio::spawn(async move {
            let last = match engine.drive(input, &tx).await {
                Ok((text, usage)) => TurnEvent::Finished { text, usage },
                Err(err) => {
                    tracing::warn!(error = %err, "streaming turn failed");
                    TurnEvent::Failed(err.to_string())
                }
            };
            // The reader may already be gone; nothing left to tell it.
            let _ = tx.send(last).await;
        });
        ReceiverStream::new(rx)
    }

    async fn drive(&self, input: String, tx: &mpsc::Sender<TurnEvent>) -> Result<(String, Usage)> {
        let mut request = StreamRequest::Text(input);
        let mut text = String::new();
        let mut usage = Usage::default();
        let mut segment = 0usize;

        loop {
            segment += 1;
            let mut stream = self.session.send(request).await?;
            let mut pending: Vec<FunctionCall> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if let Some(delta) = chunk.usage {
                    usage += delta;
                }
                // Calls take precedence; a chunk carrying calls is never text.
                if !chunk.function_calls.is_empty() {
                    pending.extend(chunk.function_calls);
                    continue;
                }
                if let Some(piece) = chunk.text.filter(|piece| !piece.is_empty()) {
                    text.push_str(&piece);
                    emit(tx, TurnEvent::TextChunk(piece)).await?;
                }
            }

            tracing::debug!(segment, tool_calls = pending.len(), "stream segment finished");
            if pending.is_empty() {
                return Ok((text, usage));
            }

            let mut responses = Vec::with_capacity(pending.len());
            for call in pending {
                emit(tx, TurnEvent::ToolStart { name: call.name.clone() }).await?;
                let (id, name) = (call.id.clone(), call.name.clone());
                let result = self.executor.execute(&call.into_tool_call(), &self.context).await;
                emit(
                    tx,
                    TurnEvent::ToolResult {
                        name: name.clone(),
                        preview: preview(&result),
                    },
                )
                .await?;
                responses.push(FunctionResponse { id, name, result });
            }
            request = StreamRequest::FunctionResponses(responses);
        }
    }
}

async fn emit(tx: &mpsc::Sender<TurnEvent>, event: TurnEvent) -> Result<()> {
    tx.send(event)
        .await
        .map_err(|_| TurnloopError::Protocol("turn event receiver dropped".into()))
}
