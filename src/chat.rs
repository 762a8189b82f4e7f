//! Streaming chat sessions.
//!
//! A session owns its conversation history, the way a server-side chat
//! thread does: callers only send the next user text or the responses to the
//! function calls the previous stream produced.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, TurnloopError};
use crate::llm::{OpenRouterClient, ProviderError};
use crate::message::{Message, ToolCall};
use crate::tool::ToolDescription;
use crate::usage::Usage;

/// A whole function call, reassembled from stream fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            args,
        }
    }

    pub fn into_tool_call(self) -> ToolCall {
        let raw = match self.args {
            Value::String(raw) => raw,
            other => other.to_string(),
        };
        ToolCall::new(self.id, self.name, raw)
    }
}

/// Result of one function call, sent back on the next request.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamRequest {
    Text(String),
    FunctionResponses(Vec<FunctionResponse>),
}

impl StreamRequest {
    fn into_messages(self) -> Vec<Message> {
        match self {
            StreamRequest::Text(text) => vec![Message::user(text)],
            StreamRequest::FunctionResponses(responses) => responses
                .into_iter()
                .map(|response| Message::tool(response.id, response.name, response.result))
                .collect(),
        }
    }
}

/// One piece of a streamed reply: text, whole function calls, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub text: Option<String>,
    pub function_calls: Vec<FunctionCall>,
    pub usage: Option<Usage>,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn calls(function_calls: Vec<FunctionCall>) -> Self {
        Self {
            function_calls,
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = Some(Usage::new(prompt_tokens, completion_tokens));
        self
    }
}

pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

#[async_trait]
pub trait ChatSession: Send + Sync {
    async fn send(&self, request: StreamRequest) -> Result<ChunkStream>;
}

/// Streaming session against an OpenRouter-compatible endpoint.
pub struct OpenRouterChat {
    client: OpenRouterClient,
    tools: Vec<ToolDescription>,
    history: Arc<Mutex<Vec<Message>>>,
}

impl OpenRouterChat {
    pub fn new(client: OpenRouterClient, tools: Vec<ToolDescription>) -> Self {
        Self {
            client,
            tools,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        if let Ok(mut history) = self.history.lock() {
            history.insert(0, Message::system(prompt));
        }
        self
    }

    /// Messages committed to the session so far.
    pub fn history(&self) -> Vec<Message> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatSession for OpenRouterChat {
    async fn send(&self, request: StreamRequest) -> Result<ChunkStream> {
        let outgoing = request.into_messages();
        let mut snapshot = self
            .history
            .lock()
            .map_err(|_| TurnloopError::Protocol("chat history lock poisoned".into()))?
            .clone();
        snapshot.extend(outgoing.iter().cloned());

        let payload = self.client.request_body(&snapshot, &self.tools, true);
        let resp = self.client.post(&payload).await?;

        // Only requests the service accepted become part of the session.
        self.history
            .lock()
            .map_err(|_| TurnloopError::Protocol("chat history lock poisoned".into()))?
            .extend(outgoing);

        let bytes = resp
            .bytes_stream()
            .map(|item| item.map(|bytes| bytes.to_vec()))
            .boxed();
        let state = SseState {
            bytes,
            buffer: Vec::new(),
            ready: VecDeque::new(),
            calls: CallAssembler::default(),
            text: String::new(),
            usage: None,
            history: self.history.clone(),
            finished: false,
        };
        Ok(stream::unfold(state, next_chunk).boxed())
    }
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    ready: VecDeque<Chunk>,
    calls: CallAssembler,
    text: String,
    usage: Option<Usage>,
    history: Arc<Mutex<Vec<Message>>>,
    finished: bool,
}

async fn next_chunk(mut state: SseState) -> Option<(Result<Chunk>, SseState)> {
    loop {
        if let Some(chunk) = state.ready.pop_front() {
            return Some((Ok(chunk), state));
        }
        if state.finished {
            return None;
        }
        match state.bytes.next().await {
            Some(Ok(bytes)) => {
                state.buffer.extend_from_slice(&bytes);
                if let Err(err) = state.drain_lines() {
                    state.finished = true;
                    return Some((Err(err), state));
                }
            }
            Some(Err(err)) => {
                state.finished = true;
                let err = TurnloopError::LanguageModel(format!("OpenRouter stream error: {err}"));
                return Some((Err(err), state));
            }
            None => {
                state.finished = true;
                if !state.buffer.is_empty() {
                    state.buffer.push(b'\n');
                    if let Err(err) = state.drain_lines() {
                        return Some((Err(err), state));
                    }
                }
                state.commit();
            }
        }
    }
}

impl SseState {
    fn drain_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim())?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(());
        }
        let parsed: StreamDelta = serde_json::from_str(data).map_err(|err| {
            TurnloopError::LanguageModel(format!("OpenRouter stream parse error `{data}`: {err}"))
        })?;
        if let Some(error) = parsed.error {
            return Err(TurnloopError::Provider(error.message));
        }
        for choice in parsed.choices {
            if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
                self.text.push_str(&content);
                self.ready.push_back(Chunk::text(content));
            }
            for fragment in choice.delta.tool_calls.unwrap_or_default() {
                self.calls.absorb(fragment);
            }
        }
        if parsed.usage.is_some() {
            self.usage = parsed.usage;
        }
        Ok(())
    }

    /// Record the finished reply in the session and queue the trailing call chunk.
    fn commit(&mut self) {
        let calls = std::mem::take(&mut self.calls).finish();
        let message = if calls.is_empty() {
            Message::assistant(std::mem::take(&mut self.text))
        } else {
            Message::assistant_tool_calls(calls.iter().cloned().map(FunctionCall::into_tool_call).collect())
        };
        if let Ok(mut history) = self.history.lock() {
            history.push(message);
        }
        if !calls.is_empty() || self.usage.is_some() {
            self.ready.push_back(Chunk {
                text: None,
                function_calls: calls,
                usage: self.usage.take(),
            });
        }
    }
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Stitches `tool_calls` deltas back together by their index.
#[derive(Default)]
struct CallAssembler {
    calls: BTreeMap<usize, PartialCall>,
    last_index: Option<usize>,
}

impl CallAssembler {
    fn absorb(&mut self, fragment: DeltaToolCall) {
        let index = match (fragment.index, &fragment.id, self.last_index) {
            (Some(index), _, _) => index,
            (None, Some(id), Some(last))
                if self.calls.get(&last).and_then(|call| call.id.as_ref()) == Some(id) =>
            {
                last
            }
            // A fresh id without an index opens a new call.
            (None, Some(_), _) => self.calls.len(),
            (None, None, Some(last)) => last,
            (None, None, None) => 0,
        };
        self.last_index = Some(index);

        let call = self.calls.entry(index).or_default();
        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            call.id = Some(id);
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                call.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                call.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Vec<FunctionCall> {
        self.calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| {
                let args = if call.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments))
                };
                let mut function_call = FunctionCall::new(call.name, args);
                if let Some(id) = call.id {
                    function_call.id = id;
                }
                function_call
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ProviderError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Replays canned chunk sequences, one per `send`.
pub struct ScriptedChat {
    scripts: Mutex<VecDeque<Vec<Result<Chunk>>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedChat {
    pub fn new(scripts: Vec<Vec<Chunk>>) -> Arc<Self> {
        Self::with_results(
            scripts
                .into_iter()
                .map(|script| script.into_iter().map(Ok).collect())
                .collect(),
        )
    }

    pub fn with_results(scripts: Vec<Vec<Result<Chunk>>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatSession for ScriptedChat {
    async fn send(&self, request: StreamRequest) -> Result<ChunkStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let script = self
            .scripts
            .lock()
            .map_err(|_| TurnloopError::LanguageModel("scripted chat poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                TurnloopError::LanguageModel("ScriptedChat ran out of scripted streams".into())
            })?;
        Ok(stream::iter(script).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with_history() -> (SseState, Arc<Mutex<Vec<Message>>>) {
        let history = Arc::new(Mutex::new(Vec::new()));
        let state = SseState {
            bytes: stream::empty().boxed(),
            buffer: Vec::new(),
            ready: VecDeque::new(),
            calls: CallAssembler::default(),
            text: String::new(),
            usage: None,
            history: history.clone(),
            finished: false,
        };
        (state, history)
    }

    #[test]
    fn reassembles_fragmented_tool_calls() {
        let (mut state, history) = state_with_history();
        let lines = [
            r#"data: {"choices":[{"delta":{"content":"Let me check"}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"bash","arguments":"{\"comm"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"and\":\"ls\"}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"read_file","arguments":"{\"path\":\"a\"}"}}]}}]}"#,
            r#"data: {"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3}}"#,
            "data: [DONE]",
        ];
        for line in lines {
            state.buffer.extend_from_slice(line.as_bytes());
            state.buffer.push(b'\n');
        }

        state.drain_lines().unwrap();
        state.commit();

        let text = state.ready.pop_front().unwrap();
        assert_eq!(text.text.as_deref(), Some("Let me check"));
        assert!(text.function_calls.is_empty());

        let calls = state.ready.pop_front().unwrap();
        assert!(calls.text.is_none());
        assert_eq!(calls.usage, Some(Usage::new(7, 3)));
        assert_eq!(calls.function_calls.len(), 2);
        assert_eq!(calls.function_calls[0].id, "call_a");
        assert_eq!(calls.function_calls[0].args, json!({"command": "ls"}));
        assert_eq!(calls.function_calls[1].name, "read_file");

        let history = history.lock().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tool_calls.len(), 2);
        assert!(history[0].content.is_none());
    }

    #[test]
    fn partial_lines_wait_for_the_rest() {
        let (mut state, _) = state_with_history();
        state
            .buffer
            .extend_from_slice(br#"data: {"choices":[{"delta":{"content":"hel"#);
        state.drain_lines().unwrap();
        assert!(state.ready.is_empty());

        state.buffer.extend_from_slice(b"lo\"}}]}\n");
        state.drain_lines().unwrap();
        assert_eq!(state.ready.pop_front().unwrap().text.as_deref(), Some("hello"));
    }

    #[test]
    fn text_replies_are_committed_as_content() {
        let (mut state, history) = state_with_history();
        state.buffer.extend_from_slice(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi \"}}]}\ndata: {\"choices\":[{\"delta\":{\"content\":\"there\"}}]}\n",
        );
        state.drain_lines().unwrap();
        state.commit();

        assert_eq!(state.ready.len(), 2);
        assert_eq!(history.lock().unwrap()[0].text(), "Hi there");
    }

    #[test]
    fn stream_errors_surface_as_provider_errors() {
        let (mut state, _) = state_with_history();
        state
            .buffer
            .extend_from_slice(b"data: {\"error\":{\"message\":\"overloaded\"}}\n");
        let err = state.drain_lines().unwrap_err();
        assert!(matches!(err, TurnloopError::Provider(ref msg) if msg == "overloaded"));
    }

    #[tokio::test]
    async fn scripted_chat_replays_in_order() {
        let chat = ScriptedChat::new(vec![vec![Chunk::text("a"), Chunk::text("b")]]);

        let chunks: Vec<Chunk> = chat
            .send(StreamRequest::Text("hi".into()))
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert!(chat.send(StreamRequest::Text("again".into())).await.is_err());
        assert_eq!(chat.requests().len(), 2);
    }
}
