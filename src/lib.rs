//! A tool-calling turn engine for chat-completion agents.
//!
//! The crate provides:
//! - A completion client abstraction (`CompletionClient`) with an OpenRouter
//!   implementation and a scripted one for tests.
//! - A tool interface (`Tool`, `ToolRegistry`) and a dispatcher that folds
//!   every outcome into the text the model sees next.
//! - `TurnEngine`, which loops between the model and tools, running each
//!   round's calls concurrently, and `StreamingEngine` for chat sessions.
//! - Sub-agent delegation, JSONL session logs, and token/cost accounting.

mod chat;
mod config;
mod delegate;
mod dispatch;
mod engine;
mod error;
mod hooks;
mod llm;
mod memory;
mod message;
mod schema;
mod session;
mod stream;
mod telemetry;
mod tool;
mod toolkit;
mod usage;

pub mod tools;

pub use chat::{
    ChatSession, Chunk, ChunkStream, FunctionCall, FunctionResponse, OpenRouterChat, ScriptedChat,
    StreamRequest,
};
pub use config::{
    AgentProfile, AppConfig, EngineConfig, LoggingConfig, ModelConfig, Provider, SessionConfig,
    ToolsConfig, DEFAULT_MODEL,
};
pub use delegate::{DelegateTool, DEFAULT_MAX_DEPTH};
pub use dispatch::{unknown_tool_message, ToolDispatcher, ToolExecutor};
pub use engine::{TurnEngine, TurnResult};
pub use error::{Result, TurnloopError};
pub use hooks::TurnHook;
pub use llm::{
    CompletionChoice, CompletionClient, CompletionResponse, OpenRouterClient, ProviderError,
    ScriptedClient, OPENROUTER_BASE_URL,
};
pub use memory::ConversationMemory;
pub use message::{Message, Role, ToolCall};
pub use schema::violations as schema_violations;
pub use session::{
    find_session, list_sessions, load_session_file, topic_slug, SessionEntry, SessionLoader,
    SessionLog, DEFAULT_LOG_DIR,
};
pub use stream::{preview, StreamingEngine, TurnEvent};
pub use telemetry::{init_tracing, RetryPolicy};
pub use tool::{Tool, ToolContext, ToolDescription, ToolRegistry};
pub use toolkit::{
    coding_toolkit, file_toolkit, EditFileTool, ListFilesTool, ReadFileTool, SearchTool,
};
pub use usage::{
    pricing_from_catalog, ModelPricing, OpenRouterPricing, PricingCache, PricingSource, Usage,
};
