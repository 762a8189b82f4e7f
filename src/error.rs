use thiserror::Error;

use crate::message::Message;
use crate::usage::Usage;

pub type Result<T> = std::result::Result<T, TurnloopError>;

#[derive(Debug, Error)]
pub enum TurnloopError {
    #[error("tool `{name}` invocation failed: {source}")]
    ToolInvocation {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    /// Transport-level failure talking to the completion service.
    #[error("language model error: {0}")]
    LanguageModel(String),

    /// The completion service answered, but with an error payload.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A turn stopped early. `messages` holds everything committed before the
    /// failing round so callers can inspect or resume it.
    #[error("turn aborted after {} messages: {source}", .messages.len())]
    TurnAborted {
        #[source]
        source: Box<TurnloopError>,
        messages: Vec<Message>,
        usage: Usage,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl TurnloopError {
    pub(crate) fn aborted(source: TurnloopError, messages: Vec<Message>, usage: Usage) -> Self {
        TurnloopError::TurnAborted {
            source: Box::new(source),
            messages,
            usage,
        }
    }

    /// History committed before a turn failed, if this error carries one.
    pub fn partial_history(&self) -> Option<&[Message]> {
        match self {
            TurnloopError::TurnAborted { messages, .. } => Some(messages),
            _ => None,
        }
    }

    /// The underlying failure, looking through `TurnAborted`.
    pub fn root(&self) -> &TurnloopError {
        match self {
            TurnloopError::TurnAborted { source, .. } => source.root(),
            other => other,
        }
    }
}
