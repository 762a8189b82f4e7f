use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::message::Message;
use crate::session::SessionLoader;

/// Conversation transcript shared between the driver and tools that may
/// replace it, such as `resume_session`.
#[derive(Default, Clone, Debug)]
pub struct ConversationMemory {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl ConversationMemory {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(RwLock::new(messages)),
        }
    }

    pub async fn push(&self, message: Message) {
        self.messages.write().await.push(message);
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    /// Swap in a new transcript, returning the old one.
    pub async fn replace(&self, messages: Vec<Message>) -> Vec<Message> {
        std::mem::replace(&mut *self.messages.write().await, messages)
    }

    /// Store a finished turn's history if the transcript still holds what the
    /// turn was started from. Returns `false` and keeps the current transcript
    /// when a tool swapped it mid-turn.
    pub async fn commit_turn(&self, sent: &[Message], turn: Vec<Message>) -> bool {
        let mut messages = self.messages.write().await;
        if messages.as_slice() != sent {
            return false;
        }
        *messages = turn;
        true
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl SessionLoader for ConversationMemory {
    async fn load_session(&self, messages: Vec<Message>) -> Result<()> {
        tracing::info!(messages = messages.len(), "loaded stored session into memory");
        self.replace(messages).await;
        Ok(())
    }
}
