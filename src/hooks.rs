use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

/// Observer of a running turn. Errors are logged by the engine and never stop the turn.
#[async_trait]
pub trait TurnHook: Send + Sync {
    async fn before_completion(&self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }

    /// Called once per committed message; `history` ends with that message.
    async fn on_message(&self, _history: &[Message]) -> Result<()> {
        Ok(())
    }
}
