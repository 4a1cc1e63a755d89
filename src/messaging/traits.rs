//! The channel surface handlers reply through.

use crate::HistoryMessage;
use crate::error::MessagingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A conversation the bot can read from and post to.
///
/// Implemented by guild text channels and by deferred slash-command
/// interactions, so handlers never know which one they are answering.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Post one message. Callers keep it within the platform limit.
    async fn send(&self, text: &str) -> Result<(), MessagingError>;

    /// Post a message only the requester can see. Falls back to `send`.
    async fn send_private(&self, text: &str) -> Result<(), MessagingError> {
        self.send(text).await
    }

    /// The last `limit` messages, oldest first.
    async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryMessage>, MessagingError>;

    /// Messages posted after `after`, oldest first, at most `limit`.
    async fn history_since(
        &self,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, MessagingError>;
}
