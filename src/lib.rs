//! taproom: a Discord bot that routes addressed messages through an intent
//! classifier to per-task LLM handlers.

pub mod assets;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod images;
pub mod llm;
pub mod messaging;
pub mod prompts;
pub mod retrieval;
pub mod roster;
pub mod router;
pub mod search;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// File extensions accepted as image attachments.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];

/// A platform user as seen in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: u64,
    /// Unique account name.
    pub username: String,
    /// Server nickname, global name, or username, in that order.
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        if let Some(content_type) = &self.content_type {
            return content_type.starts_with("image/");
        }
        let lower = self.filename.to_lowercase();
        IMAGE_EXTENSIONS
            .iter()
            .any(|extension| lower.ends_with(&format!(".{extension}")))
    }
}

/// A message received from the chat platform.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: u64,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub author: Author,
    /// Raw text, mentions still in `<@id>` form.
    pub content: String,
    pub mentions: Vec<Author>,
    pub attachments: Vec<Attachment>,
    /// The bot itself was @-mentioned.
    pub mentions_bot: bool,
    /// Content of the bot message this one replies to, if any.
    pub reply_to_bot: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// URLs of the image attachments, in attachment order.
    pub fn image_urls(&self) -> Vec<String> {
        self.attachments
            .iter()
            .filter(|attachment| attachment.is_image())
            .map(|attachment| attachment.url.clone())
            .collect()
    }
}

/// One message of a conversation snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub timestamp: DateTime<Utc>,
    pub author_id: u64,
    pub author_username: String,
    pub author_display_name: String,
    pub content: String,
}

/// Service handles shared by every handler. Built once in `main`.
#[derive(Clone)]
pub struct BotDeps {
    pub config: Arc<config::Config>,
    pub llm: Arc<dyn llm::LanguageModel>,
    pub embedder: Arc<dyn llm::Embedder>,
    /// Absent when no corpus is configured.
    pub index: Option<Arc<retrieval::RetrievalIndex>>,
    pub search: search::WebSearch,
    /// Absent when image generation is disabled.
    pub images: Option<Arc<images::ImageService>>,
    pub assets: Arc<assets::AssetResolver>,
    pub store: Arc<dyn storage::ObjectStore>,
    pub prompts: prompts::PromptEngine,
    pub router: router::IntentRouter,
}

impl BotDeps {
    pub fn task_model(&self) -> &str {
        &self.config.llm.task_model
    }

    pub fn embed_policy(&self) -> llm::RetryPolicy {
        llm::RetryPolicy::new(
            self.config.retrieval.embed_attempts,
            self.config.retrieval.embed_retry_delay,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(filename: &str, content_type: Option<&str>) -> Attachment {
        Attachment {
            filename: filename.into(),
            url: format!("https://cdn.example.com/{filename}"),
            content_type: content_type.map(Into::into),
        }
    }

    #[test]
    fn image_attachments_are_detected() {
        assert!(attachment("chart.PNG", None).is_image());
        assert!(attachment("photo", Some("image/jpeg")).is_image());
        assert!(!attachment("notes.txt", None).is_image());
        assert!(!attachment("chart.png", Some("application/pdf")).is_image());
    }
}
