//! Per-intent task handlers.
//!
//! Every handler takes the same arguments: shared services, the channel to
//! answer in, the request, and the image URLs attached to it. Each one issues
//! exactly one final generation call and sends the reply chunked.

pub mod chat;
pub mod domain;
pub mod image;
pub mod profile;
pub mod summarize;

use crate::error::{ClassificationError, MessagingError, Result};
use crate::llm::routing::{RetryPolicy, retry};
use crate::llm::CompletionRequest;
use crate::messaging::ChannelHandle;
use crate::messaging::chunking::send_reply;
use crate::prompts::compose;
use crate::router::{Intent, structured_call};
use crate::{Author, BotDeps, HistoryMessage};
use chrono::{DateTime, Utc};

/// Sent when the classifier returns a `todo` outside the known set.
pub const UNRECOGNIZED_REPLY: &str = "Sorry, I didn't understand the request. Please try again.";

/// What the user asked, resolved for handlers.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Message text with mentions replaced by display names.
    pub text: String,
    /// Message text with mentions replaced by usernames. Used to name other users.
    pub text_with_usernames: String,
    pub requester: Author,
    /// Language to reply in, lowercase.
    pub language: String,
    /// The bot message this request replies to, if any.
    pub replying_to: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl TaskRequest {
    /// A request whose text carries no mentions.
    pub fn plain(text: impl Into<String>, requester: Author, language: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            text_with_usernames: text.clone(),
            text,
            requester,
            language: language.into(),
            replying_to: None,
            received_at: Utc::now(),
        }
    }
}

/// The user-facing form of an aborted request.
pub fn error_reply(error: &dyn std::fmt::Display) -> String {
    format!("Error: {error}. Please try again.")
}

/// Send [`error_reply`] chunked. Provider errors can carry whole response bodies.
pub async fn report_error(
    channel: &dyn ChannelHandle,
    error: &(dyn std::fmt::Display + Sync),
) -> std::result::Result<(), MessagingError> {
    send_reply(channel, &error_reply(error)).await
}

/// Run the handler for `intent`.
pub async fn run(
    intent: &Intent,
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    tracing::info!(
        %intent,
        requester = %request.requester.username,
        images = images.len(),
        "running task handler"
    );

    match intent {
        Intent::Summarize => summarize::summarize(deps, channel, request, images).await,
        Intent::Gotc => domain::answer(deps, channel, request, images).await,
        Intent::WebSearch => domain::web_search(deps, channel, request, images).await,
        Intent::Miscellaneous => domain::miscellaneous(deps, channel, request, images).await,
        Intent::Calendar => domain::calendar(deps, channel, request, images).await,
        Intent::Translate => chat::translate(deps, channel, request, images).await,
        Intent::AboutChat => chat::about_chat(deps, channel, request, images).await,
        Intent::Humor => chat::humor(deps, channel, request, images).await,
        Intent::Help => chat::help(deps, channel, request, images).await,
        Intent::AboutMe => profile::about_me(deps, channel, request, images).await,
        Intent::AnalyzeUser => profile::analyze_user(deps, channel, request, images).await,
        Intent::GenerateImage => image::generate(deps, channel, request, images).await,
        Intent::None => {
            tracing::debug!("nothing to do for message");
            Ok(())
        }
        Intent::Unrecognized(raw) => {
            tracing::warn!(todo = %raw, "unrecognized intent, answering as a domain question");
            channel.send(UNRECOGNIZED_REPLY).await?;
            domain::answer(deps, channel, request, images).await
        }
    }
}

/// The final generation call of a handler.
pub(crate) async fn generate(
    deps: &BotDeps,
    system_prompt: String,
    user_text: String,
    images: &[String],
) -> Result<String> {
    let request = CompletionRequest::new(
        deps.task_model(),
        compose(system_prompt, user_text, images),
    );
    Ok(deps.llm.complete(request).await?)
}

/// Generate and send the reply in one step.
pub(crate) async fn reply(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    system_prompt: String,
    user_text: String,
    images: &[String],
) -> Result<()> {
    let text = generate(deps, system_prompt, user_text, images).await?;
    send_reply(channel, &text).await?;
    Ok(())
}

/// A JSON-mode extraction call using the named system prompt template.
pub(crate) async fn extract(
    deps: &BotDeps,
    template: &str,
    text: &str,
    images: &[String],
) -> std::result::Result<serde_json::Map<String, serde_json::Value>, ClassificationError> {
    let system_prompt = deps
        .prompts
        .render_static(template)
        .map_err(|error| ClassificationError::Malformed(error.to_string()))?;
    structured_call(
        deps.llm.as_ref(),
        deps.task_model(),
        system_prompt,
        text.to_string(),
        images,
    )
    .await
}

/// [`extract`] with one retry.
pub(crate) async fn extract_with_retry(
    deps: &BotDeps,
    template: &str,
    text: &str,
    images: &[String],
) -> std::result::Result<serde_json::Map<String, serde_json::Value>, ClassificationError> {
    retry(RetryPolicy::once(), template, move || {
        extract(deps, template, text, images)
    })
    .await
}

/// A string field of an extraction result, trimmed. Empty counts as absent.
pub(crate) fn string_field(
    object: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<String> {
    object
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// `(hh:mm AM) Display: content` per message, newlines flattened.
pub(crate) fn conversation_lines(history: &[HistoryMessage]) -> String {
    history
        .iter()
        .map(|message| {
            format!(
                "({}) {}: {}",
                message.timestamp.format("%I:%M %p"),
                message.author_display_name,
                message.content.replace('\n', " ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `[timestamp] username: content` per message, one per line.
pub(crate) fn transcript(history: &[HistoryMessage]) -> String {
    history
        .iter()
        .map(|message| {
            format!(
                "[{}] {}: {}\n",
                message.timestamp.format("%Y-%m-%d %H:%M:%S%:z"),
                message.author_username,
                message.content
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingChannel, ScriptedModel, bot_deps, requester};
    use std::sync::Arc;

    #[test]
    fn string_fields_are_trimmed_and_empty_is_absent() {
        let object = serde_json::json!({"a": "  x ", "b": "   ", "c": 3});
        let object = object.as_object().unwrap();
        assert_eq!(string_field(object, "a"), Some("x".into()));
        assert_eq!(string_field(object, "b"), None);
        assert_eq!(string_field(object, "c"), None);
        assert_eq!(string_field(object, "d"), None);
    }

    #[test]
    fn transcript_lists_one_message_per_line() {
        let history = vec![
            crate::testing::history(0, 1, "ser_pounce", "Ser Pounce", "hello"),
            crate::testing::history(60, 2, "lady_dee", "Lady Dee", "hi there"),
        ];
        assert_eq!(
            transcript(&history),
            "[2024-05-17 12:00:00+00:00] ser_pounce: hello\n[2024-05-17 12:01:00+00:00] lady_dee: hi there\n"
        );
    }

    #[test]
    fn conversation_lines_use_twelve_hour_clock() {
        let history = vec![
            crate::testing::history(0, 1, "ser_pounce", "Ser Pounce", "line one\nline two"),
            crate::testing::history(3600 * 2, 2, "lady_dee", "Lady Dee", "hi"),
        ];
        assert_eq!(
            conversation_lines(&history),
            "(12:00 PM) Ser Pounce: line one line two\n(02:00 PM) Lady Dee: hi"
        );
    }

    #[tokio::test]
    async fn none_intent_sends_nothing() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let deps = bot_deps(model.clone());
        let channel = RecordingChannel::new();
        let request = TaskRequest::plain("ok", requester(), "english");

        run(&Intent::None, &deps, &channel, &request, &[]).await.unwrap();

        assert!(channel.sent().is_empty());
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn unrecognized_intent_apologizes_then_answers() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("The pale steel is a material.".into())]));
        let deps = bot_deps(model.clone());
        let channel = RecordingChannel::new();
        let request = TaskRequest::plain("what is pale steel", requester(), "english");

        run(&Intent::Unrecognized("image".into()), &deps, &channel, &request, &[])
            .await
            .unwrap();

        assert_eq!(
            channel.sent(),
            vec![
                UNRECOGNIZED_REPLY.to_string(),
                "The pale steel is a material.".to_string()
            ]
        );
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn extraction_is_retried_once() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("nope".into()),
            Ok(r#"{"user": "lady_dee"}"#.into()),
        ]));
        let deps = bot_deps(model.clone());

        let object = extract_with_retry(&deps, "target_user", "analyze lady_dee", &[])
            .await
            .unwrap();

        assert_eq!(string_field(&object, "user"), Some("lady_dee".into()));
        assert_eq!(model.requests().len(), 2);
        assert!(model.requests().iter().all(|r| r.json_mode));
    }

    #[test]
    fn error_reply_wraps_message() {
        assert_eq!(error_reply(&"boom"), "Error: boom. Please try again.");
    }

    #[tokio::test]
    async fn long_errors_are_reported_in_chunks() {
        let channel = RecordingChannel::new();
        let body = "x".repeat(4500);

        report_error(&channel, &body).await.unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|chunk| chunk.chars().count() <= 2000));
        assert_eq!(sent.concat(), error_reply(&body));
    }
}
