//! Personality ratings built from a user's recent comments.

use super::{TaskRequest, extract, reply, string_field};
use crate::BotDeps;
use crate::error::Result;
use crate::messaging::ChannelHandle;

pub const NO_OWN_COMMENTS_REPLY: &str =
    "Sorry, I couldn't find any comments from you to analyze. Please try again.";
pub const NO_TARGET_REPLY: &str =
    "Sorry I didn't catch the user you want me to analyze, please try again.";
pub const NO_USER_COMMENTS_REPLY: &str =
    "Sorry, I couldn't find any comments from the user to analyze. Please try again.";

/// Categories the requester asked for, or the configured default list.
async fn rating_categories(deps: &BotDeps, text: &str) -> String {
    let requested = match extract(deps, "rating_categories", text, &[]).await {
        Ok(object) => string_field(&object, "special_categories"),
        Err(error) => {
            tracing::warn!(%error, "failed to extract rating categories, using defaults");
            None
        }
    };
    requested.unwrap_or_else(|| deps.config.bot.default_rating_categories.clone())
}

/// Language named in free text, `english` when none is found.
pub async fn preferred_language(deps: &BotDeps, text: &str) -> String {
    let language = match extract(deps, "preferred_language", text, &[]).await {
        Ok(object) => string_field(&object, "language"),
        Err(error) => {
            tracing::warn!(%error, "failed to extract preferred language");
            None
        }
    };
    language
        .map(|language| language.to_lowercase())
        .unwrap_or_else(|| "english".to_string())
}

async fn rate(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    subject: &str,
    comments: &[String],
    categories: &str,
    language: &str,
    images: &[String],
) -> Result<()> {
    tracing::info!(subject, comments = comments.len(), "rating user");
    let user_text = format!(
        "Categories to rate user in based on their comments: {categories} \n\n User comment history: \
         Analyze user {subject} based on their recent comments. Preferred language: {language}, comments: {} \n\n Answer:",
        comments.join(" ")
    );
    let system_prompt = deps.prompts.render_static("rating")?;
    reply(deps, channel, system_prompt, user_text, images).await
}

/// Rate the requester.
pub async fn about_me(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let history = channel.recent_history(deps.config.bot.deep_history).await?;
    let comments: Vec<String> = history
        .into_iter()
        .filter(|message| message.author_id == request.requester.id)
        .map(|message| message.content)
        .collect();
    if comments.is_empty() {
        channel.send(NO_OWN_COMMENTS_REPLY).await?;
        return Ok(());
    }

    let categories = rating_categories(deps, &request.text).await;
    rate(
        deps,
        channel,
        &request.requester.username,
        &comments,
        &categories,
        &request.language,
        images,
    )
    .await
}

/// Rate another user, named by username in the request.
pub async fn analyze_user(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let target = match extract(deps, "target_user", &request.text_with_usernames, &[]).await {
        Ok(object) => {
            string_field(&object, "user").filter(|user| !user.eq_ignore_ascii_case("none"))
        }
        Err(error) => {
            tracing::warn!(%error, "failed to extract target user");
            None
        }
    };
    let Some(target) = target else {
        channel.send(NO_TARGET_REPLY).await?;
        return Ok(());
    };

    channel
        .send(&format!("Analyzing user: {target}, in {}", request.language))
        .await?;

    let history = channel.recent_history(deps.config.bot.deep_history).await?;
    let comments: Vec<String> = history
        .into_iter()
        .filter(|message| message.author_username.eq_ignore_ascii_case(&target))
        .map(|message| message.content)
        .collect();
    if comments.is_empty() {
        channel.send(NO_USER_COMMENTS_REPLY).await?;
        return Ok(());
    }

    let categories = rating_categories(deps, &request.text_with_usernames).await;
    rate(
        deps,
        channel,
        &target,
        &comments,
        &categories,
        &request.language,
        images,
    )
    .await
}
