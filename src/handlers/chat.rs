//! Conversational handlers: translation, chat-aware answers, humor, help,
//! and the direct mode that skips routing.

use super::{TaskRequest, conversation_lines, generate, reply, transcript};
use crate::BotDeps;
use crate::error::Result;
use crate::messaging::ChannelHandle;
use crate::messaging::chunking::send_reply;

/// Translate the request. The reply always starts with `[DisplayName]`.
pub async fn translate(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let sender = &request.requester.display_name;
    let user_text = format!(
        "User name: {sender}.\n\n Content to translate: {} \n\n Language: {}\n\n Response:",
        request.text, request.language
    );
    let system_prompt = deps.prompts.render_static("translate")?;
    let translated = generate(deps, system_prompt, user_text, images).await?;

    let tag = format!("[{sender}]");
    let translated = translated.trim();
    let text = if translated.starts_with(&tag) {
        translated.to_string()
    } else {
        format!("{tag} {translated}")
    };
    send_reply(channel, &text).await?;
    Ok(())
}

/// Fun short answer with the deep channel history as context.
pub async fn about_chat(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let history = channel.recent_history(deps.config.bot.deep_history).await?;
    let user_text = format!(
        "Request: {}. Preferred language: {} \n\n Chat history: {} \n\n Response:",
        request.text,
        request.language,
        transcript(&history)
    );
    let system_prompt = deps.prompts.render_static("about_chat")?;
    reply(deps, channel, system_prompt, user_text, images).await
}

/// A witty remark on the last few messages.
pub async fn humor(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    _request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let history = channel.recent_history(deps.config.bot.humor_history).await?;
    let contents: Vec<&str> = history.iter().map(|message| message.content.as_str()).collect();
    let user_text = format!("Last couple of messages {contents:?}");
    let system_prompt = deps.prompts.render_static("humor")?;
    reply(deps, channel, system_prompt, user_text, images).await
}

/// Fixed greeting. No generation call.
pub async fn help(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    _images: &[String],
) -> Result<()> {
    let text = deps.prompts.render_help(&request.requester.display_name)?;
    channel.send(&text).await?;
    Ok(())
}

/// Answer with the persona and a few messages of history, no classification.
pub async fn direct(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let history = channel.recent_history(deps.config.bot.direct_history).await?;
    let reply_note = request
        .replying_to
        .as_deref()
        .map(|previous| format!("\n This is what you replied to the user before: '{previous}'\n"))
        .unwrap_or_default();
    let user_text = format!(
        "{}\n\n - For context, here is the conversation history so far: {} {reply_note}",
        request.text,
        conversation_lines(&history)
    );

    let generated = generate(deps, deps.config.bot.persona.clone(), user_text, images).await?;
    send_reply(channel, strip_quotes(&generated)).await?;
    Ok(())
}

/// Drop one pair of double quotes wrapping the whole reply.
fn strip_quotes(text: &str) -> &str {
    text.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(text)
}
