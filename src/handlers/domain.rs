//! Questions answered from the corpus, the web, or the calendar image.

use super::{TaskRequest, generate, reply};
use crate::error::Result;
use crate::messaging::ChannelHandle;
use crate::retrieval::retrieve;
use crate::{BotDeps, search};

/// Sent for calendar requests when no calendar image is configured.
pub const NO_CALENDAR_REPLY: &str = "Sorry, there is no calendar to show right now.";

fn domain_query(deps: &BotDeps, text: &str) -> String {
    format!("{text} {}", deps.config.bot.domain_search_suffix)
        .trim()
        .to_string()
}

/// Rewrite the question into a standalone query using what the images show.
async fn rephrase(deps: &BotDeps, text: &str, images: &[String]) -> Result<String> {
    let system_prompt = deps.prompts.render_static("rephrase")?;
    let query = generate(deps, system_prompt, text.to_string(), images).await?;
    tracing::debug!(%query, "rephrased question from images");
    Ok(query)
}

/// Domain Q&A. Uses the retrieval corpus when one is loaded, web search otherwise.
pub async fn answer(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let system_prompt = deps.prompts.render_static("domain")?;

    let user_text = match &deps.index {
        Some(index) => {
            let query = if images.is_empty() {
                request.text.clone()
            } else {
                rephrase(deps, &request.text, images).await?
            };
            let retrieval = &deps.config.retrieval;
            let retrieved = retrieve(
                index,
                deps.embedder.as_ref(),
                &query,
                retrieval.top_k,
                retrieval.context_limit,
                deps.embed_policy(),
            )
            .await?;
            let prompt =
                deps.prompts
                    .render_retrieval(&retrieved.text, &retrieved.sources, &request.text)?;
            format!("{prompt}\n Preferred language: {}", request.language)
        }
        None => {
            let results = deps.search.search(&domain_query(deps, &request.text)).await;
            let rendered = search::render(results.as_ref());
            if images.is_empty() {
                format!(
                    "{}. Acknowledge user sending that made request: {}\n Preferred language: {}\n\n Web results: {rendered}",
                    request.text, request.requester.display_name, request.language
                )
            } else {
                format!(
                    "Original question: {}.\n Preferred language: {}\n\n Additional web results that might or might not help (ignore if not relevant): {rendered}",
                    request.text, request.language
                )
            }
        }
    };

    reply(deps, channel, system_prompt, user_text, images).await
}

/// Answer from a web search on the raw question.
pub async fn web_search(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let results = deps.search.search(&request.text).await;
    let user_text = format!(
        "Answer question based on the search results. Question: {}. Preferred language: {} \n\n Web results: {}",
        request.text,
        request.language,
        search::render(results.as_ref())
    );
    let system_prompt = deps.prompts.render_static("web_search")?;
    reply(deps, channel, system_prompt, user_text, images).await
}

/// General chat, with domain web results offered in case they help.
pub async fn miscellaneous(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let results = deps.search.search(&domain_query(deps, &request.text)).await;
    let user_text = format!(
        "{}\n Preferred language: {}\n\n Web results: {} \n\n Response:",
        request.text,
        request.language,
        search::render(results.as_ref())
    );
    let system_prompt = deps.prompts.render_static("miscellaneous")?;
    reply(deps, channel, system_prompt, user_text, images).await
}

/// Answer from the calendar image, then always post the calendar link.
pub async fn calendar(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let Some(calendar_url) = deps.config.bot.calendar_url.as_deref() else {
        channel.send(NO_CALENDAR_REPLY).await?;
        return Ok(());
    };

    let mut images = images.to_vec();
    images.push(calendar_url.to_string());

    let system_prompt = deps.prompts.render_static("miscellaneous")?;
    let user_text = deps
        .prompts
        .render_calendar(&request.text, request.received_at)?;
    reply(deps, channel, system_prompt, user_text, &images).await?;

    channel.send(calendar_url).await?;
    Ok(())
}
