//! Image generation from the intent path and from `!image` / `!fantasy`.

use super::{TaskRequest, extract, report_error, string_field};
use crate::BotDeps;
use crate::error::{ImageError, Result};
use crate::images::{ImageRequest, ImageSize};
use crate::messaging::ChannelHandle;

pub const NO_IMAGE_REQUEST_REPLY: &str = "Sorry I didn't catch the image request, please try again.";
pub const IMAGE_APOLOGY: &str = "I couldn't generate the image, remember you need to keep it PG-13 and you can't ask for a celebrity/copyrighted stuff.";
pub const CENSORED_REPLY: &str = "Bummer dude, this has been censored 🙄";
pub const IMAGES_DISABLED_REPLY: &str = "Sorry, image generation is turned off.";

/// Extract `{image_request, size}` from the message, then generate and post the URL.
///
/// Failures after extraction are never shown raw.
pub async fn generate(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let Some(service) = &deps.images else {
        channel.send(IMAGES_DISABLED_REPLY).await?;
        return Ok(());
    };

    let object = extract(deps, "image_request", &request.text, images).await?;
    let prompt =
        string_field(&object, "image_request").filter(|prompt| !prompt.eq_ignore_ascii_case("none"));
    let Some(prompt) = prompt else {
        channel.send(NO_IMAGE_REQUEST_REPLY).await?;
        return Ok(());
    };
    let size = string_field(&object, "size")
        .map(|size| ImageSize::parse(&size))
        .unwrap_or_default();

    channel
        .send(&format!("*Generating image for prompt: {prompt}. Size: {size}*"))
        .await?;

    match service
        .generate_and_host(&ImageRequest::new(prompt).with_size(size))
        .await
    {
        Ok(url) => channel.send(&url).await?,
        Err(error) => {
            tracing::error!(%error, "image generation failed");
            channel.send(IMAGE_APOLOGY).await?;
        }
    }
    Ok(())
}

/// Split `prompt [negative]` into the prompt and the first bracketed negative prompt.
pub fn split_negative(args: &str) -> (String, Option<String>) {
    let (prompt, negative) = match args.find('[') {
        Some(open) => match args[open + 1..].find(']') {
            Some(length) => {
                let close = open + 1 + length;
                (
                    format!("{}{}", &args[..open], &args[close + 1..]),
                    Some(args[open + 1..close].trim().to_string()),
                )
            }
            None => (args.to_string(), None),
        },
        None => (args.to_string(), None),
    };

    let prompt = prompt
        .replace(['[', ']'], "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (prompt, negative.filter(|negative| !negative.is_empty()))
}

/// Bang-command image generation. `fantasy` selects the fantasy sampling preset.
pub async fn bang(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    args: &str,
    fantasy: bool,
) -> Result<()> {
    let Some(service) = &deps.images else {
        channel.send(IMAGES_DISABLED_REPLY).await?;
        return Ok(());
    };

    let (prompt, negative) = split_negative(args);
    if prompt.is_empty() {
        channel.send(NO_IMAGE_REQUEST_REPLY).await?;
        return Ok(());
    }
    tracing::info!(%prompt, negative = ?negative, fantasy, "generating image from command");

    let mut request = ImageRequest::new(prompt).with_negative(negative);
    if fantasy {
        request = request.fantasy();
    }

    match service.generate_and_host(&request).await {
        Ok(url) => channel.send(&url).await?,
        Err(ImageError::Censored) => channel.send(CENSORED_REPLY).await?,
        Err(error) => {
            tracing::error!(%error, "image generation failed");
            report_error(channel, &error).await?;
        }
    }
    Ok(())
}
