//! Splitting replies to the platform message limit.

use crate::error::MessagingError;
use crate::messaging::traits::ChannelHandle;
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Discord's per-message character limit.
pub const MESSAGE_LIMIT: usize = 2000;

static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<?(https?://[^\s<>]+)>?").expect("hardcoded URL pattern"));

static WRAPPED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<https?://[^\s<>]+>").expect("hardcoded URL pattern"));

/// Fixed-width split by characters.
///
/// `M` characters yield `ceil(M / limit)` chunks that concatenate back to the
/// input. The empty string yields no chunks.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(limit)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Wrap every URL in `<` `>` so the platform does not render link previews.
/// Already wrapped URLs are left alone.
pub fn wrap_urls(text: &str) -> String {
    BARE_URL
        .replace_all(text, |captures: &Captures| {
            let matched = &captures[0];
            if matched.starts_with('<') && matched.ends_with('>') {
                return matched.to_string();
            }
            let (url, trailing) = split_url_tail(&captures[1]);
            format!("<{url}>{trailing}")
        })
        .into_owned()
}

/// Split sentence punctuation and unbalanced closing parens off the end of a
/// URL, so `[src](https://a.com/x)` keeps its `)` outside the brackets.
fn split_url_tail(url: &str) -> (&str, &str) {
    let mut end = url.len();
    loop {
        let candidate = &url[..end];
        match candidate.chars().next_back() {
            Some('.' | ',' | ';' | ':' | '!' | '?' | '\'' | '"') => end -= 1,
            Some(')') if candidate.matches(')').count() > candidate.matches('(').count() => {
                end -= 1;
            }
            _ => break,
        }
    }
    url.split_at(end)
}

/// Wrap URLs, then split without cutting through a URL.
///
/// A URL longer than the limit on its own is still hard-cut.
pub fn chunk_reply(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let wrapped = wrap_urls(text);
    let chars: Vec<char> = wrapped.chars().collect();

    let char_offset = |byte_offset: usize| wrapped[..byte_offset].chars().count();
    let url_spans: Vec<(usize, usize)> = WRAPPED_URL
        .find_iter(&wrapped)
        .map(|found| (char_offset(found.start()), char_offset(found.end())))
        .collect();

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + limit).min(chars.len());
        if end < chars.len()
            && let Some(&(url_start, _)) = url_spans
                .iter()
                .find(|(url_start, url_end)| *url_start < end && end < *url_end)
            && url_start > start
        {
            end = url_start;
        }
        chunks.push(chars[start..end].iter().collect());
        start = end;
    }
    chunks
}

/// Send a generated reply: URLs wrapped, chunked, each send awaited in order.
pub async fn send_reply(channel: &dyn ChannelHandle, text: &str) -> Result<(), MessagingError> {
    for chunk in chunk_reply(text, MESSAGE_LIMIT) {
        channel.send(&chunk).await?;
    }
    Ok(())
}
