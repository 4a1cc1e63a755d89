//! Channel summaries over a requested time window.

use super::{TaskRequest, extract_with_retry, reply, report_error, string_field, transcript};
use crate::error::Result;
use crate::messaging::ChannelHandle;
use crate::{BotDeps, HistoryMessage};
use chrono::{DateTime, TimeDelta, Utc};

const MAX_DAYS: i64 = 36_500;
const MAX_HOURS: i64 = MAX_DAYS * 24;

/// How far back to summarize, and any special instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryWindow {
    pub days: i64,
    pub hours: i64,
    pub special: Option<String>,
}

impl SummaryWindow {
    /// Read `{days, hours, special}`. Numbers may be JSON numbers or numeric
    /// strings; anything else counts as zero.
    pub fn from_object(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            days: whole_number(object.get("days")).clamp(0, MAX_DAYS),
            hours: whole_number(object.get("hours")).clamp(0, MAX_HOURS),
            special: string_field(object, "special"),
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - TimeDelta::days(self.days) - TimeDelta::hours(self.hours)
    }
}

fn whole_number(value: Option<&serde_json::Value>) -> i64 {
    match value {
        Some(serde_json::Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .unwrap_or(0),
        Some(serde_json::Value::String(text)) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().map(|float| float as i64))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

/// Instructions followed by the transcript.
pub fn summary_prompt(
    window: &SummaryWindow,
    language: &str,
    requester: &str,
    history: &[HistoryMessage],
) -> String {
    let instructions = match &window.special {
        Some(special) => format!(
            "Summarize conversation, keep it extremely short. FOLLOW SPECIAL INSTRUCTIONS AT ALL COSTS: {special}\n Preferred language: {language}\n. Acknowledge user sending that made request: {requester}\n"
        ),
        None => format!(
            "Summarize conversation, please keep it extremely short.\n Preferred language: {language}\n"
        ),
    };
    instructions + &transcript(history)
}

pub async fn summarize(
    deps: &BotDeps,
    channel: &dyn ChannelHandle,
    request: &TaskRequest,
    images: &[String],
) -> Result<()> {
    let object = match extract_with_retry(deps, "summarize_params", &request.text, &[]).await {
        Ok(object) => object,
        Err(error) => {
            tracing::error!(%error, "failed to extract summary window");
            report_error(channel, &error).await?;
            return Ok(());
        }
    };

    let window = SummaryWindow::from_object(&object);
    let after = window.cutoff(request.received_at);
    let history = channel
        .history_since(after, deps.config.bot.summary_max_messages)
        .await?;
    tracing::info!(
        days = window.days,
        hours = window.hours,
        messages = history.len(),
        "summarizing channel"
    );

    let user_text = summary_prompt(
        &window,
        &request.language,
        &request.requester.display_name,
        &history,
    );
    let system_prompt = deps.prompts.render_static("summarize")?;
    reply(deps, channel, system_prompt, user_text, images).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::testing::{RecordingChannel, ScriptedModel, base_time, bot_deps, history, requester};
    use std::sync::Arc;

    fn window(raw: &str) -> SummaryWindow {
        let value: serde_json::Value = serde_json::from_str(raw).unwrap();
        SummaryWindow::from_object(value.as_object().unwrap())
    }

    #[test]
    fn window_accepts_numbers_and_numeric_strings() {
        assert_eq!(
            window(r#"{"days": "1", "hours": 5, "special": ""}"#),
            SummaryWindow {
                days: 1,
                hours: 5,
                special: None
            }
        );
        assert_eq!(
            window(r#"{"days": 2.0, "hours": " 3 ", "special": "as a rap"}"#),
            SummaryWindow {
                days: 2,
                hours: 3,
                special: Some("as a rap".into())
            }
        );
        assert_eq!(window(r#"{"days": "soon", "hours": -4}"#).hours, 0);
        assert_eq!(window(r#"{"days": "soon"}"#).days, 0);
    }

    #[test]
    fn cutoff_subtracts_days_and_hours() {
        let cutoff = window(r#"{"days": 1, "hours": 3}"#).cutoff(base_time());
        assert_eq!(cutoff, base_time() - TimeDelta::hours(27));
    }

    #[test]
    fn special_instructions_acknowledge_requester() {
        let history = vec![history(0, 2, "lady_dee", "Lady Dee", "gg")];
        let prompt = summary_prompt(
            &window(r#"{"special": "as a haiku"}"#),
            "english",
            "Ser Pounce",
            &history,
        );
        assert!(prompt.starts_with(
            "Summarize conversation, keep it extremely short. FOLLOW SPECIAL INSTRUCTIONS AT ALL COSTS: as a haiku\n"
        ));
        assert!(prompt.contains("Acknowledge user sending that made request: Ser Pounce\n"));
        assert!(prompt.ends_with("[2024-05-17 12:00:00+00:00] lady_dee: gg\n"));
    }

    #[tokio::test]
    async fn summarizes_messages_after_cutoff() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(r#"{"days": "0", "hours": "1", "special": ""}"#.into()),
            Ok("- nothing much happened".into()),
        ]));
        let deps = bot_deps(model.clone());
        let channel = RecordingChannel::with_history(vec![
            history(0, 2, "lady_dee", "Lady Dee", "too old"),
            history(3 * 3600, 2, "lady_dee", "Lady Dee", "recent"),
        ]);
        let mut request = TaskRequest::plain("summarize the last hour", requester(), "english");
        request.received_at = base_time() + TimeDelta::hours(3) + TimeDelta::minutes(30);

        summarize(&deps, &channel, &request, &[]).await.unwrap();

        let requests = model.requests();
        assert!(requests[0].json_mode);
        let user_text = requests[1].messages[1].text();
        assert!(user_text.contains("recent"));
        assert!(!user_text.contains("too old"));
        assert_eq!(channel.sent(), vec!["- nothing much happened".to_string()]);
    }

    #[tokio::test]
    async fn two_failed_extractions_abort_with_error() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("not json".into()),
            Err(LlmError::EmptyResponse),
        ]));
        let deps = bot_deps(model.clone());
        let channel = RecordingChannel::new();
        let request = TaskRequest::plain("summarize", requester(), "english");

        summarize(&deps, &channel, &request, &[]).await.unwrap();

        assert_eq!(model.requests().len(), 2);
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("Error: "));
        assert!(sent[0].ends_with(". Please try again."));
    }
}
