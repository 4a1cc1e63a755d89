//! Intent classification and structured-output extraction.

use crate::error::ClassificationError;
use crate::llm::routing::{RetryPolicy, retry};
use crate::llm::{CompletionRequest, LanguageModel};
use crate::prompts::{PromptEngine, compose};
use std::sync::Arc;

/// What an addressed message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Summarize,
    Gotc,
    WebSearch,
    Miscellaneous,
    Translate,
    AboutChat,
    AboutMe,
    AnalyzeUser,
    Humor,
    GenerateImage,
    Help,
    Calendar,
    None,
    /// A `todo` value outside the known set, kept verbatim.
    Unrecognized(String),
}

impl Intent {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "summarize" => Intent::Summarize,
            "gotc" => Intent::Gotc,
            "web_search" => Intent::WebSearch,
            "miscellaneous" => Intent::Miscellaneous,
            "translate" | "translation" => Intent::Translate,
            "about_chat" => Intent::AboutChat,
            "about_me" => Intent::AboutMe,
            "analyze_user" => Intent::AnalyzeUser,
            "humor" => Intent::Humor,
            "generate_image" => Intent::GenerateImage,
            "help" => Intent::Help,
            "calendar" => Intent::Calendar,
            "none" => Intent::None,
            _ => Intent::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Intent::Summarize => "summarize",
            Intent::Gotc => "gotc",
            Intent::WebSearch => "web_search",
            Intent::Miscellaneous => "miscellaneous",
            Intent::Translate => "translate",
            Intent::AboutChat => "about_chat",
            Intent::AboutMe => "about_me",
            Intent::AnalyzeUser => "analyze_user",
            Intent::Humor => "humor",
            Intent::GenerateImage => "generate_image",
            Intent::Help => "help",
            Intent::Calendar => "calendar",
            Intent::None => "none",
            Intent::Unrecognized(raw) => raw,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentDecision {
    pub intent: Intent,
    /// Language to reply in, e.g. "english".
    pub language: String,
}

/// Parse a JSON object out of model output. Anything else is malformed.
pub fn parse_object(
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ClassificationError> {
    match serde_json::from_str::<serde_json::Value>(raw.trim()) {
        Ok(serde_json::Value::Object(object)) => Ok(object),
        Ok(other) => Err(ClassificationError::Malformed(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(error) => Err(ClassificationError::Malformed(error.to_string())),
    }
}

/// Strict parse of the classifier output.
pub fn parse_decision(raw: &str) -> Result<IntentDecision, ClassificationError> {
    let object = parse_object(raw)?;
    let todo = object
        .get("todo")
        .and_then(serde_json::Value::as_str)
        .ok_or(ClassificationError::MissingField("todo"))?;

    let language = object
        .get("language")
        .and_then(serde_json::Value::as_str)
        .map(|language| language.trim().to_lowercase())
        .filter(|language| !language.is_empty())
        .unwrap_or_else(|| "english".to_string());

    Ok(IntentDecision {
        intent: Intent::parse(todo),
        language,
    })
}

/// One JSON-mode call returning the parsed object.
pub async fn structured_call(
    model: &dyn LanguageModel,
    model_name: &str,
    system_prompt: String,
    user_text: String,
    images: &[String],
) -> Result<serde_json::Map<String, serde_json::Value>, ClassificationError> {
    let request = CompletionRequest::new(model_name, compose(system_prompt, user_text, images)).json();
    let raw = model.complete(request).await?;
    parse_object(&raw)
}

/// Classifies addressed messages into an [`IntentDecision`].
#[derive(Clone)]
pub struct IntentRouter {
    model: Arc<dyn LanguageModel>,
    prompts: PromptEngine,
    model_name: String,
}

impl IntentRouter {
    pub fn new(model: Arc<dyn LanguageModel>, prompts: PromptEngine, model_name: String) -> Self {
        Self {
            model,
            prompts,
            model_name,
        }
    }

    /// Classify with exactly one retry on call or parse failure.
    pub async fn classify(&self, input: &str) -> Result<IntentDecision, ClassificationError> {
        let system_prompt = self
            .prompts
            .render_static("router")
            .map_err(|e| ClassificationError::Malformed(e.to_string()))?;

        let system_prompt = &system_prompt;
        let decision = retry(RetryPolicy::once(), "classify", || async move {
            let request = CompletionRequest::new(
                self.model_name.clone(),
                compose(system_prompt.clone(), input.to_string(), &[]),
            )
            .json();
            let raw = self.model.complete(request).await?;
            parse_decision(&raw)
        })
        .await?;

        tracing::info!(
            intent = %decision.intent,
            language = %decision.language,
            "classified message"
        );
        Ok(decision)
    }
}
