use crate::config::BotConfig;
use crate::error::Result;
use crate::llm::model::{ChatMessage, ContentPart, ImageUrl, MessageContent, Role};
use anyhow::Context as _;
use minijinja::{Environment, Value, context};
use std::sync::Arc;

const TEMPLATES: &[(&str, &str)] = &[
    ("router", include_str!("../../prompts/router.md.j2")),
    ("summarize_params", include_str!("../../prompts/summarize_params.md.j2")),
    ("summarize", include_str!("../../prompts/summarize.md.j2")),
    ("target_user", include_str!("../../prompts/target_user.md.j2")),
    ("image_request", include_str!("../../prompts/image_request.md.j2")),
    ("rating_categories", include_str!("../../prompts/rating_categories.md.j2")),
    ("preferred_language", include_str!("../../prompts/preferred_language.md.j2")),
    ("web_search", include_str!("../../prompts/web_search.md.j2")),
    ("miscellaneous", include_str!("../../prompts/miscellaneous.md.j2")),
    ("domain", include_str!("../../prompts/domain.md.j2")),
    ("rephrase", include_str!("../../prompts/rephrase.md.j2")),
    ("humor", include_str!("../../prompts/humor.md.j2")),
    ("rating", include_str!("../../prompts/rating.md.j2")),
    ("translate", include_str!("../../prompts/translate.md.j2")),
    ("about_chat", include_str!("../../prompts/about_chat.md.j2")),
    ("retrieval", include_str!("../../prompts/retrieval.md.j2")),
    ("help", include_str!("../../prompts/help.md.j2")),
    ("calendar", include_str!("../../prompts/calendar.md.j2")),
];

/// Template engine for system prompts and fixed replies.
///
/// Templates are compiled into the binary. The bot name, persona and domain
/// are registered as globals so every template can use them.
#[derive(Clone)]
pub struct PromptEngine {
    env: Arc<Environment<'static>>,
}

impl PromptEngine {
    pub fn new(bot: &BotConfig) -> Result<Self> {
        let mut env = Environment::new();
        for &(name, source) in TEMPLATES {
            env.add_template(name, source)
                .with_context(|| format!("failed to compile template '{name}'"))?;
        }
        env.add_global("bot_name", bot.name.clone());
        env.add_global("persona", bot.persona.clone());
        env.add_global("domain", bot.domain.clone());

        Ok(Self { env: Arc::new(env) })
    }

    /// Render a template by name with the given context variables.
    pub fn render(&self, template_name: &str, context: Value) -> Result<String> {
        let template = self
            .env
            .get_template(template_name)
            .with_context(|| format!("template '{template_name}' not found"))?;

        template
            .render(context)
            .with_context(|| format!("failed to render template '{template_name}'"))
            .map_err(Into::into)
    }

    /// Render a template that only needs the globals.
    pub fn render_static(&self, template_name: &str) -> Result<String> {
        self.render(template_name, Value::UNDEFINED)
    }

    pub fn render_retrieval(&self, context: &str, sources: &[String], question: &str) -> Result<String> {
        self.render(
            "retrieval",
            context! {
                context => context,
                sources => sources,
                question => question,
            },
        )
    }

    pub fn render_help(&self, user: &str) -> Result<String> {
        self.render("help", context! { user => user.trim() })
    }

    pub fn render_calendar(&self, query: &str, now: chrono::DateTime<chrono::Utc>) -> Result<String> {
        self.render(
            "calendar",
            context! {
                query => query,
                date => now.format("%Y-%m-%d").to_string(),
                weekday => now.format("%A").to_string(),
            },
        )
    }
}

/// Build the role-tagged payload for one generation call.
///
/// Without images the user message is a plain string. With images it becomes
/// a text part followed by one image part per URL.
pub fn compose(system_prompt: String, user_text: String, images: &[String]) -> Vec<ChatMessage> {
    let user_content = if images.is_empty() {
        MessageContent::Text(user_text)
    } else {
        let mut parts = Vec::with_capacity(images.len() + 1);
        parts.push(ContentPart::Text { text: user_text });
        parts.extend(images.iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.clone() },
        }));
        MessageContent::Parts(parts)
    };

    vec![
        ChatMessage::system(system_prompt),
        ChatMessage {
            role: Role::User,
            content: user_content,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn engine() -> PromptEngine {
        PromptEngine::new(&BotConfig::default()).unwrap()
    }

    #[test]
    fn every_template_renders() {
        let engine = engine();
        let fixture = context! {
            user => "Ser Pounce",
            query => "show calendar",
            date => "2024-05-17",
            weekday => "Friday",
            context => "some context",
            sources => vec!["wiki/a"],
            question => "what?",
        };
        for &(name, _) in TEMPLATES {
            let rendered = engine.render(name, fixture.clone()).unwrap();
            assert!(!rendered.trim().is_empty(), "template {name} rendered empty");
        }
    }

    #[test]
    fn router_prompt_names_the_bot() {
        let rendered = engine().render_static("router").unwrap();
        assert!(rendered.contains("examplebot que es el pale steel?"));
        assert!(rendered.contains(r#"{"todo": "translate", "language": "french"}"#));
    }

    #[test]
    fn retrieval_prompt_lists_sources_in_order() {
        let rendered = engine()
            .render_retrieval(
                "steel is forged",
                &["wiki/steel".to_string(), "wiki/forge".to_string()],
                "what is pale steel?",
            )
            .unwrap();
        assert!(rendered.contains("Context:\n steel is forged"));
        assert!(rendered.contains("Sources: wiki/steel, wiki/forge Question: what is pale steel?"));
        assert!(rendered.ends_with("Answer:"));
    }

    #[test]
    fn help_greets_by_trimmed_name() {
        let rendered = engine().render_help("  Ser Pounce ").unwrap();
        assert!(rendered.starts_with("Hi Ser Pounce! I am examplebot,"));
    }

    #[test]
    fn calendar_prompt_includes_date_and_weekday() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap();
        let rendered = engine().render_calendar("show calendar", now).unwrap();
        assert!(rendered.contains("USER QUERY: show calendar"));
        assert!(rendered.contains("Today is 2024-05-17, the day of the week is Friday."));
    }

    #[test]
    fn compose_without_images_uses_plain_text() {
        let messages = compose("system".into(), "hello".into(), &[]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, MessageContent::Text("hello".into()));
    }

    #[test]
    fn compose_with_images_appends_image_parts() {
        let images = vec![
            "https://cdn.example.com/1.png".to_string(),
            "https://cdn.example.com/2.png".to_string(),
        ];
        let messages = compose("system".into(), "look".into(), &images);

        let MessageContent::Parts(parts) = &messages[1].content else {
            panic!("expected content parts");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], ContentPart::Text { text: "look".into() });
        assert_eq!(messages[1].image_urls(), vec![
            "https://cdn.example.com/1.png",
            "https://cdn.example.com/2.png"
        ]);
    }
}
