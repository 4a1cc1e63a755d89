//! Entry point for inbound chat messages.
//!
//! A message is either a bang-command (answered without the classifier), a
//! message addressed to the bot (classified, then handed to a task handler),
//! or ignored.

use crate::config::RoutingMode;
use crate::error::Result;
use crate::handlers::{self, TaskRequest, chat, conversation_lines, domain, image, report_error};
use crate::messaging::ChannelHandle;
use crate::{Author, BotDeps, InboundMessage};

const CHART_MENU: &str = include_str!("../prompts/menus/charts.md");
const HERO_MENU: &str = include_str!("../prompts/menus/heroes.md");

/// A `!`-prefixed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BangCommand {
    ChartMenu,
    HeroMenu,
    Calendar,
    Image { args: String, fantasy: bool },
    /// Reserved names that get no answer.
    Ignored,
    /// Any other name, looked up in the asset map.
    Asset(String),
}

/// Parse a bang-command. Returns `None` for messages without a leading `!`.
pub fn parse_bang(content: &str) -> Option<BangCommand> {
    let rest = content.trim().strip_prefix('!')?;
    let (word, args) = match rest.split_once(char::is_whitespace) {
        Some((word, args)) => (word, args.trim()),
        None => (rest, ""),
    };

    let command = match word.to_lowercase().as_str() {
        "" | "fu" => BangCommand::Ignored,
        "help" => BangCommand::ChartMenu,
        "hero" | "heroes" if args.is_empty() => BangCommand::HeroMenu,
        // `!heroes ...` is reserved, `!hero ...` falls through to assets
        "heroes" => BangCommand::Ignored,
        "calendar" | "calender" => BangCommand::Calendar,
        "image" => BangCommand::Image {
            args: args.to_string(),
            fantasy: false,
        },
        "fantasy" => BangCommand::Image {
            args: args.to_string(),
            fantasy: true,
        },
        name => BangCommand::Asset(name.to_string()),
    };
    Some(command)
}

/// Whether `name` appears as a word followed by a space, a comma, other
/// punctuation, or the end of the text. Case-insensitive.
pub fn addressed_by_name(content: &str, name: &str) -> bool {
    let content = content.to_lowercase();
    let name = name.to_lowercase();
    content.match_indices(name.as_str()).any(|(start, _)| {
        let before = content[..start].chars().next_back();
        let after = content[start + name.len()..].chars().next();
        let starts_word = !before.is_some_and(|c| c.is_alphanumeric() || c == '_');
        let ends_word = after.is_none_or(|c| c.is_whitespace() || (c.is_ascii_punctuation() && c != '_'));
        starts_word && ends_word
    })
}

/// Replace `<@id>` and `<@!id>` with the name picked by `name_of`.
pub fn resolve_mentions<F>(content: &str, mentions: &[Author], name_of: F) -> String
where
    F: Fn(&Author) -> &str,
{
    let mut resolved = content.to_string();
    for user in mentions {
        let name = name_of(user);
        resolved = resolved
            .replace(&format!("<@{}>", user.id), name)
            .replace(&format!("<@!{}>", user.id), name);
    }
    resolved
}

/// Text given to the classifier: the message, recent history and, for
/// replies, the bot message being replied to.
pub fn router_input(text: &str, history_lines: &str, replying_to: Option<&str>) -> String {
    match replying_to {
        Some(previous) => format!(
            "{text}\n Conversation history: {history_lines}\n User replied to your previous message: \
             \n This is what you replied to the user before: '{previous}'\n"
        ),
        None => format!("{text}\n Conversation history: {history_lines}"),
    }
}

/// Routes inbound messages to bang-commands or task handlers.
pub struct Dispatcher {
    deps: BotDeps,
}

impl Dispatcher {
    pub fn new(deps: BotDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &BotDeps {
        &self.deps
    }

    /// Handle one message. Failures are logged and answered in the channel.
    pub async fn handle(&self, message: &InboundMessage, channel: &dyn ChannelHandle) {
        if let Err(error) = self.dispatch(message, channel).await {
            tracing::error!(%error, message_id = message.id, "failed to handle message");
            if let Err(send_error) = report_error(channel, &error).await {
                tracing::warn!(%send_error, "failed to report error to channel");
            }
        }
    }

    /// Whether messages from `guild_id` are served. An empty allowlist serves every guild.
    pub fn guild_allowed(&self, guild_id: Option<u64>) -> bool {
        let allowed = &self.deps.config.bot.allowed_guilds;
        allowed.is_empty() || guild_id.is_some_and(|id| allowed.contains(&id))
    }

    fn is_addressed(&self, message: &InboundMessage, text: &str) -> bool {
        message.mentions_bot
            || message.reply_to_bot.is_some()
            || addressed_by_name(text, &self.deps.config.bot.name)
    }

    async fn dispatch(&self, message: &InboundMessage, channel: &dyn ChannelHandle) -> Result<()> {
        if !self.guild_allowed(message.guild_id) {
            tracing::debug!(guild_id = ?message.guild_id, "ignoring message from guild not in allowlist");
            return Ok(());
        }

        let text = resolve_mentions(&message.content, &message.mentions, |user| {
            user.display_name.as_str()
        });

        if let Some(command) = parse_bang(&text) {
            return self.run_bang(command, channel).await;
        }

        if !self.is_addressed(message, &text) {
            return Ok(());
        }

        let request = TaskRequest {
            text_with_usernames: resolve_mentions(&message.content, &message.mentions, |user| {
                user.username.as_str()
            }),
            text,
            requester: message.author.clone(),
            language: "english".into(),
            replying_to: message.reply_to_bot.clone(),
            received_at: message.timestamp,
        };
        let images = message.image_urls();

        match self.deps.config.bot.mode {
            RoutingMode::Direct => chat::direct(&self.deps, channel, &request, &images).await,
            RoutingMode::Intent => self.route(channel, request, &images).await,
        }
    }

    async fn route(
        &self,
        channel: &dyn ChannelHandle,
        mut request: TaskRequest,
        images: &[String],
    ) -> Result<()> {
        let history = channel
            .recent_history(self.deps.config.bot.router_history)
            .await?;
        let input = router_input(
            &request.text,
            &conversation_lines(&history),
            request.replying_to.as_deref(),
        );

        let decision = match self.deps.router.classify(&input).await {
            Ok(decision) => decision,
            Err(error) => {
                tracing::error!(%error, "classification failed, giving up");
                report_error(channel, &error).await?;
                return Ok(());
            }
        };
        request.language = decision.language;
        handlers::run(&decision.intent, &self.deps, channel, &request, images).await
    }

    async fn run_bang(&self, command: BangCommand, channel: &dyn ChannelHandle) -> Result<()> {
        tracing::debug!(?command, "bang command");
        match command {
            BangCommand::ChartMenu => channel.send(CHART_MENU).await?,
            BangCommand::HeroMenu => channel.send(HERO_MENU).await?,
            BangCommand::Calendar => match &self.deps.config.bot.calendar_url {
                Some(url) => {
                    channel.send("Here it is").await?;
                    channel.send(url).await?;
                }
                None => channel.send(domain::NO_CALENDAR_REPLY).await?,
            },
            BangCommand::Image { args, fantasy } => {
                image::bang(&self.deps, channel, &args, fantasy).await?;
            }
            BangCommand::Ignored => {}
            BangCommand::Asset(name) => match self.deps.assets.lookup(&name).await {
                Ok(urls) if urls.is_empty() => {
                    tracing::debug!(%name, "no asset for command");
                }
                Ok(urls) => {
                    for url in urls {
                        channel.send(&url).await?;
                    }
                }
                Err(error) => {
                    tracing::error!(%error, %name, "failed to list assets");
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetResolver;
    use crate::config::Config;
    use crate::error::LlmError;
    use crate::testing::{
        MemoryStore, RecordingChannel, ScriptedModel, base_time, bot_deps, history, requester,
    };
    use std::path::PathBuf;
    use std::sync::Arc;

    fn lady_dee() -> Author {
        Author {
            id: 22,
            username: "lady_dee".into(),
            display_name: "Lady Dee".into(),
        }
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            id: 100,
            channel_id: 7,
            guild_id: Some(5),
            author: requester(),
            content: content.into(),
            mentions: Vec::new(),
            attachments: Vec::new(),
            mentions_bot: false,
            reply_to_bot: None,
            timestamp: base_time(),
        }
    }

    fn with_config(deps: &mut crate::BotDeps, toml: &str) {
        deps.config = Arc::new(Config::from_toml_str(toml, PathBuf::from("/tmp/taproom-test")).unwrap());
    }

    #[test]
    fn bang_commands_are_recognized() {
        assert_eq!(parse_bang("!help"), Some(BangCommand::ChartMenu));
        assert_eq!(parse_bang("  !Heroes "), Some(BangCommand::HeroMenu));
        assert_eq!(parse_bang("!hero"), Some(BangCommand::HeroMenu));
        assert_eq!(parse_bang("!heroes please"), Some(BangCommand::Ignored));
        assert_eq!(parse_bang("!hero cavalry"), Some(BangCommand::Asset("hero".into())));
        assert_eq!(parse_bang("!calender"), Some(BangCommand::Calendar));
        assert_eq!(
            parse_bang("!fantasy An Elf [ugly]"),
            Some(BangCommand::Image {
                args: "An Elf [ugly]".into(),
                fantasy: true
            })
        );
        assert_eq!(parse_bang("!fu you"), Some(BangCommand::Ignored));
        assert_eq!(parse_bang("!"), Some(BangCommand::Ignored));
        assert_eq!(parse_bang("!Wall please"), Some(BangCommand::Asset("wall".into())));
        assert_eq!(parse_bang("hello !wall"), None);
    }

    #[test]
    fn name_must_be_a_whole_word() {
        assert!(addressed_by_name("Examplebot, translate this", "examplebot"));
        assert!(addressed_by_name("hey examplebot what's up", "examplebot"));
        assert!(addressed_by_name("thanks examplebot", "examplebot"));
        assert!(addressed_by_name("thanks examplebot!", "examplebot"));
        assert!(!addressed_by_name("examplebots are great", "examplebot"));
        assert!(!addressed_by_name("notexamplebot, hi", "examplebot"));
        assert!(!addressed_by_name("nothing to see", "examplebot"));
    }

    #[test]
    fn mentions_resolve_to_either_name() {
        let mentions = vec![lady_dee()];
        let content = "ask <@22> and <@!22>";
        assert_eq!(
            resolve_mentions(content, &mentions, |user| user.display_name.as_str()),
            "ask Lady Dee and Lady Dee"
        );
        assert_eq!(
            resolve_mentions(content, &mentions, |user| user.username.as_str()),
            "ask lady_dee and lady_dee"
        );
    }

    #[test]
    fn reply_note_is_added_to_router_input() {
        assert_eq!(router_input("hi", "(12:00 PM) A: yo", None), "hi\n Conversation history: (12:00 PM) A: yo");
        assert!(router_input("hi", "", Some("Earlier answer")).ends_with(
            "This is what you replied to the user before: 'Earlier answer'\n"
        ));
    }

    #[tokio::test]
    async fn translate_request_end_to_end() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(r#"{"todo": "translate", "language": "french"}"#.into()),
            Ok("Bonjour".into()),
        ]));
        let dispatcher = Dispatcher::new(bot_deps(model.clone()));
        let channel = RecordingChannel::with_history(vec![history(-60, 22, "lady_dee", "Lady Dee", "morning all")]);

        dispatcher
            .handle(&inbound("examplebot, translate 'good morning' to french"), &channel)
            .await;

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("[Ser Pounce]"));

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].json_mode);
        assert_eq!(requests[0].model, dispatcher.deps().config.llm.router_model);
        let router_text = requests[0].messages[1].text();
        assert!(router_text.starts_with("examplebot, translate 'good morning' to french\n Conversation history: "));
        assert!(router_text.contains("Lady Dee: morning all"));
        assert!(requests[1].messages[1].text().contains("Language: french"));
    }

    #[tokio::test]
    async fn two_failed_classifications_abort_without_generation() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("not json at all".into()),
            Err(LlmError::EmptyResponse),
        ]));
        let dispatcher = Dispatcher::new(bot_deps(model.clone()));
        let channel = RecordingChannel::new();

        dispatcher.handle(&inbound("examplebot what is the meta"), &channel).await;

        assert_eq!(model.requests().len(), 2);
        assert!(model.requests().iter().all(|request| request.json_mode));
        assert_eq!(
            channel.sent(),
            vec!["Error: classifier call failed: empty response from provider. Please try again.".to_string()]
        );
    }

    #[tokio::test]
    async fn unaddressed_message_is_ignored() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let dispatcher = Dispatcher::new(bot_deps(model.clone()));
        let channel = RecordingChannel::new();

        dispatcher.handle(&inbound("anyone up for a rally?"), &channel).await;

        assert!(channel.sent().is_empty());
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn reply_to_bot_is_addressed_and_quoted() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(r#"{"todo": "none", "language": "english"}"#.into()),
        ]));
        let dispatcher = Dispatcher::new(bot_deps(model.clone()));
        let channel = RecordingChannel::new();
        let mut message = inbound("and what about cavalry?");
        message.reply_to_bot = Some("Infantry is strong this season.".into());

        dispatcher.handle(&message, &channel).await;

        assert!(model.requests()[0].messages[1]
            .text()
            .contains("This is what you replied to the user before: 'Infantry is strong this season.'"));
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn mention_of_bot_addresses_it() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(r#"{"todo": "help", "language": "english"}"#.into()),
        ]));
        let dispatcher = Dispatcher::new(bot_deps(model));
        let channel = RecordingChannel::new();
        let mut message = inbound("<@999> what can you do");
        message.mentions_bot = true;

        dispatcher.handle(&message, &channel).await;

        assert!(channel.sent()[0].starts_with("Hi Ser Pounce!"));
    }

    #[tokio::test]
    async fn guild_outside_allowlist_is_ignored() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let mut deps = bot_deps(model.clone());
        with_config(&mut deps, "[bot]\nallowed_guilds = [42]\n");
        let dispatcher = Dispatcher::new(deps);
        let channel = RecordingChannel::new();

        dispatcher.handle(&inbound("examplebot hi"), &channel).await;
        dispatcher.handle(&inbound("!help"), &channel).await;

        assert!(channel.sent().is_empty());
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn asset_command_posts_every_url() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let mut deps = bot_deps(model.clone());
        let store = Arc::new(MemoryStore::with_keys(
            "https://bucket.example.com",
            &["gotc/wall.png", "gotc/season1/a.png", "gotc/season1/b.png"],
        ));
        deps.assets = Arc::new(AssetResolver::new(store, &deps.config.storage));
        let dispatcher = Dispatcher::new(deps);
        let channel = RecordingChannel::new();

        dispatcher.handle(&inbound("!Season1"), &channel).await;
        dispatcher.handle(&inbound("!wall"), &channel).await;
        dispatcher.handle(&inbound("!unknown"), &channel).await;

        assert_eq!(
            channel.sent(),
            vec![
                "https://bucket.example.com/gotc/season1/a.png".to_string(),
                "https://bucket.example.com/gotc/season1/b.png".to_string(),
                "https://bucket.example.com/gotc/wall.png".to_string(),
            ]
        );
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn bang_commands_skip_the_router_even_when_addressed() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let mut deps = bot_deps(model.clone());
        with_config(&mut deps, "[bot]\ncalendar_url = \"https://cdn.example.com/calendar.png\"\n");
        let dispatcher = Dispatcher::new(deps);
        let channel = RecordingChannel::new();

        dispatcher.handle(&inbound("!calendar examplebot"), &channel).await;
        dispatcher.handle(&inbound("!heroes"), &channel).await;

        let sent = channel.sent();
        assert_eq!(sent[0], "Here it is");
        assert_eq!(sent[1], "https://cdn.example.com/calendar.png");
        assert_eq!(sent[2], HERO_MENU);
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn direct_mode_skips_classification() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("\"Winter is coming\"".into())]));
        let mut deps = bot_deps(model.clone());
        with_config(&mut deps, "[bot]\nmode = \"direct\"\n");
        let dispatcher = Dispatcher::new(deps);
        let channel = RecordingChannel::new();

        dispatcher.handle(&inbound("examplebot, any news?"), &channel).await;

        assert_eq!(model.requests().len(), 1);
        assert!(!model.requests()[0].json_mode);
        assert_eq!(channel.sent(), vec!["Winter is coming".to_string()]);
    }
}
