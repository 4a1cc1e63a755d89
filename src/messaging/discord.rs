//! Discord adapter using serenity.

use crate::dispatcher::{Dispatcher, resolve_mentions};
use crate::error::MessagingError;
use crate::handlers::{TaskRequest, chat, domain, profile, report_error, summarize};
use crate::messaging::ChannelHandle;
use crate::roster::{self, MemberRecord};
use crate::{Attachment, Author, BotDeps, HistoryMessage, InboundMessage};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use regex::Regex;
use serenity::all::{
    ChannelId, Command, CommandInteraction, CommandOptionType, Context, CreateCommand,
    CreateCommandOption, CreateInteractionResponse, CreateInteractionResponseFollowup,
    CreateInteractionResponseMessage, EventHandler, GatewayIntents, GetMessages, GuildId, Http,
    Interaction, Message, MessageId, PartialMember, Permissions, Ready, ShardManager, User, UserId,
};
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;

/// Largest page the history endpoint returns.
const PAGE_SIZE: usize = 100;

/// 2015-01-01T00:00:00Z in milliseconds, the zero point of Discord snowflakes.
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

const NO_PERMISSION_REPLY: &str = "You do not have permission to use this command.";
const NOT_AN_IMAGE_REPLY: &str = "The attachment must be an image file.";
const UPLOAD_FAILED_REPLY: &str = "An error occurred while uploading the file.";

static USER_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@!?(\d+)>").expect("hardcoded mention pattern"));

/// Discord gateway connection feeding the dispatcher.
pub struct DiscordAdapter {
    token: String,
    dispatcher: Arc<Dispatcher>,
    shard_manager: Arc<RwLock<Option<Arc<ShardManager>>>>,
}

impl DiscordAdapter {
    pub fn new(token: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            token: token.into(),
            dispatcher,
            shard_manager: Arc::new(RwLock::new(None)),
        }
    }

    /// Connect and serve events until the gateway closes.
    pub async fn run(&self) -> anyhow::Result<()> {
        let handler = Handler {
            dispatcher: self.dispatcher.clone(),
            bot_user_id: Arc::new(RwLock::new(None)),
        };

        let mut client = serenity::Client::builder(&self.token, gateway_intents())
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        *self.shard_manager.write().await = Some(client.shard_manager.clone());

        client
            .start()
            .await
            .map_err(|error| MessagingError::Gateway(error.to_string()))?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(shard_manager) = self.shard_manager.read().await.as_ref() {
            shard_manager.shutdown_all().await;
        }
        tracing::info!("discord adapter shut down");
    }
}

/// Intents sent on identify. `GUILD_MEMBERS` stays out: requesting a
/// privileged intent the application lacks closes the gateway with 4014, and
/// the roster export only needs the REST member list.
fn gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
}

/// A guild text channel. History is read from before `before` when set.
pub struct DiscordChannel {
    http: Arc<Http>,
    channel_id: ChannelId,
    before: Option<MessageId>,
}

impl DiscordChannel {
    pub fn new(http: Arc<Http>, channel_id: ChannelId, before: Option<MessageId>) -> Self {
        Self {
            http,
            channel_id,
            before,
        }
    }

    async fn page(&self, builder: GetMessages) -> Result<Vec<Message>, MessagingError> {
        self.channel_id
            .messages(&*self.http, builder)
            .await
            .map_err(|error| MessagingError::History(error.to_string()))
    }
}

#[async_trait]
impl ChannelHandle for DiscordChannel {
    async fn send(&self, text: &str) -> Result<(), MessagingError> {
        self.channel_id
            .say(&*self.http, text)
            .await
            .map_err(|error| MessagingError::Send(error.to_string()))?;
        Ok(())
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryMessage>, MessagingError> {
        let messages = walk_backward(
            limit,
            self.before,
            |message: &Message| message.id,
            move |before, page_size| {
                let mut builder = GetMessages::new().limit(page_size);
                if let Some(before) = before {
                    builder = builder.before(before);
                }
                self.page(builder)
            },
        )
        .await?;

        tracing::debug!(
            count = messages.len(),
            channel_id = %self.channel_id,
            "fetched discord message history"
        );
        Ok(messages.iter().map(history_message).collect())
    }

    async fn history_since(
        &self,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, MessagingError> {
        let messages = walk_forward(
            limit,
            MessageId::new(snowflake_at(after)),
            |message: &Message| message.id,
            move |cursor, page_size| self.page(GetMessages::new().after(cursor).limit(page_size)),
        )
        .await?;

        tracing::debug!(
            count = messages.len(),
            channel_id = %self.channel_id,
            %after,
            "fetched discord messages since cutoff"
        );
        Ok(messages.iter().map(history_message).collect())
    }
}

/// Page backwards from `before` until `limit` items are collected or a short
/// page reaches the start of the channel. Pages arrive newest first; the
/// result is oldest first.
async fn walk_backward<T, K, F, Fut>(
    limit: usize,
    before: Option<K>,
    id_of: impl Fn(&T) -> K,
    mut fetch: F,
) -> Result<Vec<T>, MessagingError>
where
    K: Copy,
    F: FnMut(Option<K>, u8) -> Fut,
    Fut: Future<Output = Result<Vec<T>, MessagingError>>,
{
    let mut collected = Vec::new();
    let mut cursor = before;

    while collected.len() < limit {
        let page_size = (limit - collected.len()).min(PAGE_SIZE);
        let page = fetch(cursor, page_size as u8).await?;
        let exhausted = page.len() < page_size;
        let Some(oldest) = page.last() else {
            break;
        };
        cursor = Some(id_of(oldest));
        collected.extend(page);
        if exhausted {
            break;
        }
    }

    collected.truncate(limit);
    collected.reverse();
    Ok(collected)
}

/// Page forwards from `after` until `limit` items are collected or a short
/// page reaches the newest message. The result is oldest first.
async fn walk_forward<T, K, F, Fut>(
    limit: usize,
    after: K,
    id_of: impl Fn(&T) -> K,
    mut fetch: F,
) -> Result<Vec<T>, MessagingError>
where
    K: Copy + Ord,
    F: FnMut(K, u8) -> Fut,
    Fut: Future<Output = Result<Vec<T>, MessagingError>>,
{
    let mut collected = Vec::new();
    let mut cursor = after;

    while collected.len() < limit {
        let page_size = (limit - collected.len()).min(PAGE_SIZE);
        let mut page = fetch(cursor, page_size as u8).await?;
        page.sort_by_key(|item| id_of(item));
        let exhausted = page.len() < page_size;
        let Some(newest) = page.last() else {
            break;
        };
        cursor = id_of(newest);
        collected.extend(page);
        if exhausted {
            break;
        }
    }

    collected.truncate(limit);
    Ok(collected)
}

/// A deferred slash-command interaction. Sends become follow-ups.
pub struct InteractionChannel {
    http: Arc<Http>,
    command: CommandInteraction,
    history: DiscordChannel,
}

impl InteractionChannel {
    pub fn new(http: Arc<Http>, command: CommandInteraction) -> Self {
        let history = DiscordChannel::new(http.clone(), command.channel_id, None);
        Self {
            http,
            command,
            history,
        }
    }

    async fn follow_up(&self, text: &str, ephemeral: bool) -> Result<(), MessagingError> {
        self.command
            .create_followup(
                &*self.http,
                CreateInteractionResponseFollowup::new()
                    .content(text)
                    .ephemeral(ephemeral),
            )
            .await
            .map_err(|error| MessagingError::Send(error.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ChannelHandle for InteractionChannel {
    async fn send(&self, text: &str) -> Result<(), MessagingError> {
        self.follow_up(text, false).await
    }

    async fn send_private(&self, text: &str) -> Result<(), MessagingError> {
        self.follow_up(text, true).await
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryMessage>, MessagingError> {
        self.history.recent_history(limit).await
    }

    async fn history_since(
        &self,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, MessagingError> {
        self.history.history_since(after, limit).await
    }
}

// -- Serenity EventHandler --

struct Handler {
    dispatcher: Arc<Dispatcher>,
    bot_user_id: Arc<RwLock<Option<UserId>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(bot_name = %ready.user.name, guild_count = ready.guilds.len(), "discord connected");
        *self.bot_user_id.write().await = Some(ready.user.id);

        match Command::set_global_commands(&ctx.http, slash_commands()).await {
            Ok(commands) => tracing::info!(count = commands.len(), "registered slash commands"),
            Err(error) => tracing::error!(%error, "failed to register slash commands"),
        }
    }

    async fn message(&self, ctx: Context, message: Message) {
        let Some(bot_user_id) = *self.bot_user_id.read().await else {
            return;
        };
        if message.author.id == bot_user_id {
            return;
        }

        let inbound = inbound_message(&message, bot_user_id);
        let channel = DiscordChannel::new(ctx.http.clone(), message.channel_id, Some(message.id));
        self.dispatcher.handle(&inbound, &channel).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        tracing::info!(
            command = %command.data.name,
            user = %command.user.name,
            "received slash command"
        );

        if !self
            .dispatcher
            .guild_allowed(command.guild_id.map(GuildId::get))
        {
            return;
        }

        if let Err(error) = self.run_command(&ctx, command).await {
            tracing::error!(%error, "slash command failed");
        }
    }
}

impl Handler {
    async fn run_command(&self, ctx: &Context, command: CommandInteraction) -> anyhow::Result<()> {
        let deps = self.dispatcher.deps();
        let name = command.data.name.clone();

        // Checks that answer before deferring
        if name == "members_export" && !can_manage_guild(&command) {
            return respond_ephemeral(ctx, &command, NO_PERMISSION_REPLY).await;
        }
        let images = match attached_image(&command) {
            Ok(images) => images,
            Err(filename) => {
                tracing::info!(%filename, "rejected non-image attachment");
                return respond_ephemeral(ctx, &command, NOT_AN_IMAGE_REPLY).await;
            }
        };

        command
            .defer(&ctx.http)
            .await
            .context("failed to defer interaction")?;

        let text = string_option(&command, "text").unwrap_or_default();
        let requester = interaction_author(&command);
        let guild_id = command.guild_id;
        let channel = InteractionChannel::new(ctx.http.clone(), command);

        let result = match name.as_str() {
            "members_export" => {
                return match guild_id {
                    Some(guild_id) => export_members(ctx, deps, &channel, guild_id).await,
                    None => Ok(channel.send_private(NO_PERMISSION_REPLY).await?),
                };
            }
            "analyze_user" => {
                let mentions = mentioned_members(ctx, guild_id, &text).await;
                let mut request = TaskRequest::plain(
                    resolve_mentions(&text, &mentions, |user| user.display_name.as_str()),
                    requester,
                    "english",
                );
                request.text_with_usernames =
                    resolve_mentions(&text, &mentions, |user| user.username.as_str());
                request.language = profile::preferred_language(deps, &request.text).await;
                profile::analyze_user(deps, &channel, &request, &images).await
            }
            "about_me" | "about_chat" => {
                let language = profile::preferred_language(deps, &text).await;
                let request = TaskRequest::plain(text, requester, language);
                if name == "about_me" {
                    profile::about_me(deps, &channel, &request, &images).await
                } else {
                    chat::about_chat(deps, &channel, &request, &images).await
                }
            }
            "translate" => {
                let language = string_option(&channel.command, "language")
                    .map(|language| language.trim().to_lowercase())
                    .filter(|language| !language.is_empty())
                    .unwrap_or_else(|| "english".to_string());
                let request = TaskRequest::plain(text, requester, language);
                chat::translate(deps, &channel, &request, &images).await
            }
            "summarize" => {
                let request = TaskRequest::plain(text, requester, "english");
                summarize::summarize(deps, &channel, &request, &images).await
            }
            "web_search" => {
                let request = TaskRequest::plain(text, requester, "english");
                domain::web_search(deps, &channel, &request, &images).await
            }
            "gotc" => {
                let request = TaskRequest::plain(text, requester, "english");
                domain::answer(deps, &channel, &request, &images).await
            }
            other => {
                tracing::warn!(command = other, "unknown slash command");
                return Ok(());
            }
        };

        if let Err(error) = result {
            tracing::error!(%error, command = %name, "slash command handler failed");
            report_error(&channel, &error).await?;
        }
        Ok(())
    }
}

async fn respond_ephemeral(
    ctx: &Context,
    command: &CommandInteraction,
    text: &str,
) -> anyhow::Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(text)
                    .ephemeral(true),
            ),
        )
        .await
        .context("failed to respond to interaction")
}

async fn export_members(
    ctx: &Context,
    deps: &BotDeps,
    channel: &InteractionChannel,
    guild_id: GuildId,
) -> anyhow::Result<()> {
    let members = match fetch_roster(ctx, guild_id).await {
        Ok(members) => members,
        Err(error) => {
            tracing::error!(%error, %guild_id, "failed to list guild members");
            report_error(channel, &error).await?;
            return Ok(());
        }
    };

    let uploaded = roster::export(
        deps.store.as_ref(),
        &deps.config.storage.upload_prefix,
        guild_id.get(),
        &members,
        Utc::now(),
    )
    .await;
    match uploaded {
        Ok(url) => channel.send(&format!("Here is the member list: {url}")).await?,
        Err(error) => {
            tracing::error!(%error, %guild_id, "failed to upload member roster");
            channel.send(UPLOAD_FAILED_REPLY).await?;
        }
    }
    Ok(())
}

async fn fetch_roster(ctx: &Context, guild_id: GuildId) -> anyhow::Result<Vec<MemberRecord>> {
    let roles = guild_id
        .roles(&ctx.http)
        .await
        .context("failed to fetch guild roles")?;

    let mut records = Vec::new();
    let mut members = std::pin::pin!(guild_id.members_iter(ctx.http.clone()));
    while let Some(member) = members.next().await {
        let member = member.context("failed to fetch guild member")?;
        records.push(MemberRecord {
            display_name: member.display_name().to_string(),
            nickname: member.nick.clone(),
            username: member.user.name.clone(),
            joined_at: member.joined_at.map(|joined| *joined),
            roles: member
                .roles
                .iter()
                .filter_map(|role_id| roles.get(role_id))
                .map(|role| role.name.clone())
                .collect(),
        });
    }
    Ok(records)
}

/// Users mentioned as `<@id>` in free text. Slash-command options carry no
/// resolved mentions, so each one is fetched.
async fn mentioned_members(ctx: &Context, guild_id: Option<GuildId>, text: &str) -> Vec<Author> {
    let mut authors = Vec::new();
    for id in mention_ids(text) {
        let user_id = UserId::new(id);
        let author = match guild_id {
            Some(guild_id) => guild_id.member(ctx, user_id).await.map(|member| Author {
                id,
                username: member.user.name.clone(),
                display_name: member.display_name().to_string(),
            }),
            None => user_id.to_user(ctx).await.map(|user| author_from_user(&user)),
        };
        match author {
            Ok(author) => authors.push(author),
            Err(error) => tracing::warn!(%error, user_id = id, "failed to resolve mentioned user"),
        }
    }
    authors
}

fn mention_ids(text: &str) -> Vec<u64> {
    let mut ids: Vec<u64> = USER_MENTION
        .captures_iter(text)
        .filter_map(|captures| captures[1].parse().ok())
        .filter(|id| *id != 0)
        .collect();
    ids.dedup();
    ids
}

fn can_manage_guild(command: &CommandInteraction) -> bool {
    command
        .member
        .as_ref()
        .and_then(|member| member.permissions)
        .is_some_and(|permissions| permissions.manage_guild())
}

fn string_option(command: &CommandInteraction, name: &str) -> Option<String> {
    command
        .data
        .options
        .iter()
        .find(|option| option.name == name)
        .and_then(|option| option.value.as_str())
        .map(ToString::to_string)
}

/// URL of the `image` option, if any. A non-image file is an error carrying its name.
fn attached_image(command: &CommandInteraction) -> Result<Vec<String>, String> {
    let Some(attachment_id) = command
        .data
        .options
        .iter()
        .find(|option| option.name == "image")
        .and_then(|option| option.value.as_attachment_id())
    else {
        return Ok(Vec::new());
    };
    let Some(attachment) = command.data.resolved.attachments.get(&attachment_id) else {
        return Ok(Vec::new());
    };

    let attachment = Attachment {
        filename: attachment.filename.clone(),
        url: attachment.url.clone(),
        content_type: attachment.content_type.clone(),
    };
    if attachment.is_image() {
        Ok(vec![attachment.url])
    } else {
        Err(attachment.filename)
    }
}

fn interaction_author(command: &CommandInteraction) -> Author {
    let nick = command
        .member
        .as_ref()
        .and_then(|member| member.nick.as_deref());
    Author {
        id: command.user.id.get(),
        username: command.user.name.clone(),
        display_name: pick_display_name(nick, command.user.global_name.as_deref(), &command.user.name),
    }
}

fn slash_commands() -> Vec<CreateCommand> {
    let text = |description: &str| {
        CreateCommandOption::new(CommandOptionType::String, "text", description).required(true)
    };

    vec![
        CreateCommand::new("summarize")
            .description("Summarizes the recent conversation.")
            .add_option(text("What to summarize, e.g. the last 3 hours")),
        CreateCommand::new("web_search")
            .description("Searches the web for the provided query.")
            .add_option(text("Search query")),
        CreateCommand::new("translate")
            .description("Translate.")
            .add_option(text("Text to translate"))
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "language", "Target language")
                    .required(false),
            ),
        CreateCommand::new("about_me")
            .description("Rates you 1-10 on several different categories based on what you ask for")
            .add_option(text("Categories to rate you in")),
        CreateCommand::new("about_chat")
            .description("Provides information about the chat based on recent messages.")
            .add_option(text("Question about the chat")),
        CreateCommand::new("analyze_user")
            .description("Analyzes a specified user based on their comments.")
            .add_option(text("Who to analyze")),
        CreateCommand::new("gotc")
            .description("Ask a question about the game.")
            .add_option(text("Question"))
            .add_option(
                CreateCommandOption::new(CommandOptionType::Attachment, "image", "Screenshot")
                    .required(false),
            ),
        CreateCommand::new("members_export")
            .description("Exports all members and their roles (Mods only).")
            .default_member_permissions(Permissions::MANAGE_GUILD),
    ]
}

// -- Conversions --

/// Server nickname, global display name, or username, in that order.
fn pick_display_name(nick: Option<&str>, global_name: Option<&str>, username: &str) -> String {
    nick.or(global_name).unwrap_or(username).to_string()
}

fn member_nick(member: Option<&PartialMember>) -> Option<&str> {
    member.and_then(|member| member.nick.as_deref())
}

fn author_from_user(user: &User) -> Author {
    Author {
        id: user.id.get(),
        username: user.name.clone(),
        display_name: pick_display_name(
            member_nick(user.member.as_deref()),
            user.global_name.as_deref(),
            &user.name,
        ),
    }
}

fn message_author(message: &Message) -> Author {
    Author {
        id: message.author.id.get(),
        username: message.author.name.clone(),
        display_name: pick_display_name(
            member_nick(message.member.as_deref()),
            message.author.global_name.as_deref(),
            &message.author.name,
        ),
    }
}

fn inbound_message(message: &Message, bot_user_id: UserId) -> InboundMessage {
    let reply_to_bot = message
        .referenced_message
        .as_ref()
        .filter(|referenced| referenced.author.id == bot_user_id)
        .map(|referenced| referenced.content.clone());

    InboundMessage {
        id: message.id.get(),
        channel_id: message.channel_id.get(),
        guild_id: message.guild_id.map(GuildId::get),
        author: message_author(message),
        content: message.content.clone(),
        mentions: message.mentions.iter().map(author_from_user).collect(),
        attachments: message
            .attachments
            .iter()
            .map(|attachment| Attachment {
                filename: attachment.filename.clone(),
                url: attachment.url.clone(),
                content_type: attachment.content_type.clone(),
            })
            .collect(),
        mentions_bot: message.mentions.iter().any(|user| user.id == bot_user_id),
        reply_to_bot,
        timestamp: *message.timestamp,
    }
}

fn history_message(message: &Message) -> HistoryMessage {
    let mentions: Vec<Author> = message.mentions.iter().map(author_from_user).collect();
    let author = message_author(message);
    HistoryMessage {
        timestamp: *message.timestamp,
        author_id: author.id,
        author_username: author.username,
        author_display_name: author.display_name,
        content: resolve_mentions(&message.content, &mentions, |user| {
            user.display_name.as_str()
        }),
    }
}

/// The smallest message ID created at `time`. Used as an `after` cursor.
fn snowflake_at(time: DateTime<Utc>) -> u64 {
    let since_epoch = (time.timestamp_millis() - DISCORD_EPOCH_MS).max(0) as u64;
    (since_epoch << 22).max(1)
}
