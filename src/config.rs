//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default rating categories used when the requester names none.
pub const DEFAULT_RATING_CATEGORIES: &str = "* Likely to be a spy, Likely to be a comedian, \
Likely to be a politician, Likely to be a gamer, Likely to be a hacker, Likely to be a writer, \
Likely to be a musician, Likely to be a bot";

/// taproom configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance directory (holds config.toml and logs by default).
    pub instance_dir: PathBuf,
    pub bot: BotConfig,
    pub discord: DiscordConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub search: SearchConfig,
    pub storage: StorageConfig,
    pub images: ImagesConfig,
    pub logging: LoggingConfig,
}

/// How addressed messages are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Classify intent, then run the matching handler.
    Intent,
    /// Skip classification and answer with recent history only.
    Direct,
}

/// Persona and behavior of the bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Name users call the bot by. Matched case-insensitively.
    pub name: String,
    /// Persona paragraph prepended to most system prompts.
    pub persona: String,
    /// Subject of domain Q&A, e.g. "the mobile game 'Game of Thrones: Conquest'".
    pub domain: String,
    /// Appended to web queries for domain and miscellaneous questions.
    pub domain_search_suffix: String,
    /// Static calendar image shown for calendar requests.
    pub calendar_url: Option<String>,
    /// If non-empty, only these guild IDs are served.
    pub allowed_guilds: Vec<u64>,
    pub mode: RoutingMode,
    /// Messages of channel history given to the router.
    pub router_history: usize,
    /// Messages of channel history given in direct mode.
    pub direct_history: usize,
    /// Messages scanned by about_chat, about_me and analyze_user.
    pub deep_history: usize,
    /// Messages given to the humor handler.
    pub humor_history: usize,
    /// Upper bound on messages pulled for a summary window.
    pub summary_max_messages: usize,
    pub default_rating_categories: String,
}

/// Discord credentials.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub token: Option<String>,
}

/// OpenAI-compatible LLM endpoint configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL without the `/v1` suffix.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model used for intent classification.
    pub router_model: String,
    /// Model used for extraction calls and final replies.
    pub task_model: String,
    pub embedding_model: String,
    pub timeout: Duration,
    pub temperature: Option<f32>,
}

/// Retrieval index configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// JSON Lines corpus. Domain Q&A falls back to web search when absent.
    pub corpus_path: Option<PathBuf>,
    pub top_k: usize,
    /// Character budget for the joined context.
    pub context_limit: usize,
    pub embed_attempts: usize,
    pub embed_retry_delay: Duration,
}

/// Web search provider credentials.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub brave_key: Option<String>,
    pub google_key: Option<String>,
    pub google_cse_id: Option<String>,
    pub max_results: usize,
}

/// Object storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Prefix holding bang-command assets, e.g. "gotc/".
    pub asset_prefix: String,
    /// Base for public object URLs. Defaults to the virtual-hosted bucket URL.
    pub public_base_url: String,
    /// Optional `?v=` cache-busting suffix for asset URLs.
    pub asset_version: Option<String>,
    /// Lowercase extensions kept by the asset resolver. Empty keeps all.
    pub asset_extensions: Vec<String>,
    /// Zero rebuilds the asset map on every request.
    pub asset_cache_ttl: Duration,
    /// Prefix for generated images and exports.
    pub upload_prefix: String,
}

/// Image generation backend selection.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageBackend {
    Disabled,
    OpenAi {
        model: String,
    },
    StableDiffusion {
        base_url: String,
        moderation: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ImagesConfig {
    pub backend: ImageBackend,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        let name = "examplebot".to_string();
        Self {
            persona: default_persona(&name),
            name,
            domain: "the mobile game 'Game of Thrones: Conquest'".into(),
            domain_search_suffix: "in Game of Thrones: Conquest mobile game".into(),
            calendar_url: None,
            allowed_guilds: Vec::new(),
            mode: RoutingMode::Intent,
            router_history: 10,
            direct_history: 6,
            deep_history: 2000,
            humor_history: 40,
            summary_max_messages: 5000,
            default_rating_categories: DEFAULT_RATING_CATEGORIES.into(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            router_model: "gpt-4o".into(),
            task_model: "gpt-4o-mini".into(),
            embedding_model: "text-embedding-3-small".into(),
            timeout: Duration::from_secs(120),
            temperature: None,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            corpus_path: None,
            top_k: 3,
            context_limit: 3750,
            embed_attempts: 5,
            embed_retry_delay: Duration::from_secs(5),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            brave_key: None,
            google_key: None,
            google_cse_id: None,
            max_results: 4,
        }
    }
}

impl StorageConfig {
    fn with_bucket(bucket: String, region: String) -> Self {
        Self {
            public_base_url: format!("https://{bucket}.s3.amazonaws.com"),
            bucket,
            region,
            asset_prefix: "gotc/".into(),
            asset_version: None,
            asset_extensions: Vec::new(),
            asset_cache_ttl: Duration::ZERO,
            upload_prefix: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::with_bucket("example".into(), "us-east-1".into())
    }
}

fn default_persona(name: &str) -> String {
    format!(
        "Your name is {name}, you are funny, light-hearted, helpful and you keep your answers \
         simple and clear. You also daydrink a lot. Keep your responses short, informative, and \
         please dont try too hard. Provide links to sources in given context if anything."
    )
}

// -- TOML deserialization types --

#[derive(Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    bot: TomlBotConfig,
    #[serde(default)]
    discord: TomlDiscordConfig,
    #[serde(default)]
    llm: TomlLlmConfig,
    #[serde(default)]
    retrieval: TomlRetrievalConfig,
    #[serde(default)]
    search: TomlSearchConfig,
    #[serde(default)]
    storage: TomlStorageConfig,
    #[serde(default)]
    images: TomlImagesConfig,
    #[serde(default)]
    logging: TomlLoggingConfig,
}

#[derive(Deserialize, Default)]
struct TomlBotConfig {
    name: Option<String>,
    persona: Option<String>,
    domain: Option<String>,
    domain_search_suffix: Option<String>,
    calendar_url: Option<String>,
    #[serde(default)]
    allowed_guilds: Vec<u64>,
    mode: Option<String>,
    router_history: Option<usize>,
    direct_history: Option<usize>,
    deep_history: Option<usize>,
    humor_history: Option<usize>,
    summary_max_messages: Option<usize>,
    default_rating_categories: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlDiscordConfig {
    token: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlLlmConfig {
    base_url: Option<String>,
    api_key: Option<String>,
    router_model: Option<String>,
    task_model: Option<String>,
    embedding_model: Option<String>,
    timeout_secs: Option<u64>,
    temperature: Option<f32>,
}

#[derive(Deserialize, Default)]
struct TomlRetrievalConfig {
    corpus_path: Option<PathBuf>,
    top_k: Option<usize>,
    context_limit: Option<usize>,
    embed_attempts: Option<usize>,
    embed_retry_delay_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlSearchConfig {
    brave_key: Option<String>,
    google_key: Option<String>,
    google_cse_id: Option<String>,
    max_results: Option<usize>,
}

#[derive(Deserialize, Default)]
struct TomlStorageConfig {
    bucket: Option<String>,
    region: Option<String>,
    asset_prefix: Option<String>,
    public_base_url: Option<String>,
    asset_version: Option<String>,
    #[serde(default)]
    asset_extensions: Vec<String>,
    asset_cache_ttl_secs: Option<u64>,
    upload_prefix: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlImagesConfig {
    backend: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    moderation: Option<bool>,
}

#[derive(Deserialize, Default)]
struct TomlLoggingConfig {
    directory: Option<PathBuf>,
    file_prefix: Option<String>,
}

/// Resolve a value that might be an "env:VAR_NAME" reference.
fn resolve_env_value(value: &str) -> Option<String> {
    if let Some(var_name) = value.strip_prefix("env:") {
        std::env::var(var_name).ok()
    } else {
        Some(value.to_string())
    }
}

/// Resolve an optional secret, falling back to a conventional env var.
fn resolve_secret(value: Option<&str>, fallback_env: &str) -> Option<String> {
    value
        .and_then(resolve_env_value)
        .or_else(|| std::env::var(fallback_env).ok())
        .filter(|secret| !secret.trim().is_empty())
}

fn parse_mode(mode: Option<&str>) -> Result<RoutingMode> {
    match mode.map(str::to_ascii_lowercase).as_deref() {
        None | Some("intent") => Ok(RoutingMode::Intent),
        Some("direct") => Ok(RoutingMode::Direct),
        Some(other) => Err(ConfigError::Invalid(format!(
            "bot.mode must be \"intent\" or \"direct\", got \"{other}\""
        ))
        .into()),
    }
}

fn parse_image_backend(images: TomlImagesConfig) -> Result<ImageBackend> {
    match images.backend.as_deref() {
        None | Some("openai") => Ok(ImageBackend::OpenAi {
            model: images.model.unwrap_or_else(|| "dall-e-3".into()),
        }),
        Some("stable_diffusion") => Ok(ImageBackend::StableDiffusion {
            base_url: images
                .base_url
                .unwrap_or_else(|| "http://localhost:7860".into()),
            moderation: images.moderation.unwrap_or(true),
        }),
        Some("disabled") => Ok(ImageBackend::Disabled),
        Some(other) => Err(ConfigError::Invalid(format!(
            "unknown images.backend \"{other}\""
        ))
        .into()),
    }
}

/// Normalize a storage prefix so it is empty or ends with exactly one '/'.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

impl Config {
    /// Resolve the instance directory from env or default (~/.taproom).
    pub fn default_instance_dir() -> PathBuf {
        std::env::var("TAPROOM_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|d| d.join(".taproom"))
                    .unwrap_or_else(|| PathBuf::from("./.taproom"))
            })
    }

    /// Load configuration from `TAPROOM_CONFIG` or the default config file,
    /// falling back to env vars.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("TAPROOM_CONFIG") {
            return Self::load_from_path(Path::new(&path));
        }

        let instance_dir = Self::default_instance_dir();
        let config_path = instance_dir.join("config.toml");
        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::from_toml(TomlConfig::default(), instance_dir)
        }
    }

    /// Load from a specific TOML config file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let instance_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: std::sync::Arc::new(error),
        })?;

        Self::from_toml_str(&content, instance_dir)
    }

    /// Parse configuration from raw TOML text.
    pub fn from_toml_str(content: &str, instance_dir: PathBuf) -> Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).map_err(|error| ConfigError::Parse(error.to_string()))?;
        Self::from_toml(toml_config, instance_dir)
    }

    fn from_toml(toml: TomlConfig, instance_dir: PathBuf) -> Result<Self> {
        let bot_defaults = BotConfig::default();
        let name = toml
            .bot
            .name
            .map(|name| name.trim().to_lowercase())
            .unwrap_or(bot_defaults.name);
        if name.is_empty() {
            return Err(ConfigError::Invalid("bot.name must not be empty".into()).into());
        }

        let bot = BotConfig {
            persona: toml.bot.persona.unwrap_or_else(|| default_persona(&name)),
            domain: toml.bot.domain.unwrap_or(bot_defaults.domain),
            domain_search_suffix: toml
                .bot
                .domain_search_suffix
                .unwrap_or(bot_defaults.domain_search_suffix),
            calendar_url: toml.bot.calendar_url,
            allowed_guilds: toml.bot.allowed_guilds,
            mode: parse_mode(toml.bot.mode.as_deref())?,
            router_history: toml.bot.router_history.unwrap_or(bot_defaults.router_history),
            direct_history: toml.bot.direct_history.unwrap_or(bot_defaults.direct_history),
            deep_history: toml.bot.deep_history.unwrap_or(bot_defaults.deep_history),
            humor_history: toml.bot.humor_history.unwrap_or(bot_defaults.humor_history),
            summary_max_messages: toml
                .bot
                .summary_max_messages
                .unwrap_or(bot_defaults.summary_max_messages),
            default_rating_categories: toml
                .bot
                .default_rating_categories
                .unwrap_or(bot_defaults.default_rating_categories),
            name,
        };

        let discord = DiscordConfig {
            token: resolve_secret(toml.discord.token.as_deref(), "DISCORD_TOKEN"),
        };

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            base_url: toml
                .llm
                .base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(llm_defaults.base_url),
            api_key: resolve_secret(toml.llm.api_key.as_deref(), "OPENAI_API_KEY"),
            router_model: toml.llm.router_model.unwrap_or(llm_defaults.router_model),
            task_model: toml.llm.task_model.unwrap_or(llm_defaults.task_model),
            embedding_model: toml
                .llm
                .embedding_model
                .unwrap_or(llm_defaults.embedding_model),
            timeout: toml
                .llm
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(llm_defaults.timeout),
            temperature: toml.llm.temperature,
        };

        let retrieval_defaults = RetrievalConfig::default();
        let retrieval = RetrievalConfig {
            corpus_path: toml.retrieval.corpus_path.map(|path| {
                if path.is_relative() {
                    instance_dir.join(path)
                } else {
                    path
                }
            }),
            top_k: toml.retrieval.top_k.unwrap_or(retrieval_defaults.top_k),
            context_limit: toml
                .retrieval
                .context_limit
                .unwrap_or(retrieval_defaults.context_limit),
            embed_attempts: toml
                .retrieval
                .embed_attempts
                .unwrap_or(retrieval_defaults.embed_attempts)
                .max(1),
            embed_retry_delay: toml
                .retrieval
                .embed_retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(retrieval_defaults.embed_retry_delay),
        };
        if retrieval.top_k == 0 {
            return Err(ConfigError::Invalid("retrieval.top_k must be at least 1".into()).into());
        }

        let search = SearchConfig {
            brave_key: resolve_secret(toml.search.brave_key.as_deref(), "BRAVE_API_KEY"),
            google_key: resolve_secret(toml.search.google_key.as_deref(), "GOOGLE_API_KEY"),
            google_cse_id: resolve_secret(toml.search.google_cse_id.as_deref(), "GOOGLE_CSE_ID"),
            max_results: toml
                .search
                .max_results
                .unwrap_or(SearchConfig::default().max_results),
        };

        let bucket = toml.storage.bucket.unwrap_or_else(|| "example".into());
        let region = toml.storage.region.unwrap_or_else(|| "us-east-1".into());
        let storage_defaults = StorageConfig::with_bucket(bucket, region);
        let storage = StorageConfig {
            asset_prefix: toml
                .storage
                .asset_prefix
                .map(|prefix| normalize_prefix(&prefix))
                .unwrap_or(storage_defaults.asset_prefix),
            public_base_url: toml
                .storage
                .public_base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(storage_defaults.public_base_url),
            asset_version: toml.storage.asset_version,
            asset_extensions: toml
                .storage
                .asset_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            asset_cache_ttl: toml
                .storage
                .asset_cache_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(storage_defaults.asset_cache_ttl),
            upload_prefix: toml
                .storage
                .upload_prefix
                .map(|prefix| normalize_prefix(&prefix))
                .unwrap_or(storage_defaults.upload_prefix),
            bucket: storage_defaults.bucket,
            region: storage_defaults.region,
        };

        let images = ImagesConfig {
            backend: parse_image_backend(toml.images)?,
        };

        let logging = LoggingConfig {
            directory: toml
                .logging
                .directory
                .unwrap_or_else(|| instance_dir.join("logs")),
            file_prefix: toml
                .logging
                .file_prefix
                .unwrap_or_else(|| format!("{}.log", bot.name)),
        };

        Ok(Self {
            instance_dir,
            bot,
            discord,
            llm,
            retrieval,
            search,
            storage,
            images,
            logging,
        })
    }
}
