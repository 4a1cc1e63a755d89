//! taproom CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taproom::assets::AssetResolver;
use taproom::config::{Config, LoggingConfig};
use taproom::dispatcher::Dispatcher;
use taproom::images::ImageService;
use taproom::llm::LlmManager;
use taproom::messaging::discord::DiscordAdapter;
use taproom::prompts::PromptEngine;
use taproom::retrieval::RetrievalIndex;
use taproom::router::IntentRouter;
use taproom::search::WebSearch;
use taproom::storage::{ObjectStore, S3Store};
use taproom::BotDeps;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "taproom")]
#[command(about = "Discord bot that routes addressed messages to LLM task handlers")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to Discord and serve messages (default)
    Run,
    /// Print the bang-command asset map and exit
    Assets,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().context("failed to load configuration from environment")?
    };

    let _log_guard = init_tracing(&config.logging, cli.debug)?;
    tracing::info!(instance_dir = %config.instance_dir.display(), "configuration loaded");

    let deps = build_deps(config).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(deps).await,
        Command::Assets => print_assets(&deps).await,
    }
}

/// Stdout plus a daily-rotated log file. The returned guard flushes the
/// file writer on drop and must live as long as the process.
fn init_tracing(
    logging: &LoggingConfig,
    debug: bool,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&logging.directory).with_context(|| {
        format!(
            "failed to create log directory {}",
            logging.directory.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(&logging.directory, &logging.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}

/// `RUST_LOG` wins when set.
fn build_env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

async fn build_deps(config: Config) -> anyhow::Result<BotDeps> {
    let llm = Arc::new(
        LlmManager::new(config.llm.clone()).context("failed to initialize LLM manager")?,
    );
    let http_client = llm.http_client().clone();

    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&config.storage).await);

    let index = match &config.retrieval.corpus_path {
        Some(path) => {
            let index = RetrievalIndex::load(path)
                .with_context(|| format!("failed to load corpus from {}", path.display()))?;
            tracing::info!(entries = index.len(), path = %path.display(), "retrieval corpus loaded");
            Some(Arc::new(index))
        }
        None => {
            tracing::info!("no retrieval corpus configured, domain questions use web search");
            None
        }
    };

    let search = WebSearch::from_config(&config.search, http_client.clone());
    let images = ImageService::from_backend(
        &config.images.backend,
        http_client,
        &config.llm,
        store.clone(),
        config.storage.upload_prefix.clone(),
    )
    .map(Arc::new);
    if images.is_none() {
        tracing::info!("image generation disabled");
    }

    let assets = Arc::new(AssetResolver::new(store.clone(), &config.storage));
    let prompts = PromptEngine::new(&config.bot).context("failed to load prompt templates")?;
    let router = IntentRouter::new(llm.clone(), prompts.clone(), config.llm.router_model.clone());

    Ok(BotDeps {
        config: Arc::new(config),
        llm: llm.clone(),
        embedder: llm,
        index,
        search,
        images,
        assets,
        store,
        prompts,
        router,
    })
}

async fn run(deps: BotDeps) -> anyhow::Result<()> {
    let token = deps
        .config
        .discord
        .token
        .clone()
        .context("no Discord token configured (set discord.token or DISCORD_TOKEN)")?;

    let dispatcher = Arc::new(Dispatcher::new(deps));
    let adapter = DiscordAdapter::new(token, dispatcher);

    tracing::info!("taproom started");

    tokio::select! {
        result = adapter.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    adapter.shutdown().await;
    tracing::info!("taproom stopped");
    Ok(())
}

async fn print_assets(deps: &BotDeps) -> anyhow::Result<()> {
    let map = deps
        .assets
        .asset_map()
        .await
        .context("failed to list assets")?;

    for (name, url) in &map.singles {
        println!("!{name}  {url}");
    }
    for (name, urls) in &map.dirs {
        println!("!{name}  ({} images)", urls.len());
        for url in urls {
            println!("    {url}");
        }
    }
    Ok(())
}
