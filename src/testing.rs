//! In-memory fakes for the service traits.

use crate::assets::AssetResolver;
use crate::config::Config;
use crate::error::{ImageError, LlmError, MessagingError, SearchError, StorageError};
use crate::images::{ImageGenerator, ImageRequest, ImageService};
use crate::llm::{CompletionRequest, Embedder, LanguageModel};
use crate::messaging::ChannelHandle;
use crate::prompts::PromptEngine;
use crate::router::IntentRouter;
use crate::search::{SearchProvider, SearchResult, WebSearch};
use crate::storage::ObjectStore;
use crate::{Author, BotDeps, HistoryMessage};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone as _, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 2024-05-17 12:00:00 UTC, a Friday.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap()
}

/// The user sending requests in handler tests.
pub fn requester() -> Author {
    Author {
        id: 1,
        username: "ser_pounce".into(),
        display_name: "Ser Pounce".into(),
    }
}

/// A history message posted `offset_secs` after [`base_time`].
pub fn history(
    offset_secs: i64,
    author_id: u64,
    username: &str,
    display_name: &str,
    content: &str,
) -> HistoryMessage {
    HistoryMessage {
        timestamp: base_time() + chrono::TimeDelta::seconds(offset_secs),
        author_id,
        author_username: username.into(),
        author_display_name: display_name.into(),
        content: content.into(),
    }
}

/// Services with default config, no corpus, empty search results, a
/// succeeding image backend and an empty in-memory store.
pub fn bot_deps(model: Arc<ScriptedModel>) -> BotDeps {
    let config = Config::from_toml_str("", PathBuf::from("/tmp/taproom-test")).unwrap();
    let store = Arc::new(MemoryStore::new("https://bucket.example.com"));
    let prompts = PromptEngine::new(&config.bot).unwrap();

    BotDeps {
        llm: model.clone(),
        embedder: Arc::new(FakeEmbedder::returning(vec![1.0, 0.0])),
        index: None,
        search: WebSearch::new(
            Arc::new(StaticSearch::returning("brave", Vec::new())),
            Arc::new(StaticSearch::returning("google", Vec::new())),
            4,
        ),
        images: Some(Arc::new(ImageService::new(
            Arc::new(FakeImages::succeeding()),
            store.clone(),
            "generated/".into(),
        ))),
        assets: Arc::new(AssetResolver::new(store.clone(), &config.storage)),
        store,
        router: IntentRouter::new(model, prompts.clone(), config.llm.router_model.clone()),
        prompts,
        config: Arc::new(config),
    }
}

/// Replays queued completions in order and records every request.
/// Once the script runs out, further calls fail with `EmptyResponse`.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}

/// Fails a fixed number of times, then returns the same vector.
pub struct FakeEmbedder {
    failures: usize,
    vector: Vec<f32>,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn failing_then(failures: usize, vector: Vec<f32>) -> Self {
        Self {
            failures,
            vector,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn returning(vector: Vec<f32>) -> Self {
        Self::failing_then(0, vector)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(LlmError::EmbeddingFailed(format!("attempt {}", call + 1)));
        }
        Ok(self.vector.clone())
    }
}

/// Records sends and serves a fixed history.
#[derive(Default)]
pub struct RecordingChannel {
    history: Vec<HistoryMessage>,
    sent: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// History in oldest-first order.
    pub fn with_history(history: Vec<HistoryMessage>) -> Self {
        Self {
            history,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelHandle for RecordingChannel {
    async fn send(&self, text: &str) -> Result<(), MessagingError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryMessage>, MessagingError> {
        let skip = self.history.len().saturating_sub(limit);
        Ok(self.history[skip..].to_vec())
    }

    async fn history_since(
        &self,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, MessagingError> {
        Ok(self
            .history
            .iter()
            .filter(|message| message.timestamp > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// One upload made to a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct Upload {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub presigned_for: Option<Duration>,
}

pub struct MemoryStore {
    base_url: String,
    keys: Vec<String>,
    uploads: Mutex<Vec<Upload>>,
    list_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(base_url: &str) -> Self {
        Self::with_keys(base_url, &[])
    }

    pub fn with_keys(base_url: &str, keys: &[&str]) -> Self {
        Self {
            base_url: base_url.to_string(),
            keys: keys.iter().map(ToString::to_string).collect(),
            uploads: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        self.uploads().into_iter().map(|upload| upload.key).collect()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .keys
            .iter()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn put_public(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.uploads.lock().unwrap().push(Upload {
            key: key.to_string(),
            body,
            content_type: content_type.to_string(),
            presigned_for: None,
        });
        Ok(self.public_url(key))
    }

    async fn put_private_presigned(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        self.uploads.lock().unwrap().push(Upload {
            key: key.to_string(),
            body,
            content_type: content_type.to_string(),
            presigned_for: Some(expires_in),
        });
        Ok(format!(
            "{}?X-Amz-Expires={}",
            self.public_url(key),
            expires_in.as_secs()
        ))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.base_url)
    }
}

pub struct StaticSearch {
    name: &'static str,
    outcome: Result<Vec<SearchResult>, ()>,
    queries: Mutex<Vec<String>>,
}

impl StaticSearch {
    pub fn returning(name: &'static str, results: Vec<SearchResult>) -> Self {
        Self {
            name,
            outcome: Ok(results),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn rate_limited(name: &'static str) -> Self {
        Self {
            name,
            outcome: Err(()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.queries.lock().unwrap().push(query.to_string());
        match &self.outcome {
            Ok(results) => Ok(results.iter().take(max_results).cloned().collect()),
            Err(()) => Err(SearchError::RateLimited {
                provider: self.name,
            }),
        }
    }
}

pub struct FakeImages {
    censor: bool,
    failure: Option<String>,
    prompts: Mutex<Vec<ImageRequest>>,
}

impl FakeImages {
    pub fn succeeding() -> Self {
        Self {
            censor: false,
            failure: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn censoring() -> Self {
        Self {
            censor: true,
            ..Self::succeeding()
        }
    }

    /// Fails every call with `ImageError::Generation(reason)`.
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::succeeding()
        }
    }

    pub fn requests(&self) -> Vec<ImageRequest> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageGenerator for FakeImages {
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>, ImageError> {
        self.prompts.lock().unwrap().push(request.clone());
        if self.censor {
            return Err(ImageError::Censored);
        }
        if let Some(reason) = &self.failure {
            return Err(ImageError::Generation(reason.clone()));
        }
        Ok(b"\x89PNG fake".to_vec())
    }
}
