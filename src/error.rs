//! Top-level error types for taproom.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// LLM provider errors (generation and embeddings).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("empty response from provider")]
    EmptyResponse,

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),
}

/// Structured-output (classifier) failures. Always a retry case.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("classifier call failed: {0}")]
    Call(#[from] LlmError),

    #[error("classifier returned malformed JSON: {0}")]
    Malformed(String),

    #[error("classifier output is missing `{0}`")]
    MissingField(&'static str),
}

/// Retrieval index errors.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("failed to read corpus {path}: {reason}")]
    CorpusLoad { path: String, reason: String },

    #[error("corpus entry {line} has embedding dimension {found}, expected {expected}")]
    InconsistentCorpus {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("query embedding has dimension {found}, corpus uses {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("embedding failed after {attempts} attempts: {last_error}")]
    EmbeddingExhausted { attempts: usize, last_error: String },
}

/// Web search provider errors. Never surfaced to users.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("{provider} rate limited the request")]
    RateLimited { provider: &'static str },

    #[error("{provider} request failed: {reason}")]
    Request {
        provider: &'static str,
        reason: String,
    },
}

/// Object storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to list objects under {prefix}: {reason}")]
    List { prefix: String, reason: String },

    #[error("failed to upload {key}: {reason}")]
    Upload { key: String, reason: String },

    #[error("failed to presign {key}: {reason}")]
    Presign { key: String, reason: String },
}

/// Image generation and moderation errors.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image generation failed: {0}")]
    Generation(String),

    #[error("failed to download generated image: {0}")]
    Download(String),

    #[error("generated image was censored by moderation")]
    Censored,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Chat platform errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("failed to send message: {0}")]
    Send(String),

    #[error("failed to fetch channel history: {0}")]
    History(String),

    #[error("gateway error: {0}")]
    Gateway(String),
}
