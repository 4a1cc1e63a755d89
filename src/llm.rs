//! LLM provider access: chat completions, embeddings and retry policy.

pub mod manager;
pub mod model;
pub mod routing;

pub use manager::LlmManager;
pub use model::{ChatMessage, CompletionRequest, Embedder, LanguageModel};
pub use routing::RetryPolicy;
