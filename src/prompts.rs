//! Prompt templates and chat payload composition.

pub mod engine;

pub use engine::{PromptEngine, compose};
