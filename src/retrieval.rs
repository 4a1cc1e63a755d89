//! In-memory embeddings index over a static corpus.

use crate::error::{LlmError, RetrievalError};
use crate::llm::Embedder;
use crate::llm::routing::{RetryPolicy, retry};
use serde::Deserialize;
use std::io::BufRead as _;
use std::path::Path;

/// One chunk of the corpus with its precomputed embedding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CorpusEntry {
    pub text: String,
    pub source: String,
    pub embedding: Vec<f32>,
}

/// Result of a top-k lookup: texts joined by single spaces plus their sources.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved {
    pub text: String,
    pub sources: Vec<String>,
}

/// Read-only index. Every entry shares one embedding dimension.
#[derive(Debug, Clone)]
pub struct RetrievalIndex {
    entries: Vec<CorpusEntry>,
    dimension: usize,
}

impl RetrievalIndex {
    /// Build an index, rejecting entries whose dimension differs from the first.
    pub fn new(entries: Vec<CorpusEntry>) -> Result<Self, RetrievalError> {
        let dimension = entries.first().map_or(0, |entry| entry.embedding.len());
        if let Some((index, entry)) = entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.embedding.len() != dimension)
        {
            return Err(RetrievalError::InconsistentCorpus {
                line: index + 1,
                expected: dimension,
                found: entry.embedding.len(),
            });
        }

        Ok(Self { entries, dimension })
    }

    /// Load a JSON Lines corpus: one `{text, source, embedding}` object per line.
    pub fn load(path: &Path) -> Result<Self, RetrievalError> {
        let load_error = |reason: String| RetrievalError::CorpusLoad {
            path: path.display().to_string(),
            reason,
        };

        let file = std::fs::File::open(path).map_err(|e| load_error(e.to_string()))?;
        let mut entries = Vec::new();
        for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| load_error(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CorpusEntry = serde_json::from_str(&line)
                .map_err(|e| load_error(format!("line {}: {e}", index + 1)))?;
            entries.push(entry);
        }

        let index = Self::new(entries)?;
        tracing::info!(
            path = %path.display(),
            entries = index.len(),
            dimension = index.dimension,
            "corpus loaded"
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `k` entries most similar to `query`, best first.
    ///
    /// Ties keep corpus order. Fewer than `k` entries yields all of them.
    pub fn top_k(&self, query: &[f32], k: usize) -> Result<Retrieved, RetrievalError> {
        if !self.entries.is_empty() && query.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                found: query.len(),
            });
        }

        let mut scored: Vec<(f32, &CorpusEntry)> = self
            .entries
            .iter()
            .map(|entry| (cosine_similarity(query, &entry.embedding), entry))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(k);

        Ok(Retrieved {
            text: scored
                .iter()
                .map(|(_, entry)| entry.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            sources: scored
                .into_iter()
                .map(|(_, entry)| entry.source.clone())
                .collect(),
        })
    }
}

/// Cosine similarity. A zero-norm vector has similarity 0 with everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (dot, norm_a, norm_b) = a.iter().zip(b).fold(
        (0.0_f32, 0.0_f32, 0.0_f32),
        |(dot, norm_a, norm_b), (x, y)| (dot + x * y, norm_a + x * x, norm_b + y * y),
    );
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// First `limit` characters of `text`. Not token-aware, may cut mid-word.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Embed a query with a fixed-delay retry.
pub async fn embed_query(
    embedder: &dyn Embedder,
    query: &str,
    policy: RetryPolicy,
) -> Result<Vec<f32>, RetrievalError> {
    retry(policy, "embed_query", || embedder.embed(query))
        .await
        .map_err(|error: LlmError| RetrievalError::EmbeddingExhausted {
            attempts: policy.max_attempts,
            last_error: error.to_string(),
        })
}

/// Embeds the query, looks up the top `k` entries and truncates the joined text.
pub async fn retrieve(
    index: &RetrievalIndex,
    embedder: &dyn Embedder,
    query: &str,
    k: usize,
    context_limit: usize,
    policy: RetryPolicy,
) -> Result<Retrieved, RetrievalError> {
    let embedding = embed_query(embedder, query, policy).await?;
    let mut retrieved = index.top_k(&embedding, k)?;
    retrieved.text = truncate_chars(&retrieved.text, context_limit).to_string();

    tracing::debug!(
        sources = ?retrieved.sources,
        context_chars = retrieved.text.chars().count(),
        "retrieved corpus context"
    );
    Ok(retrieved)
}
