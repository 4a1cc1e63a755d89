//! Web search with a primary and a secondary provider.

use crate::config::SearchConfig;
use crate::error::SearchError;
use crate::llm::routing::{is_rate_limit_error, is_rate_limit_status};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

/// Non-empty results tagged with the provider that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebResults {
    pub provider: &'static str,
    pub results: Vec<SearchResult>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Up to `max_results` results. An unconfigured provider returns none.
    async fn search(&self, query: &str, max_results: usize)
    -> Result<Vec<SearchResult>, SearchError>;
}

fn request_error(provider: &'static str, reason: String) -> SearchError {
    if is_rate_limit_error(&reason) {
        SearchError::RateLimited { provider }
    } else {
        SearchError::Request { provider, reason }
    }
}

async fn fetch_json(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, SearchError> {
    let response = request
        .send()
        .await
        .map_err(|e| request_error(provider, e.to_string()))?;

    let status = response.status();
    if is_rate_limit_status(status.as_u16()) {
        return Err(SearchError::RateLimited { provider });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(request_error(provider, format!("{status}: {body}")));
    }

    response
        .json()
        .await
        .map_err(|e| request_error(provider, format!("invalid response: {e}")))
}

fn string_field(item: &serde_json::Value, key: &str) -> String {
    item[key].as_str().unwrap_or_default().to_string()
}

/// Brave Search API.
pub struct BraveSearch {
    http_client: reqwest::Client,
    api_key: Option<String>,
}

impl BraveSearch {
    pub fn new(http_client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            http_client,
            api_key,
        }
    }
}

#[async_trait]
impl SearchProvider for BraveSearch {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let Some(api_key) = &self.api_key else {
            return Ok(Vec::new());
        };

        let count = max_results.clamp(1, 20).to_string();
        let request = self
            .http_client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", count.as_str())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", api_key);

        let body = fetch_json(self.name(), request).await?;
        Ok(body["web"]["results"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .take(max_results)
                    .map(|item| SearchResult {
                        title: string_field(item, "title"),
                        link: string_field(item, "url"),
                        snippet: string_field(item, "description"),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Google Custom Search JSON API.
pub struct GoogleSearch {
    http_client: reqwest::Client,
    api_key: Option<String>,
    cse_id: Option<String>,
}

impl GoogleSearch {
    pub fn new(http_client: reqwest::Client, api_key: Option<String>, cse_id: Option<String>) -> Self {
        Self {
            http_client,
            api_key,
            cse_id,
        }
    }
}

#[async_trait]
impl SearchProvider for GoogleSearch {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let (Some(api_key), Some(cse_id)) = (&self.api_key, &self.cse_id) else {
            return Ok(Vec::new());
        };

        let num = max_results.clamp(1, 10).to_string();
        let request = self
            .http_client
            .get("https://www.googleapis.com/customsearch/v1")
            .query(&[
                ("key", api_key.as_str()),
                ("cx", cse_id.as_str()),
                ("q", query),
                ("num", num.as_str()),
            ]);

        let body = fetch_json(self.name(), request).await?;
        Ok(body["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .take(max_results)
                    .map(|item| SearchResult {
                        title: string_field(item, "title"),
                        link: string_field(item, "link"),
                        snippet: string_field(item, "snippet"),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Queries both providers concurrently and prefers the primary's results.
#[derive(Clone)]
pub struct WebSearch {
    primary: Arc<dyn SearchProvider>,
    secondary: Arc<dyn SearchProvider>,
    max_results: usize,
}

impl WebSearch {
    pub fn new(
        primary: Arc<dyn SearchProvider>,
        secondary: Arc<dyn SearchProvider>,
        max_results: usize,
    ) -> Self {
        Self {
            primary,
            secondary,
            max_results,
        }
    }

    /// Brave as primary, Google as secondary.
    pub fn from_config(config: &SearchConfig, http_client: reqwest::Client) -> Self {
        Self::new(
            Arc::new(BraveSearch::new(http_client.clone(), config.brave_key.clone())),
            Arc::new(GoogleSearch::new(
                http_client,
                config.google_key.clone(),
                config.google_cse_id.clone(),
            )),
            config.max_results,
        )
    }

    /// `None` when neither provider found anything. Failures count as no results.
    pub async fn search(&self, query: &str) -> Option<WebResults> {
        let (primary, secondary) = tokio::join!(
            self.primary.search(query, self.max_results),
            self.secondary.search(query, self.max_results),
        );

        let primary = settle(self.primary.name(), primary);
        let secondary = settle(self.secondary.name(), secondary);

        let results = if !primary.is_empty() {
            WebResults {
                provider: self.primary.name(),
                results: primary,
            }
        } else if !secondary.is_empty() {
            WebResults {
                provider: self.secondary.name(),
                results: secondary,
            }
        } else {
            tracing::debug!(query, "web search found nothing");
            return None;
        };

        tracing::debug!(
            query,
            provider = results.provider,
            count = results.results.len(),
            "web search completed"
        );
        Some(results)
    }
}

fn settle(provider: &str, outcome: Result<Vec<SearchResult>, SearchError>) -> Vec<SearchResult> {
    match outcome {
        Ok(results) => results,
        Err(SearchError::RateLimited { .. }) => {
            tracing::warn!(provider, "search provider rate limited, using no results");
            Vec::new()
        }
        Err(error) => {
            tracing::warn!(provider, %error, "search provider failed, using no results");
            Vec::new()
        }
    }
}

/// Prompt rendering. No results renders as an empty string.
pub fn render(results: Option<&WebResults>) -> String {
    let Some(results) = results else {
        return String::new();
    };

    let mut rendered = format!("{} results:", results.provider);
    for (index, result) in results.results.iter().enumerate() {
        rendered.push_str(&format!(
            "\n{}. {} ({}): {}",
            index + 1,
            result.title,
            result.link,
            result.snippet
        ));
    }
    rendered
}
