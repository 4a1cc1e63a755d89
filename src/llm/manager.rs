//! OpenAI-compatible HTTP client for completions and embeddings.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::llm::model::{CompletionRequest, Embedder, LanguageModel};
use anyhow::Context as _;
use async_trait::async_trait;

/// Talks to a hosted or local OpenAI-compatible endpoint.
pub struct LlmManager {
    config: LlmConfig,
    /// HTTP client for making requests.
    http_client: reqwest::Client,
}

impl LlmManager {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .with_context(|| "failed to build HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Get the HTTP client.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, LlmError> {
        let url = format!("{}/v1/{path}", self.config.base_url.trim_end_matches('/'));

        let mut request_builder = self
            .http_client
            .post(&url)
            .header("content-type", "application/json");
        if let Some(api_key) = &self.config.api_key {
            request_builder = request_builder.header("authorization", format!("Bearer {api_key}"));
        }

        let response = request_builder
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::ProviderRequest(format!("failed to read response body: {e}")))?;

        let response_body: serde_json::Value =
            serde_json::from_str(&response_text).map_err(|e| {
                LlmError::ProviderRequest(format!(
                    "response ({status}) is not valid JSON: {e}\nBody: {}",
                    truncate_body(&response_text)
                ))
            })?;

        if !status.is_success() {
            let message = response_body["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: message.to_string(),
            });
        }

        Ok(response_body)
    }
}

#[async_trait]
impl LanguageModel for LlmManager {
    async fn complete(&self, request: CompletionRequest) -> std::result::Result<String, LlmError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
        });

        if let Some(temperature) = self.config.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        if request.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        tracing::debug!(
            model = %request.model,
            json_mode = request.json_mode,
            messages = request.messages.len(),
            "sending chat completion"
        );

        let response_body = self.post_json("chat/completions", &body).await?;
        parse_completion_text(&response_body)
    }
}

#[async_trait]
impl Embedder for LlmManager {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, LlmError> {
        let body = serde_json::json!({
            "model": self.config.embedding_model,
            "input": text,
        });

        let response_body = self.post_json("embeddings", &body).await?;
        parse_embedding(&response_body)
    }
}

fn parse_completion_text(body: &serde_json::Value) -> std::result::Result<String, LlmError> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
        .ok_or(LlmError::EmptyResponse)
}

fn parse_embedding(body: &serde_json::Value) -> std::result::Result<Vec<f32>, LlmError> {
    let values = body["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| LlmError::EmbeddingFailed("response has no embedding".into()))?;

    values
        .iter()
        .map(|value| {
            value
                .as_f64()
                .map(|number| number as f32)
                .ok_or_else(|| LlmError::EmbeddingFailed("non-numeric embedding value".into()))
        })
        .collect()
}

fn truncate_body(body: &str) -> &str {
    let limit = 500;
    match body.char_indices().nth(limit) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_text_is_trimmed() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "  hello there \n"}}]
        });
        assert_eq!(parse_completion_text(&body).unwrap(), "hello there");
    }

    #[test]
    fn empty_completion_is_an_error() {
        let body = serde_json::json!({"choices": [{"message": {"content": "   "}}]});
        assert!(matches!(
            parse_completion_text(&body),
            Err(LlmError::EmptyResponse)
        ));

        let body = serde_json::json!({"choices": []});
        assert!(matches!(
            parse_completion_text(&body),
            Err(LlmError::EmptyResponse)
        ));
    }

    #[test]
    fn embedding_is_parsed() {
        let body = serde_json::json!({"data": [{"embedding": [0.5, -1.0, 0.25]}]});
        assert_eq!(parse_embedding(&body).unwrap(), vec![0.5, -1.0, 0.25]);
    }

    #[test]
    fn malformed_embedding_is_rejected() {
        let body = serde_json::json!({"data": [{"embedding": [0.5, "x"]}]});
        assert!(parse_embedding(&body).is_err());
        assert!(parse_embedding(&serde_json::json!({})).is_err());
    }

    #[test]
    fn truncate_body_respects_char_boundaries() {
        let body = "é".repeat(600);
        assert_eq!(truncate_body(&body).chars().count(), 500);
        assert_eq!(truncate_body("short"), "short");
    }
}
