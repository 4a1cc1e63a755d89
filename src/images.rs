//! Image generation backends and re-hosting on object storage.

use crate::config::{ImageBackend, LlmConfig};
use crate::error::ImageError;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use base64::Engine as _;
use std::sync::Arc;

/// Output dimensions supported by the hosted backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSize {
    #[default]
    Square,
    Tall,
    Wide,
}

impl ImageSize {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSize::Square => "1024x1024",
            ImageSize::Tall => "1024x1792",
            ImageSize::Wide => "1792x1024",
        }
    }

    /// Lenient parse: exact dimensions or a descriptive word. Anything else is square.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "1024x1792" | "tall" | "portrait" => ImageSize::Tall,
            "1792x1024" | "wide" | "landscape" => ImageSize::Wide,
            _ => ImageSize::Square,
        }
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient image generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub size: ImageSize,
    pub steps: u32,
    pub restore_faces: bool,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            size: ImageSize::Square,
            steps: 20,
            restore_faces: true,
        }
    }

    pub fn with_size(mut self, size: ImageSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_negative(mut self, negative_prompt: Option<String>) -> Self {
        self.negative_prompt = negative_prompt.filter(|negative| !negative.trim().is_empty());
        self
    }

    /// Fantasy preset: more steps and no face restoration.
    pub fn fantasy(mut self) -> Self {
        self.steps = 30;
        self.restore_faces = false;
        self
    }
}

/// Produces PNG bytes for a request.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>, ImageError>;

    /// Prefix for object keys of images from this backend.
    fn key_stem(&self) -> &'static str {
        ""
    }
}

/// OpenAI images API. The returned URL is short-lived, so the bytes are downloaded.
pub struct OpenAiImages {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiImages {
    pub fn new(http_client: reqwest::Client, llm: &LlmConfig, model: String) -> Self {
        Self {
            http_client,
            base_url: llm.base_url.trim_end_matches('/').to_string(),
            api_key: llm.api_key.clone(),
            model,
        }
    }
}

#[async_trait]
impl ImageGenerator for OpenAiImages {
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>, ImageError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": request.prompt,
            "size": request.size.as_str(),
            "quality": "standard",
            "n": 1,
        });

        let mut request_builder = self
            .http_client
            .post(format!("{}/v1/images/generations", self.base_url))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request_builder = request_builder.header("authorization", format!("Bearer {api_key}"));
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| ImageError::Generation(e.to_string()))?;
        let status = response.status();
        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ImageError::Generation(format!("invalid response ({status}): {e}")))?;

        if !status.is_success() {
            let message = response_body["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            return Err(ImageError::Generation(format!("{status}: {message}")));
        }

        let image_url = response_body["data"][0]["url"]
            .as_str()
            .ok_or_else(|| ImageError::Generation("response has no image URL".into()))?;

        let download = self
            .http_client
            .get(image_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ImageError::Download(e.to_string()))?;
        let bytes = download
            .bytes()
            .await
            .map_err(|e| ImageError::Download(e.to_string()))?;

        Ok(bytes.to_vec())
    }
}

/// Stable Diffusion WebUI with optional NudeNet moderation.
pub struct StableDiffusion {
    http_client: reqwest::Client,
    base_url: String,
    moderation: bool,
}

impl StableDiffusion {
    pub fn new(http_client: reqwest::Client, base_url: String, moderation: bool) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            moderation,
        }
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, String> {
        let response = self
            .http_client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("{status}: {text}"));
        }
        response.json().await.map_err(|e| e.to_string())
    }

    /// True when NudeNet found nothing to censor.
    async fn is_safe(&self, image_base64: &str) -> bool {
        let expand = vec![1; 18];
        let payload = serde_json::json!({
            "input_image": image_base64,
            "enable_nudenet": true,
            "output_mask": false,
            "filter_type": "Variable blur",
            "blur_radius": 50,
            "blur_strength_curve": 3,
            "pixelation_factor": 20,
            "fill_color": "#000000",
            "mask_shape": "Ellipse",
            "mask_blend_radius": 10,
            "rectangle_round_radius": 0,
            "nms_threshold": 0.8,
            "thresholds": [1, 1, 1, 0.5, 0.5, 1, 0.5, 1.0, 1.0, 1, 1, 1, 1, 1, 0.5, 1.0, 1.0, 1],
            "expand_horizontal": expand,
            "expand_vertical": expand,
        });

        moderation_passed(self.post("/nudenet/censor", &payload).await)
    }
}

/// A failed or malformed moderation check counts as censored.
fn moderation_passed(response: Result<serde_json::Value, String>) -> bool {
    match response {
        Ok(body) => body.get("image").is_some_and(serde_json::Value::is_null),
        Err(error) => {
            tracing::error!(%error, "moderation check failed, withholding image");
            false
        }
    }
}

#[async_trait]
impl ImageGenerator for StableDiffusion {
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>, ImageError> {
        let payload = serde_json::json!({
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt.as_deref().unwrap_or_default(),
            "steps": request.steps,
            "cfg_scale": 7,
            "restore_faces": request.restore_faces,
            "send_images": true,
            "save_images": false,
        });

        let response = self
            .post("/sdapi/v1/txt2img", &payload)
            .await
            .map_err(ImageError::Generation)?;
        let image_base64 = response["images"][0]
            .as_str()
            .ok_or_else(|| ImageError::Generation("response has no images".into()))?;

        if self.moderation && !self.is_safe(image_base64).await {
            tracing::info!(prompt = %request.prompt, "generated image was censored");
            return Err(ImageError::Censored);
        }

        base64::engine::general_purpose::STANDARD
            .decode(image_base64)
            .map_err(|e| ImageError::Generation(format!("invalid base64 image: {e}")))
    }

    fn key_stem(&self) -> &'static str {
        "diffusion_"
    }
}

/// Generates an image and re-hosts it under a unique public key.
pub struct ImageService {
    generator: Arc<dyn ImageGenerator>,
    store: Arc<dyn ObjectStore>,
    upload_prefix: String,
}

impl ImageService {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        store: Arc<dyn ObjectStore>,
        upload_prefix: String,
    ) -> Self {
        Self {
            generator,
            store,
            upload_prefix,
        }
    }

    /// Build the configured backend, or `None` when image generation is disabled.
    pub fn from_backend(
        backend: &ImageBackend,
        http_client: reqwest::Client,
        llm: &LlmConfig,
        store: Arc<dyn ObjectStore>,
        upload_prefix: String,
    ) -> Option<Self> {
        let generator: Arc<dyn ImageGenerator> = match backend {
            ImageBackend::Disabled => return None,
            ImageBackend::OpenAi { model } => {
                Arc::new(OpenAiImages::new(http_client, llm, model.clone()))
            }
            ImageBackend::StableDiffusion {
                base_url,
                moderation,
            } => Arc::new(StableDiffusion::new(
                http_client,
                base_url.clone(),
                *moderation,
            )),
        };
        Some(Self::new(generator, store, upload_prefix))
    }

    /// Generate, upload, and return the public URL.
    pub async fn generate_and_host(&self, request: &ImageRequest) -> Result<String, ImageError> {
        let bytes = self.generator.generate(request).await?;
        let key = format!(
            "{}{}{}.png",
            self.upload_prefix,
            self.generator.key_stem(),
            uuid::Uuid::new_v4()
        );
        let url = self.store.put_public(&key, bytes, "image/png").await?;
        tracing::info!(%url, size = %request.size, "hosted generated image");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeImages, MemoryStore};

    #[test]
    fn sizes_parse_leniently() {
        assert_eq!(ImageSize::parse("1024x1792"), ImageSize::Tall);
        assert_eq!(ImageSize::parse(" WIDE "), ImageSize::Wide);
        assert_eq!(ImageSize::parse("huge"), ImageSize::Square);
        assert_eq!(ImageSize::Wide.to_string(), "1792x1024");
    }

    #[test]
    fn fantasy_preset_changes_sampling() {
        let request = ImageRequest::new("a dragon").fantasy();
        assert_eq!(request.steps, 30);
        assert!(!request.restore_faces);

        let request = ImageRequest::new("a dragon").with_negative(Some("  ".into()));
        assert_eq!(request.negative_prompt, None);
    }

    #[test]
    fn moderation_fails_closed() {
        assert!(moderation_passed(Ok(serde_json::json!({"image": null}))));
        assert!(!moderation_passed(Ok(serde_json::json!({"image": "aGVsbG8="}))));
        assert!(!moderation_passed(Ok(serde_json::json!({}))));
        assert!(!moderation_passed(Err("500 Internal Server Error: nudenet crashed".into())));
    }

    #[tokio::test]
    async fn generated_image_is_uploaded_under_unique_key() {
        let store = Arc::new(MemoryStore::new("https://bucket.example.com"));
        let service = ImageService::new(
            Arc::new(FakeImages::succeeding()),
            store.clone(),
            "generated/".into(),
        );

        let first = service
            .generate_and_host(&ImageRequest::new("a castle"))
            .await
            .unwrap();
        let second = service
            .generate_and_host(&ImageRequest::new("a castle"))
            .await
            .unwrap();

        assert!(first.starts_with("https://bucket.example.com/generated/"));
        assert!(first.ends_with(".png"));
        assert_ne!(first, second);
        assert_eq!(store.uploaded_keys().len(), 2);
    }

    #[tokio::test]
    async fn censored_image_is_not_uploaded() {
        let store = Arc::new(MemoryStore::new("https://bucket.example.com"));
        let service = ImageService::new(Arc::new(FakeImages::censoring()), store.clone(), String::new());

        let result = service.generate_and_host(&ImageRequest::new("anything")).await;

        assert!(matches!(result, Err(ImageError::Censored)));
        assert!(store.uploaded_keys().is_empty());
    }
}
