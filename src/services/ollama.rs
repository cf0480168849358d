use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ModelError {
    #[error("model call timed out")]
    Timeout,
    #[error("model endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("model call failed: {0}")]
    Failed(String),
}

impl ModelError {
    /// Stable class tag for log lines. Never carries payload content.
    pub(crate) fn class(&self) -> &'static str {
        match self {
            ModelError::Timeout => "timeout",
            ModelError::Unavailable(_) => "unavailable",
            ModelError::Failed(_) => "failed",
        }
    }
}

pub(crate) struct GenerateRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) prompt: &'a str,
    pub(crate) images: &'a [&'a [u8]],
    pub(crate) timeout: Duration,
    /// Bypasses the model's chat template; used by the legacy completion
    /// path which embeds the full instruction in the prompt itself.
    pub(crate) raw: bool,
}

/// Thin client for the Ollama `/api/generate` endpoint. Carries no retry
/// logic: callers own the retry policy.
#[derive(Debug, Clone)]
pub(crate) struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub(crate) fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Ollama HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.base_url);

        let mut payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
            "options": {"temperature": 0},
        });
        if !request.images.is_empty() {
            let encoded: Vec<String> =
                request.images.iter().map(|bytes| STANDARD.encode(bytes)).collect();
            payload["images"] = json!(encoded);
        }
        if request.raw {
            payload["raw"] = json!(true);
            payload["template"] = json!("{{ .Prompt }}");
        }

        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Failed(format!("generate returned status {status}")));
        }

        let body: Value = response.json().await.map_err(|err| {
            if err.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::Failed(format!("invalid generate response: {err}"))
            }
        })?;

        match body.get("response").and_then(Value::as_str) {
            Some(text) => Ok(text.to_string()),
            None => Err(ModelError::Failed("generate response missing text".to_string())),
        }
    }
}

fn classify_send_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout
    } else if err.is_connect() {
        ModelError::Unavailable(err.to_string())
    } else {
        ModelError::Failed(err.to_string())
    }
}
