//! Page-by-page text extraction through a vision model.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

use crate::services::ollama::{GenerateRequest, ModelError, OllamaClient};

const OCR_PROMPT: &str = "Transcribe the exact visible text as Markdown. \
Preserve reading order, headings, lists, and tables. \
Do not correct spelling, do not summarize, do not add commentary.";

const EMPTY_SUBMISSION: &str = "# (empty submission)";

const SUPPORTED_MIME: &[&str] = &["image/jpeg", "image/png", "application/pdf"];

#[derive(Debug, Error)]
pub(crate) enum VisionError {
    #[error("transient vision failure: {0}")]
    Transient(String),
    #[error("permanent vision failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub(crate) trait VisionModel: Send + Sync {
    fn id(&self) -> &'static str;
    async fn analyze(&self, image: &[u8]) -> Result<String, VisionError>;
}

#[derive(Debug, Clone)]
pub(crate) struct PageTranscript {
    pub(crate) text_md: String,
    pub(crate) analysis_json: serde_json::Value,
}

/// Transcribes pages strictly in order and assembles one Markdown document
/// with a `## Page N` heading per page. No internal retry: the caller owns
/// retry policy.
pub(crate) async fn extract(
    pages: &[&[u8]],
    vision: &dyn VisionModel,
) -> Result<PageTranscript, VisionError> {
    let mut sections = Vec::with_capacity(pages.len());
    for (index, bytes) in pages.iter().enumerate() {
        let text = vision.analyze(bytes).await?;
        sections.push(format!("## Page {}\n\n{}\n", index + 1, text));
    }

    let text_md = sections.join("\n\n").trim().to_string();
    let analysis_json = serde_json::json!({"pages": pages.len(), "source": vision.id()});
    Ok(PageTranscript { text_md, analysis_json })
}

/// Text submissions skip the vision stage entirely.
pub(crate) fn passthrough_text(body: &str) -> String {
    if body.trim().is_empty() {
        EMPTY_SUBMISSION.to_string()
    } else {
        body.to_string()
    }
}

pub(crate) fn ensure_supported_mime(mime: &str) -> Result<(), VisionError> {
    if SUPPORTED_MIME.contains(&mime) {
        Ok(())
    } else {
        Err(VisionError::Permanent(format!("unsupported mime: {mime}")))
    }
}

/// Confirms the fetched object still matches what the submitter declared.
pub(crate) fn verify_integrity(
    bytes: &[u8],
    declared_size: Option<i64>,
    declared_sha256: Option<&str>,
) -> Result<(), VisionError> {
    if let Some(declared) = declared_size {
        if declared != bytes.len() as i64 {
            return Err(VisionError::Permanent(format!(
                "size_mismatch: declared {declared}, stored {}",
                bytes.len()
            )));
        }
    }

    if let Some(declared) = declared_sha256 {
        let actual = hex::encode(Sha256::digest(bytes));
        if !declared.eq_ignore_ascii_case(&actual) {
            return Err(VisionError::Permanent(
                "hash_mismatch: stored object does not match declared sha256".to_string(),
            ));
        }
    }

    Ok(())
}

/// Models often wrap transcripts in a Markdown code fence; unwrap one
/// outer fence if present.
fn unwrap_fenced(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.lines().count() >= 3 {
        if let (Some(start), Some(end)) = (trimmed.find('\n'), trimmed.rfind('\n')) {
            if start < end {
                return trimmed[start + 1..end].trim();
            }
        }
    }
    trimmed
}

pub(crate) struct OllamaVision {
    client: OllamaClient,
    model: String,
    timeout: Duration,
}

impl OllamaVision {
    pub(crate) fn new(client: OllamaClient, model: &str, timeout: Duration) -> Self {
        Self { client, model: model.to_string(), timeout }
    }
}

#[async_trait]
impl VisionModel for OllamaVision {
    fn id(&self) -> &'static str {
        "vision.ollama"
    }

    async fn analyze(&self, image: &[u8]) -> Result<String, VisionError> {
        let response = self
            .client
            .generate(GenerateRequest {
                model: &self.model,
                prompt: OCR_PROMPT,
                images: &[image],
                timeout: self.timeout,
                raw: false,
            })
            .await
            .map_err(vision_error)?;

        let text = unwrap_fenced(&response);
        if text.is_empty() {
            return Err(VisionError::Transient("empty response from local vision".to_string()));
        }
        Ok(text.to_string())
    }
}

/// No-model transcription for the stub backend.
pub(crate) struct StubVision;

#[async_trait]
impl VisionModel for StubVision {
    fn id(&self) -> &'static str {
        "vision.stub"
    }

    async fn analyze(&self, _image: &[u8]) -> Result<String, VisionError> {
        Ok("(Transkription im Stub-Betrieb nicht verfügbar.)".to_string())
    }
}

fn vision_error(err: ModelError) -> VisionError {
    match err {
        ModelError::Timeout => VisionError::Transient("vision call timed out".to_string()),
        ModelError::Unavailable(detail) => VisionError::Transient(detail),
        ModelError::Failed(detail) => VisionError::Permanent(detail),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    struct ScriptedVision {
        calls: AtomicUsize,
        seen_first_bytes: Mutex<Vec<u8>>,
    }

    impl ScriptedVision {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0), seen_first_bytes: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedVision {
        fn id(&self) -> &'static str {
            "vision.test"
        }

        async fn analyze(&self, image: &[u8]) -> Result<String, VisionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen_first_bytes.lock().unwrap().push(image[0]);
            Ok(format!("text-{call}"))
        }
    }

    struct FailingVision;

    #[async_trait]
    impl VisionModel for FailingVision {
        fn id(&self) -> &'static str {
            "vision.test"
        }

        async fn analyze(&self, _image: &[u8]) -> Result<String, VisionError> {
            Err(VisionError::Transient("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn extract_assembles_ordered_page_sections() {
        let vision = ScriptedVision::new();
        let pages: Vec<&[u8]> = vec![&[1u8], &[2u8], &[3u8]];

        let transcript = extract(&pages, &vision).await.unwrap();

        assert_eq!(
            transcript.text_md,
            "## Page 1\n\ntext-1\n\n\n## Page 2\n\ntext-2\n\n\n## Page 3\n\ntext-3"
        );
        assert_eq!(*vision.seen_first_bytes.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            transcript.analysis_json,
            serde_json::json!({"pages": 3, "source": "vision.test"})
        );
    }

    #[tokio::test]
    async fn extract_propagates_the_first_page_failure() {
        let pages: Vec<&[u8]> = vec![&[1u8]];
        let result = extract(&pages, &FailingVision).await;
        assert!(matches!(result, Err(VisionError::Transient(_))));
    }

    #[test]
    fn empty_text_body_becomes_placeholder_document() {
        assert_eq!(passthrough_text("   \n"), "# (empty submission)");
        assert_eq!(passthrough_text("Hallo"), "Hallo");
    }

    #[test]
    fn mime_allowlist_rejects_unknown_types() {
        assert!(ensure_supported_mime("image/png").is_ok());
        assert!(ensure_supported_mime("image/jpeg").is_ok());
        assert!(ensure_supported_mime("application/pdf").is_ok());

        let err = ensure_supported_mime("image/gif").unwrap_err();
        assert!(err.to_string().contains("unsupported mime: image/gif"));
    }

    #[test]
    fn integrity_check_flags_size_and_hash_mismatches() {
        let bytes = b"hello".as_slice();
        let sha = hex::encode(Sha256::digest(bytes));

        assert!(verify_integrity(bytes, Some(5), Some(&sha)).is_ok());
        assert!(verify_integrity(bytes, None, None).is_ok());

        let err = verify_integrity(bytes, Some(4), None).unwrap_err();
        assert!(err.to_string().contains("size_mismatch"));

        let err = verify_integrity(bytes, Some(5), Some("deadbeef")).unwrap_err();
        assert!(err.to_string().contains("hash_mismatch"));
    }

    #[test]
    fn fence_unwrap_strips_one_outer_fence() {
        assert_eq!(unwrap_fenced("```markdown\n# Titel\nText\n```"), "# Titel\nText");
        assert_eq!(unwrap_fenced("```\nplain\n```"), "plain");
        assert_eq!(unwrap_fenced("no fence"), "no fence");
        assert_eq!(unwrap_fenced("``````"), "``````");
    }
}
