//! Durable storage of rendered pages plus the extraction status flip.
//!
//! Storage writes and the status update are not transactional, so ordering
//! is the correctness contract here: every page object is written before
//! the submission is marked extracted. A crash mid-write leaves the
//! submission unmarked, and because keys derive deterministically from the
//! scope a retry overwrites the same objects.

use async_trait::async_trait;
use thiserror::Error;

use crate::services::pdf_render::RenderedPage;

pub(crate) const PAGE_CONTENT_TYPE: &str = "image/png";

#[async_trait]
pub(crate) trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str)
        -> anyhow::Result<()>;
    async fn get_object(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
pub(crate) trait ExtractionSink: Send + Sync {
    async fn mark_extracted(&self, submission_id: &str, page_keys: &[String])
        -> anyhow::Result<()>;
}

/// Identifies where derived pages for one submission live.
#[derive(Debug, Clone)]
pub(crate) struct PageScope<'a> {
    pub(crate) course_id: &'a str,
    pub(crate) task_id: &'a str,
    pub(crate) student_id: &'a str,
    pub(crate) submission_id: &'a str,
}

pub(crate) fn page_key(scope: &PageScope<'_>, page_number: usize) -> String {
    format!(
        "submissions/{}/{}/{}/derived/{}/page_{:04}.png",
        scope.course_id, scope.task_id, scope.student_id, scope.submission_id, page_number
    )
}

#[derive(Debug, Error)]
pub(crate) enum PersistError {
    #[error("failed to store page object {key}")]
    Write {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to record extracted pages for submission {submission_id}")]
    Mark {
        submission_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Writes all pages sequentially, then marks the submission extracted with
/// the full ordered key list. Page numbering starts at 1.
pub(crate) async fn persist_rendered_pages(
    store: &dyn ObjectStore,
    sink: &dyn ExtractionSink,
    scope: &PageScope<'_>,
    pages: &[RenderedPage],
) -> Result<Vec<String>, PersistError> {
    let mut keys = Vec::with_capacity(pages.len());

    for (position, page) in pages.iter().enumerate() {
        let key = page_key(scope, position + 1);
        store
            .put_object(&key, page.png.clone(), PAGE_CONTENT_TYPE)
            .await
            .map_err(|source| PersistError::Write {
                key: key.clone(),
                source,
            })?;
        keys.push(key);
    }

    sink.mark_extracted(scope.submission_id, &keys)
        .await
        .map_err(|source| PersistError::Mark {
            submission_id: scope.submission_id.to_string(),
            source,
        })?;

    Ok(keys)
}
