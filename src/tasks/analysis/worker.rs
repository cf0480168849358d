use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use sqlx::PgPool;
use thiserror::Error;

use crate::core::config::{AiBackend, Settings};
use crate::core::state::AppState;
use crate::core::time::{primitive_now_utc as now_primitive, seconds_as_duration};
use crate::db::models::{AnalysisJob, Submission};
use crate::db::types::{AnalysisStatus, SubmissionKind};
use crate::repositories;
use crate::services::feedback::{
    self, FeedbackError, FeedbackOrchestrator, FeedbackRequest, FeedbackResult,
};
use crate::services::image_prep::{self, PreprocessOptions};
use crate::services::ollama::OllamaClient;
use crate::services::page_store::{self, ExtractionSink, ObjectStore, PageScope};
use crate::services::pdf_render::{self, PageHook, RenderError, RenderOptions};
use crate::services::vision_extract::{self, OllamaVision, StubVision, VisionError, VisionModel};

/// Backend-selected model services shared by all worker loops.
pub(crate) struct AnalysisServices {
    vision: Box<dyn VisionModel>,
    feedback: FeedbackService,
}

enum FeedbackService {
    Stub,
    Local(FeedbackOrchestrator),
}

impl AnalysisServices {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let ai = settings.ai();
        match ai.backend {
            AiBackend::Stub => {
                Ok(Self { vision: Box::new(StubVision), feedback: FeedbackService::Stub })
            }
            AiBackend::Local => {
                let vision_client = OllamaClient::new(&ai.ollama_base_url)?;
                let vision = OllamaVision::new(
                    vision_client,
                    &ai.vision_model,
                    Duration::from_secs(ai.timeout_vision_seconds),
                );
                let orchestrator = FeedbackOrchestrator::from_settings(ai)?;
                Ok(Self {
                    vision: Box::new(vision),
                    feedback: FeedbackService::Local(orchestrator),
                })
            }
        }
    }

    async fn run_feedback(
        &self,
        request: FeedbackRequest<'_>,
    ) -> Result<FeedbackResult, FeedbackError> {
        match &self.feedback {
            FeedbackService::Stub => Ok(feedback::stub_feedback(request.criteria)),
            FeedbackService::Local(orchestrator) => orchestrator.analyze(request).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Vision,
    Feedback,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Vision => "vision",
            Phase::Feedback => "feedback",
        }
    }

    fn failure_code(self) -> &'static str {
        match self {
            Phase::Vision => "vision_failed",
            Phase::Feedback => "feedback_failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
enum PipelineError {
    #[error("{message}")]
    Input { code: &'static str, message: String },
    #[error("transient {phase} failure: {message}")]
    Transient { phase: Phase, message: String },
    #[error("permanent {phase} failure: {message}")]
    Permanent { phase: Phase, message: String },
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

struct PipelineOutcome {
    text_md: String,
    analysis_json: serde_json::Value,
    feedback_md: String,
}

pub(crate) async fn lease_next_job(state: &AppState) -> Result<Option<AnalysisJob>> {
    let now = now_primitive();
    let leased_until = now + seconds_as_duration(state.settings().worker().lease_seconds);
    repositories::jobs::lease_next(state.db(), now, leased_until)
        .await
        .context("Failed to lease analysis job")
}

pub(crate) async fn process_job(
    state: &AppState,
    services: &AnalysisServices,
    job: &AnalysisJob,
) -> Result<()> {
    let Some(submission) = repositories::submissions::find_by_id(state.db(), &job.submission_id)
        .await
        .context("Failed to fetch submission")?
    else {
        tracing::warn!(
            job_id = %job.id,
            submission_id = %job.submission_id,
            "Submission missing for queued job; dropping job"
        );
        delete_job(state, job).await?;
        return Ok(());
    };

    if matches!(submission.analysis_status, AnalysisStatus::Completed | AnalysisStatus::Failed) {
        tracing::info!(
            submission_id = %submission.id,
            status = ?submission.analysis_status,
            "Submission already terminal; dropping job"
        );
        delete_job(state, job).await?;
        return Ok(());
    }

    let started = Instant::now();
    match run_pipeline(state, services, &submission).await {
        Ok(outcome) => {
            repositories::submissions::mark_completed(
                state.db(),
                &submission.id,
                &outcome.text_md,
                &outcome.analysis_json,
                &outcome.feedback_md,
                now_primitive(),
            )
            .await
            .context("Failed to mark submission completed")?;
            delete_job(state, job).await?;

            metrics::counter!("analysis_jobs_processed_total", "status" => "completed")
                .increment(1);
            metrics::histogram!("analysis_duration_seconds").record(started.elapsed().as_secs_f64());
            tracing::info!(submission_id = %submission.id, "Submission analysis completed");
            Ok(())
        }
        Err(PipelineError::Input { code, message }) => {
            fail_submission(state, job, &submission, code, &message).await
        }
        Err(PipelineError::Transient { phase, message }) => {
            handle_transient(state, job, &submission, phase, &message).await
        }
        Err(PipelineError::Permanent { phase, message }) => {
            fail_submission(state, job, &submission, phase.failure_code(), &message).await
        }
        Err(PipelineError::Infra(err)) => Err(err),
    }
}

async fn run_pipeline(
    state: &AppState,
    services: &AnalysisServices,
    submission: &Submission,
) -> Result<PipelineOutcome, PipelineError> {
    let text_md = extract_stage(state, services, submission).await?;
    let feedback = feedback_stage(state, services, submission, &text_md).await?;

    Ok(PipelineOutcome {
        text_md,
        analysis_json: feedback.analysis_json,
        feedback_md: feedback.feedback_md,
    })
}

async fn extract_stage(
    state: &AppState,
    services: &AnalysisServices,
    submission: &Submission,
) -> Result<String, PipelineError> {
    match submission.kind {
        SubmissionKind::Text => Ok(vision_extract::passthrough_text(
            submission.text_body.as_deref().unwrap_or_default(),
        )),
        SubmissionKind::File => extract_pdf(state, services, submission).await,
        SubmissionKind::Image => extract_image(state, services, submission).await,
    }
}

async fn extract_pdf(
    state: &AppState,
    services: &AnalysisServices,
    submission: &Submission,
) -> Result<String, PipelineError> {
    check_size_limit(submission, state.settings().storage().max_upload_size_mb)?;

    let mime = submission.mime_type.as_deref().unwrap_or_default();
    if mime != "application/pdf" {
        return Err(PipelineError::Input {
            code: "input_unsupported",
            message: format!("expected application/pdf, got {mime}"),
        });
    }

    let bytes = fetch_object(state, submission).await?;

    let (pages, meta) =
        pdf_render::render_async(bytes, RenderOptions::default(), Some(page_hook()))
            .await
            .map_err(render_error)?;

    if pages.is_empty() {
        return Err(PipelineError::Input {
            code: "input_unsupported",
            message: "document contains no renderable pages".to_string(),
        });
    }

    tracing::info!(
        submission_id = %submission.id,
        rendered_pages = pages.len(),
        total_pages = meta.page_count,
        "Rendered submission pages"
    );

    let storage = state.storage().ok_or_else(storage_unconfigured)?;
    let scope = PageScope {
        course_id: &submission.course_id,
        task_id: &submission.task_id,
        student_id: &submission.student_id,
        submission_id: &submission.id,
    };
    let sink = PgExtractionSink { pool: state.db() };
    let keys = page_store::persist_rendered_pages(storage, &sink, &scope, &pages)
        .await
        .map_err(|err| PipelineError::Input {
            code: "input_corrupt",
            message: err.to_string(),
        })?;

    tracing::info!(submission_id = %submission.id, pages = keys.len(), "Persisted derived pages");

    let page_bytes: Vec<&[u8]> = pages.iter().map(|page| page.png.as_slice()).collect();
    let transcript = vision_extract::extract(&page_bytes, services.vision.as_ref())
        .await
        .map_err(vision_error)?;

    tracing::info!(
        submission_id = %submission.id,
        pages = page_bytes.len(),
        source = services.vision.id(),
        "Vision extraction complete"
    );

    Ok(transcript.text_md)
}

async fn extract_image(
    state: &AppState,
    services: &AnalysisServices,
    submission: &Submission,
) -> Result<String, PipelineError> {
    check_size_limit(submission, state.settings().storage().max_upload_size_mb)?;

    let mime = submission.mime_type.as_deref().unwrap_or_default();
    vision_extract::ensure_supported_mime(mime).map_err(|err| PipelineError::Input {
        code: "input_unsupported",
        message: err.to_string(),
    })?;

    let bytes = fetch_object(state, submission).await?;

    let transcript = vision_extract::extract(&[bytes.as_slice()], services.vision.as_ref())
        .await
        .map_err(vision_error)?;

    tracing::info!(
        submission_id = %submission.id,
        source = services.vision.id(),
        "Vision extraction complete"
    );

    Ok(transcript.text_md)
}

async fn feedback_stage(
    state: &AppState,
    services: &AnalysisServices,
    submission: &Submission,
    text_md: &str,
) -> Result<FeedbackResult, PipelineError> {
    let task = repositories::tasks::find_by_id(state.db(), &submission.task_id)
        .await
        .context("Failed to fetch learning task")?;

    let (criteria, instructions, hints) = match task {
        Some(task) => (task.criteria.0, task.instructions_md, task.hints_md),
        None => {
            tracing::warn!(
                submission_id = %submission.id,
                task_id = %submission.task_id,
                "Learning task missing; generating feedback without criteria"
            );
            (Vec::new(), None, None)
        }
    };

    let request = FeedbackRequest {
        text: text_md,
        criteria: &criteria,
        teacher_instructions: instructions.as_deref(),
        hints: hints.as_deref(),
    };

    let mut result = services.run_feedback(request).await.map_err(feedback_error)?;

    if feedback::should_degrade(result.parse_status, &result.feedback_md) {
        tracing::info!(
            submission_id = %submission.id,
            parse_status = result.parse_status,
            "Degraded feedback replaced by direct result"
        );
        result = feedback::direct_feedback(&criteria);
    }

    Ok(result)
}

async fn fetch_object(
    state: &AppState,
    submission: &Submission,
) -> Result<Vec<u8>, PipelineError> {
    let storage = state.storage().ok_or_else(storage_unconfigured)?;
    let key = submission.storage_key.as_deref().ok_or_else(|| PipelineError::Input {
        code: "input_unsupported",
        message: "submission has no storage key".to_string(),
    })?;

    let bytes = storage.get_object(key).await.map_err(|err| PipelineError::Input {
        code: "input_corrupt",
        message: format!("failed to fetch stored object: {err:#}"),
    })?;

    vision_extract::verify_integrity(&bytes, submission.size_bytes, submission.sha256.as_deref())
        .map_err(|err| PipelineError::Input {
            code: "input_unsupported",
            message: err.to_string(),
        })?;

    Ok(bytes)
}

fn check_size_limit(submission: &Submission, max_upload_size_mb: u64) -> Result<(), PipelineError> {
    let limit = max_upload_size_mb.saturating_mul(1024 * 1024);
    let too_large = submission.size_bytes.map(|size| size > limit as i64).unwrap_or(false);
    if too_large {
        return Err(PipelineError::Input {
            code: "input_too_large",
            message: format!("submission exceeds the {limit} byte limit"),
        });
    }
    Ok(())
}

fn storage_unconfigured() -> PipelineError {
    PipelineError::Infra(anyhow::anyhow!(
        "S3 storage not configured; cannot process stored submissions"
    ))
}

/// Grayscale cleanup applied to every rendered page before encoding.
fn page_hook() -> Arc<PageHook> {
    Arc::new(|image: DynamicImage| {
        DynamicImage::ImageLuma8(image_prep::preprocess(
            image.to_luma8(),
            PreprocessOptions::default(),
        ))
    })
}

fn render_error(err: RenderError) -> PipelineError {
    let code = match &err {
        RenderError::Unavailable(_) => "input_unsupported",
        RenderError::FailedToOpen | RenderError::PageFailed { .. } | RenderError::Task(_) => {
            "input_corrupt"
        }
    };
    PipelineError::Input { code, message: err.to_string() }
}

fn vision_error(err: VisionError) -> PipelineError {
    match err {
        VisionError::Transient(message) => {
            PipelineError::Transient { phase: Phase::Vision, message }
        }
        VisionError::Permanent(message) => {
            PipelineError::Permanent { phase: Phase::Vision, message }
        }
    }
}

fn feedback_error(err: FeedbackError) -> PipelineError {
    match err {
        FeedbackError::Transient(message) => {
            PipelineError::Transient { phase: Phase::Feedback, message }
        }
        FeedbackError::Permanent(message) => {
            PipelineError::Permanent { phase: Phase::Feedback, message }
        }
    }
}

fn backoff_delay(backoff_seconds: u64, retry_count: u32) -> u64 {
    backoff_seconds.saturating_mul(2u64.saturating_pow(retry_count))
}

/// A leased job always carries a key; an empty fallback simply matches no
/// row, so a lost lease can never touch another worker's job.
fn lease_key(job: &AnalysisJob) -> &str {
    job.lease_key.as_deref().unwrap_or_default()
}

async fn handle_transient(
    state: &AppState,
    job: &AnalysisJob,
    submission: &Submission,
    phase: Phase,
    message: &str,
) -> Result<()> {
    let worker = state.settings().worker();
    if (job.retry_count as u32) >= worker.max_retries {
        tracing::error!(
            submission_id = %submission.id,
            phase = phase.as_str(),
            retries = job.retry_count,
            "Analysis retries exhausted"
        );
        return fail_submission(state, job, submission, phase.failure_code(), message).await;
    }

    let now = now_primitive();
    repositories::submissions::record_retry(state.db(), &submission.id, phase.as_str(), now)
        .await
        .context("Failed to record submission retry")?;

    let delay = backoff_delay(worker.backoff_seconds, job.retry_count as u32);
    let visible_at = now + seconds_as_duration(delay);
    let requeued =
        repositories::jobs::requeue_with_backoff(state.db(), &job.id, lease_key(job), visible_at, now)
            .await
            .context("Failed to requeue analysis job")?;
    if !requeued {
        tracing::warn!(job_id = %job.id, "Lease lost before requeue; leaving job to its owner");
        return Ok(());
    }

    metrics::counter!("analysis_jobs_retried_total", "phase" => phase.as_str()).increment(1);
    tracing::warn!(
        submission_id = %submission.id,
        phase = phase.as_str(),
        retry_count = job.retry_count + 1,
        backoff_seconds = delay,
        error = message,
        "Transient analysis failure; requeued with backoff"
    );

    Ok(())
}

async fn fail_submission(
    state: &AppState,
    job: &AnalysisJob,
    submission: &Submission,
    code: &'static str,
    message: &str,
) -> Result<()> {
    let now = now_primitive();
    repositories::submissions::mark_failed(state.db(), &submission.id, code, message, now)
        .await
        .context("Failed to mark submission failed")?;

    let marked = repositories::jobs::mark_failed(state.db(), &job.id, lease_key(job), message, now)
        .await
        .context("Failed to mark analysis job failed")?;
    if !marked {
        tracing::warn!(job_id = %job.id, "Lease lost before job could be marked failed");
    }

    metrics::counter!("analysis_jobs_failed_total", "error_code" => code).increment(1);
    metrics::counter!("analysis_jobs_processed_total", "status" => "failed").increment(1);
    tracing::error!(
        submission_id = %submission.id,
        error_code = code,
        error = message,
        "Submission analysis failed terminally"
    );

    Ok(())
}

async fn delete_job(state: &AppState, job: &AnalysisJob) -> Result<()> {
    let deleted = repositories::jobs::delete(state.db(), &job.id, lease_key(job))
        .await
        .context("Failed to delete analysis job")?;
    if !deleted {
        tracing::warn!(job_id = %job.id, "Analysis job already removed or lease lost");
    }
    Ok(())
}

struct PgExtractionSink<'a> {
    pool: &'a PgPool,
}

#[async_trait]
impl ExtractionSink for PgExtractionSink<'_> {
    async fn mark_extracted(&self, submission_id: &str, page_keys: &[String]) -> Result<()> {
        repositories::submissions::mark_extracted(self.pool, submission_id, page_keys, now_primitive())
            .await
            .context("Failed to mark submission extracted")
    }
}
