use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::Submission;
use crate::db::types::AnalysisStatus;

const COLUMNS: &str = "\
    id, course_id, task_id, student_id, kind, storage_key, mime_type, size_bytes, sha256, \
    text_body, analysis_status, analysis_json, feedback_md, page_keys, error_code, \
    error_message, retry_phase, retry_count, extracted_at, completed_at, failed_at, \
    created_at, updated_at";

const ERROR_MESSAGE_MAX_CHARS: usize = 1024;

pub(crate) async fn find_by_id(
    pool: &PgPool,
    id: &str,
) -> Result<Option<Submission>, sqlx::Error> {
    sqlx::query_as::<_, Submission>(&format!(
        "SELECT {COLUMNS}
         FROM learning_submissions
         WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn mark_extracted(
    pool: &PgPool,
    id: &str,
    page_keys: &[String],
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE learning_submissions
         SET analysis_status = $1,
             page_keys = $2,
             extracted_at = $3,
             updated_at = $3
         WHERE id = $4",
    )
    .bind(AnalysisStatus::Extracted)
    .bind(Json(page_keys))
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn mark_completed(
    pool: &PgPool,
    id: &str,
    text_body: &str,
    analysis_json: &serde_json::Value,
    feedback_md: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE learning_submissions
         SET analysis_status = $1,
             text_body = $2,
             analysis_json = $3,
             feedback_md = $4,
             error_code = NULL,
             error_message = NULL,
             completed_at = $5,
             updated_at = $5
         WHERE id = $6",
    )
    .bind(AnalysisStatus::Completed)
    .bind(text_body)
    .bind(Json(analysis_json))
    .bind(feedback_md)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn mark_failed(
    pool: &PgPool,
    id: &str,
    error_code: &str,
    error_message: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE learning_submissions
         SET analysis_status = $1,
             error_code = $2,
             error_message = $3,
             failed_at = $4,
             updated_at = $4
         WHERE id = $5",
    )
    .bind(AnalysisStatus::Failed)
    .bind(error_code)
    .bind(truncate_error_message(error_message))
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn record_retry(
    pool: &PgPool,
    id: &str,
    phase: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE learning_submissions
         SET retry_phase = $1,
             retry_count = retry_count + 1,
             updated_at = $2
         WHERE id = $3",
    )
    .bind(phase)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

fn truncate_error_message(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_MAX_CHARS {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(ERROR_MESSAGE_MAX_CHARS).collect();
    truncated.push_str("...");
    truncated
}
