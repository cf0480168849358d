use sqlx::PgPool;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::AnalysisJob;
use crate::db::types::JobStatus;

const COLUMNS: &str = "\
    id, submission_id, status, retry_count, visible_at, lease_key, leased_until, \
    last_error, created_at, updated_at";

/// Leases the oldest visible queued job. The single-statement CTE with
/// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from leasing the same
/// row; the returned lease_key guards every later mutation of the row.
pub(crate) async fn lease_next(
    pool: &PgPool,
    now: PrimitiveDateTime,
    leased_until: PrimitiveDateTime,
) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let lease_key = Uuid::new_v4().to_string();

    sqlx::query_as::<_, AnalysisJob>(&format!(
        "WITH candidate AS (
            SELECT id AS job_id
            FROM learning_submission_jobs
            WHERE status = $1
              AND visible_at <= $2
            ORDER BY visible_at, created_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE learning_submission_jobs j
        SET status = $3,
            lease_key = $4,
            leased_until = $5,
            updated_at = $2
        FROM candidate
        WHERE j.id = candidate.job_id
        RETURNING {COLUMNS}"
    ))
    .bind(JobStatus::Queued)
    .bind(now)
    .bind(JobStatus::Leased)
    .bind(lease_key)
    .bind(leased_until)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn requeue_with_backoff(
    pool: &PgPool,
    job_id: &str,
    lease_key: &str,
    visible_at: PrimitiveDateTime,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE learning_submission_jobs
         SET status = $1,
             retry_count = retry_count + 1,
             visible_at = $2,
             lease_key = NULL,
             leased_until = NULL,
             updated_at = $3
         WHERE id = $4 AND lease_key = $5",
    )
    .bind(JobStatus::Queued)
    .bind(visible_at)
    .bind(now)
    .bind(job_id)
    .bind(lease_key)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn mark_failed(
    pool: &PgPool,
    job_id: &str,
    lease_key: &str,
    last_error: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE learning_submission_jobs
         SET status = $1,
             last_error = $2,
             lease_key = NULL,
             leased_until = NULL,
             updated_at = $3
         WHERE id = $4 AND lease_key = $5",
    )
    .bind(JobStatus::Failed)
    .bind(last_error)
    .bind(now)
    .bind(job_id)
    .bind(lease_key)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn delete(
    pool: &PgPool,
    job_id: &str,
    lease_key: &str,
) -> Result<bool, sqlx::Error> {
    let deleted = sqlx::query(
        "DELETE FROM learning_submission_jobs
         WHERE id = $1 AND lease_key = $2",
    )
    .bind(job_id)
    .bind(lease_key)
    .execute(pool)
    .await?;

    Ok(deleted.rows_affected() > 0)
}

/// Returns jobs whose lease expired to the queue without touching
/// retry_count, so a crashed worker costs latency but never an attempt.
pub(crate) async fn release_expired(
    pool: &PgPool,
    now: PrimitiveDateTime,
) -> Result<u64, sqlx::Error> {
    let released = sqlx::query(
        "UPDATE learning_submission_jobs
         SET status = $1,
             lease_key = NULL,
             leased_until = NULL,
             updated_at = $2
         WHERE status = $3 AND leased_until < $2",
    )
    .bind(JobStatus::Queued)
    .bind(now)
    .bind(JobStatus::Leased)
    .execute(pool)
    .await?;

    Ok(released.rows_affected())
}
