use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{AnalysisStatus, JobStatus, SubmissionKind};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Submission {
    pub(crate) id: String,
    pub(crate) course_id: String,
    pub(crate) task_id: String,
    pub(crate) student_id: String,
    pub(crate) kind: SubmissionKind,
    pub(crate) storage_key: Option<String>,
    pub(crate) mime_type: Option<String>,
    pub(crate) size_bytes: Option<i64>,
    pub(crate) sha256: Option<String>,
    pub(crate) text_body: Option<String>,
    pub(crate) analysis_status: AnalysisStatus,
    pub(crate) analysis_json: Option<Json<serde_json::Value>>,
    pub(crate) feedback_md: Option<String>,
    pub(crate) page_keys: Option<Json<Vec<String>>>,
    pub(crate) error_code: Option<String>,
    pub(crate) error_message: Option<String>,
    pub(crate) retry_phase: Option<String>,
    pub(crate) retry_count: i32,
    pub(crate) extracted_at: Option<PrimitiveDateTime>,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
    pub(crate) failed_at: Option<PrimitiveDateTime>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct LearningTask {
    pub(crate) id: String,
    pub(crate) course_id: String,
    pub(crate) title: String,
    pub(crate) instructions_md: Option<String>,
    pub(crate) hints_md: Option<String>,
    pub(crate) criteria: Json<Vec<String>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct AnalysisJob {
    pub(crate) id: String,
    pub(crate) submission_id: String,
    pub(crate) status: JobStatus,
    pub(crate) retry_count: i32,
    pub(crate) visible_at: PrimitiveDateTime,
    pub(crate) lease_key: Option<String>,
    pub(crate) leased_until: Option<PrimitiveDateTime>,
    pub(crate) last_error: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}
