use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "submissionkind", rename_all = "lowercase")]
pub(crate) enum SubmissionKind {
    Text,
    Image,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "analysisstatus", rename_all = "lowercase")]
pub(crate) enum AnalysisStatus {
    Pending,
    Extracted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "analysisjobstatus", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Queued,
    Leased,
    Failed,
}
