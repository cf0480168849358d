use sqlx::PgPool;

use crate::db::models::LearningTask;

const COLUMNS: &str = "\
    id, course_id, title, instructions_md, hints_md, criteria, created_at, updated_at";

pub(crate) async fn find_by_id(
    pool: &PgPool,
    id: &str,
) -> Result<Option<LearningTask>, sqlx::Error> {
    sqlx::query_as::<_, LearningTask>(&format!(
        "SELECT {COLUMNS}
         FROM learning_tasks
         WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}
