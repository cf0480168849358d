pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::services::storage::StorageService;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    tracing::info!(
        environment = %settings.runtime().environment.as_str(),
        backend = %settings.ai().backend.as_str(),
        "Lernwerk analysis worker starting"
    );

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let storage = StorageService::from_settings(&settings).await?;
    if storage.is_none() {
        tracing::warn!("S3 credentials not configured; stored submissions cannot be processed");
    }

    let state = AppState::new(settings, db_pool, storage);

    tasks::scheduler::run(state).await
}
