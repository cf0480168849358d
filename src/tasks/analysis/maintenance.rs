use anyhow::{Context, Result};

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc as now_primitive;
use crate::repositories;

/// Returns jobs whose worker died mid-run to the queue. Lease expiry is the
/// only recovery path for those, so this runs on a fixed interval.
pub(crate) async fn release_expired_leases(state: &AppState) -> Result<()> {
    let released = repositories::jobs::release_expired(state.db(), now_primitive())
        .await
        .context("Failed to release expired job leases")?;

    if released > 0 {
        tracing::warn!(released, "Released expired analysis job leases");
    }
    metrics::counter!("analysis_leases_released_total").increment(released);

    Ok(())
}
