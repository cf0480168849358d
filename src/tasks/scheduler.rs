use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};

use crate::core::state::AppState;
use crate::tasks::analysis::{self, AnalysisServices};

const ANALYSIS_WORKER_CONCURRENCY: usize = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const LEASE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) async fn run(state: AppState) -> Result<()> {
    let services = Arc::new(AnalysisServices::from_settings(state.settings())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(ANALYSIS_WORKER_CONCURRENCY + 1);

    for _ in 0..ANALYSIS_WORKER_CONCURRENCY {
        handles.push(tokio::spawn(analysis_worker(
            state.clone(),
            services.clone(),
            shutdown_rx.clone(),
        )));
    }
    handles.push(tokio::spawn(lease_maintenance_loop(state.clone(), shutdown_rx.clone())));

    crate::core::shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn analysis_worker(
    state: AppState,
    services: Arc<AnalysisServices>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match analysis::lease_next_job(&state).await {
            Ok(Some(job)) => {
                metrics::gauge!("analysis_jobs_inflight").increment(1.0);
                if let Err(err) = analysis::process_job(&state, &services, &job).await {
                    // job stays leased; lease expiry returns it to the queue
                    tracing::error!(
                        job_id = %job.id,
                        submission_id = %job.submission_id,
                        error = %err,
                        "Failed to process analysis job"
                    );
                }
                metrics::gauge!("analysis_jobs_inflight").decrement(1.0);
                continue;
            }
            Ok(None) => {}
            Err(err) => tracing::error!(error = %err, "Failed to lease analysis job"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn lease_maintenance_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(LEASE_MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = analysis::release_expired_leases(&state).await {
                    tracing::error!(error = %err, "release_expired_leases failed");
                }
            }
        }
    }
}
