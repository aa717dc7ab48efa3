use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::ingest::{Ingestor, RunTarget};

/// Scheduler with one job that runs every enabled source on `cron`.
/// The caller starts it.
pub async fn build_scheduler(cron: &str, ingestor: Arc<Ingestor>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let ingestor = ingestor.clone();
        Box::pin(async move {
            info!("scheduled ingestion run triggered");
            match ingestor.run(RunTarget::All).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    notifications = summary.notifications_sent(),
                    "scheduled ingestion run done"
                ),
                Err(err) => error!(error = %err, "scheduled ingestion run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Kick off one run in the background right away, as the service does on
/// start-up before the first scheduled tick.
pub fn spawn_initial_run(ingestor: Arc<Ingestor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match ingestor.run(RunTarget::All).await {
            Ok(summary) => info!(run_id = %summary.run_id, "initial ingestion run completed"),
            Err(err) => error!(error = %err, "initial ingestion run failed"),
        }
    })
}
