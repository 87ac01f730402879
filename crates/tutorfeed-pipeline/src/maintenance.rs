use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tutorfeed_storage::{AssignmentStore, JobQueue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Processing jobs whose claim went stale and were returned to pending.
    pub requeued: u64,
    /// Open assignments not seen within the expiry window.
    pub expired: u64,
}

/// Periodic housekeeping: reclaim abandoned jobs and expire assignments nobody re-posted.
pub struct Maintenance {
    queue: Arc<dyn JobQueue>,
    assignments: Arc<dyn AssignmentStore>,
    stale_after: Duration,
    expiry: Duration,
}

impl Maintenance {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        assignments: Arc<dyn AssignmentStore>,
        stale_after: Duration,
        expiry: Duration,
    ) -> Self {
        Self {
            queue,
            assignments,
            stale_after,
            expiry,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let requeued = self
            .queue
            .requeue_stale(self.stale_after)
            .await
            .context("requeueing stale jobs")?;
        let expired = self
            .assignments
            .expire_unseen(Utc::now() - self.expiry)
            .await
            .context("expiring unseen assignments")?;
        info!(requeued, expired, "maintenance sweep finished");
        Ok(SweepReport { requeued, expired })
    }

    /// Scheduler that runs `sweep` on `cron`. The caller starts and shuts it down.
    pub async fn build_scheduler(self: Arc<Self>, cron: &str) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let job = Job::new_async(cron, move |_uuid, _l| {
            let maintenance = self.clone();
            Box::pin(async move {
                if let Err(err) = maintenance.sweep().await {
                    error!(error = %format!("{err:#}"), "scheduled maintenance sweep failed");
                }
            })
        })
        .with_context(|| format!("creating maintenance job for cron {cron}"))?;
        sched.add(job).await.context("adding maintenance job")?;
        Ok(sched)
    }
}
