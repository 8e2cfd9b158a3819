use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{Orchestrator, SyncConfig, SyncError};

/// Six-field cron expression firing at the top of every `every_hours`-th hour.
pub fn schedule_expression(every_hours: u32) -> String {
    format!("0 0 */{} * * *", every_hours.clamp(1, 24))
}

/// One full run for every catalogue owner; owners already running are skipped.
pub async fn run_scheduled(orchestrator: &Orchestrator) {
    let owners = match orchestrator.store().catalogue_owners().await {
        Ok(owners) => owners,
        Err(err) => {
            error!(error = %err, "scheduled run could not list catalogue owners");
            return;
        }
    };
    info!(users = owners.len(), "scheduled sync triggered");
    for user_id in owners {
        match orchestrator.synchronize(&user_id, None).await {
            Ok(outcome) => info!(user_id, status = ?outcome.status, "scheduled sync done"),
            Err(SyncError::Busy(_)) => info!(user_id, "run already in progress; skipping"),
            Err(err) => warn!(user_id, error = %err, "scheduled sync failed"),
        }
    }
}

pub async fn build_scheduler(
    orchestrator: Arc<Orchestrator>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = schedule_expression(config.schedule_every_hours);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            run_scheduled(&orchestrator).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "scheduler configured");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{track, FakeWorld};
    use crate::{NoopAlerter, Pacing};
    use catsync_platforms::MetricLookup;
    use catsync_storage::InMemorySnapshotStore;

    #[test]
    fn expression_fires_every_n_hours() {
        assert_eq!(schedule_expression(6), "0 0 */6 * * *");
        assert_eq!(schedule_expression(0), "0 0 */1 * * *");
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let mut config = SyncConfig::from_lookup(|_| None);
        config.scheduler_enabled = false;
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(InMemorySnapshotStore::new()),
            FakeWorld::new().clients(),
            Arc::new(NoopAlerter),
        ));
        assert!(build_scheduler(orchestrator, &config).await.expect("scheduler config").is_none());
    }

    #[tokio::test]
    async fn scheduled_run_covers_every_owner_and_skips_busy_ones() {
        let store = Arc::new(InMemorySnapshotStore::with_catalogue(vec![
            track("u1", "ISRC1"),
            track("u2", "ISRC2"),
        ]));
        let world = FakeWorld::new()
            .with_resolution("ISRC1", "t1", "a1")
            .with_resolution("ISRC2", "t2", "a2")
            .with_playcount("t1", MetricLookup::Found(5))
            .with_playcount("t2", MetricLookup::Found(6));
        let orchestrator = Orchestrator::new(store.clone(), world.clients(), Arc::new(NoopAlerter))
            .with_pacing(Pacing::none());

        let held = orchestrator.reserve("u2").expect("slot is free");
        run_scheduled(&orchestrator).await;
        drop(held);

        let metrics = store.metrics().await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].user_id, "u1");
    }
}
