//! Periodic maintenance workers
//!
//! Each job ticks on its own interval and runs under a lease named after
//! the job, so across instances only one runs a given job at a time. A
//! failing run is logged and the worker keeps ticking.

use crate::errors::HouseResult;
use crate::lease::{with_lease, LeasePolicy};
use crate::service::HouseService;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

pub const JOB_EXPIRY_SWEEP: &str = "session-expiry-sweep";
pub const JOB_QUEUE_DRAIN: &str = "queue-drain";
pub const JOB_PRE_STAGE: &str = "slot-pre-stage";
pub const JOB_CONNECTION_EVALUATE: &str = "connection-evaluate";

/// Handles of the spawned workers plus their shutdown signal
pub struct MaintenanceHandle {
    shutdown: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Signal every worker and wait for them to stop
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "maintenance worker panicked");
            }
        }
        info!("maintenance workers stopped");
    }
}

fn lease_policy(service: &HouseService) -> LeasePolicy {
    let m = &service.config().maintenance;
    LeasePolicy {
        ttl: Duration::from_millis(m.lease_ttl_ms),
        attempts: m.lock_retry_attempts,
        base_backoff: Duration::from_millis(m.lock_retry_base_ms),
    }
}

/// Run one job under its lease. `Ok(None)` means another instance held it.
pub async fn run_job<F, Fut, R>(service: &HouseService, job: &str, job_fn: F) -> HouseResult<Option<R>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = HouseResult<R>>,
{
    let lease = service.lease();
    let holder = service.config().maintenance.instance_id.clone();
    match with_lease(lease.as_ref(), job, &holder, &lease_policy(service), job_fn).await? {
        Some(result) => result.map(Some),
        None => Ok(None),
    }
}

fn spawn_worker<F, Fut>(
    service: Arc<HouseService>,
    job: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    body: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<HouseService>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HouseResult<String>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(job, period_ms = period.as_millis() as u64, "maintenance worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let svc = service.clone();
                    match run_job(&service, job, || body(svc)).await {
                        Ok(Some(summary)) if !summary.is_empty() => debug!(job, summary = %summary, "job ran"),
                        Ok(_) => {}
                        Err(e) => error!(job, error = %e, "maintenance job failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!(job, "maintenance worker stopping");
                    break;
                }
            }
        }
    })
}

async fn sweep_job(svc: Arc<HouseService>) -> HouseResult<String> {
    let report = svc.sweep_expired().await?;
    if report.expired + report.timed_out + report.queue_expired == 0 {
        return Ok(String::new());
    }
    Ok(format!("{:?}", report))
}

async fn drain_job(svc: Arc<HouseService>) -> HouseResult<String> {
    let admitted = svc.drain_queues().await?;
    Ok(if admitted > 0 { format!("admitted {}", admitted) } else { String::new() })
}

async fn pre_stage_job(svc: Arc<HouseService>) -> HouseResult<String> {
    let staged = svc.pre_stage_all();
    Ok(if staged > 0 { format!("staged {}", staged) } else { String::new() })
}

async fn connection_job(svc: Arc<HouseService>) -> HouseResult<String> {
    let report = svc.evaluate_connections().await?;
    if report.disconnected + report.timed_out == 0 {
        return Ok(String::new());
    }
    Ok(format!("{:?}", report))
}

/// Start the expiry sweep, queue drain, pre-stage and connection workers
pub fn spawn_workers(service: Arc<HouseService>) -> MaintenanceHandle {
    let (shutdown, _) = broadcast::channel(1);
    let config = service.config().clone();

    let workers = vec![
        spawn_worker(
            service.clone(),
            JOB_EXPIRY_SWEEP,
            Duration::from_secs(config.session.sweep_interval_secs.max(1)),
            shutdown.subscribe(),
            sweep_job,
        ),
        spawn_worker(
            service.clone(),
            JOB_QUEUE_DRAIN,
            Duration::from_secs(config.maintenance.drain_interval_secs.max(1)),
            shutdown.subscribe(),
            drain_job,
        ),
        spawn_worker(
            service.clone(),
            JOB_PRE_STAGE,
            Duration::from_secs(config.maintenance.pre_stage_interval_secs.max(1)),
            shutdown.subscribe(),
            pre_stage_job,
        ),
        spawn_worker(
            service,
            JOB_CONNECTION_EVALUATE,
            Duration::from_millis(config.connection.evaluate_interval_ms.max(100)),
            shutdown.subscribe(),
            connection_job,
        ),
    ];

    info!(workers = workers.len(), "maintenance workers started");
    MaintenanceHandle { shutdown, workers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::common::traits::LeaseLock;
    use crate::common::types::Token;
    use crate::config::HouseConfig;
    use crate::errors::HouseError;
    use crate::games::types::GameType;
    use crate::games::vrf_engine::SchnorrkelOracle;
    use crate::lease::InMemoryLeaseLock;
    use crate::ledger::InMemoryLedger;
    use crate::service::HouseDeps;
    use crate::session::{CreateSessionRequest, SessionStatus};

    fn service(lease: Arc<InMemoryLeaseLock>, clock: Arc<ManualClock>) -> (Arc<HouseService>, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut config = HouseConfig::default();
        config.maintenance.instance_id = "instance-a".to_string();
        config.maintenance.lock_retry_attempts = 1;
        config.maintenance.lock_retry_base_ms = 1;
        let deps = HouseDeps {
            ledger: ledger.clone(),
            lease,
            oracle: Arc::new(SchnorrkelOracle::new_random()),
            clock,
        };
        (Arc::new(HouseService::new(config, deps).unwrap()), ledger)
    }

    #[tokio::test]
    async fn test_job_skipped_while_other_instance_holds_lease() {
        let clock = Arc::new(ManualClock::new(0));
        let lease = Arc::new(InMemoryLeaseLock::new(clock.clone()));
        let (svc, _) = service(lease.clone(), clock);

        lease
            .try_acquire(JOB_EXPIRY_SWEEP, "instance-b", Duration::from_secs(30))
            .await
            .unwrap();
        let ran = run_job(&svc, JOB_EXPIRY_SWEEP, || async { Ok::<_, HouseError>(1) }).await.unwrap();
        assert_eq!(ran, None);

        let ran = run_job(&svc, JOB_QUEUE_DRAIN, || async { Ok::<_, HouseError>(2) }).await.unwrap();
        assert_eq!(ran, Some(2));
        assert!(lease.holder(JOB_QUEUE_DRAIN).is_none());
    }

    #[tokio::test]
    async fn test_sweep_job_expires_waiting_session() {
        let clock = Arc::new(ManualClock::new(0));
        let lease = Arc::new(InMemoryLeaseLock::new(clock.clone()));
        let (svc, ledger) = service(lease, clock.clone());
        ledger.deposit("p1", &Token::sol(), 1_000);

        let created = svc
            .create_session(CreateSessionRequest {
                player_id: "p1".to_string(),
                game_type: GameType::RockPaperScissors,
                token: Token::sol(),
                bet_amount: 10,
                third_party_id: None,
            })
            .await
            .unwrap();

        clock.advance(Duration::from_secs(1_801));
        let s = svc.clone();
        run_job(&svc, JOB_EXPIRY_SWEEP, || async move { s.sweep_expired().await })
            .await
            .unwrap();
        assert_eq!(svc.get_session(&created.session_id).unwrap().status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let clock = Arc::new(ManualClock::new(0));
        let lease = Arc::new(InMemoryLeaseLock::new(clock.clone()));
        let (svc, _) = service(lease, clock);

        let handle = spawn_workers(svc);
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }
}
