//! Lease locks for maintenance jobs
//!
//! Only one instance may run a given job (expiry sweep, queue drain,
//! pre-staging) at a time. Contention is retried with equal-jitter backoff
//! and never treated as an error.

use crate::common::clock::{millis_after, Clock};
use crate::common::traits::LeaseLock;
use crate::errors::HouseResult;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::{Rng, RngCore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: u64,
}

/// Single-process lease table
pub struct InMemoryLeaseLock {
    leases: DashMap<String, Lease>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLeaseLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: DashMap::new(),
            clock,
        }
    }

    pub fn holder(&self, job: &str) -> Option<String> {
        let now = self.clock.now_millis();
        self.leases
            .get(job)
            .filter(|l| l.expires_at > now)
            .map(|l| l.holder.clone())
    }
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    async fn try_acquire(&self, job: &str, holder: &str, ttl: Duration) -> HouseResult<bool> {
        let now = self.clock.now_millis();
        let lease = Lease {
            holder: holder.to_string(),
            expires_at: millis_after(now, ttl),
        };

        match self.leases.entry(job.to_string()) {
            Entry::Vacant(e) => {
                e.insert(lease);
                Ok(true)
            }
            Entry::Occupied(mut e) => {
                let current = e.get();
                if current.holder == holder || current.expires_at <= now {
                    e.insert(lease);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn release(&self, job: &str, holder: &str) -> HouseResult<()> {
        self.leases.remove_if(job, |_, l| l.holder == holder);
        Ok(())
    }
}

/// Equal jitter: the delay lands in `[backoff/2, backoff]`
pub fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Retry policy for [`with_lease`]
#[derive(Debug, Clone)]
pub struct LeasePolicy {
    pub ttl: Duration,
    pub attempts: u32,
    pub base_backoff: Duration,
}

/// Run `job_fn` while holding the lease on `job`.
///
/// Returns `Ok(None)` when the lease stayed with another holder after all
/// attempts; the job is simply skipped this round.
pub async fn with_lease<L, F, Fut, R>(
    lock: &L,
    job: &str,
    holder: &str,
    policy: &LeasePolicy,
    job_fn: F,
) -> HouseResult<Option<R>>
where
    L: LeaseLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let mut backoff = policy.base_backoff;

    for attempt in 0..policy.attempts.max(1) {
        if lock.try_acquire(job, holder, policy.ttl).await? {
            let result = job_fn().await;
            lock.release(job, holder).await?;
            return Ok(Some(result));
        }

        debug!(job, holder, attempt, "lease contended");
        let delay = jittered_backoff(&mut rand::thread_rng(), backoff);
        tokio::time::sleep(delay).await;
        backoff = backoff.saturating_mul(2);
    }

    warn!(job, holder, "lease not acquired, skipping run");
    Ok(None)
}
