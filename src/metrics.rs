//! Scheduler metrics with Prometheus text export

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Prometheus-compatible metrics registry
pub struct MetricsRegistry {
    start_time: Instant,

    pub sessions_created: AtomicU64,
    pub sessions_queued: AtomicU64,
    pub sessions_completed: AtomicU64,
    pub sessions_cancelled: AtomicU64,
    pub sessions_expired: AtomicU64,
    pub sessions_timed_out: AtomicU64,

    pub moves_processed: AtomicU64,
    pub integrity_violations: AtomicU64,
    pub players_flagged: AtomicU64,

    pub slots_reserved: AtomicU64,
    pub slots_pre_staged: AtomicU64,
    pub slot_transitions: AtomicU64,
    pub migrations: AtomicU64,
    pub failed_migrations: AtomicU64,

    pub queue_matched: AtomicU64,
    pub queue_stale_skips: AtomicU64,

    pub oracle_fallbacks: AtomicU64,
    pub disconnects: AtomicU64,
    pub recoveries: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions_created: u64,
    pub sessions_queued: u64,
    pub sessions_completed: u64,
    pub sessions_cancelled: u64,
    pub sessions_expired: u64,
    pub sessions_timed_out: u64,
    pub moves_processed: u64,
    pub integrity_violations: u64,
    pub players_flagged: u64,
    pub slots_reserved: u64,
    pub slots_pre_staged: u64,
    pub slot_transitions: u64,
    pub migrations: u64,
    pub failed_migrations: u64,
    pub queue_matched: u64,
    pub queue_stale_skips: u64,
    pub oracle_fallbacks: u64,
    pub disconnects: u64,
    pub recoveries: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sessions_created: AtomicU64::new(0),
            sessions_queued: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            sessions_timed_out: AtomicU64::new(0),
            moves_processed: AtomicU64::new(0),
            integrity_violations: AtomicU64::new(0),
            players_flagged: AtomicU64::new(0),
            slots_reserved: AtomicU64::new(0),
            slots_pre_staged: AtomicU64::new(0),
            slot_transitions: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            failed_migrations: AtomicU64::new(0),
            queue_matched: AtomicU64::new(0),
            queue_stale_skips: AtomicU64::new(0),
            oracle_fallbacks: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    pub fn record_session_created(&self, queued: bool) {
        bump(&self.sessions_created);
        if queued {
            bump(&self.sessions_queued);
        }
    }

    pub fn record_session_completed(&self) {
        bump(&self.sessions_completed);
    }

    pub fn record_session_cancelled(&self) {
        bump(&self.sessions_cancelled);
    }

    pub fn record_session_expired(&self) {
        bump(&self.sessions_expired);
    }

    pub fn record_session_timeout(&self) {
        bump(&self.sessions_timed_out);
    }

    pub fn record_move(&self) {
        bump(&self.moves_processed);
    }

    pub fn record_integrity_violation(&self) {
        bump(&self.integrity_violations);
    }

    pub fn record_player_flagged(&self) {
        bump(&self.players_flagged);
    }

    pub fn record_reserve(&self) {
        bump(&self.slots_reserved);
    }

    pub fn record_pre_stage(&self) {
        bump(&self.slots_pre_staged);
    }

    pub fn record_transition(&self) {
        bump(&self.slot_transitions);
    }

    pub fn record_migration(&self, succeeded: bool) {
        if succeeded {
            bump(&self.migrations);
        } else {
            bump(&self.failed_migrations);
        }
    }

    pub fn record_queue_match(&self) {
        bump(&self.queue_matched);
    }

    pub fn record_stale_skip(&self) {
        bump(&self.queue_stale_skips);
    }

    pub fn record_oracle_fallback(&self) {
        bump(&self.oracle_fallbacks);
    }

    pub fn record_disconnect(&self) {
        bump(&self.disconnects);
    }

    pub fn record_recovery(&self) {
        bump(&self.recoveries);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            sessions_created: load(&self.sessions_created),
            sessions_queued: load(&self.sessions_queued),
            sessions_completed: load(&self.sessions_completed),
            sessions_cancelled: load(&self.sessions_cancelled),
            sessions_expired: load(&self.sessions_expired),
            sessions_timed_out: load(&self.sessions_timed_out),
            moves_processed: load(&self.moves_processed),
            integrity_violations: load(&self.integrity_violations),
            players_flagged: load(&self.players_flagged),
            slots_reserved: load(&self.slots_reserved),
            slots_pre_staged: load(&self.slots_pre_staged),
            slot_transitions: load(&self.slot_transitions),
            migrations: load(&self.migrations),
            failed_migrations: load(&self.failed_migrations),
            queue_matched: load(&self.queue_matched),
            queue_stale_skips: load(&self.queue_stale_skips),
            oracle_fallbacks: load(&self.oracle_fallbacks),
            disconnects: load(&self.disconnects),
            recoveries: load(&self.recoveries),
        }
    }

    /// Generate Prometheus metrics format.
    ///
    /// Gauges for live sessions and queue depth are supplied by the caller
    /// because they are read from the stores, not counted here.
    pub fn to_prometheus_format(&self, gauges: &[(&str, &str, u64)]) -> String {
        let s = self.snapshot();
        let counters: [(&str, &str, u64); 19] = [
            ("sessions_created_total", "Sessions created", s.sessions_created),
            ("sessions_queued_total", "Sessions that had to wait for liquidity", s.sessions_queued),
            ("sessions_completed_total", "Sessions settled", s.sessions_completed),
            ("sessions_cancelled_total", "Sessions cancelled", s.sessions_cancelled),
            ("sessions_expired_total", "Sessions expired past their TTL", s.sessions_expired),
            ("sessions_timed_out_total", "Sessions forced into timeout", s.sessions_timed_out),
            ("moves_processed_total", "Moves applied by the game engine", s.moves_processed),
            ("integrity_violations_total", "Refused tampered or stale envelopes", s.integrity_violations),
            ("players_flagged_total", "Players crossing the risk threshold", s.players_flagged),
            ("slots_reserved_total", "Successful liquidity reservations", s.slots_reserved),
            ("slots_pre_staged_total", "Slots staged ahead of budget exhaustion", s.slots_pre_staged),
            ("slot_transitions_total", "Sessions moved onto a staged slot", s.slot_transitions),
            ("migrations_total", "Sessions migrated off a failed slot", s.migrations),
            ("failed_migrations_total", "Migrations with no replacement slot", s.failed_migrations),
            ("queue_matched_total", "Queue entries matched to liquidity", s.queue_matched),
            ("queue_stale_skips_total", "Queue entries expired while draining", s.queue_stale_skips),
            ("oracle_fallbacks_total", "Draws served from local randomness", s.oracle_fallbacks),
            ("disconnects_total", "Client disconnects detected", s.disconnects),
            ("recoveries_total", "Sessions resumed after disconnect", s.recoveries),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP house_{name} {help}\n# TYPE house_{name} counter\nhouse_{name} {value}\n\n"
            ));
        }
        for (name, help, value) in gauges {
            output.push_str(&format!(
                "# HELP house_{name} {help}\n# TYPE house_{name} gauge\nhouse_{name} {value}\n\n"
            ));
        }
        output.push_str(&format!(
            "# HELP house_uptime_seconds Process uptime\n# TYPE house_uptime_seconds gauge\nhouse_uptime_seconds {}\n",
            s.uptime_secs
        ));
        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
