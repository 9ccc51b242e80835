//! Configuration management with validation and defaults
//!
//! Every window, TTL and multiplier used by the scheduler lives here so
//! deployments can tune them without code changes.

use crate::games::types::GameType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Basis points representing 1x
pub const BPS_ONE: u32 = 10_000;

/// Top-level scheduler configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HouseConfig {
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub connection: ConnectionConfig,
    pub engine: EngineConfig,
    pub payouts: PayoutTable,
    pub maintenance: MaintenanceConfig,
    pub api: ApiConfig,
}

/// Liquidity admission and rotation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long a reserved slot is held for one session
    pub session_window_secs: u64,
    /// Round usage (percent of budget) that triggers pre-staging
    pub pre_stage_threshold_pct: u32,
    /// Upper bound on queue entries matched per drain pass
    pub drain_batch_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            session_window_secs: 1800,
            pre_stage_threshold_pct: 80,
            drain_batch_limit: 32,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub entry_ttl_secs: u64,
    /// Stale entries skipped in one dequeue before giving up
    pub max_stale_skips: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: 300,
            max_stale_skips: 64,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed lifetime of a game session from creation
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 1800,
            sweep_interval_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed intervals before a client counts as disconnected
    pub missed_heartbeats: u32,
    pub recovery_window_secs: u64,
    pub evaluate_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            missed_heartbeats: 2,
            recovery_window_secs: 15,
            evaluate_interval_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// HMAC key for game-state envelopes
    pub hmac_secret: String,
    pub envelope_max_age_secs: u64,
    pub oracle_timeout_ms: u64,
    pub risk_score_per_violation: u32,
    pub risk_flag_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hmac_secret: "change-me-house-envelope-secret".to_string(),
            envelope_max_age_secs: 300,
            oracle_timeout_ms: 2000,
            risk_score_per_violation: 25,
            risk_flag_threshold: 100,
        }
    }
}

/// Payout multipliers in basis points of the bet (10_000 = 1x).
/// A payout is the total returned to the player, stake included.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutTable {
    pub coin_flip_win_bps: u32,
    pub rps_win_bps: u32,
    pub blackjack_win_bps: u32,
    pub blackjack_natural_bps: u32,
    pub push_bps: u32,
}

impl Default for PayoutTable {
    fn default() -> Self {
        Self {
            coin_flip_win_bps: 20_000,
            rps_win_bps: 20_000,
            blackjack_win_bps: 20_000,
            blackjack_natural_bps: 25_000,
            push_bps: BPS_ONE,
        }
    }
}

impl PayoutTable {
    /// Largest multiplier a single game of this type can pay out
    pub fn max_multiplier_bps(&self, game_type: GameType) -> u32 {
        match game_type {
            GameType::CoinFlip => self.coin_flip_win_bps.max(self.push_bps),
            GameType::RockPaperScissors => self.rps_win_bps.max(self.push_bps),
            GameType::Blackjack => self
                .blackjack_natural_bps
                .max(self.blackjack_win_bps)
                .max(self.push_bps),
        }
    }

    /// Worst-case payout a slot must back for one bet
    pub fn worst_case_payout(&self, game_type: GameType, bet_amount: u64) -> u64 {
        apply_bps(bet_amount, self.max_multiplier_bps(game_type))
    }
}

/// `amount * bps / 10_000` without intermediate overflow
pub fn apply_bps(amount: u64, bps: u32) -> u64 {
    ((amount as u128 * bps as u128) / BPS_ONE as u128) as u64
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Identifies this instance as a lease holder
    pub instance_id: String,
    pub lease_ttl_ms: u64,
    pub lock_retry_attempts: u32,
    pub lock_retry_base_ms: u64,
    pub pre_stage_interval_secs: u64,
    pub drain_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("house-{}", uuid::Uuid::new_v4().simple()),
            lease_ttl_ms: 10_000,
            lock_retry_attempts: 3,
            lock_retry_base_ms: 50,
            pre_stage_interval_secs: 2,
            drain_interval_secs: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 10,
            allowed_origins: vec!["*".to_string()],
        }
    }
}

impl HouseConfig {
    /// Short windows for local development and scenario tests
    pub fn development() -> Self {
        Self {
            session: SessionConfig {
                session_ttl_secs: 600,
                sweep_interval_secs: 1,
            },
            queue: QueueConfig {
                entry_ttl_secs: 120,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.scheduler.pre_stage_threshold_pct == 0 || self.scheduler.pre_stage_threshold_pct > 100 {
            return Err(ConfigValidationError::InvalidValue(
                "pre_stage_threshold_pct must be within 1..=100".to_string(),
            ));
        }

        if self.scheduler.drain_batch_limit == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "drain_batch_limit must be > 0".to_string(),
            ));
        }

        if self.queue.max_stale_skips == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "max_stale_skips must be > 0".to_string(),
            ));
        }

        if self.connection.heartbeat_interval_secs == 0 || self.connection.missed_heartbeats == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "heartbeat interval and missed heartbeat count must be > 0".to_string(),
            ));
        }

        if self.engine.hmac_secret.len() < 16 {
            return Err(ConfigValidationError::InvalidValue(
                "hmac_secret must be at least 16 bytes".to_string(),
            ));
        }

        let p = &self.payouts;
        for (name, bps) in [
            ("coin_flip_win_bps", p.coin_flip_win_bps),
            ("rps_win_bps", p.rps_win_bps),
            ("blackjack_win_bps", p.blackjack_win_bps),
            ("blackjack_natural_bps", p.blackjack_natural_bps),
        ] {
            if bps < BPS_ONE {
                return Err(ConfigValidationError::InvalidValue(format!(
                    "{} must be at least {} (a win returns the stake)",
                    name, BPS_ONE
                )));
            }
        }

        // A session that outlives its slot hold would run unbacked
        if self.scheduler.session_window_secs < self.session.session_ttl_secs {
            return Err(ConfigValidationError::LogicalInconsistency(
                "session_window_secs must cover session_ttl_secs".to_string(),
            ));
        }

        if self.maintenance.lease_ttl_ms == 0 {
            return Err(ConfigValidationError::MissingRequired(
                "maintenance.lease_ttl_ms".to_string(),
            ));
        }

        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.session_ttl_secs)
    }

    pub fn session_window(&self) -> Duration {
        Duration::from_secs(self.scheduler.session_window_secs)
    }

    pub fn queue_entry_ttl(&self) -> Duration {
        Duration::from_secs(self.queue.entry_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.connection.heartbeat_interval_secs)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.connection.recovery_window_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.oracle_timeout_ms)
    }

    pub fn envelope_max_age(&self) -> Duration {
        Duration::from_secs(self.engine.envelope_max_age_secs)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    InvalidValue(String),
    LogicalInconsistency(String),
    MissingRequired(String),
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValidationError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigValidationError::LogicalInconsistency(msg) => write!(f, "Configuration logical inconsistency: {}", msg),
            ConfigValidationError::MissingRequired(msg) => write!(f, "Missing required configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HouseConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config_is_valid() {
        assert!(HouseConfig::development().validate().is_ok());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let mut config = HouseConfig::default();
        config.scheduler.pre_stage_threshold_pct = 150;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_win_multiplier_must_return_stake() {
        let mut config = HouseConfig::default();
        config.payouts.coin_flip_win_bps = 9_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_window_must_cover_ttl() {
        let mut config = HouseConfig::default();
        config.scheduler.session_window_secs = 10;
        config.session.session_ttl_secs = 60;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::LogicalInconsistency(_))
        ));
    }

    #[test]
    fn test_worst_case_payout() {
        let table = PayoutTable::default();
        assert_eq!(table.worst_case_payout(GameType::CoinFlip, 100), 200);
        assert_eq!(table.worst_case_payout(GameType::Blackjack, 100), 250);
        assert_eq!(apply_bps(3, 25_000), 7);
    }

    #[test]
    fn test_duration_conversions() {
        let config = HouseConfig::default();
        assert_eq!(config.recovery_window(), Duration::from_secs(15));
        assert_eq!(config.oracle_timeout(), Duration::from_millis(2000));
    }
}
