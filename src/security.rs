//! Security events and per-player risk scoring

use crate::errors::{IntegrityKind, IntegrityViolation};
use crate::metrics::MetricsRegistry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Critical,
}

impl Severity {
    pub fn for_kind(kind: IntegrityKind) -> Self {
        match kind {
            IntegrityKind::SignatureMismatch | IntegrityKind::ResultMismatch => Severity::Critical,
            IntegrityKind::StaleEnvelope
            | IntegrityKind::ReplayedEnvelope
            | IntegrityKind::WrongPlayer => Severity::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskProfile {
    pub score: u32,
    pub violations: u32,
    pub flagged: bool,
}

/// Tracks integrity violations per player.
///
/// Each violation adds a fixed amount to the player's score; crossing the
/// threshold flags the player once.
pub struct RiskMonitor {
    profiles: DashMap<String, RiskProfile>,
    per_violation: u32,
    threshold: u32,
    metrics: Arc<MetricsRegistry>,
}

impl RiskMonitor {
    pub fn new(per_violation: u32, threshold: u32, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            profiles: DashMap::new(),
            per_violation,
            threshold,
            metrics,
        }
    }

    /// Log the violation as a security event and raise the player's score
    pub fn record_violation(&self, violation: &IntegrityViolation) -> RiskProfile {
        let severity = Severity::for_kind(violation.kind);
        self.metrics.record_integrity_violation();
        error!(
            severity = severity.as_str(),
            player_id = %violation.player_id,
            session_id = %violation.session_id,
            kind = %violation.kind,
            "security event: integrity violation"
        );

        let mut profile = self.profiles.entry(violation.player_id.clone()).or_default();
        profile.violations += 1;
        profile.score = profile.score.saturating_add(self.per_violation);

        if !profile.flagged && profile.score >= self.threshold {
            profile.flagged = true;
            self.metrics.record_player_flagged();
            warn!(
                severity = "critical",
                player_id = %violation.player_id,
                score = profile.score,
                "player flagged for repeated integrity violations"
            );
        }

        profile.value().clone()
    }

    pub fn profile(&self, player_id: &str) -> RiskProfile {
        self.profiles
            .get(player_id)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    pub fn is_flagged(&self, player_id: &str) -> bool {
        self.profile(player_id).flagged
    }

    pub fn flagged_players(&self) -> Vec<String> {
        self.profiles
            .iter()
            .filter(|p| p.flagged)
            .map(|p| p.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(player: &str, kind: IntegrityKind) -> IntegrityViolation {
        IntegrityViolation {
            kind,
            session_id: "s1".to_string(),
            player_id: player.to_string(),
            current: None,
        }
    }

    #[test]
    fn test_score_accumulates_and_flags_once() {
        let metrics = Arc::new(MetricsRegistry::new());
        let monitor = RiskMonitor::new(25, 100, metrics.clone());

        for _ in 0..3 {
            monitor.record_violation(&violation("p1", IntegrityKind::SignatureMismatch));
        }
        assert!(!monitor.is_flagged("p1"));

        let profile = monitor.record_violation(&violation("p1", IntegrityKind::StaleEnvelope));
        assert!(profile.flagged);
        assert_eq!(profile.score, 100);

        monitor.record_violation(&violation("p1", IntegrityKind::StaleEnvelope));
        assert_eq!(metrics.snapshot().players_flagged, 1);
        assert_eq!(metrics.snapshot().integrity_violations, 5);
        assert_eq!(monitor.flagged_players(), vec!["p1".to_string()]);
    }

    #[test]
    fn test_players_are_independent() {
        let monitor = RiskMonitor::new(50, 100, Arc::new(MetricsRegistry::new()));
        monitor.record_violation(&violation("p1", IntegrityKind::ResultMismatch));
        assert_eq!(monitor.profile("p1").score, 50);
        assert_eq!(monitor.profile("p2"), RiskProfile::default());
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(Severity::for_kind(IntegrityKind::ResultMismatch), Severity::Critical);
        assert_eq!(Severity::for_kind(IntegrityKind::StaleEnvelope), Severity::High);
    }
}
