//! FIFO waiting queue per (game type, token) partition
//!
//! Each partition owns a mutex-guarded position counter, so positions are
//! gapless and strictly increasing at assignment time, even while earlier
//! entries sit matched or get requeued. Status changes are conditional updates on
//! the entry document; an entry that has expired can never be matched.

use crate::common::clock::{millis_after, Clock};
use crate::common::traits::BalanceLedger;
use crate::common::types::{new_id, PartitionKey, Token};
use crate::errors::{HouseError, HouseResult, StoreError};
use crate::games::types::GameType;
use crate::metrics::MetricsRegistry;
use crate::store::{Document, DocumentStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEntryStatus {
    Waiting,
    Matched,
    Expired,
    Cancelled,
}

impl fmt::Display for QueueEntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEntryStatus::Waiting => write!(f, "waiting"),
            QueueEntryStatus::Matched => write!(f, "matched"),
            QueueEntryStatus::Expired => write!(f, "expired"),
            QueueEntryStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerQueueEntry {
    pub id: String,
    pub player_id: String,
    pub game_type: GameType,
    pub token: Token,
    pub bet_amount: u64,
    pub queue_position: u64,
    pub status: QueueEntryStatus,
    pub matched_session_id: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Document for PlayerQueueEntry {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl PlayerQueueEntry {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.game_type, &self.token)
    }

    fn is_waiting_in(&self, partition: &PartitionKey) -> bool {
        self.status == QueueEntryStatus::Waiting && &self.partition() == partition
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueOutcome {
    Matched(PlayerQueueEntry),
    Empty,
    /// Too many stale entries in one pass; the rest wait for the next drain
    SkipLimitReached,
}

#[derive(Debug, Clone)]
pub struct DequeueResult {
    pub outcome: DequeueOutcome,
    /// Entries expired during this pass
    pub expired: Vec<PlayerQueueEntry>,
}

pub struct PlayerQueue {
    entries: DocumentStore<PlayerQueueEntry>,
    /// Last position handed out per partition
    partition_seq: DashMap<PartitionKey, Arc<Mutex<u64>>>,
    ledger: Arc<dyn BalanceLedger>,
    clock: Arc<dyn Clock>,
    entry_ttl: Duration,
    max_stale_skips: u32,
    metrics: Arc<MetricsRegistry>,
}

impl PlayerQueue {
    pub fn new(
        ledger: Arc<dyn BalanceLedger>,
        clock: Arc<dyn Clock>,
        entry_ttl: Duration,
        max_stale_skips: u32,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            entries: DocumentStore::new("player_queue"),
            partition_seq: DashMap::new(),
            ledger,
            clock,
            entry_ttl,
            max_stale_skips,
            metrics,
        }
    }

    fn partition_seq(&self, partition: &PartitionKey) -> Arc<Mutex<u64>> {
        self.partition_seq
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone()
    }

    pub fn get(&self, entry_id: &str) -> HouseResult<PlayerQueueEntry> {
        self.entries
            .get(entry_id)
            .ok_or_else(|| HouseError::not_found("queue entry", entry_id))
    }

    /// Add a player at the back of the partition
    pub fn enqueue(
        &self,
        player_id: &str,
        game_type: GameType,
        token: &Token,
        bet_amount: u64,
    ) -> HouseResult<PlayerQueueEntry> {
        if bet_amount == 0 {
            return Err(HouseError::Validation("bet amount must be > 0".to_string()));
        }

        let partition = PartitionKey::new(game_type, token);
        let seq = self.partition_seq(&partition);
        let mut last = seq
            .lock()
            .map_err(|_| HouseError::Infrastructure("queue partition lock poisoned".to_string()))?;

        let waiting = self.entries.find(|e| e.is_waiting_in(&partition));
        if waiting.iter().any(|e| e.player_id == player_id) {
            return Err(HouseError::AlreadyQueued {
                player_id: player_id.to_string(),
                partition: partition.to_string(),
            });
        }

        let queue_position = *last + 1;
        let now = self.clock.now_millis();
        let entry = PlayerQueueEntry {
            id: new_id("queue"),
            player_id: player_id.to_string(),
            game_type,
            token: token.clone(),
            bet_amount,
            queue_position,
            status: QueueEntryStatus::Waiting,
            matched_session_id: None,
            created_at: now,
            expires_at: millis_after(now, self.entry_ttl),
        };
        self.entries.insert_new(entry.clone())?;
        *last = queue_position;

        info!(player_id, partition = %partition, queue_position, "player queued");
        Ok(entry)
    }

    fn head(&self, partition: &PartitionKey) -> Option<PlayerQueueEntry> {
        self.entries
            .find(|e| e.is_waiting_in(partition))
            .into_iter()
            .min_by_key(|e| e.queue_position)
    }

    /// Pop the lowest waiting position whose player can still cover the bet.
    ///
    /// Stale heads (past TTL or underfunded) are expired and skipped, at
    /// most `max_stale_skips` of them per call.
    pub async fn dequeue_next(&self, game_type: GameType, token: &Token) -> HouseResult<DequeueResult> {
        let partition = PartitionKey::new(game_type, token);
        let mut expired = Vec::new();

        for _ in 0..=self.max_stale_skips {
            let Some(head) = self.head(&partition) else {
                return Ok(DequeueResult { outcome: DequeueOutcome::Empty, expired });
            };

            let now = self.clock.now_millis();
            let stale = now >= head.expires_at
                || !self
                    .ledger
                    .has_sufficient_balance(&head.player_id, token, head.bet_amount)
                    .await?;

            if stale {
                match self.transition(&head.id, QueueEntryStatus::Waiting, QueueEntryStatus::Expired, None) {
                    Ok(entry) => {
                        self.metrics.record_stale_skip();
                        warn!(
                            entry_id = %entry.id,
                            player_id = %entry.player_id,
                            queue_position = entry.queue_position,
                            "stale queue entry expired"
                        );
                        expired.push(entry);
                    }
                    Err(StoreError::ConditionFailed(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            match self.transition(&head.id, QueueEntryStatus::Waiting, QueueEntryStatus::Matched, None) {
                Ok(entry) => {
                    self.metrics.record_queue_match();
                    debug!(entry_id = %entry.id, player_id = %entry.player_id, "queue head matched");
                    return Ok(DequeueResult { outcome: DequeueOutcome::Matched(entry), expired });
                }
                // Cancelled or taken by a concurrent drain
                Err(StoreError::ConditionFailed(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        warn!(partition = %partition, skipped = expired.len(), "queue drain hit stale skip limit");
        Ok(DequeueResult { outcome: DequeueOutcome::SkipLimitReached, expired })
    }

    fn transition(
        &self,
        entry_id: &str,
        from: QueueEntryStatus,
        to: QueueEntryStatus,
        session_id: Option<&str>,
    ) -> Result<PlayerQueueEntry, StoreError> {
        self.entries.update_if(
            entry_id,
            |e| e.status == from,
            |e| {
                e.status = to;
                if let Some(sid) = session_id {
                    e.matched_session_id = Some(sid.to_string());
                }
            },
        )
    }

    /// Record which session a matched entry was admitted into
    pub fn confirm_match(&self, entry_id: &str, session_id: &str) -> HouseResult<PlayerQueueEntry> {
        self.transition(entry_id, QueueEntryStatus::Matched, QueueEntryStatus::Matched, Some(session_id))
            .map_err(|e| self.status_error(e, entry_id, QueueEntryStatus::Matched))
    }

    /// Put a matched entry back at its original position when no slot could
    /// take it after all
    pub fn requeue(&self, entry_id: &str) -> HouseResult<PlayerQueueEntry> {
        let entry = self
            .transition(entry_id, QueueEntryStatus::Matched, QueueEntryStatus::Waiting, None)
            .map_err(|e| self.status_error(e, entry_id, QueueEntryStatus::Waiting))?;
        debug!(entry_id, queue_position = entry.queue_position, "queue entry requeued");
        Ok(entry)
    }

    /// Close a matched entry whose session could not be admitted
    pub fn expire_matched(&self, entry_id: &str) -> HouseResult<PlayerQueueEntry> {
        let entry = self
            .transition(entry_id, QueueEntryStatus::Matched, QueueEntryStatus::Expired, None)
            .map_err(|e| self.status_error(e, entry_id, QueueEntryStatus::Expired))?;
        debug!(entry_id, player_id = %entry.player_id, "matched queue entry expired");
        Ok(entry)
    }

    /// Every entry the player ever had, oldest first
    pub fn entries_for(&self, player_id: &str) -> Vec<PlayerQueueEntry> {
        let mut entries = self.entries.find(|e| e.player_id == player_id);
        entries.sort_by_key(|e| (e.created_at, e.queue_position));
        entries
    }

    /// Cancel the player's waiting entry for a partition, if any
    pub fn cancel(&self, player_id: &str, game_type: GameType, token: &Token) -> HouseResult<Option<PlayerQueueEntry>> {
        let partition = PartitionKey::new(game_type, token);
        let Some(entry) = self
            .entries
            .find_one(|e| e.player_id == player_id && e.is_waiting_in(&partition))
        else {
            return Ok(None);
        };

        match self.transition(&entry.id, QueueEntryStatus::Waiting, QueueEntryStatus::Cancelled, None) {
            Ok(entry) => {
                info!(player_id, entry_id = %entry.id, "queue entry cancelled");
                Ok(Some(entry))
            }
            Err(StoreError::ConditionFailed(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Expire every waiting entry whose TTL has passed
    pub fn expire_stale(&self, now: u64) -> Vec<PlayerQueueEntry> {
        self.entries
            .find(|e| e.status == QueueEntryStatus::Waiting && now >= e.expires_at)
            .into_iter()
            .filter_map(|e| {
                self.entries
                    .update_if(
                        &e.id,
                        |e| e.status == QueueEntryStatus::Waiting && now >= e.expires_at,
                        |e| e.status = QueueEntryStatus::Expired,
                    )
                    .ok()
            })
            .collect()
    }

    /// 1-based rank of the player's waiting entry among waiting entries
    pub fn position(&self, player_id: &str, game_type: GameType, token: &Token) -> Option<usize> {
        let partition = PartitionKey::new(game_type, token);
        let mut waiting = self.entries.find(|e| e.is_waiting_in(&partition));
        waiting.sort_by_key(|e| e.queue_position);
        waiting.iter().position(|e| e.player_id == player_id).map(|i| i + 1)
    }

    pub fn waiting_count(&self, game_type: GameType, token: &Token) -> usize {
        let partition = PartitionKey::new(game_type, token);
        self.entries.find(|e| e.is_waiting_in(&partition)).len()
    }

    /// Partitions with at least one waiting entry
    pub fn waiting_partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self
            .entries
            .find(|e| e.status == QueueEntryStatus::Waiting)
            .iter()
            .map(|e| e.partition())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn status_error(&self, err: StoreError, entry_id: &str, to: QueueEntryStatus) -> HouseError {
        match err {
            StoreError::ConditionFailed(_) => match self.entries.get(entry_id) {
                Some(e) => HouseError::invalid_transition("queue entry", entry_id, e.status, to),
                None => HouseError::not_found("queue entry", entry_id),
            },
            other => other.into(),
        }
    }
}
