//! Controller state shared between the loop and its handles

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::command::ControllerMode;
use crate::domain::{DecisionRecord, Plan, RiskVerdict, ScoreRecord};

/// Bounded, append-only audit trail of decisions. Records are never
/// mutated; the oldest are evicted past capacity.
#[derive(Debug)]
pub struct DecisionHistory {
    records: VecDeque<DecisionRecord>,
    capacity: usize,
}

impl DecisionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// Records at or after `since`, oldest first
    pub fn since(&self, since: Option<DateTime<Utc>>) -> Vec<DecisionRecord> {
        self.records
            .iter()
            .filter(|r| since.map(|s| r.at >= s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<DecisionRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Plan awaiting operator confirmation (alert mode)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub id: Uuid,
    pub symbol: String,
    pub plan: Plan,
    pub verdict: RiskVerdict,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingDecision {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStats {
    pub mode: ControllerMode,
    pub cycles: u64,
    /// Cycles that took longer than the cycle interval
    pub overruns: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_ms: u64,
    pub decisions_by_outcome: BTreeMap<String, u64>,
    /// Level changes dispatched today (UTC)
    pub changes_today: usize,
    pub changes_day: NaiveDate,
    pub emergency_active: bool,
}

impl ControllerStats {
    fn new(mode: ControllerMode) -> Self {
        Self {
            mode,
            cycles: 0,
            overruns: 0,
            last_cycle_at: None,
            last_cycle_ms: 0,
            decisions_by_outcome: BTreeMap::new(),
            changes_today: 0,
            changes_day: Utc::now().date_naive(),
            emergency_active: false,
        }
    }

    pub fn record_changes(&mut self, changes: usize, now: DateTime<Utc>) {
        if now.date_naive() != self.changes_day {
            self.changes_day = now.date_naive();
            self.changes_today = 0;
        }
        self.changes_today += changes;
    }
}

/// State written by the loop and read by handles
pub struct SharedState {
    pub mode: RwLock<ControllerMode>,
    pub history: RwLock<DecisionHistory>,
    pub pending: RwLock<BTreeMap<Uuid, PendingDecision>>,
    /// Latest score per level
    pub scores: DashMap<String, ScoreRecord>,
    pub stats: RwLock<ControllerStats>,
}

impl SharedState {
    pub fn new(mode: ControllerMode, history_size: usize) -> Self {
        Self {
            mode: RwLock::new(mode),
            history: RwLock::new(DecisionHistory::new(history_size)),
            pending: RwLock::new(BTreeMap::new()),
            scores: DashMap::new(),
            stats: RwLock::new(ControllerStats::new(mode)),
        }
    }

    /// Append a record and count its outcome
    pub async fn record(&self, record: DecisionRecord) {
        let kind = record.outcome.kind().to_string();
        self.history.write().await.push(record);
        *self
            .stats
            .write()
            .await
            .decisions_by_outcome
            .entry(kind)
            .or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DecisionOutcome;
    use chrono::Duration;

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = DecisionHistory::new(3);
        let start = Utc::now();
        for i in 0..5 {
            history.push(DecisionRecord::new(
                i,
                start + Duration::seconds(i as i64),
                DecisionOutcome::Executed,
            ));
        }
        assert_eq!(history.len(), 3);
        let records = history.since(None);
        assert_eq!(records[0].cycle, 2);
        assert_eq!(history.since(Some(start + Duration::seconds(4))).len(), 1);
        assert_eq!(history.recent(2)[1].cycle, 4);
    }

    #[test]
    fn test_changes_reset_on_new_day() {
        let mut stats = ControllerStats::new(ControllerMode::Alert);
        let now = Utc::now();
        stats.record_changes(3, now);
        stats.record_changes(2, now);
        assert_eq!(stats.changes_today, 5);
        stats.record_changes(1, now + Duration::days(1));
        assert_eq!(stats.changes_today, 1);
    }
}
