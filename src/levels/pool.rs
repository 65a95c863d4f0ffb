//! Level Pool
//!
//! Holds every known level and enforces the lifecycle graph
//! `available → active → filled → closed`, with the side channels
//! `active → available` (deactivated before fill) and `filled → orphaned`
//! (deactivated after fill). Writers are serialized behind one lock;
//! readers always observe whole levels.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::scenario::Scenario;
use crate::domain::{Level, LevelFill, LevelStatus, ScoreRecord, Side};
use crate::error::{PilotError, Result};

/// Selection criteria for `LevelPool::list`
#[derive(Debug, Clone, Default)]
pub struct LevelFilter {
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub statuses: Vec<LevelStatus>,
    pub scenario: Option<String>,
    pub tag: Option<String>,
    pub min_profit_pct: Option<Decimal>,
}

impl LevelFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    pub fn status(mut self, status: LevelStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn min_profit_pct(mut self, pct: Decimal) -> Self {
        self.min_profit_pct = Some(pct);
        self
    }

    pub fn matches(&self, level: &Level) -> bool {
        if let Some(symbol) = &self.symbol {
            if &level.symbol != symbol {
                return false;
            }
        }
        if let Some(side) = self.side {
            if level.side != side {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&level.status) {
            return false;
        }
        if let Some(scenario) = &self.scenario {
            if &level.scenario != scenario {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !level.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(min) = self.min_profit_pct {
            if level.profit_pct() < min {
                return false;
            }
        }
        true
    }
}

/// Pool counts per status, side and symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub by_status: BTreeMap<LevelStatus, usize>,
    pub by_side: BTreeMap<Side, usize>,
    pub by_symbol: BTreeMap<String, usize>,
    pub realized_pnl: Decimal,
}

impl PoolStats {
    pub fn count(&self, status: LevelStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool[total={}, avail={}, active={}, filled={}, orphaned={}, closed={}, pnl={}]",
            self.total,
            self.count(LevelStatus::Available),
            self.count(LevelStatus::Active),
            self.count(LevelStatus::Filled),
            self.count(LevelStatus::Orphaned),
            self.count(LevelStatus::Closed),
            self.realized_pnl,
        )
    }
}

#[derive(Serialize, Deserialize)]
struct PoolSnapshot {
    saved_at: DateTime<Utc>,
    levels: Vec<Level>,
}

/// Thread-safe store of all levels
pub struct LevelPool {
    levels: RwLock<HashMap<String, Level>>,
    reactivation_cooldown: Duration,
}

impl LevelPool {
    pub fn new(reactivation_cooldown_secs: u64) -> Self {
        Self {
            levels: RwLock::new(HashMap::new()),
            reactivation_cooldown: Duration::seconds(reactivation_cooldown_secs as i64),
        }
    }

    pub async fn add(&self, mut level: Level) -> Result<()> {
        let mut levels = self.levels.write().await;
        if levels.contains_key(&level.id) {
            return Err(PilotError::DuplicateLevel(level.id));
        }
        level.updated_at = Utc::now();
        debug!(level_id = %level.id, symbol = %level.symbol, side = %level.side, price = %level.price, "level added");
        levels.insert(level.id.clone(), level);
        Ok(())
    }

    /// Remove a level; levels carrying a position cannot be removed
    pub async fn remove(&self, level_id: &str) -> Result<Level> {
        let mut levels = self.levels.write().await;
        let status = levels
            .get(level_id)
            .map(|l| l.status)
            .ok_or_else(|| PilotError::LevelNotFound(level_id.to_string()))?;
        if status.has_position() || status == LevelStatus::Active {
            return Err(PilotError::InvalidState(format!(
                "level {level_id} is {status} and cannot be removed"
            )));
        }
        levels
            .remove(level_id)
            .ok_or_else(|| PilotError::LevelNotFound(level_id.to_string()))
    }

    pub async fn get(&self, level_id: &str) -> Option<Level> {
        self.levels.read().await.get(level_id).cloned()
    }

    /// Matching levels ordered by symbol, side and price
    pub async fn list(&self, filter: &LevelFilter) -> Vec<Level> {
        let levels = self.levels.read().await;
        let mut out: Vec<Level> = levels.values().filter(|l| filter.matches(l)).cloned().collect();
        out.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then(a.side.cmp(&b.side))
                .then(b.price.cmp(&a.price))
                .then(a.id.cmp(&b.id))
        });
        out
    }

    pub async fn symbols(&self) -> Vec<String> {
        let levels = self.levels.read().await;
        let mut symbols: Vec<String> = levels.values().map(|l| l.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Transition a level, enforcing the lifecycle graph.
    ///
    /// On an invalid transition the level is left untouched and
    /// `InvalidTransition` is returned.
    pub async fn set_status(&self, level_id: &str, status: LevelStatus) -> Result<Level> {
        let mut levels = self.levels.write().await;
        let level = levels
            .get_mut(level_id)
            .ok_or_else(|| PilotError::LevelNotFound(level_id.to_string()))?;
        self.apply_transition(level, status, Utc::now())?;
        Ok(level.clone())
    }

    fn apply_transition(&self, level: &mut Level, status: LevelStatus, now: DateTime<Utc>) -> Result<()> {
        if !level.status.can_transition_to(status) {
            warn!(level_id = %level.id, from = %level.status, to = %status, "invalid level transition");
            return Err(PilotError::InvalidTransition {
                level_id: level.id.clone(),
                from: level.status.to_string(),
                to: status.to_string(),
            });
        }

        match (level.status, status) {
            (LevelStatus::Available, LevelStatus::Active) => {
                level.activated_at = Some(now);
                level.metrics.activations += 1;
            }
            (LevelStatus::Active, LevelStatus::Available) => {
                level.activated_at = None;
                level.cooldown_until = Some(now + self.reactivation_cooldown);
            }
            _ => {}
        }

        debug!(level_id = %level.id, from = %level.status, to = %status, "level transition");
        level.status = status;
        level.updated_at = now;
        Ok(())
    }

    /// Record the entry fill of an active level (`active → filled`)
    pub async fn record_entry_fill(
        &self,
        level_id: &str,
        price: Decimal,
        size: u32,
        at: DateTime<Utc>,
    ) -> Result<Level> {
        let mut levels = self.levels.write().await;
        let level = levels
            .get_mut(level_id)
            .ok_or_else(|| PilotError::LevelNotFound(level_id.to_string()))?;
        self.apply_transition(level, LevelStatus::Filled, at)?;
        level.entry = Some(LevelFill {
            price,
            size,
            filled_at: at,
        });
        Ok(level.clone())
    }

    /// Close the position of a filled or orphaned level, booking P&L
    pub async fn record_close(
        &self,
        level_id: &str,
        exit_price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(Level, Decimal)> {
        let mut levels = self.levels.write().await;
        let level = levels
            .get_mut(level_id)
            .ok_or_else(|| PilotError::LevelNotFound(level_id.to_string()))?;
        let entry = level.entry.clone().ok_or_else(|| {
            PilotError::InvalidState(format!("level {level_id} has no entry fill to close"))
        })?;
        self.apply_transition(level, LevelStatus::Closed, at)?;

        let pnl = (exit_price - entry.price) * level.side.sign() * Decimal::from(entry.size);
        level.metrics.realized_pnl += pnl;
        if pnl > Decimal::ZERO {
            level.metrics.successes += 1;
        } else {
            level.metrics.failures += 1;
        }
        info!(level_id = %level_id, entry = %entry.price, exit = %exit_price, pnl = %pnl, "level closed");
        Ok((level.clone(), pnl))
    }

    /// Start a new trade cycle for a closed level
    pub async fn recycle(&self, level_id: &str) -> Result<Level> {
        let mut levels = self.levels.write().await;
        let level = levels
            .get_mut(level_id)
            .ok_or_else(|| PilotError::LevelNotFound(level_id.to_string()))?;
        if level.status != LevelStatus::Closed {
            return Err(PilotError::InvalidTransition {
                level_id: level_id.to_string(),
                from: level.status.to_string(),
                to: LevelStatus::Available.to_string(),
            });
        }
        let now = Utc::now();
        level.status = LevelStatus::Available;
        level.entry = None;
        level.activated_at = None;
        level.metrics.cycles += 1;
        level.cooldown_until = Some(now + self.reactivation_cooldown);
        level.updated_at = now;
        Ok(level.clone())
    }

    pub async fn record_scores(&self, scores: &[ScoreRecord]) {
        let mut levels = self.levels.write().await;
        for score in scores {
            if let Some(level) = levels.get_mut(&score.level_id) {
                level.metrics.last_score = Some(score.aggregate);
            }
        }
    }

    /// Levels holding exposure (filled or orphaned)
    pub async fn open_positions(&self) -> Vec<Level> {
        let levels = self.levels.read().await;
        levels.values().filter(|l| l.status.has_position()).cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        let levels = self.levels.read().await;
        levels.values().filter(|l| l.status == LevelStatus::Active).count()
    }

    pub async fn stats(&self) -> PoolStats {
        let levels = self.levels.read().await;
        let mut stats = PoolStats {
            total: levels.len(),
            ..Default::default()
        };
        for level in levels.values() {
            *stats.by_status.entry(level.status).or_default() += 1;
            *stats.by_side.entry(level.side).or_default() += 1;
            *stats.by_symbol.entry(level.symbol.clone()).or_default() += 1;
            stats.realized_pnl += level.metrics.realized_pnl;
        }
        stats
    }

    /// Add every level the scenarios define; existing ids are skipped
    pub async fn import_scenarios(&self, scenarios: &[Scenario]) -> usize {
        let mut imported = 0;
        for scenario in scenarios {
            for level in scenario.levels() {
                match self.add(level).await {
                    Ok(()) => imported += 1,
                    Err(e) => debug!("skipping scenario level: {}", e),
                }
            }
        }
        info!("Imported {} levels from {} scenarios", imported, scenarios.len());
        imported
    }

    pub async fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = PoolSnapshot {
            saved_at: Utc::now(),
            levels: self.list(&LevelFilter::all()).await,
        };
        let body = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    /// Replace pool contents with a saved snapshot
    pub async fn load_json<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let body = tokio::fs::read_to_string(path).await?;
        let snapshot: PoolSnapshot = serde_json::from_str(&body)?;
        let mut levels = self.levels.write().await;
        levels.clear();
        for level in snapshot.levels {
            levels.insert(level.id.clone(), level);
        }
        Ok(levels.len())
    }
}

impl Default for LevelPool {
    fn default() -> Self {
        Self::new(120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(id: &str, side: Side, price: Decimal) -> Level {
        Level::new(id, "SPY", side, price, price + dec!(0.05) * side.sign(), 100)
    }

    #[tokio::test]
    async fn test_add_and_duplicate() {
        let pool = LevelPool::default();
        pool.add(level("a", Side::Long, dec!(5.15))).await.unwrap();
        let err = pool.add(level("a", Side::Long, dec!(5.15))).await.unwrap_err();
        assert!(matches!(err, PilotError::DuplicateLevel(_)));
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state() {
        let pool = LevelPool::default();
        pool.add(level("a", Side::Long, dec!(5.15))).await.unwrap();

        let err = pool.set_status("a", LevelStatus::Filled).await.unwrap_err();
        assert!(matches!(err, PilotError::InvalidTransition { .. }));
        assert_eq!(pool.get("a").await.unwrap().status, LevelStatus::Available);
    }

    #[tokio::test]
    async fn test_full_cycle_books_pnl() {
        let pool = LevelPool::default();
        pool.add(level("a", Side::Long, dec!(5.10))).await.unwrap();
        pool.set_status("a", LevelStatus::Active).await.unwrap();
        pool.record_entry_fill("a", dec!(5.10), 100, Utc::now()).await.unwrap();
        let (closed, pnl) = pool.record_close("a", dec!(5.15), Utc::now()).await.unwrap();

        assert_eq!(closed.status, LevelStatus::Closed);
        assert_eq!(pnl, dec!(5.00));
        assert_eq!(closed.metrics.successes, 1);

        let recycled = pool.recycle("a").await.unwrap();
        assert_eq!(recycled.status, LevelStatus::Available);
        assert_eq!(recycled.metrics.cycles, 1);
        assert!(recycled.entry.is_none());
    }

    #[tokio::test]
    async fn test_deactivation_starts_cooldown() {
        let pool = LevelPool::new(60);
        pool.add(level("a", Side::Long, dec!(5.10))).await.unwrap();
        pool.set_status("a", LevelStatus::Active).await.unwrap();
        let level = pool.set_status("a", LevelStatus::Available).await.unwrap();
        assert!(level.in_cooldown(Utc::now()));
    }

    #[tokio::test]
    async fn test_filter_and_stats() {
        let pool = LevelPool::default();
        pool.add(level("a", Side::Long, dec!(5.10))).await.unwrap();
        pool.add(level("b", Side::Short, dec!(5.30))).await.unwrap();
        pool.set_status("b", LevelStatus::Active).await.unwrap();

        let longs = pool.list(&LevelFilter::all().side(Side::Long)).await;
        assert_eq!(longs.len(), 1);

        let active = pool.list(&LevelFilter::all().status(LevelStatus::Active)).await;
        assert_eq!(active[0].id, "b");

        let stats = pool.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(LevelStatus::Active), 1);
        assert_eq!(stats.by_symbol.get("SPY"), Some(&2));
    }

    #[tokio::test]
    async fn test_cannot_remove_open_position() {
        let pool = LevelPool::default();
        pool.add(level("a", Side::Long, dec!(5.10))).await.unwrap();
        pool.set_status("a", LevelStatus::Active).await.unwrap();
        pool.record_entry_fill("a", dec!(5.10), 100, Utc::now()).await.unwrap();
        assert!(pool.remove("a").await.is_err());
    }
}
