//! Risk Manager
//!
//! Sole writer of `RiskState`. Fills, closes and marks flow in from the
//! execution pipeline; the control loop calls `evaluate` once per cycle and
//! `check_plan` for every proposed plan. Within a cycle the level only
//! escalates; `evaluate` is the one place it may come back down.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::limits::{LimitBand, LimitCheck, LimitKind, RiskLevel, RiskLimits};
use crate::coordination::{EmergencyReason, EmergencyStop};
use crate::domain::{Level, LevelStatus, Plan, RiskVerdict, Side};
use crate::error::RiskError;

/// Exposure held by one filled or orphaned level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenExposure {
    pub level_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: u32,
    pub mark: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl OpenExposure {
    pub fn value(&self) -> Decimal {
        self.mark * Decimal::from(self.size)
    }

    pub fn unrealized(&self) -> Decimal {
        (self.mark - self.entry_price) * self.side.sign() * Decimal::from(self.size)
    }
}

/// Read-only view handed to every reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub trading_day: NaiveDate,
    pub level: RiskLevel,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub peak_pnl: Decimal,
    pub drawdown: Decimal,
    pub exposure_by_symbol: BTreeMap<String, Decimal>,
    pub total_exposure: Decimal,
    pub open_positions: usize,
    pub active_levels: usize,
    pub checks: Vec<LimitCheck>,
    pub emergency_reason: Option<String>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl RiskState {
    fn new(day: NaiveDate) -> Self {
        Self {
            trading_day: day,
            level: RiskLevel::Normal,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            peak_pnl: Decimal::ZERO,
            drawdown: Decimal::ZERO,
            exposure_by_symbol: BTreeMap::new(),
            total_exposure: Decimal::ZERO,
            open_positions: 0,
            active_levels: 0,
            checks: Vec::new(),
            emergency_reason: None,
            evaluated_at: None,
        }
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }

    pub fn daily_loss(&self) -> Decimal {
        (-self.daily_pnl()).max(Decimal::ZERO)
    }

    pub fn breaches(&self) -> Vec<&LimitCheck> {
        self.checks.iter().filter(|c| c.band == LimitBand::Hard).collect()
    }

    /// Hard breaches of the loss limits, which close losing positions
    pub fn loss_breaches(&self) -> Vec<&LimitCheck> {
        self.breaches()
            .into_iter()
            .filter(|c| matches!(c.kind, LimitKind::DailyLoss | LimitKind::Drawdown))
            .collect()
    }

    pub fn warnings(&self) -> Vec<&LimitCheck> {
        self.checks.iter().filter(|c| c.band == LimitBand::Soft).collect()
    }
}

struct Inner {
    limits: RiskLimits,
    state: RiskState,
    positions: HashMap<String, OpenExposure>,
    prices: HashMap<String, VecDeque<(DateTime<Utc>, Decimal)>>,
}

pub struct RiskManager {
    inner: RwLock<Inner>,
    emergency: Arc<EmergencyStop>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, emergency: Arc<EmergencyStop>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                limits,
                state: RiskState::new(Utc::now().date_naive()),
                positions: HashMap::new(),
                prices: HashMap::new(),
            }),
            emergency,
        }
    }

    pub async fn snapshot(&self) -> RiskState {
        self.inner.read().await.state.clone()
    }

    pub async fn level(&self) -> RiskLevel {
        if self.emergency.is_stopped() {
            return RiskLevel::Emergency;
        }
        self.inner.read().await.state.level
    }

    pub async fn limits(&self) -> RiskLimits {
        self.inner.read().await.limits.clone()
    }

    pub async fn update_limits(&self, limits: RiskLimits) {
        self.inner.write().await.limits = limits;
        info!("Risk limits updated");
    }

    pub async fn positions(&self) -> Vec<OpenExposure> {
        self.inner.read().await.positions.values().cloned().collect()
    }

    // ==================== State Updates ====================

    pub async fn record_fill(
        &self,
        level_id: &str,
        symbol: &str,
        side: Side,
        price: Decimal,
        size: u32,
        at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write().await;
        inner.positions.insert(
            level_id.to_string(),
            OpenExposure {
                level_id: level_id.to_string(),
                symbol: symbol.to_string(),
                side,
                entry_price: price,
                size,
                mark: price,
                opened_at: at,
            },
        );
        debug!(level_id = %level_id, %symbol, %price, size, "risk: position opened");
        let escalation = Self::recompute(&mut inner, false);
        drop(inner);
        self.handle_escalation(escalation).await;
    }

    pub async fn record_close(&self, level_id: &str, pnl: Decimal, at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        if inner.positions.remove(level_id).is_none() {
            warn!(level_id = %level_id, "risk: close for unknown position");
        }
        inner.state.realized_pnl += pnl;
        debug!(level_id = %level_id, %pnl, at = %at, "risk: position closed");
        let escalation = Self::recompute(&mut inner, false);
        drop(inner);
        self.handle_escalation(escalation).await;
    }

    pub async fn set_active_levels(&self, count: usize) {
        let mut inner = self.inner.write().await;
        inner.state.active_levels = count;
        let escalation = Self::recompute(&mut inner, false);
        drop(inner);
        self.handle_escalation(escalation).await;
    }

    pub async fn mark_to_market(&self, symbol: &str, price: Decimal) {
        let mut inner = self.inner.write().await;
        let mut touched = false;
        for position in inner.positions.values_mut().filter(|p| p.symbol == symbol) {
            position.mark = price;
            touched = true;
        }
        if touched {
            let escalation = Self::recompute(&mut inner, false);
            drop(inner);
            self.handle_escalation(escalation).await;
        }
    }

    /// Feed a price sample to the black-swan detector. Returns the breach
    /// when the move trips the emergency latch.
    pub async fn observe_price(
        &self,
        symbol: &str,
        price: Decimal,
        at: DateTime<Utc>,
        atr_pct: Option<f64>,
    ) -> Option<RiskError> {
        let mut inner = self.inner.write().await;
        let config = inner.limits.black_swan.clone();
        let history = inner.prices.entry(symbol.to_string()).or_default();
        history.push_back((at, price));
        while history.len() > config.history.max(1) {
            history.pop_front();
        }

        let window_start = at - Duration::seconds(config.window_secs as i64);
        let in_window: Vec<Decimal> = history
            .iter()
            .filter(|(t, _)| *t >= window_start)
            .map(|(_, p)| *p)
            .collect();
        if in_window.len() < config.min_samples {
            return None;
        }
        let first = in_window[0];
        if first.is_zero() {
            return None;
        }
        let move_pct = ((price - first).abs() / first * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0);
        let threshold = match atr_pct {
            Some(atr) if atr > 0.0 => config.sudden_move_pct.min(atr * config.atr_multiple),
            _ => config.sudden_move_pct,
        };
        if move_pct < threshold {
            return None;
        }

        let breach = RiskError::BlackSwan {
            symbol: symbol.to_string(),
            move_pct,
            window_secs: config.window_secs,
        };
        inner.state.level = RiskLevel::Emergency;
        inner.state.emergency_reason = Some(breach.to_string());
        drop(inner);

        self.emergency
            .trigger(EmergencyReason::BlackSwan(breach.to_string()))
            .await;
        Some(breach)
    }

    // ==================== Evaluation ====================

    /// Full evaluation at a cycle boundary; the only path that de-escalates
    pub async fn evaluate(&self, now: DateTime<Utc>) -> RiskState {
        let mut inner = self.inner.write().await;
        if now.date_naive() != inner.state.trading_day {
            Self::roll_day(&mut inner, now.date_naive());
        }
        let previous = inner.state.level;
        let escalation = Self::recompute(&mut inner, true);
        if self.emergency.is_stopped() {
            inner.state.level = RiskLevel::Emergency;
        }
        inner.state.evaluated_at = Some(now);
        let current = inner.state.level;
        let snapshot = inner.state.clone();
        drop(inner);

        if current != previous {
            if current > previous {
                warn!(from = %previous, to = %current, "Risk level escalated");
            } else {
                info!(from = %previous, to = %current, "Risk level cleared");
            }
        }
        self.handle_escalation(escalation).await;
        snapshot
    }

    /// Validate a plan against current state. Any failure to evaluate
    /// rejects the plan.
    pub async fn check_plan(&self, plan: &Plan, levels: &[Level]) -> RiskVerdict {
        match self.try_check_plan(plan, levels).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(plan_id = %plan.id, "Risk evaluation failed, rejecting plan: {}", e);
                RiskVerdict::Rejected {
                    reasons: vec![e.to_string()],
                }
            }
        }
    }

    async fn try_check_plan(&self, plan: &Plan, levels: &[Level]) -> std::result::Result<RiskVerdict, RiskError> {
        if self.emergency.is_stopped() {
            return Ok(RiskVerdict::Rejected {
                reasons: vec!["emergency stop active".to_string()],
            });
        }

        let inner = self.inner.read().await;
        let state = &inner.state;
        let limits = &inner.limits;
        if state.level == RiskLevel::Emergency {
            return Ok(RiskVerdict::Rejected {
                reasons: vec!["risk level emergency".to_string()],
            });
        }

        let by_id: HashMap<&str, &Level> = levels.iter().map(|l| (l.id.as_str(), l)).collect();
        let mut added_notional = Decimal::ZERO;
        for action in &plan.activate {
            let level = by_id.get(action.level_id.as_str()).ok_or_else(|| {
                RiskError::EvaluationFailed(format!("unknown level {} in plan", action.level_id))
            })?;
            added_notional += level.notional();
        }
        let mut removed_active = 0usize;
        for action in &plan.deactivate {
            let level = by_id.get(action.level_id.as_str()).ok_or_else(|| {
                RiskError::EvaluationFailed(format!("unknown level {} in plan", action.level_id))
            })?;
            if level.status == LevelStatus::Active {
                removed_active += 1;
            }
        }

        let mut reasons = Vec::new();
        let mut warnings: Vec<String> = state.warnings().iter().map(|c| c.describe()).collect();

        // Deactivations only reduce risk; activations are gated.
        if !plan.activate.is_empty() {
            if !state.level.allows_new_trades() {
                reasons.push(
                    RiskError::TradingBlocked {
                        level: state.level.to_string(),
                    }
                    .to_string(),
                );
            }
            for breach in state.breaches() {
                reasons.push(format!("hard limit breached: {}", breach.describe()));
            }

            let projected_active = (state.active_levels + plan.activate.len()).saturating_sub(removed_active);
            let symbol_exposure = state
                .exposure_by_symbol
                .get(&plan.symbol)
                .copied()
                .unwrap_or(Decimal::ZERO)
                + added_notional;
            let total_exposure = state.total_exposure + added_notional;

            let projected = [
                (LimitKind::ActiveLevels, projected_active as f64),
                (LimitKind::SymbolExposure, symbol_exposure.to_f64().unwrap_or(f64::MAX)),
                (LimitKind::TotalExposure, total_exposure.to_f64().unwrap_or(f64::MAX)),
            ];
            for (kind, value) in projected {
                let check = limits.check(kind, value);
                match check.band {
                    LimitBand::Hard => reasons.push(format!("projected {}", check.describe())),
                    LimitBand::Soft => warnings.push(format!("projected {}", check.describe())),
                    LimitBand::Ok => {}
                }
            }
            if state.open_positions >= limits.max_open_positions {
                reasons.push(format!(
                    "open positions {} at cap {}",
                    state.open_positions, limits.max_open_positions
                ));
            }
        }

        warnings.dedup();
        Ok(if !reasons.is_empty() {
            RiskVerdict::Rejected { reasons }
        } else if !warnings.is_empty() {
            RiskVerdict::ApprovedWithWarnings { warnings }
        } else {
            RiskVerdict::Approved
        })
    }

    /// Fast pre-trade check for a single new position
    pub async fn can_open_new_trade(&self, symbol: &str, notional: Decimal) -> std::result::Result<(), RiskError> {
        if self.emergency.is_stopped() {
            return Err(RiskError::TradingBlocked {
                level: RiskLevel::Emergency.to_string(),
            });
        }
        let inner = self.inner.read().await;
        let state = &inner.state;
        if !state.level.allows_new_trades() {
            return Err(RiskError::TradingBlocked {
                level: state.level.to_string(),
            });
        }
        let symbol_exposure = state.exposure_by_symbol.get(symbol).copied().unwrap_or(Decimal::ZERO) + notional;
        if symbol_exposure >= inner.limits.max_symbol_exposure {
            return Err(RiskError::HardLimit {
                kind: LimitKind::SymbolExposure.to_string(),
                current: symbol_exposure,
                limit: inner.limits.max_symbol_exposure,
            });
        }
        let total = state.total_exposure + notional;
        if total >= inner.limits.max_total_exposure {
            return Err(RiskError::HardLimit {
                kind: LimitKind::TotalExposure.to_string(),
                current: total,
                limit: inner.limits.max_total_exposure,
            });
        }
        Ok(())
    }

    /// Start a new trading day; open positions carry over
    pub async fn reset_daily(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        Self::roll_day(&mut inner, now.date_naive());
        Self::recompute(&mut inner, true);
    }

    /// Clear the emergency level after the latch was reset by an operator
    pub async fn clear_emergency(&self) {
        let mut inner = self.inner.write().await;
        inner.state.emergency_reason = None;
        inner.state.level = RiskLevel::Normal;
        Self::recompute(&mut inner, true);
        info!("Risk emergency cleared, level now {}", inner.state.level);
    }

    fn roll_day(inner: &mut Inner, day: NaiveDate) {
        info!("Risk daily reset: {} -> {}", inner.state.trading_day, day);
        inner.state.trading_day = day;
        inner.state.realized_pnl = Decimal::ZERO;
        inner.state.peak_pnl = Decimal::ZERO;
        inner.state.drawdown = Decimal::ZERO;
    }

    /// Recompute derived figures and limit checks. Returns an emergency
    /// reason when the loss reached the emergency threshold.
    fn recompute(inner: &mut Inner, full: bool) -> Option<String> {
        let mut by_symbol: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut unrealized = Decimal::ZERO;
        for position in inner.positions.values() {
            *by_symbol.entry(position.symbol.clone()).or_default() += position.value();
            unrealized += position.unrealized();
        }

        let state = &mut inner.state;
        state.unrealized_pnl = unrealized;
        state.total_exposure = by_symbol.values().copied().sum();
        state.exposure_by_symbol = by_symbol;
        state.open_positions = inner.positions.len();
        let pnl = state.daily_pnl();
        state.peak_pnl = state.peak_pnl.max(pnl);
        state.drawdown = state.peak_pnl - pnl;

        let limits = &inner.limits;
        let max_symbol = state
            .exposure_by_symbol
            .values()
            .copied()
            .max()
            .unwrap_or(Decimal::ZERO);
        let metrics = [
            (LimitKind::DailyLoss, state.daily_loss()),
            (LimitKind::TotalExposure, state.total_exposure),
            (LimitKind::SymbolExposure, max_symbol),
            (LimitKind::OpenPositions, Decimal::from(state.open_positions)),
            (LimitKind::ActiveLevels, Decimal::from(state.active_levels)),
            (LimitKind::Drawdown, state.drawdown),
        ];
        state.checks = metrics
            .iter()
            .map(|(kind, value)| limits.check(*kind, value.to_f64().unwrap_or(f64::MAX)))
            .collect();

        let hard = state.checks.iter().filter(|c| c.band == LimitBand::Hard).count();
        let soft = state.checks.iter().filter(|c| c.band == LimitBand::Soft).count();
        let emergency_loss = state.daily_loss() >= limits.emergency_loss_threshold;

        let computed = if emergency_loss || state.emergency_reason.is_some() {
            RiskLevel::Emergency
        } else if hard > 0 {
            RiskLevel::Critical
        } else if soft >= 3 {
            RiskLevel::Warning
        } else if soft > 0 {
            RiskLevel::Elevated
        } else {
            RiskLevel::Normal
        };

        state.level = if full { computed } else { state.level.max(computed) };

        if emergency_loss && state.emergency_reason.is_none() {
            let reason = format!(
                "daily loss {} reached emergency threshold {}",
                state.daily_loss(),
                limits.emergency_loss_threshold
            );
            state.emergency_reason = Some(reason.clone());
            return Some(reason);
        }
        None
    }

    async fn handle_escalation(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            self.emergency.trigger(EmergencyReason::RiskLimit(reason)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn manager() -> (RiskManager, Arc<EmergencyStop>) {
        let stop = Arc::new(EmergencyStop::new());
        (RiskManager::new(RiskLimits::default(), stop.clone()), stop)
    }

    fn plan_activating(ids: &[&str]) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            symbol: "TQQQ".into(),
            created_at: Utc::now(),
            strategy: "greedy".into(),
            activate: ids
                .iter()
                .map(|id| crate::domain::PlanAction {
                    level_id: id.to_string(),
                    side: Side::Long,
                    price: dec!(50),
                    score: 50.0,
                    rationale: String::new(),
                })
                .collect(),
            deactivate: vec![],
            total_score: 50.0,
        }
    }

    #[tokio::test]
    async fn test_loss_escalates_to_critical_then_clears() {
        let (risk, _) = manager();
        let now = Utc::now();
        risk.record_fill("a", "TQQQ", Side::Long, dec!(50), 100, now).await;
        risk.mark_to_market("TQQQ", dec!(44.5)).await; // -550
        assert_eq!(risk.level().await, RiskLevel::Critical);

        // Recovery mid-cycle does not de-escalate
        risk.mark_to_market("TQQQ", dec!(50)).await;
        assert_eq!(risk.level().await, RiskLevel::Critical);

        // Full evaluation does. Drawdown from the 0 peak is back to 0.
        let state = risk.evaluate(now).await;
        assert_eq!(state.level, RiskLevel::Normal);
    }

    #[tokio::test]
    async fn test_emergency_loss_trips_latch() {
        let (risk, stop) = manager();
        let now = Utc::now();
        risk.record_fill("a", "TQQQ", Side::Long, dec!(50), 100, now).await;
        risk.record_close("a", dec!(-1000), now).await;
        assert!(stop.is_stopped());
        assert_eq!(risk.evaluate(now).await.level, RiskLevel::Emergency);
    }

    #[tokio::test]
    async fn test_black_swan_trips_latch() {
        let (risk, stop) = manager();
        let t0 = Utc::now();
        for i in 0..9 {
            let hit = risk
                .observe_price("TQQQ", dec!(50), t0 + Duration::seconds(i), None)
                .await;
            assert!(hit.is_none());
        }
        let hit = risk
            .observe_price("TQQQ", dec!(47), t0 + Duration::seconds(10), None)
            .await;
        assert!(matches!(hit, Some(RiskError::BlackSwan { .. })));
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_plan_with_unknown_level_is_rejected() {
        let (risk, _) = manager();
        let verdict = risk.check_plan(&plan_activating(&["ghost"]), &[]).await;
        assert!(!verdict.is_approved());
    }

    #[tokio::test]
    async fn test_plan_exceeding_symbol_exposure_is_rejected() {
        let (risk, _) = manager();
        let levels: Vec<Level> = (0..3)
            .map(|i| Level::new(format!("l{i}"), "TQQQ", Side::Long, dec!(50), dec!(51), 100))
            .collect();
        // 5000 each against a 10000 hard cap
        let verdict = risk.check_plan(&plan_activating(&["l0"]), &levels).await;
        assert!(verdict.is_approved());
        let verdict = risk.check_plan(&plan_activating(&["l0", "l1", "l2"]), &levels).await;
        assert!(matches!(verdict, RiskVerdict::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_plan_reaching_hard_limit_exactly_is_rejected() {
        let stop = Arc::new(EmergencyStop::new());
        let limits = RiskLimits {
            max_active_levels: 2,
            ..Default::default()
        };
        let risk = RiskManager::new(limits.clone(), stop);
        let levels: Vec<Level> = (0..2)
            .map(|i| Level::new(format!("l{i}"), "TQQQ", Side::Long, dec!(5), dec!(5.1), 100))
            .collect();

        // Same band the cycle evaluation would assign to two active levels
        assert_eq!(limits.check(LimitKind::ActiveLevels, 2.0).band, LimitBand::Hard);
        let verdict = risk.check_plan(&plan_activating(&["l0", "l1"]), &levels).await;
        let RiskVerdict::Rejected { reasons } = verdict else {
            panic!("plan at the hard limit was approved");
        };
        assert!(reasons.iter().any(|r| r.contains("active_levels")));

        let verdict = risk.check_plan(&plan_activating(&["l0"]), &levels).await;
        assert_eq!(verdict, RiskVerdict::Approved);

        // 10000 of TQQQ exposure is already at the per-symbol cap
        assert!(risk.can_open_new_trade("TQQQ", dec!(10000)).await.is_err());
        assert!(risk.can_open_new_trade("TQQQ", dec!(9999)).await.is_ok());
    }

    #[tokio::test]
    async fn test_daily_rollover_resets_pnl() {
        let (risk, _) = manager();
        let now = Utc::now();
        risk.record_fill("a", "TQQQ", Side::Long, dec!(50), 100, now).await;
        risk.record_close("a", dec!(-450), now).await;
        assert_eq!(risk.evaluate(now).await.level, RiskLevel::Critical);

        let tomorrow = now + Duration::days(1);
        let state = risk.evaluate(tomorrow).await;
        assert_eq!(state.realized_pnl, Decimal::ZERO);
        assert_eq!(state.level, RiskLevel::Normal);
    }
}
