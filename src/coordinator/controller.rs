//! Control Loop: periodic decision cycle over the level pool
//!
//! The loop owns the analysis and strategy components. Each cycle it
//! ingests ticks and fills, evaluates risk, closes losing positions while a
//! loss limit is breached, then for every symbol runs
//! snapshot → pattern → prediction → scoring → optimization, gates the
//! plan (anti-overtrading, risk) and dispatches or holds it per mode.
//! The `run()` loop uses `tokio::select!` over:
//!   - the cycle interval and a faster watchdog heartbeat
//!   - the emergency latch, which preempts the cadence
//!   - watchdog and execution events
//!   - control commands from `ControllerHandle`
//!   - configuration reloads, applied at the next cycle boundary
//!
//! Cycles run inline in the select loop, so two never overlap.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::{ControlCommand, ControllerMode, CycleReport};
use super::config::ControllerConfig;
use super::state::{ControllerStats, PendingDecision, SharedState};
use crate::analysis::SnapshotBuilder;
use crate::config::AppConfig;
use crate::coordination::{EmergencyReason, EmergencyState, EmergencyStop, ShutdownSignal};
use crate::domain::{
    DecisionOutcome, DecisionRecord, Level, LevelStatus, Plan, RiskVerdict, ScoreRecord,
};
use crate::error::{PilotError, Result};
use crate::exchange::ExecutionVenue;
use crate::execution::{CommandKind, CommandTarget, ExecutionEvent, ExecutionManager, ExecutionStats};
use crate::levels::{LevelFilter, LevelPool, PoolStats};
use crate::risk::{RiskLevel, RiskManager, RiskState};
use crate::strategy::{
    LevelScorer, Optimizer, OvertradingGuard, PatternMatcher, PatternRepository, PlanInput,
    Predictor,
};
use crate::supervisor::{CheckStatus, ComponentHealth, DataClock, Watchdog, WatchdogEvent};

/// Name the loop heartbeats under
pub const CONTROL_LOOP_COMPONENT: &str = "control_loop";

const COMMAND_CHANNEL_SIZE: usize = 64;

/// Shared services the loop drives
#[derive(Clone)]
pub struct LoopParts {
    pub pool: Arc<LevelPool>,
    pub risk: Arc<RiskManager>,
    pub execution: Arc<ExecutionManager>,
    pub watchdog: Arc<Watchdog>,
    pub emergency: Arc<EmergencyStop>,
    pub data_clock: DataClock,
}

/// Status view served by `/health`
#[derive(Debug, Clone, Serialize)]
pub struct ControllerHealth {
    pub mode: ControllerMode,
    pub risk_level: RiskLevel,
    pub emergency: EmergencyState,
    pub components: Vec<ComponentHealth>,
    pub checks: Vec<CheckStatus>,
    pub execution: ExecutionStats,
    pub pool: PoolStats,
    pub controller: ControllerStats,
}

/// Clonable query and control surface over a running loop
#[derive(Clone)]
pub struct ControllerHandle {
    command_tx: mpsc::Sender<ControlCommand>,
    shared: Arc<SharedState>,
    pool: Arc<LevelPool>,
    risk: Arc<RiskManager>,
    execution: Arc<ExecutionManager>,
    watchdog: Arc<Watchdog>,
    emergency: Arc<EmergencyStop>,
}

impl ControllerHandle {
    // ==================== Queries ====================

    /// Decision records at or after `since`, oldest first
    pub async fn list_decisions(&self, since: Option<DateTime<Utc>>) -> Vec<DecisionRecord> {
        self.shared.history.read().await.since(since)
    }

    pub async fn get_risk_state(&self) -> RiskState {
        self.risk.snapshot().await
    }

    pub async fn get_active_levels(&self) -> Vec<Level> {
        self.pool
            .list(&LevelFilter::all().status(LevelStatus::Active))
            .await
    }

    /// Latest score breakdown for a level
    pub fn get_score_breakdown(&self, level_id: &str) -> Option<ScoreRecord> {
        self.shared.scores.get(level_id).map(|r| r.value().clone())
    }

    pub async fn mode(&self) -> ControllerMode {
        *self.shared.mode.read().await
    }

    pub async fn pending(&self) -> Vec<PendingDecision> {
        self.shared.pending.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> ControllerStats {
        self.shared.stats.read().await.clone()
    }

    pub async fn health(&self) -> ControllerHealth {
        ControllerHealth {
            mode: self.mode().await,
            risk_level: self.risk.level().await,
            emergency: self.emergency.state().await,
            components: self.watchdog.get_all_health().await,
            checks: self.watchdog.check_statuses().await,
            execution: self.execution.stats().await,
            pool: self.pool.stats().await,
            controller: self.stats().await,
        }
    }

    // ==================== Control ====================

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ControlCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| PilotError::ChannelClosed("control loop stopped".to_string()))?;
        rx.await
            .map_err(|_| PilotError::ChannelClosed("control loop dropped the reply".to_string()))
    }

    /// Switch mode; returns the previous one
    pub async fn set_mode(&self, mode: ControllerMode, reason: impl Into<String>) -> Result<ControllerMode> {
        let reason = reason.into();
        self.request(|reply| ControlCommand::SetMode { mode, reason, reply })
            .await
    }

    pub async fn confirm_pending_decision(&self, id: Uuid) -> Result<Vec<Uuid>> {
        self.request(|reply| ControlCommand::ConfirmPending { id, reply })
            .await?
    }

    pub async fn reject_pending_decision(&self, id: Uuid) -> Result<()> {
        self.request(|reply| ControlCommand::RejectPending { id, reply })
            .await?
    }

    /// Run a cycle now, after any cycle in progress
    pub async fn trigger_cycle(&self) -> Result<CycleReport> {
        self.request(|reply| ControlCommand::TriggerCycle { reply }).await
    }

    pub async fn reset_emergency(&self, operator: impl Into<String>) -> Result<()> {
        let operator = operator.into();
        self.request(|reply| ControlCommand::ResetEmergency { operator, reply })
            .await?
    }
}

#[derive(Debug, Default)]
struct CycleTally {
    decisions: usize,
    commands: usize,
}

pub struct ControlLoop {
    config: ControllerConfig,
    snapshots: SnapshotBuilder,
    patterns: PatternRepository,
    matcher: PatternMatcher,
    predictor: Predictor,
    scorer: LevelScorer,
    optimizer: Optimizer,
    guard: OvertradingGuard,
    pool: Arc<LevelPool>,
    risk: Arc<RiskManager>,
    execution: Arc<ExecutionManager>,
    watchdog: Arc<Watchdog>,
    emergency: Arc<EmergencyStop>,
    venue: Arc<dyn ExecutionVenue>,
    data_clock: DataClock,
    shared: Arc<SharedState>,
    handle: ControllerHandle,
    command_rx: mpsc::Receiver<ControlCommand>,
    config_rx: Option<watch::Receiver<AppConfig>>,
    staged_config: Option<AppConfig>,
    heartbeat_secs: u64,
    cycle: u64,
    /// Close-everything already issued for the current latch
    emergency_handled: bool,
    /// Levels a critical close was issued for during the current latch
    emergency_closed: HashSet<String>,
    /// Open positions with a loss-limit close outstanding
    loss_closed: HashSet<String>,
    /// Last medium ATR % per symbol, for the black-swan threshold
    atr_pct: HashMap<String, f64>,
}

impl ControlLoop {
    pub fn new(app: &AppConfig, parts: LoopParts) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let shared = Arc::new(SharedState::new(app.controller.mode, app.controller.history_size));
        let handle = ControllerHandle {
            command_tx,
            shared: shared.clone(),
            pool: parts.pool.clone(),
            risk: parts.risk.clone(),
            execution: parts.execution.clone(),
            watchdog: parts.watchdog.clone(),
            emergency: parts.emergency.clone(),
        };

        Self {
            config: app.controller.clone(),
            snapshots: SnapshotBuilder::new(app.analysis.clone()),
            patterns: PatternRepository::from_config(&app.pattern),
            matcher: PatternMatcher::new(app.pattern.clone()),
            predictor: Predictor::new(app.predictor.clone()),
            scorer: LevelScorer::new(app.scoring.clone()),
            optimizer: Optimizer::new(app.optimizer.clone()),
            guard: OvertradingGuard::from_config(&app.optimizer),
            venue: parts.execution.venue(),
            pool: parts.pool,
            risk: parts.risk,
            execution: parts.execution,
            watchdog: parts.watchdog,
            emergency: parts.emergency,
            data_clock: parts.data_clock,
            shared,
            handle,
            command_rx,
            config_rx: None,
            staged_config: None,
            heartbeat_secs: app.watchdog.heartbeat_interval_secs.max(1),
            cycle: 0,
            emergency_handled: false,
            emergency_closed: HashSet::new(),
            loss_closed: HashSet::new(),
            atr_pct: HashMap::new(),
        }
    }

    /// Apply configuration published on `rx` at cycle boundaries
    pub fn with_config_updates(mut self, rx: watch::Receiver<AppConfig>) -> Self {
        self.config_rx = Some(rx);
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    /// Pattern library used by the matcher
    pub fn patterns_mut(&mut self) -> &mut PatternRepository {
        &mut self.patterns
    }

    /// Seed candle history for every pool symbol before the first cycle
    pub async fn warm_up(&mut self) {
        for symbol in self.pool.symbols().await {
            match self
                .venue
                .get_candles(&symbol, self.config.candle_window, self.config.candle_resolution)
                .await
            {
                Ok(candles) => {
                    let count = candles.len();
                    self.snapshots.seed(candles);
                    debug!(symbol = %symbol, candles = count, "history seeded");
                }
                Err(e) => warn!(symbol = %symbol, "history seed failed: {}", e),
            }
        }
    }

    // ==================== Main Loop ====================

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        info!(
            mode = %self.config.mode,
            cycle_secs = self.config.cycle_interval_secs,
            "control loop starting"
        );
        self.watchdog.register(CONTROL_LOOP_COMPONENT).await;
        self.watchdog.heartbeat(CONTROL_LOOP_COMPONENT).await;

        let mut cycle_secs = self.config.cycle_interval_secs.max(1);
        let mut cycle_tick = tokio::time::interval(Duration::from_secs(cycle_secs));
        cycle_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat_secs = self.heartbeat_secs;
        let mut heartbeat_tick = tokio::time::interval(Duration::from_secs(heartbeat_secs));
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut emergency_rx = self.emergency.subscribe();
        let mut watchdog_rx = self.watchdog.subscribe();
        let mut execution_rx = self.execution.subscribe();

        loop {
            tokio::select! {
                // --- Scheduled decision cycle ---
                _ = cycle_tick.tick() => {
                    let report = self.run_cycle().await;
                    if report.duration_ms > cycle_secs * 1_000 {
                        warn!(cycle = report.cycle, duration_ms = report.duration_ms, "decision cycle overran its interval; next tick skipped");
                        self.shared.stats.write().await.overruns += 1;
                    }
                }

                // --- Liveness for the watchdog ---
                _ = heartbeat_tick.tick() => {
                    self.watchdog.heartbeat(CONTROL_LOOP_COMPONENT).await;
                }

                // --- Emergency preempts the cadence ---
                changed = emergency_rx.changed() => {
                    if changed.is_ok() && *emergency_rx.borrow_and_update() {
                        let mut tally = CycleTally::default();
                        self.handle_emergency(Utc::now(), &mut tally).await;
                    }
                }

                Ok(event) = watchdog_rx.recv() => {
                    self.on_watchdog_event(event).await;
                }

                Ok(event) = execution_rx.recv() => {
                    self.on_execution_event(event).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }

                Some(config) = next_config(&mut self.config_rx) => {
                    debug!("configuration update staged for next cycle");
                    self.staged_config = Some(config);
                }

                _ = shutdown.recv() => {
                    info!("control loop: shutdown signal received");
                    break;
                }
            }

            let configured = self.config.cycle_interval_secs.max(1);
            if configured != cycle_secs {
                cycle_secs = configured;
                cycle_tick = tokio::time::interval_at(
                    Instant::now() + Duration::from_secs(cycle_secs),
                    Duration::from_secs(cycle_secs),
                );
                cycle_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!(cycle_secs, "cycle interval changed");
            }
            if self.heartbeat_secs != heartbeat_secs {
                heartbeat_secs = self.heartbeat_secs;
                heartbeat_tick = tokio::time::interval(Duration::from_secs(heartbeat_secs));
                heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }

        self.watchdog.mark_stopped(CONTROL_LOOP_COMPONENT).await;
        info!("control loop: exited");
    }

    async fn handle_command(&mut self, cmd: ControlCommand) {
        let now = Utc::now();
        match cmd {
            ControlCommand::SetMode { mode, reason, reply } => {
                let previous = self.set_mode(mode, &reason, now).await;
                let _ = reply.send(previous);
            }
            ControlCommand::ConfirmPending { id, reply } => {
                let _ = reply.send(self.confirm_pending(id, now).await);
            }
            ControlCommand::RejectPending { id, reply } => {
                let _ = reply.send(self.reject_pending(id, now).await);
            }
            ControlCommand::TriggerCycle { reply } => {
                let _ = reply.send(self.run_cycle().await);
            }
            ControlCommand::ResetEmergency { operator, reply } => {
                let _ = reply.send(self.reset_emergency(&operator, now).await);
            }
        }
    }

    // ==================== Decision Cycle ====================

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// One decision cycle evaluated at `now`
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        self.apply_staged_config().await;
        self.cycle += 1;
        let mode = *self.shared.mode.read().await;
        let mut tally = CycleTally::default();

        self.expire_pending(now, &mut tally).await;
        self.ingest_market_data().await;
        self.reconcile_fills().await;
        if self.config.recycle_closed {
            self.recycle_closed().await;
        }

        let risk_state = self.risk.evaluate(now).await;
        if risk_state.level == RiskLevel::Emergency && !self.emergency.is_stopped() {
            let reason = risk_state
                .emergency_reason
                .clone()
                .unwrap_or_else(|| "risk level emergency".to_string());
            self.emergency.trigger(EmergencyReason::RiskLimit(reason)).await;
        }

        let emergency = self.emergency.is_stopped();
        if emergency {
            // Forced closes bypass suppression and mode.
            self.handle_emergency(now, &mut tally).await;
        } else {
            self.close_on_loss_breach(&risk_state, now, &mut tally).await;
            if mode != ControllerMode::Disabled {
                for symbol in self.pool.symbols().await {
                    self.decide_symbol(&symbol, mode, now, &mut tally).await;
                }
                let prices: HashMap<String, Decimal> = self
                    .pool
                    .symbols()
                    .await
                    .into_iter()
                    .filter_map(|s| self.snapshots.last_price(&s).map(|p| (s, p)))
                    .collect();
                let orphan_closes = self.execution.monitor_orphans(&prices, now).await;
                tally.commands += orphan_closes.len();
            }
        }

        self.watchdog.heartbeat(CONTROL_LOOP_COMPONENT).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut stats = self.shared.stats.write().await;
            stats.cycles += 1;
            stats.last_cycle_at = Some(now);
            stats.last_cycle_ms = duration_ms;
            stats.emergency_active = emergency;
        }
        info!(
            cycle = self.cycle,
            mode = %mode,
            risk = %risk_state.level,
            decisions = tally.decisions,
            commands = tally.commands,
            duration_ms,
            "decision cycle complete"
        );

        CycleReport {
            cycle: self.cycle,
            started_at: now,
            duration_ms,
            mode,
            decisions: tally.decisions,
            commands: tally.commands,
            emergency,
        }
    }

    async fn ingest_market_data(&mut self) {
        match self.venue.poll_ticks().await {
            Ok(ticks) => {
                for tick in ticks {
                    self.snapshots.on_tick(&tick);
                    self.patterns.on_price(&tick.symbol, tick.price, tick.at);
                    self.data_clock.touch(tick.at).await;
                    self.risk.mark_to_market(&tick.symbol, tick.price).await;
                    let atr = self.atr_pct.get(&tick.symbol).copied();
                    if let Some(breach) = self
                        .risk
                        .observe_price(&tick.symbol, tick.price, tick.at, atr)
                        .await
                    {
                        error!(symbol = %tick.symbol, "🚨 {}", breach);
                    }
                }
            }
            Err(e) => warn!("tick poll failed: {}", e),
        }

        for symbol in self.pool.symbols().await {
            match self
                .venue
                .get_candles(&symbol, self.config.candle_window, self.config.candle_resolution)
                .await
            {
                Ok(candles) => {
                    for candle in candles {
                        self.snapshots.on_candle(candle);
                    }
                }
                Err(e) => debug!(symbol = %symbol, "candle fetch failed: {}", e),
            }
        }
    }

    async fn reconcile_fills(&self) {
        match self.venue.poll_fills().await {
            Ok(fills) if !fills.is_empty() => {
                let applied = self.execution.reconcile_fills(fills).await;
                debug!(applied, "fills reconciled");
            }
            Ok(_) => {}
            Err(e) => warn!("fill poll failed: {}", e),
        }
    }

    async fn recycle_closed(&self) {
        for level in self
            .pool
            .list(&LevelFilter::all().status(LevelStatus::Closed))
            .await
        {
            if let Err(e) = self.pool.recycle(&level.id).await {
                warn!(level_id = %level.id, "recycle failed: {}", e);
            }
        }
    }

    async fn decide_symbol(
        &mut self,
        symbol: &str,
        mode: ControllerMode,
        now: DateTime<Utc>,
        tally: &mut CycleTally,
    ) {
        let snapshot = match self.snapshots.build(symbol, now) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(symbol = %symbol, "no snapshot: {}", e);
                return;
            }
        };
        if !snapshot.data_sufficient {
            debug!(symbol = %symbol, samples = snapshot.samples, "partial history; neutral readings in use");
        }
        self.atr_pct
            .insert(symbol.to_string(), snapshot.volatility.medium_pct);

        let pattern = self.matcher.find(&snapshot.fingerprint, &self.patterns);
        self.patterns
            .observe(symbol, snapshot.fingerprint, snapshot.price, now);
        let prediction = self.predictor.predict(&snapshot, &pattern);

        let levels = self.pool.list(&LevelFilter::all().symbol(symbol)).await;
        let scores = self
            .scorer
            .score(&levels, &snapshot, &pattern, &prediction, now);
        for record in &scores {
            debug!(
                level_id = %record.level_id,
                price = %record.price,
                score = format!("{:.1}", record.aggregate),
                "level scored"
            );
            self.shared
                .scores
                .insert(record.level_id.clone(), record.clone());
        }
        self.pool.record_scores(&scores).await;

        let active_here = levels
            .iter()
            .filter(|l| l.status == LevelStatus::Active)
            .count();
        let active_total = self.pool.active_count().await;
        let plan = self.optimizer.plan(&PlanInput {
            symbol,
            price: snapshot.price,
            scores: &scores,
            levels: &levels,
            active_elsewhere: active_total.saturating_sub(active_here),
            now,
        });
        if plan.is_empty() {
            return;
        }

        if let Err(reason) = self.guard.check(symbol, now) {
            warn!(symbol = %symbol, plan_id = %plan.id, "plan suppressed: {}", reason);
            self.record(
                tally,
                DecisionRecord::for_plan(self.cycle, now, plan, DecisionOutcome::Suppressed { reason }),
            )
            .await;
            return;
        }

        let verdict = self.risk.check_plan(&plan, &levels).await;
        if let RiskVerdict::Rejected { reasons } = &verdict {
            let reason = reasons.join("; ");
            warn!(symbol = %symbol, plan_id = %plan.id, "plan rejected by risk: {}", reason);
            self.record(
                tally,
                DecisionRecord::for_plan(self.cycle, now, plan.clone(), DecisionOutcome::Rejected { reason })
                    .with_verdict(verdict.clone()),
            )
            .await;
            return;
        }

        match mode {
            ControllerMode::Autonomous => {
                let ids = self.dispatch_plan(&plan, now).await;
                if ids.is_empty() {
                    debug!(symbol = %symbol, "plan already applied");
                    return;
                }
                self.record(
                    tally,
                    DecisionRecord::for_plan(self.cycle, now, plan, DecisionOutcome::Executed)
                        .with_verdict(verdict)
                        .with_commands(ids),
                )
                .await;
            }
            ControllerMode::Alert => self.hold_pending(plan, verdict, now, tally).await,
            ControllerMode::Disabled => {}
        }
    }

    async fn dispatch_plan(&mut self, plan: &Plan, now: DateTime<Utc>) -> Vec<Uuid> {
        let ids = self.execution.submit_plan(plan).await;
        if !ids.is_empty() {
            self.guard.record(&plan.symbol, plan.change_count(), now);
            self.shared
                .stats
                .write()
                .await
                .record_changes(plan.change_count(), now);
            info!(
                symbol = %plan.symbol,
                plan_id = %plan.id,
                activate = plan.activate.len(),
                deactivate = plan.deactivate.len(),
                commands = ids.len(),
                "plan dispatched"
            );
        }
        ids
    }

    async fn record(&self, tally: &mut CycleTally, record: DecisionRecord) {
        tally.decisions += 1;
        tally.commands += record.commands.len();
        self.shared.record(record).await;
    }

    /// While a loss limit sits in its hard band, close every losing
    /// position at high priority. Like emergency closes this skips the
    /// overtrading guard and the mode. One close per position; an abandoned
    /// close makes the position eligible again.
    async fn close_on_loss_breach(&mut self, state: &RiskState, now: DateTime<Utc>, tally: &mut CycleTally) {
        let open: HashMap<String, Level> = self
            .pool
            .open_positions()
            .await
            .into_iter()
            .map(|l| (l.id.clone(), l))
            .collect();
        self.loss_closed.retain(|id| open.contains_key(id));

        let breaches = state.loss_breaches();
        if breaches.is_empty() {
            return;
        }
        let reason = breaches
            .iter()
            .map(|c| format!("hard limit breached: {}", c.describe()))
            .collect::<Vec<_>>()
            .join("; ");

        let mut ids = Vec::new();
        for position in self.risk.positions().await {
            if position.unrealized() >= Decimal::ZERO || self.loss_closed.contains(&position.level_id) {
                continue;
            }
            let Some(level) = open.get(&position.level_id) else {
                continue;
            };
            if let Some(id) = self.execution.risk_close(level).await {
                ids.push(id);
                self.loss_closed.insert(level.id.clone());
            }
        }
        if ids.is_empty() {
            return;
        }
        warn!(commands = ids.len(), risk = %state.level, "closing losing positions: {}", reason);
        self.record(
            tally,
            DecisionRecord::new(self.cycle, now, DecisionOutcome::ForcedClose { reason }).with_commands(ids),
        )
        .await;
    }

    // ==================== Alert Mode ====================

    async fn hold_pending(
        &mut self,
        plan: Plan,
        verdict: RiskVerdict,
        now: DateTime<Utc>,
        tally: &mut CycleTally,
    ) {
        let signature = plan.signature();
        let mut pending = self.shared.pending.write().await;
        if pending
            .values()
            .any(|p| p.symbol == plan.symbol && p.plan.signature() == signature)
        {
            debug!(symbol = %plan.symbol, "identical plan already awaiting confirmation");
            return;
        }
        let superseded: Vec<Uuid> = pending
            .values()
            .filter(|p| p.symbol == plan.symbol)
            .map(|p| p.id)
            .collect();
        for id in &superseded {
            pending.remove(id);
        }

        let id = Uuid::new_v4();
        let expires_at = now + ChronoDuration::seconds(self.config.pending_expiry_secs as i64);
        pending.insert(
            id,
            PendingDecision {
                id,
                symbol: plan.symbol.clone(),
                plan: plan.clone(),
                verdict: verdict.clone(),
                created_at: now,
                expires_at,
            },
        );
        drop(pending);

        for old in superseded {
            self.record(
                tally,
                DecisionRecord::new(self.cycle, now, DecisionOutcome::Expired { pending_id: old })
                    .with_symbol(plan.symbol.clone()),
            )
            .await;
        }
        info!(
            pending_id = %id,
            symbol = %plan.symbol,
            changes = plan.change_count(),
            %expires_at,
            "🔔 plan awaiting confirmation"
        );
        let mut record = DecisionRecord::for_plan(
            self.cycle,
            now,
            plan,
            DecisionOutcome::PendingConfirmation { expires_at },
        )
        .with_verdict(verdict);
        record.id = id;
        self.record(tally, record).await;
    }

    async fn expire_pending(&self, now: DateTime<Utc>, tally: &mut CycleTally) {
        let expired: Vec<PendingDecision> = {
            let mut pending = self.shared.pending.write().await;
            let ids: Vec<Uuid> = pending
                .values()
                .filter(|p| p.is_expired(now))
                .map(|p| p.id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for p in expired {
            info!(pending_id = %p.id, symbol = %p.symbol, "pending plan expired");
            self.record(
                tally,
                DecisionRecord::new(self.cycle, now, DecisionOutcome::Expired { pending_id: p.id })
                    .with_symbol(p.symbol),
            )
            .await;
        }
    }

    async fn discard_all_pending(&self, now: DateTime<Utc>, tally: &mut CycleTally) {
        let drained: Vec<PendingDecision> = {
            let mut pending = self.shared.pending.write().await;
            std::mem::take(&mut *pending).into_values().collect()
        };
        for p in drained {
            self.record(
                tally,
                DecisionRecord::new(self.cycle, now, DecisionOutcome::Expired { pending_id: p.id })
                    .with_symbol(p.symbol),
            )
            .await;
        }
    }

    async fn confirm_pending(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        if *self.shared.mode.read().await == ControllerMode::Disabled {
            return Err(PilotError::InvalidState("controller is disabled".to_string()));
        }
        if self.emergency.is_stopped() {
            return Err(PilotError::EmergencyActive(
                "pending plans cannot be confirmed during an emergency".to_string(),
            ));
        }
        let pending = self
            .shared
            .pending
            .write()
            .await
            .remove(&id)
            .ok_or(PilotError::PendingDecisionNotFound(id))?;

        let mut tally = CycleTally::default();
        if pending.is_expired(now) {
            self.record(
                &mut tally,
                DecisionRecord::new(self.cycle, now, DecisionOutcome::Expired { pending_id: id })
                    .with_symbol(pending.symbol),
            )
            .await;
            return Err(PilotError::PendingDecisionNotFound(id));
        }

        // State may have moved since the plan was proposed.
        let levels = self
            .pool
            .list(&LevelFilter::all().symbol(&pending.symbol))
            .await;
        let verdict = self.risk.check_plan(&pending.plan, &levels).await;
        if let RiskVerdict::Rejected { reasons } = &verdict {
            let reason = reasons.join("; ");
            warn!(pending_id = %id, "confirmed plan rejected by risk: {}", reason);
            self.record(
                &mut tally,
                DecisionRecord::for_plan(
                    self.cycle,
                    now,
                    pending.plan,
                    DecisionOutcome::Rejected {
                        reason: reason.clone(),
                    },
                )
                .with_verdict(verdict),
            )
            .await;
            return Err(PilotError::LimitBreach(reason));
        }

        let ids = self.dispatch_plan(&pending.plan, now).await;
        info!(pending_id = %id, commands = ids.len(), "pending plan confirmed");
        self.record(
            &mut tally,
            DecisionRecord::for_plan(
                self.cycle,
                now,
                pending.plan,
                DecisionOutcome::Confirmed { pending_id: id },
            )
            .with_verdict(verdict)
            .with_commands(ids.clone()),
        )
        .await;
        Ok(ids)
    }

    async fn reject_pending(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let pending = self
            .shared
            .pending
            .write()
            .await
            .remove(&id)
            .ok_or(PilotError::PendingDecisionNotFound(id))?;
        info!(pending_id = %id, symbol = %pending.symbol, "pending plan rejected by operator");
        let mut tally = CycleTally::default();
        self.record(
            &mut tally,
            DecisionRecord::for_plan(
                self.cycle,
                now,
                pending.plan,
                DecisionOutcome::OperatorRejected { pending_id: id },
            ),
        )
        .await;
        Ok(())
    }

    // ==================== Mode & Emergency ====================

    async fn set_mode(&mut self, mode: ControllerMode, reason: &str, now: DateTime<Utc>) -> ControllerMode {
        let previous = {
            let mut current = self.shared.mode.write().await;
            std::mem::replace(&mut *current, mode)
        };
        if previous == mode {
            return previous;
        }
        self.shared.stats.write().await.mode = mode;
        info!(from = %previous, to = %mode, "controller mode changed: {}", reason);

        let mut tally = CycleTally::default();
        if mode == ControllerMode::Disabled {
            self.discard_all_pending(now, &mut tally).await;
        }
        self.record(
            &mut tally,
            DecisionRecord::new(
                self.cycle,
                now,
                DecisionOutcome::ModeChanged {
                    reason: format!("{previous} -> {mode}: {reason}"),
                },
            ),
        )
        .await;
        previous
    }

    /// Close everything once per latch, then pick up positions filled since
    async fn handle_emergency(&mut self, now: DateTime<Utc>, tally: &mut CycleTally) {
        if !self.emergency_handled {
            self.emergency_handled = true;
            let reason = self
                .emergency
                .state()
                .await
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "emergency stop".to_string());
            self.emergency_closed = self
                .pool
                .open_positions()
                .await
                .into_iter()
                .map(|l| l.id)
                .collect();
            let ids = self.execution.on_emergency(&reason).await;
            self.discard_all_pending(now, tally).await;
            self.shared.stats.write().await.emergency_active = true;
            error!(commands = ids.len(), "🚨 close-everything issued: {}", reason);
            self.record(
                tally,
                DecisionRecord::new(self.cycle, now, DecisionOutcome::Emergency { reason })
                    .with_commands(ids),
            )
            .await;
            return;
        }

        let mut ids = Vec::new();
        for level in self.pool.open_positions().await {
            if self.emergency_closed.contains(&level.id) {
                continue;
            }
            if let Some(id) = self.execution.force_close(&level).await {
                ids.push(id);
            }
            self.emergency_closed.insert(level.id);
        }
        if !ids.is_empty() {
            error!(commands = ids.len(), "🚨 closing positions filled during emergency");
            self.record(
                tally,
                DecisionRecord::new(
                    self.cycle,
                    now,
                    DecisionOutcome::Emergency {
                        reason: "positions filled after emergency stop".to_string(),
                    },
                )
                .with_commands(ids),
            )
            .await;
        }
    }

    async fn reset_emergency(&mut self, operator: &str, now: DateTime<Utc>) -> Result<()> {
        if *self.shared.mode.read().await != ControllerMode::Disabled {
            return Err(PilotError::InvalidState(
                "emergency reset requires disabled mode".to_string(),
            ));
        }
        if !self.emergency.is_stopped() {
            return Ok(());
        }
        self.emergency.reset(operator).await;
        self.risk.clear_emergency().await;
        self.emergency_handled = false;
        self.emergency_closed.clear();
        self.loss_closed.clear();
        self.shared.stats.write().await.emergency_active = false;

        let mut tally = CycleTally::default();
        self.record(
            &mut tally,
            DecisionRecord::new(
                self.cycle,
                now,
                DecisionOutcome::ModeChanged {
                    reason: format!("emergency reset by {operator}"),
                },
            ),
        )
        .await;
        Ok(())
    }

    async fn on_watchdog_event(&mut self, event: WatchdogEvent) {
        match event {
            WatchdogEvent::PauseRequested { check, reason } => {
                let mode = *self.shared.mode.read().await;
                if mode == ControllerMode::Autonomous {
                    let reason = format!("health check {check} failing: {reason}");
                    self.set_mode(ControllerMode::Alert, &reason, Utc::now()).await;
                } else {
                    warn!(check = %check, mode = %mode, "health check failing: {}", reason);
                }
            }
            WatchdogEvent::RecoveryExhausted { component, attempts } => {
                error!(component = %component, attempts, "watchdog recovery exhausted");
            }
            WatchdogEvent::HeartbeatMissed { component, missed } => {
                warn!(component = %component, missed, "heartbeat missed");
            }
            other => debug!(event = ?other, "watchdog event"),
        }
    }

    async fn on_execution_event(&mut self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Abandoned {
                command_id,
                reason,
                best_effort: false,
                kind,
                target,
            } => {
                if let (CommandKind::ClosePosition, CommandTarget::Level(level_id)) = (kind, &target) {
                    self.loss_closed.remove(level_id);
                }
                let mut tally = CycleTally::default();
                self.record(
                    &mut tally,
                    DecisionRecord::new(
                        self.cycle,
                        Utc::now(),
                        DecisionOutcome::Abandoned {
                            command_id,
                            reason: format!("{kind} {target}: {reason}"),
                        },
                    ),
                )
                .await;
            }
            ExecutionEvent::Refused { kind, target, reason } => {
                error!(kind = %kind, target = %target, "command refused: {}", reason);
            }
            other => debug!(event = ?other, "execution event"),
        }
    }

    /// Swap in a staged configuration; an invalid one is ignored
    async fn apply_staged_config(&mut self) {
        let Some(app) = self.staged_config.take() else {
            return;
        };
        if let Err(problems) = app.validate() {
            warn!("ignoring invalid configuration reload: {}", problems.join("; "));
            return;
        }

        self.config = app.controller.clone();
        self.shared
            .history
            .write()
            .await
            .set_capacity(app.controller.history_size);
        self.snapshots.update_config(app.analysis.clone());
        self.matcher = PatternMatcher::new(app.pattern.clone());
        self.predictor = Predictor::new(app.predictor.clone());
        self.scorer = LevelScorer::new(app.scoring.clone());
        self.optimizer = Optimizer::new(app.optimizer.clone());
        self.guard.update_limits(&app.optimizer);
        self.risk.update_limits(app.risk.clone()).await;
        self.watchdog.update_config(app.watchdog.clone()).await;
        self.execution.update_config(app.execution.clone()).await;
        self.heartbeat_secs = app.watchdog.heartbeat_interval_secs.max(1);
        info!("configuration reloaded");
    }
}

async fn next_config(rx: &mut Option<watch::Receiver<AppConfig>>) -> Option<AppConfig> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperConfig, PaperVenue};
    use crate::execution::ExecutionConfig;
    use crate::risk::RiskLimits;
    use crate::supervisor::WatchdogConfig;

    fn build(mode: ControllerMode) -> (ControlLoop, ControllerHandle) {
        let mut app = AppConfig::default();
        app.controller.mode = mode;
        let emergency = Arc::new(EmergencyStop::new());
        let pool = Arc::new(LevelPool::new(0));
        let risk = Arc::new(RiskManager::new(RiskLimits::default(), emergency.clone()));
        let venue = Arc::new(PaperVenue::new(PaperConfig::default()));
        let execution = Arc::new(ExecutionManager::new(
            ExecutionConfig::default(),
            venue,
            pool.clone(),
            risk.clone(),
            emergency.clone(),
        ));
        let watchdog = Arc::new(Watchdog::new(WatchdogConfig::default(), emergency.clone()));
        let control = ControlLoop::new(
            &app,
            LoopParts {
                pool,
                risk,
                execution,
                watchdog,
                emergency,
                data_clock: DataClock::new(),
            },
        );
        let handle = control.handle();
        (control, handle)
    }

    #[tokio::test]
    async fn test_empty_pool_cycle() {
        let (mut control, handle) = build(ControllerMode::Autonomous);
        let report = control.run_cycle().await;
        assert_eq!(report.cycle, 1);
        assert_eq!(report.decisions, 0);
        assert!(!report.emergency);
        assert_eq!(handle.stats().await.cycles, 1);
    }

    #[tokio::test]
    async fn test_reset_requires_disabled_mode() {
        let (mut control, handle) = build(ControllerMode::Alert);
        control
            .emergency
            .trigger(EmergencyReason::Manual("test".into()))
            .await;
        let report = control.run_cycle().await;
        assert!(report.emergency);
        assert_eq!(report.decisions, 1);

        let now = Utc::now();
        assert!(control.reset_emergency("ops", now).await.is_err());
        control.set_mode(ControllerMode::Disabled, "maintenance", now).await;
        control.reset_emergency("ops", now).await.unwrap();
        assert!(!control.emergency.is_stopped());
        assert_eq!(handle.mode().await, ControllerMode::Disabled);

        let kinds: Vec<&str> = handle
            .list_decisions(None)
            .await
            .iter()
            .map(|r| r.outcome.kind())
            .collect();
        assert_eq!(kinds, vec!["emergency", "mode_changed", "mode_changed"]);
    }
}
