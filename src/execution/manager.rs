//! Execution Manager
//!
//! Turns approved plans, orphan profit-takes and emergency directives into
//! prioritized commands and drains them to the venue from a single worker.
//! No pool or risk lock is held while the venue is called.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::{
    CloseSpec, Command, CommandKind, CommandPriority, CommandStatus, CommandTarget,
};
use super::orphan::{OrphanBook, OrphanPosition};
use super::queue::{CommandQueue, QueueStats};
use crate::coordination::{EmergencyStop, ShutdownSignal};
use crate::domain::{Level, LevelStatus, Plan};
use crate::error::{PilotError, Result};
use crate::exchange::{CloseRequest, ExecutionVenue, FillKind, FillReport, PriceType, VenueAck};
use crate::levels::{LevelFilter, LevelPool};
use crate::risk::RiskManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub ack_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Per-share gain at which an orphan is closed
    pub orphan_profit_threshold: Decimal,
    pub queue_capacity: usize,
    pub history_size: usize,
    /// Worker wake-up when idle
    pub idle_poll_ms: u64,
    /// Age at which an unfilled orphan close is cancelled and re-priced
    pub orphan_close_max_age_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            max_retries: 3,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            orphan_profit_threshold: dec!(0.03),
            queue_capacity: 1_000,
            history_size: 1_000,
            idle_poll_ms: 500,
            orphan_close_max_age_secs: 120,
        }
    }
}

impl ExecutionConfig {
    /// Exponential backoff before retry `attempt` (1-based), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.backoff_initial_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.ack_timeout_secs == 0 {
            problems.push("execution.ack_timeout_secs must be positive".to_string());
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            problems.push("execution.backoff_initial_ms exceeds backoff_max_ms".to_string());
        }
        if self.orphan_profit_threshold < Decimal::ZERO {
            problems.push("execution.orphan_profit_threshold must not be negative".to_string());
        }
        if self.queue_capacity == 0 {
            problems.push("execution.queue_capacity must be positive".to_string());
        }
        if self.orphan_close_max_age_secs == 0 {
            problems.push("execution.orphan_close_max_age_secs must be positive".to_string());
        }
        problems
    }
}

/// Events emitted by the execution worker
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Acknowledged {
        command_id: Uuid,
        kind: CommandKind,
        target: CommandTarget,
    },
    Retrying {
        command_id: Uuid,
        attempt: u32,
        error: String,
    },
    Abandoned {
        command_id: Uuid,
        kind: CommandKind,
        target: CommandTarget,
        reason: String,
        best_effort: bool,
    },
    Cancelled {
        command_id: Uuid,
        kind: CommandKind,
        target: CommandTarget,
    },
    /// Queue full; the command was never queued
    Refused {
        kind: CommandKind,
        target: CommandTarget,
        reason: String,
    },
    OrphanCreated {
        level_id: String,
    },
    OrphanClosed {
        level_id: String,
        pnl: Decimal,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub submitted: u64,
    pub deduplicated: u64,
    pub acknowledged: u64,
    pub failed_attempts: u64,
    pub abandoned: u64,
    pub cancelled: u64,
    pub avg_ack_latency_ms: f64,
    pub orphans: usize,
    pub queue: QueueStats,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    deduplicated: u64,
    acknowledged: u64,
    failed_attempts: u64,
    abandoned: u64,
    cancelled: u64,
    ack_latency_total_ms: f64,
}

pub struct ExecutionManager {
    config: RwLock<ExecutionConfig>,
    queue: Mutex<CommandQueue>,
    in_flight: Mutex<Option<Command>>,
    history: RwLock<VecDeque<Command>>,
    counters: RwLock<Counters>,
    orphans: RwLock<OrphanBook>,
    /// Serializes consumers: there is only ever one
    consumer: Mutex<()>,
    wake: Notify,
    cancel_tx: watch::Sender<u64>,
    event_tx: broadcast::Sender<ExecutionEvent>,
    venue: Arc<dyn ExecutionVenue>,
    pool: Arc<LevelPool>,
    risk: Arc<RiskManager>,
    emergency: Arc<EmergencyStop>,
}

impl ExecutionManager {
    pub fn new(
        config: ExecutionConfig,
        venue: Arc<dyn ExecutionVenue>,
        pool: Arc<LevelPool>,
        risk: Arc<RiskManager>,
        emergency: Arc<EmergencyStop>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (cancel_tx, _) = watch::channel(0u64);
        Self {
            queue: Mutex::new(CommandQueue::new(config.queue_capacity)),
            config: RwLock::new(config),
            in_flight: Mutex::new(None),
            history: RwLock::new(VecDeque::new()),
            counters: RwLock::new(Counters::default()),
            orphans: RwLock::new(OrphanBook::new()),
            consumer: Mutex::new(()),
            wake: Notify::new(),
            cancel_tx,
            event_tx,
            venue,
            pool,
            risk,
            emergency,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }

    pub async fn update_config(&self, config: ExecutionConfig) {
        *self.config.write().await = config;
    }

    pub fn venue(&self) -> Arc<dyn ExecutionVenue> {
        self.venue.clone()
    }

    // ==================== Producers ====================

    /// Queue the commands a plan implies.
    ///
    /// Deactivations go out at high priority ahead of activations. Levels
    /// already in the target state, or with an equivalent command queued
    /// or in flight, are skipped, so resubmitting a plan is a no-op.
    pub async fn submit_plan(&self, plan: &Plan) -> Vec<Uuid> {
        let mut ids = Vec::new();

        for action in &plan.deactivate {
            let Some(level) = self.pool.get(&action.level_id).await else {
                warn!(level_id = %action.level_id, "deactivation for unknown level");
                continue;
            };
            if !matches!(level.status, LevelStatus::Active | LevelStatus::Filled) {
                self.counters.write().await.deduplicated += 1;
                continue;
            }
            let cmd = Command::deactivate(&level.id).with_plan(plan.id);
            if let Some(id) = self.enqueue_unique(cmd).await {
                ids.push(id);
            }
        }

        for action in &plan.activate {
            let Some(level) = self.pool.get(&action.level_id).await else {
                warn!(level_id = %action.level_id, "activation for unknown level");
                continue;
            };
            if level.status != LevelStatus::Available {
                self.counters.write().await.deduplicated += 1;
                continue;
            }
            let cmd = Command::activate(&level.id).with_plan(plan.id);
            if let Some(id) = self.enqueue_unique(cmd).await {
                ids.push(id);
            }
        }

        if !ids.is_empty() {
            info!(plan_id = %plan.id, symbol = %plan.symbol, commands = ids.len(), "plan submitted");
            self.wake.notify_one();
        }
        ids
    }

    /// Queue a single command, unless an equivalent one is already pending
    pub async fn submit(&self, cmd: Command) -> Option<Uuid> {
        let id = self.enqueue_unique(cmd).await;
        if id.is_some() {
            self.wake.notify_one();
        }
        id
    }

    async fn enqueue_unique(&self, cmd: Command) -> Option<Uuid> {
        let mut queue = self.queue.lock().await;
        let in_flight = self.in_flight.lock().await;
        let duplicate = queue.contains(cmd.kind, &cmd.target, cmd.priority)
            || in_flight
                .as_ref()
                .map(|f| f.dedup_key() == cmd.dedup_key() && f.priority <= cmd.priority)
                .unwrap_or(false);
        drop(in_flight);

        if duplicate {
            debug!(kind = %cmd.kind, target = %cmd.target, "duplicate command skipped");
            drop(queue);
            self.counters.write().await.deduplicated += 1;
            return None;
        }

        let id = cmd.id;
        let (kind, target) = cmd.dedup_key();
        match queue.enqueue(cmd) {
            Ok(()) => {
                drop(queue);
                self.counters.write().await.submitted += 1;
                Some(id)
            }
            Err(e) => {
                drop(queue);
                let _ = self.event_tx.send(ExecutionEvent::Refused {
                    kind,
                    target,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Enqueue limit closes for orphans whose per-share gain reached the
    /// threshold. The limit is the current market price. Closes resting
    /// unfilled past `orphan_close_max_age_secs` are cancelled first and
    /// priced again.
    pub async fn monitor_orphans(&self, prices: &HashMap<String, Decimal>, now: DateTime<Utc>) -> Vec<Uuid> {
        let (threshold, max_age, ack_timeout) = {
            let config = self.config.read().await;
            (
                config.orphan_profit_threshold,
                ChronoDuration::seconds(config.orphan_close_max_age_secs as i64),
                Duration::from_secs(config.ack_timeout_secs.max(1)),
            )
        };
        self.cancel_stale_closes(now, max_age, ack_timeout).await;
        let candidates = self.orphans.read().await.profitable(prices, threshold);

        let mut ids = Vec::new();
        for (orphan, price) in candidates {
            let spec = CloseSpec {
                symbol: orphan.symbol.clone(),
                side: orphan.side,
                size: orphan.size,
                price_type: PriceType::Limit,
                limit_price: Some(price),
            };
            let cmd = Command::close(&orphan.level_id, CommandPriority::Normal, spec).best_effort();
            if let Some(id) = self.enqueue_unique(cmd).await {
                self.orphans.write().await.close_issued(&orphan.level_id, now);
                info!(
                    level_id = %orphan.level_id,
                    entry = %orphan.entry_price,
                    limit = %price,
                    gain_per_share = %orphan.gain_per_share(price),
                    "orphan profit-take queued"
                );
                ids.push(id);
            }
        }
        if !ids.is_empty() {
            self.wake.notify_one();
        }
        ids
    }

    async fn cancel_stale_closes(&self, now: DateTime<Utc>, max_age: ChronoDuration, ack_timeout: Duration) {
        let stale = self.orphans.read().await.stale_closes(now, max_age);
        for (level_id, order_id) in stale {
            match tokio::time::timeout(ack_timeout, self.venue.cancel_order(&order_id)).await {
                Ok(Ok(())) => {
                    self.orphans.write().await.clear_close(&level_id);
                    info!(level_id = %level_id, order_id = %order_id, "stale orphan close cancelled for re-pricing");
                }
                Ok(Err(e)) => {
                    warn!(level_id = %level_id, order_id = %order_id, "stale orphan close not cancelled: {}", e)
                }
                Err(_) => warn!(level_id = %level_id, order_id = %order_id, "stale orphan close cancel timed out"),
            }
        }
    }

    /// Close everything: cancel lower tiers, interrupt the in-flight
    /// command and queue a stop plus a critical close per open position.
    pub async fn on_emergency(&self, reason: &str) -> Vec<Uuid> {
        error!("🚨 Execution emergency: {}", reason);

        let drained = self.queue.lock().await.drain_below(CommandPriority::Critical);
        for mut cmd in drained {
            let _ = cmd.transition(CommandStatus::Cancelled);
            self.finish_cancelled(cmd).await;
        }
        self.cancel_tx.send_modify(|epoch| *epoch += 1);

        let mut ids = Vec::new();
        if let Some(id) = self.enqueue_unique(Command::emergency_stop()).await {
            ids.push(id);
        }
        for level in self.pool.open_positions().await {
            if let Some(id) = self.enqueue_market_close(&level, CommandPriority::Critical).await {
                ids.push(id);
            }
        }
        self.wake.notify_one();
        ids
    }

    /// Queue a critical market close for one open position
    pub async fn force_close(&self, level: &Level) -> Option<Uuid> {
        let id = self.enqueue_market_close(level, CommandPriority::Critical).await;
        if id.is_some() {
            self.wake.notify_one();
        }
        id
    }

    /// Queue a high-priority market close for a position caught in a hard
    /// loss breach. Ranks below emergency work, ahead of plans.
    pub async fn risk_close(&self, level: &Level) -> Option<Uuid> {
        let id = self.enqueue_market_close(level, CommandPriority::High).await;
        if id.is_some() {
            self.wake.notify_one();
        }
        id
    }

    async fn enqueue_market_close(&self, level: &Level, priority: CommandPriority) -> Option<Uuid> {
        let entry = level.entry.as_ref()?;
        let spec = CloseSpec {
            symbol: level.symbol.clone(),
            side: level.side,
            size: entry.size,
            price_type: PriceType::Market,
            limit_price: None,
        };
        self.enqueue_unique(Command::close(&level.id, priority, spec))
            .await
    }

    // ==================== Worker ====================

    /// Start the single consumer task
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!("Execution worker started");
            loop {
                manager.process_ready().await;
                let wait = manager.idle_wait().await;
                tokio::select! {
                    _ = manager.wake.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.recv() => break,
                }
            }
            let pending = manager.queue.lock().await.len();
            if pending > 0 {
                warn!("Execution worker stopping with {} queued command(s)", pending);
            }
            info!("Execution worker stopped");
        })
    }

    async fn idle_wait(&self) -> Duration {
        let idle = Duration::from_millis(self.config.read().await.idle_poll_ms.max(10));
        match self.queue.lock().await.next_ready_at() {
            Some(at) => at.saturating_duration_since(Instant::now()).min(idle),
            None => idle,
        }
    }

    /// Dispatch every command that is ready now, most urgent first.
    /// Returns the number dispatched.
    pub async fn process_ready(&self) -> usize {
        let _consumer = self.consumer.lock().await;
        let mut dispatched = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                let cmd = queue.dequeue_ready(Instant::now());
                if let Some(cmd) = &cmd {
                    *self.in_flight.lock().await = Some(cmd.clone());
                }
                cmd
            };
            let Some(cmd) = next else {
                break;
            };
            self.dispatch(cmd).await;
            dispatched += 1;
        }
        dispatched
    }

    async fn dispatch(&self, mut cmd: Command) {
        let config = self.config.read().await.clone();

        // Only critical commands dispatch while the emergency latch is set.
        if self.emergency.is_stopped() && cmd.priority != CommandPriority::Critical {
            let _ = cmd.transition(CommandStatus::Cancelled);
            self.finish_cancelled(cmd).await;
            return;
        }

        let _ = cmd.transition(CommandStatus::InFlight);
        debug!(command_id = %cmd.id, kind = %cmd.kind, target = %cmd.target, attempt = cmd.retries + 1, "dispatching");

        let started = Instant::now();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let epoch = *cancel_rx.borrow_and_update();
        let cancellable = cmd.priority != CommandPriority::Critical;
        let ack_timeout = Duration::from_secs(config.ack_timeout_secs.max(1));

        let outcome = tokio::select! {
            result = tokio::time::timeout(ack_timeout, self.call_venue(&cmd)) => Some(match result {
                Ok(result) => result,
                Err(_) => Err(PilotError::AdapterTimeout {
                    operation: cmd.kind.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            }),
            _ = cancel_rx.wait_for(|e| *e != epoch), if cancellable => None,
        };

        match outcome {
            None => {
                warn!(command_id = %cmd.id, kind = %cmd.kind, "in-flight command cancelled by emergency stop");
                let _ = cmd.transition(CommandStatus::Cancelled);
                self.finish_cancelled(cmd).await;
            }
            Some(Ok(ack)) => self.on_ack(cmd, ack, started.elapsed()).await,
            Some(Err(e)) => self.on_failure(cmd, e, &config).await,
        }
    }

    async fn level_for(&self, cmd: &Command) -> Result<Level> {
        let id = cmd
            .level_id()
            .ok_or_else(|| PilotError::Validation(format!("{} needs a level target", cmd.kind)))?;
        self.pool
            .get(id)
            .await
            .ok_or_else(|| PilotError::LevelNotFound(id.to_string()))
    }

    async fn call_venue(&self, cmd: &Command) -> Result<VenueAck> {
        match cmd.kind {
            CommandKind::ActivateLevel => {
                let level = self.level_for(cmd).await?;
                self.venue.activate_level(&level).await
            }
            CommandKind::DeactivateLevel => {
                let level = self.level_for(cmd).await?;
                self.venue.deactivate_level(&level).await
            }
            CommandKind::StopTrade => {
                let level = self.level_for(cmd).await?;
                self.venue.stop_trade(&level).await
            }
            CommandKind::ClosePosition => {
                let level_id = cmd
                    .level_id()
                    .ok_or_else(|| PilotError::Validation("close needs a level target".into()))?;
                let spec = cmd
                    .close
                    .as_ref()
                    .ok_or_else(|| PilotError::Validation("close without order spec".into()))?;
                let request = CloseRequest {
                    level_id: level_id.to_string(),
                    symbol: spec.symbol.clone(),
                    side: spec.side,
                    size: spec.size,
                    price_type: spec.price_type,
                    limit_price: spec.limit_price,
                };
                self.venue.close_position(&request).await
            }
            CommandKind::EmergencyStop => {
                let active = self
                    .pool
                    .list(&LevelFilter::all().status(LevelStatus::Active))
                    .await;
                for level in &active {
                    self.venue.stop_trade(level).await?;
                }
                let mut ack = VenueAck::new("emergency-stop");
                ack.message = Some(format!("{} level(s) stopped", active.len()));
                Ok(ack)
            }
        }
    }

    async fn on_ack(&self, mut cmd: Command, ack: VenueAck, latency: Duration) {
        cmd.venue_id = Some(ack.venue_id);
        cmd.acknowledged_at = Some(Utc::now());
        let _ = cmd.transition(CommandStatus::Acknowledged);

        match cmd.kind {
            CommandKind::ActivateLevel => {
                if let Some(id) = cmd.level_id() {
                    if let Err(e) = self.pool.set_status(id, LevelStatus::Active).await {
                        warn!(level_id = %id, "activation acknowledged but not applied: {}", e);
                    }
                }
            }
            CommandKind::DeactivateLevel | CommandKind::StopTrade => {
                if let Some(id) = cmd.level_id() {
                    self.release_level(id).await;
                }
            }
            CommandKind::ClosePosition => {
                if let (Some(id), Some(order_id)) = (cmd.level_id(), cmd.venue_id.as_deref()) {
                    self.orphans.write().await.close_acknowledged(id, order_id);
                }
            }
            CommandKind::EmergencyStop => {
                for level in self
                    .pool
                    .list(&LevelFilter::all().status(LevelStatus::Active))
                    .await
                {
                    self.release_level(&level.id).await;
                }
            }
        }
        self.risk.set_active_levels(self.pool.active_count().await).await;

        {
            let mut counters = self.counters.write().await;
            counters.acknowledged += 1;
            counters.ack_latency_total_ms += latency.as_secs_f64() * 1_000.0;
        }
        info!(command_id = %cmd.id, kind = %cmd.kind, target = %cmd.target, latency_ms = latency.as_millis() as u64, "command acknowledged");
        let _ = self.event_tx.send(ExecutionEvent::Acknowledged {
            command_id: cmd.id,
            kind: cmd.kind,
            target: cmd.target.clone(),
        });
        self.finish(cmd).await;
    }

    /// Stop tracking a level as active: before a fill it returns to
    /// `available`, after a fill its position becomes an orphan
    async fn release_level(&self, level_id: &str) {
        let Some(level) = self.pool.get(level_id).await else {
            return;
        };
        match level.status {
            LevelStatus::Active => {
                if let Err(e) = self.pool.set_status(level_id, LevelStatus::Available).await {
                    warn!(level_id, "deactivation not applied: {}", e);
                }
            }
            LevelStatus::Filled => {
                let Some(entry) = level.entry.clone() else {
                    warn!(level_id, "filled level without entry fill");
                    return;
                };
                if let Err(e) = self.pool.set_status(level_id, LevelStatus::Orphaned).await {
                    warn!(level_id, "orphaning not applied: {}", e);
                    return;
                }
                self.orphans.write().await.insert(OrphanPosition {
                    level_id: level.id.clone(),
                    symbol: level.symbol.clone(),
                    side: level.side,
                    entry_price: entry.price,
                    size: entry.size,
                    created_at: Utc::now(),
                    close_pending: false,
                    close_issued_at: None,
                    close_order_id: None,
                });
                info!(level_id, entry = %entry.price, size = entry.size, "position orphaned");
                let _ = self.event_tx.send(ExecutionEvent::OrphanCreated {
                    level_id: level_id.to_string(),
                });
            }
            _ => {}
        }
    }

    async fn on_failure(&self, mut cmd: Command, err: PilotError, config: &ExecutionConfig) {
        cmd.last_error = Some(err.to_string());
        self.counters.write().await.failed_attempts += 1;

        if cmd.kind == CommandKind::EmergencyStop {
            // No retry budget: back to the top of the queue.
            let _ = cmd.transition(CommandStatus::Failed);
            warn!(command_id = %cmd.id, "emergency stop failed, re-queueing: {}", err);
            let ready = Instant::now() + config.backoff(1);
            let command_id = cmd.id;
            let mut queue = self.queue.lock().await;
            let requeued = queue.enqueue_at(cmd, Some(ready));
            *self.in_flight.lock().await = None;
            drop(queue);
            if let Err(e) = requeued {
                error!(command_id = %command_id, "🚨 emergency stop could not be re-queued: {}", e);
                let _ = self.event_tx.send(ExecutionEvent::Refused {
                    kind: CommandKind::EmergencyStop,
                    target: CommandTarget::All,
                    reason: e.to_string(),
                });
            }
            return;
        }

        if !err.is_adapter_failure() {
            let _ = cmd.transition(CommandStatus::Abandoned);
            self.abandon(cmd, format!("not retryable: {}", err)).await;
            return;
        }

        cmd.retries += 1;
        if cmd.retries > config.max_retries {
            let _ = cmd.transition(CommandStatus::Abandoned);
            let reason = format!("{} attempts failed, last error: {}", cmd.retries, err);
            self.abandon(cmd, reason).await;
            return;
        }

        let _ = cmd.transition(CommandStatus::Failed);
        let delay = config.backoff(cmd.retries);
        warn!(
            command_id = %cmd.id,
            kind = %cmd.kind,
            attempt = cmd.retries,
            delay_ms = delay.as_millis() as u64,
            "command failed, retrying: {}",
            err
        );
        let _ = self.event_tx.send(ExecutionEvent::Retrying {
            command_id: cmd.id,
            attempt: cmd.retries,
            error: err.to_string(),
        });

        let mut queue = self.queue.lock().await;
        let refused = queue.enqueue_at(cmd.clone(), Some(Instant::now() + delay)).is_err();
        *self.in_flight.lock().await = None;
        drop(queue);
        if refused {
            let mut cmd = cmd;
            let _ = cmd.transition(CommandStatus::Abandoned);
            self.abandon(cmd, "queue full on retry".to_string()).await;
        }
    }

    async fn abandon(&self, cmd: Command, reason: String) {
        self.counters.write().await.abandoned += 1;
        if cmd.kind == CommandKind::ClosePosition {
            if let Some(id) = cmd.level_id() {
                self.orphans.write().await.clear_close(id);
            }
        }
        if cmd.best_effort {
            debug!(command_id = %cmd.id, kind = %cmd.kind, target = %cmd.target, "best-effort command dropped: {}", reason);
        } else {
            error!(command_id = %cmd.id, kind = %cmd.kind, target = %cmd.target, "command abandoned: {}", reason);
        }
        let _ = self.event_tx.send(ExecutionEvent::Abandoned {
            command_id: cmd.id,
            kind: cmd.kind,
            target: cmd.target.clone(),
            reason,
            best_effort: cmd.best_effort,
        });
        self.finish(cmd).await;
    }

    async fn finish_cancelled(&self, cmd: Command) {
        self.counters.write().await.cancelled += 1;
        if cmd.kind == CommandKind::ClosePosition {
            if let Some(id) = cmd.level_id() {
                self.orphans.write().await.clear_close(id);
            }
        }
        let _ = self.event_tx.send(ExecutionEvent::Cancelled {
            command_id: cmd.id,
            kind: cmd.kind,
            target: cmd.target.clone(),
        });
        self.finish(cmd).await;
    }

    /// Record a terminal command and clear the in-flight slot
    async fn finish(&self, cmd: Command) {
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.as_ref().map(|f| f.id == cmd.id).unwrap_or(false) {
                *in_flight = None;
            }
        }
        let cap = self.config.read().await.history_size.max(1);
        let mut history = self.history.write().await;
        history.push_back(cmd);
        while history.len() > cap {
            history.pop_front();
        }
    }

    // ==================== Fill Reconciliation ====================

    /// Apply venue fills to the pool and the Risk Manager. Returns the
    /// number of fills applied.
    pub async fn reconcile_fills(&self, fills: Vec<FillReport>) -> usize {
        let mut applied = 0;
        for fill in fills {
            let Some(level_id) = fill.level_id.clone() else {
                debug!(order_id = %fill.order_id, "fill without level ignored");
                continue;
            };
            match fill.kind {
                FillKind::Entry => {
                    // Filled at the venue before a deactivation landed here.
                    let deactivated = self
                        .pool
                        .get(&level_id)
                        .await
                        .map(|l| l.status == LevelStatus::Available)
                        .unwrap_or(false);
                    if deactivated {
                        let _ = self.pool.set_status(&level_id, LevelStatus::Active).await;
                    }
                    match self
                        .pool
                        .record_entry_fill(&level_id, fill.price, fill.size, fill.at)
                        .await
                    {
                        Ok(level) => {
                            self.risk
                                .record_fill(&level_id, &level.symbol, level.side, fill.price, fill.size, fill.at)
                                .await;
                            applied += 1;
                            if deactivated {
                                self.release_level(&level_id).await;
                            }
                        }
                        Err(e) => warn!(level_id = %level_id, "entry fill not applied: {}", e),
                    }
                }
                FillKind::Exit => match self.pool.record_close(&level_id, fill.price, fill.at).await {
                    Ok((_, gross)) => {
                        let pnl = gross - fill.commission;
                        self.risk.record_close(&level_id, pnl, fill.at).await;
                        if self.orphans.write().await.remove(&level_id).is_some() {
                            info!(level_id = %level_id, %pnl, "orphan closed");
                            let _ = self.event_tx.send(ExecutionEvent::OrphanClosed {
                                level_id: level_id.clone(),
                                pnl,
                            });
                        }
                        applied += 1;
                    }
                    Err(e) => warn!(level_id = %level_id, "exit fill not applied: {}", e),
                },
            }
        }
        self.risk.set_active_levels(self.pool.active_count().await).await;
        applied
    }

    // ==================== Queries ====================

    pub async fn pending(&self) -> Vec<Command> {
        self.queue.lock().await.snapshot()
    }

    pub async fn in_flight(&self) -> Option<Command> {
        self.in_flight.lock().await.clone()
    }

    /// Most recent terminal commands, newest last
    pub async fn history(&self, limit: usize) -> Vec<Command> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn command_status(&self, id: Uuid) -> Option<CommandStatus> {
        if let Some(cmd) = self.queue.lock().await.snapshot().into_iter().find(|c| c.id == id) {
            return Some(cmd.status);
        }
        if let Some(cmd) = self.in_flight.lock().await.as_ref().filter(|c| c.id == id) {
            return Some(cmd.status);
        }
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|c| c.id == id)
            .map(|c| c.status)
    }

    pub async fn orphans(&self) -> Vec<OrphanPosition> {
        self.orphans.read().await.list()
    }

    pub async fn stats(&self) -> ExecutionStats {
        let counters = self.counters.read().await;
        let queue = self.queue.lock().await.stats();
        ExecutionStats {
            submitted: counters.submitted,
            deduplicated: counters.deduplicated,
            acknowledged: counters.acknowledged,
            failed_attempts: counters.failed_attempts,
            abandoned: counters.abandoned,
            cancelled: counters.cancelled,
            avg_ack_latency_ms: if counters.acknowledged > 0 {
                counters.ack_latency_total_ms / counters.acknowledged as f64
            } else {
                0.0
            },
            orphans: self.orphans.read().await.len(),
            queue,
        }
    }
}
