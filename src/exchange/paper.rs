//! Paper-trading venue
//!
//! Simulates the trading bot: activated levels rest as entry limits, filled
//! levels rest as exit limits, market orders slip against the trader and
//! every fill pays commission. A random-walk feed can drive it for demos.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::{
    CloseRequest, ExecutionVenue, FillKind, FillReport, OrderRequest, Position, PriceType,
    VenueAck, VenueKind,
};
use crate::coordination::ShutdownSignal;
use crate::domain::{Candle, Level, Resolution, Side, Tick};
use crate::error::{PilotError, Result};

const PRICE_HISTORY: usize = 20_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub commission_per_share: Decimal,
    pub min_commission: Decimal,
    /// Maximum adverse slippage on market orders, percent
    pub slippage_pct: f64,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
    /// Starting prices for the random-walk feed; symbols are upper-cased
    pub start_prices: BTreeMap<String, Decimal>,
    pub tick_interval_ms: u64,
    /// Largest single-tick move of the random walk, percent
    pub walk_step_pct: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            commission_per_share: dec!(0.005),
            min_commission: dec!(1),
            slippage_pct: 0.01,
            seed: None,
            start_prices: BTreeMap::new(),
            tick_interval_ms: 1_000,
            walk_step_pct: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    id: String,
    symbol: String,
    /// Long buys, short sells
    direction: Side,
    size: u32,
    limit: Decimal,
    level_id: Option<String>,
    position_side: Side,
    kind: FillKind,
}

impl RestingOrder {
    fn crossed(&self, price: Decimal) -> bool {
        match self.direction {
            Side::Long => price <= self.limit,
            Side::Short => price >= self.limit,
        }
    }
}

#[derive(Default)]
struct Book {
    prices: HashMap<String, Decimal>,
    history: HashMap<String, VecDeque<Tick>>,
    resting: Vec<RestingOrder>,
    positions: HashMap<String, Position>,
    /// Exit price per activated level, rested once the entry fills
    exit_targets: HashMap<String, Decimal>,
    pending_fills: Vec<FillReport>,
    pending_ticks: Vec<Tick>,
    total_commission: Decimal,
}

/// Simulated execution venue
pub struct PaperVenue {
    config: PaperConfig,
    book: Mutex<Book>,
    rng: StdMutex<StdRng>,
    next_id: AtomicU64,
    offline: AtomicBool,
}

impl PaperVenue {
    pub fn new(config: PaperConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut book = Book::default();
        // Config keys may arrive lower-cased from the loader
        for (symbol, price) in &config.start_prices {
            book.prices.insert(symbol.to_ascii_uppercase(), *price);
        }
        Self {
            config,
            book: Mutex::new(book),
            rng: StdMutex::new(rng),
            next_id: AtomicU64::new(1),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate a connectivity loss; calls fail while offline
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.book.lock().await.prices.get(symbol).copied()
    }

    pub async fn resting_orders(&self) -> usize {
        self.book.lock().await.resting.len()
    }

    pub async fn total_commission(&self) -> Decimal {
        self.book.lock().await.total_commission
    }

    pub fn commission(&self, size: u32) -> Decimal {
        (self.config.commission_per_share * Decimal::from(size)).max(self.config.min_commission)
    }

    fn order_id(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PilotError::AdapterFailure("paper venue offline".into()));
        }
        Ok(())
    }

    /// Adverse slippage, uniform in `[0, slippage_pct]`
    fn slipped(&self, price: Decimal, direction: Side) -> Decimal {
        let factor = {
            let mut rng = match self.rng.lock() {
                Ok(rng) => rng,
                Err(poisoned) => poisoned.into_inner(),
            };
            rng.gen_range(0.0..=self.config.slippage_pct.max(0.0)) / 100.0
        };
        let factor = Decimal::from_f64(factor).unwrap_or(Decimal::ZERO);
        let adjusted = match direction {
            Side::Long => price * (Decimal::ONE + factor),
            Side::Short => price * (Decimal::ONE - factor),
        };
        adjusted.round_dp(4)
    }

    /// Feed a price update: records it and fills every crossed resting order.
    /// Returns the number of fills.
    pub async fn push_tick(&self, tick: Tick) -> usize {
        let mut book = self.book.lock().await;
        book.prices.insert(tick.symbol.clone(), tick.price);
        let history = book.history.entry(tick.symbol.clone()).or_default();
        history.push_back(tick.clone());
        while history.len() > PRICE_HISTORY {
            history.pop_front();
        }
        book.pending_ticks.push(tick.clone());

        let (crossed, resting): (Vec<_>, Vec<_>) = std::mem::take(&mut book.resting)
            .into_iter()
            .partition(|o| o.symbol == tick.symbol && o.crossed(tick.price));
        book.resting = resting;

        let fills = crossed.len();
        for order in crossed {
            let fill = self.execute(&mut book, &order, order.limit, tick.at);
            // A filled entry rests its exit target.
            if order.kind == FillKind::Entry {
                if let Some(exit) = order.level_id.as_ref().and_then(|id| book.exit_targets_remove(id)) {
                    book.resting.push(RestingOrder {
                        id: self.order_id(),
                        symbol: order.symbol.clone(),
                        direction: order.position_side.opposite(),
                        size: fill.size,
                        limit: exit,
                        level_id: order.level_id.clone(),
                        position_side: order.position_side,
                        kind: FillKind::Exit,
                    });
                }
            }
        }
        fills
    }

    fn execute(&self, book: &mut Book, order: &RestingOrder, price: Decimal, at: DateTime<Utc>) -> FillReport {
        let commission = self.commission(order.size);
        book.total_commission += commission;
        book.positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position {
                symbol: order.symbol.clone(),
                ..Default::default()
            })
            .apply(order.direction, price, order.size);

        let fill = FillReport {
            order_id: order.id.clone(),
            level_id: order.level_id.clone(),
            symbol: order.symbol.clone(),
            side: order.position_side,
            kind: order.kind,
            price,
            size: order.size,
            commission,
            at,
        };
        debug!(order_id = %fill.order_id, symbol = %fill.symbol, price = %price, size = fill.size, kind = ?fill.kind, "paper fill");
        book.pending_fills.push(fill.clone());
        fill
    }

    fn fill_now(&self, book: &mut Book, order: RestingOrder, price_type: PriceType) -> Result<VenueAck> {
        let id = order.id.clone();
        match price_type {
            PriceType::Market => {
                let price = book.prices.get(&order.symbol).copied().ok_or_else(|| {
                    PilotError::AdapterFailure(format!("no price for {}", order.symbol))
                })?;
                let price = self.slipped(price, order.direction);
                self.execute(book, &order, price, Utc::now());
            }
            PriceType::Limit => {
                let marketable = book
                    .prices
                    .get(&order.symbol)
                    .map(|p| order.crossed(*p))
                    .unwrap_or(false);
                if marketable {
                    self.execute(book, &order, order.limit, Utc::now());
                } else {
                    book.resting.push(order);
                }
            }
        }
        Ok(VenueAck::new(id))
    }

    /// Drive the venue with a random walk until shutdown
    pub fn spawn_simulator(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> JoinHandle<()> {
        let venue = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(venue.config.tick_interval_ms.max(10)));
            info!(symbols = venue.config.start_prices.len(), "paper feed started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for tick in venue.next_walk().await {
                            venue.push_tick(tick).await;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            info!("paper feed stopped");
        })
    }

    async fn next_walk(&self) -> Vec<Tick> {
        let prices: Vec<(String, Decimal)> = {
            let book = self.book.lock().await;
            book.prices.iter().map(|(s, p)| (s.clone(), *p)).collect()
        };
        let now = Utc::now();
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        let step = self.config.walk_step_pct.abs() / 100.0;
        prices
            .into_iter()
            .map(|(symbol, price)| {
                let drift = if step > 0.0 { rng.gen_range(-step..=step) } else { 0.0 };
                let next = price.to_f64().unwrap_or(0.0) * (1.0 + drift);
                let price = Decimal::from_f64(next)
                    .unwrap_or(price)
                    .round_dp(2)
                    .max(dec!(0.01));
                Tick {
                    symbol,
                    price,
                    volume: rng.gen_range(100..1_000),
                    at: now,
                }
            })
            .collect()
    }
}

impl Book {
    fn cancel_level(&mut self, level_id: &str, kind: Option<FillKind>) -> usize {
        let before = self.resting.len();
        self.resting.retain(|o| {
            !(o.level_id.as_deref() == Some(level_id) && kind.map(|k| o.kind == k).unwrap_or(true))
        });
        before - self.resting.len()
    }

    fn exit_targets_remove(&mut self, level_id: &str) -> Option<Decimal> {
        self.exit_targets.remove(level_id)
    }
}

impl Position {
    /// Apply a fill; `direction` long buys, short sells
    fn apply(&mut self, direction: Side, price: Decimal, size: u32) {
        let delta = match direction {
            Side::Long => size as i64,
            Side::Short => -(size as i64),
        };
        let held = self.quantity;
        if held == 0 || held.signum() == delta.signum() {
            let total = held.abs() + delta.abs();
            self.avg_price = (self.avg_price * Decimal::from(held.abs())
                + price * Decimal::from(delta.abs()))
                / Decimal::from(total);
            self.quantity += delta;
            return;
        }

        let closing = held.abs().min(delta.abs());
        self.realized_pnl +=
            (price - self.avg_price) * Decimal::from(closing) * Decimal::from(held.signum());
        self.quantity += delta;
        if self.quantity == 0 {
            self.avg_price = Decimal::ZERO;
        } else if self.quantity.signum() != held.signum() {
            self.avg_price = price;
        }
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    fn kind(&self) -> VenueKind {
        VenueKind::Paper
    }

    async fn activate_level(&self, level: &Level) -> Result<VenueAck> {
        self.ensure_online()?;
        let mut book = self.book.lock().await;
        if let Some(existing) = book
            .resting
            .iter()
            .find(|o| o.level_id.as_deref() == Some(level.id.as_str()) && o.kind == FillKind::Entry)
        {
            return Ok(VenueAck::new(existing.id.clone()));
        }
        book.exit_targets.insert(level.id.clone(), level.exit_price);
        let order = RestingOrder {
            id: self.order_id(),
            symbol: level.symbol.clone(),
            direction: level.side,
            size: level.shares,
            limit: level.price,
            level_id: Some(level.id.clone()),
            position_side: level.side,
            kind: FillKind::Entry,
        };
        debug!(level_id = %level.id, price = %level.price, "paper: entry resting");
        let id = order.id.clone();
        book.resting.push(order);
        Ok(VenueAck::new(id))
    }

    async fn deactivate_level(&self, level: &Level) -> Result<VenueAck> {
        self.ensure_online()?;
        let mut book = self.book.lock().await;
        let cancelled = book.cancel_level(&level.id, None);
        book.exit_targets_remove(&level.id);
        let mut ack = VenueAck::new(format!("deactivate-{}", level.id));
        ack.message = Some(format!("{cancelled} order(s) cancelled"));
        Ok(ack)
    }

    async fn stop_trade(&self, level: &Level) -> Result<VenueAck> {
        self.ensure_online()?;
        let mut book = self.book.lock().await;
        let cancelled = book.cancel_level(&level.id, None);
        book.exit_targets_remove(&level.id);
        let mut ack = VenueAck::new(format!("stop-{}", level.id));
        ack.message = Some(format!("{cancelled} order(s) cancelled"));
        Ok(ack)
    }

    async fn close_position(&self, request: &CloseRequest) -> Result<VenueAck> {
        self.ensure_online()?;
        let mut book = self.book.lock().await;
        // Replace any exit already resting for this level.
        book.cancel_level(&request.level_id, Some(FillKind::Exit));
        let order = RestingOrder {
            id: self.order_id(),
            symbol: request.symbol.clone(),
            direction: request.side.opposite(),
            size: request.size,
            limit: request.limit_price.unwrap_or(Decimal::ZERO),
            level_id: Some(request.level_id.clone()),
            position_side: request.side,
            kind: FillKind::Exit,
        };
        if request.price_type == PriceType::Limit && request.limit_price.is_none() {
            return Err(PilotError::Validation("limit close without price".into()));
        }
        self.fill_now(&mut book, order, request.price_type)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<VenueAck> {
        self.ensure_online()?;
        if order.price_type == PriceType::Limit && order.limit_price.is_none() {
            return Err(PilotError::Validation("limit order without price".into()));
        }
        let mut book = self.book.lock().await;
        let resting = RestingOrder {
            id: self.order_id(),
            symbol: order.symbol.clone(),
            direction: order.side,
            size: order.size,
            limit: order.limit_price.unwrap_or(Decimal::ZERO),
            level_id: order.level_id.clone(),
            position_side: order.side,
            kind: FillKind::Entry,
        };
        self.fill_now(&mut book, resting, order.price_type)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.ensure_online()?;
        let mut book = self.book.lock().await;
        let before = book.resting.len();
        book.resting.retain(|o| o.id != order_id);
        if before == book.resting.len() {
            warn!(order_id, "paper: cancel for unknown order");
        }
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<Position> {
        self.ensure_online()?;
        let book = self.book.lock().await;
        Ok(book.positions.get(symbol).cloned().unwrap_or_else(|| Position {
            symbol: symbol.to_string(),
            ..Default::default()
        }))
    }

    async fn get_candles(
        &self,
        symbol: &str,
        window: usize,
        resolution: Resolution,
    ) -> Result<Vec<Candle>> {
        self.ensure_online()?;
        let book = self.book.lock().await;
        let Some(history) = book.history.get(symbol) else {
            return Ok(Vec::new());
        };
        let secs = resolution.as_secs();
        let mut candles: Vec<Candle> = Vec::new();
        for tick in history {
            let bucket = tick.at.timestamp().div_euclid(secs) * secs;
            let start = Utc.timestamp_opt(bucket, 0).single().unwrap_or(tick.at);
            match candles.last_mut() {
                Some(c) if c.start == start => {
                    c.high = c.high.max(tick.price);
                    c.low = c.low.min(tick.price);
                    c.close = tick.price;
                    c.volume += tick.volume;
                }
                _ => candles.push(Candle {
                    symbol: symbol.to_string(),
                    open: tick.price,
                    high: tick.price,
                    low: tick.price,
                    close: tick.price,
                    volume: tick.volume,
                    start,
                }),
            }
        }
        let skip = candles.len().saturating_sub(window);
        Ok(candles.split_off(skip))
    }

    async fn poll_ticks(&self) -> Result<Vec<Tick>> {
        self.ensure_online()?;
        Ok(std::mem::take(&mut self.book.lock().await.pending_ticks))
    }

    async fn poll_fills(&self) -> Result<Vec<FillReport>> {
        self.ensure_online()?;
        Ok(std::mem::take(&mut self.book.lock().await.pending_fills))
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> PaperVenue {
        PaperVenue::new(PaperConfig {
            seed: Some(7),
            ..Default::default()
        })
    }

    fn tick(price: Decimal) -> Tick {
        Tick {
            symbol: "TQQQ".into(),
            price,
            volume: 500,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_commission_minimum() {
        let venue = venue();
        assert_eq!(venue.commission(100), dec!(1));
        assert_eq!(venue.commission(1000), dec!(5.000));
    }

    #[tokio::test]
    async fn test_level_entry_then_exit() {
        let venue = venue();
        venue.push_tick(tick(dec!(5.20))).await;
        let level = Level::new("L1", "TQQQ", Side::Long, dec!(5.15), dec!(5.25), 100);
        venue.activate_level(&level).await.unwrap();
        // Idempotent re-activation.
        venue.activate_level(&level).await.unwrap();
        assert_eq!(venue.resting_orders().await, 1);

        assert_eq!(venue.push_tick(tick(dec!(5.14))).await, 1);
        assert_eq!(venue.resting_orders().await, 1);
        assert_eq!(venue.push_tick(tick(dec!(5.26))).await, 1);

        let fills = venue.poll_fills().await.unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].kind, FillKind::Entry);
        assert_eq!(fills[0].price, dec!(5.15));
        assert_eq!(fills[1].kind, FillKind::Exit);
        assert_eq!(fills[1].price, dec!(5.25));

        let position = venue.get_position("TQQQ").await.unwrap();
        assert_eq!(position.quantity, 0);
        assert_eq!(position.realized_pnl, dec!(10.00));
    }

    #[tokio::test]
    async fn test_market_order_slips_against_buyer() {
        let venue = PaperVenue::new(PaperConfig {
            seed: Some(1),
            slippage_pct: 1.0,
            ..Default::default()
        });
        venue.push_tick(tick(dec!(10))).await;
        venue
            .place_order(&OrderRequest::market("TQQQ", Side::Long, 10))
            .await
            .unwrap();
        let fill = venue.poll_fills().await.unwrap().remove(0);
        assert!(fill.price >= dec!(10) && fill.price <= dec!(10.1));
    }

    #[tokio::test]
    async fn test_offline_fails_calls() {
        let venue = venue();
        venue.set_offline(true);
        assert!(venue.ping().await.is_err());
        venue.set_offline(false);
        assert!(venue.ping().await.is_ok());
    }
}
