//! Market Snapshot Builder
//!
//! Aggregates ticks and candles pushed by the venue feed into per-symbol
//! rolling windows and produces one immutable `MarketSnapshot` per cycle.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use super::phase::TradingSchedule;
use super::volatility::{atr, atr_pct, RegimeBands};
use super::volume::{volume_ratio, VolumeBands};
use crate::domain::{
    Candle, Fingerprint, MarketSnapshot, Tick, TradingPhase, VolatilityMeasures, VolatilityRegime,
    VolumeCondition,
};
use crate::error::{PilotError, Result};

/// Indicator windows and classification bands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub atr_short: usize,
    pub atr_medium: usize,
    pub atr_long: usize,
    pub volume_ma_period: usize,
    /// Candles back for the short-term change
    pub momentum_short: usize,
    /// Candles back for the medium-term change
    pub momentum_medium: usize,
    /// Candles retained per symbol
    pub max_candles: usize,
    pub regime: RegimeBands,
    pub volume: VolumeBands,
    pub schedule: TradingSchedule,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            atr_short: 5,
            atr_medium: 14,
            atr_long: 50,
            volume_ma_period: 20,
            momentum_short: 5,
            momentum_medium: 15,
            max_candles: 200,
            regime: RegimeBands::default(),
            volume: VolumeBands::default(),
            schedule: TradingSchedule::default(),
        }
    }
}

#[derive(Debug, Default)]
struct SymbolSeries {
    candles: VecDeque<Candle>,
    last_price: Option<(Decimal, DateTime<Utc>)>,
}

/// Per-symbol rolling indicator state
pub struct SnapshotBuilder {
    config: AnalysisConfig,
    series: HashMap<String, SymbolSeries>,
}

impl SnapshotBuilder {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            series: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Swap in reloaded configuration; windows are kept
    pub fn update_config(&mut self, config: AnalysisConfig) {
        self.config = config;
    }

    pub fn on_tick(&mut self, tick: &Tick) {
        let series = self.series.entry(tick.symbol.clone()).or_default();
        match series.last_price {
            Some((_, at)) if at > tick.at => {}
            _ => series.last_price = Some((tick.price, tick.at)),
        }
    }

    /// Append a candle; a candle with the same start replaces the last one
    pub fn on_candle(&mut self, candle: Candle) {
        let max = self.config.max_candles.max(1);
        let series = self.series.entry(candle.symbol.clone()).or_default();
        match series.candles.back() {
            Some(last) if last.start == candle.start => {
                series.candles.pop_back();
            }
            Some(last) if last.start > candle.start => return,
            _ => {}
        }
        series.candles.push_back(candle);
        while series.candles.len() > max {
            series.candles.pop_front();
        }
    }

    /// Seed history from the venue's candle retrieval
    pub fn seed(&mut self, candles: Vec<Candle>) {
        for candle in candles {
            self.on_candle(candle);
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        let series = self.series.get(symbol)?;
        series
            .last_price
            .map(|(p, _)| p)
            .or_else(|| series.candles.back().map(|c| c.close))
    }

    pub fn candle_count(&self, symbol: &str) -> usize {
        self.series.get(symbol).map(|s| s.candles.len()).unwrap_or(0)
    }

    /// Build the snapshot for `symbol` at `now`.
    ///
    /// Fails with `DataInsufficient` only when no price is known at all;
    /// short windows produce a snapshot with neutral readings and
    /// `data_sufficient = false`.
    pub fn build(&self, symbol: &str, now: DateTime<Utc>) -> Result<MarketSnapshot> {
        let price = self
            .last_price(symbol)
            .ok_or_else(|| PilotError::DataInsufficient(format!("no price for {symbol}")))?;
        let empty = VecDeque::new();
        let candles: Vec<Candle> = self
            .series
            .get(symbol)
            .map(|s| &s.candles)
            .unwrap_or(&empty)
            .iter()
            .cloned()
            .collect();

        let cfg = &self.config;
        let atr_short = atr(&candles, cfg.atr_short);
        let atr_medium = atr(&candles, cfg.atr_medium);
        let atr_long = atr(&candles, cfg.atr_long);
        let vol_ratio = volume_ratio(&candles, cfg.volume_ma_period);

        let data_sufficient = atr_medium.is_some() && vol_ratio.is_some();

        // Fall back to whatever history exists, then to zero.
        let atr_fallback = atr(&candles, candles.len().min(cfg.atr_medium)).unwrap_or(Decimal::ZERO);
        let atr_value = atr_medium.unwrap_or(atr_fallback);
        let medium_pct = atr_pct(atr_value, price);
        let short_pct = atr_short.map(|a| atr_pct(a, price)).unwrap_or(medium_pct);
        let long_pct = atr_long.map(|a| atr_pct(a, price)).unwrap_or(medium_pct);

        let regime = if atr_medium.is_some() {
            cfg.regime.classify(medium_pct)
        } else {
            VolatilityRegime::Medium
        };

        let volume_ratio = vol_ratio.unwrap_or(1.0);
        let volume_condition = match vol_ratio {
            Some(r) => cfg.volume.classify(r),
            None => VolumeCondition::Normal,
        };

        let phase = cfg.schedule.phase_at(now);
        let change_short_pct = change_pct(&candles, cfg.momentum_short, price);
        let change_medium_pct = change_pct(&candles, cfg.momentum_medium, price);

        let volatility = VolatilityMeasures {
            short_pct,
            medium_pct,
            long_pct,
        };
        let fingerprint = fingerprint(
            &volatility,
            volume_ratio,
            phase,
            change_short_pct,
            change_medium_pct,
        );

        debug!(
            symbol = %symbol,
            %price,
            atr_pct = medium_pct,
            %regime,
            volume = %volume_condition,
            %phase,
            data_sufficient,
            "snapshot built"
        );

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            at: now,
            price,
            volatility,
            atr: atr_value,
            regime,
            volume_ratio,
            volume_condition,
            phase,
            change_short_pct,
            change_medium_pct,
            fingerprint,
            samples: candles.len(),
            data_sufficient,
        })
    }
}

/// Percent change from the close `lookback` candles ago to `price`
fn change_pct(candles: &[Candle], lookback: usize, price: Decimal) -> f64 {
    if lookback == 0 || candles.len() < lookback {
        return 0.0;
    }
    let base = candles[candles.len() - lookback].close;
    if base.is_zero() {
        return 0.0;
    }
    ((price - base) / base * Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(0.0)
}

/// Scale readings into the `[0, 1]` feature vector
pub fn fingerprint(
    volatility: &VolatilityMeasures,
    volume_ratio: f64,
    phase: TradingPhase,
    change_short_pct: f64,
    change_medium_pct: f64,
) -> Fingerprint {
    let atr_ratio = if volatility.long_pct > 0.0 {
        volatility.short_pct / volatility.long_pct
    } else {
        1.0
    };
    let last_phase = (TradingPhase::ALL.len() - 1) as f64;
    Fingerprint([
        (volatility.short_pct / 3.0).clamp(0.0, 1.0),
        (atr_ratio / 2.0).clamp(0.0, 1.0),
        (volume_ratio / 3.0).clamp(0.0, 1.0),
        phase.ordinal() as f64 / last_phase,
        ((change_short_pct / 2.0 + 1.0) / 2.0).clamp(0.0, 1.0),
        ((change_medium_pct / 4.0 + 1.0) / 2.0).clamp(0.0, 1.0),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn candle(i: i64, close: Decimal, spread: Decimal, volume: u64) -> Candle {
        Candle {
            symbol: "SPY".into(),
            open: close,
            high: close + spread,
            low: close - spread,
            close,
            volume,
            start: Utc::now() - Duration::minutes(100 - i),
        }
    }

    #[test]
    fn test_no_price_is_data_insufficient() {
        let builder = SnapshotBuilder::new(AnalysisConfig::default());
        let err = builder.build("SPY", Utc::now()).unwrap_err();
        assert!(matches!(err, PilotError::DataInsufficient(_)));
    }

    #[test]
    fn test_short_history_degrades_to_neutral() {
        let mut builder = SnapshotBuilder::new(AnalysisConfig::default());
        builder.on_candle(candle(0, dec!(10), dec!(0.1), 1_000));

        let snap = builder.build("SPY", Utc::now()).unwrap();
        assert!(!snap.data_sufficient);
        assert_eq!(snap.regime, VolatilityRegime::Medium);
        assert_eq!(snap.volume_condition, VolumeCondition::Normal);
    }

    #[test]
    fn test_full_history_classifies() {
        let mut builder = SnapshotBuilder::new(AnalysisConfig::default());
        for i in 0..60 {
            let volume = if i == 59 { 5_000 } else { 1_000 };
            builder.on_candle(candle(i, dec!(10), dec!(0.1), volume));
        }
        builder.on_tick(&Tick {
            symbol: "SPY".into(),
            price: dec!(10),
            volume: 10,
            at: Utc::now(),
        });

        let snap = builder.build("SPY", Utc::now()).unwrap();
        assert!(snap.data_sufficient);
        // TR 0.2 on price 10 = 2%
        assert_eq!(snap.regime, VolatilityRegime::High);
        assert_eq!(snap.volume_condition, VolumeCondition::Extreme);
        assert!(snap.fingerprint.features().iter().all(|f| (0.0..=1.0).contains(f)));
    }

    #[test]
    fn test_same_start_replaces_candle() {
        let mut builder = SnapshotBuilder::new(AnalysisConfig::default());
        let first = candle(1, dec!(10), dec!(0.1), 100);
        let mut update = first.clone();
        update.close = dec!(10.5);
        builder.on_candle(first);
        builder.on_candle(update);
        assert_eq!(builder.candle_count("SPY"), 1);
        assert_eq!(builder.last_price("SPY"), Some(dec!(10.5)));
    }
}
