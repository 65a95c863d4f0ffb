use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall risk level, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Normal,
    Elevated,
    Warning,
    Critical,
    Emergency,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Normal => "normal",
            RiskLevel::Elevated => "elevated",
            RiskLevel::Warning => "warning",
            RiskLevel::Critical => "critical",
            RiskLevel::Emergency => "emergency",
        }
    }

    /// New activations are allowed below Critical
    pub fn allows_new_trades(&self) -> bool {
        *self < RiskLevel::Critical
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    DailyLoss,
    TotalExposure,
    SymbolExposure,
    OpenPositions,
    ActiveLevels,
    Drawdown,
}

impl LimitKind {
    pub const ALL: [LimitKind; 6] = [
        LimitKind::DailyLoss,
        LimitKind::TotalExposure,
        LimitKind::SymbolExposure,
        LimitKind::OpenPositions,
        LimitKind::ActiveLevels,
        LimitKind::Drawdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::DailyLoss => "daily_loss",
            LimitKind::TotalExposure => "total_exposure",
            LimitKind::SymbolExposure => "symbol_exposure",
            LimitKind::OpenPositions => "open_positions",
            LimitKind::ActiveLevels => "active_levels",
            LimitKind::Drawdown => "drawdown",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a metric sits relative to its thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitBand {
    Ok,
    Soft,
    Hard,
}

/// One evaluated limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub kind: LimitKind,
    pub current: f64,
    pub soft: f64,
    pub hard: f64,
    pub band: LimitBand,
}

impl LimitCheck {
    pub fn describe(&self) -> String {
        format!(
            "{} {:.2} (soft {:.2}, hard {:.2})",
            self.kind, self.current, self.soft, self.hard
        )
    }
}

/// Hard thresholds; soft thresholds are `soft_ratio × hard`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_daily_loss: Decimal,
    pub emergency_loss_threshold: Decimal,
    pub max_total_exposure: Decimal,
    pub max_symbol_exposure: Decimal,
    pub max_open_positions: usize,
    pub max_active_levels: usize,
    pub max_drawdown: Decimal,
    pub soft_ratio: f64,
    pub black_swan: BlackSwanConfig,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: dec!(500),
            emergency_loss_threshold: dec!(1000),
            max_total_exposure: dec!(50000),
            max_symbol_exposure: dec!(10000),
            max_open_positions: 50,
            max_active_levels: 20,
            max_drawdown: dec!(250),
            soft_ratio: 0.8,
            black_swan: BlackSwanConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackSwanConfig {
    pub window_secs: u64,
    pub min_samples: usize,
    /// Price samples retained per symbol
    pub history: usize,
    /// Move (percent) that always counts as a black swan
    pub sudden_move_pct: f64,
    /// Move in ATR-percent multiples that counts as a black swan
    pub atr_multiple: f64,
}

impl Default for BlackSwanConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            min_samples: 10,
            history: 60,
            sudden_move_pct: 5.0,
            atr_multiple: 4.0,
        }
    }
}

impl RiskLimits {
    pub fn hard(&self, kind: LimitKind) -> f64 {
        match kind {
            LimitKind::DailyLoss => self.max_daily_loss.to_f64().unwrap_or(0.0),
            LimitKind::TotalExposure => self.max_total_exposure.to_f64().unwrap_or(0.0),
            LimitKind::SymbolExposure => self.max_symbol_exposure.to_f64().unwrap_or(0.0),
            LimitKind::OpenPositions => self.max_open_positions as f64,
            LimitKind::ActiveLevels => self.max_active_levels as f64,
            LimitKind::Drawdown => self.max_drawdown.to_f64().unwrap_or(0.0),
        }
    }

    pub fn check(&self, kind: LimitKind, current: f64) -> LimitCheck {
        let hard = self.hard(kind);
        let soft = hard * self.soft_ratio;
        let band = if current >= hard {
            LimitBand::Hard
        } else if current >= soft {
            LimitBand::Soft
        } else {
            LimitBand::Ok
        };
        LimitCheck {
            kind,
            current,
            soft,
            hard,
            band,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(self.soft_ratio > 0.0 && self.soft_ratio <= 1.0) {
            problems.push(format!("risk.soft_ratio {} must be in (0, 1]", self.soft_ratio));
        }
        for kind in LimitKind::ALL {
            if self.hard(kind) <= 0.0 {
                problems.push(format!("risk limit {} must be positive", kind));
            }
        }
        if self.emergency_loss_threshold < self.max_daily_loss {
            problems.push("risk.emergency_loss_threshold must be >= max_daily_loss".to_string());
        }
        if self.black_swan.min_samples < 2 || self.black_swan.history < self.black_swan.min_samples {
            problems.push("risk.black_swan history must hold at least min_samples >= 2".to_string());
        }
        problems
    }
}
