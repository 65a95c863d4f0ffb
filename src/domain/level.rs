use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction a level trades in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Level lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelStatus {
    /// Known to the pool, not trading
    Available,
    /// Entry order resting at the venue
    Active,
    /// Entry filled, position open
    Filled,
    /// Position closed, trade cycle complete
    Closed,
    /// Deactivated after fill; exposure tracked as an orphan position
    Orphaned,
}

impl LevelStatus {
    pub const ALL: [LevelStatus; 5] = [
        LevelStatus::Available,
        LevelStatus::Active,
        LevelStatus::Filled,
        LevelStatus::Closed,
        LevelStatus::Orphaned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LevelStatus::Available => "available",
            LevelStatus::Active => "active",
            LevelStatus::Filled => "filled",
            LevelStatus::Closed => "closed",
            LevelStatus::Orphaned => "orphaned",
        }
    }

    /// Check if this status can transition to another status within one trade cycle
    pub fn can_transition_to(&self, target: LevelStatus) -> bool {
        use LevelStatus::*;

        match (self, target) {
            // From Available
            (Available, Active) => true,

            // From Active
            (Active, Filled) => true,    // Entry filled
            (Active, Available) => true, // Deactivated before fill

            // From Filled
            (Filled, Closed) => true,   // Exit filled
            (Filled, Orphaned) => true, // Deactivated after fill

            // From Orphaned
            (Orphaned, Closed) => true, // Orphan close filled

            // All other transitions are invalid
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<LevelStatus> {
        LevelStatus::ALL
            .into_iter()
            .filter(|s| self.can_transition_to(*s))
            .collect()
    }

    /// Levels in these states carry open exposure
    pub fn has_position(&self) -> bool {
        matches!(self, LevelStatus::Filled | LevelStatus::Orphaned)
    }

    /// Levels the scorer and optimizer consider
    pub fn is_selectable(&self) -> bool {
        matches!(self, LevelStatus::Available | LevelStatus::Active)
    }
}

impl fmt::Display for LevelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry fill recorded against a level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelFill {
    pub price: Decimal,
    pub size: u32,
    pub filled_at: DateTime<Utc>,
}

/// Accumulated per-level statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelMetrics {
    pub activations: u32,
    pub successes: u32,
    pub failures: u32,
    pub realized_pnl: Decimal,
    pub last_score: Option<f64>,
    /// Completed trade cycles
    pub cycles: u32,
}

/// A configured price point the controller may trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    /// Entry price
    pub price: Decimal,
    /// Target exit price
    pub exit_price: Decimal,
    /// Protective stop, if the scenario defines one
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    pub shares: u32,
    pub scenario: String,
    pub level_num: u32,
    /// Entry offset from the scenario base price, in percent
    pub step_pct: Decimal,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: LevelStatus,
    #[serde(default)]
    pub entry: Option<LevelFill>,
    #[serde(default)]
    pub metrics: LevelMetrics,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Level {
    pub fn new(
        id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        price: Decimal,
        exit_price: Decimal,
        shares: u32,
    ) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            side,
            price,
            exit_price,
            stop_price: None,
            shares,
            scenario: String::new(),
            level_num: 0,
            step_pct: Decimal::ZERO,
            tags: Vec::new(),
            status: LevelStatus::Available,
            entry: None,
            metrics: LevelMetrics::default(),
            updated_at: Utc::now(),
            activated_at: None,
            cooldown_until: None,
        }
    }

    pub fn with_stop(mut self, stop: Decimal) -> Self {
        self.stop_price = Some(stop);
        self
    }

    pub fn with_scenario(mut self, scenario: impl Into<String>, level_num: u32) -> Self {
        self.scenario = scenario.into();
        self.level_num = level_num;
        self
    }

    /// Gross gain per share from entry to exit
    pub fn gain_per_share(&self) -> Decimal {
        (self.exit_price - self.price) * self.side.sign()
    }

    /// Expected gain as a percent of entry
    pub fn profit_pct(&self) -> Decimal {
        if self.price.is_zero() {
            return Decimal::ZERO;
        }
        self.gain_per_share() / self.price * Decimal::ONE_HUNDRED
    }

    /// Notional committed when the entry fills
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.shares)
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_valid_transitions() {
        assert!(LevelStatus::Available.can_transition_to(LevelStatus::Active));
        assert!(LevelStatus::Active.can_transition_to(LevelStatus::Available));
        assert!(LevelStatus::Active.can_transition_to(LevelStatus::Filled));
        assert!(LevelStatus::Filled.can_transition_to(LevelStatus::Orphaned));
        assert!(LevelStatus::Orphaned.can_transition_to(LevelStatus::Closed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!LevelStatus::Available.can_transition_to(LevelStatus::Filled));
        assert!(!LevelStatus::Closed.can_transition_to(LevelStatus::Available));
        assert!(!LevelStatus::Filled.can_transition_to(LevelStatus::Active));
        assert!(!LevelStatus::Orphaned.can_transition_to(LevelStatus::Filled));
        assert!(LevelStatus::Closed.valid_transitions().is_empty());
    }

    #[test]
    fn test_profit_pct_by_side() {
        let long = Level::new("a", "SPY", Side::Long, dec!(100), dec!(101), 100);
        assert_eq!(long.profit_pct(), dec!(1));

        let short = Level::new("b", "SPY", Side::Short, dec!(100), dec!(98), 100);
        assert_eq!(short.gain_per_share(), dec!(2));
        assert_eq!(short.notional(), dec!(10000));
    }
}
