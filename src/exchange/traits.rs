use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{Candle, Level, Resolution, Side, Tick};
use crate::error::{PilotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VenueKind {
    /// Simulated fills, slippage and commission
    #[default]
    Paper,
    /// HTTP bridge to the production trading bot
    Bridge,
}

impl VenueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Bridge => "bridge",
        }
    }
}

impl std::fmt::Display for VenueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VenueKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paper" | "sim" => Ok(Self::Paper),
            "bridge" | "production" | "live" => Ok(Self::Bridge),
            _ => Err("invalid venue; expected paper|bridge"),
        }
    }
}

pub fn parse_venue_kind(raw: &str) -> Result<VenueKind> {
    VenueKind::from_str(raw).map_err(|e| PilotError::Validation(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    Market,
    Limit,
}

/// Generic order; `side` is the direction (long buys, short sells)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: u32,
    pub price_type: PriceType,
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub level_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, size: u32) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            size,
            price_type: PriceType::Market,
            limit_price: None,
            level_id: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: Side, size: u32, price: Decimal) -> Self {
        Self {
            price_type: PriceType::Limit,
            limit_price: Some(price),
            ..Self::market(symbol, side, size)
        }
    }
}

/// Close the position held by a level; `side` is the position's side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub level_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: u32,
    pub price_type: PriceType,
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueAck {
    pub venue_id: String,
    pub accepted_at: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

impl VenueAck {
    pub fn new(venue_id: impl Into<String>) -> Self {
        Self {
            venue_id: venue_id.into(),
            accepted_at: Utc::now(),
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillKind {
    /// Opens the level's position
    Entry,
    /// Closes it (target exit or explicit close)
    Exit,
}

/// Execution reported by the venue's fill feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillReport {
    pub order_id: String,
    #[serde(default)]
    pub level_id: Option<String>,
    pub symbol: String,
    /// Position side the fill belongs to
    pub side: Side,
    pub kind: FillKind,
    pub price: Decimal,
    pub size: u32,
    pub commission: Decimal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed share count; negative is short
    pub quantity: i64,
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
}

/// The trading bot, as seen by the controller.
///
/// Every call may fail; the execution manager applies the ack timeout and
/// retry policy, so implementations should not retry internally.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    fn kind(&self) -> VenueKind;

    /// Start trading a level: rest its entry order
    async fn activate_level(&self, level: &Level) -> Result<VenueAck>;

    /// Stop trading a level; a filled position stays open
    async fn deactivate_level(&self, level: &Level) -> Result<VenueAck>;

    /// Halt the level's trade cycle immediately, cancelling its resting orders
    async fn stop_trade(&self, level: &Level) -> Result<VenueAck>;

    async fn close_position(&self, request: &CloseRequest) -> Result<VenueAck>;

    async fn place_order(&self, order: &OrderRequest) -> Result<VenueAck>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn get_position(&self, symbol: &str) -> Result<Position>;

    async fn get_candles(
        &self,
        symbol: &str,
        window: usize,
        resolution: Resolution,
    ) -> Result<Vec<Candle>>;

    /// Drain price updates since the last poll
    async fn poll_ticks(&self) -> Result<Vec<Tick>>;

    /// Drain fills since the last poll
    async fn poll_fills(&self) -> Result<Vec<FillReport>>;

    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_venue_kind_accepts_aliases() {
        assert_eq!(parse_venue_kind("paper").unwrap(), VenueKind::Paper);
        assert_eq!(parse_venue_kind("LIVE").unwrap(), VenueKind::Bridge);
        assert!(parse_venue_kind("foo").is_err());
    }

    #[test]
    fn limit_request_carries_price() {
        let order = OrderRequest::limit("TQQQ", Side::Short, 10, Decimal::new(512, 2));
        assert_eq!(order.price_type, PriceType::Limit);
        assert_eq!(order.limit_price, Some(Decimal::new(512, 2)));
    }
}
