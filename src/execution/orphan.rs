//! Orphan positions: fills whose level was deactivated before closing

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::domain::Side;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanPosition {
    pub level_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: u32,
    pub created_at: DateTime<Utc>,
    /// A close command is queued, in flight or resting at the venue
    #[serde(default)]
    pub close_pending: bool,
    /// When the pending close was issued
    #[serde(default)]
    pub close_issued_at: Option<DateTime<Utc>>,
    /// Venue order id of the acknowledged close
    #[serde(default)]
    pub close_order_id: Option<String>,
}

impl OrphanPosition {
    pub fn gain_per_share(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.side.sign()
    }

    pub fn unrealized(&self, price: Decimal) -> Decimal {
        self.gain_per_share(price) * Decimal::from(self.size)
    }
}

/// Orphans keyed by level id
#[derive(Debug, Default)]
pub struct OrphanBook {
    orphans: BTreeMap<String, OrphanPosition>,
}

impl OrphanBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, orphan: OrphanPosition) {
        self.orphans.insert(orphan.level_id.clone(), orphan);
    }

    pub fn remove(&mut self, level_id: &str) -> Option<OrphanPosition> {
        self.orphans.remove(level_id)
    }

    pub fn get(&self, level_id: &str) -> Option<&OrphanPosition> {
        self.orphans.get(level_id)
    }

    /// Mark a close as issued at `at`
    pub fn close_issued(&mut self, level_id: &str, at: DateTime<Utc>) {
        if let Some(orphan) = self.orphans.get_mut(level_id) {
            orphan.close_pending = true;
            orphan.close_issued_at = Some(at);
            orphan.close_order_id = None;
        }
    }

    /// Attach the venue order id once the pending close is acknowledged
    pub fn close_acknowledged(&mut self, level_id: &str, order_id: &str) {
        if let Some(orphan) = self.orphans.get_mut(level_id).filter(|o| o.close_pending) {
            orphan.close_order_id = Some(order_id.to_string());
        }
    }

    /// Forget the pending close so the next pass can price a new one
    pub fn clear_close(&mut self, level_id: &str) {
        if let Some(orphan) = self.orphans.get_mut(level_id) {
            orphan.close_pending = false;
            orphan.close_issued_at = None;
            orphan.close_order_id = None;
        }
    }

    /// Acknowledged closes issued at least `max_age` before `now`, as
    /// (level id, venue order id)
    pub fn stale_closes(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<(String, String)> {
        self.orphans
            .values()
            .filter(|o| o.close_pending)
            .filter(|o| o.close_issued_at.map(|at| now - at >= max_age).unwrap_or(false))
            .filter_map(|o| Some((o.level_id.clone(), o.close_order_id.clone()?)))
            .collect()
    }

    pub fn list(&self) -> Vec<OrphanPosition> {
        self.orphans.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Orphans without a pending close whose gain per share reaches
    /// `threshold` at the given prices, with the price to close at
    pub fn profitable(
        &self,
        prices: &HashMap<String, Decimal>,
        threshold: Decimal,
    ) -> Vec<(OrphanPosition, Decimal)> {
        self.orphans
            .values()
            .filter(|o| !o.close_pending)
            .filter_map(|o| {
                let price = *prices.get(&o.symbol)?;
                (o.gain_per_share(price) >= threshold).then(|| (o.clone(), price))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn orphan(side: Side, entry: Decimal) -> OrphanPosition {
        OrphanPosition {
            level_id: "L1".into(),
            symbol: "TQQQ".into(),
            side,
            entry_price: entry,
            size: 100,
            created_at: Utc::now(),
            close_pending: false,
            close_issued_at: None,
            close_order_id: None,
        }
    }

    #[test]
    fn test_profit_threshold() {
        let mut book = OrphanBook::new();
        book.insert(orphan(Side::Long, dec!(5.10)));

        let prices = HashMap::from([("TQQQ".to_string(), dec!(5.15))]);
        let hits = book.profitable(&prices, dec!(0.03));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, dec!(5.15));

        let prices = HashMap::from([("TQQQ".to_string(), dec!(5.12))]);
        assert!(book.profitable(&prices, dec!(0.03)).is_empty());
    }

    #[test]
    fn test_short_gain_and_pending() {
        let mut book = OrphanBook::new();
        book.insert(orphan(Side::Short, dec!(5.20)));
        let prices = HashMap::from([("TQQQ".to_string(), dec!(5.15))]);
        assert_eq!(book.get("L1").unwrap().gain_per_share(dec!(5.15)), dec!(0.05));

        book.close_issued("L1", Utc::now());
        assert!(book.profitable(&prices, dec!(0.03)).is_empty());
    }

    #[test]
    fn test_only_acknowledged_closes_go_stale() {
        let mut book = OrphanBook::new();
        book.insert(orphan(Side::Long, dec!(5.10)));
        let issued = Utc::now();
        book.close_issued("L1", issued);

        let later = issued + Duration::seconds(300);
        // Still queued: nothing at the venue to cancel yet
        assert!(book.stale_closes(later, Duration::seconds(120)).is_empty());

        book.close_acknowledged("L1", "paper-7");
        assert!(book
            .stale_closes(issued + Duration::seconds(60), Duration::seconds(120))
            .is_empty());
        assert_eq!(
            book.stale_closes(later, Duration::seconds(120)),
            vec![("L1".to_string(), "paper-7".to_string())]
        );

        book.clear_close("L1");
        assert!(book.stale_closes(later, Duration::seconds(120)).is_empty());
        let prices = HashMap::from([("TQQQ".to_string(), dec!(5.15))]);
        assert_eq!(book.profitable(&prices, dec!(0.03)).len(), 1);
    }
}
