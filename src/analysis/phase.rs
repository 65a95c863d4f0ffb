use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TradingPhase;

/// Phase start times in exchange-local minutes after midnight
const PHASE_STARTS: [(u32, TradingPhase); 7] = [
    (9 * 60 + 30, TradingPhase::Open),
    (10 * 60 + 30, TradingPhase::Morning),
    (12 * 60, TradingPhase::Midday),
    (14 * 60, TradingPhase::Afternoon),
    (15 * 60, TradingPhase::PowerHour),
    (15 * 60 + 45, TradingPhase::Close),
    (16 * 60, TradingPhase::AfterHours),
];

/// Fixed daily session schedule in exchange-local time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSchedule {
    /// Exchange offset from UTC in minutes (New York standard time = -300)
    pub utc_offset_minutes: i32,
}

impl Default for TradingSchedule {
    fn default() -> Self {
        Self {
            utc_offset_minutes: -300,
        }
    }
}

impl TradingSchedule {
    pub fn new(utc_offset_minutes: i32) -> Self {
        Self { utc_offset_minutes }
    }

    /// Exchange-local minutes after midnight
    pub fn local_minutes(&self, at: DateTime<Utc>) -> u32 {
        let local_secs = at.timestamp() + i64::from(self.utc_offset_minutes) * 60;
        (local_secs.rem_euclid(86_400) / 60) as u32
    }

    /// Trading phase at a given instant; pure function of time
    pub fn phase_at(&self, at: DateTime<Utc>) -> TradingPhase {
        let minutes = self.local_minutes(at);
        PHASE_STARTS
            .iter()
            .rev()
            .find(|(start, _)| minutes >= *start)
            .map(|(_, phase)| *phase)
            .unwrap_or(TradingPhase::PreMarket)
    }
}
