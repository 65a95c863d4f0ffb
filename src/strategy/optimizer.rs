//! Optimizer
//!
//! Picks the feasible subset of scored levels with the highest total score
//! under per-symbol, per-side, total, spacing and long/short balance
//! constraints, and diffs it against the currently active set to produce
//! a `Plan`. `OvertradingGuard` decides whether a plan may be applied.

use chrono::{DateTime, Duration, Utc};
use ordered_float::OrderedFloat;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Level, LevelStatus, Plan, PlanAction, ScoreRecord, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    /// Highest scores first
    Greedy,
    /// Alternate long and short picks
    #[default]
    Balanced,
    /// Fewer levels, higher bar
    Conservative,
    /// More levels, lower bar, tighter spacing
    Aggressive,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Greedy => "greedy",
            SelectionStrategy::Balanced => "balanced",
            SelectionStrategy::Conservative => "conservative",
            SelectionStrategy::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub strategy: SelectionStrategy,
    pub min_score: f64,
    pub max_active_total: usize,
    pub max_active_per_symbol: usize,
    pub max_active_per_side: usize,
    /// Minimum distance between same-side active levels, percent of price
    pub min_spacing_pct: f64,
    /// Levels further than this from price are not activated
    pub max_distance_pct: f64,
    pub min_long_ratio: f64,
    pub max_long_ratio: f64,
    /// The balance band applies once a selection holds this many levels
    pub balance_min_levels: usize,
    /// Active levels younger than this are never deactivated
    pub min_level_hold_secs: u64,
    /// Minimum time between applied plans for one symbol
    pub min_plan_hold_secs: u64,
    pub max_changes_per_hour: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Balanced,
            min_score: 30.0,
            max_active_total: 20,
            max_active_per_symbol: 10,
            max_active_per_side: 5,
            min_spacing_pct: 0.1,
            max_distance_pct: 3.0,
            min_long_ratio: 0.3,
            max_long_ratio: 0.7,
            balance_min_levels: 4,
            min_level_hold_secs: 60,
            min_plan_hold_secs: 300,
            max_changes_per_hour: 10,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(0.0..=1.0).contains(&self.min_long_ratio)
            || !(0.0..=1.0).contains(&self.max_long_ratio)
            || self.min_long_ratio > self.max_long_ratio
        {
            problems.push(format!(
                "optimizer long ratio band [{}, {}] is invalid",
                self.min_long_ratio, self.max_long_ratio
            ));
        }
        if self.max_active_per_side == 0 || self.max_active_per_symbol == 0 || self.max_active_total == 0 {
            problems.push("optimizer capacity limits must be positive".to_string());
        }
        if self.min_spacing_pct < 0.0 || self.max_distance_pct <= 0.0 {
            problems.push("optimizer spacing and distance must be non-negative".to_string());
        }
        problems
    }

    /// Constraint set after the strategy's posture is applied
    pub fn effective(&self) -> EffectiveLimits {
        let base = EffectiveLimits {
            min_score: self.min_score,
            max_total: self.max_active_total,
            per_symbol: self.max_active_per_symbol,
            per_side: self.max_active_per_side,
            spacing_pct: self.min_spacing_pct,
        };
        match self.strategy {
            SelectionStrategy::Greedy | SelectionStrategy::Balanced => base,
            SelectionStrategy::Conservative => EffectiveLimits {
                min_score: base.min_score * 1.5,
                max_total: (base.max_total / 2).max(1),
                per_symbol: (base.per_symbol / 2).max(1),
                per_side: (base.per_side / 2).max(1),
                ..base
            },
            SelectionStrategy::Aggressive => EffectiveLimits {
                min_score: (base.min_score * 0.5).max(10.0),
                spacing_pct: base.spacing_pct * 0.5,
                ..base
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveLimits {
    pub min_score: f64,
    pub max_total: usize,
    pub per_symbol: usize,
    pub per_side: usize,
    pub spacing_pct: f64,
}

/// Everything the optimizer needs for one symbol
#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    pub symbol: &'a str,
    pub price: Decimal,
    pub scores: &'a [ScoreRecord],
    /// Pool levels of this symbol, any status
    pub levels: &'a [Level],
    /// Active levels on other symbols, for the total cap
    pub active_elsewhere: usize,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Candidate {
    level_id: String,
    side: Side,
    price: Decimal,
    score: f64,
    distance_pct: f64,
    /// Closest existing active level on the same side, percent
    spacing_to_active: f64,
    pinned: bool,
}

fn gap_pct(a: Decimal, b: Decimal) -> f64 {
    if b.is_zero() {
        return f64::INFINITY;
    }
    ((a - b).abs() / b * Decimal::ONE_HUNDRED).to_f64().unwrap_or(f64::INFINITY)
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn plan(&self, input: &PlanInput<'_>) -> Plan {
        let limits = self.config.effective();
        let hold = Duration::seconds(self.config.min_level_hold_secs as i64);
        let by_id: HashMap<&str, &Level> = input.levels.iter().map(|l| (l.id.as_str(), l)).collect();

        let active: Vec<&Level> = input
            .levels
            .iter()
            .filter(|l| l.symbol == input.symbol && l.status == LevelStatus::Active)
            .collect();
        let pinned: HashSet<&str> = active
            .iter()
            .filter(|l| l.activated_at.map(|at| input.now - at < hold).unwrap_or(false))
            .map(|l| l.id.as_str())
            .collect();

        let mut rejected: HashMap<String, String> = HashMap::new();
        let mut candidates = Vec::new();
        for record in input.scores.iter().filter(|r| r.symbol == input.symbol) {
            let Some(level) = by_id.get(record.level_id.as_str()) else {
                continue;
            };
            let is_pinned = pinned.contains(level.id.as_str());
            if !is_pinned {
                if !level.status.is_selectable() {
                    continue;
                }
                if level.status == LevelStatus::Available && level.in_cooldown(input.now) {
                    rejected.insert(level.id.clone(), "re-activation cooldown".to_string());
                    continue;
                }
                if record.aggregate < limits.min_score {
                    rejected.insert(
                        level.id.clone(),
                        format!("score {:.1} below threshold {:.1}", record.aggregate, limits.min_score),
                    );
                    continue;
                }
                if record.distance_pct > self.config.max_distance_pct {
                    rejected.insert(
                        level.id.clone(),
                        format!(
                            "{:.2}% from price, outside the {:.1}% zone",
                            record.distance_pct, self.config.max_distance_pct
                        ),
                    );
                    continue;
                }
            }
            let spacing_to_active = active
                .iter()
                .filter(|a| a.side == level.side && a.id != level.id)
                .map(|a| gap_pct(level.price, a.price))
                .fold(f64::INFINITY, f64::min);
            candidates.push(Candidate {
                level_id: level.id.clone(),
                side: level.side,
                price: level.price,
                score: record.aggregate,
                distance_pct: record.distance_pct,
                spacing_to_active,
                pinned: is_pinned,
            });
        }

        // Score desc, then closer to price, then further from existing actives.
        candidates.sort_by_key(|c| {
            (
                Reverse(OrderedFloat(c.score)),
                OrderedFloat(c.distance_pct),
                Reverse(OrderedFloat(c.spacing_to_active)),
                c.level_id.clone(),
            )
        });

        let mut selected: Vec<Candidate> = candidates.iter().filter(|c| c.pinned).cloned().collect();
        let open: Vec<Candidate> = candidates.into_iter().filter(|c| !c.pinned).collect();

        match self.config.strategy {
            SelectionStrategy::Balanced | SelectionStrategy::Conservative => {
                self.select_alternating(open, &mut selected, &limits, input.active_elsewhere, &mut rejected)
            }
            SelectionStrategy::Greedy | SelectionStrategy::Aggressive => {
                self.select_greedy(open, &mut selected, &limits, input.active_elsewhere, &mut rejected)
            }
        }
        self.enforce_balance(&mut selected, &mut rejected);

        let selected_ids: HashSet<&str> = selected.iter().map(|c| c.level_id.as_str()).collect();
        let activate: Vec<PlanAction> = selected
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                by_id
                    .get(c.level_id.as_str())
                    .map(|l| l.status == LevelStatus::Available)
                    .unwrap_or(false)
            })
            .map(|(rank, c)| PlanAction {
                level_id: c.level_id.clone(),
                side: c.side,
                price: c.price,
                score: c.score,
                rationale: format!(
                    "rank {} by {} selection: score {:.1}, {:.2}% from price",
                    rank + 1,
                    self.config.strategy,
                    c.score,
                    c.distance_pct
                ),
            })
            .collect();

        let score_of: HashMap<&str, f64> = input
            .scores
            .iter()
            .map(|r| (r.level_id.as_str(), r.aggregate))
            .collect();

        let mut deactivate: Vec<PlanAction> = active
            .iter()
            .filter(|l| !pinned.contains(l.id.as_str()) && !selected_ids.contains(l.id.as_str()))
            .map(|l| PlanAction {
                level_id: l.id.clone(),
                side: l.side,
                price: l.price,
                score: score_of.get(l.id.as_str()).copied().unwrap_or(0.0),
                rationale: rejected
                    .get(&l.id)
                    .cloned()
                    .unwrap_or_else(|| "not scored this cycle".to_string()),
            })
            .collect();

        // Filled levels whose entry drifted out of the zone are retired to orphans.
        for level in input
            .levels
            .iter()
            .filter(|l| l.symbol == input.symbol && l.status == LevelStatus::Filled)
        {
            let distance = gap_pct(level.price, input.price);
            let held_long_enough = level
                .entry
                .as_ref()
                .map(|e| input.now - e.filled_at >= hold)
                .unwrap_or(true);
            if distance > self.config.max_distance_pct && held_long_enough {
                deactivate.push(PlanAction {
                    level_id: level.id.clone(),
                    side: level.side,
                    price: level.price,
                    score: 0.0,
                    rationale: format!(
                        "filled entry {:.2}% from price, outside the {:.1}% zone; retiring to orphan",
                        distance, self.config.max_distance_pct
                    ),
                });
            }
        }

        let total_score = selected.iter().map(|c| c.score).sum();
        debug!(
            symbol = %input.symbol,
            selected = selected.len(),
            activate = activate.len(),
            deactivate = deactivate.len(),
            total_score,
            "plan built"
        );

        Plan {
            id: Uuid::new_v4(),
            symbol: input.symbol.to_string(),
            created_at: input.now,
            strategy: self.config.strategy.to_string(),
            activate,
            deactivate,
            total_score,
        }
    }

    fn violation(
        &self,
        candidate: &Candidate,
        selected: &[Candidate],
        limits: &EffectiveLimits,
        active_elsewhere: usize,
    ) -> Option<String> {
        if active_elsewhere + selected.len() >= limits.max_total {
            return Some(format!("total active cap {} reached", limits.max_total));
        }
        if selected.len() >= limits.per_symbol {
            return Some(format!("symbol cap {} reached", limits.per_symbol));
        }
        let side_count = selected.iter().filter(|c| c.side == candidate.side).count();
        if side_count >= limits.per_side {
            return Some(format!("{} side cap {} reached", candidate.side, limits.per_side));
        }
        if let Some(near) = selected
            .iter()
            .filter(|c| c.side == candidate.side)
            .find(|c| gap_pct(candidate.price, c.price) < limits.spacing_pct)
        {
            return Some(format!(
                "within {:.2}% of {} (min spacing {:.2}%)",
                gap_pct(candidate.price, near.price),
                near.level_id,
                limits.spacing_pct
            ));
        }
        None
    }

    fn select_greedy(
        &self,
        open: Vec<Candidate>,
        selected: &mut Vec<Candidate>,
        limits: &EffectiveLimits,
        active_elsewhere: usize,
        rejected: &mut HashMap<String, String>,
    ) {
        for candidate in open {
            match self.violation(&candidate, selected, limits, active_elsewhere) {
                Some(reason) => {
                    rejected.insert(candidate.level_id.clone(), reason);
                }
                None => selected.push(candidate),
            }
        }
    }

    /// Take the best feasible candidate from whichever side has fewer picks
    fn select_alternating(
        &self,
        open: Vec<Candidate>,
        selected: &mut Vec<Candidate>,
        limits: &EffectiveLimits,
        active_elsewhere: usize,
        rejected: &mut HashMap<String, String>,
    ) {
        let (longs, shorts): (Vec<_>, Vec<_>) = open.into_iter().partition(|c| c.side == Side::Long);
        let mut queues: HashMap<Side, VecDeque<Candidate>> =
            HashMap::from([(Side::Long, longs.into()), (Side::Short, shorts.into())]);

        loop {
            let longs = selected.iter().filter(|c| c.side == Side::Long).count();
            let shorts = selected.len() - longs;
            let preferred = if longs <= shorts { Side::Long } else { Side::Short };

            let side = [preferred, preferred.opposite()]
                .into_iter()
                .find(|s| queues.get(s).map(|q| !q.is_empty()).unwrap_or(false));
            let Some(side) = side else {
                break;
            };
            let Some(candidate) = queues.get_mut(&side).and_then(|q| q.pop_front()) else {
                break;
            };
            match self.violation(&candidate, selected, limits, active_elsewhere) {
                Some(reason) => {
                    rejected.insert(candidate.level_id.clone(), reason);
                }
                None => selected.push(candidate),
            }
        }
    }

    /// Drop the weakest unpinned levels of the dominant side until the
    /// long ratio is inside the band or the band no longer applies
    fn enforce_balance(&self, selected: &mut Vec<Candidate>, rejected: &mut HashMap<String, String>) {
        loop {
            if selected.len() < self.config.balance_min_levels.max(1) {
                return;
            }
            let longs = selected.iter().filter(|c| c.side == Side::Long).count();
            let ratio = longs as f64 / selected.len() as f64;
            let dominant = if ratio > self.config.max_long_ratio {
                Side::Long
            } else if ratio < self.config.min_long_ratio {
                Side::Short
            } else {
                return;
            };
            let weakest = selected
                .iter()
                .enumerate()
                .filter(|(_, c)| c.side == dominant && !c.pinned)
                .min_by_key(|(_, c)| (OrderedFloat(c.score), Reverse(OrderedFloat(c.distance_pct))))
                .map(|(i, _)| i);
            let Some(index) = weakest else {
                return;
            };
            let dropped = selected.remove(index);
            rejected.insert(
                dropped.level_id,
                format!("long ratio {:.0}% outside balance band", ratio * 100.0),
            );
        }
    }
}

#[derive(Debug, Default, Clone)]
struct SymbolActivity {
    last_applied: Option<DateTime<Utc>>,
    changes: VecDeque<(DateTime<Utc>, usize)>,
}

/// Anti-overtrading gate: minimum time between applied plans and a cap on
/// changes in the trailing hour, per symbol
#[derive(Debug, Clone)]
pub struct OvertradingGuard {
    min_plan_hold: Duration,
    max_changes_per_hour: usize,
    activity: HashMap<String, SymbolActivity>,
}

impl OvertradingGuard {
    pub fn new(min_plan_hold_secs: u64, max_changes_per_hour: usize) -> Self {
        Self {
            min_plan_hold: Duration::seconds(min_plan_hold_secs as i64),
            max_changes_per_hour,
            activity: HashMap::new(),
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self::new(config.min_plan_hold_secs, config.max_changes_per_hour)
    }

    /// Apply reloaded limits, keeping recorded activity
    pub fn update_limits(&mut self, config: &OptimizerConfig) {
        self.min_plan_hold = Duration::seconds(config.min_plan_hold_secs as i64);
        self.max_changes_per_hour = config.max_changes_per_hour;
    }

    /// `Err(reason)` when a plan for `symbol` must be suppressed
    pub fn check(&self, symbol: &str, now: DateTime<Utc>) -> std::result::Result<(), String> {
        let Some(activity) = self.activity.get(symbol) else {
            return Ok(());
        };
        if let Some(last) = activity.last_applied {
            let elapsed = now - last;
            if elapsed < self.min_plan_hold {
                return Err(format!(
                    "last plan applied {}s ago, minimum hold is {}s",
                    elapsed.num_seconds(),
                    self.min_plan_hold.num_seconds()
                ));
            }
        }
        let recent = self.changes_last_hour(symbol, now);
        if recent >= self.max_changes_per_hour {
            return Err(format!(
                "{} changes in the last hour, cap is {}",
                recent, self.max_changes_per_hour
            ));
        }
        Ok(())
    }

    pub fn record(&mut self, symbol: &str, changes: usize, now: DateTime<Utc>) {
        let activity = self.activity.entry(symbol.to_string()).or_default();
        activity.last_applied = Some(now);
        activity.changes.push_back((now, changes));
        let horizon = now - Duration::hours(1);
        while activity.changes.front().map(|(at, _)| *at <= horizon).unwrap_or(false) {
            activity.changes.pop_front();
        }
    }

    pub fn changes_last_hour(&self, symbol: &str, now: DateTime<Utc>) -> usize {
        let horizon = now - Duration::hours(1);
        self.activity
            .get(symbol)
            .map(|a| a.changes.iter().filter(|(at, _)| *at > horizon).map(|(_, n)| n).sum())
            .unwrap_or(0)
    }

    pub fn last_applied(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.activity.get(symbol).and_then(|a| a.last_applied)
    }
}
