use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

use crate::domain::{Level, Side};
use crate::error::Result;

/// One step of a scenario ladder
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioStep {
    pub level_num: u32,
    pub side: Side,
    /// Entry offset from the base price, in percent (negative = below)
    pub entry_pct: Decimal,
    /// Exit distance from entry, in percent, in the profitable direction
    pub exit_pct: Decimal,
    /// Stop distance from entry, in percent, in the adverse direction
    #[serde(default)]
    pub guardian_pct: Option<Decimal>,
    #[serde(default)]
    pub shares: Option<u32>,
}

/// Pre-configured level source
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub symbol: String,
    pub base_price: Decimal,
    #[serde(default = "default_shares")]
    pub shares: u32,
    pub steps: Vec<ScenarioStep>,
}

fn default_shares() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default, rename = "scenario")]
    scenarios: Vec<Scenario>,
}

impl Scenario {
    /// Expand the ladder into pool levels with ids `{scenario}_{num}_{side}`
    pub fn levels(&self) -> Vec<Level> {
        self.steps
            .iter()
            .map(|step| {
                let hundred = Decimal::ONE_HUNDRED;
                let entry = (self.base_price * (Decimal::ONE + step.entry_pct / hundred)).round_dp(4);
                let sign = step.side.sign();
                let exit = (entry * (Decimal::ONE + sign * step.exit_pct / hundred)).round_dp(4);
                let shares = step.shares.unwrap_or(self.shares);

                let mut level = Level::new(
                    format!("{}_{}_{}", self.id, step.level_num, step.side),
                    self.symbol.clone(),
                    step.side,
                    entry,
                    exit,
                    shares,
                )
                .with_scenario(self.id.clone(), step.level_num);

                if let Some(guardian) = step.guardian_pct {
                    level = level
                        .with_stop((entry * (Decimal::ONE - sign * guardian / hundred)).round_dp(4));
                }
                level.step_pct = step.entry_pct;
                level.tags = vec![volatility_tag(step.exit_pct).to_string()];
                level
            })
            .collect()
    }
}

/// Tag a level by the size of its target step
pub fn volatility_tag(step_pct: Decimal) -> &'static str {
    let step = step_pct.abs();
    if step > dec!(0.8) {
        "high_vol"
    } else if step > dec!(0.4) {
        "medium_vol"
    } else {
        "low_vol"
    }
}

pub fn parse_scenarios(body: &str) -> Result<Vec<Scenario>> {
    let file: ScenarioFile = toml::from_str(body)?;
    Ok(file.scenarios)
}

pub fn load_scenarios<P: AsRef<Path>>(path: P) -> Result<Vec<Scenario>> {
    let body = std::fs::read_to_string(path)?;
    parse_scenarios(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LevelStatus;

    const SAMPLE: &str = r#"
        [[scenario]]
        id = "spy"
        name = "SPY pullback ladder"
        symbol = "SPY"
        base_price = "5.20"
        shares = 100

        [[scenario.steps]]
        level_num = 1
        side = "long"
        entry_pct = "-1.0"
        exit_pct = "1.0"
        guardian_pct = "2.0"

        [[scenario.steps]]
        level_num = 1
        side = "short"
        entry_pct = "1.0"
        exit_pct = "0.5"
    "#;

    #[test]
    fn test_parse_and_expand() {
        let scenarios = parse_scenarios(SAMPLE).unwrap();
        assert_eq!(scenarios.len(), 1);

        let levels = scenarios[0].levels();
        assert_eq!(levels.len(), 2);

        let long = &levels[0];
        assert_eq!(long.id, "spy_1_long");
        assert_eq!(long.price, dec!(5.148));
        assert!(long.exit_price > long.price);
        assert!(long.stop_price.unwrap() < long.price);
        assert_eq!(long.status, LevelStatus::Available);
        assert_eq!(long.tags, vec!["high_vol".to_string()]);

        let short = &levels[1];
        assert_eq!(short.id, "spy_1_short");
        assert!(short.exit_price < short.price);
        assert_eq!(short.tags, vec!["medium_vol".to_string()]);
    }
}
