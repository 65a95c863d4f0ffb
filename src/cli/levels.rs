use std::path::Path;
use tabled::Tabled;

use super::output::{print_kv, print_rows, OutputMode};
use crate::domain::{Level, Side};
use crate::error::Result;
use crate::levels::{load_scenarios, LevelFilter, LevelPool};

#[derive(Tabled)]
pub struct LevelRow {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub entry: String,
    pub exit: String,
    pub stop: String,
    pub shares: u32,
    pub status: String,
    pub tags: String,
}

impl From<&Level> for LevelRow {
    fn from(level: &Level) -> Self {
        Self {
            id: level.id.clone(),
            symbol: level.symbol.clone(),
            side: level.side.to_string(),
            entry: level.price.to_string(),
            exit: level.exit_price.to_string(),
            stop: level
                .stop_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            shares: level.shares,
            status: level.status.to_string(),
            tags: level.tags.join(","),
        }
    }
}

/// Expand a scenario file into a scratch pool and print it
pub async fn run(
    scenarios: &Path,
    symbol: Option<String>,
    side: Option<Side>,
    mode: OutputMode,
) -> Result<()> {
    let scenarios = load_scenarios(scenarios)?;
    let pool = LevelPool::new(0);
    let imported = pool.import_scenarios(&scenarios).await;

    let mut filter = LevelFilter::all();
    if let Some(symbol) = symbol {
        filter = filter.symbol(symbol);
    }
    if let Some(side) = side {
        filter = filter.side(side);
    }
    let mut levels = pool.list(&filter).await;
    levels.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.price.cmp(&b.price)));

    print_rows(&levels, LevelRow::from, mode)?;
    if mode == OutputMode::Table {
        print_kv("scenarios", scenarios.len());
        print_kv("levels", imported);
        print_kv("pool", pool.stats().await);
    }
    Ok(())
}
