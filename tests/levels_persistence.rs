use chrono::Utc;
use gridpilot::levels::load_scenarios;
use gridpilot::{LevelFilter, LevelPool, LevelStatus, Side};
use rust_decimal_macros::dec;
use std::path::Path;

fn shipped_scenarios() -> Vec<gridpilot::Scenario> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/scenarios.toml");
    load_scenarios(path).unwrap()
}

#[test]
fn shipped_scenarios_import_once() {
    let scenarios = shipped_scenarios();
    assert_eq!(scenarios.len(), 2);

    let pool = LevelPool::new(0);
    let imported = tokio_test::block_on(pool.import_scenarios(&scenarios));
    assert_eq!(imported, 9);
    // Re-importing skips ids already in the pool.
    assert_eq!(tokio_test::block_on(pool.import_scenarios(&scenarios)), 0);

    let stats = tokio_test::block_on(pool.stats());
    assert_eq!(stats.total, 9);
    assert_eq!(stats.count(LevelStatus::Available), 9);

    let levels = tokio_test::block_on(pool.list(&LevelFilter::all()));
    for level in levels {
        match level.side {
            Side::Long => assert!(level.exit_price > level.price),
            Side::Short => assert!(level.exit_price < level.price),
        }
    }
}

#[tokio::test]
async fn snapshot_restores_lifecycle_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.json");

    let pool = LevelPool::new(0);
    pool.import_scenarios(&shipped_scenarios()).await;
    pool.set_status("tqqq_grid_1_long", LevelStatus::Active)
        .await
        .unwrap();
    pool.record_entry_fill("tqqq_grid_1_long", dec!(5.174), 100, Utc::now())
        .await
        .unwrap();
    pool.save_json(&path).await.unwrap();

    let restored = LevelPool::new(0);
    restored
        .add(gridpilot::Level::new("stale", "TQQQ", Side::Long, dec!(5.00), dec!(5.10), 100))
        .await
        .unwrap();
    assert_eq!(restored.load_json(&path).await.unwrap(), 9);

    // Loading replaces whatever the pool held.
    assert!(restored.get("stale").await.is_none());
    let level = restored.get("tqqq_grid_1_long").await.unwrap();
    assert_eq!(level.status, LevelStatus::Filled);
    assert_eq!(restored.open_positions().await.len(), 1);
}

#[tokio::test]
async fn missing_snapshot_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let pool = LevelPool::new(0);
    assert!(pool.load_json(dir.path().join("absent.json")).await.is_err());
}
