pub mod pool;
pub mod scenario;

pub use pool::{LevelFilter, LevelPool, PoolStats};
pub use scenario::{load_scenarios, parse_scenarios, Scenario, ScenarioStep};
