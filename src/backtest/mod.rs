// Offline replay of the Jigsaw checklist with trailing-stop comparison
pub mod engine;
pub mod metrics;
pub mod synthetic;

pub use engine::{BacktestData, BacktestEngine, ExitPoint, SeriesIndicators, INITIAL_EQUITY};
pub use metrics::{BacktestReport, MethodMetrics, SignalCounts, SimulatedExit, TradeRecord};
pub use synthetic::{MarketScenario, SyntheticDataGenerator};
