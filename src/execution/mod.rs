// Order execution and data collection module
pub mod candle_builder;
pub mod executor;
pub mod position_manager;

pub use candle_builder::{bucket_start, CandleBuilder, DEFAULT_PERIODS};
pub use executor::{option_stop_trigger, ExecutionAction, ExecutionDecision, TradeExecutor};
pub use position_manager::{
    OptionPosition, PositionManager, PositionStatus, PositionSummary, SyncReport,
};
