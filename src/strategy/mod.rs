// Trading strategy module
pub mod compression;
pub mod exits;
pub mod jigsaw;
pub mod patterns;
pub mod sector;

pub use compression::{detect_compression, detect_compression_at, Compression};
pub use exits::{check_exit, ExitContext};
pub use jigsaw::{EntrySignal, JigsawStrategy, Rejection, SetupKind};
pub use sector::{Alignment, Mag7Info, Mag7Tracker, SectorTracker};

use chrono::{DateTime, Utc};

use crate::models::{Candle, Signal};
use crate::Result;

/// Everything a strategy looks at for one symbol at one moment
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    /// Completed 1-minute bars, oldest first
    pub candles_1m: Vec<Candle>,
    /// Completed 5-minute bars, oldest first
    pub candles_5m: Vec<Candle>,
    pub alignment: Alignment,
    pub now: DateTime<Utc>,
}

/// Base trait for all trading strategies
pub trait Strategy: Send + Sync {
    /// Generate a trading signal from a market snapshot
    fn generate_signal(&self, snapshot: &MarketSnapshot) -> Result<Signal>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum 5-minute candles required for this strategy
    fn min_candles_required(&self) -> usize;
}
