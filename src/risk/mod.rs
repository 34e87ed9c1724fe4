// Risk management module: session rules and stop placement
pub mod session;
pub mod stops;

pub use session::{SessionState, TradingSession};
pub use stops::{initial_stop, is_stop_hit, ratchet, trailing_candidate, update_trailing_stop};
