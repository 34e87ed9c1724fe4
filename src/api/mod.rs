pub mod dxlink;
pub mod error;
pub mod market_data;
pub mod orders;
pub mod tastytrade;

pub use dxlink::{DxLinkClient, EventKind, StreamCommand};
pub use error::BrokerError;
pub use market_data::{LiquidityCriteria, MarketQuote};
pub use orders::{
    BrokerOrder, InstrumentType, KillReport, OrderAction, OrderManager, OrderRequest, OrderType,
    TimeInForce,
};
pub use tastytrade::{AccountBalance, BrokerPosition, QuoteToken, TastyTradeClient};
