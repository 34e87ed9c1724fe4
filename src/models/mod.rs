use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Market bias shared by sectors, compression and trade direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Bullish => Direction::Bearish,
            Direction::Bearish => Direction::Bullish,
            Direction::Neutral => Direction::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
            Direction::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV candle aggregated over a fixed number of minutes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub period_minutes: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: u64,
    pub last_update: DateTime<Utc>,
}

impl Candle {
    /// Start a new candle from its first tick
    pub fn open_at(
        symbol: &str,
        period_minutes: u32,
        start_time: DateTime<Utc>,
        price: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            period_minutes,
            start_time,
            end_time: start_time + chrono::Duration::minutes(period_minutes as i64),
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            tick_count: 1,
            last_update: start_time,
        }
    }

    /// Fold a tick into the candle
    pub fn apply_tick(&mut self, price: f64, volume: f64, at: DateTime<Utc>) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
        self.tick_count += 1;
        self.last_update = at;
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Top-of-book quote from the streaming feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteEvent {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub time: DateTime<Utc>,
}

impl QuoteEvent {
    /// Mid if both sides are quoted, otherwise whichever side is positive
    pub fn price(&self) -> Option<f64> {
        mid_or_side(self.bid, self.ask)
    }
}

/// Mid price of a two-sided market, falling back to the live side
pub fn mid_or_side(bid: f64, ask: f64) -> Option<f64> {
    if bid > 0.0 && ask > 0.0 {
        Some((bid + ask) / 2.0)
    } else if bid > 0.0 {
        Some(bid)
    } else if ask > 0.0 {
        Some(ask)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeEvent {
    pub symbol: String,
    pub price: f64,
    pub day_volume: f64,
    pub size: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GreeksEvent {
    pub symbol: String,
    pub volatility: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub rho: f64,
    pub vega: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryEvent {
    pub symbol: String,
    pub open_interest: f64,
    pub day_open: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub prev_close: f64,
}

/// Candle event delivered by the feed (history or live aggregation)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandleEvent {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
}

/// Everything the streaming client can emit
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Quote(QuoteEvent),
    Trade(TradeEvent),
    Greeks(GreeksEvent),
    Summary(SummaryEvent),
    Candle(CandleEvent),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Quote(q) => &q.symbol,
            MarketEvent::Trade(t) => &t.symbol,
            MarketEvent::Greeks(g) => &g.symbol,
            MarketEvent::Summary(s) => &s.symbol,
            MarketEvent::Candle(c) => &c.symbol,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn for_direction(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Bullish => Some(OptionType::Call),
            Direction::Bearish => Some(OptionType::Put),
            Direction::Neutral => None,
        }
    }

    pub fn trade_label(&self) -> &'static str {
        match self {
            OptionType::Call => "Long Call",
            OptionType::Put => "Long Put",
        }
    }
}

/// Single option contract identified by its OCC symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionContract {
    pub symbol: String,
    pub underlying: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
}

impl OptionContract {
    /// Parse an OCC symbol such as `SPY   241129C00420000`
    ///
    /// Layout after stripping the root padding: root, yymmdd, C/P, strike × 1000 (8 digits)
    pub fn from_occ(symbol: &str) -> Option<Self> {
        let compact: String = symbol.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() < 16 || !compact.is_ascii() {
            return None;
        }

        let split = compact.len() - 15;
        let (root, rest) = compact.split_at(split);
        let date = NaiveDate::parse_from_str(&rest[0..6], "%y%m%d").ok()?;
        let option_type = match &rest[6..7] {
            "C" => OptionType::Call,
            "P" => OptionType::Put,
            _ => return None,
        };
        let strike = rest[7..15].parse::<u64>().ok()? as f64 / 1000.0;

        Some(Self {
            symbol: symbol.to_string(),
            underlying: root.to_string(),
            option_type,
            strike,
            expiration: date,
        })
    }
}

/// Trading signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    BuyCall,
    BuyPut,
    Hold,
}

impl Signal {
    pub fn from_direction(direction: Direction) -> Self {
        match direction {
            Direction::Bullish => Signal::BuyCall,
            Direction::Bearish => Signal::BuyPut,
            Direction::Neutral => Signal::Hold,
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    AutoClose,
    Failsafe,
    StopHit,
    HeikinAshiReversal,
    StochasticExit,
    TrendBreak,
    CompressionReentry,
    Manual,
    BrokerSync,
}

impl ExitReason {
    pub const ALL: [ExitReason; 9] = [
        ExitReason::AutoClose,
        ExitReason::Failsafe,
        ExitReason::StopHit,
        ExitReason::HeikinAshiReversal,
        ExitReason::StochasticExit,
        ExitReason::TrendBreak,
        ExitReason::CompressionReentry,
        ExitReason::Manual,
        ExitReason::BrokerSync,
    ];

    /// Stable identifier used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::AutoClose => "auto_close",
            ExitReason::Failsafe => "failsafe",
            ExitReason::StopHit => "stop_hit",
            ExitReason::HeikinAshiReversal => "heikin_ashi_reversal",
            ExitReason::StochasticExit => "stochastic_exit",
            ExitReason::TrendBreak => "trend_break",
            ExitReason::CompressionReentry => "compression_reentry",
            ExitReason::Manual => "manual",
            ExitReason::BrokerSync => "broker_sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == value)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExitReason::AutoClose => "Auto-close before market close",
            ExitReason::Failsafe => "Failsafe time limit reached",
            ExitReason::StopHit => "Stop level hit",
            ExitReason::HeikinAshiReversal => "Opposing Heikin Ashi candle",
            ExitReason::StochasticExit => "Stochastic exit signal",
            ExitReason::TrendBreak => "Price crossed VWAP/EMA",
            ExitReason::CompressionReentry => "Price re-entered compression",
            ExitReason::Manual => "Manual close",
            ExitReason::BrokerSync => "Closed at broker",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
