use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;

use crate::config::TradingConfig;
use crate::execution::{CandleBuilder, OptionPosition};
use crate::indicators::{
    calculate_adx, calculate_ema, calculate_stochastic, has_ha_signal, is_volume_spike,
    vwap_or_sma, Stochastic,
};
use crate::models::{Candle, Direction, ExitReason, Signal};
use crate::risk::TradingSession;
use crate::strategy::compression::detect_compression;
use crate::strategy::exits::{check_exit, ExitContext};
use crate::strategy::patterns::{pivot_continuation, vwap_reclaim};
use crate::strategy::sector::{Alignment, Mag7Info, Mag7Tracker, SectorTracker};
use crate::strategy::{MarketSnapshot, Strategy};
use crate::Result;

pub const ADX_PERIOD: usize = 14;
/// Sector quotes older than this mean the feed is out of sync
pub const SECTOR_MAX_AGE_SECS: i64 = 60;
const SYNC_MIN_1M_BARS: usize = 5;
const SYNC_TICKERS: usize = 2;

/// Which structure triggered the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetupKind {
    CompressionBreakout,
    PivotContinuation,
    VwapReclaim,
}

/// A fully confirmed entry
#[derive(Debug, Clone, Serialize)]
pub struct EntrySignal {
    pub symbol: String,
    pub direction: Direction,
    pub setup: SetupKind,
    pub price: f64,
    pub alignment: Alignment,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub vwap: f64,
    pub ema: f64,
    pub adx: Option<f64>,
    pub volume_spike: bool,
    pub generated_at: DateTime<Utc>,
}

impl EntrySignal {
    pub fn signal(&self) -> Signal {
        Signal::from_direction(self.direction)
    }
}

/// First checklist item a symbol failed
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    NotAligned,
    NotEnoughData { bars_5m: usize, bars_1m: usize },
    NoStructure,
    Stochastic { k: f64, d: f64 },
    Trend { price: f64, vwap: f64, ema: f64 },
    NoHeikinAshi,
    Adx(Option<f64>),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotAligned => write!(f, "no market alignment"),
            Rejection::NotEnoughData { bars_5m, bars_1m } => {
                write!(f, "not enough data (5m={}, 1m={})", bars_5m, bars_1m)
            }
            Rejection::NoStructure => write!(f, "no compression or VWAP setup in direction"),
            Rejection::Stochastic { k, d } => write!(f, "stochastic not aligned: K={:.2}, D={:.2}", k, d),
            Rejection::Trend { price, vwap, ema } => write!(
                f,
                "trend not aligned: price={:.2}, VWAP={:.2}, EMA={:.2}",
                price, vwap, ema
            ),
            Rejection::NoHeikinAshi => write!(f, "no Heikin Ashi confirmation"),
            Rejection::Adx(Some(adx)) => write!(f, "ADX filter rejected: {:.2}", adx),
            Rejection::Adx(None) => write!(f, "ADX unavailable"),
        }
    }
}

/// The Jigsaw Flow strategy: breadth, coil, momentum, trend, trigger
pub struct JigsawStrategy {
    config: TradingConfig,
    session: TradingSession,
    candles: CandleBuilder,
    sectors: RwLock<SectorTracker>,
    mag7: RwLock<Mag7Tracker>,
}

impl JigsawStrategy {
    pub fn new(config: TradingConfig, candles: CandleBuilder) -> anyhow::Result<Self> {
        let session = TradingSession::from_config(&config)?;
        Ok(Self {
            sectors: RwLock::new(SectorTracker::new(&config)),
            mag7: RwLock::new(Mag7Tracker::new(&config)),
            config,
            session,
            candles,
        })
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn session(&self) -> &TradingSession {
        &self.session
    }

    /// Symbols the strategy needs streamed: tickers, sector ETFs and (optionally) Mag7
    pub fn watch_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.config.tickers.clone();
        symbols.extend(self.config.sector_etfs.iter().cloned());
        if self.config.use_mag7_confirmation {
            symbols.extend(self.config.mag7_stocks.iter().cloned());
        }
        let mut seen = HashSet::new();
        symbols.retain(|s| seen.insert(s.clone()));
        symbols
    }

    /// Feed a streamed price into the breadth trackers
    pub fn on_price(&self, symbol: &str, price: f64, at: DateTime<Utc>) {
        if let Ok(mut sectors) = self.sectors.write() {
            sectors.update(symbol, price, at);
        }
        if let Ok(mut mag7) = self.mag7.write() {
            mag7.update(symbol, price);
        }
    }

    pub fn current_alignment(&self) -> Alignment {
        if self.config.use_mag7_confirmation {
            self.mag7
                .read()
                .map(|m| m.check_alignment())
                .unwrap_or_else(|_| Alignment::none(0.0))
        } else {
            self.sectors
                .read()
                .map(|s| s.check_alignment())
                .unwrap_or_else(|_| Alignment::none(0.0))
        }
    }

    pub fn mag7_info(&self) -> Option<Mag7Info> {
        self.mag7.read().ok().map(|m| m.alignment_info())
    }

    fn candles_for(&self, symbol: &str, period: u32) -> anyhow::Result<Vec<Candle>> {
        self.candles
            .get_candles(symbol, period)
            .map_err(|e| anyhow::anyhow!("Candle store unavailable: {}", e))
    }

    /// Current 1m/5m view of a symbol plus market breadth
    pub fn snapshot(&self, symbol: &str, now: DateTime<Utc>) -> anyhow::Result<MarketSnapshot> {
        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            candles_1m: self.candles_for(symbol, 1)?,
            candles_5m: self.candles_for(symbol, 5)?,
            alignment: self.current_alignment(),
            now,
        })
    }

    /// Run the entry checklist on one symbol
    pub fn check_setup(&self, snapshot: &MarketSnapshot) -> std::result::Result<EntrySignal, Rejection> {
        let config = &self.config;
        let alignment = snapshot.alignment;
        if !alignment.aligned || alignment.direction == Direction::Neutral {
            return Err(Rejection::NotAligned);
        }
        let direction = alignment.direction;
        let (c1, c5) = (&snapshot.candles_1m, &snapshot.candles_5m);
        let Some(last) = c5.last() else {
            return Err(Rejection::NotEnoughData { bars_5m: 0, bars_1m: c1.len() });
        };
        if c1.is_empty() {
            return Err(Rejection::NotEnoughData { bars_5m: c5.len(), bars_1m: 0 });
        }

        let setup = if detect_compression(c5, config).confirms(direction) {
            if pivot_continuation(c5, direction, config) {
                SetupKind::PivotContinuation
            } else {
                SetupKind::CompressionBreakout
            }
        } else if vwap_reclaim(c5, &alignment) == Some(direction) {
            SetupKind::VwapReclaim
        } else {
            return Err(Rejection::NoStructure);
        };

        let Some(Stochastic { k, d }) = calculate_stochastic(
            c5,
            config.stochastic_k_period,
            config.stochastic_d_period,
            config.stochastic_smooth,
        ) else {
            return Err(Rejection::NotEnoughData { bars_5m: c5.len(), bars_1m: c1.len() });
        };
        let stoch_ok = match direction {
            Direction::Bullish => k > config.stoch_bullish_threshold,
            _ => k < config.stoch_bearish_threshold,
        };
        if !stoch_ok {
            return Err(Rejection::Stochastic { k, d });
        }

        let closes: Vec<f64> = c5.iter().map(|c| c.close).collect();
        let (Some(vwap), Some(ema)) = (vwap_or_sma(c5), calculate_ema(&closes, config.ema_value)) else {
            return Err(Rejection::NotEnoughData { bars_5m: c5.len(), bars_1m: c1.len() });
        };
        let price = last.close;
        let trend_ok = match direction {
            Direction::Bullish => price > vwap && price > ema,
            _ => price < vwap && price < ema,
        };
        if !trend_ok {
            return Err(Rejection::Trend { price, vwap, ema });
        }

        if !has_ha_signal(c1, direction, config.ha_wick_tolerance) {
            return Err(Rejection::NoHeikinAshi);
        }

        let volume_spike = is_volume_spike(c1, config.volume_spike_threshold);

        let adx = calculate_adx(c5, ADX_PERIOD).map(|(adx, _, _)| adx);
        if config.adx_filter && !adx.is_some_and(|v| v > config.adx_minimum) {
            return Err(Rejection::Adx(adx));
        }

        Ok(EntrySignal {
            symbol: snapshot.symbol.clone(),
            direction,
            setup,
            price,
            alignment,
            stoch_k: k,
            stoch_d: d,
            vwap,
            ema,
            adx,
            volume_spike,
            generated_at: snapshot.now,
        })
    }

    /// Scan every ticker without an active trade; returns confirmed entries
    pub fn scan_for_trades(&self, now: DateTime<Utc>, active: &HashSet<String>) -> Vec<EntrySignal> {
        if !self.session.is_trading_allowed(now) {
            return Vec::new();
        }

        let alignment = self.current_alignment();
        if !alignment.aligned {
            tracing::info!("No market alignment (strength {:.1}), no trade opportunities", alignment.strength);
            return Vec::new();
        }
        tracing::info!(
            "{} alignment detected: {} with {:.1}% {}",
            if self.config.use_mag7_confirmation { "Mag7" } else { "Sector" },
            alignment.direction,
            alignment.strength,
            if self.config.use_mag7_confirmation { "agreement" } else { "weight" }
        );

        let mut signals = Vec::new();
        for ticker in self.config.tickers.iter().filter(|t| !active.contains(*t)) {
            let snapshot = match self.snapshot(ticker, now) {
                Ok(mut s) => {
                    s.alignment = alignment;
                    s
                }
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", ticker, e);
                    continue;
                }
            };

            match self.check_setup(&snapshot) {
                Ok(signal) => {
                    tracing::info!(
                        "🎯 Trade signal for {}: {} {:?} @ {:.2} (K={:.1} D={:.1} VWAP={:.2} EMA={:.2} ADX={} volume spike={})",
                        ticker,
                        signal.direction,
                        signal.setup,
                        signal.price,
                        signal.stoch_k,
                        signal.stoch_d,
                        signal.vwap,
                        signal.ema,
                        signal.adx.map_or("n/a".to_string(), |a| format!("{:.1}", a)),
                        signal.volume_spike
                    );
                    signals.push(signal);
                }
                Err(Rejection::NoStructure) => {
                    tracing::debug!("{}: {}", ticker, Rejection::NoStructure)
                }
                Err(reason) => tracing::info!("{}: {}", ticker, reason),
            }
        }
        signals
    }

    /// Sector feed complete and fresh, and the lead tickers have recent 1m bars
    pub fn check_data_synchronization(&self, now: DateTime<Utc>) -> bool {
        let Ok(sectors) = self.sectors.read() else {
            return false;
        };
        if !sectors.all_present() {
            tracing::warn!("Sector data not synchronized");
            return false;
        }
        let stale = sectors.stale_sectors(now, Duration::seconds(SECTOR_MAX_AGE_SECS));
        if !stale.is_empty() {
            tracing::warn!("Sector data is stale: {}", stale.join(", "));
            return false;
        }
        drop(sectors);

        for ticker in self.config.tickers.iter().take(SYNC_TICKERS) {
            let bars = self.candles.candle_count(ticker, 1).unwrap_or(0);
            if bars < SYNC_MIN_1M_BARS {
                tracing::warn!("Missing recent 1m data for {} ({} bars)", ticker, bars);
                return false;
            }
        }
        true
    }

    /// Exit check for an open position at the current underlying price
    pub fn check_exit(
        &self,
        position: &OptionPosition,
        price: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ExitReason>> {
        let candles_1m = self.candles_for(&position.underlying, 1)?;
        let candles_5m = self.candles_for(&position.underlying, 5)?;
        let ctx = ExitContext {
            candles_1m: &candles_1m,
            candles_5m: &candles_5m,
            price,
            now,
        };
        Ok(check_exit(position, &ctx, &self.session, &self.config))
    }
}

impl Strategy for JigsawStrategy {
    fn generate_signal(&self, snapshot: &MarketSnapshot) -> Result<Signal> {
        Ok(match self.check_setup(snapshot) {
            Ok(entry) => entry.signal(),
            Err(_) => Signal::Hold,
        })
    }

    fn name(&self) -> &str {
        "Jigsaw Flow"
    }

    fn min_candles_required(&self) -> usize {
        crate::strategy::compression::COMPRESSION_WINDOW
    }
}
