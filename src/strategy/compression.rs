use crate::config::TradingConfig;
use crate::indicators::{bollinger_width, calculate_ema, calculate_sma, donchian_channel, mean, vwap_series};
use crate::models::{Candle, Direction};

pub const COMPRESSION_WINDOW: usize = 20;
/// Live baselines (average range, overall volume) use the latest 30 bars
pub const LIVE_COMPRESSION_BARS: usize = 30;
const RECENT_VOLUME_BARS: usize = 5;
/// Below this sector threshold the backtest accepts a single compression vote
const LENIENT_SECTOR_THRESHOLD: f64 = 10.0;

/// Which of the three coil tests fired, and the resulting bias
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compression {
    pub bollinger: bool,
    pub donchian: bool,
    pub volume: bool,
    pub direction: Direction,
    compressed: bool,
}

impl Compression {
    pub fn none() -> Self {
        Self {
            bollinger: false,
            donchian: false,
            volume: false,
            direction: Direction::Neutral,
            compressed: false,
        }
    }

    pub fn votes(&self) -> usize {
        [self.bollinger, self.donchian, self.volume]
            .iter()
            .filter(|v| **v)
            .count()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Compressed with the given bias
    pub fn confirms(&self, direction: Direction) -> bool {
        self.compressed && direction != Direction::Neutral && self.direction == direction
    }
}

/// Live compression check on 5-minute bars
///
/// Needs at least 20 bars and looks at no more than the last 30. Two of three
/// must hold: narrow Bollinger width, a 20-bar Donchian range below the
/// average bar range times the contraction threshold, and recent volume
/// drying up. Bias is close vs SMA(20).
pub fn detect_compression(candles: &[Candle], config: &TradingConfig) -> Compression {
    if candles.len() < COMPRESSION_WINDOW {
        return Compression::none();
    }
    let candles = &candles[candles.len().saturating_sub(LIVE_COMPRESSION_BARS)..];

    let bollinger = bollinger_width(candles).is_some_and(|w| w < config.bb_width_threshold);

    let avg_range = candles.iter().map(|c| c.high - c.low).sum::<f64>() / candles.len() as f64;
    let donchian = donchian_channel(candles, COMPRESSION_WINDOW)
        .is_some_and(|dc| dc.width() < avg_range * config.donchian_contraction_threshold);

    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let volume = volumes.iter().sum::<f64>() > 0.0 && {
        let recent = mean(&volumes[volumes.len() - RECENT_VOLUME_BARS..]).unwrap_or(0.0);
        let overall = mean(&volumes).unwrap_or(0.0);
        recent < overall * config.volume_squeeze_threshold
    };

    let mut reading = Compression {
        bollinger,
        donchian,
        volume,
        direction: Direction::Neutral,
        compressed: false,
    };
    reading.compressed = reading.votes() >= 2;

    if reading.compressed {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let last_close = closes[closes.len() - 1];
        reading.direction = match calculate_sma(&closes, COMPRESSION_WINDOW) {
            Some(sma) if last_close > sma => Direction::Bullish,
            _ => Direction::Bearish,
        };
    }

    tracing::debug!(
        "Compression {}: BB={} DC={} Vol={} ({}/3) -> {}",
        candles[0].symbol,
        reading.bollinger,
        reading.donchian,
        reading.volume,
        reading.votes(),
        reading.direction
    );

    reading
}

fn range_of(candles: &[Candle]) -> f64 {
    let high = candles.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = candles.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    high - low
}

/// Backtest compression at bar `idx` using only bars up to `idx`
///
/// The Donchian range over bars idx-20..=idx is compared with the prior
/// 20-bar window when available. Bias comes from close vs cumulative VWAP,
/// falling back to EMA(15) and then candle colour.
pub fn detect_compression_at(
    candles: &[Candle],
    idx: usize,
    config: &TradingConfig,
) -> Compression {
    if idx < COMPRESSION_WINDOW || idx >= candles.len() {
        return Compression::none();
    }

    let window = &candles[idx - COMPRESSION_WINDOW..=idx];
    let bollinger = bollinger_width(window)
        .is_some_and(|w| w > 0.0 && w < config.bb_width_threshold);

    let dc_range = range_of(window);
    let donchian = if idx >= 2 * COMPRESSION_WINDOW {
        let past = &candles[idx - 2 * COMPRESSION_WINDOW..idx - COMPRESSION_WINDOW];
        dc_range < range_of(past) * config.donchian_contraction_threshold
    } else {
        let history = &candles[..=idx];
        let n = history.len() as f64;
        let avg_high = history.iter().map(|c| c.high).sum::<f64>() / n;
        let avg_low = history.iter().map(|c| c.low).sum::<f64>() / n;
        dc_range < (avg_high - avg_low) * config.donchian_contraction_threshold
    };

    let volume = window.iter().map(|c| c.volume).sum::<f64>() > 0.0 && {
        let vols: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let recent = mean(&vols[idx - RECENT_VOLUME_BARS..=idx]).unwrap_or(0.0);
        let past = if idx >= COMPRESSION_WINDOW + RECENT_VOLUME_BARS {
            mean(&vols[idx - COMPRESSION_WINDOW..idx - RECENT_VOLUME_BARS])
        } else {
            mean(&vols[..idx])
        }
        .unwrap_or(0.0);
        past > 0.0 && recent < past * config.volume_squeeze_threshold
    };

    let mut reading = Compression {
        bollinger,
        donchian,
        volume,
        direction: Direction::Neutral,
        compressed: false,
    };
    let needed = if config.sector_weight_threshold < LENIENT_SECTOR_THRESHOLD {
        1
    } else {
        2
    };
    reading.compressed = reading.votes() >= needed;

    if reading.compressed {
        let history = &candles[..=idx];
        let close = candles[idx].close;
        let vwap = vwap_series(history).last().copied().filter(|v| v.is_finite() && *v > 0.0);
        let closes: Vec<f64> = history.iter().map(|c| c.close).collect();

        reading.direction = match (vwap, calculate_ema(&closes, config.ema_value)) {
            (Some(vwap), _) => bias(close > vwap),
            (None, Some(ema)) => bias(close > ema),
            (None, None) => bias(close > candles[idx].open),
        };
    }

    reading
}

fn bias(up: bool) -> Direction {
    if up {
        Direction::Bullish
    } else {
        Direction::Bearish
    }
}
