// Secondary Jigsaw setups evaluated alongside the main checklist
use crate::config::TradingConfig;
use crate::indicators::{has_ha_signal, vwap_or_sma};
use crate::models::{Candle, Direction};
use crate::strategy::compression::{detect_compression, COMPRESSION_WINDOW};
use crate::strategy::sector::Alignment;

/// Max distance from VWAP (fraction) for a pullback to count as a pivot retest
const PIVOT_BAND: f64 = 0.005;
const RECLAIM_MIN_BARS: usize = 10;

/// Pullback to VWAP inside a compression that already leans `direction`,
/// with a fresh Heikin Ashi candle on the 5-minute chart
pub fn pivot_continuation(candles_5m: &[Candle], direction: Direction, config: &TradingConfig) -> bool {
    if direction == Direction::Neutral || candles_5m.len() < COMPRESSION_WINDOW {
        return false;
    }

    if !detect_compression(candles_5m, config).confirms(direction) {
        return false;
    }

    let Some(vwap) = vwap_or_sma(candles_5m).filter(|v| *v > 0.0) else {
        return false;
    };
    let last_close = candles_5m[candles_5m.len() - 1].close;
    let at_pivot = (last_close - vwap).abs() / vwap < PIVOT_BAND;

    at_pivot && has_ha_signal(candles_5m, direction, config.ha_wick_tolerance)
}

/// Close crossing VWAP in the direction the market is aligned
///
/// Bullish reclaim: previous close below VWAP, current close above.
/// Bearish rejection: the reverse.
pub fn vwap_reclaim(candles_5m: &[Candle], alignment: &Alignment) -> Option<Direction> {
    if candles_5m.len() < RECLAIM_MIN_BARS || !alignment.aligned {
        return None;
    }
    let vwap = vwap_or_sma(candles_5m)?;

    let prev_close = candles_5m[candles_5m.len() - 2].close;
    let close = candles_5m[candles_5m.len() - 1].close;

    let crossed = match alignment.direction {
        Direction::Bullish => prev_close < vwap && close > vwap,
        Direction::Bearish => prev_close > vwap && close < vwap,
        Direction::Neutral => false,
    };
    crossed.then_some(alignment.direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn create_test_candles(closes: &[f64]) -> Vec<Candle> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let mut c = Candle::open_at("SPY", 5, start + Duration::minutes(5 * i as i64), *close, 1000.0);
                c.high = close + 0.1;
                c.low = close - 0.1;
                c
            })
            .collect()
    }

    fn aligned(direction: Direction) -> Alignment {
        Alignment {
            aligned: true,
            direction,
            strength: 57.0,
        }
    }

    #[test]
    fn test_vwap_reclaim_bullish() {
        let mut closes = vec![100.0; 10];
        closes.extend_from_slice(&[99.0, 101.0]);
        let candles = create_test_candles(&closes);

        assert_eq!(vwap_reclaim(&candles, &aligned(Direction::Bullish)), Some(Direction::Bullish));
        assert_eq!(vwap_reclaim(&candles, &aligned(Direction::Bearish)), None);
        assert_eq!(vwap_reclaim(&candles, &Alignment::none(20.0)), None);
    }

    #[test]
    fn test_vwap_rejection_bearish() {
        let mut closes = vec![100.0; 10];
        closes.extend_from_slice(&[101.0, 99.0]);
        let candles = create_test_candles(&closes);
        assert_eq!(vwap_reclaim(&candles, &aligned(Direction::Bearish)), Some(Direction::Bearish));
    }

    #[test]
    fn test_vwap_reclaim_needs_history() {
        let candles = create_test_candles(&[99.0, 101.0]);
        assert_eq!(vwap_reclaim(&candles, &aligned(Direction::Bullish)), None);
    }

    #[test]
    fn test_pivot_needs_compression() {
        let config = TradingConfig::default();
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 7) as f64 * 2.0).collect();
        let candles = create_test_candles(&closes);
        assert!(!pivot_continuation(&candles, Direction::Bullish, &config));
        assert!(!pivot_continuation(&candles[..10], Direction::Bullish, &config));
        assert!(!pivot_continuation(&candles, Direction::Neutral, &config));
    }
}
