//! Volatility envelopes: Bollinger width, Donchian channel and the
//! Bollinger-inside-Keltner squeeze.

use crate::indicators::moving_average::{calculate_sma, sample_std};
use crate::models::Candle;

pub const BB_PERIOD: usize = 20;
pub const BB_STD_DEV: f64 = 2.0;
pub const KC_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl Channel {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Bollinger bands over the last `period` closes (sample std)
pub fn bollinger_bands(candles: &[Candle], period: usize, num_std: f64) -> Option<Channel> {
    let closes = closes(candles);
    let middle = calculate_sma(&closes, period)?;
    let std = sample_std(&closes, period)?;

    Some(Channel {
        upper: middle + std * num_std,
        middle,
        lower: middle - std * num_std,
    })
}

/// (upper - lower) / middle of the 20-bar, 2 sigma Bollinger bands
pub fn bollinger_width(candles: &[Candle]) -> Option<f64> {
    let bands = bollinger_bands(candles, BB_PERIOD, BB_STD_DEV)?;
    if bands.middle == 0.0 {
        return None;
    }
    Some(bands.width() / bands.middle)
}

/// Highest high / lowest low over the last `window` bars
pub fn donchian_channel(candles: &[Candle], window: usize) -> Option<Channel> {
    if window == 0 || candles.len() < window {
        return None;
    }

    let recent = &candles[candles.len() - window..];
    let upper = recent.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let lower = recent.iter().map(|c| c.low).fold(f64::MAX, f64::min);

    Some(Channel {
        upper,
        middle: (upper + lower) / 2.0,
        lower,
    })
}

/// Keltner-style channel: SMA of closes +/- the window's high-low range times `multiplier`
pub fn keltner_channel(candles: &[Candle], window: usize, multiplier: f64) -> Option<Channel> {
    let middle = calculate_sma(&closes(candles), window)?;
    let range = donchian_channel(candles, window)?.width();

    Some(Channel {
        upper: middle + range * multiplier,
        middle,
        lower: middle - range * multiplier,
    })
}

/// Squeeze is on when the Bollinger bands sit inside the Keltner channel
pub fn is_squeeze_on(candles: &[Candle]) -> bool {
    match (
        bollinger_bands(candles, BB_PERIOD, BB_STD_DEV),
        keltner_channel(candles, BB_PERIOD, KC_MULTIPLIER),
    ) {
        (Some(bb), Some(kc)) => bb.upper <= kc.upper && bb.lower >= kc.lower,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create_test_candles(closes: &[f64], spread: f64) -> Vec<Candle> {
        closes
            .iter()
            .map(|close| {
                let mut candle = Candle::open_at("QQQ", 5, Utc::now(), *close, 1000.0);
                candle.high = close + spread;
                candle.low = close - spread;
                candle
            })
            .collect()
    }

    #[test]
    fn test_bollinger_width_tight_market() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + (i % 2) as f64 * 0.05).collect();
        let width = bollinger_width(&create_test_candles(&closes, 0.1)).unwrap();
        assert!(width < 0.01, "width = {}", width);
    }

    #[test]
    fn test_bollinger_width_volatile_market() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + (i % 2) as f64 * 10.0).collect();
        let width = bollinger_width(&create_test_candles(&closes, 1.0)).unwrap();
        assert!(width > 0.05, "width = {}", width);
    }

    #[test]
    fn test_donchian_channel() {
        let candles = create_test_candles(&[100.0, 105.0, 95.0, 102.0], 1.0);
        let channel = donchian_channel(&candles, 3).unwrap();
        assert_eq!(channel.upper, 106.0);
        assert_eq!(channel.lower, 94.0);
        assert_eq!(channel.middle, 100.0);
        assert!(donchian_channel(&candles, 5).is_none());
    }

    #[test]
    fn test_squeeze_on_for_flat_prices() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + (i % 3) as f64 * 0.1).collect();
        assert!(is_squeeze_on(&create_test_candles(&closes, 0.2)));
    }

    #[test]
    fn test_squeeze_needs_data() {
        let candles = create_test_candles(&[100.0; 5], 0.2);
        assert!(!is_squeeze_on(&candles));
    }
}
