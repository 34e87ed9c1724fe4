use crate::models::{Candle, Direction};

/// Heikin Ashi transformed bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaCandle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl HaCandle {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Transform candles into Heikin Ashi bars
///
/// HA close is the OHLC average; HA open is the midpoint of the previous HA
/// body (the first bar uses its own open/close midpoint).
pub fn heikin_ashi(candles: &[Candle]) -> Vec<HaCandle> {
    let mut bars: Vec<HaCandle> = Vec::with_capacity(candles.len());

    for candle in candles {
        let close = (candle.open + candle.high + candle.low + candle.close) / 4.0;
        let open = match bars.last() {
            Some(prev) => (prev.open + prev.close) / 2.0,
            None => (candle.open + candle.close) / 2.0,
        };

        bars.push(HaCandle {
            open,
            high: candle.high.max(open).max(close),
            low: candle.low.min(open).min(close),
            close,
        });
    }

    bars
}

/// Classify one HA bar
///
/// Bullish: no meaningful lower wick and a rising body.
/// Bearish: no meaningful upper wick and a falling body.
/// The wick tolerance is `wick_tolerance` times the bar range (0.0001 for a flat bar).
pub fn classify_bar(bar: &HaCandle, wick_tolerance: f64) -> Direction {
    let range = bar.range();
    let tolerance = if range > 0.0 {
        range * wick_tolerance
    } else {
        0.0001
    };

    if (bar.open - bar.low).abs() < tolerance && bar.close > bar.open {
        Direction::Bullish
    } else if (bar.open - bar.high).abs() < tolerance && bar.close < bar.open {
        Direction::Bearish
    } else {
        Direction::Neutral
    }
}

/// HA signal of the most recent bar
pub fn ha_signal(candles: &[Candle], wick_tolerance: f64) -> Direction {
    heikin_ashi(candles)
        .last()
        .map(|bar| classify_bar(bar, wick_tolerance))
        .unwrap_or(Direction::Neutral)
}

/// Does the latest HA bar confirm `direction`?
pub fn has_ha_signal(candles: &[Candle], direction: Direction, wick_tolerance: f64) -> bool {
    direction != Direction::Neutral && ha_signal(candles, wick_tolerance) == direction
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        let mut c = Candle::open_at("SPY", 1, Utc::now(), open, 100.0);
        c.high = high;
        c.low = low;
        c.close = close;
        c
    }

    fn rising_candles() -> Vec<Candle> {
        (0..6)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 2.5, base - 0.1, base + 2.0)
            })
            .collect()
    }

    #[test]
    fn test_ha_close_is_ohlc_average() {
        let bars = heikin_ashi(&[candle(10.0, 14.0, 8.0, 12.0)]);
        assert_eq!(bars[0].close, 11.0);
        assert_eq!(bars[0].open, 11.0);
    }

    #[test]
    fn test_ha_open_uses_previous_body() {
        let bars = heikin_ashi(&[candle(10.0, 14.0, 8.0, 12.0), candle(12.0, 16.0, 11.0, 15.0)]);
        assert_eq!(bars[1].open, 11.0);
        assert_eq!(bars[1].low, 11.0);
    }

    #[test]
    fn test_bullish_signal_on_strong_uptrend() {
        let candles = rising_candles();
        assert_eq!(ha_signal(&candles, 0.1), Direction::Bullish);
        assert!(has_ha_signal(&candles, Direction::Bullish, 0.1));
        assert!(!has_ha_signal(&candles, Direction::Bearish, 0.1));
    }

    #[test]
    fn test_bearish_signal_on_strong_downtrend() {
        let candles: Vec<Candle> = (0..6)
            .map(|i| {
                let base = 120.0 - i as f64 * 2.0;
                candle(base, base + 0.1, base - 2.5, base - 2.0)
            })
            .collect();
        assert_eq!(ha_signal(&candles, 0.1), Direction::Bearish);
    }

    #[test]
    fn test_flat_bar_is_neutral() {
        let bars = heikin_ashi(&[candle(10.0, 10.0, 10.0, 10.0)]);
        assert_eq!(classify_bar(&bars[0], 0.1), Direction::Neutral);
    }

    #[test]
    fn test_empty_input_is_neutral() {
        assert_eq!(ha_signal(&[], 0.1), Direction::Neutral);
    }
}
