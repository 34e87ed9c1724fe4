/// Average Directional Index (ADX) - Measures trend strength
///
/// ADX ranges from 0 to 100:
/// - ADX > 25: Strong trend (bull or bear)
/// - ADX 20-25: Moderate trend
/// - ADX < 20: Weak trend / choppy / ranging market
///
/// TR, +DM, -DM and DX are all smoothed with Wilder's exponential average
/// (alpha = 1 / period, seeded with the first value).

use crate::indicators::atr::true_range_series;
use crate::models::Candle;

fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let alpha = 1.0 / period as f64;
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;

    for &value in values {
        let next = match prev {
            Some(p) => p + alpha * (value - p),
            None => value,
        };
        out.push(next);
        prev = Some(next);
    }

    out
}

/// Calculate ADX, +DI, and -DI for trend strength and direction
///
/// Returns (adx, plus_di, minus_di) or None if insufficient data
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<(f64, f64, f64)> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let true_ranges = true_range_series(candles);
    let mut plus_dms = vec![0.0];
    let mut minus_dms = vec![0.0];

    for i in 1..candles.len() {
        let up_move = candles[i].high - candles[i - 1].high;
        let down_move = candles[i - 1].low - candles[i].low;

        plus_dms.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dms.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    let smoothed_tr = wilder_smooth(&true_ranges, period);
    let smoothed_plus = wilder_smooth(&plus_dms, period);
    let smoothed_minus = wilder_smooth(&minus_dms, period);

    let mut dx_values = Vec::with_capacity(candles.len());
    let mut plus_di = 0.0;
    let mut minus_di = 0.0;

    for i in 0..candles.len() {
        if smoothed_tr[i] > 0.0 {
            plus_di = 100.0 * smoothed_plus[i] / smoothed_tr[i];
            minus_di = 100.0 * smoothed_minus[i] / smoothed_tr[i];
        } else {
            plus_di = 0.0;
            minus_di = 0.0;
        }

        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };
        dx_values.push(dx);
    }

    let adx = *wilder_smooth(&dx_values, period).last()?;
    Some((adx, plus_di, minus_di))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create_trending_candles(count: usize, step: f64) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let base = 100.0 + i as f64 * step;
                let mut candle = Candle::open_at("SPY", 5, Utc::now(), base, 1000.0);
                candle.high = base + 0.5;
                candle.low = base - 0.5;
                candle
            })
            .collect()
    }

    #[test]
    fn test_adx_strong_uptrend() {
        let candles = create_trending_candles(60, 1.0);
        let (adx, plus_di, minus_di) = calculate_adx(&candles, 14).unwrap();

        assert!(plus_di > minus_di);
        assert!(adx > 25.0, "ADX should indicate a strong trend, got {}", adx);
    }

    #[test]
    fn test_adx_downtrend_direction() {
        let candles = create_trending_candles(60, -1.0);
        let (_, plus_di, minus_di) = calculate_adx(&candles, 14).unwrap();
        assert!(minus_di > plus_di);
    }

    #[test]
    fn test_adx_flat_market() {
        let candles = create_trending_candles(60, 0.0);
        let (adx, _, _) = calculate_adx(&candles, 14).unwrap();
        assert!(adx < 20.0);
    }

    #[test]
    fn test_adx_insufficient_data() {
        let candles = create_trending_candles(10, 1.0);
        assert!(calculate_adx(&candles, 14).is_none());
    }
}
