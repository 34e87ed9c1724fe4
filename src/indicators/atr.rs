/// Average True Range (ATR) indicator
///
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// The first bar has no previous close, so its true range is just high - low.
/// ATR is the simple rolling mean of the last `period` true ranges.

use crate::models::Candle;

/// True range for every candle, aligned with the input
pub fn true_range_series(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let hl = candle.high - candle.low;
            match i.checked_sub(1).map(|p| candles[p].close) {
                Some(prev_close) => hl
                    .max((candle.high - prev_close).abs())
                    .max((candle.low - prev_close).abs()),
                None => hl,
            }
        })
        .collect()
}

/// Calculate ATR for the given candles
///
/// Returns the current ATR value, or None if insufficient data
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let true_ranges = true_range_series(candles);
    let window = &true_ranges[true_ranges.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// ATR at every bar (None until `period` bars are available)
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let true_ranges = true_range_series(candles);
    crate::indicators::moving_average::sma_series(&true_ranges, period)
}
