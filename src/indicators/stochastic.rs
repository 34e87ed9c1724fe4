use crate::indicators::moving_average::sma_series;
use crate::models::Candle;

/// Stochastic oscillator reading for the latest bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// Raw %K for every bar; `None` until `k_period` bars exist
///
/// A bar with no range (highest high == lowest low) reads as 50.
pub fn raw_k_series(candles: &[Candle], k_period: usize) -> Vec<Option<f64>> {
    (0..candles.len())
        .map(|i| {
            if k_period == 0 || i + 1 < k_period {
                return None;
            }
            let window = &candles[i + 1 - k_period..=i];
            let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
            let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
            let range = highest - lowest;

            if range > 0.0 {
                Some(100.0 * (candles[i].close - lowest) / range)
            } else {
                Some(50.0)
            }
        })
        .collect()
}

/// Calculate the smoothed stochastic (%K = SMA(raw, smooth), %D = SMA(%K, d_period))
///
/// Returns None if there are not enough bars for a %D value.
pub fn calculate_stochastic(
    candles: &[Candle],
    k_period: usize,
    d_period: usize,
    smooth: usize,
) -> Option<Stochastic> {
    let k_series = smoothed_k_series(candles, k_period, smooth);
    let k = (*k_series.last()?)?;

    let defined: Vec<f64> = k_series.iter().flatten().copied().collect();
    let d = *sma_series(&defined, d_period).last()?;

    Some(Stochastic { k, d: d? })
}

/// %K series after smoothing, aligned with the input
pub fn smoothed_k_series(candles: &[Candle], k_period: usize, smooth: usize) -> Vec<Option<f64>> {
    let raw = raw_k_series(candles, k_period);
    let first_defined = raw.iter().position(|v| v.is_some());

    let Some(offset) = first_defined else {
        return vec![None; candles.len()];
    };

    let defined: Vec<f64> = raw.iter().flatten().copied().collect();
    let smoothed = sma_series(&defined, smooth);

    let mut out = vec![None; offset];
    out.extend(smoothed);
    out
}

/// %K and %D at every bar; `None` until both are defined
pub fn stochastic_series(
    candles: &[Candle],
    k_period: usize,
    d_period: usize,
    smooth: usize,
) -> Vec<Option<Stochastic>> {
    let k_series = smoothed_k_series(candles, k_period, smooth);
    let Some(offset) = k_series.iter().position(|v| v.is_some()) else {
        return vec![None; candles.len()];
    };

    let defined: Vec<f64> = k_series.iter().flatten().copied().collect();
    let d_series = sma_series(&defined, d_period);

    let mut out = vec![None; offset];
    out.extend(
        defined
            .iter()
            .zip(d_series)
            .map(|(k, d)| d.map(|d| Stochastic { k: *k, d })),
    );
    out
}
