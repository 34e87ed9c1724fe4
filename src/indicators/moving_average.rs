use yata::core::{Method, PeriodType};
use yata::methods::EMA;

/// Calculate Simple Moving Average (SMA) of the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Rolling SMA aligned with the input; `None` until the window is full
pub fn sma_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if period == 0 || i + 1 < period {
                None
            } else {
                calculate_sma(&values[i + 1 - period..=i], period)
            }
        })
        .collect()
}

/// Span-based EMA series (alpha = 2 / (span + 1)) seeded with the first value
pub fn ema_series(prices: &[f64], span: usize) -> Vec<f64> {
    let Some(first) = prices.first() else {
        return Vec::new();
    };
    let Ok(period) = PeriodType::try_from(span) else {
        return Vec::new();
    };
    let Ok(mut ema) = EMA::new(period, first) else {
        return Vec::new();
    };

    prices.iter().map(|price| ema.next(price)).collect()
}

/// Latest value of the span-based EMA
pub fn calculate_ema(prices: &[f64], span: usize) -> Option<f64> {
    ema_series(prices, span).last().copied()
}

/// Sample standard deviation (n - 1) of the last `period` values
pub fn sample_std(values: &[f64], period: usize) -> Option<f64> {
    if period < 2 || values.len() < period {
        return None;
    }

    let window = &values[values.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance =
        window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (period as f64 - 1.0);

    Some(variance.sqrt())
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
