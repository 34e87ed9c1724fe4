use crate::indicators::moving_average::calculate_sma;
use crate::models::Candle;

const FALLBACK_SMA_PERIOD: usize = 20;

/// Cumulative VWAP over the candles using the typical price (h + l + c) / 3
///
/// Returns None when the candles carry no volume.
pub fn calculate_vwap(candles: &[Candle]) -> Option<f64> {
    let (pv, volume) = candles.iter().fold((0.0, 0.0), |(pv, vol), c| {
        (pv + c.typical_price() * c.volume, vol + c.volume)
    });

    if volume > 0.0 {
        Some(pv / volume)
    } else {
        None
    }
}

/// Cumulative VWAP at every bar (bars before any volume repeat the typical price)
pub fn vwap_series(candles: &[Candle]) -> Vec<f64> {
    let mut cumulative_pv = 0.0;
    let mut cumulative_volume = 0.0;

    candles
        .iter()
        .map(|c| {
            cumulative_pv += c.typical_price() * c.volume;
            cumulative_volume += c.volume;
            if cumulative_volume > 0.0 {
                cumulative_pv / cumulative_volume
            } else {
                c.typical_price()
            }
        })
        .collect()
}

/// VWAP, or a 20-bar SMA of closes when there is no volume (index data)
pub fn vwap_or_sma(candles: &[Candle]) -> Option<f64> {
    calculate_vwap(candles).or_else(|| {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        calculate_sma(&closes, FALLBACK_SMA_PERIOD.min(closes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(price: f64, volume: f64) -> Candle {
        Candle::open_at("SPY", 1, Utc::now(), price, volume)
    }

    #[test]
    fn test_vwap_weights_by_volume() {
        let candles = vec![candle(100.0, 100.0), candle(110.0, 300.0)];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!((vwap - 107.5).abs() < 1e-9);
    }

    #[test]
    fn test_vwap_no_volume() {
        let candles = vec![candle(100.0, 0.0), candle(110.0, 0.0)];
        assert!(calculate_vwap(&candles).is_none());
        assert_eq!(vwap_or_sma(&candles), Some(105.0));
    }

    #[test]
    fn test_vwap_series_is_cumulative() {
        let candles = vec![candle(100.0, 100.0), candle(110.0, 100.0)];
        assert_eq!(vwap_series(&candles), vec![100.0, 105.0]);
    }

    #[test]
    fn test_vwap_or_sma_empty() {
        assert!(vwap_or_sma(&[]).is_none());
    }
}
