use crate::models::Candle;

const SPIKE_LOOKBACK: usize = 10;

/// Last bar's volume relative to the mean of the preceding bars in the lookback
///
/// Lookback is min(10, len) bars including the last one; at least 3 bars are needed.
pub fn volume_ratio(candles: &[Candle]) -> Option<f64> {
    let lookback = SPIKE_LOOKBACK.min(candles.len());
    if lookback < 3 {
        return None;
    }

    let window = &candles[candles.len() - lookback..];
    let (current, previous) = window.split_last()?;
    let avg = previous.iter().map(|c| c.volume).sum::<f64>() / previous.len() as f64;

    if avg > 0.0 {
        Some(current.volume / avg)
    } else {
        Some(0.0)
    }
}

/// Is the last bar's volume a spike above `threshold` times its recent average?
pub fn is_volume_spike(candles: &[Candle], threshold: f64) -> bool {
    volume_ratio(candles).is_some_and(|ratio| ratio > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candles_with_volumes(volumes: &[f64]) -> Vec<Candle> {
        volumes
            .iter()
            .map(|v| Candle::open_at("SPY", 1, Utc::now(), 100.0, *v))
            .collect()
    }

    #[test]
    fn test_volume_spike_detected() {
        let candles = candles_with_volumes(&[100.0, 100.0, 100.0, 100.0, 300.0]);
        assert_eq!(volume_ratio(&candles), Some(3.0));
        assert!(is_volume_spike(&candles, 1.5));
    }

    #[test]
    fn test_no_spike_on_steady_volume() {
        let candles = candles_with_volumes(&[100.0; 12]);
        assert!(!is_volume_spike(&candles, 1.5));
    }

    #[test]
    fn test_lookback_capped_at_ten() {
        // The huge early bar falls outside the 10-bar window
        let mut volumes = vec![1_000_000.0];
        volumes.extend(vec![100.0; 10]);
        volumes.push(200.0);
        let candles = candles_with_volumes(&volumes);
        assert_eq!(volume_ratio(&candles), Some(2.0));
    }

    #[test]
    fn test_too_few_bars() {
        let candles = candles_with_volumes(&[100.0, 500.0]);
        assert!(volume_ratio(&candles).is_none());
        assert!(!is_volume_spike(&candles, 1.5));
    }
}
