use crate::config::{StopLossMethod, TradingConfig, TrailingStopMethod};
use crate::indicators::{calculate_atr, calculate_ema, heikin_ashi};
use crate::models::{Candle, Direction};

pub const ATR_PERIOD: usize = 14;
pub const TRAIL_EMA_PERIOD: usize = 9;
pub const TRAIL_PERCENT: f64 = 1.5;
pub const TRAIL_ATR_MULTIPLE: f64 = 1.5;
pub const LIVE_TRAIL_POINTS: f64 = 5.0;
const FALLBACK_STOP_PCT: f64 = 1.0;
const STRUCTURE_LOOKBACK: usize = 10;
const HA_TRAIL_LOOKBACK: usize = 3;

fn percent_stop(direction: Direction, price: f64, pct: f64) -> f64 {
    match direction {
        Direction::Bearish => price * (1.0 + pct / 100.0),
        _ => price * (1.0 - pct / 100.0),
    }
}

/// Lowest swing low (bullish) or highest swing high (bearish) in the recent bars
///
/// A swing low is a bar whose low is below both neighbours.
pub fn structure_level(candles: &[Candle], direction: Direction) -> Option<f64> {
    let lookback = STRUCTURE_LOOKBACK.min(candles.len());
    if lookback < 3 {
        return None;
    }
    let window = &candles[candles.len() - lookback..];

    let swings = window.windows(3).filter_map(|w| match direction {
        Direction::Bearish if w[1].high > w[0].high && w[1].high > w[2].high => Some(w[1].high),
        Direction::Bullish if w[1].low < w[0].low && w[1].low < w[2].low => Some(w[1].low),
        _ => None,
    });

    match direction {
        Direction::Bearish => swings.fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v)))),
        _ => swings.fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v)))),
    }
}

/// Initial stop on the underlying for a new position
///
/// `candles` are 5-minute bars of the underlying. Missing data falls back to a 1% stop.
pub fn initial_stop(
    method: StopLossMethod,
    direction: Direction,
    price: f64,
    candles: &[Candle],
    config: &TradingConfig,
) -> f64 {
    match method {
        StopLossMethod::FixedPercentage => {
            percent_stop(direction, price, config.fixed_stop_percentage)
        }
        StopLossMethod::AtrMultiple => match calculate_atr(candles, ATR_PERIOD) {
            Some(atr) => match direction {
                Direction::Bearish => price + atr * config.atr_multiple,
                _ => price - atr * config.atr_multiple,
            },
            None => percent_stop(direction, price, FALLBACK_STOP_PCT),
        },
        StopLossMethod::Structure => structure_level(candles, direction)
            .unwrap_or_else(|| percent_stop(direction, price, FALLBACK_STOP_PCT)),
    }
}

/// Where the trailing method would put the stop right now
pub fn trailing_candidate(
    method: TrailingStopMethod,
    direction: Direction,
    price: f64,
    candles: &[Candle],
) -> Option<f64> {
    let long = direction != Direction::Bearish;

    match method {
        TrailingStopMethod::HeikinAshiCandle => {
            let ha = heikin_ashi(candles);
            let lookback = HA_TRAIL_LOOKBACK.min(ha.len().saturating_sub(1));
            if lookback == 0 {
                return None;
            }
            let recent = &ha[ha.len() - lookback..];
            if long {
                recent.iter().map(|b| b.low).reduce(f64::min)
            } else {
                recent.iter().map(|b| b.high).reduce(f64::max)
            }
        }
        TrailingStopMethod::Ema => {
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            calculate_ema(&closes, TRAIL_EMA_PERIOD)
        }
        TrailingStopMethod::PercentPrice => Some(percent_stop(direction, price, TRAIL_PERCENT)),
        TrailingStopMethod::Atr => calculate_atr(candles, ATR_PERIOD).map(|atr| {
            if long {
                price - atr * TRAIL_ATR_MULTIPLE
            } else {
                price + atr * TRAIL_ATR_MULTIPLE
            }
        }),
        TrailingStopMethod::FixedPoint => Some(if long {
            price - LIVE_TRAIL_POINTS
        } else {
            price + LIVE_TRAIL_POINTS
        }),
    }
}

/// Accept `candidate` only if it tightens the stop
pub fn ratchet(direction: Direction, current_stop: f64, candidate: f64) -> Option<f64> {
    let improves = match direction {
        Direction::Bearish => candidate < current_stop,
        _ => candidate > current_stop,
    };
    improves.then_some(candidate)
}

/// New stop level if the trailing method moves it in the position's favour
pub fn update_trailing_stop(
    method: TrailingStopMethod,
    direction: Direction,
    current_stop: f64,
    price: f64,
    candles: &[Candle],
) -> Option<f64> {
    trailing_candidate(method, direction, price, candles)
        .and_then(|candidate| ratchet(direction, current_stop, candidate))
}

/// Has the underlying traded through the stop?
pub fn is_stop_hit(direction: Direction, stop_level: f64, price: f64) -> bool {
    match direction {
        Direction::Bearish => price >= stop_level,
        _ => price <= stop_level,
    }
}
