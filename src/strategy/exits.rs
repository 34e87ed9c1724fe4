use chrono::{DateTime, Utc};

use crate::config::TradingConfig;
use crate::execution::OptionPosition;
use crate::indicators::{calculate_ema, calculate_stochastic, has_ha_signal, vwap_or_sma};
use crate::models::{Candle, Direction, ExitReason};
use crate::risk::{is_stop_hit, TradingSession};
use crate::strategy::compression::detect_compression;

/// What the exit rules look at for one open position
#[derive(Debug, Clone, Copy)]
pub struct ExitContext<'a> {
    pub candles_1m: &'a [Candle],
    pub candles_5m: &'a [Candle],
    /// Current underlying price
    pub price: f64,
    pub now: DateTime<Utc>,
}

/// Evaluate the exit rules in priority order; the first match wins
pub fn check_exit(
    position: &OptionPosition,
    ctx: &ExitContext<'_>,
    session: &TradingSession,
    config: &TradingConfig,
) -> Option<ExitReason> {
    let direction = position.direction;

    if session.should_auto_close(ctx.now) {
        return Some(ExitReason::AutoClose);
    }

    if position.minutes_open(ctx.now) >= config.failsafe_minutes {
        return Some(ExitReason::Failsafe);
    }

    if position.has_stop() && is_stop_hit(direction, position.stop_level, ctx.price) {
        return Some(ExitReason::StopHit);
    }

    if has_ha_signal(ctx.candles_1m, direction.opposite(), config.ha_wick_tolerance) {
        return Some(ExitReason::HeikinAshiReversal);
    }

    if stochastic_exit(direction, ctx.candles_5m, config) {
        return Some(ExitReason::StochasticExit);
    }

    if trend_broken(direction, ctx.price, ctx.candles_5m, config) {
        return Some(ExitReason::TrendBreak);
    }

    if detect_compression(ctx.candles_5m, config).is_compressed() {
        return Some(ExitReason::CompressionReentry);
    }

    None
}

/// Long: %K overbought and crossing under %D. Short: the mirror image.
pub fn stochastic_exit(direction: Direction, candles: &[Candle], config: &TradingConfig) -> bool {
    let Some(stoch) = calculate_stochastic(
        candles,
        config.stochastic_k_period,
        config.stochastic_d_period,
        config.stochastic_smooth,
    ) else {
        return false;
    };

    match direction {
        Direction::Bullish => stoch.k > config.stoch_exit_overbought && stoch.k < stoch.d,
        Direction::Bearish => stoch.k < config.stoch_exit_oversold && stoch.k > stoch.d,
        Direction::Neutral => false,
    }
}

/// Price through the nearer of VWAP and EMA against the trade
pub fn trend_broken(
    direction: Direction,
    price: f64,
    candles: &[Candle],
    config: &TradingConfig,
) -> bool {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (Some(vwap), Some(ema)) = (vwap_or_sma(candles), calculate_ema(&closes, config.ema_value))
    else {
        return false;
    };

    match direction {
        Direction::Bullish => price < vwap.min(ema),
        Direction::Bearish => price > vwap.max(ema),
        Direction::Neutral => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionContract;
    use chrono::{Duration, TimeZone};
    use chrono_tz::US::Eastern;

    fn et(h: u32, m: u32) -> DateTime<Utc> {
        Eastern
            .with_ymd_and_hms(2024, 11, 26, h, m, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn position(symbol: &str, entry_time: DateTime<Utc>, stop: f64) -> OptionPosition {
        let contract = OptionContract::from_occ(symbol).unwrap();
        OptionPosition::new(&contract, 1, 2.0, 450.0, stop, entry_time)
    }

    /// Steady uptrend with alternating bar sizes so nothing looks compressed
    fn trending(n: usize, step: f64) -> Vec<Candle> {
        let start = et(10, 0);
        (0..n)
            .map(|i| {
                let base = 450.0 + step * i as f64;
                let mut c = Candle::open_at("SPY", 5, start + Duration::minutes(5 * i as i64), base, 1000.0);
                let spread = if i % 2 == 0 { 1.5 } else { 0.5 };
                c.high = base + step.abs() + spread;
                c.low = base - spread;
                c.close = base + step;
                c
            })
            .collect()
    }

    fn session() -> TradingSession {
        TradingSession::from_config(&TradingConfig::default()).unwrap()
    }

    #[test]
    fn test_auto_close_has_priority() {
        let config = TradingConfig::default();
        let now = et(15, 50);
        let pos = position("SPY   241129C00450000", now, 449.0);
        let ctx = ExitContext { candles_1m: &[], candles_5m: &[], price: 440.0, now };
        assert_eq!(check_exit(&pos, &ctx, &session(), &config), Some(ExitReason::AutoClose));
    }

    #[test]
    fn test_failsafe_after_time_limit() {
        let config = TradingConfig::default();
        let now = et(11, 0);
        let pos = position("SPY   241129C00450000", now - Duration::minutes(21), 440.0);
        let ctx = ExitContext { candles_1m: &[], candles_5m: &[], price: 455.0, now };
        assert_eq!(check_exit(&pos, &ctx, &session(), &config), Some(ExitReason::Failsafe));
    }

    #[test]
    fn test_stop_hit_on_underlying() {
        let config = TradingConfig::default();
        let now = et(11, 0);
        let call = position("SPY   241129C00450000", now, 449.0);
        let ctx = ExitContext { candles_1m: &[], candles_5m: &[], price: 448.9, now };
        assert_eq!(check_exit(&call, &ctx, &session(), &config), Some(ExitReason::StopHit));

        let put = position("SPY   241129P00450000", now, 451.0);
        let ctx = ExitContext { price: 451.0, ..ctx };
        assert_eq!(check_exit(&put, &ctx, &session(), &config), Some(ExitReason::StopHit));
    }

    #[test]
    fn test_no_stop_means_no_stop_exit() {
        let config = TradingConfig::default();
        let now = et(11, 0);
        let put = position("SPY   241129P00450000", now, 0.0);
        let ctx = ExitContext { candles_1m: &[], candles_5m: &[], price: 451.0, now };
        assert_eq!(check_exit(&put, &ctx, &session(), &config), None);
    }

    #[test]
    fn test_trend_break_long() {
        let config = TradingConfig::default();
        let candles = trending(30, 0.5);
        assert!(trend_broken(Direction::Bullish, 400.0, &candles, &config));
        assert!(!trend_broken(Direction::Bullish, 470.0, &candles, &config));
        assert!(trend_broken(Direction::Bearish, 470.0, &candles, &config));
    }

    #[test]
    fn test_stochastic_exit_needs_cross() {
        let config = TradingConfig::default();
        // Rally then a small pullback: %K still high but below %D
        let mut candles = trending(20, 1.0);
        let last = candles.len() - 1;
        candles[last].close = candles[last].high - 1.2;
        let stoch = calculate_stochastic(&candles, 5, 3, 2).unwrap();
        let expected = stoch.k > 80.0 && stoch.k < stoch.d;
        assert_eq!(stochastic_exit(Direction::Bullish, &candles, &config), expected);
        assert!(!stochastic_exit(Direction::Bearish, &candles, &config));
        assert!(!stochastic_exit(Direction::Neutral, &candles, &config));
    }
}
