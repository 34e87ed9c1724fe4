use crate::backtest::metrics::{
    pnl_pct, BacktestReport, MethodMetrics, SignalCounts, SimulatedExit, TradeRecord,
};
use crate::config::{TradingConfig, TrailingStopMethod};
use crate::indicators::{
    calculate_atr_series, ema_series, heikin_ashi, stochastic_series, vwap_series, HaCandle,
    Stochastic,
};
use crate::models::{Candle, Direction};
use crate::risk::stops::{ratchet, ATR_PERIOD, TRAIL_ATR_MULTIPLE, TRAIL_EMA_PERIOD, TRAIL_PERCENT};
use crate::strategy::{detect_compression_at, Alignment, Mag7Tracker, SectorTracker};
use anyhow::{bail, Result};
use std::collections::HashMap;

pub const INITIAL_EQUITY: f64 = 10.0;
pub const MAX_WARMUP_BARS: usize = 30;
pub const MAX_TRADE_BARS: usize = 30;
/// Absolute wick tolerance for the backtest Heikin Ashi entry trigger
const ENTRY_HA_TOLERANCE: f64 = 0.0001;
/// Fixed-point trail distance on the underlying, in dollars
const BACKTEST_TRAIL_POINTS: f64 = 1.0;

/// Historical bars for one backtest run
#[derive(Debug, Clone, Default)]
pub struct BacktestData {
    pub symbol: String,
    /// Primary series, oldest first
    pub candles: Vec<Candle>,
    /// Sector ETF series keyed by symbol, index-aligned with `candles`
    pub sectors: HashMap<String, Vec<Candle>>,
    /// Mag7 series keyed by symbol, index-aligned with `candles`
    pub mag7: HashMap<String, Vec<Candle>>,
}

impl BacktestData {
    /// Add a breadth series, re-indexed onto the primary bars
    pub fn add_sector(&mut self, symbol: &str, candles: &[Candle]) {
        if let Some(aligned) = align_series(&self.candles, candles) {
            self.sectors.insert(symbol.to_string(), aligned);
        }
    }

    pub fn add_mag7(&mut self, symbol: &str, candles: &[Candle]) {
        if let Some(aligned) = align_series(&self.candles, candles) {
            self.mag7.insert(symbol.to_string(), aligned);
        }
    }
}

/// One `other` bar per `primary` bar, matched on start time
///
/// Gaps carry the last seen bar forward; bars before the first match use the
/// earliest `other` bar. None when `other` is empty.
pub fn align_series(primary: &[Candle], other: &[Candle]) -> Option<Vec<Candle>> {
    let first = other.first()?;
    let by_start: HashMap<_, &Candle> = other.iter().map(|c| (c.start_time, c)).collect();

    let mut last = first;
    Some(
        primary
            .iter()
            .map(|p| {
                if let Some(found) = by_start.get(&p.start_time) {
                    last = found;
                }
                last.clone()
            })
            .collect(),
    )
}

/// Indicator columns over the primary series
#[derive(Debug, Clone)]
pub struct SeriesIndicators {
    pub ha: Vec<HaCandle>,
    /// EMA(9), the EMA trail
    pub ema_stop: Vec<f64>,
    /// EMA(ema_value), the trend filter
    pub ema_trend: Vec<f64>,
    pub vwap: Vec<f64>,
    pub stoch: Vec<Option<Stochastic>>,
    pub atr: Vec<Option<f64>>,
}

impl SeriesIndicators {
    pub fn compute(candles: &[Candle], config: &TradingConfig) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        Self {
            ha: heikin_ashi(candles),
            ema_stop: ema_series(&closes, TRAIL_EMA_PERIOD),
            ema_trend: ema_series(&closes, config.ema_value),
            vwap: vwap_series(candles),
            stoch: stochastic_series(
                candles,
                config.stochastic_k_period,
                config.stochastic_d_period,
                config.stochastic_smooth,
            ),
            atr: calculate_atr_series(candles, ATR_PERIOD),
        }
    }
}

/// Where and why a simulated trade ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitPoint {
    pub exit_idx: usize,
    pub exit_price: f64,
    pub exit: SimulatedExit,
}

/// Bars skipped before signals are checked
pub fn warmup_bars(len: usize) -> usize {
    MAX_WARMUP_BARS.min(len / 10)
}

/// Flat-bottomed rising HA bar is bullish, flat-topped falling bar bearish
pub fn entry_signal(bar: &HaCandle) -> Direction {
    if (bar.open - bar.low).abs() < ENTRY_HA_TOLERANCE && bar.close > bar.open {
        Direction::Bullish
    } else if (bar.open - bar.high).abs() < ENTRY_HA_TOLERANCE && bar.close < bar.open {
        Direction::Bearish
    } else {
        Direction::Neutral
    }
}

/// Stop level the method asks for at bar `idx`
///
/// Used both for the initial stop and as the trailing candidate.
fn stop_candidate(
    candles: &[Candle],
    indicators: &SeriesIndicators,
    idx: usize,
    direction: Direction,
    method: TrailingStopMethod,
) -> Option<f64> {
    let long = direction != Direction::Bearish;
    let price = candles[idx].close;

    match method {
        TrailingStopMethod::HeikinAshiCandle => {
            let prev = &candles[idx.saturating_sub(1)];
            Some(if long { prev.low } else { prev.high })
        }
        TrailingStopMethod::Ema => indicators.ema_stop.get(idx).copied(),
        TrailingStopMethod::Atr => indicators.atr[idx].map(|atr| {
            if long {
                price - atr * TRAIL_ATR_MULTIPLE
            } else {
                price + atr * TRAIL_ATR_MULTIPLE
            }
        }),
        TrailingStopMethod::PercentPrice => Some(if long {
            price * (1.0 - TRAIL_PERCENT / 100.0)
        } else {
            price * (1.0 + TRAIL_PERCENT / 100.0)
        }),
        TrailingStopMethod::FixedPoint => Some(if long {
            price - BACKTEST_TRAIL_POINTS
        } else {
            price + BACKTEST_TRAIL_POINTS
        }),
    }
}

/// Replays the Jigsaw checklist over historical bars and scores every trailing method
pub struct BacktestEngine {
    config: TradingConfig,
    sectors: SectorTracker,
    mag7: Mag7Tracker,
    initial_equity: f64,
}

impl BacktestEngine {
    pub fn new(config: TradingConfig) -> Self {
        Self {
            sectors: SectorTracker::new(&config),
            mag7: Mag7Tracker::new(&config),
            config,
            initial_equity: INITIAL_EQUITY,
        }
    }

    pub fn with_initial_equity(mut self, initial_equity: f64) -> Self {
        self.initial_equity = initial_equity;
        self
    }

    fn alignment_at(&self, data: &BacktestData, idx: usize) -> Alignment {
        if self.config.use_mag7_confirmation && !data.mag7.is_empty() {
            self.mag7.alignment_at(&data.mag7, idx)
        } else {
            self.sectors.alignment_at(&data.sectors, idx)
        }
    }

    /// Direction to trade at bar `idx`, or None if any step of the checklist fails
    pub fn entry_direction(
        &self,
        data: &BacktestData,
        indicators: &SeriesIndicators,
        idx: usize,
        counts: &mut SignalCounts,
    ) -> Option<Direction> {
        let candles = &data.candles;

        let alignment = self.alignment_at(data, idx);
        if !alignment.aligned {
            return None;
        }
        counts.sector_aligned += 1;
        let direction = alignment.direction;

        let compression = detect_compression_at(candles, idx, &self.config);
        if compression.is_compressed() {
            counts.compression += 1;
        }
        if !compression.confirms(direction) {
            return None;
        }

        let stoch = indicators.stoch[idx]?;
        let momentum = match direction {
            Direction::Bullish => stoch.k > self.config.stoch_bullish_threshold,
            Direction::Bearish => stoch.k < self.config.stoch_bearish_threshold,
            Direction::Neutral => false,
        };
        if !momentum {
            return None;
        }
        counts.momentum_aligned += 1;

        let close = candles[idx].close;
        let (vwap, ema) = (indicators.vwap[idx], indicators.ema_trend[idx]);
        let trend = match direction {
            Direction::Bullish => close > vwap && close > ema,
            Direction::Bearish => close < vwap && close < ema,
            Direction::Neutral => false,
        };
        if !trend {
            return None;
        }
        counts.trend_aligned += 1;

        let signal = entry_signal(&indicators.ha[idx]);
        if signal != Direction::Neutral {
            counts.entry_signals += 1;
        }
        (signal == direction).then_some(direction)
    }

    /// Follow a trade entered at the close of bar `start` for up to 30 bars
    pub fn simulate_trade(
        &self,
        candles: &[Candle],
        indicators: &SeriesIndicators,
        start: usize,
        direction: Direction,
        method: TrailingStopMethod,
    ) -> ExitPoint {
        let len = candles.len();
        let max_bars = MAX_TRADE_BARS.min(len - start);
        let long = direction != Direction::Bearish;
        let entry_price = candles[start].close;

        let mut stop = stop_candidate(candles, indicators, start, direction, method)
            .unwrap_or_else(|| {
                stop_candidate(candles, indicators, start, direction, TrailingStopMethod::PercentPrice)
                    .unwrap_or(entry_price)
            });
        let mut max_profit = 0.0;

        for i in start + 1..start + max_bars {
            let bar = &candles[i];
            let price = bar.close;

            if (long && bar.low <= stop) || (!long && bar.high >= stop) {
                return ExitPoint {
                    exit_idx: i,
                    exit_price: stop,
                    exit: SimulatedExit::StopLoss,
                };
            }

            let profit = if long {
                price - entry_price
            } else {
                entry_price - price
            };
            if profit > max_profit {
                max_profit = profit;
                if let Some(tighter) = stop_candidate(candles, indicators, i, direction, method)
                    .and_then(|candidate| ratchet(direction, stop, candidate))
                {
                    stop = tighter;
                }
            }

            let ha = &indicators.ha[i];
            if (long && ha.open > ha.close) || (!long && ha.open < ha.close) {
                return ExitPoint {
                    exit_idx: i,
                    exit_price: price,
                    exit: SimulatedExit::HeikinAshiReversal,
                };
            }

            if let Some(stoch) = indicators.stoch[i] {
                let crossed = if long {
                    stoch.k > self.config.stoch_exit_overbought && stoch.k < stoch.d
                } else {
                    stoch.k < self.config.stoch_exit_oversold && stoch.k > stoch.d
                };
                if crossed {
                    return ExitPoint {
                        exit_idx: i,
                        exit_price: price,
                        exit: SimulatedExit::StochasticCross,
                    };
                }
            }

            let (vwap, ema) = (indicators.vwap[i], indicators.ema_trend[i]);
            if (long && price < vwap.min(ema)) || (!long && price > vwap.max(ema)) {
                return ExitPoint {
                    exit_idx: i,
                    exit_price: price,
                    exit: SimulatedExit::TrendCross,
                };
            }
        }

        let exit_idx = if start + max_bars < len {
            start + max_bars - 1
        } else {
            len - 1
        };
        ExitPoint {
            exit_idx,
            exit_price: candles[exit_idx].close,
            exit: SimulatedExit::MaxBars,
        }
    }

    /// Run the checklist over every bar after warmup
    ///
    /// Each signal is simulated once per trailing method. The best of those
    /// trades compounds the shared equity that sizes the next signal.
    pub fn run(&self, data: &BacktestData) -> Result<BacktestReport> {
        let candles = &data.candles;
        let len = candles.len();
        if len < 2 {
            bail!("Not enough candles for backtest of {}: {}", data.symbol, len);
        }

        let indicators = SeriesIndicators::compute(candles, &self.config);
        let warmup = warmup_bars(len);

        tracing::info!(
            "Starting backtest for {}: {} bars, warmup {}",
            data.symbol,
            len,
            warmup
        );

        let mut counts = SignalCounts {
            bars_analyzed: len,
            ..Default::default()
        };
        let mut equity = self.initial_equity;
        let mut per_method: Vec<(TrailingStopMethod, Vec<TradeRecord>)> = TrailingStopMethod::ALL
            .iter()
            .map(|m| (*m, Vec::new()))
            .collect();
        let mut best_trades = Vec::new();

        for idx in warmup..len - 1 {
            let Some(direction) = self.entry_direction(data, &indicators, idx, &mut counts) else {
                continue;
            };
            counts.trades_entered += 1;

            let mut best: Option<TradeRecord> = None;
            for (method, trades) in per_method.iter_mut() {
                let exit = self.simulate_trade(candles, &indicators, idx, direction, *method);
                let pct = pnl_pct(direction, candles[idx].close, exit.exit_price);
                let trade = TradeRecord {
                    symbol: data.symbol.clone(),
                    method: *method,
                    direction,
                    entry_idx: idx,
                    entry_time: candles[idx].start_time,
                    entry_price: candles[idx].close,
                    exit_idx: exit.exit_idx,
                    exit_time: candles[exit.exit_idx].start_time,
                    exit_price: exit.exit_price,
                    exit: exit.exit,
                    pnl_pct: pct,
                    pnl_dollars: pct / 100.0 * equity,
                };

                tracing::debug!(
                    "{} {} {} @ {:.2} -> {:.2} ({}) {:+.2}%",
                    trade.entry_time,
                    method.label(),
                    direction,
                    trade.entry_price,
                    trade.exit_price,
                    trade.exit.description(direction),
                    pct
                );

                if best.as_ref().map_or(true, |b| trade.pnl_dollars > b.pnl_dollars) {
                    best = Some(trade.clone());
                }
                trades.push(trade);
            }

            if let Some(best) = best {
                equity += best.pnl_dollars;
                best_trades.push(best);
            }
        }

        let methods: Vec<MethodMetrics> = per_method
            .into_iter()
            .map(|(method, trades)| MethodMetrics::from_trades(method, trades, self.initial_equity))
            .collect();

        let mut best_method = None;
        let mut best_profit_factor = 0.0;
        for m in methods.iter().filter(|m| m.total_trades > 0) {
            if m.profit_factor > best_profit_factor {
                best_profit_factor = m.profit_factor;
                best_method = Some(m.method);
            }
        }

        tracing::info!(
            "Backtest {} complete: {} signals, equity ${:.2} -> ${:.2}",
            data.symbol,
            counts.trades_entered,
            self.initial_equity,
            equity
        );

        Ok(BacktestReport {
            symbol: data.symbol.clone(),
            initial_equity: self.initial_equity,
            final_equity: equity,
            counts,
            methods,
            best_method,
            trades: best_trades,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::synthetic::SyntheticDataGenerator;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(ohlc: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 11, 26, 14, 30, 0).unwrap();
        ohlc.iter()
            .enumerate()
            .map(|(i, (o, h, l, c))| {
                let mut candle =
                    Candle::open_at("SPY", 5, start + Duration::minutes(5 * i as i64), *o, 1000.0);
                candle.high = *h;
                candle.low = *l;
                candle.close = *c;
                candle
            })
            .collect()
    }

    /// Flat bars then one final bar
    fn flat_then(last: (f64, f64, f64, f64)) -> Vec<Candle> {
        let mut ohlc = vec![(100.0, 100.5, 99.5, 100.0); 6];
        ohlc.push(last);
        bars(&ohlc)
    }

    /// Each bar opens on the prior close, rises $1 and closes on its high
    fn staircase(n: usize) -> Vec<Candle> {
        let ohlc: Vec<_> = (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                (close - 1.0, close, close - 1.0, close)
            })
            .collect();
        bars(&ohlc)
    }

    fn engine() -> BacktestEngine {
        BacktestEngine::new(TradingConfig::default())
    }

    #[test]
    fn test_warmup_is_tenth_capped_at_thirty() {
        assert_eq!(warmup_bars(5), 0);
        assert_eq!(warmup_bars(100), 10);
        assert_eq!(warmup_bars(1000), 30);
    }

    #[test]
    fn test_entry_signal_needs_flat_wick() {
        let bullish = HaCandle { open: 100.0, high: 101.0, low: 100.0, close: 100.8 };
        let bearish = HaCandle { open: 100.0, high: 100.0, low: 99.0, close: 99.2 };
        let wicked = HaCandle { open: 100.0, high: 101.0, low: 99.9, close: 100.8 };

        assert_eq!(entry_signal(&bullish), Direction::Bullish);
        assert_eq!(entry_signal(&bearish), Direction::Bearish);
        assert_eq!(entry_signal(&wicked), Direction::Neutral);
    }

    #[test]
    fn test_stop_hit_exits_at_stop_price() {
        let candles = flat_then((100.0, 100.1, 98.9, 99.2));
        let indicators = SeriesIndicators::compute(&candles, &TradingConfig::default());

        let exit = engine().simulate_trade(
            &candles,
            &indicators,
            5,
            Direction::Bullish,
            TrailingStopMethod::FixedPoint,
        );

        assert_eq!(exit.exit, SimulatedExit::StopLoss);
        assert_eq!(exit.exit_idx, 6);
        assert!((exit.exit_price - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_heikin_ashi_reversal_exits_at_close() {
        // Stop at 99.0 survives, but the HA bar turns red
        let candles = flat_then((100.0, 100.1, 99.4, 99.4));
        let indicators = SeriesIndicators::compute(&candles, &TradingConfig::default());

        let exit = engine().simulate_trade(
            &candles,
            &indicators,
            5,
            Direction::Bullish,
            TrailingStopMethod::FixedPoint,
        );

        assert_eq!(exit.exit, SimulatedExit::HeikinAshiReversal);
        assert!((exit.exit_price - 99.4).abs() < 1e-9);
    }

    #[test]
    fn test_steady_trend_rides_to_max_bars() {
        let candles = staircase(40);
        let indicators = SeriesIndicators::compute(&candles, &TradingConfig::default());

        for method in TrailingStopMethod::ALL {
            let exit = engine().simulate_trade(&candles, &indicators, 5, Direction::Bullish, method);
            assert_eq!(exit.exit, SimulatedExit::MaxBars, "{}", method.label());
            assert_eq!(exit.exit_idx, 34);
            assert_eq!(exit.exit_price, candles[34].close);
        }
    }

    #[test]
    fn test_max_bars_clipped_at_end_of_data() {
        let candles = staircase(12);
        let indicators = SeriesIndicators::compute(&candles, &TradingConfig::default());

        let exit = engine().simulate_trade(
            &candles,
            &indicators,
            5,
            Direction::Bullish,
            TrailingStopMethod::PercentPrice,
        );
        assert_eq!(exit.exit, SimulatedExit::MaxBars);
        assert_eq!(exit.exit_idx, 11);
    }

    #[test]
    fn test_run_without_breadth_takes_no_trades() {
        let data = BacktestData {
            symbol: "SPY".to_string(),
            candles: staircase(60),
            ..Default::default()
        };

        let report = engine().run(&data).unwrap();
        assert_eq!(report.counts.bars_analyzed, 60);
        assert_eq!(report.counts.sector_aligned, 0);
        assert_eq!(report.counts.trades_entered, 0);
        assert_eq!(report.best_method, None);
        assert_eq!(report.final_equity, INITIAL_EQUITY);
        assert_eq!(report.methods.len(), 5);
    }

    #[test]
    fn test_run_bookkeeping_is_consistent() {
        let config = TradingConfig::default();
        let start = Utc.with_ymd_and_hms(2024, 11, 26, 14, 30, 0).unwrap();
        let data = SyntheticDataGenerator::new(11).generate_market(
            "SPY",
            Direction::Bullish,
            &config.sector_etfs,
            &config.mag7_stocks,
            300,
            5,
            start,
        );

        let report = BacktestEngine::new(config).run(&data).unwrap();

        assert_eq!(report.trades.len(), report.counts.trades_entered);
        for m in &report.methods {
            assert_eq!(m.total_trades, report.counts.trades_entered);
            assert_eq!(m.equity_curve.len(), m.total_trades + 1);
        }
        let compounded: f64 = report.trades.iter().map(|t| t.pnl_dollars).sum();
        assert!((report.final_equity - (INITIAL_EQUITY + compounded)).abs() < 1e-9);
        assert!(report.counts.sector_aligned >= report.counts.trades_entered);
    }

    #[test]
    fn test_align_series_forward_fills_gaps() {
        let primary = staircase(5);
        let other: Vec<Candle> = [0usize, 1, 3]
            .iter()
            .map(|&i| {
                let mut c = primary[i].clone();
                c.symbol = "XLK".to_string();
                c.close = 50.0 + i as f64;
                c
            })
            .collect();

        let aligned = align_series(&primary, &other).unwrap();
        let closes: Vec<f64> = aligned.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![50.0, 51.0, 51.0, 53.0, 53.0]);
        assert!(align_series(&primary, &[]).is_none());
    }

    #[test]
    fn test_run_rejects_tiny_series() {
        let data = BacktestData {
            symbol: "SPY".to_string(),
            candles: staircase(1),
            ..Default::default()
        };
        assert!(engine().run(&data).is_err());
    }
}
