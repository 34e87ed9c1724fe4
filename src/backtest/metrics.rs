use crate::config::TrailingStopMethod;
use crate::models::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a simulated trade ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulatedExit {
    StopLoss,
    HeikinAshiReversal,
    StochasticCross,
    TrendCross,
    MaxBars,
}

impl SimulatedExit {
    pub fn description(&self, direction: Direction) -> &'static str {
        match (self, direction) {
            (SimulatedExit::StopLoss, _) => "Stop loss hit",
            (SimulatedExit::HeikinAshiReversal, _) => "Heikin Ashi reversal",
            (SimulatedExit::StochasticCross, Direction::Bearish) => {
                "Stochastic oversold and crossing up"
            }
            (SimulatedExit::StochasticCross, _) => "Stochastic overbought and crossing down",
            (SimulatedExit::TrendCross, Direction::Bearish) => "Price crossed above VWAP and EMA",
            (SimulatedExit::TrendCross, _) => "Price crossed below VWAP and EMA",
            (SimulatedExit::MaxBars, _) => "Max bars reached",
        }
    }
}

/// Record of a single simulated trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub method: TrailingStopMethod,
    pub direction: Direction,
    pub entry_idx: usize,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_idx: usize,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit: SimulatedExit,
    /// Move in the trade's favour, percent of entry
    pub pnl_pct: f64,
    /// `pnl_pct` applied to the equity at entry
    pub pnl_dollars: f64,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.pnl_pct > 0.0
    }

    pub fn bars_held(&self) -> usize {
        self.exit_idx.saturating_sub(self.entry_idx)
    }
}

/// Percent move from entry to exit in the trade's favour
pub fn pnl_pct(direction: Direction, entry_price: f64, exit_price: f64) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    match direction {
        Direction::Bearish => (entry_price - exit_price) / entry_price * 100.0,
        _ => (exit_price - entry_price) / entry_price * 100.0,
    }
}

/// Largest peak-to-trough decline of an equity curve, in percent of the peak
pub fn max_drawdown_pct(equity_curve: &[f64]) -> f64 {
    let Some(&first) = equity_curve.first() else {
        return 0.0;
    };

    let mut peak = first;
    let mut max_dd = 0.0_f64;

    for &equity in equity_curve {
        if equity > peak {
            peak = equity;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak * 100.0);
        }
    }

    max_dd
}

/// Performance of one trailing-stop method over a backtest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodMetrics {
    pub method: TrailingStopMethod,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_profit: f64,
    /// Sum of losing trades as a positive number
    pub total_loss: f64,
    /// Profit / max(loss, 1)
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub final_equity: f64,
    pub equity_curve: Vec<f64>,
    pub trades: Vec<TradeRecord>,
}

impl MethodMetrics {
    /// Metrics from a method's trades in the order they were taken
    pub fn from_trades(
        method: TrailingStopMethod,
        trades: Vec<TradeRecord>,
        initial_equity: f64,
    ) -> Self {
        let mut equity_curve = Vec::with_capacity(trades.len() + 1);
        equity_curve.push(initial_equity);

        let mut total_profit = 0.0;
        let mut total_loss = 0.0;
        let mut winning_trades = 0;

        for trade in &trades {
            if trade.is_win() {
                winning_trades += 1;
                total_profit += trade.pnl_dollars;
            } else {
                total_loss += trade.pnl_dollars.abs();
            }
            let last = equity_curve.last().copied().unwrap_or(initial_equity);
            equity_curve.push(last + trade.pnl_dollars);
        }

        let total_trades = trades.len();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        Self {
            method,
            total_trades,
            winning_trades,
            losing_trades: total_trades - winning_trades,
            win_rate,
            total_profit,
            total_loss,
            profit_factor: total_profit / total_loss.max(1.0),
            max_drawdown_pct: max_drawdown_pct(&equity_curve),
            final_equity: equity_curve.last().copied().unwrap_or(initial_equity),
            equity_curve,
            trades,
        }
    }
}

/// How many bars passed each step of the entry checklist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalCounts {
    pub bars_analyzed: usize,
    pub sector_aligned: usize,
    pub compression: usize,
    pub momentum_aligned: usize,
    pub trend_aligned: usize,
    pub entry_signals: usize,
    pub trades_entered: usize,
}

/// Complete result of one backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub symbol: String,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub counts: SignalCounts,
    pub methods: Vec<MethodMetrics>,
    pub best_method: Option<TrailingStopMethod>,
    /// Best trade per signal, the one that compounds equity
    pub trades: Vec<TradeRecord>,
}

impl BacktestReport {
    pub fn method(&self, method: TrailingStopMethod) -> Option<&MethodMetrics> {
        self.methods.iter().find(|m| m.method == method)
    }

    pub fn total_return_pct(&self) -> f64 {
        if self.initial_equity > 0.0 {
            (self.final_equity - self.initial_equity) / self.initial_equity * 100.0
        } else {
            0.0
        }
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              BACKTEST PERFORMANCE REPORT              ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("📊 {} SUMMARY", self.symbol);
        println!("  Bars Analyzed:         {}", self.counts.bars_analyzed);
        println!("  Initial Equity:        ${:.2}", self.initial_equity);
        println!(
            "  Final Equity:          ${:.2} ({:+.2}%)",
            self.final_equity,
            self.total_return_pct()
        );

        println!("\n🔎 SIGNAL FUNNEL");
        println!("  Sector Aligned:        {}", self.counts.sector_aligned);
        println!("  Compression:           {}", self.counts.compression);
        println!("  Momentum Aligned:      {}", self.counts.momentum_aligned);
        println!("  Trend Aligned:         {}", self.counts.trend_aligned);
        println!("  Entry Signals:         {}", self.counts.entry_signals);
        println!("  Trades Entered:        {}", self.counts.trades_entered);

        println!("\n📈 TRAILING METHODS");
        for m in &self.methods {
            let marker = if Some(m.method) == self.best_method {
                "⭐"
            } else {
                "  "
            };
            println!(
                "{} {:<18} trades {:>3}  win {:>5.1}%  PF {:>6.2}  DD {:>5.2}%  equity ${:.2}",
                marker,
                m.method.label(),
                m.total_trades,
                m.win_rate,
                m.profit_factor,
                m.max_drawdown_pct,
                m.final_equity
            );
        }

        match self.best_method {
            Some(best) => println!("\n🏆 Best method: {}", best.label()),
            None => println!("\n⚠️  No method produced a profit"),
        }

        println!("\n═══════════════════════════════════════════════════════\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_trade(pnl_pct: f64, equity: f64) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            symbol: "SPY".to_string(),
            method: TrailingStopMethod::Atr,
            direction: Direction::Bullish,
            entry_idx: 10,
            entry_time: now,
            entry_price: 100.0,
            exit_idx: 14,
            exit_time: now + chrono::Duration::minutes(20),
            exit_price: 100.0 + pnl_pct,
            exit: SimulatedExit::MaxBars,
            pnl_pct,
            pnl_dollars: pnl_pct / 100.0 * equity,
        }
    }

    #[test]
    fn test_pnl_pct_by_direction() {
        assert!((pnl_pct(Direction::Bullish, 100.0, 102.0) - 2.0).abs() < 1e-9);
        assert!((pnl_pct(Direction::Bearish, 100.0, 102.0) + 2.0).abs() < 1e-9);
        assert_eq!(pnl_pct(Direction::Bullish, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_metrics_with_winning_trades() {
        let trades = vec![
            create_test_trade(10.0, 10.0),
            create_test_trade(5.0, 10.0),
            create_test_trade(-3.0, 10.0),
        ];

        let metrics = MethodMetrics::from_trades(TrailingStopMethod::Atr, trades, 10.0);

        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.winning_trades, 2);
        assert_eq!(metrics.losing_trades, 1);
        assert!((metrics.win_rate - 66.66).abs() < 0.1);
        assert!((metrics.final_equity - 11.2).abs() < 1e-9);
        assert_eq!(metrics.equity_curve.len(), 4);
    }

    #[test]
    fn test_profit_factor_floors_loss_at_one() {
        // $1.50 profit against $0.30 loss: the loss is floored at 1
        let trades = vec![create_test_trade(15.0, 10.0), create_test_trade(-3.0, 10.0)];
        let metrics = MethodMetrics::from_trades(TrailingStopMethod::Ema, trades, 10.0);
        assert!((metrics.profit_factor - 1.5).abs() < 1e-9);

        let trades = vec![create_test_trade(40.0, 10.0), create_test_trade(-20.0, 10.0)];
        let metrics = MethodMetrics::from_trades(TrailingStopMethod::Ema, trades, 10.0);
        assert!((metrics.profit_factor - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_with_no_trades() {
        let metrics = MethodMetrics::from_trades(TrailingStopMethod::FixedPoint, vec![], 10.0);
        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.profit_factor, 0.0);
        assert_eq!(metrics.final_equity, 10.0);
        assert_eq!(metrics.max_drawdown_pct, 0.0);
    }

    #[test]
    fn test_drawdown_from_peak() {
        // Peak 12, trough 9: 25% drawdown
        let dd = max_drawdown_pct(&[10.0, 12.0, 9.0, 11.0]);
        assert!((dd - 25.0).abs() < 1e-9);
        assert_eq!(max_drawdown_pct(&[10.0, 11.0, 12.0]), 0.0);
        assert_eq!(max_drawdown_pct(&[]), 0.0);
    }

    #[test]
    fn test_zero_pnl_counts_as_loss() {
        let metrics =
            MethodMetrics::from_trades(TrailingStopMethod::Atr, vec![create_test_trade(0.0, 10.0)], 10.0);
        assert_eq!(metrics.losing_trades, 1);
        assert_eq!(metrics.winning_trades, 0);
    }
}
