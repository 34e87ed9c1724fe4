use crate::backtest::engine::BacktestData;
use crate::models::{Candle, Direction};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Intraday market shapes for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady drift up with small noise
    Uptrend,
    /// Steady drift down with small noise
    Downtrend,
    /// Mean-reverting chop around the base price
    Sideways,
    /// Trend, then a low-volume coil, then a high-volume break in `Direction`
    CoilBreakout(Direction),
}

/// Generates synthetic intraday bars for backtesting
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 450.0,
            base_volume: 50_000.0,
        }
    }

    pub fn with_base_price(mut self, base_price: f64) -> Self {
        self.base_price = base_price;
        self
    }

    /// Generate bars for one scenario
    ///
    /// # Arguments
    /// * `symbol` - Symbol stamped on every bar
    /// * `scenario` - The market shape to simulate
    /// * `num_candles` - Number of bars
    /// * `period_minutes` - Bar length (1 or 5 for the live strategy)
    /// * `start` - Start time of the first bar
    pub fn generate(
        &mut self,
        symbol: &str,
        scenario: MarketScenario,
        num_candles: usize,
        period_minutes: u32,
        start: DateTime<Utc>,
    ) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(num_candles);
        let mut price = self.base_price;
        let coil_start = num_candles * 2 / 5;
        let breakout_start = num_candles * 7 / 10;

        for i in 0..num_candles {
            let timestamp = start + Duration::minutes(i as i64 * period_minutes as i64);
            let open = price;

            let (change_pct, wick_pct, volume_factor) = match scenario {
                MarketScenario::Uptrend => (0.0008 + self.noise(0.0006), 0.0008, 1.0),
                MarketScenario::Downtrend => (-0.0008 + self.noise(0.0006), 0.0008, 1.0),
                MarketScenario::Sideways => {
                    let reversion = (self.base_price - price) / price * 0.1;
                    (reversion + self.noise(0.003), 0.001, 1.0)
                }
                MarketScenario::CoilBreakout(direction) => {
                    let sign = if direction == Direction::Bearish { -1.0 } else { 1.0 };
                    if i < coil_start {
                        (sign * 0.001 + self.noise(0.002), 0.002, 1.0)
                    } else if i < breakout_start {
                        (self.noise(0.0002), 0.0001, 0.4)
                    } else {
                        (sign * 0.003 + self.noise(0.0005), 0.0003, 2.0)
                    }
                }
            };

            price *= 1.0 + change_pct;
            candles.push(self.create_candle(symbol, period_minutes, timestamp, open, price, wick_pct, volume_factor));
        }

        candles
    }

    /// Primary series plus sector and Mag7 series trending the same way
    ///
    /// Sector weights and symbols come from the caller so the series line up
    /// with whatever breadth configuration the engine runs with.
    pub fn generate_market(
        &mut self,
        symbol: &str,
        direction: Direction,
        sectors: &[String],
        mag7: &[String],
        num_candles: usize,
        period_minutes: u32,
        start: DateTime<Utc>,
    ) -> BacktestData {
        let candles = self.generate(
            symbol,
            MarketScenario::CoilBreakout(direction),
            num_candles,
            period_minutes,
            start,
        );

        let breadth = match direction {
            Direction::Bearish => MarketScenario::Downtrend,
            Direction::Bullish => MarketScenario::Uptrend,
            Direction::Neutral => MarketScenario::Sideways,
        };

        let mut series_for = |symbols: &[String]| -> HashMap<String, Vec<Candle>> {
            symbols
                .iter()
                .map(|s| (s.clone(), self.generate(s, breadth, num_candles, period_minutes, start)))
                .collect()
        };

        let sector_series = series_for(sectors);
        let mag7_series = series_for(mag7);

        BacktestData {
            symbol: symbol.to_string(),
            candles,
            sectors: sector_series,
            mag7: mag7_series,
        }
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        self.rng.gen_range(-amplitude..=amplitude)
    }

    /// Bar from open and close with random wicks beyond the body
    #[allow(clippy::too_many_arguments)]
    fn create_candle(
        &mut self,
        symbol: &str,
        period_minutes: u32,
        timestamp: DateTime<Utc>,
        open: f64,
        close: f64,
        wick_pct: f64,
        volume_factor: f64,
    ) -> Candle {
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..=wick_pct));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..=wick_pct));
        // Vary volume ±30%
        let volume = self.base_volume * volume_factor * self.rng.gen_range(0.7..1.3);

        let mut candle = Candle::open_at(symbol, period_minutes, timestamp, open, volume);
        candle.high = high;
        candle.low = low;
        candle.close = close;
        candle.last_update = candle.end_time;
        candle
    }
}
