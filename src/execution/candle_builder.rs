use crate::models::{Candle, QuoteEvent, TradeEvent};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

pub const DEFAULT_PERIODS: [u32; 5] = [1, 2, 3, 5, 15];
pub const MAX_COMPLETED_CANDLES: usize = 100;

type CandleKey = (String, u32);

#[derive(Default)]
struct BuilderState {
    current: HashMap<CandleKey, Candle>,
    completed: HashMap<CandleKey, VecDeque<Candle>>,
    last_prices: HashMap<String, f64>,
}

/// Thread-safe tick-to-candle aggregator
///
/// Builds candles for every configured period from trades and quotes.
/// Completed candles are kept in a rolling history per (symbol, period) and,
/// when a channel is attached, forwarded to the consumer (e.g. the Redis writer).
#[derive(Clone)]
pub struct CandleBuilder {
    state: Arc<RwLock<BuilderState>>,
    periods: Vec<u32>,
    max_completed: usize,
    completed_tx: Option<mpsc::UnboundedSender<Candle>>,
}

/// Floor a timestamp to the start of its `period_minutes` bucket
pub fn bucket_start(at: DateTime<Utc>, period_minutes: u32) -> Result<DateTime<Utc>, String> {
    let period_secs = i64::from(period_minutes.max(1)) * 60;
    let secs = at.timestamp();
    let start = secs - secs.rem_euclid(period_secs);

    Utc.timestamp_opt(start, 0)
        .single()
        .ok_or_else(|| format!("Invalid bucket start for {}", at))
}

impl CandleBuilder {
    /// Create a new candle builder
    ///
    /// # Arguments
    /// * `periods` - Candle periods in minutes
    pub fn new(periods: &[u32]) -> Self {
        Self {
            state: Arc::new(RwLock::new(BuilderState::default())),
            periods: periods.to_vec(),
            max_completed: MAX_COMPLETED_CANDLES,
            completed_tx: None,
        }
    }

    /// Builder with the standard 1/2/3/5/15 minute periods and a completion channel
    pub fn with_completion_channel() -> (Self, mpsc::UnboundedReceiver<Candle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut builder = Self::new(&DEFAULT_PERIODS);
        builder.completed_tx = Some(tx);
        (builder, rx)
    }

    pub fn periods(&self) -> &[u32] {
        &self.periods
    }

    /// Feed a trade; its size counts as volume
    pub fn process_trade(&self, trade: &TradeEvent) -> Result<Vec<Candle>, String> {
        if trade.symbol.is_empty() || trade.price <= 0.0 {
            return Ok(Vec::new());
        }
        self.process_tick(&trade.symbol, trade.price, trade.size, trade.time)
    }

    /// Feed a quote; the mid (or the live side) updates prices without volume
    pub fn process_quote(&self, quote: &QuoteEvent) -> Result<Vec<Candle>, String> {
        match quote.price() {
            Some(price) if !quote.symbol.is_empty() => {
                self.process_tick(&quote.symbol, price, 0.0, quote.time)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Apply one price update to every period, returning candles it completed
    pub fn process_tick(
        &self,
        symbol: &str,
        price: f64,
        volume: f64,
        at: DateTime<Utc>,
    ) -> Result<Vec<Candle>, String> {
        let mut state = self.state.write().map_err(|e| e.to_string())?;
        state.last_prices.insert(symbol.to_string(), price);

        let mut completed = Vec::new();

        for &period in &self.periods {
            let key = (symbol.to_string(), period);

            let expired = state.current.get(&key).map(|c| at >= c.end_time);

            match expired {
                Some(false) => {
                    if let Some(candle) = state.current.get_mut(&key) {
                        candle.apply_tick(price, volume, at);
                    }
                }
                Some(true) => {
                    if let Some(done) = state.current.remove(&key) {
                        completed.push(done.clone());
                        self.archive(&mut state, key.clone(), done);
                    }
                }
                None => {}
            }

            if !state.current.contains_key(&key) {
                let start = bucket_start(at, period)?;
                let mut candle = Candle::open_at(symbol, period, start, price, volume);
                candle.last_update = at;
                state.current.insert(key, candle);
            }
        }

        Ok(completed)
    }

    /// Complete every open candle whose end time has passed
    ///
    /// Run on a short interval so quiet symbols still roll over.
    pub fn check_completed_candles(&self, now: DateTime<Utc>) -> Result<Vec<Candle>, String> {
        let mut state = self.state.write().map_err(|e| e.to_string())?;

        let expired: Vec<CandleKey> = state
            .current
            .iter()
            .filter(|(_, candle)| now >= candle.end_time)
            .map(|(key, _)| key.clone())
            .collect();

        let mut completed = Vec::new();
        for key in expired {
            if let Some(candle) = state.current.remove(&key) {
                completed.push(candle.clone());
                self.archive(&mut state, key, candle);
            }
        }

        if !completed.is_empty() {
            tracing::debug!("Swept {} expired candles", completed.len());
        }

        Ok(completed)
    }

    fn archive(&self, state: &mut BuilderState, key: CandleKey, candle: Candle) {
        if let Some(tx) = &self.completed_tx {
            if tx.send(candle.clone()).is_err() {
                tracing::warn!("Candle consumer dropped, {} {}m not forwarded", key.0, key.1);
            }
        }

        let history = state.completed.entry(key).or_default();
        history.push_back(candle);
        while history.len() > self.max_completed {
            history.pop_front();
        }
    }

    /// Preload completed candles (oldest first), e.g. from Redis at startup
    pub fn seed_history(&self, symbol: &str, period: u32, candles: Vec<Candle>) -> Result<(), String> {
        let mut state = self.state.write().map_err(|e| e.to_string())?;
        let history = state.completed.entry((symbol.to_string(), period)).or_default();

        for candle in candles {
            history.push_back(candle);
        }
        while history.len() > self.max_completed {
            history.pop_front();
        }

        Ok(())
    }

    /// The in-progress candle for a symbol and period
    pub fn get_current_candle(&self, symbol: &str, period: u32) -> Result<Option<Candle>, String> {
        let state = self.state.read().map_err(|e| e.to_string())?;
        Ok(state.current.get(&(symbol.to_string(), period)).cloned())
    }

    /// Up to `count` completed candles, most recent first
    pub fn get_candle_history(
        &self,
        symbol: &str,
        period: u32,
        count: usize,
    ) -> Result<Vec<Candle>, String> {
        let state = self.state.read().map_err(|e| e.to_string())?;

        Ok(state
            .completed
            .get(&(symbol.to_string(), period))
            .map(|deque| deque.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }

    /// All completed candles, oldest first (the order indicators expect)
    pub fn get_candles(&self, symbol: &str, period: u32) -> Result<Vec<Candle>, String> {
        let state = self.state.read().map_err(|e| e.to_string())?;

        Ok(state
            .completed
            .get(&(symbol.to_string(), period))
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn candle_count(&self, symbol: &str, period: u32) -> Result<usize, String> {
        let state = self.state.read().map_err(|e| e.to_string())?;
        Ok(state
            .completed
            .get(&(symbol.to_string(), period))
            .map(|d| d.len())
            .unwrap_or(0))
    }

    pub fn last_price(&self, symbol: &str) -> Result<Option<f64>, String> {
        let state = self.state.read().map_err(|e| e.to_string())?;
        Ok(state.last_prices.get(symbol).copied())
    }

    /// Drop all open and completed candles
    pub fn reset(&self) -> Result<(), String> {
        let mut state = self.state.write().map_err(|e| e.to_string())?;
        *state = BuilderState::default();
        Ok(())
    }
}
