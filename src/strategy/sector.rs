use crate::config::TradingConfig;
use crate::models::{Candle, Direction};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Live tick-to-tick move that flips a sector ETF's status (percent)
const SECTOR_FLIP_PCT: f64 = 0.05;
/// Live tick-to-tick move that flips a Mag7 stock's status (percent)
const MAG7_FLIP_PCT: f64 = 0.1;
/// Backtest band around the 5-bar mean (fraction)
const HISTORICAL_BAND: f64 = 0.002;
const HISTORICAL_LOOKBACK: usize = 5;

/// Result of a market-breadth check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Alignment {
    pub aligned: bool,
    pub direction: Direction,
    /// Combined sector weight, or percent of Mag7 stocks agreeing
    pub strength: f64,
}

impl Alignment {
    pub fn none(strength: f64) -> Self {
        Self {
            aligned: false,
            direction: Direction::Neutral,
            strength,
        }
    }
}

fn classify_move(prev: f64, price: f64, flip_pct: f64) -> Direction {
    if prev <= 0.0 {
        return Direction::Neutral;
    }
    let pct_change = (price - prev) / prev * 100.0;
    if pct_change > flip_pct {
        Direction::Bullish
    } else if pct_change < -flip_pct {
        Direction::Bearish
    } else {
        Direction::Neutral
    }
}

/// Status at `idx` from close vs the mean of the 5 closes before it
pub fn historical_status(candles: &[Candle], idx: usize) -> Option<Direction> {
    if idx < HISTORICAL_LOOKBACK || candles.len() <= idx {
        return None;
    }
    let window = &candles[idx - HISTORICAL_LOOKBACK..idx];
    let avg = window.iter().map(|c| c.close).sum::<f64>() / HISTORICAL_LOOKBACK as f64;
    let price = candles[idx].close;

    Some(if price > avg * (1.0 + HISTORICAL_BAND) {
        Direction::Bullish
    } else if price < avg * (1.0 - HISTORICAL_BAND) {
        Direction::Bearish
    } else {
        Direction::Neutral
    })
}

/// Weighted agreement with the lead sector
///
/// The lead (heaviest) sector must have a bias, at least `min_aligned` sectors
/// including the lead must share it, and their combined weight must reach `threshold`.
/// A `min_aligned` of 1 leaves the weight as the only test.
fn weighted_alignment(
    statuses: &HashMap<String, Direction>,
    weights: &HashMap<String, f64>,
    lead: &str,
    threshold: f64,
    min_aligned: usize,
) -> Alignment {
    let lead_status = statuses.get(lead).copied().unwrap_or_default();
    if lead_status == Direction::Neutral {
        return Alignment::none(0.0);
    }

    let agreeing: Vec<&String> = statuses
        .iter()
        .filter(|(sector, status)| sector.as_str() != lead && **status == lead_status)
        .map(|(sector, _)| sector)
        .collect();

    let weight = weights.get(lead).copied().unwrap_or(0.0)
        + agreeing
            .iter()
            .map(|s| weights.get(s.as_str()).copied().unwrap_or(0.0))
            .sum::<f64>();

    if agreeing.len() + 1 >= min_aligned && weight >= threshold {
        Alignment {
            aligned: true,
            direction: lead_status,
            strength: weight,
        }
    } else {
        Alignment::none(weight)
    }
}

fn lead_sector(weights: &HashMap<String, f64>) -> String {
    weights
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(sector, _)| sector.clone())
        .unwrap_or_else(|| "XLK".to_string())
}

#[derive(Debug, Clone)]
struct Quote {
    price: f64,
    status: Direction,
    updated: DateTime<Utc>,
}

/// Tracks sector ETF direction from streaming prices
#[derive(Debug, Clone)]
pub struct SectorTracker {
    sectors: Vec<String>,
    weights: HashMap<String, f64>,
    lead: String,
    threshold: f64,
    min_aligned: usize,
    quotes: HashMap<String, Quote>,
}

impl SectorTracker {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            sectors: config.sector_etfs.clone(),
            weights: config.sector_weights.clone(),
            lead: lead_sector(&config.sector_weights),
            threshold: config.sector_weight_threshold,
            min_aligned: config.min_sectors_aligned,
            quotes: HashMap::new(),
        }
    }

    pub fn tracks(&self, symbol: &str) -> bool {
        self.sectors.iter().any(|s| s == symbol)
    }

    /// Record a price; status compares against the previous price
    pub fn update(&mut self, symbol: &str, price: f64, at: DateTime<Utc>) -> Option<Direction> {
        if !self.tracks(symbol) || price <= 0.0 {
            return None;
        }

        let status = self
            .quotes
            .get(symbol)
            .map(|q| classify_move(q.price, price, SECTOR_FLIP_PCT))
            .unwrap_or(Direction::Neutral);

        if let Some(prev) = self.quotes.get(symbol) {
            if prev.status != status {
                tracing::debug!("Sector {} status {} -> {} at {:.2}", symbol, prev.status, status, price);
            }
        }

        self.quotes.insert(
            symbol.to_string(),
            Quote {
                price,
                status,
                updated: at,
            },
        );
        Some(status)
    }

    pub fn status(&self, symbol: &str) -> Direction {
        self.quotes.get(symbol).map(|q| q.status).unwrap_or_default()
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.quotes.get(symbol).map(|q| q.price)
    }

    pub fn check_alignment(&self) -> Alignment {
        let statuses: HashMap<String, Direction> = self
            .quotes
            .iter()
            .map(|(s, q)| (s.clone(), q.status))
            .collect();
        // Live alignment always needs a second sector beside the lead
        weighted_alignment(
            &statuses,
            &self.weights,
            &self.lead,
            self.threshold,
            self.min_aligned.max(2),
        )
    }

    /// Every sector has a price
    pub fn all_present(&self) -> bool {
        self.sectors.iter().all(|s| self.quotes.contains_key(s))
    }

    /// Sectors with no update within `max_age`
    pub fn stale_sectors(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        self.sectors
            .iter()
            .filter(|s| {
                self.quotes
                    .get(s.as_str())
                    .map_or(true, |q| now - q.updated > max_age)
            })
            .cloned()
            .collect()
    }

    /// Alignment at bar `idx` of historical sector series
    ///
    /// Only the weight threshold applies here, no minimum sector count.
    pub fn alignment_at(&self, series: &HashMap<String, Vec<Candle>>, idx: usize) -> Alignment {
        let statuses: HashMap<String, Direction> = series
            .iter()
            .filter_map(|(sector, candles)| {
                historical_status(candles, idx).map(|status| (sector.clone(), status))
            })
            .collect();
        weighted_alignment(&statuses, &self.weights, &self.lead, self.threshold, 1)
    }
}

/// Breakdown of the Mag7 breadth reading
#[derive(Debug, Clone, Serialize)]
pub struct Mag7Info {
    pub alignment: Alignment,
    pub threshold: f64,
    pub bullish: Vec<String>,
    pub bearish: Vec<String>,
    pub neutral: Vec<String>,
    pub prices: HashMap<String, f64>,
}

/// Tracks how many of the seven mega-cap stocks lean the same way
#[derive(Debug, Clone)]
pub struct Mag7Tracker {
    stocks: Vec<String>,
    threshold: f64,
    statuses: HashMap<String, Direction>,
    prices: HashMap<String, f64>,
}

impl Mag7Tracker {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            stocks: config.mag7_stocks.clone(),
            threshold: config.mag7_threshold,
            statuses: HashMap::new(),
            prices: HashMap::new(),
        }
    }

    pub fn tracks(&self, symbol: &str) -> bool {
        self.stocks.iter().any(|s| s == symbol)
    }

    pub fn update(&mut self, symbol: &str, price: f64) -> Option<Direction> {
        if !self.tracks(symbol) || price <= 0.0 {
            return None;
        }
        let prev = self.prices.get(symbol).copied().unwrap_or(price);
        let status = classify_move(prev, price, MAG7_FLIP_PCT);

        self.statuses.insert(symbol.to_string(), status);
        self.prices.insert(symbol.to_string(), price);
        Some(status)
    }

    fn breadth(&self, statuses: &HashMap<String, Direction>) -> Alignment {
        let total = self.stocks.len().max(1) as f64;
        let count = |d: Direction| statuses.values().filter(|s| **s == d).count() as f64;
        let bullish_pct = count(Direction::Bullish) / total * 100.0;
        let bearish_pct = count(Direction::Bearish) / total * 100.0;

        if bullish_pct >= self.threshold {
            Alignment {
                aligned: true,
                direction: Direction::Bullish,
                strength: bullish_pct,
            }
        } else if bearish_pct >= self.threshold {
            Alignment {
                aligned: true,
                direction: Direction::Bearish,
                strength: bearish_pct,
            }
        } else {
            Alignment::none(bullish_pct.max(bearish_pct))
        }
    }

    pub fn check_alignment(&self) -> Alignment {
        self.breadth(&self.statuses)
    }

    pub fn stocks_with_status(&self, status: Direction) -> Vec<String> {
        self.stocks
            .iter()
            .filter(|s| self.statuses.get(s.as_str()).copied().unwrap_or_default() == status)
            .cloned()
            .collect()
    }

    pub fn alignment_info(&self) -> Mag7Info {
        Mag7Info {
            alignment: self.check_alignment(),
            threshold: self.threshold,
            bullish: self.stocks_with_status(Direction::Bullish),
            bearish: self.stocks_with_status(Direction::Bearish),
            neutral: self.stocks_with_status(Direction::Neutral),
            prices: self.prices.clone(),
        }
    }

    /// Alignment at bar `idx` of historical Mag7 series
    pub fn alignment_at(&self, series: &HashMap<String, Vec<Candle>>, idx: usize) -> Alignment {
        if idx < HISTORICAL_LOOKBACK {
            return Alignment::none(0.0);
        }
        let statuses: HashMap<String, Direction> = series
            .iter()
            .filter(|(symbol, _)| self.tracks(symbol))
            .filter_map(|(symbol, candles)| {
                historical_status(candles, idx).map(|status| (symbol.clone(), status))
            })
            .collect();
        self.breadth(&statuses)
    }
}
