use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::api::BrokerPosition;
use crate::models::{Direction, ExitReason, OptionContract, OptionType};

/// Closed positions kept in memory
pub const MAX_HISTORY: usize = 100;
/// Closed positions included in an export
const EXPORT_HISTORY: usize = 50;
/// Option contract multiplier
pub const CONTRACT_MULTIPLIER: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// Long option position; the stop lives on the underlying
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionPosition {
    pub id: Uuid,
    pub symbol: String,
    pub underlying: String,
    pub direction: Direction,
    pub option_type: OptionType,
    pub quantity: u32,
    pub entry_price: f64,
    pub entry_underlying: f64,
    pub entry_time: DateTime<Utc>,
    pub current_price: f64,
    /// Underlying price that stops the trade out; 0 until one is assigned
    pub stop_level: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub pnl: f64,
    pub order_id: Option<String>,
    pub stop_order_id: Option<String>,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub last_update: DateTime<Utc>,
}

impl OptionPosition {
    pub fn new(
        contract: &OptionContract,
        quantity: u32,
        entry_price: f64,
        entry_underlying: f64,
        stop_level: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        let direction = match contract.option_type {
            OptionType::Call => Direction::Bullish,
            OptionType::Put => Direction::Bearish,
        };

        Self {
            id: Uuid::new_v4(),
            symbol: contract.symbol.clone(),
            underlying: contract.underlying.clone(),
            direction,
            option_type: contract.option_type,
            quantity,
            entry_price,
            entry_underlying,
            entry_time,
            current_price: entry_price,
            stop_level,
            highest_price: entry_price,
            lowest_price: entry_price,
            pnl: 0.0,
            order_id: None,
            stop_order_id: None,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            last_update: entry_time,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn has_stop(&self) -> bool {
        self.stop_level > 0.0
    }

    /// Dollar P&L at an option price
    pub fn calculate_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity as f64 * CONTRACT_MULTIPLIER
    }

    pub fn pnl_pct(&self) -> f64 {
        if self.entry_price > 0.0 {
            (self.current_price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        }
    }

    pub fn minutes_open(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_minutes()
    }

    /// Adopt an option position found at the broker but not tracked locally
    pub fn from_broker(position: &BrokerPosition, now: DateTime<Utc>) -> Option<Self> {
        let contract = OptionContract::from_occ(&position.symbol)?;
        let underlying = position
            .underlying_symbol
            .clone()
            .unwrap_or_else(|| contract.underlying.clone());
        let price = if position.close_price > 0.0 {
            position.close_price
        } else {
            position.average_open_price
        };

        let mut adopted = Self::new(
            &contract,
            position.quantity.abs().round() as u32,
            position.average_open_price,
            0.0,
            0.0,
            now,
        );
        adopted.underlying = underlying;
        adopted.current_price = price;
        adopted.highest_price = price.max(adopted.entry_price);
        adopted.lowest_price = price.min(adopted.entry_price);
        adopted.pnl = adopted.calculate_pnl(price);
        Some(adopted)
    }
}

/// Snapshot for the status log
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PositionSummary {
    pub open_positions: usize,
    pub calls: usize,
    pub puts: usize,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub win_rate: f64,
}

/// What a broker reconciliation changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub adopted: Vec<String>,
    pub closed: Vec<String>,
    pub updated: usize,
}

#[derive(Serialize)]
struct PositionExport<'a> {
    export_time: DateTime<Utc>,
    active_positions: Vec<&'a OptionPosition>,
    recent_history: Vec<&'a OptionPosition>,
}

/// Open option positions keyed by option symbol, plus recent closed history
#[derive(Debug, Default)]
pub struct PositionManager {
    positions: HashMap<String, OptionPosition>,
    history: VecDeque<OptionPosition>,
    realized_pnl: f64,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted positions (open ones become active, closed ones history)
    pub fn with_positions(positions: Vec<OptionPosition>) -> Self {
        let mut manager = Self::new();
        for position in positions {
            if position.is_open() {
                manager.positions.insert(position.symbol.clone(), position);
            } else {
                manager.realized_pnl += position.pnl;
                manager.push_history(position);
            }
        }

        tracing::info!(
            "Restored {} open positions from persistence (realized P&L: ${:.2})",
            manager.positions.len(),
            manager.realized_pnl
        );
        manager
    }

    fn push_history(&mut self, position: OptionPosition) {
        self.history.push_back(position);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    pub fn open_position(&mut self, position: OptionPosition) -> anyhow::Result<Uuid> {
        if self.positions.contains_key(&position.symbol) {
            anyhow::bail!("Already have open position for {}", position.symbol);
        }
        if self.has_position_for_underlying(&position.underlying) {
            anyhow::bail!("Already have open position on {}", position.underlying);
        }

        let id = position.id;
        tracing::info!(
            "Opened {} {} x{} @ ${:.2} (stop {:.2})",
            position.option_type.trade_label(),
            position.symbol,
            position.quantity,
            position.entry_price,
            position.stop_level
        );
        self.positions.insert(position.symbol.clone(), position);
        Ok(id)
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn has_position_for_underlying(&self, underlying: &str) -> bool {
        self.positions.values().any(|p| p.underlying == underlying)
    }

    pub fn get_position(&self, symbol: &str) -> Option<&OptionPosition> {
        self.positions.get(symbol)
    }

    fn get_position_mut(&mut self, symbol: &str) -> anyhow::Result<&mut OptionPosition> {
        self.positions
            .get_mut(symbol)
            .ok_or_else(|| anyhow::anyhow!("No open position for {}", symbol))
    }

    pub fn open_positions(&self) -> Vec<&OptionPosition> {
        self.positions.values().collect()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Underlyings that already have a trade on
    pub fn active_underlyings(&self) -> HashSet<String> {
        self.positions.values().map(|p| p.underlying.clone()).collect()
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &OptionPosition> {
        self.history.iter()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.pnl).sum()
    }

    /// Mark an option price; returns the new unrealized P&L
    pub fn update_price(&mut self, symbol: &str, price: f64) -> anyhow::Result<f64> {
        self.update_price_at(symbol, price, Utc::now())
    }

    pub fn update_price_at(
        &mut self,
        symbol: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<f64> {
        let position = self.get_position_mut(symbol)?;
        position.current_price = price;
        position.highest_price = position.highest_price.max(price);
        position.lowest_price = position.lowest_price.min(price);
        position.pnl = position.calculate_pnl(price);
        position.last_update = at;
        Ok(position.pnl)
    }

    pub fn update_stop(&mut self, symbol: &str, stop_level: f64) -> anyhow::Result<()> {
        let position = self.get_position_mut(symbol)?;
        tracing::debug!(
            "Stop for {} moved {:.2} -> {:.2}",
            symbol,
            position.stop_level,
            stop_level
        );
        position.stop_level = stop_level;
        Ok(())
    }

    pub fn set_stop_order(&mut self, symbol: &str, order_id: Option<String>) -> anyhow::Result<()> {
        self.get_position_mut(symbol)?.stop_order_id = order_id;
        Ok(())
    }

    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
    ) -> anyhow::Result<OptionPosition> {
        self.close_position_at(symbol, exit_price, reason, Utc::now())
    }

    /// Close and move to history; returns the closed position
    pub fn close_position_at(
        &mut self,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> anyhow::Result<OptionPosition> {
        let mut position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| anyhow::anyhow!("No open position for {}", symbol))?;

        position.current_price = exit_price;
        position.pnl = position.calculate_pnl(exit_price);
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(at);
        position.exit_reason = Some(reason);
        position.last_update = at;

        self.realized_pnl += position.pnl;
        tracing::info!(
            "Closed {} @ ${:.2}: {} (P&L ${:.2})",
            symbol,
            exit_price,
            reason,
            position.pnl
        );

        self.push_history(position.clone());
        Ok(position)
    }

    /// Reconcile with the broker's positions
    ///
    /// Untracked option positions are adopted; tracked ones the broker no longer
    /// holds are closed at their last price with `ExitReason::BrokerSync`.
    pub fn sync_with_broker(
        &mut self,
        broker_positions: &[BrokerPosition],
        now: DateTime<Utc>,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        let mut at_broker = HashSet::new();

        for broker in broker_positions.iter().filter(|p| !p.is_short()) {
            at_broker.insert(broker.symbol.clone());

            if let Some(position) = self.positions.get_mut(&broker.symbol) {
                if broker.close_price > 0.0 {
                    position.current_price = broker.close_price;
                    position.pnl = position.calculate_pnl(broker.close_price);
                }
                position.quantity = broker.quantity.abs().round() as u32;
                position.last_update = now;
                report.updated += 1;
                continue;
            }

            match OptionPosition::from_broker(broker, now) {
                Some(adopted) => {
                    tracing::warn!("Adopting untracked broker position {}", broker.symbol);
                    report.adopted.push(adopted.symbol.clone());
                    self.positions.insert(adopted.symbol.clone(), adopted);
                }
                None => tracing::debug!("Ignoring non-option broker position {}", broker.symbol),
            }
        }

        let missing: Vec<(String, f64)> = self
            .positions
            .values()
            .filter(|p| !at_broker.contains(&p.symbol))
            .map(|p| (p.symbol.clone(), p.current_price))
            .collect();

        for (symbol, price) in missing {
            tracing::warn!("Position {} not found at broker, marking as closed", symbol);
            if self
                .close_position_at(&symbol, price, ExitReason::BrokerSync, now)
                .is_ok()
            {
                report.closed.push(symbol);
            }
        }

        report
    }

    /// Close positions with no update for longer than `max_age`
    pub fn cleanup_stale(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<OptionPosition> {
        let stale: Vec<(String, f64)> = self
            .positions
            .values()
            .filter(|p| now - p.last_update > max_age)
            .map(|p| (p.symbol.clone(), p.current_price))
            .collect();

        stale
            .into_iter()
            .filter_map(|(symbol, price)| {
                tracing::warn!(
                    "Closing stale position {} (no update for {}h)",
                    symbol,
                    max_age.num_hours()
                );
                self.close_position_at(&symbol, price, ExitReason::Manual, now)
                    .ok()
            })
            .collect()
    }

    /// JSON backup of open positions and the most recent closed ones
    pub fn export_json(&self) -> anyhow::Result<String> {
        let skip = self.history.len().saturating_sub(EXPORT_HISTORY);
        let export = PositionExport {
            export_time: Utc::now(),
            active_positions: self.positions.values().collect(),
            recent_history: self.history.iter().skip(skip).collect(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    pub fn summary(&self) -> PositionSummary {
        let closed_trades = self.history.len();
        let winning_trades = self.history.iter().filter(|p| p.pnl > 0.0).count();

        PositionSummary {
            open_positions: self.positions.len(),
            calls: self
                .positions
                .values()
                .filter(|p| p.option_type == OptionType::Call)
                .count(),
            puts: self
                .positions
                .values()
                .filter(|p| p.option_type == OptionType::Put)
                .count(),
            unrealized_pnl: self.unrealized_pnl(),
            realized_pnl: self.realized_pnl,
            closed_trades,
            winning_trades,
            win_rate: if closed_trades > 0 {
                winning_trades as f64 / closed_trades as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(symbol: &str) -> OptionContract {
        OptionContract::from_occ(symbol).unwrap()
    }

    fn open(pm: &mut PositionManager, symbol: &str, entry: f64) -> Uuid {
        let position = OptionPosition::new(&contract(symbol), 2, entry, 450.0, 448.0, Utc::now());
        pm.open_position(position).unwrap()
    }

    fn broker(symbol: &str, quantity: f64, price: f64) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            instrument_type: "Equity Option".to_string(),
            underlying_symbol: None,
            quantity,
            quantity_direction: Some("Long".to_string()),
            average_open_price: 1.50,
            close_price: price,
        }
    }

    const SPY_CALL: &str = "SPY   241129C00450000";
    const QQQ_PUT: &str = "QQQ   241129P00380000";

    #[test]
    fn test_open_position() {
        let mut pm = PositionManager::new();
        open(&mut pm, SPY_CALL, 2.0);

        assert!(pm.has_open_position(SPY_CALL));
        assert!(pm.has_position_for_underlying("SPY"));
        let position = pm.get_position(SPY_CALL).unwrap();
        assert_eq!(position.direction, Direction::Bullish);
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.stop_level, 448.0);
    }

    #[test]
    fn test_prevent_duplicate_underlying() {
        let mut pm = PositionManager::new();
        open(&mut pm, SPY_CALL, 2.0);

        let other = OptionPosition::new(
            &contract("SPY   241129P00440000"),
            1,
            1.0,
            450.0,
            452.0,
            Utc::now(),
        );
        let result = pm.open_position(other);
        assert!(result.unwrap_err().to_string().contains("Already have open position"));
    }

    #[test]
    fn test_pnl_uses_contract_multiplier() {
        let mut pm = PositionManager::new();
        open(&mut pm, SPY_CALL, 2.0);

        // 2 contracts, +0.50 -> $100
        let pnl = pm.update_price(SPY_CALL, 2.5).unwrap();
        assert!((pnl - 100.0).abs() < 1e-9);

        pm.update_price(SPY_CALL, 1.5).unwrap();
        let position = pm.get_position(SPY_CALL).unwrap();
        assert_eq!(position.highest_price, 2.5);
        assert_eq!(position.lowest_price, 1.5);
        assert!((position.pnl + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_moves_to_history() {
        let mut pm = PositionManager::new();
        open(&mut pm, SPY_CALL, 2.0);

        let closed = pm.close_position(SPY_CALL, 3.0, ExitReason::TrendBreak).unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::TrendBreak));
        assert!((closed.pnl - 200.0).abs() < 1e-9);

        assert!(!pm.has_open_position(SPY_CALL));
        assert_eq!(pm.history().count(), 1);
        assert!((pm.realized_pnl() - 200.0).abs() < 1e-9);

        let again = pm.close_position(SPY_CALL, 3.0, ExitReason::Manual);
        assert!(again.is_err());
    }

    #[test]
    fn test_history_is_capped() {
        let mut pm = PositionManager::new();
        for _ in 0..MAX_HISTORY + 5 {
            open(&mut pm, SPY_CALL, 1.0);
            pm.close_position(SPY_CALL, 1.1, ExitReason::Manual).unwrap();
        }
        assert_eq!(pm.history().count(), MAX_HISTORY);
    }

    #[test]
    fn test_sync_with_broker_adopts_and_closes() {
        let mut pm = PositionManager::new();
        open(&mut pm, SPY_CALL, 2.0);

        let report = pm.sync_with_broker(&[broker(QQQ_PUT, 3.0, 1.75)], Utc::now());

        assert_eq!(report.adopted, vec![QQQ_PUT.to_string()]);
        assert_eq!(report.closed, vec![SPY_CALL.to_string()]);

        let adopted = pm.get_position(QQQ_PUT).unwrap();
        assert_eq!(adopted.underlying, "QQQ");
        assert_eq!(adopted.direction, Direction::Bearish);
        assert_eq!(adopted.quantity, 3);
        assert!(!adopted.has_stop());
        assert!((adopted.pnl - 75.0).abs() < 1e-9);

        let closed = pm.history().last().unwrap();
        assert_eq!(closed.exit_reason, Some(ExitReason::BrokerSync));
    }

    #[test]
    fn test_sync_ignores_equity_positions() {
        let mut pm = PositionManager::new();
        let mut equity = broker("AAPL", 10.0, 190.0);
        equity.instrument_type = "Equity".to_string();

        let report = pm.sync_with_broker(&[equity], Utc::now());
        assert!(report.adopted.is_empty());
        assert_eq!(pm.position_count(), 0);
    }

    #[test]
    fn test_cleanup_stale() {
        let mut pm = PositionManager::new();
        open(&mut pm, SPY_CALL, 2.0);
        let later = Utc::now() + Duration::hours(25);

        let removed = pm.cleanup_stale(later, Duration::hours(24));
        assert_eq!(removed.len(), 1);
        assert_eq!(pm.position_count(), 0);
    }

    #[test]
    fn test_summary_and_export() {
        let mut pm = PositionManager::new();
        open(&mut pm, SPY_CALL, 2.0);
        open(&mut pm, QQQ_PUT, 1.0);
        pm.update_price(QQQ_PUT, 1.2).unwrap();
        pm.close_position(SPY_CALL, 1.0, ExitReason::StopHit).unwrap();

        let summary = pm.summary();
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.puts, 1);
        assert_eq!(summary.closed_trades, 1);
        assert_eq!(summary.win_rate, 0.0);
        assert!((summary.unrealized_pnl - 40.0).abs() < 1e-9);

        let json: serde_json::Value = serde_json::from_str(&pm.export_json().unwrap()).unwrap();
        assert_eq!(json["active_positions"].as_array().unwrap().len(), 1);
        assert_eq!(json["recent_history"][0]["exit_reason"], "stop_hit");
    }

    #[test]
    fn test_restore_splits_open_and_closed() {
        let mut pm = PositionManager::new();
        open(&mut pm, SPY_CALL, 2.0);
        let closed = pm.close_position(SPY_CALL, 2.5, ExitReason::Manual).unwrap();
        let live = OptionPosition::new(&contract(QQQ_PUT), 1, 1.0, 380.0, 382.0, Utc::now());

        let restored = PositionManager::with_positions(vec![closed, live]);
        assert_eq!(restored.position_count(), 1);
        assert!((restored.realized_pnl() - 100.0).abs() < 1e-9);
    }
}
