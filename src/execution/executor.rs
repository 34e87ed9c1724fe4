use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::api::orders::{create_equity_option_order, create_stop_order, calculate_option_order_cost};
use crate::api::{
    BrokerOrder, EventKind, LiquidityCriteria, OrderAction, OrderManager, OrderRequest, OrderType,
    StreamCommand, TastyTradeClient, TimeInForce,
};
use crate::config::{BrokerConfig, TradingConfig};
use crate::db::PostgresPersistence;
use crate::execution::{CandleBuilder, OptionPosition, PositionManager};
use crate::models::{Direction, ExitReason, OptionType, QuoteEvent};
use crate::risk::{initial_stop, update_trailing_stop};
use crate::strategy::{EntrySignal, JigsawStrategy};

/// Rough option delta used to translate the underlying stop into an option stop
const ATM_DELTA: f64 = 0.5;
/// Smallest option stop trigger
const MIN_OPTION_TRIGGER: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Execute { quantity: u32 },
    Skip,
    Close {
        symbol: String,
        exit_reason: ExitReason,
    },
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Option stop trigger equivalent to an underlying stop for a near-the-money contract
pub fn option_stop_trigger(option_price: f64, underlying_price: f64, stop_level: f64) -> f64 {
    (option_price - (underlying_price - stop_level).abs() * ATM_DELTA).max(MIN_OPTION_TRIGGER)
}

/// Turns entry signals and exit decisions into broker orders and tracked positions
pub struct TradeExecutor {
    orders: Arc<OrderManager>,
    position_manager: Arc<Mutex<PositionManager>>,
    trading: TradingConfig,
    broker: BrokerConfig,
    candles: CandleBuilder,
    db: Option<Arc<PostgresPersistence>>,
    stream: Option<mpsc::UnboundedSender<StreamCommand>>,
    /// DXLink streamer symbol -> option symbol for positions being streamed
    streamed: Mutex<HashMap<String, String>>,
}

impl TradeExecutor {
    pub fn new(
        orders: Arc<OrderManager>,
        position_manager: Arc<Mutex<PositionManager>>,
        trading: TradingConfig,
        broker: BrokerConfig,
        candles: CandleBuilder,
    ) -> Self {
        Self {
            orders,
            position_manager,
            trading,
            broker,
            candles,
            db: None,
            stream: None,
            streamed: Mutex::new(HashMap::new()),
        }
    }

    /// Stream quotes for held options through the market data feed
    pub fn with_stream_commands(mut self, commands: mpsc::UnboundedSender<StreamCommand>) -> Self {
        self.stream = Some(commands);
        self
    }

    fn send_stream_command(&self, command: StreamCommand) {
        if let Some(stream) = &self.stream {
            if stream.send(command).is_err() {
                tracing::warn!("Market data stream is gone, option quotes will use REST");
            }
        }
    }

    /// Subscribe the option's DXLink quotes
    pub async fn start_streaming(&self, option_symbol: &str) {
        if self.stream.is_none() {
            return;
        }
        let streamer = self.client().get_streamer_symbol(option_symbol, true).await;
        match self.streamed.lock() {
            Ok(mut streamed) => {
                streamed.insert(streamer.clone(), option_symbol.to_string());
            }
            Err(e) => {
                tracing::warn!("Cannot stream {}: {}", option_symbol, e);
                return;
            }
        }
        tracing::debug!("📡 Streaming {} as {}", option_symbol, streamer);
        self.send_stream_command(StreamCommand::Subscribe {
            symbols: vec![streamer],
            kinds: vec![EventKind::Quote],
        });
    }

    pub fn stop_streaming(&self, option_symbol: &str) {
        let removed: Vec<String> = match self.streamed.lock() {
            Ok(mut streamed) => {
                let keys: Vec<String> = streamed
                    .iter()
                    .filter(|(_, occ)| occ.as_str() == option_symbol)
                    .map(|(streamer, _)| streamer.clone())
                    .collect();
                for key in &keys {
                    streamed.remove(key);
                }
                keys
            }
            Err(_) => return,
        };
        if !removed.is_empty() {
            self.send_stream_command(StreamCommand::Unsubscribe {
                symbols: removed,
                kinds: vec![EventKind::Quote],
            });
        }
    }

    /// Stream every open position, e.g. ones restored at startup
    pub async fn stream_open_positions(&self) -> anyhow::Result<()> {
        let symbols: Vec<String> = self
            .positions()?
            .open_positions()
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        for symbol in symbols {
            self.start_streaming(&symbol).await;
        }
        Ok(())
    }

    /// Mark a held option from a streamed quote; false when the quote is not for one
    pub fn on_option_quote(&self, quote: &QuoteEvent) -> bool {
        let option_symbol = match self.streamed.lock() {
            Ok(streamed) => streamed.get(&quote.symbol).cloned(),
            Err(_) => None,
        };
        let Some(option_symbol) = option_symbol else {
            return false;
        };
        if let Some(price) = quote.price() {
            if let Ok(mut pm) = self.positions() {
                if let Err(e) = pm.update_price_at(&option_symbol, price, quote.time) {
                    tracing::debug!("Streamed quote for closed {}: {}", option_symbol, e);
                }
            }
        }
        true
    }

    /// Record positions and orders in Postgres as they change
    pub fn with_persistence(mut self, db: Arc<PostgresPersistence>) -> Self {
        self.db = Some(db);
        self
    }

    async fn persist_position(&self, symbol: &str) {
        let Some(db) = &self.db else { return };
        let snapshot = match self.positions() {
            Ok(pm) => pm
                .get_position(symbol)
                .cloned()
                .or_else(|| pm.history().rev().find(|p| p.symbol == symbol).cloned()),
            Err(e) => {
                tracing::warn!("Cannot persist {}: {}", symbol, e);
                return;
            }
        };
        if let Some(position) = snapshot {
            if let Err(e) = db.save_position(&position).await {
                tracing::warn!("Failed to save position {} to Postgres: {}", symbol, e);
            }
        }
    }

    async fn submit(&self, order: &OrderRequest) -> anyhow::Result<BrokerOrder> {
        let placed = self.orders.submit_order(order).await?;
        if let Some(db) = &self.db {
            if let Err(e) = db.log_order(order, &placed).await {
                tracing::warn!("Failed to log order {}: {}", placed.id, e);
            }
        }
        Ok(placed)
    }

    fn client(&self) -> &TastyTradeClient {
        self.orders.client()
    }

    fn positions(&self) -> anyhow::Result<MutexGuard<'_, PositionManager>> {
        self.position_manager
            .lock()
            .map_err(|e| anyhow::anyhow!("Position manager lock poisoned: {}", e))
    }

    pub fn position_manager(&self) -> Arc<Mutex<PositionManager>> {
        self.position_manager.clone()
    }

    /// Should this signal be traded at all?
    pub fn evaluate_entry(&self, signal: &EntrySignal) -> anyhow::Result<ExecutionDecision> {
        if signal.direction == Direction::Neutral {
            return Ok(ExecutionDecision::skip("Neutral signal"));
        }
        if self.positions()?.has_position_for_underlying(&signal.symbol) {
            return Ok(ExecutionDecision::skip(format!(
                "Already in a trade for {}",
                signal.symbol
            )));
        }

        Ok(ExecutionDecision {
            action: ExecutionAction::Execute {
                quantity: self.trading.contracts_per_trade,
            },
            reason: format!("{:?} {} setup confirmed", signal.setup, signal.direction),
        })
    }

    /// Underlying price: streamed last price, else a REST quote
    async fn underlying_price(&self, symbol: &str) -> anyhow::Result<f64> {
        if let Ok(Some(price)) = self.candles.last_price(symbol) {
            return Ok(price);
        }
        self.client()
            .get_current_price(symbol)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Could not get current price for {}", symbol))
    }

    /// Buy the near-the-money option for a confirmed signal
    pub async fn enter_trade(&self, signal: &EntrySignal) -> anyhow::Result<ExecutionDecision> {
        let decision = self.evaluate_entry(signal)?;
        let ExecutionAction::Execute { quantity } = decision.action else {
            return Ok(decision);
        };
        let Some(option_type) = OptionType::for_direction(signal.direction) else {
            return Ok(ExecutionDecision::skip("Neutral signal"));
        };

        let price = self.underlying_price(&signal.symbol).await?;
        let Some(contract) = self
            .client()
            .find_option_contract(&signal.symbol, option_type, price)
            .await?
        else {
            return Ok(ExecutionDecision::skip(format!(
                "No suitable option contract for {}",
                signal.symbol
            )));
        };

        let criteria = LiquidityCriteria {
            min_volume: self.trading.liquidity_min_volume,
            min_open_interest: self.trading.liquidity_min_oi,
            max_spread: self.trading.liquidity_max_spread,
        };
        if !self
            .client()
            .check_liquidity(&signal.symbol, Some(&contract.symbol), &criteria)
            .await?
        {
            return Ok(ExecutionDecision::skip(format!(
                "{} failed liquidity checks",
                contract.symbol
            )));
        }

        let order = create_equity_option_order(
            &contract.symbol,
            quantity,
            OrderAction::BuyToOpen,
            OrderType::Market,
            None,
            TimeInForce::Day,
        )?;

        if !self.broker.auto_trading_enabled {
            let dry_run = self.orders.dry_run_order(&order).await?;
            tracing::info!(
                "🧪 Dry run {} x{}: cost ${:.2} ({} warnings)",
                contract.symbol,
                quantity,
                calculate_option_order_cost(&dry_run),
                dry_run.warnings.len()
            );
            return Ok(ExecutionDecision::skip("Auto trading disabled, dry run only"));
        }

        tracing::info!(
            "📤 Submitting {} for {} x{} ({})",
            option_type.trade_label(),
            contract.symbol,
            quantity,
            signal.symbol
        );
        let submitted = self.submit(&order).await?;

        let option_price = match self.client().get_option_price(&contract.symbol).await {
            Ok(Some(p)) => p,
            Ok(None) => 0.0,
            Err(e) => {
                tracing::warn!("No option quote for {}: {}", contract.symbol, e);
                0.0
            }
        };

        let candles_5m = self.candles.get_candles(&signal.symbol, 5).unwrap_or_default();
        let stop_level = initial_stop(
            self.trading.stop_loss_method,
            signal.direction,
            price,
            &candles_5m,
            &self.trading,
        );

        let mut position =
            OptionPosition::new(&contract, quantity, option_price, price, stop_level, Utc::now());
        position.order_id = Some(submitted.id.clone());
        let symbol = position.symbol.clone();
        self.positions()?.open_position(position)?;

        if self.broker.broker_stop_orders {
            let trigger = option_stop_trigger(option_price, price, stop_level);
            match self.place_stop_order(&symbol, quantity, trigger).await {
                Ok(id) => self.positions()?.set_stop_order(&symbol, Some(id))?,
                Err(e) => tracing::error!("Failed to place initial stop order for {}: {}", symbol, e),
            }
        }
        self.persist_position(&symbol).await;
        self.start_streaming(&symbol).await;

        tracing::info!(
            "✅ Entered {} trade on {} with {} ({} @ ${:.2}, stop {:.2})",
            signal.direction,
            signal.symbol,
            symbol,
            quantity,
            option_price,
            stop_level
        );

        Ok(ExecutionDecision {
            action: ExecutionAction::Execute { quantity },
            reason: format!("Order {} submitted for {}", submitted.id, symbol),
        })
    }

    async fn place_stop_order(&self, symbol: &str, quantity: u32, trigger: f64) -> anyhow::Result<String> {
        let order = create_stop_order(symbol, quantity, OrderAction::SellToClose, trigger);
        let placed = self.submit(&order).await?;
        tracing::info!("🛑 Stop order {} for {} at ${:.2}", placed.id, symbol, trigger);
        Ok(placed.id)
    }

    /// Sell to close, cancel any broker stop, and record the exit
    pub async fn exit_trade(&self, symbol: &str, reason: ExitReason) -> anyhow::Result<OptionPosition> {
        let position = self
            .positions()?
            .get_position(symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No open position for {}", symbol))?;

        if let Some(stop_id) = &position.stop_order_id {
            if let Err(e) = self.orders.cancel_order(stop_id).await {
                tracing::warn!("Could not cancel stop order {} for {}: {}", stop_id, symbol, e);
            }
        }

        let order = create_equity_option_order(
            symbol,
            position.quantity,
            OrderAction::SellToClose,
            OrderType::Market,
            None,
            TimeInForce::Day,
        )?;
        self.submit(&order).await?;

        let exit_price = match self.client().get_option_price(symbol).await {
            Ok(Some(p)) => p,
            _ => position.current_price,
        };

        let closed = self.positions()?.close_position(symbol, exit_price, reason)?;
        self.persist_position(symbol).await;
        self.stop_streaming(symbol);
        tracing::info!(
            "🚪 Exited {} ({}): P&L ${:.2}",
            symbol,
            reason,
            closed.pnl
        );
        Ok(closed)
    }

    /// Move the stop if the trailing method tightens it; assigns a first stop when missing
    pub async fn update_trailing_stop(
        &self,
        symbol: &str,
        underlying_price: f64,
    ) -> anyhow::Result<Option<f64>> {
        let Some(position) = self.positions()?.get_position(symbol).cloned() else {
            return Ok(None);
        };
        let candles_5m = self
            .candles
            .get_candles(&position.underlying, 5)
            .unwrap_or_default();

        let new_stop = if position.has_stop() {
            update_trailing_stop(
                self.trading.trailing_stop_method,
                position.direction,
                position.stop_level,
                underlying_price,
                &candles_5m,
            )
        } else {
            Some(initial_stop(
                self.trading.stop_loss_method,
                position.direction,
                underlying_price,
                &candles_5m,
                &self.trading,
            ))
        };

        let Some(stop) = new_stop else {
            return Ok(None);
        };
        self.positions()?.update_stop(symbol, stop)?;
        tracing::info!(
            "Trailing stop for {} ({}) -> {:.2} [{}]",
            symbol,
            position.underlying,
            stop,
            self.trading.trailing_stop_method.label()
        );

        if self.broker.broker_stop_orders {
            if let Some(old) = &position.stop_order_id {
                if let Err(e) = self.orders.cancel_order(old).await {
                    tracing::warn!("Could not cancel stop order {}: {}", old, e);
                }
            }
            let trigger = option_stop_trigger(position.current_price, underlying_price, stop);
            let replaced = match self.place_stop_order(symbol, position.quantity, trigger).await {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::error!("Failed to replace stop order for {}: {}", symbol, e);
                    None
                }
            };
            self.positions()?.set_stop_order(symbol, replaced)?;
        }
        self.persist_position(symbol).await;

        Ok(Some(stop))
    }

    /// What to do with an open position right now
    pub fn decide_exit(
        &self,
        strategy: &JigsawStrategy,
        position: &OptionPosition,
        underlying_price: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ExecutionDecision> {
        Ok(match strategy.check_exit(position, underlying_price, now)? {
            Some(reason) => ExecutionDecision {
                action: ExecutionAction::Close {
                    symbol: position.symbol.clone(),
                    exit_reason: reason,
                },
                reason: reason.to_string(),
            },
            None => ExecutionDecision::skip("Hold position"),
        })
    }

    /// One pass over open positions: mark, exit or trail
    pub async fn manage_positions(
        &self,
        strategy: &JigsawStrategy,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ExecutionDecision>> {
        let open: Vec<OptionPosition> = self
            .positions()?
            .open_positions()
            .into_iter()
            .cloned()
            .collect();

        let mut decisions = Vec::new();
        for position in open {
            let underlying_price = match self.underlying_price(&position.underlying).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", position.symbol, e);
                    continue;
                }
            };

            if let Ok(Some(option_price)) = self.client().get_option_price(&position.symbol).await {
                self.positions()?.update_price(&position.symbol, option_price)?;
            }

            let decision = self.decide_exit(strategy, &position, underlying_price, now)?;
            match &decision.action {
                ExecutionAction::Close { symbol, exit_reason } => {
                    if let Err(e) = self.exit_trade(symbol, *exit_reason).await {
                        tracing::error!("Error exiting {}: {}", symbol, e);
                    }
                }
                _ => {
                    if let Err(e) = self
                        .update_trailing_stop(&position.symbol, underlying_price)
                        .await
                    {
                        tracing::warn!("Trailing stop update failed for {}: {}", position.symbol, e);
                    }
                }
            }
            decisions.push(decision);
        }
        Ok(decisions)
    }

    /// Reconcile local positions with the broker account
    pub async fn sync_with_broker(&self) -> anyhow::Result<()> {
        let broker_positions = self.client().get_positions(self.orders.account_id()).await?;
        let report = self.positions()?.sync_with_broker(&broker_positions, Utc::now());
        if !report.adopted.is_empty() || !report.closed.is_empty() {
            tracing::info!(
                "🔄 Broker sync: adopted {:?}, closed {:?}, updated {}",
                report.adopted,
                report.closed,
                report.updated
            );
        }
        for symbol in report.adopted.iter().chain(report.closed.iter()) {
            self.persist_position(symbol).await;
        }
        for symbol in &report.adopted {
            self.start_streaming(symbol).await;
        }
        for symbol in &report.closed {
            self.stop_streaming(symbol);
        }
        Ok(())
    }
}
