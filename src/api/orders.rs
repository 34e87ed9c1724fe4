use crate::api::tastytrade::{flexible_f64, TastyTradeClient};
use anyhow::{bail, Context, Result};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

const MAX_OPTION_LEGS: usize = 4;
const MAX_ORDER_HISTORY: usize = 500;

// ============== Order Types ==============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    #[serde(rename = "Stop Limit")]
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    #[default]
    Day,
    GTC,
    GTD,
    IOC,
    FOK,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    #[serde(rename = "Buy to Open")]
    BuyToOpen,
    #[serde(rename = "Sell to Open")]
    SellToOpen,
    #[serde(rename = "Buy to Close")]
    BuyToClose,
    #[serde(rename = "Sell to Close")]
    SellToClose,
}

impl OrderAction {
    pub fn is_buy(&self) -> bool {
        matches!(self, OrderAction::BuyToOpen | OrderAction::BuyToClose)
    }

    pub fn price_effect(&self) -> PriceEffect {
        if self.is_buy() {
            PriceEffect::Debit
        } else {
            PriceEffect::Credit
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentType {
    Equity,
    #[serde(rename = "Equity Option")]
    EquityOption,
    Future,
    Cryptocurrency,
}

impl InstrumentType {
    /// Guess the instrument type from the shape of a symbol
    ///
    /// OCC option symbols contain padding spaces, futures start with '/',
    /// crypto pairs look like "BTC/USD".
    pub fn infer(symbol: &str) -> Self {
        if symbol.contains(' ') && symbol.len() > 15 {
            InstrumentType::EquityOption
        } else if symbol.starts_with('/') {
            InstrumentType::Future
        } else if symbol.contains('/') {
            InstrumentType::Cryptocurrency
        } else {
            InstrumentType::Equity
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceEffect {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrderLeg {
    pub instrument_type: InstrumentType,
    pub symbol: String,
    pub quantity: f64,
    pub action: OrderAction,
}

impl OrderLeg {
    pub fn option(symbol: &str, quantity: u32, action: OrderAction) -> Self {
        Self {
            instrument_type: InstrumentType::EquityOption,
            symbol: symbol.to_string(),
            quantity: quantity as f64,
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrderRequest {
    pub time_in_force: TimeInForce,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_effect: Option<PriceEffect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_trigger: Option<String>,
    pub legs: Vec<OrderLeg>,
}

/// One-triggers-OCO bracket: entry, then profit target and stop as an OCO pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComplexOrder {
    #[serde(rename = "type")]
    pub kind: String,
    pub trigger_order: OrderRequest,
    pub orders: Vec<OrderRequest>,
}

// ============== Response Types ==============

fn flexible_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BrokerOrder {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub underlying_symbol: Option<String>,
}

/// One row of the live order list, falling back to its id when the shape is unexpected
fn parse_live_order(item: &Value) -> Option<BrokerOrder> {
    match serde_json::from_value::<BrokerOrder>(item.clone()) {
        Ok(order) => Some(order),
        Err(e) => {
            let id = match &item["id"] {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => String::new(),
            };
            if id.is_empty() {
                tracing::error!("Unreadable live order without an id: {}", e);
                return None;
            }
            tracing::warn!("Live order {} has an unexpected shape ({}), treating as working", id, e);
            Some(BrokerOrder {
                id,
                status: "Unknown".to_string(),
                order_type: None,
                underlying_symbol: None,
            })
        }
    }
}

impl BrokerOrder {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "Filled" | "Canceled" | "Cancelled" | "Rejected" | "Expired"
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuyingPowerEffect {
    #[serde(default, deserialize_with = "flexible_f64")]
    pub impact: f64,
    #[serde(default)]
    pub effect: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DryRunResult {
    #[serde(default)]
    pub order: Option<BrokerOrder>,
    #[serde(default)]
    pub buying_power_effect: Option<BuyingPowerEffect>,
    #[serde(default)]
    pub warnings: Vec<Value>,
}

/// Outcome of the emergency flatten
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KillReport {
    pub orders_canceled: usize,
    pub positions_closed: usize,
    pub errors: Vec<String>,
}

#[derive(Default)]
struct OrderBook {
    active: HashMap<String, BrokerOrder>,
    history: HashMap<String, BrokerOrder>,
    history_order: Vec<String>,
}

impl OrderBook {
    fn remember(&mut self, order: &BrokerOrder) {
        if !self.history.contains_key(&order.id) {
            self.history_order.push(order.id.clone());
            if self.history_order.len() > MAX_ORDER_HISTORY {
                let oldest = self.history_order.remove(0);
                self.history.remove(&oldest);
            }
        }
        self.history.insert(order.id.clone(), order.clone());
    }
}

// ============== Order Builders ==============

fn format_price(price: f64) -> String {
    format!("{:.2}", price)
}

/// Build a single-leg equity option order
pub fn create_equity_option_order(
    symbol: &str,
    quantity: u32,
    action: OrderAction,
    order_type: OrderType,
    price: Option<f64>,
    time_in_force: TimeInForce,
) -> Result<OrderRequest> {
    create_multi_leg_order(
        vec![OrderLeg::option(symbol, quantity, action)],
        order_type,
        price,
        time_in_force,
    )
}

/// Build a spread order with one to four option legs
///
/// The price effect follows the first leg's action.
pub fn create_multi_leg_order(
    legs: Vec<OrderLeg>,
    order_type: OrderType,
    price: Option<f64>,
    time_in_force: TimeInForce,
) -> Result<OrderRequest> {
    if legs.is_empty() {
        bail!("At least one leg is required");
    }
    if legs.len() > MAX_OPTION_LEGS {
        bail!("Maximum of {} legs allowed for option orders", MAX_OPTION_LEGS);
    }
    if matches!(order_type, OrderType::Limit | OrderType::StopLimit) && price.is_none() {
        bail!("Price is required for {:?} orders", order_type);
    }

    let price_effect = price.map(|_| legs[0].action.price_effect());

    Ok(OrderRequest {
        time_in_force,
        order_type,
        price: price.map(format_price),
        price_effect,
        stop_trigger: None,
        legs,
    })
}

/// Day market order for any instrument
pub fn create_market_order(symbol: &str, quantity: f64, action: OrderAction) -> OrderRequest {
    OrderRequest {
        time_in_force: TimeInForce::Day,
        order_type: OrderType::Market,
        price: None,
        price_effect: None,
        stop_trigger: None,
        legs: vec![OrderLeg {
            instrument_type: InstrumentType::infer(symbol),
            symbol: symbol.to_string(),
            quantity,
            action,
        }],
    }
}

/// Good-till-cancelled stop order triggered at `trigger`
pub fn create_stop_order(
    symbol: &str,
    quantity: u32,
    action: OrderAction,
    trigger: f64,
) -> OrderRequest {
    OrderRequest {
        time_in_force: TimeInForce::GTC,
        order_type: OrderType::Stop,
        price: None,
        price_effect: None,
        stop_trigger: Some(format_price(trigger)),
        legs: vec![OrderLeg {
            instrument_type: InstrumentType::infer(symbol),
            symbol: symbol.to_string(),
            quantity: quantity as f64,
            action,
        }],
    }
}

pub fn create_otoco_order(
    entry: OrderRequest,
    profit: OrderRequest,
    stop: OrderRequest,
) -> ComplexOrder {
    ComplexOrder {
        kind: "OTOCO".to_string(),
        trigger_order: entry,
        orders: vec![profit, stop],
    }
}

/// Cash effect of a dry-run order: debits are negative, credits positive
pub fn calculate_option_order_cost(dry_run: &DryRunResult) -> f64 {
    match &dry_run.buying_power_effect {
        Some(bp) if bp.effect == "Debit" => -bp.impact,
        Some(bp) if bp.effect == "Credit" => bp.impact,
        _ => 0.0,
    }
}

// ============== Order Manager ==============

/// Submits, tracks and cancels orders for one account
pub struct OrderManager {
    client: TastyTradeClient,
    account_id: String,
    book: Mutex<OrderBook>,
}

impl OrderManager {
    pub fn new(client: TastyTradeClient, account_id: &str) -> Self {
        Self {
            client,
            account_id: account_id.to_string(),
            book: Mutex::new(OrderBook::default()),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn client(&self) -> &TastyTradeClient {
        &self.client
    }

    fn orders_endpoint(&self, suffix: &str) -> String {
        format!("/accounts/{}/{}", self.account_id, suffix)
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut OrderBook) -> T) -> Result<T> {
        let mut book = self
            .book
            .lock()
            .map_err(|e| anyhow::anyhow!("order book lock poisoned: {}", e))?;
        Ok(f(&mut book))
    }

    /// Validate an order without sending it to the market
    pub async fn dry_run_order(&self, order: &OrderRequest) -> Result<DryRunResult> {
        let body = serde_json::to_value(order)?;
        let (status, response) = self
            .client
            .send_json(Method::POST, &self.orders_endpoint("orders/dry-run"), Some(&body))
            .await?;

        if status != StatusCode::OK {
            bail!("Dry run returned unexpected status {}", status);
        }

        serde_json::from_value(response["data"].clone()).context("Failed to parse dry run")
    }

    pub async fn submit_order(&self, order: &OrderRequest) -> Result<BrokerOrder> {
        let body = serde_json::to_value(order)?;
        let (status, response) = self
            .client
            .send_json(Method::POST, &self.orders_endpoint("orders"), Some(&body))
            .await?;

        if status != StatusCode::CREATED {
            bail!("Order submission returned unexpected status {}", status);
        }

        let placed: BrokerOrder = serde_json::from_value(response["data"]["order"].clone())
            .context("Failed to parse submitted order")?;

        if placed.id.is_empty() {
            bail!("Broker accepted the order but returned no order id");
        }

        tracing::info!(
            "Order {} submitted: {:?} {} x{}",
            placed.id,
            order.order_type,
            order.legs.first().map(|l| l.symbol.as_str()).unwrap_or(""),
            order.legs.first().map(|l| l.quantity).unwrap_or(0.0)
        );

        self.with_book(|book| {
            book.active.insert(placed.id.clone(), placed.clone());
            book.remember(&placed);
        })?;

        Ok(placed)
    }

    /// Submit an OTOCO/OCO bracket; returns the raw `data` object
    pub async fn submit_complex_order(&self, order: &ComplexOrder) -> Result<Value> {
        let body = serde_json::to_value(order)?;
        let (status, response) = self
            .client
            .send_json(Method::POST, &self.orders_endpoint("complex-orders"), Some(&body))
            .await?;

        if status != StatusCode::CREATED {
            bail!("Complex order returned unexpected status {}", status);
        }

        Ok(response["data"].clone())
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let endpoint = self.orders_endpoint(&format!("orders/{}", order_id));
        let (status, _) = self.client.send_json(Method::DELETE, &endpoint, None).await?;

        if status != StatusCode::NO_CONTENT && status != StatusCode::OK {
            bail!("Cancel of order {} returned status {}", order_id, status);
        }

        self.with_book(|book| {
            book.active.remove(order_id);
        })?;
        tracing::info!("Order {} canceled", order_id);
        Ok(())
    }

    /// Refresh one order; terminal orders drop out of the active set
    pub async fn get_order_status(&self, order_id: &str) -> Result<BrokerOrder> {
        let endpoint = self.orders_endpoint(&format!("orders/{}", order_id));
        let response = self.client.get_json(&endpoint).await?;
        let order: BrokerOrder =
            serde_json::from_value(response["data"].clone()).context("Failed to parse order")?;

        self.with_book(|book| {
            book.remember(&order);
            if order.is_terminal() {
                book.active.remove(&order.id);
            } else {
                book.active.insert(order.id.clone(), order.clone());
            }
        })?;

        Ok(order)
    }

    /// Orders the broker still considers live today
    ///
    /// Replaces the active set when every row parses. A row that only yields
    /// its id is kept as `Unknown` so it is still treated as working.
    pub async fn get_live_orders(&self) -> Result<Vec<BrokerOrder>> {
        let response = self.client.get_json(&self.orders_endpoint("orders/live")).await?;
        let items = response["data"]["items"]
            .as_array()
            .context("Failed to parse live orders: no items in response")?;

        let mut orders = Vec::with_capacity(items.len());
        let mut unreadable = 0;
        for item in items {
            match parse_live_order(item) {
                Some(order) => orders.push(order),
                None => unreadable += 1,
            }
        }

        self.with_book(|book| {
            if unreadable == 0 {
                book.active.clear();
            } else {
                tracing::warn!(
                    "{} live orders could not be read, keeping previously known active orders",
                    unreadable
                );
            }
            for order in orders.iter().filter(|o| !o.id.is_empty()) {
                book.remember(order);
                if !order.is_terminal() {
                    book.active.insert(order.id.clone(), order.clone());
                }
            }
        })?;

        Ok(orders)
    }

    pub fn active_orders(&self) -> Vec<BrokerOrder> {
        self.with_book(|book| book.active.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn order_history_len(&self) -> usize {
        self.with_book(|book| book.history.len()).unwrap_or(0)
    }

    /// Cancel every working order, then flatten every broker position at market
    pub async fn kill_all_orders(&self) -> Result<KillReport> {
        let mut report = KillReport::default();

        tracing::warn!("🛑 Kill switch: canceling all orders and closing all positions");

        let live = self.get_live_orders().await?;
        for order in live.iter().filter(|o| !o.is_terminal()) {
            match self.cancel_order(&order.id).await {
                Ok(()) => report.orders_canceled += 1,
                Err(e) => report
                    .errors
                    .push(format!("Failed to cancel order {}: {}", order.id, e)),
            }
        }

        let positions = self.client.get_positions(&self.account_id).await?;
        for position in positions.iter().filter(|p| p.quantity != 0.0) {
            let action = if position.is_short() || position.quantity < 0.0 {
                OrderAction::BuyToClose
            } else {
                OrderAction::SellToClose
            };
            let order = create_market_order(&position.symbol, position.quantity.abs(), action);

            match self.submit_order(&order).await {
                Ok(_) => report.positions_closed += 1,
                Err(e) => report.errors.push(format!(
                    "Failed to close position for {}: {}",
                    position.symbol, e
                )),
            }
        }

        tracing::warn!(
            "Kill switch finished: {} orders canceled, {} positions closed, {} errors",
            report.orders_canceled,
            report.positions_closed,
            report.errors.len()
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_limit_order_requires_price() {
        let result = create_equity_option_order(
            "SPY   241129C00420000",
            1,
            OrderAction::BuyToOpen,
            OrderType::Limit,
            None,
            TimeInForce::Day,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_limit_order_json_shape() {
        let order = create_equity_option_order(
            "SPY   241129C00420000",
            2,
            OrderAction::BuyToOpen,
            OrderType::Limit,
            Some(2.5),
            TimeInForce::Day,
        )
        .unwrap();

        let value = serde_json::to_value(&order).unwrap();
        assert_eq!(value["time-in-force"], "Day");
        assert_eq!(value["order-type"], "Limit");
        assert_eq!(value["price"], "2.50");
        assert_eq!(value["price-effect"], "Debit");
        assert_eq!(value["legs"][0]["instrument-type"], "Equity Option");
        assert_eq!(value["legs"][0]["action"], "Buy to Open");
        assert!(value.get("stop-trigger").is_none());
    }

    #[test]
    fn test_sell_limit_is_credit() {
        let order = create_equity_option_order(
            "SPY   241129P00410000",
            1,
            OrderAction::SellToClose,
            OrderType::Limit,
            Some(1.2),
            TimeInForce::GTC,
        )
        .unwrap();
        assert_eq!(order.price_effect, Some(PriceEffect::Credit));
        assert_eq!(order.time_in_force, TimeInForce::GTC);
    }

    #[test]
    fn test_multi_leg_limits() {
        assert!(create_multi_leg_order(vec![], OrderType::Market, None, TimeInForce::Day).is_err());

        let legs: Vec<OrderLeg> = (0..5)
            .map(|_| OrderLeg::option("SPY   241129C00420000", 1, OrderAction::BuyToOpen))
            .collect();
        assert!(create_multi_leg_order(legs, OrderType::Market, None, TimeInForce::Day).is_err());

        let spread = vec![
            OrderLeg::option("SPY   241129C00420000", 1, OrderAction::SellToOpen),
            OrderLeg::option("SPY   241129C00425000", 1, OrderAction::BuyToOpen),
        ];
        let order =
            create_multi_leg_order(spread, OrderType::Limit, Some(0.75), TimeInForce::Day).unwrap();
        assert_eq!(order.legs.len(), 2);
        assert_eq!(order.price_effect, Some(PriceEffect::Credit));
    }

    #[test]
    fn test_instrument_inference() {
        assert_eq!(
            InstrumentType::infer("SPY   241129C00420000"),
            InstrumentType::EquityOption
        );
        assert_eq!(InstrumentType::infer("/ESZ4"), InstrumentType::Future);
        assert_eq!(InstrumentType::infer("BTC/USD"), InstrumentType::Cryptocurrency);
        assert_eq!(InstrumentType::infer("AAPL"), InstrumentType::Equity);
    }

    #[test]
    fn test_stop_and_otoco_shape() {
        let entry = create_market_order("SPY   241129C00420000", 1.0, OrderAction::BuyToOpen);
        let profit = create_equity_option_order(
            "SPY   241129C00420000",
            1,
            OrderAction::SellToClose,
            OrderType::Limit,
            Some(4.0),
            TimeInForce::GTC,
        )
        .unwrap();
        let stop = create_stop_order("SPY   241129C00420000", 1, OrderAction::SellToClose, 1.5);
        assert_eq!(stop.stop_trigger.as_deref(), Some("1.50"));

        let otoco = serde_json::to_value(create_otoco_order(entry, profit, stop)).unwrap();
        assert_eq!(otoco["type"], "OTOCO");
        assert_eq!(otoco["trigger-order"]["order-type"], "Market");
        assert_eq!(otoco["orders"].as_array().unwrap().len(), 2);
        assert_eq!(otoco["orders"][1]["order-type"], "Stop");
        assert_eq!(otoco["orders"][1]["time-in-force"], "GTC");
    }

    #[test]
    fn test_order_cost_from_dry_run() {
        let debit: DryRunResult = serde_json::from_value(json!({
            "buying-power-effect": {"impact": "250.0", "effect": "Debit"}
        }))
        .unwrap();
        assert_eq!(calculate_option_order_cost(&debit), -250.0);

        let credit: DryRunResult = serde_json::from_value(json!({
            "buying-power-effect": {"impact": 80.5, "effect": "Credit"}
        }))
        .unwrap();
        assert_eq!(calculate_option_order_cost(&credit), 80.5);

        assert_eq!(calculate_option_order_cost(&DryRunResult::default()), 0.0);
    }

    #[test]
    fn test_broker_order_numeric_id() {
        let order: BrokerOrder =
            serde_json::from_value(json!({"id": 12345, "status": "Filled"})).unwrap();
        assert_eq!(order.id, "12345");
        assert!(order.is_terminal());
    }
}
