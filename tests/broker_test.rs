use chrono::Utc;
use jigsawbot::api::orders::{create_equity_option_order, create_stop_order};
use jigsawbot::api::{
    BrokerError, EventKind, OrderAction, OrderManager, OrderType, StreamCommand,
    TastyTradeClient, TimeInForce,
};
use jigsawbot::config::{BrokerConfig, TradingConfig};
use jigsawbot::execution::{CandleBuilder, OptionPosition, PositionManager, TradeExecutor};
use jigsawbot::models::{ExitReason, OptionContract, QuoteEvent};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

const ACCOUNT: &str = "5WT00001";
const SPY_CALL: &str = "SPY   241129C00450000";
const QQQ_PUT: &str = "QQQ   241129P00380000";
const SPY_CALL_STREAMER: &str = ".SPY241129C450";

async fn logged_in_server() -> (ServerGuard, TastyTradeClient) {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/sessions")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(json!({"data": {"session-token": "tok-123"}}).to_string())
        .create_async()
        .await;

    let client = TastyTradeClient::new(&server.url(), "trader", "secret")
        .unwrap()
        .with_backoff_base(Duration::from_millis(1));
    client.login().await.unwrap();
    (server, client)
}

fn positions_body(items: serde_json::Value) -> String {
    json!({"data": {"items": items}}).to_string()
}

#[tokio::test]
async fn test_login_sends_credentials_and_authorizes_requests() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/sessions")
        .match_body(Matcher::PartialJson(json!({"login": "trader", "password": "secret"})))
        .with_status(201)
        .with_body(json!({"data": {"session-token": "tok-123"}}).to_string())
        .create_async()
        .await;
    let accounts = server
        .mock("GET", "/customers/me/accounts")
        .match_header("authorization", "tok-123")
        .with_status(200)
        .with_body(
            json!({"data": {"items": [{"account": {"account-number": ACCOUNT}}]}}).to_string(),
        )
        .create_async()
        .await;

    let client = TastyTradeClient::new(&server.url(), "trader", "secret").unwrap();
    assert_ok!(client.login().await);
    assert!(client.is_authenticated().await);

    let account = assert_ok!(client.resolve_account_number(None).await);
    assert_eq!(account, ACCOUNT);

    // A configured account skips the lookup
    let configured = client.resolve_account_number(Some("CONFIGURED")).await.unwrap();
    assert_eq!(configured, "CONFIGURED");

    login.assert_async().await;
    accounts.assert_async().await;
}

#[tokio::test]
async fn test_login_without_credentials_fails_fast() {
    let client = TastyTradeClient::new("http://127.0.0.1:1", "", "").unwrap();
    let err = assert_err!(client.login().await);
    assert!(matches!(err, BrokerError::MissingCredentials));
}

#[tokio::test]
async fn test_rejected_login_retries_then_reports_auth_error() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/sessions")
        .with_status(401)
        .with_body(r#"{"error": {"message": "invalid credentials"}}"#)
        .expect(3)
        .create_async()
        .await;

    let client = TastyTradeClient::new(&server.url(), "trader", "wrong")
        .unwrap()
        .with_backoff_base(Duration::from_millis(1));
    let err = client.login().await.unwrap_err();

    assert!(matches!(err, BrokerError::Auth(_)), "got {:?}", err);
    assert!(!client.is_authenticated().await);
    login.assert_async().await;
}

#[tokio::test]
async fn test_rejected_session_logs_in_again_and_replays() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/sessions")
        .with_status(201)
        .with_body(json!({"data": {"session-token": "tok-123"}}).to_string())
        .expect(2)
        .create_async()
        .await;
    let rejected = server
        .mock("GET", format!("/accounts/{}/balances", ACCOUNT).as_str())
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", format!("/accounts/{}/balances", ACCOUNT).as_str())
        .match_header("authorization", "tok-123")
        .with_status(200)
        .with_body(
            json!({"data": {"cash-balance": "1000.50", "net-liquidating-value": 2500}})
                .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let client = TastyTradeClient::new(&server.url(), "trader", "secret")
        .unwrap()
        .with_backoff_base(Duration::from_millis(1));
    client.login().await.unwrap();

    let balances = assert_ok!(client.get_balances(ACCOUNT).await);
    assert_eq!(balances.cash_balance, 1000.5);
    assert_eq!(balances.net_liquidating_value, 2500.0);
    assert!(client.is_authenticated().await);

    login.assert_async().await;
    rejected.assert_async().await;
    accepted.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_waits_then_retries() {
    let (mut server, client) = logged_in_server().await;
    let limited = server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(429)
        .with_header("Retry-After", "2")
        .expect(1)
        .create_async()
        .await;
    let ok = server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(200)
        .with_body(positions_body(json!([])))
        .expect(1)
        .create_async()
        .await;

    let positions = assert_ok!(client.get_positions(ACCOUNT).await);
    assert!(positions.is_empty());
    limited.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_gives_up_after_max_retries() {
    let (mut server, client) = logged_in_server().await;
    let limited = server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(429)
        .expect(3)
        .create_async()
        .await;

    let err = assert_err!(client.get_positions(ACCOUNT).await);
    assert!(
        matches!(err.downcast_ref::<BrokerError>(), Some(BrokerError::RateLimited(3))),
        "got {:?}",
        err
    );
    limited.assert_async().await;
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let (mut server, client) = logged_in_server().await;
    let unavailable = server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(503)
        .expect(2)
        .create_async()
        .await;
    let ok = server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(200)
        .with_body(positions_body(json!([{"symbol": "SPY", "quantity": 10}])))
        .expect(1)
        .create_async()
        .await;

    let positions = assert_ok!(client.get_positions(ACCOUNT).await);
    assert_eq!(positions.len(), 1);
    unavailable.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn test_positions_accept_string_numbers() {
    let (mut server, client) = logged_in_server().await;
    server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(200)
        .with_body(positions_body(json!([{
            "symbol": SPY_CALL,
            "instrument-type": "Equity Option",
            "underlying-symbol": "SPY",
            "quantity": "2",
            "quantity-direction": "Long",
            "average-open-price": "3.50",
            "close-price": 4.25
        }])))
        .create_async()
        .await;

    let positions = client.get_positions(ACCOUNT).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].quantity, 2.0);
    assert_eq!(positions[0].average_open_price, 3.5);
    assert_eq!(positions[0].close_price, 4.25);
    assert!(!positions[0].is_short());
}

#[tokio::test]
async fn test_submit_then_cancel_order() {
    let (mut server, client) = logged_in_server().await;
    let submit = server
        .mock("POST", format!("/accounts/{}/orders", ACCOUNT).as_str())
        .match_body(Matcher::Regex("Buy to Open".to_string()))
        .with_status(201)
        .with_body(json!({"data": {"order": {"id": 12345, "status": "Received"}}}).to_string())
        .create_async()
        .await;
    let cancel = server
        .mock("DELETE", format!("/accounts/{}/orders/12345", ACCOUNT).as_str())
        .with_status(200)
        .with_body(json!({"data": {"id": 12345, "status": "Cancel Requested"}}).to_string())
        .create_async()
        .await;

    let orders = OrderManager::new(client, ACCOUNT);
    let order = create_equity_option_order(
        SPY_CALL,
        1,
        OrderAction::BuyToOpen,
        OrderType::Market,
        None,
        TimeInForce::Day,
    )
    .unwrap();

    let placed = orders.submit_order(&order).await.unwrap();
    assert_eq!(placed.id, "12345");
    assert_eq!(orders.active_orders().len(), 1);

    orders.cancel_order(&placed.id).await.unwrap();
    assert!(orders.active_orders().is_empty());
    assert_eq!(orders.order_history_len(), 1);

    submit.assert_async().await;
    cancel.assert_async().await;
}

#[tokio::test]
async fn test_order_error_status_is_surfaced() {
    let (mut server, client) = logged_in_server().await;
    server
        .mock("POST", format!("/accounts/{}/orders", ACCOUNT).as_str())
        .with_status(422)
        .with_body(r#"{"error": {"code": "preflight_check_failure"}}"#)
        .create_async()
        .await;

    let orders = OrderManager::new(client, ACCOUNT);
    let order = create_stop_order(SPY_CALL, 1, OrderAction::SellToClose, 2.10);
    let err = orders.submit_order(&order).await.unwrap_err();

    assert!(err.to_string().contains("422"), "got {}", err);
    assert!(orders.active_orders().is_empty());
}

#[tokio::test]
async fn test_kill_all_cancels_working_orders_and_flattens() {
    let (mut server, client) = logged_in_server().await;
    server
        .mock("GET", format!("/accounts/{}/orders/live", ACCOUNT).as_str())
        .with_status(200)
        .with_body(
            json!({"data": {"items": [
                {"id": 1, "status": "Live"},
                {"id": 2, "status": "Filled"}
            ]}})
            .to_string(),
        )
        .create_async()
        .await;
    let cancel = server
        .mock("DELETE", format!("/accounts/{}/orders/1", ACCOUNT).as_str())
        .with_status(204)
        .create_async()
        .await;
    server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(200)
        .with_body(positions_body(json!([
            {"symbol": SPY_CALL, "quantity": 2, "quantity-direction": "Long"},
            {"symbol": "AAPL", "quantity": "100", "quantity-direction": "Short"}
        ])))
        .create_async()
        .await;
    let sell = server
        .mock("POST", format!("/accounts/{}/orders", ACCOUNT).as_str())
        .match_body(Matcher::Regex("Sell to Close".to_string()))
        .with_status(201)
        .with_body(json!({"data": {"order": {"id": 7, "status": "Received"}}}).to_string())
        .create_async()
        .await;
    let cover = server
        .mock("POST", format!("/accounts/{}/orders", ACCOUNT).as_str())
        .match_body(Matcher::Regex("Buy to Close".to_string()))
        .with_status(201)
        .with_body(json!({"data": {"order": {"id": 8, "status": "Received"}}}).to_string())
        .create_async()
        .await;

    let orders = OrderManager::new(client, ACCOUNT);
    let report = orders.kill_all_orders().await.unwrap();

    assert_eq!(report.orders_canceled, 1);
    assert_eq!(report.positions_closed, 2);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    cancel.assert_async().await;
    sell.assert_async().await;
    cover.assert_async().await;
}

#[tokio::test]
async fn test_kill_all_cancels_orders_with_unexpected_shape() {
    let (mut server, client) = logged_in_server().await;
    server
        .mock("GET", format!("/accounts/{}/orders/live", ACCOUNT).as_str())
        .with_status(200)
        .with_body(
            json!({"data": {"items": [
                {"id": 1, "status": 5},
                {"id": 2, "status": "Live"},
                {"status": "Live"}
            ]}})
            .to_string(),
        )
        .create_async()
        .await;
    let cancel_odd = server
        .mock("DELETE", format!("/accounts/{}/orders/1", ACCOUNT).as_str())
        .with_status(204)
        .create_async()
        .await;
    let cancel_live = server
        .mock("DELETE", format!("/accounts/{}/orders/2", ACCOUNT).as_str())
        .with_status(204)
        .create_async()
        .await;
    server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(200)
        .with_body(positions_body(json!([])))
        .create_async()
        .await;

    let orders = OrderManager::new(client, ACCOUNT);
    let report = orders.kill_all_orders().await.unwrap();

    assert_eq!(report.orders_canceled, 2);
    assert_eq!(report.positions_closed, 0);
    cancel_odd.assert_async().await;
    cancel_live.assert_async().await;
}

#[tokio::test]
async fn test_live_orders_without_items_is_an_error() {
    let (mut server, client) = logged_in_server().await;
    server
        .mock("GET", format!("/accounts/{}/orders/live", ACCOUNT).as_str())
        .with_status(200)
        .with_body(json!({"data": {}}).to_string())
        .create_async()
        .await;

    let orders = OrderManager::new(client, ACCOUNT);
    let err = assert_err!(orders.kill_all_orders().await);
    assert!(err.to_string().contains("live orders"), "got {}", err);
}

async fn mock_streamer_symbol(server: &mut ServerGuard) {
    server
        .mock(
            "GET",
            Matcher::Regex("^/instruments/equity-options/".to_string()),
        )
        .with_status(200)
        .with_body(
            json!({"data": {"symbol": SPY_CALL, "streamer-symbol": SPY_CALL_STREAMER}})
                .to_string(),
        )
        .create_async()
        .await;
}

fn option_quote(symbol: &str, bid: f64, ask: f64) -> QuoteEvent {
    QuoteEvent {
        symbol: symbol.to_string(),
        bid,
        ask,
        bid_size: 10.0,
        ask_size: 10.0,
        time: Utc::now(),
    }
}

fn executor_with(client: TastyTradeClient, positions: Vec<OptionPosition>) -> TradeExecutor {
    TradeExecutor::new(
        Arc::new(OrderManager::new(client, ACCOUNT)),
        Arc::new(Mutex::new(PositionManager::with_positions(positions))),
        TradingConfig::default(),
        BrokerConfig::default(),
        CandleBuilder::new(&[1, 5]),
    )
}

fn open_position(symbol: &str, entry_price: f64, underlying: f64) -> OptionPosition {
    let contract = OptionContract::from_occ(symbol).unwrap();
    OptionPosition::new(&contract, 1, entry_price, underlying, underlying - 2.0, Utc::now())
}

#[tokio::test]
async fn test_broker_sync_adopts_and_closes() {
    let (mut server, client) = logged_in_server().await;
    server
        .mock("GET", format!("/accounts/{}/positions", ACCOUNT).as_str())
        .with_status(200)
        .with_body(positions_body(json!([{
            "symbol": SPY_CALL,
            "instrument-type": "Equity Option",
            "quantity": 1,
            "quantity-direction": "Long",
            "average-open-price": "3.00",
            "close-price": "3.40"
        }])))
        .create_async()
        .await;

    mock_streamer_symbol(&mut server).await;

    let (commands, mut stream) = mpsc::unbounded_channel();
    let executor = executor_with(client, vec![open_position(QQQ_PUT, 2.0, 380.0)])
        .with_stream_commands(commands);
    executor.sync_with_broker().await.unwrap();

    // The adopted contract streams under its DXLink symbol
    match stream.try_recv() {
        Ok(StreamCommand::Subscribe { symbols, kinds }) => {
            assert_eq!(symbols, vec![SPY_CALL_STREAMER.to_string()]);
            assert_eq!(kinds, vec![EventKind::Quote]);
        }
        other => panic!("expected a subscribe command, got {:?}", other),
    }
    assert!(executor.on_option_quote(&option_quote(SPY_CALL_STREAMER, 3.5, 3.7)));
    assert!(!executor.on_option_quote(&option_quote("SPY", 450.0, 450.1)));

    let pm = executor.position_manager();
    let pm = pm.lock().unwrap();
    let adopted = pm.get_position(SPY_CALL).expect("SPY call adopted");
    assert_eq!(adopted.underlying, "SPY");

    assert!((adopted.current_price - 3.6).abs() < 1e-9);
    assert!((adopted.pnl - 60.0).abs() < 1e-9);

    assert!(pm.get_position(QQQ_PUT).is_none());
    let closed = pm.history().find(|p| p.symbol == QQQ_PUT).expect("QQQ put closed");
    assert_eq!(closed.exit_reason, Some(ExitReason::BrokerSync));
}

#[tokio::test]
async fn test_exit_trade_sells_to_close_at_quoted_price() {
    let (mut server, client) = logged_in_server().await;
    let sell = server
        .mock("POST", format!("/accounts/{}/orders", ACCOUNT).as_str())
        .match_body(Matcher::Regex("Sell to Close".to_string()))
        .with_status(201)
        .with_body(json!({"data": {"order": {"id": 99, "status": "Received"}}}).to_string())
        .create_async()
        .await;
    server
        .mock("GET", Matcher::Regex("^/market-data/by-type".to_string()))
        .with_status(200)
        .with_body(
            json!({"data": {"items": [{"symbol": SPY_CALL, "bid": "3.90", "ask": "4.10"}]}})
                .to_string(),
        )
        .create_async()
        .await;

    mock_streamer_symbol(&mut server).await;

    let (commands, mut stream) = mpsc::unbounded_channel();
    let executor = executor_with(client, vec![open_position(SPY_CALL, 3.0, 450.0)])
        .with_stream_commands(commands);
    executor.stream_open_positions().await.unwrap();
    assert!(matches!(stream.try_recv(), Ok(StreamCommand::Subscribe { .. })));

    let closed = executor
        .exit_trade(SPY_CALL, ExitReason::TrendBreak)
        .await
        .unwrap();

    assert_eq!(closed.exit_price, Some(4.0));
    assert_eq!(closed.exit_reason, Some(ExitReason::TrendBreak));
    assert!((closed.pnl - 100.0).abs() < 1e-9);
    assert_eq!(executor.position_manager().lock().unwrap().position_count(), 0);
    sell.assert_async().await;

    match stream.try_recv() {
        Ok(StreamCommand::Unsubscribe { symbols, .. }) => {
            assert_eq!(symbols, vec![SPY_CALL_STREAMER.to_string()]);
        }
        other => panic!("expected an unsubscribe command, got {:?}", other),
    }
    assert!(!executor.on_option_quote(&option_quote(SPY_CALL_STREAMER, 4.0, 4.2)));
}
