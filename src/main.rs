use chrono::{Duration as ChronoDuration, Utc};
use jigsawbot::api::{DxLinkClient, EventKind, OrderManager, StreamCommand, TastyTradeClient};
use jigsawbot::config::BotConfig;
use jigsawbot::db::PostgresPersistence;
use jigsawbot::execution::{CandleBuilder, PositionManager, TradeExecutor};
use jigsawbot::models::{Candle, MarketEvent};
use jigsawbot::persistence::RedisPersistence;
use jigsawbot::strategy::JigsawStrategy;
use jigsawbot::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const SCAN_INTERVAL: Duration = Duration::from_secs(60);
const MANAGE_INTERVAL: Duration = Duration::from_secs(15);
const SYNC_INTERVAL: Duration = Duration::from_secs(300);
/// Redis keeps two trading days of bars
const CANDLE_RETENTION_HOURS: i64 = 48;
const CLEANUP_EVERY_CANDLES: u32 = 500;
/// Bars restored per (symbol, period) at start
const SEED_CANDLES: usize = 100;
const STALE_POSITION_HOURS: i64 = 24;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = BotConfig::load()?;
    setup_logging(&config);

    tracing::info!("🚀 Jigsaw Flow bot starting");

    // Broker session
    let client = TastyTradeClient::new(
        &config.broker.base_url,
        &config.broker.username,
        &config.broker.password,
    )?;
    client.login().await?;
    let account = client
        .resolve_account_number(config.broker.account_id.as_deref())
        .await?;
    let quote_token = client.get_quote_token().await?;
    let orders = Arc::new(OrderManager::new(client.clone(), &account));

    // Persistence
    let postgres = connect_to_postgres(&config.database.postgres_url)
        .await
        .map(Arc::new);
    let position_manager = initialize_position_manager(postgres.as_deref()).await;
    let mut redis = connect_to_redis(&config.database.redis_url).await;

    // Candles and strategy
    let (candles, completed_rx) = CandleBuilder::with_completion_channel();
    let strategy = Arc::new(JigsawStrategy::new(config.trading.clone(), candles.clone())?);
    let symbols = strategy.watch_symbols();

    if let Some(redis) = redis.as_mut() {
        seed_candles(redis, &candles, &symbols).await;
    }

    let (command_tx, command_rx) = mpsc::unbounded_channel::<StreamCommand>();
    let mut executor = TradeExecutor::new(
        orders.clone(),
        position_manager.clone(),
        config.trading.clone(),
        config.broker.clone(),
        candles.clone(),
    )
    .with_stream_commands(command_tx);
    if let Some(db) = &postgres {
        executor = executor.with_persistence(db.clone());
    }
    let executor = Arc::new(executor);

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Account: {}", account);
    tracing::info!("  Tickers: {}", config.trading.tickers.join(", "));
    tracing::info!("  Sectors: {}", config.trading.sector_etfs.join(", "));
    tracing::info!("  Trailing stop: {}", config.trading.trailing_stop_method.label());
    tracing::info!("  Contracts per trade: {}", config.trading.contracts_per_trade);
    tracing::info!(
        "  Auto trading: {}",
        if config.broker.auto_trading_enabled { "ON" } else { "OFF (dry run)" }
    );

    // Market data stream
    let mut stream = DxLinkClient::new(&quote_token.dxlink_url, &quote_token.token)
        .with_token_refresh(client);
    stream.connect().await?;
    stream
        .subscribe(&symbols, &[EventKind::Quote, EventKind::Trade])
        .await?;
    // Restored positions; queued until the stream task starts reading commands
    executor.stream_open_positions().await?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tracing::info!("\n🔄 Spawning independent loops...");

    let stream_task = tokio::spawn(async move {
        if let Err(e) = stream.run(event_tx, command_rx).await {
            tracing::error!("DXLink stream stopped: {}", e);
        }
    });

    let event_task = {
        let candles = candles.clone();
        let strategy = strategy.clone();
        let executor = executor.clone();
        tokio::spawn(async move {
            market_event_loop(event_rx, candles, strategy, executor).await;
        })
    };

    let sweep_task = {
        let candles = candles.clone();
        tokio::spawn(async move {
            candle_sweep_loop(candles).await;
        })
    };

    let persist_task = tokio::spawn(async move {
        candle_persist_loop(completed_rx, redis).await;
    });

    let scan_task = {
        let strategy = strategy.clone();
        let executor = executor.clone();
        let position_manager = position_manager.clone();
        tokio::spawn(async move {
            scan_loop(strategy, executor, position_manager).await;
        })
    };

    let manage_task = {
        let strategy = strategy.clone();
        let executor = executor.clone();
        tokio::spawn(async move {
            manage_loop(strategy, executor).await;
        })
    };

    let sync_task = {
        let executor = executor.clone();
        let position_manager = position_manager.clone();
        tokio::spawn(async move {
            broker_sync_loop(executor, position_manager).await;
        })
    };

    tracing::info!("✅ All loops spawned successfully");
    tracing::info!("  📡 Stream: {} symbols", symbols.len());
    tracing::info!("  🕯️  Candle sweep: every {:?}", SWEEP_INTERVAL);
    tracing::info!("  🔍 Scan: every {:?}", SCAN_INTERVAL);
    tracing::info!("  💹 Manage: every {:?}", MANAGE_INTERVAL);
    tracing::info!("  🔄 Broker sync: every {:?}", SYNC_INTERVAL);
    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = stream_task => {
            tracing::error!("Stream task exited: {:?}", result);
        }
        result = event_task => {
            tracing::error!("Market event loop exited: {:?}", result);
        }
        result = sweep_task => {
            tracing::error!("Candle sweep loop exited: {:?}", result);
        }
        result = persist_task => {
            tracing::error!("Candle persist loop exited: {:?}", result);
        }
        result = scan_task => {
            tracing::error!("Scan loop exited: {:?}", result);
        }
        result = manage_task => {
            tracing::error!("Manage loop exited: {:?}", result);
        }
        result = sync_task => {
            tracing::error!("Broker sync loop exited: {:?}", result);
        }
    }

    log_position_summary(&position_manager);
    tracing::info!("👋 Jigsaw Flow bot stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging(config: &BotConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_to_postgres(database_url: &str) -> Option<PostgresPersistence> {
    match PostgresPersistence::new(database_url).await {
        Ok(p) => {
            tracing::info!("Postgres persistence enabled (positions & orders)");
            Some(p)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without persistence",
                e
            );
            None
        }
    }
}

async fn connect_to_redis(redis_url: &str) -> Option<RedisPersistence> {
    match RedisPersistence::new(redis_url).await {
        Ok(r) => {
            tracing::info!("Redis candle storage enabled at {}", redis_url);
            Some(r)
        }
        Err(e) => {
            tracing::warn!("Failed to connect to Redis ({}), candles stay in memory", e);
            None
        }
    }
}

async fn initialize_position_manager(
    postgres: Option<&PostgresPersistence>,
) -> Arc<Mutex<PositionManager>> {
    let Some(postgres) = postgres else {
        return Arc::new(Mutex::new(PositionManager::new()));
    };

    tracing::info!("Loading open positions from Postgres...");
    let positions = match postgres.load_open_positions().await {
        Ok(positions) => {
            if !positions.is_empty() {
                tracing::info!("✓ Restored {} open positions", positions.len());
            }
            positions
        }
        Err(e) => {
            tracing::warn!("Failed to load positions from Postgres: {}", e);
            Vec::new()
        }
    };

    Arc::new(Mutex::new(PositionManager::with_positions(positions)))
}

/// Restore recent bars so indicators are warm before the first scan
async fn seed_candles(redis: &mut RedisPersistence, candles: &CandleBuilder, symbols: &[String]) {
    let end = Utc::now();
    let start = end - ChronoDuration::hours(CANDLE_RETENTION_HOURS);
    let mut restored = 0;

    for symbol in symbols {
        for &period in candles.periods() {
            match redis
                .load_candles(symbol, period, start, end, Some(SEED_CANDLES))
                .await
            {
                Ok(history) if !history.is_empty() => {
                    restored += history.len();
                    if let Err(e) = candles.seed_history(symbol, period, history) {
                        tracing::warn!("Failed to seed {} {}m: {}", symbol, period, e);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to load {} {}m candles: {}", symbol, period, e),
            }
        }
    }

    tracing::info!("✓ Seeded {} candles from Redis", restored);
}

// ============================================================================
// Loops
// ============================================================================

/// Streamed quotes and trades into candles and breadth trackers; option quotes mark positions
async fn market_event_loop(
    mut events: mpsc::UnboundedReceiver<MarketEvent>,
    candles: CandleBuilder,
    strategy: Arc<JigsawStrategy>,
    executor: Arc<TradeExecutor>,
) {
    tracing::info!("📡 Market event loop starting...");

    while let Some(event) = events.recv().await {
        let (result, price, at) = match &event {
            MarketEvent::Quote(quote) if executor.on_option_quote(quote) => continue,
            MarketEvent::Quote(quote) => (candles.process_quote(quote), quote.price(), quote.time),
            MarketEvent::Trade(trade) => {
                (candles.process_trade(trade), Some(trade.price), trade.time)
            }
            _ => continue,
        };

        if let Err(e) = result {
            tracing::warn!("Candle update failed for {}: {}", event.symbol(), e);
        }
        if let Some(price) = price {
            strategy.on_price(event.symbol(), price, at);
        }
    }

    tracing::warn!("Market event channel closed");
}

/// Close candles whose period ended without a new tick
async fn candle_sweep_loop(candles: CandleBuilder) {
    let mut ticker = interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = candles.check_completed_candles(Utc::now()) {
            tracing::warn!("Candle sweep failed: {}", e);
        }
    }
}

/// Completed candles into Redis, with periodic cleanup
async fn candle_persist_loop(
    mut completed: mpsc::UnboundedReceiver<Candle>,
    mut redis: Option<RedisPersistence>,
) {
    let mut saved = 0u32;

    while let Some(candle) = completed.recv().await {
        tracing::debug!(
            "🕯️  {} {}m closed at {:.2}",
            candle.symbol,
            candle.period_minutes,
            candle.close
        );

        let Some(redis) = redis.as_mut() else { continue };
        if let Err(e) = redis.save_candle(&candle).await {
            tracing::warn!("Failed to save {} candle to Redis: {}", candle.symbol, e);
            continue;
        }

        saved += 1;
        if saved % CLEANUP_EVERY_CANDLES == 0 {
            let keep = ChronoDuration::hours(CANDLE_RETENTION_HOURS);
            if let Err(e) = redis
                .cleanup_old(&candle.symbol, candle.period_minutes, keep)
                .await
            {
                tracing::warn!("Failed to clean up {} candles: {}", candle.symbol, e);
            }
        }
    }
}

async fn scan_loop(
    strategy: Arc<JigsawStrategy>,
    executor: Arc<TradeExecutor>,
    position_manager: Arc<Mutex<PositionManager>>,
) {
    tracing::info!("🔍 Scan loop starting...");
    let mut ticker = interval(SCAN_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let now = Utc::now();

        if !strategy.session().is_trading_allowed(now) {
            tracing::debug!("Outside the entry window, skipping scan");
            continue;
        }
        if !strategy.check_data_synchronization(now) {
            continue;
        }

        let active = match position_manager.lock() {
            Ok(pm) => pm.active_underlyings(),
            Err(e) => {
                tracing::error!("Position manager lock poisoned: {}", e);
                continue;
            }
        };

        for signal in strategy.scan_for_trades(now, &active) {
            match executor.enter_trade(&signal).await {
                Ok(decision) => tracing::info!("💹 {}: {}", signal.symbol, decision.reason),
                Err(e) => tracing::error!("❌ Entry failed for {}: {}", signal.symbol, e),
            }
        }
    }
}

async fn manage_loop(strategy: Arc<JigsawStrategy>, executor: Arc<TradeExecutor>) {
    tracing::info!("💹 Trade management loop starting...");
    let mut ticker = interval(MANAGE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = executor.manage_positions(&strategy, Utc::now()).await {
            tracing::error!("Position management failed: {}", e);
        }
    }
}

async fn broker_sync_loop(
    executor: Arc<TradeExecutor>,
    position_manager: Arc<Mutex<PositionManager>>,
) {
    let mut ticker = interval(SYNC_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if let Err(e) = executor.sync_with_broker().await {
            tracing::warn!("Broker sync failed: {}", e);
        }

        if let Ok(mut pm) = position_manager.lock() {
            let stale = pm.cleanup_stale(Utc::now(), ChronoDuration::hours(STALE_POSITION_HOURS));
            for position in &stale {
                tracing::warn!("🧹 Dropped stale position {}", position.symbol);
            }
        }

        log_position_summary(&position_manager);
    }
}

fn log_position_summary(position_manager: &Arc<Mutex<PositionManager>>) {
    let Ok(pm) = position_manager.lock() else {
        return;
    };
    let summary = pm.summary();
    tracing::info!(
        "📊 Positions: {} open ({} calls, {} puts) | unrealized ${:.2} | realized ${:.2} | {} closed, {:.1}% win rate",
        summary.open_positions,
        summary.calls,
        summary.puts,
        summary.unrealized_pnl,
        summary.realized_pnl,
        summary.closed_trades,
        summary.win_rate
    );
}
