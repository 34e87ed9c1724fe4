use chrono::{DateTime, Duration, TimeZone, Utc};
use jigsawbot::backtest::{BacktestData, BacktestEngine, BacktestReport, SyntheticDataGenerator};
use jigsawbot::config::{BotConfig, TradingConfig};
use jigsawbot::models::Direction;
use jigsawbot::{DxLinkClient, TastyTradeClient};
use jigsawbot::Result;
use tracing_subscriber::EnvFilter;

/// Bars per synthetic run: five sessions of 5m bars
const SYNTHETIC_BARS: usize = 390;
const PERIOD_MINUTES: u32 = 5;
const HISTORY_DAYS: i64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = BotConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║          JIGSAW FLOW BACKTESTING SUITE                ║");
    println!("╚═══════════════════════════════════════════════════════╝");

    let runs = if config.broker.username.is_empty() {
        println!("\n🧪 No broker credentials, using synthetic data");
        synthetic_runs(&config.trading)
    } else {
        println!("\n📡 Fetching {} days of {}m history from DXLink", HISTORY_DAYS, PERIOD_MINUTES);
        historical_runs(&config).await?
    };

    let engine = BacktestEngine::new(config.trading.clone());
    let mut reports = Vec::new();

    for (name, data) in runs {
        match engine.run(&data) {
            Ok(report) => {
                report.print_report();
                reports.push((name, report));
            }
            Err(e) => {
                eprintln!("❌ Backtest failed for {}: {}", name, e);
            }
        }
    }

    print_summary_comparison(&reports);

    Ok(())
}

/// One bullish and one bearish market per ticker
fn synthetic_runs(trading: &TradingConfig) -> Vec<(String, BacktestData)> {
    let start = session_open();
    let mut runs = Vec::new();

    for (i, ticker) in trading.tickers.iter().enumerate() {
        for (j, direction) in [Direction::Bullish, Direction::Bearish].into_iter().enumerate() {
            let mut generator = SyntheticDataGenerator::new(42 + (i * 2 + j) as u64);
            let data = generator.generate_market(
                ticker,
                direction,
                &trading.sector_etfs,
                &trading.mag7_stocks,
                SYNTHETIC_BARS,
                PERIOD_MINUTES,
                start,
            );
            runs.push((format!("{} {}", ticker, direction), data));
        }
    }
    runs
}

async fn historical_runs(config: &BotConfig) -> Result<Vec<(String, BacktestData)>> {
    let client = TastyTradeClient::new(
        &config.broker.base_url,
        &config.broker.username,
        &config.broker.password,
    )?;
    client.login().await?;

    let trading = &config.trading;
    let timeframe = format!("{}m", PERIOD_MINUTES);
    let from = Utc::now() - Duration::days(HISTORY_DAYS);

    let mut breadth = Vec::new();
    for symbol in &trading.sector_etfs {
        let candles = DxLinkClient::fetch_candles(&client, symbol, &timeframe, from).await?;
        breadth.push((symbol.clone(), candles, false));
    }
    if trading.use_mag7_confirmation {
        for symbol in &trading.mag7_stocks {
            let candles = DxLinkClient::fetch_candles(&client, symbol, &timeframe, from).await?;
            breadth.push((symbol.clone(), candles, true));
        }
    }

    let mut runs = Vec::new();
    for ticker in &trading.tickers {
        let candles = DxLinkClient::fetch_candles(&client, ticker, &timeframe, from).await?;
        if candles.is_empty() {
            tracing::warn!("No history for {}, skipping", ticker);
            continue;
        }

        let mut data = BacktestData {
            symbol: ticker.clone(),
            candles,
            ..Default::default()
        };
        for (symbol, series, is_mag7) in &breadth {
            if *is_mag7 {
                data.add_mag7(symbol, series);
            } else {
                data.add_sector(symbol, series);
            }
        }
        runs.push((ticker.clone(), data));
    }

    Ok(runs)
}

/// Fixed session start so synthetic runs are reproducible (09:30 ET)
fn session_open() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 25, 14, 30, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn print_summary_comparison(results: &[(String, BacktestReport)]) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              RUN COMPARISON                           ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    println!(
        "{:<20} {:>8} {:>10} {:>8} {:>20}",
        "Run", "Signals", "Return%", "Equity", "Best Method"
    );
    println!("{}", "─".repeat(70));

    for (name, report) in results {
        println!(
            "{:<20} {:>8} {:>10.2} {:>8.2} {:>20}",
            name,
            report.counts.trades_entered,
            report.total_return_pct(),
            report.final_equity,
            report.best_method.map_or("none", |m| m.label())
        );
    }

    println!("\n");

    if let Some((best_name, best)) = results.iter().max_by(|a, b| {
        a.1.total_return_pct().total_cmp(&b.1.total_return_pct())
    }) {
        println!("🏆 Best Run: {} ({:+.2}%)", best_name, best.total_return_pct());
    }

    if let Some((worst_name, worst)) = results.iter().min_by(|a, b| {
        a.1.total_return_pct().total_cmp(&b.1.total_return_pct())
    }) {
        println!("⚠️  Worst Run: {} ({:+.2}%)", worst_name, worst.total_return_pct());
    }

    // Wins per method across runs
    let total_trades: usize = results.iter().map(|(_, r)| r.trades.len()).sum();
    println!("\n📊 Overall Statistics:");
    println!("   Total Trades Across All Runs: {}", total_trades);
    for method in jigsawbot::config::TrailingStopMethod::ALL {
        let wins = results
            .iter()
            .filter(|(_, r)| r.best_method == Some(method))
            .count();
        println!("   {:<18} best in {} run(s)", method.label(), wins);
    }

    println!("\n═══════════════════════════════════════════════════════\n");
}
