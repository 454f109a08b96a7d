use anyhow::Result;
use binance_futures_bot::backtester::{BacktestConfig, Backtester};
use binance_futures_bot::binance::FuturesClient;
use binance_futures_bot::config::Config;
use clap::{Arg, Command};
use log::info;
use rust_decimal::Decimal;
use std::str::FromStr;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("Binance Futures Bot Backtester")
        .version("1.0")
        .about("Backtest the regime-aware futures strategy against historical data")
        .arg(
            Arg::new("start-date")
                .long("start-date")
                .help("Start date for backtest (YYYY-MM-DD)")
                .default_value("2024-01-01")
                .required(false),
        )
        .arg(
            Arg::new("end-date")
                .long("end-date")
                .help("End date for backtest (YYYY-MM-DD)")
                .default_value("2024-01-31")
                .required(false),
        )
        .arg(
            Arg::new("initial-balance")
                .long("initial-balance")
                .help("Initial balance for backtest (USDT)")
                .default_value("1000")
                .required(false),
        )
        .arg(
            Arg::new("symbol")
                .long("symbol")
                .help("Trading symbol (e.g., BTCUSDT)")
                .required(false),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .help("Base data interval (1m, 5m, 15m, 1h)")
                .default_value("5m")
                .required(false),
        )
        .arg(
            Arg::new("commission")
                .long("commission")
                .help("Taker commission rate (e.g., 0.0004 for 0.04%)")
                .default_value("0.0004")
                .required(false),
        )
        .arg(
            Arg::new("slippage")
                .long("slippage")
                .help("Slippage rate (e.g., 0.0001 for 0.01%)")
                .default_value("0.0001")
                .required(false),
        )
        .arg(
            Arg::new("leverage")
                .long("leverage")
                .help("Fixed leverage override; defaults to the account tier table")
                .required(false),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("export")
                .long("export")
                .help("Export the trade list to a CSV file")
                .value_name("FILE")
                .required(false),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let mut config = Config::load()?;

    if let Some(symbol) = matches.get_one::<String>("symbol") {
        config.trading.symbol = symbol.clone();
    }

    info!("Starting backtest for {}", config.trading.symbol);

    let leverage = matches
        .get_one::<String>("leverage")
        .map(|l| l.parse::<u32>())
        .transpose()?;

    let backtest_config = BacktestConfig {
        start_date: matches.get_one::<String>("start-date").unwrap().clone(),
        end_date: matches.get_one::<String>("end-date").unwrap().clone(),
        initial_balance: Decimal::from_str(matches.get_one::<String>("initial-balance").unwrap())?,
        commission_rate: Decimal::from_str(matches.get_one::<String>("commission").unwrap())?,
        slippage: Decimal::from_str(matches.get_one::<String>("slippage").unwrap())?,
        data_interval: matches.get_one::<String>("interval").unwrap().clone(),
        max_klines_per_request: 1000,
        leverage,
    };

    let client = FuturesClient::new(
        config.binance.api_key.clone(),
        config.binance.secret_key.clone(),
        config.binance.base_url.clone(),
        config.binance.recv_window,
    );

    let mut backtester = Backtester::new(client, backtest_config.clone(), config)?;

    info!(
        "Running backtest from {} to {}",
        backtest_config.start_date, backtest_config.end_date
    );
    let results = backtester.run_backtest().await?;

    print_results(&results);

    if let Some(export_file) = matches.get_one::<String>("export") {
        export_results_to_csv(&results, export_file)?;
        info!("Results exported to {}", export_file);
    }

    Ok(())
}

fn print_results(results: &binance_futures_bot::backtester::BacktestResults) {
    println!();
    println!("==================== BACKTEST RESULTS ====================");
    println!();

    println!("PERFORMANCE SUMMARY");
    println!("   Initial Balance:    ${:.2}", results.initial_balance);
    println!("   Final Balance:      ${:.2}", results.final_balance);
    println!("   Total Return:       ${:.2}", results.total_return);
    println!("   Return Percentage:  {:.2}%", results.total_return_pct);
    println!("   Total Commission:   ${:.2}", results.total_commission);
    println!();

    println!("TRADING STATISTICS");
    println!("   Total Trades:       {}", results.total_trades);
    println!("   Winning Trades:     {}", results.winning_trades);
    println!("   Losing Trades:      {}", results.losing_trades);
    println!("   Win Rate:           {:.2}%", results.win_rate);
    println!("   Average Win:        ${:.4}", results.avg_win);
    println!("   Average Loss:       ${:.4}", results.avg_loss);
    println!("   Largest Win:        ${:.4}", results.largest_win);
    println!("   Largest Loss:       ${:.4}", results.largest_loss);
    println!("   Profit Factor:      {:.2}", results.profit_factor);
    println!();

    println!("RISK METRICS");
    println!("   Max Drawdown:       ${:.2}", results.max_drawdown);
    println!("   Max Drawdown %:     {:.2}%", results.max_drawdown_pct);
    println!("   Sharpe Ratio:       {:.2}", results.sharpe_ratio);
    println!();

    println!("RECENT TRADES (Last 10)");
    let recent_trades = results.trades.iter().rev().take(10).collect::<Vec<_>>();

    if !recent_trades.is_empty() {
        println!("   ID    Side  Lev  Entry Price  Exit Price   P&L      Reason");
        println!("   ----------------------------------------------------------------");

        let open_text = "Open".to_string();

        for trade in recent_trades {
            let exit_price = trade
                .exit_price
                .map(|p| format!("{:.4}", p))
                .unwrap_or_else(|| "N/A".to_string());

            let pnl = trade
                .pnl
                .map(|p| format!("{:+.4}", p))
                .unwrap_or_else(|| "N/A".to_string());

            let reason = trade.exit_reason.as_ref().unwrap_or(&open_text);

            println!(
                "   {:3}   {:4}  {:2}x  {:10.4}  {:>10}  {:>8}  {}",
                trade.id, trade.side, trade.leverage, trade.entry_price, exit_price, pnl, reason
            );
        }
    } else {
        println!("   No trades executed during backtest period.");
    }

    println!();
    println!("==========================================================");

    if results.total_return_pct > Decimal::ZERO {
        println!("Strategy was PROFITABLE during the backtest period");
    } else {
        println!("Strategy was UNPROFITABLE during the backtest period");
    }

    if results.win_rate > 50.0 {
        println!("Win rate above 50%");
    }

    if results.profit_factor > Decimal::ONE {
        println!("Positive profit factor (wins > losses)");
    }

    if results.max_drawdown_pct >= Decimal::from(10) {
        println!("WARNING: high drawdown (>= 10%)");
    }

    println!();
}

fn export_results_to_csv(
    results: &binance_futures_bot::backtester::BacktestResults,
    filename: &str,
) -> Result<()> {
    use std::fs::File;
    use std::io::Write;

    let mut file = File::create(filename)?;

    writeln!(
        file,
        "trade_id,symbol,side,leverage,entry_time,exit_time,entry_price,exit_price,quantity,commission,pnl,exit_reason"
    )?;

    for trade in &results.trades {
        let exit_time = trade
            .exit_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "N/A".to_string());

        let exit_price = trade
            .exit_price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "N/A".to_string());

        let pnl = trade
            .pnl
            .map(|p| p.to_string())
            .unwrap_or_else(|| "N/A".to_string());

        let open_text = "Open".to_string();
        let exit_reason = trade.exit_reason.as_ref().unwrap_or(&open_text);

        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            trade.id,
            trade.symbol,
            trade.side,
            trade.leverage,
            trade.entry_time.format("%Y-%m-%d %H:%M:%S"),
            exit_time,
            trade.entry_price,
            exit_price,
            trade.quantity,
            trade.commission,
            pnl,
            exit_reason
        )?;
    }

    Ok(())
}
