mod config;
mod mock_venue;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use tradebridge_brokers_common::{Connector, Credentials, RpcClient, StreamTransport, WsConnector};
use tradebridge_brokers_synthetic::SyntheticBroker;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "tradebridge")]
#[command(about = "Synthetic limit orders, net positions and FX rates over a quote-streaming venue")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Path to the TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run against an in-process simulated venue
    #[arg(long, global = true)]
    dry_run: bool,

    /// Venue login
    #[arg(long, env = "TRADEBRIDGE_USER", global = true)]
    user: Option<String>,

    /// Venue password
    #[arg(long, env = "TRADEBRIDGE_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the instruments offered by the venue
    Symbols,

    /// Stream quotes for a symbol until interrupted
    Quotes {
        /// Instrument symbol (e.g. "EURUSD")
        #[arg(short, long)]
        symbol: String,

        /// Stop after this many quotes
        #[arg(long)]
        count: Option<usize>,
    },

    /// Print the conversion rate between two currencies
    Fx {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },

    /// Print net positions derived from open venue positions
    Positions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = AppConfig::load(cli.config.as_deref())?;
    let broker = connect(&cli, config).await?;

    let outcome = match cli.command {
        Commands::Symbols => print_symbols(&broker).await,
        Commands::Quotes { symbol, count } => stream_quotes(&broker, &symbol, count).await,
        Commands::Fx { from, to } => print_fx(&broker, &from, &to).await,
        Commands::Positions => print_positions(&broker).await,
    };
    broker.shutdown();
    outcome
}

async fn connect(cli: &Cli, config: AppConfig) -> Result<SyntheticBroker> {
    let mut credentials = config.credentials(cli.user.clone(), cli.password.clone());
    let connector: Arc<dyn Connector> = if cli.dry_run {
        info!("dry run: using simulated venue");
        credentials.get_or_insert_with(|| Credentials {
            user: "dry-run".to_string(),
            password: "dry-run".to_string(),
            app_name: None,
        });
        Arc::new(mock_venue::spawn(Duration::from_millis(250)))
    } else {
        Arc::new(WsConnector::new(config.transport.url.clone()))
    };
    let Some(credentials) = credentials else {
        bail!("no credentials: pass --user/--password, set TRADEBRIDGE_USER/TRADEBRIDGE_PASSWORD or use the [credentials] table");
    };

    let transport = StreamTransport::new(connector, config.transport);
    let broker = SyntheticBroker::new(RpcClient::new(transport), config.hub, config.broker);
    broker.connect(credentials).await.context("login failed")?;
    Ok(broker)
}

async fn print_symbols(broker: &SyntheticBroker) -> Result<()> {
    let snapshot = broker.catalog().update().await?;
    println!(
        "{:<12} {:<6} {:<6} {:>9} {:>10} {:>8} {:>4}",
        "SYMBOL", "ASSET", "CCY", "PRECISION", "CONTRACT", "LOT", "FX"
    );
    for info in snapshot.iter() {
        println!(
            "{:<12} {:<6} {:<6} {:>9} {:>10} {:>8} {:>4}",
            info.symbol,
            info.asset,
            info.currency,
            info.precision,
            info.contract_size,
            info.lot_step,
            if info.is_currency_pair { "yes" } else { "" }
        );
    }
    println!("{} instruments", snapshot.len());
    Ok(())
}

async fn stream_quotes(broker: &SyntheticBroker, symbol: &str, count: Option<usize>) -> Result<()> {
    broker.symbol_info(symbol).await?;
    let mut quotes = broker.hub().subscribe(symbol);
    let mut seen = 0usize;
    loop {
        tokio::select! {
            quote = quotes.recv() => {
                let Some(quote) = quote else { break };
                println!(
                    "{} {} bid={} ask={} mid={}",
                    quote.timestamp.format("%H:%M:%S%.3f"),
                    quote.symbol,
                    quote.bid,
                    quote.ask,
                    quote.mid()
                );
                seen += 1;
                if count.is_some_and(|count| seen >= count) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}

async fn print_fx(broker: &SyntheticBroker, from: &str, to: &str) -> Result<()> {
    let rate = broker.fx_rate(from, to).await?;
    let value = rate.wait().await?;
    let legs: Vec<String> = rate
        .legs()
        .iter()
        .map(|leg| if leg.invert { format!("1/{}", leg.symbol) } else { leg.symbol.clone() })
        .collect();
    println!("{}/{} = {}", from, to, value);
    if !legs.is_empty() {
        println!("via {}", legs.join(" * "));
    }
    Ok(())
}

async fn print_positions(broker: &SyntheticBroker) -> Result<()> {
    broker.wait_synced().await?;
    let positions = broker.positions().await?;
    if positions.is_empty() {
        println!("no open positions");
        return Ok(());
    }
    println!("{:<12} {:>12} {:>14}", "SYMBOL", "VOLUME", "AVG COST");
    for (symbol, position) in positions {
        let average_cost = position
            .average_cost
            .map(|cost| cost.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<12} {:>12} {:>14}", symbol, position.volume, average_cost);
    }
    Ok(())
}
