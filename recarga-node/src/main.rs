//! Recarga Node - CLI for the charging broker and simulated points
//!
//! # Usage
//!
//! ```bash
//! # Broker on the default port, history kept in memory
//! recarga-node broker --region regiao.json
//!
//! # Broker with a persistent history file
//! recarga-node broker --region regiao.json --history data/historico.json
//!
//! # One charging point per process
//! recarga-node point --broker 127.0.0.1:5000
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use recarga_broker::{Broker, BrokerConfig, HistoryStore, JsonFileHistory, MemoryHistory, DEFAULT_PORT};
use recarga_core::Region;
use recarga_point::PointConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// EV charging dispatch broker and charging point simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central broker
    Broker {
        /// Address to listen on
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        listen: SocketAddr,

        /// Region descriptor (coverage area and point locations)
        #[arg(long, default_value = "regiao.json")]
        region: PathBuf,

        /// Charge history file; history is kept in memory when omitted
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Run one simulated charging point
    Point {
        /// Broker address
        #[arg(long, default_value = "127.0.0.1:5000")]
        broker: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .with_target(false)
        .init();

    match args.command {
        Command::Broker {
            listen,
            region,
            history,
        } => run_broker(listen, region, history).await,
        Command::Point { broker } => run_point(broker).await,
    }
}

async fn run_broker(
    listen: SocketAddr,
    region_path: PathBuf,
    history_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let region = Region::load(&region_path)?;

    let history: Arc<dyn HistoryStore> = match &history_path {
        Some(path) => Arc::new(JsonFileHistory::open(path)?),
        None => Arc::new(MemoryHistory::new()),
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              Recarga - EV Charging Dispatch Broker           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", listen);
    println!("║  Region:   {:<50} ║", truncate(&region_path.display().to_string(), 50));
    println!("║  Points:   {:<50} ║", region.point_count());
    println!(
        "║  History:  {:<50} ║",
        history_path
            .as_ref()
            .map(|p| truncate(&p.display().to_string(), 50))
            .unwrap_or_else(|| "in memory".to_string())
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let broker = Broker::new(BrokerConfig::new(listen), region, history);
    let bound = match broker.bind().await {
        Ok(bound) => bound,
        Err(e) => {
            error!("Broker: cannot listen on {}: {}", listen, e);
            return Err(e.into());
        }
    };

    info!("Broker: ready on {}", bound.local_addr());
    bound.run().await;
    Ok(())
}

async fn run_point(broker: String) -> Result<(), Box<dyn std::error::Error>> {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                Recarga - Simulated Charging Point            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Broker:   {:<50} ║", truncate(&broker, 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    recarga_point::run(PointConfig::new(broker)).await?;
    info!("Point: stopped");
    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
