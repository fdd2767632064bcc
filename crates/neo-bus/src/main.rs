//! Neo Bus
//!
//! Runs the plugin message bus through a soak scenario and prints its stats.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use neo_bus::config::{LogConfig, NeoBusConfig};

/// Neo plugin message bus
#[derive(Parser, Debug)]
#[command(name = "neo-bus")]
#[command(about = "Neo plugin message bus", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of sensor messages to publish
    #[arg(short, long, default_value = "1000")]
    messages: usize,

    /// Directory of plugin folders, each holding a neo-plugin.json
    #[arg(short, long)]
    plugins: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = NeoBusConfig::load(args.config.as_deref())?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(args, config))
}

async fn async_main(args: Args, config: NeoBusConfig) -> Result<()> {
    init_tracing(&config.log);

    info!("Starting Neo bus v{}", env!("CARGO_PKG_VERSION"));

    let report = neo_bus::soak::run(&config, args.messages, args.plugins.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);

    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
