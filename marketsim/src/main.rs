mod server;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Instrument};

use marketsim_core::{logging, Config};

use server::MarketSimServer;

#[derive(Parser, Debug)]
#[command(name = "marketsim")]
#[command(about = "Market data simulator service", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "MARKETSIM_CONFIG")]
    config: Option<String>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if config.service.advertise_address.trim().is_empty() {
        config.service.advertise_address = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    let root = logging::service_span(&config.service);

    async move {
        info!("MarketSim starting...");
        info!("gRPC address: {}", config.grpc_address());
        info!("HTTP address: {}", config.http_address());

        // 4. Build and run
        let server = MarketSimServer::build(config).await?;
        server.run().await
    }
    .instrument(root)
    .await
}
