use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use meteor_common::config::{MeteorConfig, CONFIG_FILE};
use meteor_server::{server, Database};

#[derive(Parser, Debug)]
#[command(name = "meteor", about = "Meteor in-memory multi-version key-value database")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: String,

    /// Listen address (overrides config).
    #[arg(long)]
    addr: Option<String>,

    /// Disable the WAL (pure in-memory mode; testing only).
    #[arg(long)]
    no_wal: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = MeteorConfig::load(&cli.config);
    init_tracing(&config.log_level);

    tracing::info!("Starting Meteor...");
    tracing::info!("Config: {:?}", config);

    let use_wal = config.use_wal && !cli.no_wal;
    if !use_wal {
        tracing::warn!("WAL disabled: writes will not survive a restart");
    }

    let db = Arc::new(Database::open(Path::new("."), use_wal)?);
    let addr = cli.addr.unwrap_or_else(|| config.listen_addr());

    server::serve(db, &addr, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
