//! Tether master — entry point.
//!
//! ```text
//! tether-master                    Share the screen on the default port
//! tether-master --config <path>    Load a custom config TOML
//! tether-master --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_master::config::MasterConfig;
use tether_master::service::MasterService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-master", about = "Tether screen-share source")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-master.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&MasterConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let config = MasterConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tether-master v{}", env!("CARGO_PKG_VERSION"));
    info!("port: {} ({})", config.network.port, config.network.mode);
    info!(
        "stream: {}x{} @ {}fps, {} bytes/frame",
        config.stream.width, config.stream.height, config.stream.fps, config.stream.frame_bytes
    );

    let service = MasterService::new(config);
    service.run().await?;

    Ok(())
}
