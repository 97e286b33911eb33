//! Tether client — entry point.
//!
//! ```text
//! tether-client                    Connect using the default config
//! tether-client --config <path>   Load a custom config TOML
//! tether-client --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_client::config::ViewerConfig;
use tether_client::service::ViewerService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-client", about = "Tether screen-share viewer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-client.toml")]
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
        let text = toml::to_string_pretty(&ViewerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let config = ViewerConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tether-client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "master: {}:{} ({})",
        config.network.host, config.network.port, config.network.mode
    );
    info!(
        "retry: {} attempts every {}ms{}",
        config.retry.max_attempts,
        config.retry.delay_ms,
        if config.retry.exponential {
            ", exponential"
        } else {
            ""
        }
    );

    let service = ViewerService::new(config);
    service.run().await?;

    Ok(())
}
