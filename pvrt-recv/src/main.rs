//! PVRT receiver — entry point.
//!
//! ```text
//! pvrt-recv                  Run in the foreground
//! pvrt-recv --config <path>  Load a custom config TOML
//! pvrt-recv --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pvrt_recv::config::ReceiverConfig;
use pvrt_recv::service::ReceiverService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pvrt-recv", about = "Blob-referenced window transfer receiver")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "pvrt-recv.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ReceiverConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = ReceiverConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    info!("pvrt-recv v{}", env!("CARGO_PKG_VERSION"));
    info!(
        blob = %config.blob.name,
        size = config.blob.size,
        seed = config.blob.seed,
        "generating blob"
    );

    let service = ReceiverService::new(config)?;
    let stop = service.stop_handle();

    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
