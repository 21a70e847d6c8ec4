//! PVRT sender — entry point.
//!
//! ```text
//! pvrt-send build <file> [-o out.iprog.json]     Compile a file into an IPROG
//! pvrt-send send <file> [--transport auto|quic|…] Compile and deliver a file
//! pvrt-send send --iprog <path>                  Deliver a prebuilt IPROG
//! pvrt-send gen-config                           Print the default config
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pvrt_core::{Blob, CompileWorker, Iprog, Palette};
use pvrt_send::config::SenderConfig;
use pvrt_send::coordinator::{Coordinator, Mode, TransferState};
use pvrt_send::transport::SendJob;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pvrt-send", about = "Blob-referenced window transfer sender")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "pvrt-send.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a file into an IPROG manifest.
    Build {
        file: PathBuf,
        /// Output path (default: `<file>.iprog.json`).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Deliver a file (or a prebuilt IPROG) to the receiver.
    Send {
        /// File to compile and send.
        #[arg(required_unless_present = "iprog")]
        file: Option<PathBuf>,
        /// Send a prebuilt IPROG manifest instead.
        #[arg(long, conflicts_with = "file")]
        iprog: Option<PathBuf>,
        /// `auto`, or one of quic, webrtc, ws-multi, ws, tcp, https.
        #[arg(short, long, default_value = "auto")]
        transport: Mode,
        /// Transfer id (default: random UUID).
        #[arg(long)]
        transfer_id: Option<String>,
    },
    /// Print the default configuration to stdout and exit.
    GenConfig,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::GenConfig = cli.command {
        println!("{}", toml::to_string_pretty(&SenderConfig::default())?);
        return Ok(());
    }

    let config = SenderConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("pvrt-send v{}", env!("CARGO_PKG_VERSION"));
    info!("blob: {}", config.blob.fingerprint());

    match cli.command {
        Command::Build { file, output } => {
            let iprog = compile(&config, &file).await?;
            let output = output.unwrap_or_else(|| {
                let mut name = file.clone().into_os_string();
                name.push(".iprog.json");
                PathBuf::from(name)
            });
            std::fs::write(&output, iprog.to_json()?)?;
            info!(
                windows = iprog.total_windows(),
                size = iprog.size,
                pvrt_total = iprog.metrics.pvrt_total,
                tx_ratio = iprog.metrics.tx_ratio,
                "wrote {}",
                output.display()
            );
        }
        Command::Send {
            file,
            iprog,
            transport,
            transfer_id,
        } => {
            let iprog = match (iprog, file) {
                (Some(path), _) => Iprog::from_json(&std::fs::read_to_string(path)?)?,
                (None, Some(file)) => compile(&config, &file).await?,
                (None, None) => return Err("nothing to send".into()),
            };
            if iprog.blob != config.blob {
                return Err(format!(
                    "IPROG references blob {} but the config names {}",
                    iprog.blob.fingerprint(),
                    config.blob.fingerprint()
                )
                .into());
            }

            let mut job = SendJob::new(
                transfer_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                Arc::new(iprog),
            );
            job.psk = config.psk();
            job.channels = config.network.channels;
            job.frame_payload = config.network.frame_payload;
            job.binary_control = config.network.binary_control;

            let coordinator = Coordinator::from_config(&config)?;
            let status = coordinator.run(job, transport).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.state != TransferState::Success {
                std::process::exit(1);
            }
        }
        Command::GenConfig => {}
    }

    Ok(())
}

/// Compile `file` on the dedicated worker thread.
async fn compile(config: &SenderConfig, file: &Path) -> Result<Iprog, Box<dyn std::error::Error>> {
    let data = tokio::fs::read(file).await?;
    let blob = Arc::new(Blob::new(config.blob.clone())?);
    let palette = Arc::new(Palette::from_blob(&blob, config.palette.clone())?);
    let worker = CompileWorker::spawn(blob, palette)?;

    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());
    let iprog = worker.build(name, data, config.iprog.clone()).await?;
    worker.shutdown();
    Ok(iprog)
}
