use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use biped_zenoh_runtime::config::RobotConfig;

/// Biped robot runtime: simulated servos, gait and mode control over Zenoh
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON config file; missing fields use built-in defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Drive real servos on this serial port (enables hardware output)
    #[arg(long)]
    serial_port: Option<String>,

    /// Zenoh endpoint to connect to, e.g. tcp/192.168.1.40:7447 (repeatable)
    #[arg(long = "connect")]
    endpoints: Vec<String>,
}

fn load_config(args: &Args) -> Result<RobotConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            RobotConfig::load(path)?
        }
        None => RobotConfig::default(),
    };
    if let Some(port) = &args.serial_port {
        config.hardware.enabled = true;
        config.hardware.port = port.clone();
    }
    if !args.endpoints.is_empty() {
        config.sync.endpoints = args.endpoints.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let result = match load_config(&args) {
        Ok(config) => biped_zenoh_runtime::runtime::run(config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
