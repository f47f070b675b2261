//! CLI entry point for the loopcast stream daemon
//!
//! Parses command line arguments, runs preflight checks, then serves the
//! control API until Ctrl-C.

use clap::Parser;
use loopcast_daemon::{
    ensure_directories, run_server, run_startup_checks, Config, Engine, FfmpegLauncher,
    TranscodeSettings,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Loopcast - loop uploaded media to RTMP destinations
#[derive(Parser, Debug)]
#[command(name = "loopcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Address to serve the API on, overriding server.bind_addr
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip startup checks (ffmpeg version and encoders). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config = %args.config.display(), "loopcast starting");

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!(error = %e, "startup checks failed");
        return ExitCode::FAILURE;
    }

    if let Err(e) = ensure_directories(&config) {
        error!(error = %e, "failed to prepare directories");
        return ExitCode::FAILURE;
    }

    let bind = args.bind.as_deref().unwrap_or(&config.server.bind_addr);
    let addr: SocketAddr = match bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(bind, error = %e, "invalid bind address");
            return ExitCode::FAILURE;
        }
    };

    let launcher = Arc::new(FfmpegLauncher::new(TranscodeSettings::from_config(
        &config.transcoder,
    )));
    let (engine, handle) = Engine::new(&config, launcher);
    let engine_task = tokio::spawn(engine.run());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown requested");
    };

    let served = run_server(handle.clone(), addr, shutdown).await;

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "engine already stopped");
    }
    if let Err(e) = engine_task.await {
        error!(error = %e, "engine task panicked");
    }

    match served {
        Ok(()) => {
            info!("loopcast stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
