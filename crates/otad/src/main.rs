use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};

use otad::agent::{Agent, Controller};
use otad::config::Config;
use otad::device::{BlockDevice, UBootEnv};
use otad::states::{ControlHandle, StateMachine};
use otad::store::DirStore;

#[derive(Parser)]
#[command(name = "otad", version, about = "Over-the-air update agent")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the data directory from config.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Regenerate the device key on the next bootstrap.
    #[arg(long)]
    force_bootstrap: bool,
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    info!("otad v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.daemon.data_dir = dir.display().to_string();
    }

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    debug!(data_dir = %data_dir.display(), server = %config.server.url, "configuration loaded");

    let store = DirStore::new(&data_dir);
    let device = BlockDevice::from_config(&config, Box::new(UBootEnv::default()));
    let mut agent = Agent::new(config.clone(), Box::new(store), Box::new(device))
        .context("failed to initialize agent")?;
    if cli.force_bootstrap {
        agent.force_bootstrap();
    }

    let (mut machine, handle) =
        StateMachine::new(config.reporting.fail_deployment_on_report_error);
    spawn_signal_supervisor(handle)?;

    machine.run(&mut agent).await;
    info!("otad exiting");
    Ok(())
}

/// SIGTERM/SIGINT stop the agent at the next wait; SIGUSR1 wakes a waiting
/// state early so an operator can force an immediate poll.
fn spawn_signal_supervisor(mut handle: ControlHandle) -> Result<()> {
    let mut term =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut usr1 =
        signal(SignalKind::user_defined1()).context("failed to register SIGUSR1 handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("SIGTERM received, stopping agent");
                    handle.stop();
                    break;
                }
                _ = int.recv() => {
                    info!("SIGINT received, stopping agent");
                    handle.stop();
                    break;
                }
                _ = usr1.recv() => {
                    if handle.cancel() {
                        info!("SIGUSR1 received, forcing immediate poll");
                    } else {
                        debug!("SIGUSR1 received but a wake is already pending");
                    }
                }
            }
        }
    });
    Ok(())
}
