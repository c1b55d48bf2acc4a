// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use nidus_store::config::{load_config_with_env, LoggingConfig, StoreConfig};
use nidus_store::pidfile::{stop_process, PidFile, ProcessStatus, StopResult};
use nidus_store::{LifecycleController, StoreServer};

const DEFAULT_PID_FILE: &str = "nidus.pid";

/// Nidus - spatio-temporal store for wireless capture records
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// PID file (overrides config file)
    #[arg(short, long)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the store until SIGINT or SIGTERM
    Serve,
    /// Report whether a store process is running
    Status,
    /// Stop a running store process
    Stop,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_lowercase()));

    if logging.format == "json" {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let config = load_config_with_env(&args.config)?;
    init_tracing(&config.logging)?;

    let pid_file = PidFile::new(
        args.pid_file
            .clone()
            .or_else(|| config.lifecycle.pid_file.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
    );

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, &args.config, pid_file).await,
        Command::Status => status(&pid_file),
        Command::Stop => stop(&config, &pid_file).await,
    }
}

async fn serve(
    config: StoreConfig,
    config_path: &std::path::Path,
    pid_file: PidFile,
) -> Result<()> {
    info!("Starting nidus store");
    info!("Loaded configuration from: {:?}", config_path);
    info!("Storage backend: {}", config.storage.backend);

    let pid = pid_file.write()?;
    info!("Wrote pid {} to {}", pid, pid_file.path().display());

    let result = run_store(config).await;

    if let Err(e) = pid_file.remove() {
        warn!("{}", e);
    }
    result
}

async fn run_store(config: StoreConfig) -> Result<()> {
    let controller = Arc::new(LifecycleController::new(config)?);
    let report = controller.start().await?;
    if report.truncated_bytes > 0 {
        warn!("Recovered after dropping {} bytes of torn log tail", report.truncated_bytes);
    }

    let server = StoreServer::bind(controller.clone()).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
    }

    let _ = shutdown_tx.send(true);
    match server_task.await {
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    let outcome = controller.stop().await;
    info!("Nidus store shut down ({:?})", outcome);
    Ok(())
}

fn status(pid_file: &PidFile) -> Result<()> {
    match pid_file.status()? {
        ProcessStatus::Running(pid) => println!("running (pid {})", pid),
        ProcessStatus::Stale(pid) => println!(
            "not running (stale pid {} in {})",
            pid,
            pid_file.path().display()
        ),
        ProcessStatus::NotRunning => println!("not running"),
    }
    Ok(())
}

async fn stop(config: &StoreConfig, pid_file: &PidFile) -> Result<()> {
    let pid = match pid_file.status()? {
        ProcessStatus::Running(pid) => pid,
        ProcessStatus::Stale(pid) => {
            warn!("Removing stale pid file for {}", pid);
            pid_file.remove()?;
            println!("not running");
            return Ok(());
        }
        ProcessStatus::NotRunning => {
            println!("not running");
            return Ok(());
        }
    };

    let result = stop_process(
        pid,
        config.lifecycle.stop_attempts,
        config.lifecycle.stop_interval(),
    )
    .await?;
    match result {
        StopResult::Terminated { attempts } => {
            println!("stopped pid {} after {} signal(s)", pid, attempts)
        }
        StopResult::Killed => {
            // A killed server cannot clean up after itself
            pid_file.remove()?;
            println!("killed pid {}", pid);
        }
    }
    Ok(())
}
