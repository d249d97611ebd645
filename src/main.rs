//! CLI Entry Point for neurodaq
//!
//! Provides a command-line interface for:
//! - Running a protocol once, optionally storing its results
//! - Running a protocol over a parameter sweep
//! - Inspecting managed data directories and their logs
//!
//! Devices come from the rig configuration file. Any device a protocol
//! names that the configuration does not define is created as a mock
//! (`MockCamera` when its sub-command asks for `frames`, `MockWaveform`
//! otherwise), so protocols can be tried without hardware.
//!
//! # Usage
//!
//! ```bash
//! neurodaq run protocols/pulse.json --store
//! neurodaq sequence protocols/pulse.json --param "Clamp1.amp = 0 ; [0.5, 1.0]"
//! neurodaq ls data/protocol_000
//! neurodaq log data/protocol_001
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neurodaq::config::DeviceDefinition;
use neurodaq::logging;
use neurodaq::protocol::{Frame, ProtocolCommand, ProtocolRunner, RunnerEvent, SequenceParam};
use neurodaq::store::DataStore;
use neurodaq::{Manager, ManagerConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Parser)]
#[command(name = "neurodaq")]
#[command(about = "Protocol-driven acquisition for neurophysiology rigs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a protocol once
    Run {
        /// Protocol descriptor (.json)
        protocol: PathBuf,

        /// Rig configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Store results under the storage directory
        #[arg(long)]
        store: bool,
    },

    /// Run a protocol over a parameter sweep
    Sequence {
        /// Protocol descriptor (.json)
        protocol: PathBuf,

        /// Swept parameter, `device.param = single ; axisSpec` (repeatable)
        #[arg(long = "param", required = true)]
        params: Vec<String>,

        /// Seed for shuffled axes
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Rig configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Store results under the storage directory
        #[arg(long)]
        store: bool,
    },

    /// List a managed directory in timestamp order
    Ls {
        /// Directory to list
        dir: PathBuf,
    },

    /// Print a directory's log
    Log {
        /// Directory whose log.txt to print
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            protocol,
            config,
            store,
        } => {
            let cmd = load_protocol(&protocol, store)?;
            let manager = start_manager(config.as_deref(), &cmd).await?;
            let runner = ProtocolRunner::new(manager.clone());
            let events = runner.subscribe();
            let result = runner
                .start_single(cmd, Some(manager.get_current_dir()))
                .map_err(anyhow::Error::from);
            let outcome = match result {
                Ok(()) => follow(&runner, events).await,
                Err(e) => Err(e),
            };
            manager.quit().await;
            outcome
        }
        Commands::Sequence {
            protocol,
            params,
            seed,
            config,
            store,
        } => {
            let cmd = load_protocol(&protocol, store)?;
            let params = params
                .iter()
                .map(|p| SequenceParam::parse(p, seed))
                .collect::<Result<Vec<_>, _>>()?;
            let manager = start_manager(config.as_deref(), &cmd).await?;
            let runner = ProtocolRunner::new(manager.clone());
            let events = runner.subscribe();
            let result = runner
                .start_sequence(cmd, params, Some(manager.get_current_dir()))
                .map_err(anyhow::Error::from);
            let outcome = match result {
                Ok(()) => follow(&runner, events).await,
                Err(e) => Err(e),
            };
            manager.quit().await;
            outcome
        }
        Commands::Ls { dir } => list_dir(&dir),
        Commands::Log { dir } => print_log(&dir),
    }
}

fn load_protocol(path: &Path, store: bool) -> Result<ProtocolCommand> {
    let mut cmd = ProtocolCommand::load(path)
        .with_context(|| format!("loading protocol {}", path.display()))?;
    if store {
        cmd.protocol.store_data = true;
    }
    Ok(cmd)
}

async fn start_manager(config_path: Option<&Path>, cmd: &ProtocolCommand) -> Result<Arc<Manager>> {
    let mut config = match config_path {
        Some(path) => ManagerConfig::load_from(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => ManagerConfig::from_env()?,
    };
    logging::init_from_config(&config)?;

    for (name, sub) in &cmd.devices {
        if config.devices.contains_key(name) {
            continue;
        }
        let driver = if sub.get("frames").is_some() {
            "MockCamera"
        } else {
            "MockWaveform"
        };
        tracing::info!(device = %name, driver, "Using mock driver for unconfigured device");
        config.devices.insert(
            name.clone(),
            DeviceDefinition {
                driver: driver.to_string(),
                config: Value::Null,
            },
        );
    }

    Ok(Manager::new(config).await?)
}

/// Print one line per frame until the run ends.
async fn follow(runner: &ProtocolRunner, mut events: broadcast::Receiver<RunnerEvent>) -> Result<()> {
    let outcome = loop {
        match events.recv().await {
            Ok(RunnerEvent::NewFrame(frame)) => println!("{}", describe_frame(&frame)),
            Ok(RunnerEvent::Finished { completed }) => {
                if !completed {
                    println!("stopped early");
                }
                break Ok(());
            }
            Ok(RunnerEvent::ExitFromError { error }) => break Err(anyhow::anyhow!(error)),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event receiver lagged");
            }
            Err(RecvError::Closed) => break Ok(()),
        }
    };
    runner.wait().await?;
    outcome
}

fn describe_frame(frame: &Frame) -> String {
    let params: Vec<String> = frame
        .params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    let devices: Vec<&str> = frame.result.keys().map(String::as_str).collect();
    let mut line = format!(
        "frame {:>4} {:?} [{}] devices: {}",
        frame.index,
        frame.coords,
        params.join(", "),
        devices.join(", ")
    );
    if let Some(dir) = &frame.dir {
        line.push_str(&format!(" -> {}", dir.display()));
    }
    line
}

fn list_dir(path: &Path) -> Result<()> {
    let store = DataStore::new();
    let dir = store
        .dir(path, false)
        .with_context(|| format!("opening {}", path.display()))?;
    println!("{}: {}", dir.path().display(), Value::Object(dir.info()?));
    for name in dir.ls()? {
        let info = dir.info_for(&name)?;
        println!("  {:<24} {}", name, Value::Object(info));
    }
    Ok(())
}

fn print_log(path: &Path) -> Result<()> {
    let store = DataStore::new();
    let dir = store
        .dir(path, false)
        .with_context(|| format!("opening {}", path.display()))?;
    for entry in dir.read_log()? {
        println!("{}", entry.to_line()?);
    }
    Ok(())
}
