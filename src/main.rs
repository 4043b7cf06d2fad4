//! daq_poll - manual reads and timed polling runs against configured devices.
//!
//! Run with: `cargo run -- --simulate run --duration 5s`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{error, info};

use daq_poll::acquisition::{DeviceWorker, FrontPanelValues, HostWorker};
use daq_poll::config::{DeviceConfig, Settings};
use daq_poll::data::storage::{self, DatasetSink};
use daq_poll::instrument;
use daq_poll::logging;
use daq_poll::transport::{HardwareTransportFactory, TransportFactory};

/// Polled acquisition for slow laboratory monitors.
#[derive(Parser, Debug)]
#[command(name = "daq_poll")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Answer every query from a built-in instrument simulator.
    #[arg(long, global = true)]
    simulate: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take one reading from each device (all devices if none are named).
    Read {
        devices: Vec<String>,
    },

    /// Ask a device to identify itself.
    Identify {
        device: String,
    },

    /// Run one buffered acquisition cycle and store it in a new shot.
    Run {
        /// How long the experiment runs, e.g. `5s` or `1m 30s`.
        #[arg(short, long, value_parser = parse_duration, default_value = "5s")]
        duration: Duration,

        /// Devices to acquire from (all devices if omitted).
        #[arg(long = "device")]
        devices: Vec<String>,

        /// Shot path to write into instead of a new one in the output directory.
        #[arg(long)]
        shot: Option<PathBuf>,
    },

    /// Print the effective configuration.
    Config,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    logging::init(&settings.application)?;

    match args.command {
        Command::Config => {
            let rendered = toml::to_string_pretty(&settings).context("Failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Command::Read { devices } => {
            let sink: Arc<dyn DatasetSink> = Arc::new(storage::MemorySink::new());
            for config in select(&settings, &devices)? {
                let mut worker = build_worker(config, args.simulate, Arc::clone(&sink));
                let outcome = worker.check_connection().await;
                worker.shutdown().await?;
                let check = outcome.with_context(|| format!("Reading {} failed", config.name))?;
                println!("{:<16} {:<10} {}", config.name, check.status, check.reading);
            }
            Ok(())
        }
        Command::Identify { device } => {
            let config = settings.device(&device)?;
            let sink: Arc<dyn DatasetSink> = Arc::new(storage::MemorySink::new());
            let mut worker = build_worker(config, args.simulate, sink);
            let outcome = worker.identify().await;
            worker.shutdown().await?;
            println!("{}", outcome.with_context(|| format!("Identifying {device} failed"))?);
            Ok(())
        }
        Command::Run {
            duration,
            devices,
            shot,
        } => run(&settings, &devices, duration, shot, args.simulate).await,
    }
}

fn select<'a>(settings: &'a Settings, names: &[String]) -> anyhow::Result<Vec<&'a DeviceConfig>> {
    if settings.devices.is_empty() {
        bail!("No devices configured");
    }
    if names.is_empty() {
        return Ok(settings.devices.iter().collect());
    }
    names
        .iter()
        .map(|name| settings.device(name).map_err(anyhow::Error::from))
        .collect()
}

fn build_worker(config: &DeviceConfig, simulate: bool, sink: Arc<dyn DatasetSink>) -> DeviceWorker {
    let model = config.kind.build();
    let factory: Arc<dyn TransportFactory> = if simulate {
        Arc::new(instrument::simulator(Arc::clone(&model)))
    } else {
        Arc::new(HardwareTransportFactory)
    };
    DeviceWorker::new(config.clone(), model, factory, sink)
}

async fn run(
    settings: &Settings,
    names: &[String],
    duration: Duration,
    shot: Option<PathBuf>,
    simulate: bool,
) -> anyhow::Result<()> {
    let devices = select(settings, names)?;
    let sink = storage::open_sink(&settings.storage)?;
    let shot = match shot {
        Some(path) => path,
        None => {
            std::fs::create_dir_all(&settings.storage.output_dir).with_context(|| {
                format!("Failed to create {}", settings.storage.output_dir.display())
            })?;
            storage::new_shot_path(&settings.storage.output_dir, settings.storage.backend)
        }
    };
    info!(shot = %shot.display(), ?duration, devices = devices.len(), "Starting run");

    let mut workers: Vec<DeviceWorker> = devices
        .iter()
        .map(|config| build_worker(config, simulate, Arc::clone(&sink)))
        .collect();
    let front_panel = FrontPanelValues::new();

    for worker in &mut workers {
        worker.init().await?;
    }

    let started = join_all(workers.iter_mut().map(|worker| {
        let name = worker.name().to_string();
        let shot = shot.clone();
        let front_panel = &front_panel;
        async move { worker.transition_to_buffered(&name, &shot, front_panel, true).await }
    }))
    .await;

    let mut failed = false;
    if let Some(e) = started.iter().find_map(|r| r.as_ref().err()) {
        error!(error = %e, "Entering buffered mode failed, aborting run");
        for worker in &mut workers {
            worker.abort_transition_to_buffered().await?;
        }
        failed = true;
    } else {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = tokio::signal::ctrl_c() => info!("Interrupted, finishing early"),
        }

        let finished = join_all(workers.iter_mut().map(|worker| worker.transition_to_manual())).await;
        for (worker, result) in workers.iter().zip(finished) {
            if let Err(e) = result {
                error!(device = %worker.name(), error = %e, "Cycle failed");
                failed = true;
            }
        }
    }

    for worker in &mut workers {
        worker.shutdown().await?;
    }
    if failed {
        bail!("Run did not complete cleanly");
    }
    println!("{}", shot.display());
    Ok(())
}
