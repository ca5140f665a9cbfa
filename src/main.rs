//! CLI Entry Point for rust_autofocus
//!
//! Runs the autofocus control loop against simulated hardware:
//! - `scan`: sweep Z, pick the brightest position and move there
//! - `monitor`: print live brightness readings for a while
//! - `check-config`: load, validate and print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! rust_autofocus scan --min -10 --max 10 --step 0.5 --pause-ms 20
//! rust_autofocus --log-format json monitor --duration-ms 3000
//! RUST_AUTOFOCUS_SCAN__STEP_SIZE=2 rust_autofocus check-config
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rust_autofocus::autofocus::{
    ControllerConfig, ControllerHandle, ControllerState, ScanController, StatusEvent,
};
use rust_autofocus::config::{AutofocusConfig, DEFAULT_CONFIG_PATH};
use rust_autofocus::hardware::mock::MockStage;
use rust_autofocus::hardware::{MetricKind, StageMotion};
use rust_autofocus::logging::{self, OutputFormat};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_autofocus")]
#[command(about = "Brightness-based Z-stage autofocus", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one Z sweep and move to best focus
    Scan {
        /// Sweep start (µm)
        #[arg(long, allow_hyphen_values = true)]
        min: Option<f64>,

        /// Sweep end (µm)
        #[arg(long, allow_hyphen_values = true)]
        max: Option<f64>,

        /// Step size (µm)
        #[arg(long)]
        step: Option<f64>,

        /// Settle time after each move (ms)
        #[arg(long)]
        pause_ms: Option<u64>,

        /// Brightness metric (mean, median, max, percentile95)
        #[arg(long)]
        metric: Option<MetricKind>,

        /// Image channel
        #[arg(long)]
        channel: Option<u32>,

        /// Print the final session snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print live brightness readings
    Monitor {
        /// How long to monitor
        #[arg(long, default_value_t = 2000)]
        duration_ms: u64,
    },

    /// Load and validate configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AutofocusConfig::load_from(&cli.config)?;
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Scan {
            min,
            max,
            step,
            pause_ms,
            metric,
            channel,
            json,
        } => {
            let scan = &mut config.scan;
            scan.min_z = min.unwrap_or(scan.min_z);
            scan.max_z = max.unwrap_or(scan.max_z);
            scan.step_size = step.unwrap_or(scan.step_size);
            scan.pause_time = pause_ms.map(Duration::from_millis).unwrap_or(scan.pause_time);
            scan.metric = metric.unwrap_or(scan.metric);
            scan.channel = channel.unwrap_or(scan.channel);
            run_scan(&config, json).await
        }
        Commands::Monitor { duration_ms } => {
            run_monitor(&config, Duration::from_millis(duration_ms)).await
        }
        Commands::CheckConfig => {
            println!("# {}", cli.config.display());
            print!("{}", toml::to_string_pretty(&config)?);
            println!("# configuration OK");
            Ok(())
        }
    }
}

fn spawn_controller(config: &AutofocusConfig) -> (ControllerHandle, Arc<MockStage>) {
    let (stage, source) = config.simulation.build_rig();
    let controller_config = ControllerConfig {
        poll_interval: config.monitor.poll_interval,
        ..Default::default()
    };
    let (handle, _task) = ScanController::spawn(stage.clone(), source, controller_config);
    (handle, stage)
}

async fn run_scan(config: &AutofocusConfig, json: bool) -> Result<()> {
    let parameters = config.scan.to_parameters();
    let (controller, stage) = spawn_controller(config);
    let mut events = controller.subscribe();

    let session_id = controller.start_scan(parameters.clone()).await?;
    info!(%session_id, steps = parameters.total_steps(), "Scan submitted");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StatusEvent::SampleRecorded { sample, progress }) if !json => {
                    println!(
                        "[{:>3}/{}] z = {:>9.3} µm  brightness = {:.2}",
                        progress.step, progress.total_steps, sample.position, sample.brightness
                    );
                }
                Ok(StatusEvent::SampleSkipped { position, reason, .. }) if !json => {
                    println!("          z = {:>9.3} µm  skipped ({})", position, reason);
                }
                Ok(StatusEvent::ScanComplete(Err(failure))) => {
                    controller.shutdown().await?;
                    bail!("scan failed: {}", failure);
                }
                Ok(StatusEvent::StatusChanged { to: ControllerState::Idle, .. }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Status events dropped"),
                Err(RecvError::Closed) => bail!("controller stopped unexpectedly"),
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, aborting scan...");
                if let Err(e) = controller.abort().await {
                    warn!(error = %e, "Abort not accepted");
                }
            }
        }
    }

    let snapshot = controller.snapshot().await?;
    controller.shutdown().await?;

    match (snapshot, json) {
        (Some(snapshot), true) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        (Some(snapshot), false) => {
            println!();
            println!("Session {} ({})", snapshot.session_id, snapshot.status);
            match snapshot.focus {
                Some(focus) => println!(
                    "Best focus: z = {:.3} µm, brightness = {:.2} ({} samples)",
                    focus.best_z, focus.best_brightness, focus.sample_count
                ),
                None => println!("No focus selected"),
            }
            println!("Stage now at z = {:.3} µm", stage.position().await?);
        }
        (None, _) => bail!("no scan session available"),
    }
    Ok(())
}

async fn run_monitor(config: &AutofocusConfig, duration: Duration) -> Result<()> {
    let (controller, _stage) = spawn_controller(config);
    let mut events = controller.subscribe();

    controller
        .start_monitor(config.monitor.channel, config.monitor.metric)
        .await?;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(StatusEvent::MonitorReading(value)) => {
                    println!("{} = {:.2}", config.monitor.metric, value);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Status events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    controller.stop_monitor().await?;
    if let Some(latest) = controller.latest_brightness().await? {
        println!("Last reading: {:.2}", latest);
    }
    controller.shutdown().await?;
    Ok(())
}
