//! # Telemetry Recorder
//!
//! Replay a ULog flight log through the decoder and record a telemetry
//! session at a fixed sample rate.
//!
//! Usage: `telemetry-recorder <config.toml> <log.ulg>`

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use telemetry_recorder::config::{Config, LoggingConfig};
use telemetry_recorder::model::{HealthMonitor, NoHealthCheck, SharedLiveModel, VehicleHealthCheck};
use telemetry_recorder::sampler::{SamplerParts, TelemetrySampler};
use telemetry_recorder::telemetry::SessionWriter;
use telemetry_recorder::ulog::UlogStream;

/// Bytes pushed into the decoder per replay step
const REPLAY_CHUNK_SIZE: usize = 16 * 1024;

/// Log file name inside `[logging] dir`
const LOG_FILE_NAME: &str = "telemetry-recorder.log";

/// Install the global subscriber
///
/// Logs go to stdout, and additionally to a daily rotated file when a log
/// directory is configured. `RUST_LOG` overrides the configured level.
///
/// # Returns
///
/// Guard flushing the file writer on drop, if a file is written
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Split command-line arguments into config and log paths
fn parse_args(args: &[String]) -> Result<(&str, &str)> {
    match args {
        [_, config, log] => Ok((config.as_str(), log.as_str())),
        _ => bail!("usage: telemetry-recorder <config.toml> <log.ulg>"),
    }
}

/// Main entry point for the telemetry recorder
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load and validate the configuration
///    - Set up logging
///    - Wire the ULog stream, live model and health check into a sampler
///
/// 2. **Replay**
///    - Push the log file into the decoder in chunks, one chunk per tick
///    - Handle Ctrl+C for an early stop
///
/// 3. **Shutdown**
///    - Stop the sampler and print the decoded field catalog
///    - Export the recorded session as JSON Lines
#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (config_path, log_path) = parse_args(&args)?;

    let config = Config::load(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    let _log_guard = init_logging(&config.logging)?;

    info!("Telemetry Recorder v{} starting...", env!("CARGO_PKG_VERSION"));

    let bytes = std::fs::read(log_path).with_context(|| format!("failed to read {}", log_path))?;
    info!("Replaying {} ({} bytes)", log_path, bytes.len());

    let stream = Arc::new(UlogStream::new());
    let live = Arc::new(SharedLiveModel::new());
    live.set_connected(true);

    let vehicle_health = Arc::new(VehicleHealthCheck::new(config.health.clone()));
    let health: Arc<dyn HealthMonitor> = if config.health.enabled {
        vehicle_health.clone() as Arc<dyn HealthMonitor>
    } else {
        Arc::new(NoHealthCheck)
    };

    let parts = SamplerParts::new(live.clone())
        .with_log(stream.clone())
        .with_health(health);
    let sampler = TelemetrySampler::new(&config.sampler, parts);
    sampler.spawn();
    sampler.start();

    let mut replay_tick = interval(Duration::from_micros(config.sampler.interval_us));
    let mut chunks = bytes.chunks(REPLAY_CHUNK_SIZE);
    let mut parameters_reported = false;

    loop {
        tokio::select! {
            _ = replay_tick.tick() => {
                let Some(chunk) = chunks.next() else {
                    info!("Replay complete");
                    sampler.indicators().set_log_loaded(true);
                    break;
                };

                let stats = stream
                    .push(chunk, 0, true)
                    .with_context(|| format!("{} is not a ULog file", log_path))?;
                debug!("Decoded {:?}", stats);

                if !parameters_reported {
                    let parameters = stream.parameters();
                    if !parameters.is_empty() {
                        vehicle_health.on_parameters_loaded(&parameters);
                        parameters_reported = true;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping replay...");
                break;
            }
        }
    }

    sampler.stop().await;
    sampler.shutdown();

    println!("{}", stream.system_info());
    for (key, tag) in stream.field_catalog() {
        println!("{} {}", tag.as_str(), key);
    }
    if let Some(report) = vehicle_health.last_result() {
        info!("Health check: {:?}", report);
    }

    let samples = sampler.session().clone();
    if samples.is_empty() {
        warn!("No samples recorded, skipping export");
        return Ok(());
    }

    let path = SessionWriter::new(&config.export.dir)
        .write(&samples)
        .context("failed to export session")?;
    info!(
        "Recorded {} samples over {} ms into {}",
        samples.len(),
        sampler.total_recording_ms(),
        path.display()
    );

    Ok(())
}
