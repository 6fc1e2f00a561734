//! CLI entry point for ccd-capture
//!
//! Provides:
//! - `simulate`: run the controller against the in-process simulated camera
//! - `build-luts`: (re)build the gain LUT cache
//! - `telemetry`: decode a raw GPS telemetry block
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! ccd-capture simulate --seconds 10 --gps --roi 100,100,640,480
//! ccd-capture --config my.toml build-luts
//! ccd-capture telemetry block.bin
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use ccd_capture::color::GainLutCache;
use ccd_capture::config::{AppConfig, DEFAULT_CONFIG_PATH};
use ccd_capture::controller::CaptureController;
use ccd_capture::data::telemetry;
use ccd_capture::hardware::{SimulatedCamera, SimulatedWorker};
use ccd_capture::logging;
use ccd_capture::session::{ControlRequest, Roi, SessionEvent, StreamingMode};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "ccd-capture")]
#[command(about = "Capture controller for scientific CCD/CMOS cameras", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream from the simulated camera for a while
    Simulate {
        /// How long to stream
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Sensor width
        #[arg(long, default_value = "1280")]
        width: u32,

        /// Sensor height
        #[arg(long, default_value = "960")]
        height: u32,

        /// Simulated frame rate
        #[arg(long, default_value = "25")]
        fps: u32,

        /// Color (Bayer) sensor
        #[arg(long)]
        color: bool,

        /// Attach GPS telemetry to frames
        #[arg(long)]
        gps: bool,

        /// Apply this ROI (`x,y,w,h`) once streaming, exercising the pause/resize/resume path
        #[arg(long, value_parser = parse_roi)]
        roi: Option<Roi>,
    },

    /// Build the gain LUT cache and write it to disk
    BuildLuts {
        /// Output path (defaults to the configured cache path)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Decode a raw telemetry block
    Telemetry {
        /// File holding at least 44 bytes of telemetry
        file: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .with_context(|| {
        format!(
            "loading {}",
            cli.config
                .as_deref()
                .unwrap_or(Path::new(DEFAULT_CONFIG_PATH))
                .display()
        )
    })?;
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Simulate {
            seconds,
            width,
            height,
            fps,
            color,
            gps,
            roi,
        } => {
            let mut camera = SimulatedCamera::new(width, height)
                .with_frame_interval(Duration::from_secs_f64(1.0 / f64::from(fps.max(1))));
            if color {
                camera = camera.color();
            }
            if gps {
                camera = camera.with_gps();
            }
            simulate(config, camera, Duration::from_secs(seconds), roi).await
        }
        Commands::BuildLuts { output } => build_luts(&config, output),
        Commands::Telemetry { file } => decode_telemetry(&config, &file),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn parse_roi(raw: &str) -> Result<Roi, String> {
    let parts: Vec<u32> = raw
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid ROI '{raw}': {e}"))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(Roi::new(*x, *y, *w, *h)),
        _ => Err(format!("ROI needs four values x,y,w,h, got '{raw}'")),
    }
}

async fn simulate(
    config: AppConfig,
    camera: SimulatedCamera,
    duration: Duration,
    roi: Option<Roi>,
) -> Result<()> {
    let luts = Arc::new(GainLutCache::load_or_build(
        &config.color.lut_cache_path,
        config.color.grid(),
    ));
    let (mut controller, endpoint) = CaptureController::new(&config, luts)?;
    let mut events = controller.subscribe();

    let (stop_worker, worker) = SimulatedWorker::new(endpoint, camera).spawn();
    let (requests, request_rx) = mpsc::channel(16);
    let (frame_tx, mut frames) = mpsc::channel(8);
    let controller_task = tokio::spawn(controller.run(request_rx, frame_tx));

    requests.send(ControlRequest::Connect { camera: None }).await?;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut delivered = 0u64;
    let mut roi = roi;

    loop {
        tokio::select! {
            Some(frame) = frames.recv() => {
                delivered += 1;
                if delivered % 25 == 1 {
                    println!(
                        "frame {delivered}: {}x{}x{} @ {:.1} fps (generation {})",
                        frame.image.width(),
                        frame.image.height(),
                        frame.image.channels(),
                        frame.fps,
                        frame.generation,
                    );
                    if let Some(record) = &frame.telemetry {
                        println!("  {record}");
                    }
                }
                if delivered == 10 {
                    if let Some(roi) = roi.take() {
                        requests.send(ControlRequest::ApplyRoi(roi)).await?;
                    }
                }
            }
            Some(event) = events.recv() => {
                match &event {
                    SessionEvent::Connected { camera, mode, .. } => {
                        println!("connected to {camera} ({}x{})", mode.sensor_width, mode.sensor_height);
                        requests.send(ControlRequest::SelectMode(StreamingMode::Continuous)).await?;
                    }
                    SessionEvent::ConnectFailed { reason } => {
                        eprintln!("connect failed: {reason}");
                        break;
                    }
                    SessionEvent::GeometryChanged(mode) => {
                        println!("geometry now {:?}, {}-bit", mode.roi, mode.bit_depth.bits());
                    }
                    other => tracing::debug!(event = ?other, "session event"),
                }
            }
            _ = &mut deadline => break,
            _ = signal::ctrl_c() => break,
        }
    }

    requests.send(ControlRequest::Shutdown).await?;
    controller_task.await??;
    let _ = stop_worker.send(());
    let published = worker.await??;

    println!("published {published} frames, delivered {delivered} to the display");
    Ok(())
}

fn build_luts(config: &AppConfig, output: Option<PathBuf>) -> Result<()> {
    let path = output.unwrap_or_else(|| config.color.lut_cache_path.clone());
    let cache = GainLutCache::build(config.color.grid());
    cache
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {} tables to {}", cache.len(), path.display());
    Ok(())
}

fn decode_telemetry(config: &AppConfig, file: &Path) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let zone = config.telemetry.zone().map_err(anyhow::Error::msg)?;
    let record = telemetry::decode(&bytes, zone)?;
    println!("{record}");
    Ok(())
}
