//! `visx_ctrl` binary.
//!
//! Runs the control loop against the simulated camera and an in-process
//! property bus. Bus writes are read from stdin as `property.field=value`
//! lines, e.g. `exptime.target=2.5` or `expose.request=On`.

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use visx_ctrl::bus::{BusMessage, ChannelBus, ConnectionStatus, PropertyWrite};
use visx_ctrl::camera::{Camera, SimulatedCamera};
use visx_ctrl::config::ControlConfig;
use visx_ctrl::control_loop::ControlLoop;
use visx_ctrl::exposure::ExposureController;
use visx_ctrl::logging;
use visx_ctrl::metadata::{
    JsonFileTelemetry, MetadataCollector, StaticTelemetry, TelemetryProvider,
};
use visx_ctrl::property::PropertySync;
use visx_ctrl::storage::DirectorySink;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "visx_ctrl", version, about = "VIS-X camera control process")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/visx.toml")]
    config: PathBuf,

    /// Debug logging for this process
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Override the frame output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ControlConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    config.application.json_logs |= cli.json_logs;

    logging::init_tracing(
        &config.application.log_level,
        config.application.json_logs,
        cli.verbose,
    )?;
    tracing::info!(
        device = %config.application.device_name,
        config = %cli.config.display(),
        "Starting control process"
    );

    let camera = Arc::new(SimulatedCamera::new(
        config.camera.sensor_width,
        config.camera.sensor_height,
        config.camera.bits_per_pixel,
    ));
    camera
        .set_gain(config.camera.gain)
        .await
        .context("Failed to program initial gain")?;
    camera
        .set_exposure_time(config.camera.initial_exposure_s)
        .await
        .context("Failed to program initial exposure time")?;

    let provider: Arc<dyn TelemetryProvider> = match &config.telemetry.json_file {
        Some(path) => Arc::new(JsonFileTelemetry::new(path)),
        None => Arc::new(StaticTelemetry::new()),
    };
    let collector = MetadataCollector::from_config(camera.clone(), provider, &config.telemetry);
    let sink = Arc::new(
        DirectorySink::new(&config.storage.data_dir, config.file_prefix())
            .context("Failed to open frame sink")?,
    );
    let controller = ExposureController::new(camera.clone(), collector, sink);
    let mut frames = controller.subscribe_frames();
    tokio::spawn(async move {
        while frames.changed().await.is_ok() {
            let latest = frames.borrow_and_update().clone();
            if let Some(frame) = latest {
                tracing::debug!(
                    width = frame.width,
                    height = frame.height,
                    bytes = frame.pixels.memory_bytes(),
                    "Live frame updated"
                );
            }
        }
    });
    let sync = PropertySync::from_config(&config)?;

    let (bus, mut client) = ChannelBus::new();
    client.set_status(ConnectionStatus::Connected);

    // Console on a plain thread; a pending stdin read never blocks shutdown
    let writer = client.writer();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<PropertyWrite>() {
                Ok(write) => {
                    if writer.write(write).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring console input"),
            }
        }
    });
    tokio::spawn(async move {
        while let Some(message) = client.recv().await {
            if let BusMessage::Update(update) = message {
                tracing::info!(
                    property = %update.property,
                    field = %update.field,
                    value = %update.value,
                    "Published"
                );
            }
        }
    });

    let mut control = ControlLoop::new(Arc::new(bus), camera, sync, controller)
        .with_intervals(config.tick_interval(), config.connect_poll_interval());

    control
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
