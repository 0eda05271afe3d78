//! Full stack from a TOML configuration down to files on disk.

mod common;

use common::{on, send, t};
use std::io::Write;
use std::sync::Arc;
use visx_ctrl::bus::{ChannelBus, ConnectionStatus};
use visx_ctrl::camera::SimulatedCamera;
use visx_ctrl::config::ControlConfig;
use visx_ctrl::control_loop::ControlLoop;
use visx_ctrl::exposure::{ControllerState, ExposureController};
use visx_ctrl::metadata::{JsonFileTelemetry, MetadataCollector};
use visx_ctrl::property::PropertySync;
use visx_ctrl::storage::DirectorySink;

#[tokio::test]
async fn configured_exposure_lands_in_data_directory() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("rawimages");
    let telemetry_path = dir.path().join("telemetry.json");
    std::fs::write(
        &telemetry_path,
        r#"{"tcsi": {"environment": {"dometemp": {"value": 12.25}}}}"#,
    )
    .unwrap();

    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        config_file,
        r#"
[application]
device_name = "camtest"

[camera]
initial_exposure_s = 0.5
sensor_width = 8
sensor_height = 2

[storage]
data_dir = "{}"

[telemetry]
camera_fields = ["current_temperature", "gain"]
json_file = "{}"

[[telemetry.entries]]
key = "DOMETEMP"
source = "tcsi.environment.dometemp"
"#,
        data_dir.display(),
        telemetry_path.display()
    )
    .unwrap();

    let config = ControlConfig::load_from(config_file.path()).unwrap();
    assert_eq!(config.file_prefix(), "camtest");

    let camera = Arc::new(SimulatedCamera::new(
        config.camera.sensor_width,
        config.camera.sensor_height,
        config.camera.bits_per_pixel,
    ));
    let provider = Arc::new(JsonFileTelemetry::new(
        config.telemetry.json_file.clone().unwrap(),
    ));
    let collector = MetadataCollector::from_config(camera.clone(), provider, &config.telemetry);
    let sink =
        Arc::new(DirectorySink::new(&config.storage.data_dir, config.file_prefix()).unwrap());
    let controller = ExposureController::new(camera.clone(), collector, sink);
    let sync = PropertySync::from_config(&config).unwrap();

    let (bus, client) = ChannelBus::new();
    client.set_status(ConnectionStatus::Connected);
    let mut control = ControlLoop::new(Arc::new(bus), camera, sync, controller);

    send(&client, "expose", "request", on());
    control.tick(t(0.0)).await;
    control.tick(t(0.5)).await;
    let report = control.tick(t(0.6)).await;
    assert_eq!(control.controller().state(), ControllerState::Idle);

    let id = report.committed.unwrap();
    assert_eq!(id.as_str(), "camtest_20240501030000000000");

    let raw = std::fs::read(data_dir.join(format!("{id}.raw"))).unwrap();
    assert_eq!(raw.len(), 8 * 2 * 2);

    let header: serde_json::Value =
        serde_json::from_slice(&std::fs::read(data_dir.join(format!("{id}.json"))).unwrap())
            .unwrap();
    assert_eq!(header["width"], 8);
    assert_eq!(header["timing"]["actual_s"], 0.5);

    let cards = header["header"].as_array().unwrap();
    let card = |keyword: &str| {
        cards
            .iter()
            .find(|c| c["keyword"] == keyword)
            .map(|c| c["value"].clone())
    };
    assert_eq!(card("DATE-END"), Some(serde_json::json!("2024-05-01T03:00:00.500000Z")));
    assert_eq!(card("BEGIN DOMETEMP"), Some(serde_json::json!(12.25)));
    assert_eq!(card("GAIN"), Some(serde_json::json!(1.0)));
    // Setpoint was not among the configured camera fields
    assert_eq!(card("SETPOINT"), Some(serde_json::Value::Null));
}
