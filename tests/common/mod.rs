//! Shared fixtures for control-loop integration tests
//!
//! Builds a complete control loop on simulated collaborators:
//! - `SimulatedCamera` (4x4, 16-bit) with call recording
//! - `ChannelBus`, already connected
//! - `MemorySink` for committed frames
//! - `StaticTelemetry` publishing one value and missing another

#![allow(dead_code)] // Not every test binary uses every helper

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;

use visx_ctrl::bus::{BusClient, ChannelBus, ConnectionStatus, PropertyUpdate, PropertyValue, PropertyWrite, SwitchState};
use visx_ctrl::camera::SimulatedCamera;
use visx_ctrl::config::TelemetryEntry;
use visx_ctrl::control_loop::ControlLoop;
use visx_ctrl::exposure::{ExposureController, ExposureSetting};
use visx_ctrl::metadata::{CameraField, MetadataCollector, StaticTelemetry};
use visx_ctrl::property::PropertySync;
use visx_ctrl::storage::MemorySink;

pub struct Harness {
    pub control: ControlLoop,
    pub client: BusClient,
    pub camera: Arc<SimulatedCamera>,
    pub sink: Arc<MemorySink>,
    pub telemetry: Arc<StaticTelemetry>,
}

/// Wall-clock stand-in: seconds after a fixed epoch.
pub fn t(seconds: f64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap()
        + Duration::microseconds((seconds * 1_000_000.0).round() as i64)
}

pub async fn harness() -> Harness {
    let camera = Arc::new(SimulatedCamera::new(4, 4, 16));
    let sink = Arc::new(MemorySink::new());
    let telemetry = Arc::new(StaticTelemetry::new());
    telemetry
        .set("tcsi.environment.dometemp", json!({"value": 11.0, "units": "C"}))
        .await;

    let collector = MetadataCollector::new(
        camera.clone(),
        telemetry.clone(),
        CameraField::ALL.to_vec(),
        vec![
            TelemetryEntry {
                key: "DOMETEMP".to_string(),
                source: "tcsi.environment.dometemp".to_string(),
            },
            TelemetryEntry {
                key: "PRESSURE".to_string(),
                source: "vacuum.pressure".to_string(),
            },
        ],
    );
    let controller = ExposureController::new(camera.clone(), collector, sink.clone());
    let sync = PropertySync::new(
        "camvisx",
        ExposureSetting::new(1.0).unwrap(),
        0.0,
        (-100.0, 100.0),
        true,
    );

    let (bus, client) = ChannelBus::new();
    client.set_status(ConnectionStatus::Connected);
    let control = ControlLoop::new(Arc::new(bus), camera.clone(), sync, controller);

    Harness {
        control,
        client,
        camera,
        sink,
        telemetry,
    }
}

/// Harness with properties defined and the definition traffic discarded.
pub async fn defined_harness() -> Harness {
    let mut h = harness().await;
    h.control.define_properties(t(0.0)).await.unwrap();
    h.client.take_messages();
    h
}

pub fn number(value: f64) -> PropertyValue {
    PropertyValue::Number(Some(value))
}

pub fn on() -> PropertyValue {
    PropertyValue::Switch(SwitchState::On)
}

pub fn off() -> PropertyValue {
    PropertyValue::Switch(SwitchState::Off)
}

pub fn send(client: &BusClient, property: &str, field: &str, value: PropertyValue) {
    client
        .write(PropertyWrite::new(property, field, value))
        .unwrap();
}

/// Latest published value of `property.field` among `updates`.
pub fn last_value<'a>(updates: &'a [PropertyUpdate], property: &str, field: &str) -> Option<&'a PropertyValue> {
    updates
        .iter()
        .rev()
        .find(|u| u.property == property && u.field == field)
        .map(|u| &u.value)
}
