//! Telemetry snapshots taken at exposure boundaries.
//!
//! Every exposure records the instrument state twice: once when it starts
//! and once when it ends. This module provides the pieces for that.
//!
//! ## `MetadataCollector`
//!
//! Reads a configurable list of camera fields through the [`Camera`]
//! capability and a list of external telemetry entries through a
//! [`TelemetryProvider`], and returns a [`TelemetrySnapshot`]. A snapshot is
//! always produced: any value that cannot be read is recorded as
//! [`TelemetryValue::Unavailable`] and the remaining keys are still captured.
//! Nothing is cached between calls.
//!
//! ## Telemetry providers
//!
//! - **`StaticTelemetry`**: in-memory values, settable at runtime. Used by
//!   tests and when no telemetry file is configured.
//! - **`JsonFileTelemetry`**: re-reads a JSON document on every fetch and
//!   resolves dotted source addresses (`tcsi.environment.dometemp`) inside it.
//!
//! External values may be raw scalars or structured objects; for objects the
//! `value` member is extracted when present.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::camera::Camera;
use crate::config::{TelemetryConfig, TelemetryEntry};
use crate::error::ControlError;

/// Camera reading captured into every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraField {
    /// Measured detector temperature (deg C).
    CurrentTemperature,
    /// Cooler setpoint programmed into the camera (deg C).
    Setpoint,
    /// Sensor gain.
    Gain,
    /// Programmed exposure time (s).
    ExposureTime,
}

impl CameraField {
    /// All camera fields, in snapshot order.
    pub const ALL: [CameraField; 4] = [
        CameraField::CurrentTemperature,
        CameraField::Setpoint,
        CameraField::Gain,
        CameraField::ExposureTime,
    ];

    /// Snapshot keyword for this field.
    pub fn key(&self) -> &'static str {
        match self {
            CameraField::CurrentTemperature => "CCD-TEMP",
            CameraField::Setpoint => "CCD-SETPOINT",
            CameraField::Gain => "GAIN",
            CameraField::ExposureTime => "EXPOSURE",
        }
    }

    async fn read(&self, camera: &dyn Camera) -> Result<f64> {
        match self {
            CameraField::CurrentTemperature => camera.temperature_current().await,
            CameraField::Setpoint => camera.temperature_target().await,
            CameraField::Gain => camera.gain().await,
            CameraField::ExposureTime => camera.exposure_time().await,
        }
    }
}

/// One telemetry reading.
///
/// Serialises untagged, so `Unavailable` becomes JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Number(f64),
    Integer(i64),
    Text(String),
    Bool(bool),
    /// Source missing or unreadable.
    Unavailable,
}

impl TelemetryValue {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TelemetryValue::Unavailable)
    }

    /// Numeric view, for integer or floating readings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Number(v) => Some(*v),
            TelemetryValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Number(v) => write!(f, "{v}"),
            TelemetryValue::Integer(v) => write!(f, "{v}"),
            TelemetryValue::Text(v) => f.write_str(v),
            TelemetryValue::Bool(v) => write!(f, "{v}"),
            TelemetryValue::Unavailable => f.write_str("unavailable"),
        }
    }
}

impl From<f64> for TelemetryValue {
    fn from(value: f64) -> Self {
        TelemetryValue::Number(value)
    }
}

impl From<serde_json::Value> for TelemetryValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => TelemetryValue::Unavailable,
            Value::Bool(b) => TelemetryValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => TelemetryValue::Integer(i),
                None => n
                    .as_f64()
                    .map_or(TelemetryValue::Unavailable, TelemetryValue::Number),
            },
            Value::String(s) => TelemetryValue::Text(s),
            Value::Object(mut map) => match map.remove("value") {
                Some(inner) => TelemetryValue::from(inner),
                None => TelemetryValue::Text(Value::Object(map).to_string()),
            },
            array @ Value::Array(_) => TelemetryValue::Text(array.to_string()),
        }
    }
}

/// Ordered keyword/value capture taken at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    taken_at: DateTime<Utc>,
    entries: Vec<(String, TelemetryValue)>,
}

impl TelemetrySnapshot {
    pub fn new(taken_at: DateTime<Utc>, entries: Vec<(String, TelemetryValue)>) -> Self {
        Self { taken_at, entries }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Entries in capture order.
    pub fn entries(&self) -> &[(String, TelemetryValue)] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&TelemetryValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// Keys recorded with the unavailable sentinel.
    pub fn unavailable_keys(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, value)| value.is_unavailable())
            .map(|(key, _)| key.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source of external (non-camera) telemetry.
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Fetch the current value at `source`.
    async fn fetch(&self, source: &str) -> Result<serde_json::Value>;
}

/// In-memory telemetry keyed by source address.
#[derive(Default)]
pub struct StaticTelemetry {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl StaticTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, source: impl Into<String>, value: serde_json::Value) {
        self.values.write().await.insert(source.into(), value);
    }

    pub async fn remove(&self, source: &str) {
        self.values.write().await.remove(source);
    }
}

#[async_trait]
impl TelemetryProvider for StaticTelemetry {
    async fn fetch(&self, source: &str) -> Result<serde_json::Value> {
        self.values
            .read()
            .await
            .get(source)
            .cloned()
            .ok_or_else(|| anyhow!("no value published at '{}'", source))
    }
}

/// Telemetry read from a JSON document on disk.
///
/// The file is re-read on every fetch so external writers can update it
/// while the process runs.
pub struct JsonFileTelemetry {
    path: PathBuf,
}

impl JsonFileTelemetry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Resolve `source` in `document`: an exact top-level key first, then a
/// dotted path through nested objects.
fn resolve<'a>(document: &'a serde_json::Value, source: &str) -> Option<&'a serde_json::Value> {
    if let Some(value) = document.get(source) {
        return Some(value);
    }
    source
        .split('.')
        .try_fold(document, |node, segment| node.get(segment))
}

#[async_trait]
impl TelemetryProvider for JsonFileTelemetry {
    async fn fetch(&self, source: &str) -> Result<serde_json::Value> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read telemetry file {}", self.path.display()))?;
        let document: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON in {}", self.path.display()))?;
        resolve(&document, source)
            .cloned()
            .ok_or_else(|| anyhow!("'{}' not present in {}", source, self.path.display()))
    }
}

/// Builds telemetry snapshots for the exposure controller.
pub struct MetadataCollector {
    camera: Arc<dyn Camera>,
    provider: Arc<dyn TelemetryProvider>,
    camera_fields: Vec<CameraField>,
    entries: Vec<TelemetryEntry>,
}

impl MetadataCollector {
    pub fn new(
        camera: Arc<dyn Camera>,
        provider: Arc<dyn TelemetryProvider>,
        camera_fields: Vec<CameraField>,
        entries: Vec<TelemetryEntry>,
    ) -> Self {
        Self {
            camera,
            provider,
            camera_fields,
            entries,
        }
    }

    pub fn from_config(
        camera: Arc<dyn Camera>,
        provider: Arc<dyn TelemetryProvider>,
        config: &TelemetryConfig,
    ) -> Self {
        Self::new(
            camera,
            provider,
            config.camera_fields.clone(),
            config.entries.clone(),
        )
    }

    /// Capture every configured value as of `now`.
    ///
    /// Never fails. Unreadable values are logged as telemetry gaps and
    /// recorded as [`TelemetryValue::Unavailable`].
    pub async fn snapshot(&self, now: DateTime<Utc>) -> TelemetrySnapshot {
        let mut entries = Vec::with_capacity(self.camera_fields.len() + self.entries.len());

        for field in &self.camera_fields {
            let value = match field.read(self.camera.as_ref()).await {
                Ok(v) => TelemetryValue::Number(v),
                Err(e) => {
                    gap(field.key(), &e);
                    TelemetryValue::Unavailable
                }
            };
            entries.push((field.key().to_string(), value));
        }

        for entry in &self.entries {
            let value = match self.provider.fetch(&entry.source).await {
                Ok(raw) => TelemetryValue::from(raw),
                Err(e) => {
                    gap(&entry.key, &e);
                    TelemetryValue::Unavailable
                }
            };
            entries.push((entry.key.clone(), value));
        }

        TelemetrySnapshot::new(now, entries)
    }
}

fn gap(key: &str, err: &anyhow::Error) {
    ControlError::TelemetryUnavailable {
        key: key.to_string(),
        reason: format!("{err:#}"),
    }
    .report();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{SimulatedCamera, SimulatedFault};
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap()
    }

    #[test]
    fn test_structured_value_is_unwrapped() {
        assert_eq!(
            TelemetryValue::from(json!({"value": 12.5, "units": "C"})),
            TelemetryValue::Number(12.5)
        );
        assert_eq!(TelemetryValue::from(json!(3)), TelemetryValue::Integer(3));
        assert_eq!(TelemetryValue::from(json!(null)), TelemetryValue::Unavailable);
        assert_eq!(
            TelemetryValue::from(json!({"value": null})),
            TelemetryValue::Unavailable
        );
    }

    #[test]
    fn test_dotted_source_resolution() {
        let doc = json!({
            "tcsi": {"environment": {"dometemp": {"value": 11.0}}},
            "flat.key": true
        });
        assert_eq!(
            resolve(&doc, "tcsi.environment.dometemp"),
            Some(&json!({"value": 11.0}))
        );
        assert_eq!(resolve(&doc, "flat.key"), Some(&json!(true)));
        assert_eq!(resolve(&doc, "tcsi.missing"), None);
    }

    #[tokio::test]
    async fn test_missing_source_yields_sentinel() {
        let camera = Arc::new(SimulatedCamera::new(4, 4, 16));
        let provider = Arc::new(StaticTelemetry::new());
        provider.set("vacuum.pressure", json!({"value": 1.2e-6})).await;

        let collector = MetadataCollector::new(
            camera,
            provider,
            vec![CameraField::Gain],
            vec![
                TelemetryEntry {
                    key: "PRESSURE".to_string(),
                    source: "vacuum.pressure".to_string(),
                },
                TelemetryEntry {
                    key: "DOMETEMP".to_string(),
                    source: "tcsi.environment.dometemp".to_string(),
                },
            ],
        );

        let snapshot = collector.snapshot(t0()).await;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.taken_at(), t0());
        assert_eq!(snapshot.get("GAIN"), Some(&TelemetryValue::Number(1.0)));
        assert_eq!(
            snapshot.get("PRESSURE"),
            Some(&TelemetryValue::Number(1.2e-6))
        );
        assert_eq!(snapshot.unavailable_keys(), vec!["DOMETEMP"]);
    }

    #[tokio::test]
    async fn test_camera_read_failure_yields_sentinel() {
        let camera = Arc::new(SimulatedCamera::new(4, 4, 16));
        camera.inject_fault(SimulatedFault::ReadTemperature).await;

        let collector = MetadataCollector::new(
            camera,
            Arc::new(StaticTelemetry::new()),
            CameraField::ALL.to_vec(),
            Vec::new(),
        );

        let snapshot = collector.snapshot(t0()).await;
        let keys: Vec<&str> = snapshot.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["CCD-TEMP", "CCD-SETPOINT", "GAIN", "EXPOSURE"]);
        assert_eq!(snapshot.unavailable_keys(), vec!["CCD-TEMP"]);
    }

    #[tokio::test]
    async fn test_json_file_provider_rereads_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.json");
        std::fs::write(&path, r#"{"dome": {"temp": 9.5}}"#).unwrap();

        let provider = JsonFileTelemetry::new(&path);
        assert_eq!(provider.fetch("dome.temp").await.unwrap(), json!(9.5));

        std::fs::write(&path, r#"{"dome": {"temp": 8.0}}"#).unwrap();
        assert_eq!(provider.fetch("dome.temp").await.unwrap(), json!(8.0));
        assert!(provider.fetch("dome.humidity").await.is_err());
    }
}
