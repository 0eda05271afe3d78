//! Frame sinks: persistence of finished exposures.
//!
//! An [`ExposureArtifact`] bundles the read-out frame, its timing and a
//! keyword header assembled from the start and end telemetry snapshots.
//! The controller hands each artifact to a [`FrameSink`] exactly once and
//! never retries.
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::camera::Frame;
use crate::metadata::{CameraField, TelemetrySnapshot, TelemetryValue};

// ============================================================================
// Artifact model
// ============================================================================

/// Identifier returned by a sink for a committed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// When an exposure ran and how long it integrated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposureTiming {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Requested duration (s)
    pub planned_s: f64,
    /// Integrated duration (s); shorter than planned when canceled
    pub actual_s: f64,
    pub canceled: bool,
}

/// Ordered keyword/value header stored next to the pixels.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameHeader {
    cards: Vec<HeaderCard>,
}

/// One header entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderCard {
    pub keyword: String,
    pub value: TelemetryValue,
}

impl FrameHeader {
    pub fn push(&mut self, keyword: impl Into<String>, value: TelemetryValue) {
        self.cards.push(HeaderCard {
            keyword: keyword.into(),
            value,
        });
    }

    pub fn get(&self, keyword: &str) -> Option<&TelemetryValue> {
        self.cards
            .iter()
            .find(|card| card.keyword == keyword)
            .map(|card| &card.value)
    }

    pub fn cards(&self) -> &[HeaderCard] {
        &self.cards
    }

    /// Build the standard header for one exposure.
    ///
    /// Camera readings also fill the dedicated temperature, setpoint and
    /// gain cards. Every snapshot key, camera or external, is then written
    /// as `BEGIN <key>` from the start snapshot and `END <key>` from the end
    /// snapshot.
    pub fn assemble(
        timing: &ExposureTiming,
        start: &TelemetrySnapshot,
        end: &TelemetrySnapshot,
    ) -> Self {
        let camera_value = |snapshot: &TelemetrySnapshot, field: CameraField| {
            snapshot
                .get(field.key())
                .cloned()
                .unwrap_or(TelemetryValue::Unavailable)
        };

        let mut header = FrameHeader::default();
        header.push("DATE-BEG", iso8601(timing.started_at));
        header.push("DATE-END", iso8601(timing.ended_at));
        header.push("EXPREQ", TelemetryValue::Number(timing.planned_s));
        header.push("EXPTIME", TelemetryValue::Number(timing.actual_s));
        header.push("CANCELED", TelemetryValue::Bool(timing.canceled));
        header.push("TEMP-BEG", camera_value(start, CameraField::CurrentTemperature));
        header.push("TEMP-END", camera_value(end, CameraField::CurrentTemperature));
        header.push("SETPOINT", camera_value(start, CameraField::Setpoint));
        header.push("GAIN", camera_value(start, CameraField::Gain));

        for (prefix, snapshot) in [("BEGIN", start), ("END", end)] {
            for (key, value) in snapshot.entries() {
                header.push(format!("{prefix} {key}"), value.clone());
            }
        }
        header
    }
}

fn iso8601(at: DateTime<Utc>) -> TelemetryValue {
    TelemetryValue::Text(at.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Everything persisted for one exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureArtifact {
    /// Shared with live frame subscribers
    pub frame: Arc<Frame>,
    pub header: FrameHeader,
    pub timing: ExposureTiming,
}

/// Persistence boundary for finished exposures.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn commit(&self, artifact: &ExposureArtifact) -> Result<ArtifactId>;
}

// ============================================================================
// Directory sink
// ============================================================================

/// Writes each exposure as `<prefix>_<timestamp>.raw` plus a JSON header.
///
/// The `.raw` file holds the pixels row-major, little-endian. The `.json`
/// file carries geometry, timing and the ordered header cards. Existing
/// files are never overwritten, and a commit that fails part-way leaves
/// neither file behind.
pub struct DirectorySink {
    dir: PathBuf,
    prefix: String,
}

#[derive(Serialize)]
struct HeaderDocument<'a> {
    artifact: &'a str,
    width: u32,
    height: u32,
    bits_per_pixel: u8,
    timing: &'a ExposureTiming,
    header: &'a [HeaderCard],
}

impl DirectorySink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create data directory at {:?}", dir))?;
        }
        tracing::info!(dir = %dir.display(), "Frame sink ready");
        Ok(Self {
            dir,
            prefix: prefix.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(&self, started_at: DateTime<Utc>) -> String {
        format!("{}_{}", self.prefix, started_at.format("%Y%m%d%H%M%S%6f"))
    }
}

#[async_trait]
impl FrameSink for DirectorySink {
    async fn commit(&self, artifact: &ExposureArtifact) -> Result<ArtifactId> {
        let stem = self.stem(artifact.timing.started_at);
        let raw_path = self.dir.join(format!("{stem}.raw"));
        let header_path = self.dir.join(format!("{stem}.json"));

        let frame = &artifact.frame;
        if frame.pixels.len() != frame.pixel_count() {
            bail!(
                "Frame geometry {}x{} does not match {} pixels",
                frame.width,
                frame.height,
                frame.pixels.len()
            );
        }

        let document = HeaderDocument {
            artifact: &stem,
            width: frame.width,
            height: frame.height,
            bits_per_pixel: frame.pixels.bits_per_pixel(),
            timing: &artifact.timing,
            header: artifact.header.cards(),
        };
        let header_json =
            serde_json::to_vec_pretty(&document).context("Failed to serialize frame header")?;

        write_new(&raw_path, &frame.pixels.to_le_bytes())
            .await
            .with_context(|| format!("Failed to write pixels to {:?}", raw_path))?;
        if let Err(e) = write_new(&header_path, &header_json).await {
            remove_partial(&raw_path).await;
            return Err(e).with_context(|| format!("Failed to write header to {:?}", header_path));
        }

        tracing::debug!(
            artifact = %stem,
            bytes = frame.pixels.memory_bytes(),
            "Frame written"
        );
        Ok(ArtifactId::new(stem))
    }
}

/// Create `path` and write `bytes` to it; fails if the file already exists.
async fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                anyhow::anyhow!("Refusing to overwrite existing file {:?}", path)
            }
            _ => anyhow::Error::new(e),
        })?;

    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = written {
        drop(file);
        remove_partial(path).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Could not remove partial frame file");
    }
}

// ============================================================================
// Memory sink
// ============================================================================

/// Keeps committed artifacts in memory. Can be told to reject commits.
#[derive(Default)]
pub struct MemorySink {
    artifacts: Mutex<Vec<ExposureArtifact>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every commit fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn artifacts(&self) -> Vec<ExposureArtifact> {
        self.artifacts.lock().await.clone()
    }

    /// Commit calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn commit(&self, artifact: &ExposureArtifact) -> Result<ArtifactId> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            bail!("memory sink rejecting commit #{}", attempt);
        }
        self.artifacts.lock().await.push(artifact.clone());
        Ok(ArtifactId::new(format!("frame_{attempt:04}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PixelBuffer;
    use chrono::TimeZone;

    fn artifact() -> ExposureArtifact {
        let started_at = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        let ended_at = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 3).unwrap();
        let start = TelemetrySnapshot::new(
            started_at,
            vec![
                ("CCD-TEMP".to_string(), TelemetryValue::Number(-5.0)),
                ("CCD-SETPOINT".to_string(), TelemetryValue::Number(-10.0)),
                ("EXPOSURE".to_string(), TelemetryValue::Number(10.0)),
                ("DOMETEMP".to_string(), TelemetryValue::Number(11.0)),
            ],
        );
        let end = TelemetrySnapshot::new(
            ended_at,
            vec![
                ("CCD-TEMP".to_string(), TelemetryValue::Number(-6.0)),
                ("DOMETEMP".to_string(), TelemetryValue::Unavailable),
            ],
        );
        let timing = ExposureTiming {
            started_at,
            ended_at,
            planned_s: 10.0,
            actual_s: 3.0,
            canceled: true,
        };
        ExposureArtifact {
            frame: Arc::new(Frame {
                width: 2,
                height: 2,
                pixels: PixelBuffer::U16(vec![1, 2, 3, 0x0100]),
            }),
            header: FrameHeader::assemble(&timing, &start, &end),
            timing,
        }
    }

    #[test]
    fn test_header_assembly() {
        let header = artifact().header;
        let keywords: Vec<&str> = header.cards().iter().map(|c| c.keyword.as_str()).collect();
        assert_eq!(
            keywords,
            vec![
                "DATE-BEG",
                "DATE-END",
                "EXPREQ",
                "EXPTIME",
                "CANCELED",
                "TEMP-BEG",
                "TEMP-END",
                "SETPOINT",
                "GAIN",
                "BEGIN CCD-TEMP",
                "BEGIN CCD-SETPOINT",
                "BEGIN EXPOSURE",
                "BEGIN DOMETEMP",
                "END CCD-TEMP",
                "END DOMETEMP",
            ]
        );
        assert_eq!(
            header.get("DATE-BEG"),
            Some(&TelemetryValue::Text("2024-05-01T03:00:00.000000Z".into()))
        );
        assert_eq!(header.get("EXPTIME"), Some(&TelemetryValue::Number(3.0)));
        assert_eq!(header.get("TEMP-END"), Some(&TelemetryValue::Number(-6.0)));
        assert_eq!(header.get("GAIN"), Some(&TelemetryValue::Unavailable));
        assert_eq!(header.get("BEGIN CCD-TEMP"), Some(&TelemetryValue::Number(-5.0)));
        assert_eq!(header.get("BEGIN EXPOSURE"), Some(&TelemetryValue::Number(10.0)));
        assert_eq!(header.get("END CCD-TEMP"), Some(&TelemetryValue::Number(-6.0)));
        assert_eq!(header.get("END DOMETEMP"), Some(&TelemetryValue::Unavailable));
    }

    #[tokio::test]
    async fn test_directory_sink_writes_pixels_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("raw"), "camvisx").unwrap();

        let id = sink.commit(&artifact()).await.unwrap();
        assert_eq!(id.as_str(), "camvisx_20240501030000000000");

        let raw = std::fs::read(sink.dir().join(format!("{id}.raw"))).unwrap();
        assert_eq!(raw, vec![1, 0, 2, 0, 3, 0, 0, 1]);

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sink.dir().join(format!("{id}.json"))).unwrap())
                .unwrap();
        assert_eq!(json["bits_per_pixel"], 16);
        assert_eq!(json["timing"]["canceled"], true);
        assert_eq!(json["header"][4]["keyword"], "CANCELED");
        assert_eq!(json["header"][14]["keyword"], "END DOMETEMP");
        assert!(json["header"][14]["value"].is_null());

        // Same start time again must not clobber the first frame
        assert!(sink.commit(&artifact()).await.is_err());
        assert_eq!(
            std::fs::read(sink.dir().join(format!("{id}.raw"))).unwrap(),
            vec![1, 0, 2, 0, 3, 0, 0, 1]
        );
    }

    #[tokio::test]
    async fn test_directory_sink_header_failure_leaves_no_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path(), "camvisx").unwrap();
        let raw_path = dir.path().join("camvisx_20240501030000000000.raw");
        let header_path = dir.path().join("camvisx_20240501030000000000.json");

        // A directory squatting on the header name makes the header write fail
        std::fs::create_dir(&header_path).unwrap();
        assert!(sink.commit(&artifact()).await.is_err());
        assert!(!raw_path.exists());
        assert!(header_path.is_dir());

        std::fs::remove_dir(&header_path).unwrap();
        sink.commit(&artifact()).await.unwrap();
        assert!(raw_path.exists());
        assert!(header_path.is_file());
    }

    #[tokio::test]
    async fn test_memory_sink_failure_injection() {
        let sink = MemorySink::new();
        sink.set_failing(true);
        assert!(sink.commit(&artifact()).await.is_err());

        sink.set_failing(false);
        let id = sink.commit(&artifact()).await.unwrap();
        assert_eq!(id.as_str(), "frame_0002");
        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.artifacts().await.len(), 1);
    }
}
