//! Exposure lifecycle controller.
//!
//! State machine driving one exposure at a time:
//!
//! ```text
//!            start            due / cancel          commit (or failure)
//!   Idle ───────────▶ Exposing ───────────▶ Finalizing ───────────▶ Idle
//! ```
//!
//! Each [`ExposureController::tick`] evaluates at most one transition, in
//! this order (first match wins):
//!
//! 1. cancel requested while `Exposing`: abort the camera, keep the elapsed
//!    time as the actual duration, move to `Finalizing`
//! 2. start requested while `Idle`: program the exposure time, snapshot
//!    telemetry, start the camera, move to `Exposing`
//! 3. `Exposing` and the planned duration has elapsed: move to `Finalizing`
//! 4. `Finalizing`: read out, publish the frame to live subscribers,
//!    snapshot telemetry, commit to the frame sink, return to `Idle`
//!    whatever the sink answers
//!
//! Requests are edge events: everything passed to a tick is consumed by that
//! tick, acted upon or not. The exposure record lives inside the state, so
//! a record exists exactly when the controller is not `Idle`.
//!
//! Time is supplied by the caller. Durations are computed at microsecond
//! resolution.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::camera::{Camera, Frame};
use crate::error::{CameraCommand, ControlError};
use crate::metadata::{MetadataCollector, TelemetrySnapshot};
use crate::storage::{ArtifactId, ExposureArtifact, ExposureTiming, FrameHeader, FrameSink};

/// Requested exposure duration, validated to `0 < s <= MAX_S`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureSetting(f64);

impl ExposureSetting {
    /// Longest exposure accepted (s).
    pub const MAX_S: f64 = 1_000_000.0;

    pub fn new(seconds: f64) -> Option<Self> {
        (seconds > 0.0 && seconds <= Self::MAX_S).then_some(Self(seconds))
    }

    pub fn seconds(&self) -> f64 {
        self.0
    }
}

/// Edge-triggered request delivered to one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureRequest {
    Start,
    Cancel,
}

/// Externally visible controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Exposing,
    Finalizing,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Exposing => "exposing",
            ControllerState::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The exposure in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRecord {
    pub started_at: DateTime<Utc>,
    pub planned_s: f64,
    pub start_snapshot: TelemetrySnapshot,
    /// Set when the exposure completes or is canceled.
    pub actual_s: Option<f64>,
    pub canceled: bool,
}

impl ExposureRecord {
    fn elapsed_s(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.started_at, now)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.started_at + duration_from_secs(self.planned_s)
    }
}

/// A state change made by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ControllerState,
    pub to: ControllerState,
}

/// What one controller tick did.
#[derive(Debug, Default)]
pub struct ControllerTick {
    pub transition: Option<Transition>,
    /// Artifact accepted by the sink this tick.
    pub committed: Option<ArtifactId>,
    pub error: Option<ControlError>,
}

impl ControllerTick {
    fn moved(from: ControllerState, to: ControllerState) -> Self {
        Self {
            transition: Some(Transition { from, to }),
            ..Self::default()
        }
    }

    fn with_error(mut self, error: ControlError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Progress figures published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub state: ControllerState,
    /// Seconds left; zero unless exposing.
    pub remaining_s: f64,
    /// Percent of the planned duration left; zero unless exposing.
    pub remaining_pct: f64,
    pub last_artifact: Option<ArtifactId>,
}

enum Phase {
    Idle,
    Exposing(ExposureRecord),
    Finalizing(ExposureRecord),
}

impl Phase {
    fn state(&self) -> ControllerState {
        match self {
            Phase::Idle => ControllerState::Idle,
            Phase::Exposing(_) => ControllerState::Exposing,
            Phase::Finalizing(_) => ControllerState::Finalizing,
        }
    }
}

/// Owns the exposure record and sequences the camera, the telemetry
/// collector and the frame sink.
pub struct ExposureController {
    camera: Arc<dyn Camera>,
    collector: MetadataCollector,
    sink: Arc<dyn FrameSink>,
    phase: Phase,
    last_artifact: Option<ArtifactId>,
    latest_frame: watch::Sender<Option<Arc<Frame>>>,
}

impl ExposureController {
    pub fn new(
        camera: Arc<dyn Camera>,
        collector: MetadataCollector,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            camera,
            collector,
            sink,
            phase: Phase::Idle,
            last_artifact: None,
            latest_frame: watch::channel(None).0,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.phase.state()
    }

    /// The exposure in flight, if any.
    pub fn record(&self) -> Option<&ExposureRecord> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Exposing(record) | Phase::Finalizing(record) => Some(record),
        }
    }

    /// Artifact id of the most recent successful commit.
    pub fn last_artifact(&self) -> Option<&ArtifactId> {
        self.last_artifact.as_ref()
    }

    /// Live view of the most recently read-out frame.
    ///
    /// Every successful readout is published here before the frame is
    /// committed, whether or not the sink accepts it.
    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.latest_frame.subscribe()
    }

    pub fn status(&self, now: DateTime<Utc>) -> ControllerStatus {
        let (remaining_s, remaining_pct) = match &self.phase {
            Phase::Exposing(record) => {
                let remaining = (record.planned_s - record.elapsed_s(now)).max(0.0);
                (remaining, 100.0 * remaining / record.planned_s)
            }
            Phase::Idle | Phase::Finalizing(_) => (0.0, 0.0),
        };
        ControllerStatus {
            state: self.state(),
            remaining_s,
            remaining_pct,
            last_artifact: self.last_artifact.clone(),
        }
    }

    /// Advance the state machine once.
    ///
    /// `requests` are consumed whether or not they apply. `setting` is only
    /// read when a new exposure starts.
    pub async fn tick(
        &mut self,
        now: DateTime<Utc>,
        requests: &[ExposureRequest],
        setting: ExposureSetting,
    ) -> ControllerTick {
        let cancel = requests.contains(&ExposureRequest::Cancel);
        let start = requests.contains(&ExposureRequest::Start);

        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let (phase, outcome) = match phase {
            Phase::Exposing(record) if cancel => self.cancel(now, record).await,
            Phase::Idle if start => self.begin(now, setting).await,
            Phase::Exposing(record) if record.is_due(now) => complete(record),
            Phase::Finalizing(record) => self.finalize(now, record).await,
            other => (other, ControllerTick::default()),
        };
        self.phase = phase;

        if start && outcome.transition.map(|t| t.to) != Some(ControllerState::Exposing) {
            debug!(state = %self.state(), "Start request ignored");
        }
        if cancel && outcome.transition.map(|t| t.from) != Some(ControllerState::Exposing) {
            debug!(state = %self.state(), "Cancel request ignored");
        }
        outcome
    }

    async fn begin(&self, now: DateTime<Utc>, setting: ExposureSetting) -> (Phase, ControllerTick) {
        let planned_s = setting.seconds();

        if let Err(e) = self.camera.set_exposure_time(planned_s).await {
            warn!(planned_s, "Could not program exposure time; start dropped");
            let error = ControlError::hardware(CameraCommand::SetExposureTime, &e);
            return (Phase::Idle, ControllerTick::default().with_error(error));
        }
        // Taken once the camera holds this exposure's settings
        let start_snapshot = self.collector.snapshot(now).await;
        if let Err(e) = self.camera.start_exposure().await {
            warn!(planned_s, "Camera refused to start; start dropped");
            let error = ControlError::hardware(CameraCommand::StartExposure, &e);
            return (Phase::Idle, ControllerTick::default().with_error(error));
        }

        info!(planned_s, started_at = %now, "Exposure started");
        let record = ExposureRecord {
            started_at: now,
            planned_s,
            start_snapshot,
            actual_s: None,
            canceled: false,
        };
        (
            Phase::Exposing(record),
            ControllerTick::moved(ControllerState::Idle, ControllerState::Exposing),
        )
    }

    async fn cancel(
        &self,
        now: DateTime<Utc>,
        mut record: ExposureRecord,
    ) -> (Phase, ControllerTick) {
        let elapsed_s = record.elapsed_s(now);

        if let Err(e) = self.camera.cancel_exposure().await {
            warn!(
                started_at = %record.started_at,
                elapsed_s,
                "Abort failed; exposure abandoned"
            );
            let error = ControlError::hardware(CameraCommand::CancelExposure, &e);
            return (
                Phase::Idle,
                ControllerTick::moved(ControllerState::Exposing, ControllerState::Idle)
                    .with_error(error),
            );
        }

        info!(
            started_at = %record.started_at,
            elapsed_s,
            planned_s = record.planned_s,
            "Exposure canceled"
        );
        record.actual_s = Some(elapsed_s);
        record.canceled = true;
        (
            Phase::Finalizing(record),
            ControllerTick::moved(ControllerState::Exposing, ControllerState::Finalizing),
        )
    }

    async fn finalize(
        &mut self,
        now: DateTime<Utc>,
        record: ExposureRecord,
    ) -> (Phase, ControllerTick) {
        let outcome = ControllerTick::moved(ControllerState::Finalizing, ControllerState::Idle);

        let frame = match self.camera.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(started_at = %record.started_at, "Readout failed; frame lost");
                let error = ControlError::hardware(CameraCommand::ReadFrame, &e);
                return (Phase::Idle, outcome.with_error(error));
            }
        };
        let frame = Arc::new(frame);
        self.latest_frame.send_replace(Some(Arc::clone(&frame)));
        let end_snapshot = self.collector.snapshot(now).await;

        let actual_s = record.actual_s.unwrap_or(record.planned_s);
        let timing = ExposureTiming {
            started_at: record.started_at,
            ended_at: record.started_at + duration_from_secs(actual_s),
            planned_s: record.planned_s,
            actual_s,
            canceled: record.canceled,
        };
        let artifact = ExposureArtifact {
            frame,
            header: FrameHeader::assemble(&timing, &record.start_snapshot, &end_snapshot),
            timing,
        };

        match self.sink.commit(&artifact).await {
            Ok(id) => {
                info!(artifact = %id, actual_s, canceled = record.canceled, "Exposure committed");
                self.last_artifact = Some(id.clone());
                (
                    Phase::Idle,
                    ControllerTick {
                        committed: Some(id),
                        ..outcome
                    },
                )
            }
            Err(e) => (
                Phase::Idle,
                outcome.with_error(ControlError::persistence(&e)),
            ),
        }
    }
}

fn complete(mut record: ExposureRecord) -> (Phase, ControllerTick) {
    info!(planned_s = record.planned_s, "Exposure complete");
    record.actual_s = Some(record.planned_s);
    record.canceled = false;
    (
        Phase::Finalizing(record),
        ControllerTick::moved(ControllerState::Exposing, ControllerState::Finalizing),
    )
}

/// Elapsed seconds, never negative even if the wall clock stepped back.
fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let micros = (to - from).num_microseconds().unwrap_or(i64::MAX);
    (micros as f64 / 1_000_000.0).max(0.0)
}

fn duration_from_secs(seconds: f64) -> Duration {
    Duration::microseconds((seconds * 1_000_000.0).round() as i64)
}
