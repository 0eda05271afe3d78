//! Custom error types for the control process.
//!
//! This module defines `ControlError`, the single error type reported by the
//! exposure controller, the property synchronisation layer and the control
//! loop. It is built with `thiserror` so collaborator failures convert with
//! `?` and display consistently in logs.
//!
//! ## Error Hierarchy
//!
//! - **`HardwareCommandFailure`**: a camera command (start, cancel, readout,
//!   setpoint) failed. The exposure record involved is abandoned and the
//!   controller returns to `Idle`.
//! - **`TelemetryUnavailable`**: a named telemetry value could not be read.
//!   Snapshots record a sentinel instead; this is never fatal.
//! - **`PersistenceFailure`**: the frame sink rejected a finished exposure.
//!   Reported once, never retried by the controller.
//! - **`InvalidRequest`**: a bus write that was rejected locally, e.g. an
//!   exposure-time change while exposing. The bus only sees the echoed value.
//! - **`Config`** / **`Configuration`** / **`BusUnavailable`** / **`Io`**:
//!   bootstrap failures.
//!
//! Only hardware and persistence failures are operationally significant; see
//! [`ControlError::is_operational`].

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the control error type.
pub type AppResult<T> = std::result::Result<T, ControlError>;

/// Coarse classification used as the `fault` field in log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Camera command failure.
    Hardware,
    /// Frame sink failure.
    Persistence,
    /// Missing telemetry value.
    Telemetry,
    /// Rejected bus write.
    Request,
    /// Configuration or process bootstrap failure.
    Bootstrap,
}

impl FaultKind {
    /// Stable lowercase label for structured logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Hardware => "hardware",
            FaultKind::Persistence => "persistence",
            FaultKind::Telemetry => "telemetry",
            FaultKind::Request => "request",
            FaultKind::Bootstrap => "bootstrap",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera command that failed, carried by `HardwareCommandFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraCommand {
    /// Begin integrating.
    StartExposure,
    /// Abort an exposure in flight.
    CancelExposure,
    /// Read pixels after an exposure ended.
    ReadFrame,
    /// Program the exposure time.
    SetExposureTime,
    /// Program the cooler setpoint.
    SetTemperatureTarget,
    /// Read the detector temperature.
    ReadTemperature,
}

impl fmt::Display for CameraCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraCommand::StartExposure => "start_exposure",
            CameraCommand::CancelExposure => "cancel_exposure",
            CameraCommand::ReadFrame => "read_frame",
            CameraCommand::SetExposureTime => "set_exposure_time",
            CameraCommand::SetTemperatureTarget => "set_temperature_target",
            CameraCommand::ReadTemperature => "temperature_current",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Camera command {command} failed: {reason}")]
    HardwareCommandFailure {
        command: CameraCommand,
        reason: String,
    },

    #[error("Telemetry '{key}' unavailable: {reason}")]
    TelemetryUnavailable { key: String, reason: String },

    #[error("Frame sink rejected exposure: {reason}")]
    PersistenceFailure { reason: String },

    #[error("Rejected write to {property}.{field}: {reason}")]
    InvalidRequest {
        property: String,
        field: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Property bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Wrap a collaborator error from a camera call.
    pub fn hardware(command: CameraCommand, err: &anyhow::Error) -> Self {
        ControlError::HardwareCommandFailure {
            command,
            reason: format!("{err:#}"),
        }
    }

    /// Wrap a collaborator error from the frame sink.
    pub fn persistence(err: &anyhow::Error) -> Self {
        ControlError::PersistenceFailure {
            reason: format!("{err:#}"),
        }
    }

    pub fn invalid_request(
        property: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ControlError::InvalidRequest {
            property: property.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            ControlError::HardwareCommandFailure { .. } => FaultKind::Hardware,
            ControlError::PersistenceFailure { .. } => FaultKind::Persistence,
            ControlError::TelemetryUnavailable { .. } => FaultKind::Telemetry,
            ControlError::InvalidRequest { .. } => FaultKind::Request,
            ControlError::Config(_)
            | ControlError::Configuration(_)
            | ControlError::BusUnavailable(_)
            | ControlError::Io(_) => FaultKind::Bootstrap,
        }
    }

    /// Whether this failure must be distinguishable in operational telemetry.
    pub fn is_operational(&self) -> bool {
        matches!(self.kind(), FaultKind::Hardware | FaultKind::Persistence)
    }

    /// Log this error once, at a level matching its significance.
    pub fn report(&self) {
        let fault = self.kind().as_str();
        match self.kind() {
            FaultKind::Hardware | FaultKind::Persistence | FaultKind::Bootstrap => {
                tracing::error!(fault, error = %self, "control fault");
            }
            FaultKind::Telemetry => tracing::warn!(fault, error = %self, "telemetry gap"),
            FaultKind::Request => tracing::debug!(fault, error = %self, "request rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControlError::HardwareCommandFailure {
            command: CameraCommand::StartExposure,
            reason: "shutter jammed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Camera command start_exposure failed: shutter jammed"
        );
    }

    #[test]
    fn test_only_hardware_and_persistence_are_operational() {
        let hw = ControlError::hardware(CameraCommand::ReadFrame, &anyhow::anyhow!("timeout"));
        let sink = ControlError::persistence(&anyhow::anyhow!("disk full"));
        let telemetry = ControlError::TelemetryUnavailable {
            key: "PRESSURE".into(),
            reason: "no source".into(),
        };
        let request = ControlError::invalid_request("exptime", "target", "exposing");

        assert!(hw.is_operational());
        assert!(sink.is_operational());
        assert!(!telemetry.is_operational());
        assert!(!request.is_operational());
        assert_eq!(sink.kind().as_str(), "persistence");
    }

    #[test]
    fn test_hardware_reason_keeps_context_chain() {
        let inner = anyhow::anyhow!("usb reset").context("readout aborted");
        let err = ControlError::hardware(CameraCommand::ReadFrame, &inner);
        let text = err.to_string();
        assert!(text.contains("readout aborted"));
        assert!(text.contains("usb reset"));
    }
}
