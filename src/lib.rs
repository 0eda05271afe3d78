//! Control process for the VIS-X science camera.
//!
//! The crate sequences single-frame exposures, forwards the cooler
//! setpoint, mirrors user-visible state onto a property bus and persists
//! every frame with a telemetry header.
//!
//! - [`exposure`]: the exposure lifecycle state machine
//! - [`metadata`]: telemetry snapshots at exposure boundaries
//! - [`regulator`]: cooler setpoint forwarding
//! - [`property`]: bus write validation and change-driven publication
//! - [`control_loop`]: the periodic tick composing all of the above
//!
//! Collaborators sit behind traits ([`camera::Camera`],
//! [`bus::PropertyBus`], [`storage::FrameSink`],
//! [`metadata::TelemetryProvider`]) with in-process implementations used by
//! the binary and the tests.

pub mod bus;
pub mod camera;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod exposure;
pub mod logging;
pub mod metadata;
pub mod property;
pub mod regulator;
pub mod storage;

pub use control_loop::{ControlLoop, TickReport};
pub use error::{AppResult, ControlError};
pub use exposure::{ControllerState, ExposureController, ExposureRequest, ExposureSetting};
