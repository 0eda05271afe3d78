//! Camera capability consumed by the control core.
//!
//! Hardware-agnostic interface for the science detector. Implementations
//! handle vendor specifics (SDK handles, unit conversion, readout buffers);
//! the controller only sequences these calls.
//!
//! All methods take `&self` so a single camera can be shared as
//! `Arc<dyn Camera>` between the exposure controller, the telemetry
//! collector and the temperature regulator. Calls that take hardware time
//! (start, readout) are expected to return promptly: the controller issues
//! the command and checks progress on a later tick.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod simulated;

pub use simulated::{CameraCall, SimulatedCamera, SimulatedFault};

/// Pixel buffer in the sensor's native bit depth.
///
/// 16-bit data is the normal science mode; 8-bit is kept for quick-look
/// readout modes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel)
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bits_per_pixel(&self) -> u8 {
        match self {
            PixelBuffer::U8(_) => 8,
            PixelBuffer::U16(_) => 16,
        }
    }

    /// Returns the memory size in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len() * 2,
        }
    }

    /// Raw payload, little-endian for multi-byte pixels.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            PixelBuffer::U8(data) => data.clone(),
            PixelBuffer::U16(data) => data.iter().flat_map(|&px| px.to_le_bytes()).collect(),
        }
    }
}

/// One read-out frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data, row-major
    pub pixels: PixelBuffer,
}

impl Frame {
    /// Returns the total number of pixels (width × height).
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Camera capability used by the exposure controller.
///
/// Units: seconds for exposure time, degrees Celsius for temperatures.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Begin a single-frame exposure with the currently programmed exposure time.
    async fn start_exposure(&self) -> Result<()>;

    /// Abort the exposure in flight; pixels integrated so far stay readable.
    async fn cancel_exposure(&self) -> Result<()>;

    /// Read out the frame of the last exposure.
    async fn read_frame(&self) -> Result<Frame>;

    /// Programmed exposure time in seconds.
    async fn exposure_time(&self) -> Result<f64>;

    async fn set_exposure_time(&self, seconds: f64) -> Result<()>;

    async fn gain(&self) -> Result<f64>;

    async fn set_gain(&self, gain: f64) -> Result<()>;

    /// Cooler setpoint last programmed into the hardware.
    async fn temperature_target(&self) -> Result<f64>;

    async fn set_temperature_target(&self, celsius: f64) -> Result<()>;

    /// Detector temperature as currently measured.
    async fn temperature_current(&self) -> Result<f64>;
}
