//! Simulated detector
//!
//! In-process camera used when no hardware is attached and by the tests.
//! Simulates:
//! - Single-frame exposure lifecycle (start, cancel, readout)
//! - A cooler that steps toward its setpoint on every temperature read
//! - A deterministic test pattern that changes per frame
//! - Fault injection per command, for exercising error paths. A failed
//!   abort or readout loses the exposure, leaving the sensor idle.
//!
//! Every command is recorded so tests can assert call ordering.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Camera, Frame, PixelBuffer};

/// Ambient temperature the simulated detector starts at (deg C).
const AMBIENT_C: f64 = 20.0;

/// Commands the simulated camera can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedFault {
    StartExposure,
    CancelExposure,
    ReadFrame,
    SetExposureTime,
    SetTemperatureTarget,
    ReadTemperature,
}

/// Recorded camera command, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraCall {
    StartExposure,
    CancelExposure,
    ReadFrame,
    SetExposureTime(f64),
    SetGain(f64),
    SetTemperatureTarget(f64),
}

struct SimulatedState {
    exposure_time_s: f64,
    gain: f64,
    temperature_target_c: f64,
    temperature_c: f64,
    exposing: bool,
    exposure_pending_readout: bool,
    frame_count: u32,
    calls: Vec<CameraCall>,
    faults: HashSet<SimulatedFault>,
}

/// Simulated camera with configurable sensor geometry.
///
/// Cheap to clone; clones share the same simulated hardware.
///
/// # Example
///
/// ```rust,ignore
/// let camera = SimulatedCamera::new(64, 64, 16);
/// camera.set_exposure_time(2.0).await?;
/// camera.start_exposure().await?;
/// let frame = camera.read_frame().await?;
/// assert_eq!(frame.pixel_count(), 64 * 64);
/// ```
#[derive(Clone)]
pub struct SimulatedCamera {
    width: u32,
    height: u32,
    bits_per_pixel: u8,
    cooling_step_c: f64,
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedCamera {
    /// Create a simulated camera. `bits_per_pixel` other than 8 means 16.
    pub fn new(width: u32, height: u32, bits_per_pixel: u8) -> Self {
        Self {
            width,
            height,
            bits_per_pixel,
            cooling_step_c: 1.0,
            state: Arc::new(Mutex::new(SimulatedState {
                exposure_time_s: 1.0,
                gain: 1.0,
                temperature_target_c: AMBIENT_C,
                temperature_c: AMBIENT_C,
                exposing: false,
                exposure_pending_readout: false,
                frame_count: 0,
                calls: Vec::new(),
                faults: HashSet::new(),
            })),
        }
    }

    /// Change how far the detector temperature moves per read (deg C).
    pub fn with_cooling_step(mut self, step_c: f64) -> Self {
        self.cooling_step_c = step_c;
        self
    }

    /// Make the given command fail until cleared.
    pub async fn inject_fault(&self, fault: SimulatedFault) {
        self.state.lock().await.faults.insert(fault);
    }

    pub async fn clear_fault(&self, fault: SimulatedFault) {
        self.state.lock().await.faults.remove(&fault);
    }

    /// Commands received so far, oldest first.
    pub async fn calls(&self) -> Vec<CameraCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn is_exposing(&self) -> bool {
        self.state.lock().await.exposing
    }

    /// Force the measured temperature, e.g. to start a test from a known point.
    pub async fn set_measured_temperature(&self, celsius: f64) {
        self.state.lock().await.temperature_c = celsius;
    }

    pub async fn frame_count(&self) -> u32 {
        self.state.lock().await.frame_count
    }

    fn test_pattern(&self, frame_number: u32) -> PixelBuffer {
        let capacity = self.width as usize * self.height as usize;
        if self.bits_per_pixel == 8 {
            let mut data = Vec::with_capacity(capacity);
            for y in 0..self.height {
                for x in 0..self.width {
                    data.push(((x + y + frame_number) % 256) as u8);
                }
            }
            PixelBuffer::U8(data)
        } else {
            let mut data = Vec::with_capacity(capacity);
            for y in 0..self.height {
                for x in 0..self.width {
                    // u32 arithmetic, then clamp into the 16-bit range
                    let val = ((x + y + frame_number) % 256) * 100;
                    data.push(val.min(u32::from(u16::MAX)) as u16);
                }
            }
            PixelBuffer::U16(data)
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new(64, 64, 16)
    }
}

fn check_fault(state: &SimulatedState, fault: SimulatedFault) -> Result<()> {
    if state.faults.contains(&fault) {
        bail!("simulated {:?} fault", fault);
    }
    Ok(())
}

fn drop_exposure(state: &mut SimulatedState) {
    state.exposing = false;
    state.exposure_pending_readout = false;
}

#[async_trait]
impl Camera for SimulatedCamera {
    async fn start_exposure(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(CameraCall::StartExposure);
        check_fault(&state, SimulatedFault::StartExposure)?;
        if state.exposing {
            bail!("Exposure already in progress");
        }
        state.exposing = true;
        state.exposure_pending_readout = true;
        tracing::debug!(
            exposure_s = state.exposure_time_s,
            "Simulated exposure started"
        );
        Ok(())
    }

    async fn cancel_exposure(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(CameraCall::CancelExposure);
        if let Err(e) = check_fault(&state, SimulatedFault::CancelExposure) {
            drop_exposure(&mut state);
            return Err(e);
        }
        state.exposing = false;
        tracing::debug!("Simulated exposure canceled");
        Ok(())
    }

    async fn read_frame(&self) -> Result<Frame> {
        let frame_number = {
            let mut state = self.state.lock().await;
            state.calls.push(CameraCall::ReadFrame);
            if let Err(e) = check_fault(&state, SimulatedFault::ReadFrame) {
                drop_exposure(&mut state);
                return Err(e);
            }
            if !state.exposure_pending_readout {
                bail!("No exposure to read out");
            }
            drop_exposure(&mut state);
            state.frame_count += 1;
            state.frame_count
        };

        Ok(Frame {
            width: self.width,
            height: self.height,
            pixels: self.test_pattern(frame_number),
        })
    }

    async fn exposure_time(&self) -> Result<f64> {
        Ok(self.state.lock().await.exposure_time_s)
    }

    async fn set_exposure_time(&self, seconds: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(CameraCall::SetExposureTime(seconds));
        check_fault(&state, SimulatedFault::SetExposureTime)?;
        if state.exposing {
            bail!("Cannot change exposure time while exposing");
        }
        state.exposure_time_s = seconds;
        Ok(())
    }

    async fn gain(&self) -> Result<f64> {
        Ok(self.state.lock().await.gain)
    }

    async fn set_gain(&self, gain: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(CameraCall::SetGain(gain));
        state.gain = gain;
        Ok(())
    }

    async fn temperature_target(&self) -> Result<f64> {
        Ok(self.state.lock().await.temperature_target_c)
    }

    async fn set_temperature_target(&self, celsius: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(CameraCall::SetTemperatureTarget(celsius));
        check_fault(&state, SimulatedFault::SetTemperatureTarget)?;
        state.temperature_target_c = celsius;
        Ok(())
    }

    async fn temperature_current(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        check_fault(&state, SimulatedFault::ReadTemperature)?;
        let delta = state.temperature_target_c - state.temperature_c;
        let step = delta.clamp(-self.cooling_step_c, self.cooling_step_c);
        state.temperature_c += step;
        Ok(state.temperature_c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exposure_lifecycle() {
        let camera = SimulatedCamera::new(8, 4, 16);

        camera.set_exposure_time(2.0).await.unwrap();
        camera.start_exposure().await.unwrap();
        assert!(camera.is_exposing().await);

        // Cannot start twice
        assert!(camera.start_exposure().await.is_err());

        let frame = camera.read_frame().await.unwrap();
        assert_eq!(frame.pixel_count(), 32);
        assert_eq!(frame.pixels.bits_per_pixel(), 16);
        assert!(!camera.is_exposing().await);

        // Nothing left to read
        assert!(camera.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_canceled_exposure_is_still_readable() {
        let camera = SimulatedCamera::new(4, 4, 8);
        camera.start_exposure().await.unwrap();
        camera.cancel_exposure().await.unwrap();

        let frame = camera.read_frame().await.unwrap();
        assert_eq!(frame.pixels.bits_per_pixel(), 8);
        assert_eq!(
            camera.calls().await,
            vec![
                CameraCall::StartExposure,
                CameraCall::CancelExposure,
                CameraCall::ReadFrame
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_readout_leaves_sensor_ready() {
        let camera = SimulatedCamera::new(4, 4, 16);
        camera.inject_fault(SimulatedFault::ReadFrame).await;
        camera.start_exposure().await.unwrap();
        assert!(camera.read_frame().await.is_err());
        assert!(!camera.is_exposing().await);

        camera.clear_fault(SimulatedFault::ReadFrame).await;
        // Frame is gone, but the next exposure can be set up and started
        assert!(camera.read_frame().await.is_err());
        camera.set_exposure_time(5.0).await.unwrap();
        camera.start_exposure().await.unwrap();
        assert_eq!(camera.read_frame().await.unwrap().pixel_count(), 16);
    }

    #[tokio::test]
    async fn test_failed_abort_leaves_sensor_ready() {
        let camera = SimulatedCamera::new(4, 4, 16);
        camera.inject_fault(SimulatedFault::CancelExposure).await;
        camera.start_exposure().await.unwrap();
        assert!(camera.cancel_exposure().await.is_err());
        assert!(!camera.is_exposing().await);
        assert!(camera.set_exposure_time(2.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_cooler_steps_toward_target() {
        let camera = SimulatedCamera::new(1, 1, 16).with_cooling_step(2.5);
        camera.set_temperature_target(15.0).await.unwrap();

        assert_eq!(camera.temperature_current().await.unwrap(), 17.5);
        assert_eq!(camera.temperature_current().await.unwrap(), 15.0);
        assert_eq!(camera.temperature_current().await.unwrap(), 15.0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let camera = SimulatedCamera::default();
        camera.inject_fault(SimulatedFault::StartExposure).await;
        assert!(camera.start_exposure().await.is_err());
        assert!(!camera.is_exposing().await);

        camera.clear_fault(SimulatedFault::StartExposure).await;
        assert!(camera.start_exposure().await.is_ok());
    }
}
