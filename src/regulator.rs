//! Cooler setpoint forwarding.
//!
//! Closed-loop thermal control runs in the camera firmware. The regulator
//! only keeps the commanded setpoint in sync with the requested target and
//! remembers the last observed detector temperature for reporting.

/// Setpoint the camera should be programmed with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointCommand {
    pub target_c: f64,
}

/// Pass-through temperature regulator.
#[derive(Debug, Clone)]
pub struct TemperatureRegulator {
    enabled: bool,
    last_commanded: Option<f64>,
    last_observed: Option<f64>,
}

impl TemperatureRegulator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_commanded: None,
            last_observed: None,
        }
    }

    /// Compare `target` with the last commanded setpoint.
    ///
    /// Records `current` (when present) and returns a command when the
    /// camera needs reprogramming. Nothing is issued while disabled. The
    /// caller confirms a successful command with [`Self::mark_commanded`];
    /// until then the same command is returned on every tick.
    pub fn tick(&mut self, target: f64, current: Option<f64>) -> Option<SetpointCommand> {
        if current.is_some() {
            self.last_observed = current;
        }
        if !self.enabled || self.last_commanded == Some(target) {
            return None;
        }
        Some(SetpointCommand { target_c: target })
    }

    pub fn mark_commanded(&mut self, command: SetpointCommand) {
        tracing::info!(setpoint_c = command.target_c, "Cooler setpoint commanded");
        self.last_commanded = Some(command.target_c);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            tracing::info!(enabled, "Temperature controller toggled");
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_commanded(&self) -> Option<f64> {
        self.last_commanded
    }

    /// Last detector temperature seen by [`Self::tick`].
    pub fn last_observed(&self) -> Option<f64> {
        self.last_observed
    }
}
