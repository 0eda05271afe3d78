//! Property synchronisation between the bus and the controller.
//!
//! `PropertySync` owns the user-settable values (exposure time, cooler
//! target, temperature controller toggle) and a mirror of every field it
//! has published. Inbound writes are validated here; the controller state
//! is only read to decide whether an exposure-time write is accepted.
//!
//! | Property           | Fields                       | Writable                    |
//! |--------------------|------------------------------|-----------------------------|
//! | `expose`           | `request`, `cancel`          | always (momentary switches) |
//! | `exptime`          | `current`, `target`          | `target`, only while idle   |
//! | `temp_ccd`         | `current`, `target`          | `target`, within bounds     |
//! | `temp_controller`  | `toggle`                     | always                      |
//! | `current_exposure` | `remaining_sec`, `remaining_pct` | no                      |
//! | `fsm`              | `state`                      | no                          |
//! | `last_frame`       | `name`                       | no                          |
//!
//! Rejected writes are echoed back with the unchanged value and returned as
//! [`ControlError::InvalidRequest`]; the bus never sees an error.

use std::collections::HashMap;

use crate::bus::{
    PropertyElement, PropertyPerm, PropertyUpdate, PropertyValue, PropertyVector, PropertyWrite,
    SwitchState,
};
use crate::config::ControlConfig;
use crate::error::{AppResult, ControlError};
use crate::exposure::{ControllerState, ControllerStatus, ExposureRequest, ExposureSetting};

pub const EXPOSE: &str = "expose";
pub const EXPTIME: &str = "exptime";
pub const TEMP_CCD: &str = "temp_ccd";
pub const TEMP_CONTROLLER: &str = "temp_controller";
pub const CURRENT_EXPOSURE: &str = "current_exposure";
pub const FSM: &str = "fsm";
pub const LAST_FRAME: &str = "last_frame";

const LAYOUT: [(&str, PropertyPerm); 7] = [
    (EXPOSE, PropertyPerm::ReadWrite),
    (EXPTIME, PropertyPerm::ReadWrite),
    (TEMP_CCD, PropertyPerm::ReadWrite),
    (TEMP_CONTROLLER, PropertyPerm::ReadWrite),
    (CURRENT_EXPOSURE, PropertyPerm::ReadOnly),
    (FSM, PropertyPerm::ReadOnly),
    (LAST_FRAME, PropertyPerm::ReadOnly),
];

/// Cooler target and the last temperature read from the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSetpoint {
    pub target_c: f64,
    pub current_c: Option<f64>,
}

type FieldKey = (String, String);

pub struct PropertySync {
    device: String,
    exposure: ExposureSetting,
    temperature: TemperatureSetpoint,
    min_c: f64,
    max_c: f64,
    regulator_enabled: bool,
    published: HashMap<FieldKey, PropertyValue>,
    echoes: Vec<PropertyUpdate>,
}

impl PropertySync {
    pub fn new(
        device: impl Into<String>,
        exposure: ExposureSetting,
        target_c: f64,
        (min_c, max_c): (f64, f64),
        regulator_enabled: bool,
    ) -> Self {
        Self {
            device: device.into(),
            exposure,
            temperature: TemperatureSetpoint {
                target_c,
                current_c: None,
            },
            min_c,
            max_c,
            regulator_enabled,
            published: HashMap::new(),
            echoes: Vec::new(),
        }
    }

    pub fn from_config(config: &ControlConfig) -> AppResult<Self> {
        let exposure = ExposureSetting::new(config.camera.initial_exposure_s).ok_or_else(|| {
            ControlError::Configuration(format!(
                "initial_exposure_s {} outside (0, {}]",
                config.camera.initial_exposure_s,
                ExposureSetting::MAX_S
            ))
        })?;
        Ok(Self::new(
            config.application.device_name.clone(),
            exposure,
            config.camera.initial_temperature_c,
            (config.temperature.min_c, config.temperature.max_c),
            config.temperature.controller_enabled,
        ))
    }

    pub fn exposure_setting(&self) -> ExposureSetting {
        self.exposure
    }

    pub fn temperature(&self) -> TemperatureSetpoint {
        self.temperature
    }

    pub fn regulator_enabled(&self) -> bool {
        self.regulator_enabled
    }

    /// Record the detector temperature reported this tick.
    pub fn observe_temperature(&mut self, current_c: Option<f64>) {
        self.temperature.current_c = current_c;
    }

    /// Apply one inbound write.
    ///
    /// Returns the exposure request it raised, if any. The echo for the
    /// written field is queued for the next [`Self::outbound`] call, also
    /// when the write is rejected.
    pub fn apply(
        &mut self,
        write: &PropertyWrite,
        state: ControllerState,
    ) -> AppResult<Option<ExposureRequest>> {
        match (write.property.as_str(), write.field.as_str()) {
            (EXPOSE, field @ ("request" | "cancel")) => {
                // Momentary: the bus always sees the switch fall back to off
                self.echo(EXPOSE, field, PropertyValue::Switch(SwitchState::Off));
                let request = match field {
                    "request" => ExposureRequest::Start,
                    _ => ExposureRequest::Cancel,
                };
                match switch_value(write)? {
                    SwitchState::On => Ok(Some(request)),
                    SwitchState::Off => Ok(None),
                }
            }
            (EXPTIME, "target") => {
                let accepted = number_value(write).and_then(|seconds| {
                    if state != ControllerState::Idle {
                        return Err(reject(write, format!("exposure {state}")));
                    }
                    ExposureSetting::new(seconds).ok_or_else(|| {
                        reject(
                            write,
                            format!("{seconds} s outside (0, {}]", ExposureSetting::MAX_S),
                        )
                    })
                });
                if let Ok(setting) = accepted {
                    self.exposure = setting;
                }
                let seconds = PropertyValue::Number(Some(self.exposure.seconds()));
                self.echo(EXPTIME, "current", seconds.clone());
                self.echo(EXPTIME, "target", seconds);
                accepted.map(|_| None)
            }
            (TEMP_CCD, "target") => {
                let accepted = number_value(write).and_then(|celsius| {
                    if (self.min_c..=self.max_c).contains(&celsius) {
                        Ok(celsius)
                    } else {
                        Err(reject(
                            write,
                            format!("{celsius} C outside [{}, {}]", self.min_c, self.max_c),
                        ))
                    }
                });
                if let Ok(celsius) = accepted {
                    self.temperature.target_c = celsius;
                }
                let target = PropertyValue::Number(Some(self.temperature.target_c));
                self.echo(TEMP_CCD, "target", target);
                accepted.map(|_| None)
            }
            (TEMP_CONTROLLER, "toggle") => {
                let accepted = switch_value(write);
                if let Ok(position) = accepted {
                    self.regulator_enabled = position == SwitchState::On;
                }
                let toggle = PropertyValue::Switch(self.regulator_enabled.into());
                self.echo(TEMP_CONTROLLER, "toggle", toggle);
                accepted.map(|_| None)
            }
            (EXPTIME | TEMP_CCD, "current")
            | (CURRENT_EXPOSURE, _)
            | (FSM, _)
            | (LAST_FRAME, _) => Err(reject(write, "read-only")),
            _ => Err(reject(write, "unknown property")),
        }
    }

    /// Property vectors to define once the bus is connected.
    ///
    /// Resets the published mirror to the defined values.
    pub fn definitions(&mut self, status: &ControllerStatus) -> Vec<PropertyVector> {
        let values = self.field_values(status);
        self.echoes.clear();
        self.published = values
            .iter()
            .map(|(property, field, value)| {
                ((property.to_string(), field.to_string()), value.clone())
            })
            .collect();

        LAYOUT
            .iter()
            .map(|(name, perm)| PropertyVector {
                device: self.device.clone(),
                name: name.to_string(),
                perm: *perm,
                elements: values
                    .iter()
                    .filter(|(property, _, _)| property == name)
                    .map(|(_, field, value)| PropertyElement::new(*field, value.clone()))
                    .collect(),
            })
            .collect()
    }

    /// Updates to publish this tick: queued echoes first, then every field
    /// whose value differs from what was last published.
    pub fn outbound(&mut self, status: &ControllerStatus) -> Vec<PropertyUpdate> {
        let mut updates = std::mem::take(&mut self.echoes);
        for update in &updates {
            self.published.insert(
                (update.property.clone(), update.field.clone()),
                update.value.clone(),
            );
        }

        for (property, field, value) in self.field_values(status) {
            let key = (property.to_string(), field.to_string());
            if self.published.get(&key) != Some(&value) {
                self.published.insert(key, value.clone());
                updates.push(PropertyUpdate::new(property, field, value));
            }
        }
        updates
    }

    fn echo(&mut self, property: &str, field: &str, value: PropertyValue) {
        self.echoes.push(PropertyUpdate::new(property, field, value));
    }

    fn field_values(&self, status: &ControllerStatus) -> Vec<(&'static str, &'static str, PropertyValue)> {
        let off = PropertyValue::Switch(SwitchState::Off);
        let exposure = PropertyValue::Number(Some(self.exposure.seconds()));
        vec![
            (EXPOSE, "request", off.clone()),
            (EXPOSE, "cancel", off),
            (EXPTIME, "current", exposure.clone()),
            (EXPTIME, "target", exposure),
            (TEMP_CCD, "current", PropertyValue::Number(self.temperature.current_c)),
            (TEMP_CCD, "target", PropertyValue::Number(Some(self.temperature.target_c))),
            (
                TEMP_CONTROLLER,
                "toggle",
                PropertyValue::Switch(self.regulator_enabled.into()),
            ),
            (
                CURRENT_EXPOSURE,
                "remaining_sec",
                PropertyValue::Number(Some(tenths(status.remaining_s))),
            ),
            (
                CURRENT_EXPOSURE,
                "remaining_pct",
                PropertyValue::Number(Some(tenths(status.remaining_pct))),
            ),
            (FSM, "state", PropertyValue::Text(status.state.to_string())),
            (
                LAST_FRAME,
                "name",
                PropertyValue::Text(
                    status
                        .last_artifact
                        .as_ref()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                ),
            ),
        ]
    }
}

// Keeps remaining-time publications to one update per 100 ms of progress.
fn tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn reject(write: &PropertyWrite, reason: impl Into<String>) -> ControlError {
    ControlError::invalid_request(&write.property, &write.field, reason)
}

fn number_value(write: &PropertyWrite) -> AppResult<f64> {
    match write.value {
        PropertyValue::Number(Some(value)) if value.is_finite() => Ok(value),
        ref other => Err(reject(write, format!("expected a number, got '{other}'"))),
    }
}

fn switch_value(write: &PropertyWrite) -> AppResult<SwitchState> {
    match write.value {
        PropertyValue::Switch(position) => Ok(position),
        ref other => Err(reject(write, format!("expected On/Off, got '{other}'"))),
    }
}
