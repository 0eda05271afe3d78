//! Control loop: composition root for one detector.
//!
//! A tick runs, in order:
//! 1. drain bus writes into [`PropertySync`]
//! 2. read the detector temperature and run the [`TemperatureRegulator`]
//! 3. advance the [`ExposureController`]
//! 4. publish changed properties
//!
//! Every failure is collected into the [`TickReport`], logged once and
//! counted; none of them stops the loop.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bus::{wait_for_connection, PropertyBus};
use crate::camera::Camera;
use crate::error::{AppResult, CameraCommand, ControlError, FaultKind};
use crate::exposure::{ExposureController, Transition};
use crate::property::PropertySync;
use crate::regulator::TemperatureRegulator;
use crate::storage::ArtifactId;

/// Outcome of one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub transition: Option<Transition>,
    pub committed: Option<ArtifactId>,
    pub errors: Vec<ControlError>,
    /// Property updates sent to the bus.
    pub published: usize,
}

/// Running totals of reported faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    pub hardware: u64,
    pub persistence: u64,
    pub request: u64,
}

impl FaultCounters {
    fn record(&mut self, error: &ControlError) {
        match error.kind() {
            FaultKind::Hardware => self.hardware += 1,
            FaultKind::Persistence => self.persistence += 1,
            FaultKind::Request => self.request += 1,
            // Telemetry gaps are logged by the collector and never fail a tick
            FaultKind::Telemetry | FaultKind::Bootstrap => {}
        }
    }
}

pub struct ControlLoop {
    bus: Arc<dyn PropertyBus>,
    camera: Arc<dyn Camera>,
    sync: PropertySync,
    regulator: TemperatureRegulator,
    controller: ExposureController,
    tick_interval: Duration,
    connect_poll: Duration,
    counters: FaultCounters,
}

impl ControlLoop {
    pub fn new(
        bus: Arc<dyn PropertyBus>,
        camera: Arc<dyn Camera>,
        sync: PropertySync,
        controller: ExposureController,
    ) -> Self {
        let regulator = TemperatureRegulator::new(sync.regulator_enabled());
        Self {
            bus,
            camera,
            sync,
            regulator,
            controller,
            tick_interval: Duration::from_millis(100),
            connect_poll: Duration::from_secs(1),
            counters: FaultCounters::default(),
        }
    }

    pub fn with_intervals(mut self, tick_interval: Duration, connect_poll: Duration) -> Self {
        self.tick_interval = tick_interval;
        self.connect_poll = connect_poll;
        self
    }

    pub fn controller(&self) -> &ExposureController {
        &self.controller
    }

    pub fn sync(&self) -> &PropertySync {
        &self.sync
    }

    pub fn regulator(&self) -> &TemperatureRegulator {
        &self.regulator
    }

    pub fn counters(&self) -> FaultCounters {
        self.counters
    }

    /// Define every property on the bus. Call once the bus is connected.
    pub async fn define_properties(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        let status = self.controller.status(now);
        for vector in self.sync.definitions(&status) {
            let name = vector.name.clone();
            self.bus.define(vector).await.map_err(|e| {
                ControlError::BusUnavailable(format!("defining '{name}': {e:#}"))
            })?;
        }
        info!("Properties defined");
        Ok(())
    }

    /// Run one control cycle at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let state = self.controller.state();

        let mut requests = Vec::new();
        for write in self.bus.drain().await {
            match self.sync.apply(&write, state) {
                Ok(Some(request)) => requests.push(request),
                Ok(None) => {}
                Err(e) => report.errors.push(e),
            }
        }

        self.regulate(&mut report).await;

        let outcome = self
            .controller
            .tick(now, &requests, self.sync.exposure_setting())
            .await;
        report.transition = outcome.transition;
        report.committed = outcome.committed;
        report.errors.extend(outcome.error);

        let status = self.controller.status(now);
        for update in self.sync.outbound(&status) {
            match self.bus.publish(update).await {
                Ok(()) => report.published += 1,
                Err(e) => warn!(error = %e, "Property publish failed"),
            }
        }

        for error in &report.errors {
            error.report();
            self.counters.record(error);
        }
        report
    }

    async fn regulate(&mut self, report: &mut TickReport) {
        self.regulator.set_enabled(self.sync.regulator_enabled());

        let current = match self.camera.temperature_current().await {
            Ok(celsius) => Some(celsius),
            Err(e) => {
                report
                    .errors
                    .push(ControlError::hardware(CameraCommand::ReadTemperature, &e));
                None
            }
        };
        self.sync.observe_temperature(current);

        let target = self.sync.temperature().target_c;
        if let Some(command) = self.regulator.tick(target, current) {
            match self.camera.set_temperature_target(command.target_c).await {
                Ok(()) => self.regulator.mark_commanded(command),
                Err(e) => report.errors.push(ControlError::hardware(
                    CameraCommand::SetTemperatureTarget,
                    &e,
                )),
            }
        }
    }

    /// Wait for the bus, define properties, then tick until `shutdown`
    /// resolves.
    pub async fn run<F>(&mut self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            _ = wait_for_connection(self.bus.as_ref(), self.connect_poll) => {}
            _ = &mut shutdown => {
                info!("Shutdown before bus connected");
                return Ok(());
            }
        }
        self.define_properties(Utc::now()).await?;

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "Control loop running");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if let Some(transition) = report.transition {
                        debug!(from = %transition.from, to = %transition.to, "State change");
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        if self.controller.record().is_some() {
            warn!(
                state = %self.controller.state(),
                "Shutting down with an exposure in flight"
            );
        }
        let counters = self.counters;
        info!(
            hardware = counters.hardware,
            persistence = counters.persistence,
            request = counters.request,
            "Control loop stopped"
        );
        Ok(())
    }
}
