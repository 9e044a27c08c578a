use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::actuator::Actuator;
use crate::audio_link::AudioEngine;
use crate::decider::{Decision, Policy, decide_unit};
use crate::load::{LoadSample, LoadSensor};
use crate::signals::{ControlSignals, Wake};
use crate::unit::ScalableUnit;

/// Owns every unit and drives sensing, deciding and actuating.
pub struct ControlLoop<E: AudioEngine> {
    units: Vec<ScalableUnit>,
    sensor: LoadSensor<E>,
    policy: Policy,
    actuator: Actuator,
    signals: Arc<ControlSignals>,
    poll_interval: Duration,
}

impl<E: AudioEngine> ControlLoop<E> {
    pub fn new(
        units: Vec<ScalableUnit>,
        sensor: LoadSensor<E>,
        policy: Policy,
        signals: Arc<ControlSignals>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            units,
            sensor,
            policy,
            actuator: Actuator::new(),
            signals,
            poll_interval,
        }
    }

    pub fn units(&self) -> &[ScalableUnit] {
        &self.units
    }

    pub fn sensor(&self) -> &LoadSensor<E> {
        &self.sensor
    }

    /// Writes the max speed to every unit so the hardware matches the tracked state.
    pub fn synchronize(&mut self) {
        self.actuator.restore_max(&mut self.units);
    }

    /// One sense-decide-actuate pass over all units, in order.
    pub fn step(&mut self) {
        let samples = self.sensor.poll(&self.units);
        for (unit, threads) in self.units.iter_mut().zip(samples) {
            if threads.iter().all(LoadSample::is_empty) {
                log::trace!("unit {}: no load data", unit.id);
                continue;
            }
            let decision = decide_unit(
                unit.current_index(),
                unit.table().len(),
                &threads,
                &self.policy,
            );
            if decision == Decision::Same {
                continue;
            }
            let before = unit.current_speed();
            let cpu = unit.representative();
            match self.actuator.apply_decision(unit, cpu, decision) {
                Ok(_) => log::debug!(
                    "unit {}: {:?} {} -> {} kHz",
                    unit.id,
                    decision,
                    before,
                    unit.current_speed()
                ),
                Err(e) => log::warn!("changing CPU speed failed: {e}"),
            }
        }
    }

    /// Runs until shutdown is requested, then restores max speed.
    pub fn run(&mut self) {
        let started = Instant::now();
        while !self.signals.shutdown_requested() {
            if self.signals.wait(self.poll_interval) == Wake::Triggered {
                log::trace!("woken by trigger");
            }
            if self.signals.shutdown_requested() {
                break;
            }
            self.step();
        }
        self.shutdown();
        log::info!("Statistics:");
        log::info!(
            "  {} speed changes in {} seconds",
            self.actuator.changes(),
            started.elapsed().as_secs()
        );
    }

    /// Forces every unit back to max speed, then drops the audio connection.
    pub fn shutdown(&mut self) {
        log::debug!("exiting: resetting CPUs to full speed");
        self.actuator.restore_max(&mut self.units);
        log::debug!("exiting: closing audio connection");
        self.sensor.close();
    }
}
