// src/generator.rs - Random walk producing correlated machine/ambient readings

use crate::{
    config::SimulationBounds,
    reading::{AmbientReading, MachineReading, Reading},
};
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Humidity band used for every draw. The configured `humidity_percent` is
/// not consulted.
pub const HUMIDITY_RANGE: std::ops::RangeInclusive<i32> = 24..=26;

impl SimulationBounds {
    /// Pressure gained per degree above `machine_temp_min`.
    ///
    /// Returns 0.0 when the temperature band has no width.
    pub fn pressure_slope(&self) -> f64 {
        let span = self.machine_temp_max - self.machine_temp_min;
        if span == 0.0 || !span.is_finite() {
            return 0.0;
        }
        (self.machine_pressure_max - self.machine_pressure_min) / span
    }

    /// Pressure reported for a machine temperature
    pub fn pressure_at(&self, temperature: f64) -> f64 {
        self.machine_pressure_min + (temperature - self.machine_temp_min) * self.pressure_slope()
    }
}

/// Walk state owned by the emit loop
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationState {
    current_temperature: f64,
    sequence: u64,
}

impl SimulationState {
    /// Start at the bottom of the temperature band with sequence 1
    pub fn new(bounds: &SimulationBounds) -> Self {
        Self {
            current_temperature: bounds.machine_temp_min,
            sequence: 1,
        }
    }

    /// Return the temperature to `machine_temp_min`. The sequence is kept.
    pub fn reset(&mut self, bounds: &SimulationBounds) {
        self.current_temperature = bounds.machine_temp_min;
    }

    /// Machine temperature of the last step
    pub fn temperature(&self) -> f64 {
        self.current_temperature
    }

    /// Sequence number the next emitted message will carry
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn advance_sequence(&mut self) {
        self.sequence += 1;
    }

    #[cfg(test)]
    pub(crate) fn with_temperature(mut self, temperature: f64) -> Self {
        self.current_temperature = temperature;
        self
    }
}

/// Stateless step function over an injected random source
#[derive(Debug, Clone)]
pub struct RandomWalkGenerator<R = StdRng> {
    rng: R,
}

impl RandomWalkGenerator<StdRng> {
    /// Generator seeded from OS entropy
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    /// Reproducible generator
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> RandomWalkGenerator<R> {
    /// Generator over any random source
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Advance the walk one step and derive the remaining channels from it.
    ///
    /// Above `machine_temp_max` the step is drawn from [-0.5, 0.5]; otherwise
    /// from [-0.25, 1.25], which drifts the machine upward by 0.5 per tick on
    /// average.
    pub fn next(&mut self, bounds: &SimulationBounds, state: &mut SimulationState) -> Reading {
        let step = if state.current_temperature > bounds.machine_temp_max {
            self.rng.gen::<f64>() - 0.5
        } else {
            -0.25 + self.rng.gen::<f64>() * 1.5
        };
        state.current_temperature += step;

        let temperature = state.current_temperature;
        Reading {
            machine: MachineReading {
                temperature,
                pressure: bounds.pressure_at(temperature),
            },
            ambient: AmbientReading {
                temperature: bounds.ambient_temp + self.rng.gen::<f64>() - 0.5,
                humidity: self.rng.gen_range(HUMIDITY_RANGE),
            },
            time_created: Utc::now(),
        }
    }
}
