pub mod compartment;
pub mod export;
pub mod membrane;
pub mod pixelsim;

pub use compartment::SimCompartment;
pub use export::export_ini;
pub use membrane::SimMembrane;
pub use pixelsim::{PixelSim, SimState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("model has no compartment with colour {0:x}")]
    MissingCompartmentColour(u32),
    #[error("membrane '{0}' references unknown compartment '{1}'")]
    UnknownMembraneCompartment(String, String),
    #[error("{0}")]
    Compile(String),
    #[error(transparent)]
    Pde(#[from] crate::pde::PdeError),
    #[error("initial concentration image has {0} values, expected {1}")]
    InitialConcentrationSize(usize, usize),
}

/// Explicit Runge-Kutta scheme used for time stepping. All but forward
/// Euler carry an embedded lower-order estimate for step-size control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RkScheme {
    /// RK1(0)1: forward Euler, fixed timestep at the stability bound.
    Euler,
    /// RK2(1)2: Heun with embedded forward Euler error estimate.
    Rk212,
    /// RK3(2)3: Shu-Osher with embedded Heun error estimate.
    Rk323,
    /// RK4(3)5: five-stage low-storage 3S* scheme with embedded RK3.
    Rk435,
}

impl RkScheme {
    /// Exponent applied to the error ratio when adapting the step size:
    /// the reciprocal of the scheme's order.
    pub fn error_power(self) -> f64 {
        match self {
            RkScheme::Euler => 1.0,
            RkScheme::Rk212 => 1.0 / 2.0,
            RkScheme::Rk323 => 1.0 / 3.0,
            RkScheme::Rk435 => 1.0 / 4.0,
        }
    }
}

/// What to do when numerical error drives a concentration negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NegativePolicy {
    /// Leave values as computed.
    Allow,
    /// Clamp negative concentrations to zero after each accepted step.
    #[default]
    Clamp,
    /// Treat a negative concentration as an integration failure.
    Abort,
}

/// Maximum allowed local integration error per step.
#[derive(Clone, Copy, Debug)]
pub struct IntegratorError {
    pub abs: f64,
    pub rel: f64,
}

impl Default for IntegratorError {
    fn default() -> Self {
        Self {
            abs: f64::MAX,
            rel: 0.005,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IntegratorOptions {
    pub scheme: RkScheme,
    pub max_err: IntegratorError,
    pub max_timestep: f64,
    pub negative_policy: NegativePolicy,
    /// Worker threads for the per-pixel sweep; `1` disables the pool,
    /// `0` uses all available cores.
    pub max_threads: usize,
    pub compile: crate::symbolic::CompileOptions,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            scheme: RkScheme::Rk212,
            max_err: IntegratorError::default(),
            max_timestep: f64::MAX,
            negative_policy: NegativePolicy::default(),
            max_threads: 1,
            compile: crate::symbolic::CompileOptions::default(),
        }
    }
}

/// Average, minimum and maximum of one species field at one time point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AvgMinMax {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl AvgMinMax {
    pub fn of(values: impl Iterator<Item = f64>) -> Self {
        let mut n = 0usize;
        let mut sum = 0.0;
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for v in values {
            n += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if n == 0 {
            return Self {
                avg: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }
        Self {
            avg: sum / n as f64,
            min,
            max,
        }
    }
}

/// One recorded snapshot per compartment: the full concentration array
/// (species-major within each pixel) plus per-species summary statistics.
#[derive(Clone, Debug)]
pub struct TimePoint {
    pub time: f64,
    pub concentrations: Vec<Vec<f64>>,
    pub avg_min_max: Vec<Vec<AvgMinMax>>,
}

/// Append-only record of the simulation: one entry per completed
/// [`PixelSim::run`] call, truncated only by an explicit rewind.
#[derive(Clone, Debug, Default)]
pub struct TimeSeries {
    points: Vec<TimePoint>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn times(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.time).collect()
    }

    pub fn point(&self, time_index: usize) -> &TimePoint {
        &self.points[time_index]
    }

    pub(crate) fn push(&mut self, point: TimePoint) {
        self.points.push(point);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.points.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_min_max_of_values() {
        let s = AvgMinMax::of([1.0, 3.0, 2.0].into_iter());
        assert_eq!(s.avg, 2.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 3.0);
        let empty = AvgMinMax::of(std::iter::empty());
        assert_eq!(empty.avg, 0.0);
    }

    #[test]
    fn error_power_matches_scheme_order() {
        assert_eq!(RkScheme::Rk212.error_power(), 0.5);
        assert_eq!(RkScheme::Rk435.error_power(), 0.25);
    }
}
