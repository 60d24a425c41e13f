use crate::geometry::{LabelImage, PixelCompartment, build_membranes};
use crate::pde::Model;
use crate::sim::compartment::SimCompartment;
use crate::sim::membrane::SimMembrane;
use crate::sim::{
    AvgMinMax, IntegratorError, IntegratorOptions, NegativePolicy, RkScheme, SimulatorError,
    TimePoint, TimeSeries,
};
use glam::DVec2;
use log::{debug, trace, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle of the integrator. A failed run leaves the time series
/// computed so far available for inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimState {
    Idle,
    Running,
    Failed,
}

const EPSILON: f64 = 1e-14;
const TIMESTEP_COLLAPSE: f64 = 1e-20;

/// Does any rate law of the model reference `var` as a free symbol?
fn reactions_depend_on(model: &Model, var: &str) -> bool {
    model.reactions.iter().any(|r| {
        crate::symbolic::parse(&r.rate_expression)
            .map(|e| {
                let mut free = BTreeSet::new();
                e.free_vars(&mut free);
                free.contains(var)
            })
            .unwrap_or(false)
    })
}

fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert!(a < b);
    let (left, right) = items.split_at_mut(b);
    (&mut left[a], &mut right[0])
}

/// The built-in explicit pixel integrator.
///
/// Consumes the compiled per-domain reaction programs and the pixel
/// geometry, and advances the reaction-diffusion system with an adaptive
/// embedded Runge-Kutta scheme. Steps are strictly sequential; within one
/// step the per-pixel sweep runs on the configured worker pool.
pub struct PixelSim {
    compartments: Vec<SimCompartment>,
    membranes: Vec<SimMembrane>,
    options: IntegratorOptions,
    image_size: (usize, usize),
    max_stable_timestep: f64,
    next_timestep: f64,
    discarded_steps: usize,
    error_message: String,
    stop_requested: Arc<AtomicBool>,
    pool: Option<rayon::ThreadPool>,
    time_series: TimeSeries,
    t_now: f64,
    state: SimState,
}

impl PixelSim {
    pub fn new(
        model: &Model,
        image: &LabelImage,
        pixel_size: DVec2,
        origin: DVec2,
        options: IntegratorOptions,
    ) -> Result<Self, SimulatorError> {
        let time_dependent = reactions_depend_on(model, "time");
        let space_dependent =
            reactions_depend_on(model, "x") || reactions_depend_on(model, "y");

        let pixel_compartments: Vec<PixelCompartment> = model
            .compartments
            .iter()
            .map(|def| PixelCompartment::new(def.id.clone(), image, def.colour))
            .collect();
        if let Some(empty) = pixel_compartments.iter().find(|c| c.n_voxels() == 0) {
            return Err(SimulatorError::MissingCompartmentColour(empty.colour()));
        }
        let pixel_membranes = build_membranes(image, &pixel_compartments);

        let mut compartments = Vec::with_capacity(pixel_compartments.len());
        let mut max_stable_timestep = f64::MAX;
        for comp in pixel_compartments {
            let sim = SimCompartment::new(
                model,
                comp,
                pixel_size,
                origin,
                time_dependent,
                space_dependent,
                &options,
            )?;
            max_stable_timestep = max_stable_timestep.min(sim.max_stable_timestep());
            compartments.push(sim);
        }

        let mut membranes = Vec::new();
        for membrane in pixel_membranes {
            let (ia, ib) = (membrane.compartment_a(), membrane.compartment_b());
            let id_a = compartments[ia].compartment_id();
            let id_b = compartments[ib].compartment_id();
            let Some(def) = model.membranes.iter().find(|m| {
                (m.compartment_a == id_a && m.compartment_b == id_b)
                    || (m.compartment_a == id_b && m.compartment_b == id_a)
            }) else {
                continue;
            };
            if model.reaction_ids_in(&def.id).is_empty() {
                continue;
            }
            let (a, b) = (&compartments[ia], &compartments[ib]);
            membranes.push(SimMembrane::new(
                model,
                &def.id,
                membrane,
                a,
                b,
                time_dependent,
                space_dependent,
                pixel_size,
                &options,
            )?);
        }

        let pool = match options.max_threads {
            1 => None,
            n => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .expect("failed to build worker thread pool"),
            ),
        };
        let next_timestep = options.max_timestep.min(max_stable_timestep);
        let mut sim = Self {
            compartments,
            membranes,
            options,
            image_size: (image.width(), image.height()),
            max_stable_timestep,
            next_timestep,
            discarded_steps: 0,
            error_message: String::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            pool,
            time_series: TimeSeries::default(),
            t_now: 0.0,
            state: SimState::Idle,
        };
        sim.record_time_point();
        Ok(sim)
    }

    fn calculate_dcdt(&mut self) {
        let Self {
            compartments,
            membranes,
            ..
        } = self;
        for comp in compartments.iter_mut() {
            comp.evaluate_reactions_and_diffusion();
        }
        for membrane in membranes.iter() {
            let (a, b) = pair_mut(
                compartments,
                membrane.compartment_a(),
                membrane.compartment_b(),
            );
            membrane.evaluate_reactions(a, b);
        }
        for comp in compartments.iter_mut() {
            comp.spatially_average_dcdt();
        }
    }

    fn do_rk101(&mut self, dt: f64) {
        self.calculate_dcdt();
        for comp in &mut self.compartments {
            comp.do_forwards_euler_timestep(dt);
        }
    }

    /// Heun / modified Euler in Shu-Osher form, with the forward Euler
    /// solution kept as the embedded error estimate.
    fn do_rk212(&mut self, dt: f64) {
        self.calculate_dcdt();
        for comp in &mut self.compartments {
            comp.do_rk212_substep1(dt);
        }
        self.calculate_dcdt();
        for comp in &mut self.compartments {
            comp.do_rk212_substep2(dt);
        }
    }

    /// Three-stage Shu-Osher scheme with embedded Heun estimate.
    fn do_rk323(&mut self, dt: f64) {
        const G1: [f64; 3] = [1.0, 0.25, 0.666666666666666666666];
        const G2: [f64; 3] = [0.0, 0.0, 0.0];
        const G3: [f64; 3] = [0.0, 0.75, 0.333333333333333333333];
        const BETA: [f64; 3] = [1.0, 0.25, 0.6666666666666666666];
        const DELTA: [f64; 3] = [0.0, 0.0, 1.0];
        for comp in &mut self.compartments {
            comp.do_rk_init();
        }
        for i in 0..3 {
            self.do_rk_substep(dt, G1[i], G2[i], G3[i], BETA[i], DELTA[i]);
        }
        for comp in &mut self.compartments {
            comp.do_rk_finalise(0.0, 2.0, -1.0);
        }
    }

    /// Five-stage fourth-order low-storage 3S* scheme with embedded
    /// third-order estimate.
    fn do_rk435(&mut self, dt: f64) {
        const G1: [f64; 5] = [
            0.0,
            -0.497531095840104,
            1.010070514199942,
            -3.196559004608766,
            1.717835630267259,
        ];
        const G2: [f64; 5] = [
            1.0,
            1.384996869124138,
            3.878155713328178,
            -2.324512951813145,
            -0.514633322274467,
        ];
        const G3: [f64; 5] = [0.0, 0.0, 0.0, 1.642598936063715, 0.188295940828347];
        const BETA: [f64; 5] = [
            0.075152045700771,
            0.211361016946069,
            1.100713347634329,
            0.728537814675568,
            0.393172889823198,
        ];
        const DELTA: [f64; 7] = [
            1.0,
            0.081252332929194,
            -1.083849060586449,
            -1.096110881845602,
            2.859440022030827,
            -0.655568367959557,
            -0.194421504490852,
        ];
        let delta_sum = 1.0 / DELTA.iter().sum::<f64>();
        for comp in &mut self.compartments {
            comp.do_rk_init();
        }
        for i in 0..5 {
            self.do_rk_substep(dt, G1[i], G2[i], G3[i], BETA[i], DELTA[i]);
        }
        for comp in &mut self.compartments {
            comp.do_rk_finalise(delta_sum * DELTA[5], delta_sum, delta_sum * DELTA[6]);
        }
    }

    fn do_rk_substep(&mut self, dt: f64, g1: f64, g2: f64, g3: f64, beta: f64, delta: f64) {
        self.calculate_dcdt();
        for comp in &mut self.compartments {
            comp.do_rk_substep(dt, g1, g2, g3, beta, delta);
        }
    }

    /// One accepted adaptive step of at most `dt_max`. Rejected attempts are
    /// undone and retried with a smaller step; persistent step-size collapse
    /// stores an error message and bails out.
    fn do_rk_adaptive(&mut self, dt_max: f64) -> f64 {
        let err_power = self.options.scheme.error_power();
        let max_err = self.options.max_err;
        loop {
            let dt = self.next_timestep.min(dt_max);
            match self.options.scheme {
                RkScheme::Euler => unreachable!("Euler stepping is not adaptive"),
                RkScheme::Rk212 => self.do_rk212(dt),
                RkScheme::Rk323 => self.do_rk323(dt),
                RkScheme::Rk435 => self.do_rk435(dt),
            }
            let mut err = IntegratorError { abs: 0.0, rel: 0.0 };
            for comp in &self.compartments {
                let comp_err = comp.calculate_rk_error(EPSILON);
                err.abs = err.abs.max(comp_err.abs);
                err.rel = err.rel.max(comp_err.rel);
            }
            let err_factor = (max_err.abs / err.abs)
                .min(max_err.rel / err.rel)
                .powf(err_power);
            self.next_timestep = (0.95 * dt * err_factor).min(dt_max);
            trace!(
                "dt = {dt} gave rel err = {}, abs err = {} -> new dt = {}",
                err.rel, err.abs, self.next_timestep
            );
            if self.next_timestep / dt_max < TIMESTEP_COLLAPSE {
                let problem_species = self
                    .compartments
                    .iter()
                    .filter_map(|c| c.worst_rel_error_species(EPSILON))
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(name, _)| name.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                self.error_message = format!(
                    "Failed to solve model to required accuracy. The largest relative \
                     integration error comes from species '{problem_species}'"
                );
                warn!("{}", self.error_message);
                return self.next_timestep;
            }
            if err.abs > max_err.abs || err.rel > max_err.rel {
                trace!("discarding step");
                self.discarded_steps += 1;
                for comp in &mut self.compartments {
                    comp.undo_rk_step();
                }
                continue;
            }
            return dt;
        }
    }

    fn apply_negative_policy(&mut self) {
        match self.options.negative_policy {
            NegativePolicy::Allow => {}
            NegativePolicy::Clamp => {
                for comp in &mut self.compartments {
                    comp.clamp_negative();
                }
            }
            NegativePolicy::Abort => {
                for comp in &self.compartments {
                    if let Some((is, value)) = comp.most_negative() {
                        self.error_message = format!(
                            "Species '{}' in compartment '{}' reached negative concentration {value}",
                            comp.species_ids()[is],
                            comp.compartment_id()
                        );
                        return;
                    }
                }
            }
        }
    }

    /// Advance the simulation by `time`, taking as many internal steps as
    /// needed, and append one time point with fresh statistics. Returns the
    /// number of accepted steps. On failure the error is available from
    /// [`PixelSim::error_message`] and the prior time series is retained.
    pub fn run(&mut self, time: f64) -> usize {
        self.error_message.clear();
        self.state = SimState::Running;
        // per-pixel sweeps run on the dedicated pool, steps stay sequential
        let steps = match self.pool.take() {
            Some(pool) => {
                let steps = pool.install(|| self.advance(time));
                self.pool = Some(pool);
                steps
            }
            None => self.advance(time),
        };
        if !self.error_message.is_empty() {
            self.state = SimState::Failed;
            return steps;
        }
        self.t_now += time;
        self.record_time_point();
        self.state = SimState::Idle;
        steps
    }

    fn advance(&mut self, time: f64) -> usize {
        let mut t_local = 0.0;
        let mut steps = 0;
        const RELATIVE_TOLERANCE: f64 = 1e-12;
        while t_local + time * RELATIVE_TOLERANCE < time {
            let max_dt = self.options.max_timestep.min(time - t_local);
            if self.options.scheme == RkScheme::Euler {
                let dt = max_dt.min(self.max_stable_timestep);
                self.do_rk101(dt);
                t_local += dt;
            } else {
                let dt = self.do_rk_adaptive(max_dt);
                if !self.error_message.is_empty() {
                    return steps;
                }
                t_local += dt;
            }
            steps += 1;
            self.apply_negative_policy();
            if !self.error_message.is_empty() {
                return steps;
            }
            if self.stop_requested.load(Ordering::Relaxed) {
                self.error_message = "Simulation stopped early".to_string();
                debug!("stop requested, aborting run at t_local = {t_local}");
                return steps;
            }
        }
        debug!(
            "t={time} integrated using {} steps ({} discarded)",
            steps, self.discarded_steps
        );
        steps
    }

    fn record_time_point(&mut self) {
        let concentrations: Vec<Vec<f64>> = self
            .compartments
            .iter()
            .map(|c| c.concentrations().to_vec())
            .collect();
        let avg_min_max: Vec<Vec<AvgMinMax>> = self
            .compartments
            .iter()
            .map(|c| {
                let ns = c.n_species_with_extras();
                (0..c.species_ids().len())
                    .map(|is| {
                        AvgMinMax::of(
                            (0..c.n_pixels()).map(|i| c.concentrations()[i * ns + is]),
                        )
                    })
                    .collect()
            })
            .collect();
        self.time_series.push(TimePoint {
            time: self.t_now,
            concentrations,
            avg_min_max,
        });
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    /// Last fatal integration failure, empty if none.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Shared flag to request cooperative cancellation at the next step
    /// boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    pub fn discarded_steps(&self) -> usize {
        self.discarded_steps
    }

    pub fn current_time(&self) -> f64 {
        self.t_now
    }

    pub fn n_compartments(&self) -> usize {
        self.compartments.len()
    }

    pub fn compartment(&self, index: usize) -> &SimCompartment {
        &self.compartments[index]
    }

    pub fn times(&self) -> Vec<f64> {
        self.time_series.times()
    }

    pub fn n_time_points(&self) -> usize {
        self.time_series.len()
    }

    /// Per-pixel concentrations of one species at one recorded time point.
    pub fn conc(
        &self,
        time_index: usize,
        compartment_index: usize,
        species_index: usize,
    ) -> Vec<f64> {
        let comp = &self.compartments[compartment_index];
        let ns = comp.n_species_with_extras();
        let snapshot = &self.time_series.point(time_index).concentrations[compartment_index];
        (0..comp.n_pixels())
            .map(|i| snapshot[i * ns + species_index])
            .collect()
    }

    pub fn avg_min_max(
        &self,
        time_index: usize,
        compartment_index: usize,
        species_index: usize,
    ) -> AvgMinMax {
        self.time_series.point(time_index).avg_min_max[compartment_index][species_index]
    }

    /// Current dc/dt field of one species, from the last evaluated sweep.
    pub fn dcdt(&self, compartment_index: usize, species_index: usize) -> Vec<f64> {
        let comp = &self.compartments[compartment_index];
        let ns = comp.n_species_with_extras();
        (0..comp.n_pixels())
            .map(|i| comp.dcdt()[i * ns + species_index])
            .collect()
    }

    pub fn lower_order_conc(
        &self,
        compartment_index: usize,
        species_index: usize,
        pixel_index: usize,
    ) -> f64 {
        self.compartments[compartment_index].lower_order_concentration(species_index, pixel_index)
    }

    /// Render one recorded time point as a grayscale intensity raster over
    /// the geometry image: summed species concentrations, normalized to the
    /// brightest pixel.
    pub fn conc_image(&self, time_index: usize) -> (usize, usize, Vec<u8>) {
        let (w, h) = self.image_size;
        let mut intensity = vec![0.0; w * h];
        let point = self.time_series.point(time_index);
        for (comp, snapshot) in self.compartments.iter().zip(&point.concentrations) {
            let ns = comp.n_species_with_extras();
            let n_real = comp.species_ids().len();
            for (i, &(x, y)) in comp.voxels().iter().enumerate() {
                let total: f64 = (0..n_real).map(|is| snapshot[i * ns + is]).sum();
                intensity[y * w + x] = total;
            }
        }
        let max = intensity.iter().cloned().fold(0.0, f64::max);
        let pixels = intensity
            .iter()
            .map(|&v| {
                if max > 0.0 {
                    (255.0 * v / max).round() as u8
                } else {
                    0
                }
            })
            .collect();
        (w, h, pixels)
    }

    /// Rewind the time series to `time_index`, dropping later entries and
    /// restoring the concentration fields from that snapshot. The next
    /// [`PixelSim::run`] continues from there.
    pub fn truncate(&mut self, time_index: usize) {
        let point = self.time_series.point(time_index).clone();
        for (comp, snapshot) in self.compartments.iter_mut().zip(point.concentrations) {
            comp.set_concentrations(snapshot);
        }
        self.t_now = point.time;
        self.time_series.truncate(time_index + 1);
        self.error_message.clear();
        self.state = SimState::Idle;
    }
}
