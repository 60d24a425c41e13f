use crate::geometry::PixelCompartment;
use crate::pde::{InitialConcentration, Model, Pde, PdeOptions};
use crate::sim::{IntegratorError, IntegratorOptions, SimulatorError};
use crate::symbolic::{CompiledProg, SymbolicSource};
use glam::DVec2;
use log::debug;
use rayon::prelude::*;

const PAR_CHUNK: usize = 4096;

/// Forward Euler stability bound for dimensionless diffusion constants
/// `{D/dx^2, D/dy^2}`.
fn max_stable_timestep(dimensionless: [f64; 2]) -> f64 {
    1.0 / (2.0 * (dimensionless[0] + dimensionless[1]))
}

/// Reaction and diffusion state of one compartment.
///
/// Concentrations are species-major within each pixel:
/// `conc[pixel * n_species + species]`. When the model's rate laws depend on
/// time or space, pseudo-species with zero diffusion are appended whose
/// compiled rates are `dt/dt = 1`, `dx/dt = dy/dt = 0`, so the integrator
/// advances them like any other field.
pub struct SimCompartment {
    comp: PixelCompartment,
    species_ids: Vec<String>,
    n_pixels: usize,
    n_species: usize,
    n_extra_vars: usize,
    diff_constants: Vec<Vec<f64>>,
    prog: CompiledProg,
    conc: Vec<f64>,
    dcdt: Vec<f64>,
    s2: Vec<f64>,
    s3: Vec<f64>,
    dx2: f64,
    dy2: f64,
    max_stable_timestep: f64,
    non_spatial_species: Vec<usize>,
    parallel: bool,
}

impl SimCompartment {
    pub fn new(
        model: &Model,
        comp: PixelCompartment,
        pixel_size: DVec2,
        origin: DVec2,
        time_dependent: bool,
        space_dependent: bool,
        options: &IntegratorOptions,
    ) -> Result<Self, SimulatorError> {
        let species_ids = model.species_ids_in(comp.id());
        let reaction_ids = model.reaction_ids_in(comp.id());
        debug!(
            "compartment {}: {} species, {} reactions, {} pixels",
            comp.id(),
            species_ids.len(),
            reaction_ids.len(),
            comp.n_voxels()
        );
        let mut extra_variables = Vec::new();
        if time_dependent {
            extra_variables.push("time".to_string());
        }
        if space_dependent {
            extra_variables.push("x".to_string());
            extra_variables.push("y".to_string());
        }
        let pde_options = PdeOptions {
            extra_variables: extra_variables.clone(),
            ..PdeOptions::default()
        };
        let pde = Pde::new(model, &species_ids, &reaction_ids, &pde_options)?;

        // dt/dt = 1 for the time pseudo-species, dx/dt = dy/dt = 0
        let mut expressions: Vec<String> = pde.rhs().to_vec();
        if time_dependent {
            expressions.push("1".to_string());
        }
        if space_dependent {
            expressions.push("0".to_string());
            expressions.push("0".to_string());
        }
        let mut variables = species_ids.clone();
        variables.extend(extra_variables.iter().cloned());
        let expression_refs: Vec<&str> = expressions.iter().map(String::as_str).collect();
        let source = SymbolicSource::new(&expression_refs, &variables, &[], &[]);
        if !source.is_valid() {
            return Err(SimulatorError::Compile(source.error_message().to_string()));
        }
        let prog = source
            .compile(options.compile)
            .map_err(SimulatorError::Compile)?;

        let n_pixels = comp.n_voxels();
        let n_extra_vars = extra_variables.len();
        let n_species = species_ids.len() + n_extra_vars;
        let (dx2, dy2) = (pixel_size.x * pixel_size.x, pixel_size.y * pixel_size.y);

        let mut diff_constants = Vec::with_capacity(n_species);
        let mut non_spatial_species = Vec::new();
        let mut stable_dt = f64::MAX;
        for (is, id) in species_ids.iter().enumerate() {
            let species = model.species(id).expect("species listed for compartment");
            diff_constants.push(vec![species.diffusion_constant; n_pixels]);
            let d = species.diffusion_constant;
            stable_dt = stable_dt.min(max_stable_timestep([d / dx2, d / dy2]));
            if !species.is_spatial {
                non_spatial_species.push(is);
            }
        }
        // pseudo-species do not diffuse
        for _ in 0..n_extra_vars {
            diff_constants.push(vec![0.0; n_pixels]);
        }

        let mut conc = vec![0.0; n_species * n_pixels];
        let ny = comp.image_height();
        for (is, id) in species_ids.iter().enumerate() {
            let species = model.species(id).expect("species listed for compartment");
            match &species.initial {
                InitialConcentration::Uniform(value) => {
                    for i in 0..n_pixels {
                        conc[i * n_species + is] = *value;
                    }
                }
                InitialConcentration::Image { values, scale } => {
                    let expected = comp.image_width() * ny;
                    if values.len() != expected {
                        return Err(SimulatorError::InitialConcentrationSize(
                            values.len(),
                            expected,
                        ));
                    }
                    for (i, &(vx, vy)) in comp.voxels().iter().enumerate() {
                        conc[i * n_species + is] = values[vy * comp.image_width() + vx] * scale;
                    }
                }
                InitialConcentration::Analytic(expression) => {
                    let vars = ["x".to_string(), "y".to_string()];
                    let source = SymbolicSource::new_single(expression, &vars, &[], &[]);
                    if !source.is_valid() {
                        return Err(SimulatorError::Compile(
                            source.error_message().to_string(),
                        ));
                    }
                    let prog = source
                        .compile(options.compile)
                        .map_err(SimulatorError::Compile)?;
                    let mut out = [0.0];
                    for (i, &(vx, vy)) in comp.voxels().iter().enumerate() {
                        let x = origin.x + vx as f64 * pixel_size.x;
                        let y = origin.y + (ny - 1 - vy) as f64 * pixel_size.y;
                        prog.eval(&mut out, &[x, y]);
                        conc[i * n_species + is] = out[0];
                    }
                }
            }
        }
        // time starts at zero, x/y pseudo-species hold the pixel positions
        if space_dependent {
            let offset = species_ids.len() + usize::from(time_dependent);
            for (i, &(vx, vy)) in comp.voxels().iter().enumerate() {
                conc[i * n_species + offset] = origin.x + vx as f64 * pixel_size.x;
                conc[i * n_species + offset + 1] =
                    origin.y + (ny - 1 - vy) as f64 * pixel_size.y;
            }
        }

        let dcdt = vec![0.0; conc.len()];
        Ok(Self {
            comp,
            species_ids,
            n_pixels,
            n_species,
            n_extra_vars,
            diff_constants,
            prog,
            conc,
            dcdt,
            s2: Vec::new(),
            s3: Vec::new(),
            dx2,
            dy2,
            max_stable_timestep: stable_dt,
            non_spatial_species,
            parallel: options.max_threads != 1,
        })
    }

    pub fn compartment_id(&self) -> &str {
        self.comp.id()
    }

    pub fn species_ids(&self) -> &[String] {
        &self.species_ids
    }

    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    /// Species count including the time/space pseudo-species.
    pub fn n_species_with_extras(&self) -> usize {
        self.n_species
    }

    pub fn n_extra_vars(&self) -> usize {
        self.n_extra_vars
    }

    pub fn voxels(&self) -> &[(usize, usize)] {
        self.comp.voxels()
    }

    pub fn image_size(&self) -> (usize, usize) {
        (self.comp.image_width(), self.comp.image_height())
    }

    pub fn max_stable_timestep(&self) -> f64 {
        self.max_stable_timestep
    }

    pub fn concentrations(&self) -> &[f64] {
        &self.conc
    }

    pub fn set_concentrations(&mut self, conc: Vec<f64>) {
        assert_eq!(conc.len(), self.conc.len());
        self.conc = conc;
    }

    pub(crate) fn conc_mut(&mut self) -> &mut [f64] {
        &mut self.conc
    }

    pub(crate) fn dcdt(&self) -> &[f64] {
        &self.dcdt
    }

    pub(crate) fn dcdt_mut(&mut self) -> &mut [f64] {
        &mut self.dcdt
    }

    pub(crate) fn conc_and_dcdt_mut(&mut self) -> (&[f64], &mut [f64]) {
        (&self.conc, &mut self.dcdt)
    }

    /// Concentration of `species` at `pixel` in the embedded lower-order
    /// solution, for error inspection.
    pub fn lower_order_concentration(&self, species: usize, pixel: usize) -> f64 {
        if self.s2.is_empty() {
            return 0.0;
        }
        self.s2[pixel * self.n_species + species]
    }

    /// Compiled reaction term plus discrete Laplacian for every pixel,
    /// overwriting `dcdt`. The diffusive face coefficients use the average
    /// of the two pixel diffusivities.
    pub fn evaluate_reactions_and_diffusion(&mut self) {
        let ns = self.n_species;
        let Self {
            comp,
            conc,
            dcdt,
            prog,
            diff_constants,
            dx2,
            dy2,
            ..
        } = self;
        let conc: &[f64] = conc;
        let prog: &crate::symbolic::CompiledProg = prog;
        let comp: &PixelCompartment = comp;
        let diff_constants: &[Vec<f64>] = diff_constants;
        let (dx2, dy2) = (*dx2, *dy2);
        let eval_pixel = |scratch: &mut Vec<f64>, i: usize, d: &mut [f64]| {
            prog.eval_with_scratch(scratch, d, &conc[i * ns..(i + 1) * ns]);
            let (up_x, dn_x) = (comp.up_x(i), comp.dn_x(i));
            let (up_y, dn_y) = (comp.up_y(i), comp.dn_y(i));
            for (is, dc) in diff_constants.iter().enumerate() {
                let d_i = dc[i];
                let dxp = 0.5 * (d_i + dc[up_x]) / dx2;
                let dxm = 0.5 * (d_i + dc[dn_x]) / dx2;
                let dyp = 0.5 * (d_i + dc[up_y]) / dy2;
                let dym = 0.5 * (d_i + dc[dn_y]) / dy2;
                let c = conc[i * ns + is];
                d[is] += dxp * (conc[up_x * ns + is] - c) - dxm * (c - conc[dn_x * ns + is])
                    + dyp * (conc[up_y * ns + is] - c)
                    - dym * (c - conc[dn_y * ns + is]);
            }
        };
        if self.parallel {
            dcdt.par_chunks_mut(ns).enumerate().for_each_init(
                || prog.make_scratch(),
                |scratch, (i, d)| eval_pixel(scratch, i, d),
            );
        } else {
            let mut scratch = prog.make_scratch();
            for (i, d) in dcdt.chunks_mut(ns).enumerate() {
                eval_pixel(&mut scratch, i, d);
            }
        }
    }

    /// Non-spatial species are well-mixed: replace their dc/dt by its
    /// spatial average, roughly an infinite diffusion rate.
    pub fn spatially_average_dcdt(&mut self) {
        let ns = self.n_species;
        for &is in &self.non_spatial_species {
            let mut avg = 0.0;
            for i in 0..self.n_pixels {
                avg += self.dcdt[i * ns + is];
            }
            avg /= self.n_pixels as f64;
            for i in 0..self.n_pixels {
                self.dcdt[i * ns + is] = avg;
            }
        }
    }

    pub fn do_forwards_euler_timestep(&mut self, dt: f64) {
        if self.parallel {
            self.conc
                .par_chunks_mut(PAR_CHUNK)
                .zip(self.dcdt.par_chunks(PAR_CHUNK))
                .for_each(|(c, d)| {
                    for (ci, di) in c.iter_mut().zip(d) {
                        *ci += dt * di;
                    }
                });
        } else {
            for (ci, di) in self.conc.iter_mut().zip(&self.dcdt) {
                *ci += dt * di;
            }
        }
    }

    pub fn do_rk_init(&mut self) {
        self.s2.clear();
        self.s2.resize(self.conc.len(), 0.0);
        self.s3.clear();
        self.s3.extend_from_slice(&self.conc);
    }

    pub fn do_rk212_substep1(&mut self, dt: f64) {
        self.s2.resize(self.conc.len(), 0.0);
        self.s3.resize(self.conc.len(), 0.0);
        if self.parallel {
            self.conc
                .par_chunks_mut(PAR_CHUNK)
                .zip(self.s3.par_chunks_mut(PAR_CHUNK))
                .zip(self.dcdt.par_chunks(PAR_CHUNK))
                .for_each(|((c, s3), d)| {
                    for i in 0..c.len() {
                        s3[i] = c[i];
                        c[i] += dt * d[i];
                    }
                });
        } else {
            for i in 0..self.conc.len() {
                self.s3[i] = self.conc[i];
                self.conc[i] += dt * self.dcdt[i];
            }
        }
    }

    pub fn do_rk212_substep2(&mut self, dt: f64) {
        if self.parallel {
            self.conc
                .par_chunks_mut(PAR_CHUNK)
                .zip(self.s2.par_chunks_mut(PAR_CHUNK))
                .zip(self.s3.par_chunks(PAR_CHUNK))
                .zip(self.dcdt.par_chunks(PAR_CHUNK))
                .for_each(|(((c, s2), s3), d)| {
                    for i in 0..c.len() {
                        s2[i] = c[i];
                        c[i] = 0.5 * s3[i] + 0.5 * c[i] + 0.5 * dt * d[i];
                    }
                });
        } else {
            for i in 0..self.conc.len() {
                self.s2[i] = self.conc[i];
                self.conc[i] = 0.5 * self.s3[i] + 0.5 * self.conc[i] + 0.5 * dt * self.dcdt[i];
            }
        }
    }

    /// Generic low-storage substep
    /// `s2 += delta * c; c = g1*c + g2*s2 + g3*s3 + beta*dt*dcdt`.
    pub fn do_rk_substep(&mut self, dt: f64, g1: f64, g2: f64, g3: f64, beta: f64, delta: f64) {
        if self.parallel {
            self.conc
                .par_chunks_mut(PAR_CHUNK)
                .zip(self.s2.par_chunks_mut(PAR_CHUNK))
                .zip(self.s3.par_chunks(PAR_CHUNK))
                .zip(self.dcdt.par_chunks(PAR_CHUNK))
                .for_each(|(((c, s2), s3), d)| {
                    for i in 0..c.len() {
                        s2[i] += delta * c[i];
                        c[i] = g1 * c[i] + g2 * s2[i] + g3 * s3[i] + beta * dt * d[i];
                    }
                });
        } else {
            for i in 0..self.conc.len() {
                self.s2[i] += delta * self.conc[i];
                self.conc[i] = g1 * self.conc[i]
                    + g2 * self.s2[i]
                    + g3 * self.s3[i]
                    + beta * dt * self.dcdt[i];
            }
        }
    }

    /// Collapse the embedded estimate into `s2`:
    /// `s2 = c_factor*c + s2_factor*s2 + s3_factor*s3`.
    pub fn do_rk_finalise(&mut self, c_factor: f64, s2_factor: f64, s3_factor: f64) {
        for i in 0..self.conc.len() {
            self.s2[i] = c_factor * self.conc[i] + s2_factor * self.s2[i] + s3_factor * self.s3[i];
        }
    }

    /// Restore the pre-step concentrations after a rejected step.
    pub fn undo_rk_step(&mut self) {
        self.conc.copy_from_slice(&self.s3);
    }

    /// Largest absolute and relative deviation between the full-order and
    /// embedded solutions. The relative norm averages the old and new
    /// concentrations and adds `epsilon` against division by zero.
    pub fn calculate_rk_error(&self, epsilon: f64) -> IntegratorError {
        let mut err = IntegratorError { abs: 0.0, rel: 0.0 };
        for i in 0..self.conc.len() {
            let local = (self.conc[i] - self.s2[i]).abs();
            err.abs = err.abs.max(local);
            let norm = 0.5 * (self.conc[i] + self.s3[i] + epsilon);
            err.rel = err.rel.max(local / norm);
        }
        err
    }

    /// Species with the largest relative error, for failure reporting.
    pub fn worst_rel_error_species(&self, epsilon: f64) -> Option<(&str, f64)> {
        if self.s2.is_empty() {
            return None;
        }
        let mut worst: Option<(usize, f64)> = None;
        for i in 0..self.conc.len() {
            let is = i % self.n_species;
            if is >= self.species_ids.len() {
                continue;
            }
            let local = (self.conc[i] - self.s2[i]).abs();
            let rel = local / (0.5 * (self.conc[i] + self.s3[i] + epsilon));
            if worst.is_none_or(|(_, w)| rel > w) {
                worst = Some((is, rel));
            }
        }
        worst.map(|(is, rel)| (self.species_ids[is].as_str(), rel))
    }

    /// Returns the most negative real-species concentration, if any.
    pub fn most_negative(&self) -> Option<(usize, f64)> {
        let mut worst: Option<(usize, f64)> = None;
        for i in 0..self.conc.len() {
            let is = i % self.n_species;
            if is >= self.species_ids.len() {
                continue;
            }
            if self.conc[i] < 0.0 && worst.is_none_or(|(_, w)| self.conc[i] < w) {
                worst = Some((is, self.conc[i]));
            }
        }
        worst
    }

    /// Clamp negative real-species concentrations to zero.
    pub fn clamp_negative(&mut self) {
        let n_real = self.species_ids.len();
        let ns = self.n_species;
        for (i, c) in self.conc.iter_mut().enumerate() {
            if i % ns < n_real && *c < 0.0 {
                *c = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::LabelImage;
    use crate::pde::{CompartmentDef, SpeciesDef};

    fn one_species_model(diffusion: f64, initial: InitialConcentration) -> Model {
        let mut model = Model::new("m");
        model.compartments.push(CompartmentDef {
            id: "c".to_string(),
            colour: 1,
        });
        model.species.push(SpeciesDef {
            id: "u".to_string(),
            compartment_id: "c".to_string(),
            diffusion_constant: diffusion,
            initial,
            is_spatial: true,
        });
        model
    }

    fn build(model: &Model, image: &LabelImage) -> SimCompartment {
        let comp = PixelCompartment::new("c", image, 1);
        SimCompartment::new(
            model,
            comp,
            DVec2::ONE,
            DVec2::ZERO,
            false,
            false,
            &IntegratorOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn diffusion_moves_mass_from_peak_to_neighbours() {
        let model = one_species_model(1.0, InitialConcentration::Uniform(0.0));
        let image = LabelImage::filled(3, 1, 1);
        let mut sim = build(&model, &image);
        // put a spike in the middle pixel
        sim.conc_mut()[1] = 3.0;
        sim.evaluate_reactions_and_diffusion();
        let dcdt = sim.dcdt().to_vec();
        assert!(dcdt[1] < 0.0);
        assert!(dcdt[0] > 0.0 && dcdt[2] > 0.0);
        // no reactions: diffusion conserves mass
        assert!(dcdt.iter().sum::<f64>().abs() < 1e-12);
    }

    #[test]
    fn stability_bound_follows_diffusion_constant() {
        let model = one_species_model(2.0, InitialConcentration::Uniform(0.0));
        let image = LabelImage::filled(3, 3, 1);
        let sim = build(&model, &image);
        // 1 / (2 * (2/1 + 2/1)) = 0.125
        assert!((sim.max_stable_timestep() - 0.125).abs() < 1e-14);
    }

    #[test]
    fn analytic_initial_condition_is_evaluated_per_pixel() {
        let model = one_species_model(
            0.0,
            InitialConcentration::Analytic("x + 10*y".to_string()),
        );
        let image = LabelImage::filled(2, 2, 1);
        let sim = build(&model, &image);
        // voxels in raster order: (0,0) (1,0) (0,1) (1,1); y flipped
        assert_eq!(sim.concentrations(), &[10.0, 11.0, 0.0, 1.0]);
    }

    #[test]
    fn image_initial_condition_uses_raster_order() {
        let model = one_species_model(
            0.0,
            InitialConcentration::Image {
                values: vec![1.0, 2.0, 3.0, 4.0],
                scale: 10.0,
            },
        );
        let image = LabelImage::filled(2, 2, 1);
        let sim = build(&model, &image);
        assert_eq!(sim.concentrations(), &[10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn clamp_negative_only_touches_negative_values(){
        let model = one_species_model(1.0, InitialConcentration::Uniform(1.0));
        let image = LabelImage::filled(2, 1, 1);
        let mut sim = build(&model, &image);
        sim.conc_mut()[0] = -0.25;
        assert_eq!(sim.most_negative(), Some((0, -0.25)));
        sim.clamp_negative();
        assert_eq!(sim.concentrations(), &[0.0, 1.0]);
        assert_eq!(sim.most_negative(), None);
    }
}
