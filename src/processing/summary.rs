use crate::mesh::Mesh2d;
use crate::pde::Model;
use crate::sim::{PixelSim, RkScheme};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

pub struct SimulationSummary {
    // Model / geometry info
    pub model_name: String,
    pub image_size: (usize, usize),
    pub compartments: Vec<CompartmentSummary>,

    // Mesh info
    pub n_vertices: usize,
    pub n_triangles: usize,

    // Integrator settings
    pub scheme: RkScheme,
    pub max_rel_err: f64,
    pub max_abs_err: f64,
    pub max_timestep: f64,

    // Run results
    pub simulated_time: Option<f64>,
    pub accepted_steps: Option<usize>,
    pub discarded_steps: Option<usize>,
}

pub struct CompartmentSummary {
    pub id: String,
    pub n_pixels: usize,
    pub species: Vec<SpeciesSummary>,
}

pub struct SpeciesSummary {
    pub id: String,
    pub diffusion_constant: f64,
    pub final_avg: f64,
    pub final_min: f64,
    pub final_max: f64,
}

impl SimulationSummary {
    pub fn from_problem(model: &Model, mesh: &Mesh2d, sim: &PixelSim) -> Self {
        let last = sim.n_time_points() - 1;
        let compartments = (0..sim.n_compartments())
            .map(|ci| {
                let comp = sim.compartment(ci);
                let species = comp
                    .species_ids()
                    .iter()
                    .enumerate()
                    .map(|(si, id)| {
                        let stats = sim.avg_min_max(last, ci, si);
                        SpeciesSummary {
                            id: id.clone(),
                            diffusion_constant: model
                                .species(id)
                                .map(|s| s.diffusion_constant)
                                .unwrap_or(0.0),
                            final_avg: stats.avg,
                            final_min: stats.min,
                            final_max: stats.max,
                        }
                    })
                    .collect();
                CompartmentSummary {
                    id: comp.compartment_id().to_string(),
                    n_pixels: comp.n_pixels(),
                    species,
                }
            })
            .collect();
        Self {
            model_name: model.name.clone(),
            image_size: (0, 0),
            compartments,
            n_vertices: mesh.vertices().len(),
            n_triangles: mesh.triangle_indices().iter().map(Vec::len).sum(),
            scheme: RkScheme::Rk212,
            max_rel_err: 0.0,
            max_abs_err: 0.0,
            max_timestep: 0.0,
            simulated_time: None,
            accepted_steps: None,
            discarded_steps: None,
        }
    }

    pub fn with_integrator(
        mut self,
        scheme: RkScheme,
        max_rel_err: f64,
        max_abs_err: f64,
        max_timestep: f64,
    ) -> Self {
        self.scheme = scheme;
        self.max_rel_err = max_rel_err;
        self.max_abs_err = max_abs_err;
        self.max_timestep = max_timestep;
        self
    }

    pub fn with_image_size(mut self, width: usize, height: usize) -> Self {
        self.image_size = (width, height);
        self
    }

    pub fn add_run_info(&mut self, simulated_time: f64, accepted: usize, discarded: usize) {
        self.simulated_time = Some(simulated_time);
        self.accepted_steps = Some(accepted);
        self.discarded_steps = Some(discarded);
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;

        writeln!(file, "{}", "=".repeat(60))?;
        writeln!(file, "REACTION-DIFFUSION SIMULATION SUMMARY")?;
        writeln!(file, "{}", "=".repeat(60))?;
        writeln!(file)?;

        writeln!(file, "MODEL")?;
        writeln!(file, "{}", "-".repeat(60))?;
        writeln!(file, "Name:                {}", self.model_name)?;
        writeln!(
            file,
            "Geometry image:      {} x {} pixels",
            self.image_size.0, self.image_size.1
        )?;
        writeln!(file)?;

        writeln!(file, "MESH")?;
        writeln!(file, "{}", "-".repeat(60))?;
        writeln!(file, "Vertices:            {}", self.n_vertices)?;
        writeln!(file, "Triangles:           {}", self.n_triangles)?;
        writeln!(file)?;

        writeln!(file, "INTEGRATOR")?;
        writeln!(file, "{}", "-".repeat(60))?;
        writeln!(file, "Scheme:              {:?}", self.scheme)?;
        writeln!(file, "Max rel error:       {:.3e}", self.max_rel_err)?;
        writeln!(file, "Max abs error:       {:.3e}", self.max_abs_err)?;
        writeln!(file, "Max timestep:        {:.3e}", self.max_timestep)?;
        writeln!(file)?;

        writeln!(file, "COMPARTMENTS")?;
        writeln!(file, "{}", "-".repeat(60))?;
        for comp in &self.compartments {
            writeln!(file, "{} ({} pixels):", comp.id, comp.n_pixels)?;
            for species in &comp.species {
                writeln!(
                    file,
                    "  {} (D = {:.3e}): avg {:.6e}, min {:.6e}, max {:.6e}",
                    species.id,
                    species.diffusion_constant,
                    species.final_avg,
                    species.final_min,
                    species.final_max
                )?;
            }
        }
        writeln!(file)?;

        if let (Some(time), Some(accepted), Some(discarded)) = (
            self.simulated_time,
            self.accepted_steps,
            self.discarded_steps,
        ) {
            writeln!(file, "RUN")?;
            writeln!(file, "{}", "-".repeat(60))?;
            writeln!(file, "Simulated time:      {time}")?;
            writeln!(file, "Accepted steps:      {accepted}")?;
            writeln!(file, "Discarded steps:     {discarded}")?;
            writeln!(file)?;
        }

        writeln!(file, "{}", "=".repeat(60))?;

        Ok(())
    }

    pub fn print_to_console(&self) {
        println!("\n{}", "=".repeat(60));
        println!("SIMULATION SUMMARY");
        println!("{}", "=".repeat(60));
        println!(
            "Mesh:          {} vertices, {} triangles",
            self.n_vertices, self.n_triangles
        );
        println!("Scheme:        {:?}", self.scheme);
        for comp in &self.compartments {
            for species in &comp.species {
                println!(
                    "{}.{}:    avg {:.4e} [{:.4e}, {:.4e}]",
                    comp.id, species.id, species.final_avg, species.final_min, species.final_max
                );
            }
        }
        if let (Some(accepted), Some(discarded)) = (self.accepted_steps, self.discarded_steps) {
            println!("Steps:         accepted={accepted}, discarded={discarded}");
        }
        println!("{}\n", "=".repeat(60));
    }
}
