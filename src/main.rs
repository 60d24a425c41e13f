use glam::DVec2;
use rdsim_rs::geometry::LabelImage;
use rdsim_rs::mesh::Mesh2d;
use rdsim_rs::pde::{
    CompartmentDef, InitialConcentration, MembraneDef, Model, ReactionDef, SpeciesDef,
};
use rdsim_rs::processing::csv_writer;
use rdsim_rs::processing::summary::SimulationSummary;
use rdsim_rs::sim::{IntegratorOptions, PixelSim, RkScheme, SimState, export_ini};
use std::fs;

const CYTOPLASM: u32 = 0xff80_a080;
const NUCLEUS: u32 = 0xff40_4080;

fn main() {
    env_logger::init();
    fs::create_dir_all("output/main").expect("Failed to create output directory");

    let image = build_geometry_image();
    let model = build_model();

    let mesh = Mesh2d::new(
        &image,
        &[CYTOPLASM, NUCLEUS],
        &[],
        &[12.0, 4.0],
        DVec2::ONE,
        DVec2::ZERO,
    )
    .expect("Failed to trace geometry");
    if !mesh.is_valid() {
        eprintln!("Meshing failed: {}", mesh.error_message());
        return;
    }
    println!(
        "Meshed geometry: {} boundaries, {} vertices, {} triangles",
        mesh.n_boundaries(),
        mesh.vertices().len(),
        mesh.triangle_indices().iter().map(Vec::len).sum::<usize>()
    );
    fs::write("output/main/geometry.msh", mesh.to_msh()).expect("Failed to write mesh");
    fs::write(
        "output/main/geometry.ini",
        export_ini(&model, &mesh, "geometry.msh"),
    )
    .expect("Failed to write ini export");

    let options = IntegratorOptions {
        scheme: RkScheme::Rk212,
        max_threads: 0,
        ..IntegratorOptions::default()
    };
    let mut sim = PixelSim::new(&model, &image, DVec2::ONE, DVec2::ZERO, options.clone())
        .expect("Failed to build simulator");

    println!("Running pixel simulation: 20 intervals of t = 0.25");
    let mut accepted = 0;
    for interval in 1..=20 {
        accepted += sim.run(0.25);
        if sim.state() == SimState::Failed {
            eprintln!("Simulation failed: {}", sim.error_message());
            break;
        }
        let stats = sim.avg_min_max(sim.n_time_points() - 1, 0, 0);
        println!(
            "Interval {:>3} | t = {:.2} | P avg = {:.5e} | steps = {}",
            interval,
            sim.current_time(),
            stats.avg,
            accepted
        );
    }

    save_results(&sim);

    let mut summary = SimulationSummary::from_problem(&model, &mesh, &sim)
        .with_image_size(image.width(), image.height())
        .with_integrator(
            options.scheme,
            options.max_err.rel,
            options.max_err.abs,
            options.max_timestep,
        );
    summary.add_run_info(sim.current_time(), accepted, sim.discarded_steps());
    summary
        .write_to_file("output/main/simulation_summary.txt")
        .expect("Failed to write summary");
    summary.print_to_console();

    println!("Summary saved to output/main/simulation_summary.txt");
}

/// A cell: cytoplasm filling the image with a rectangular nucleus inside.
fn build_geometry_image() -> LabelImage {
    let mut image = LabelImage::filled(24, 24, CYTOPLASM);
    image.fill_rect(8, 8, 16, 16, NUCLEUS);
    image
}

/// Protein P is produced in the cytoplasm, decays everywhere, and is
/// transported across the nuclear envelope.
fn build_model() -> Model {
    let mut model = Model::new("nuclear-import");
    model.compartments.push(CompartmentDef {
        id: "cytoplasm".to_string(),
        colour: CYTOPLASM,
    });
    model.compartments.push(CompartmentDef {
        id: "nucleus".to_string(),
        colour: NUCLEUS,
    });
    model.membranes.push(MembraneDef {
        id: "nuclear_envelope".to_string(),
        compartment_a: "cytoplasm".to_string(),
        compartment_b: "nucleus".to_string(),
    });
    model.species.push(SpeciesDef {
        id: "P".to_string(),
        compartment_id: "cytoplasm".to_string(),
        diffusion_constant: 1.0,
        initial: InitialConcentration::Uniform(1.0),
        is_spatial: true,
    });
    model.species.push(SpeciesDef {
        id: "P_n".to_string(),
        compartment_id: "nucleus".to_string(),
        diffusion_constant: 0.5,
        initial: InitialConcentration::Uniform(0.0),
        is_spatial: true,
    });
    model.reactions.push(ReactionDef {
        id: "production".to_string(),
        domain_id: "cytoplasm".to_string(),
        rate_expression: "k_prod".to_string(),
        stoichiometry: vec![("P".to_string(), 1.0)],
        constants: vec![("k_prod".to_string(), 0.1)],
    });
    model.reactions.push(ReactionDef {
        id: "decay".to_string(),
        domain_id: "cytoplasm".to_string(),
        rate_expression: "k_decay * P".to_string(),
        stoichiometry: vec![("P".to_string(), -1.0)],
        constants: vec![("k_decay".to_string(), 0.2)],
    });
    model.reactions.push(ReactionDef {
        id: "import".to_string(),
        domain_id: "nuclear_envelope".to_string(),
        rate_expression: "k_import * (P - P_n)".to_string(),
        stoichiometry: vec![("P".to_string(), -1.0), ("P_n".to_string(), 1.0)],
        constants: vec![("k_import".to_string(), 0.5)],
    });
    model
}

fn save_results(sim: &PixelSim) {
    let times = sim.times();
    for (ci, species_index, name) in [(0usize, 0usize, "P"), (1, 0, "P_n")] {
        let stats: Vec<_> = (0..sim.n_time_points())
            .map(|t| sim.avg_min_max(t, ci, species_index))
            .collect();
        let path = format!("output/main/{name}_stats.csv");
        csv_writer::write_species_stats(&path, &times, &stats)
            .expect("Failed to write species stats");
        println!("Species statistics saved to {path}");

        let field = sim.conc(sim.n_time_points() - 1, ci, species_index);
        let field_path = format!("output/main/{name}_final.csv");
        csv_writer::write_concentration_field(&field_path, sim.compartment(ci).voxels(), &field)
            .expect("Failed to write concentration field");
        println!("Final concentration field saved to {field_path}");
    }
}
