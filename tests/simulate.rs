use glam::DVec2;
use rdsim_rs::geometry::LabelImage;
use rdsim_rs::pde::{
    CompartmentDef, InitialConcentration, MembraneDef, Model, ReactionDef, SpeciesDef,
};
use rdsim_rs::sim::{
    IntegratorError, IntegratorOptions, NegativePolicy, PixelSim, RkScheme, SimState,
};

fn single_compartment_model(
    diffusion: f64,
    initial: InitialConcentration,
) -> Model {
    let mut model = Model::new("test");
    model.compartments.push(CompartmentDef {
        id: "domain".to_string(),
        colour: 1,
    });
    model.species.push(SpeciesDef {
        id: "u".to_string(),
        compartment_id: "domain".to_string(),
        diffusion_constant: diffusion,
        initial,
        is_spatial: true,
    });
    model
}

fn spatial_stats(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let avg = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - avg) * (v - avg)).sum::<f64>() / n;
    (avg, var)
}

#[test]
fn pure_diffusion_conserves_mass_and_smooths() {
    // non-uniform start: a linear gradient across a 12x12 domain
    let model = single_compartment_model(
        1.0,
        InitialConcentration::Analytic("1 + 0.5 * x".to_string()),
    );
    let image = LabelImage::filled(8, 8, 1);
    let mut sim = PixelSim::new(
        &model,
        &image,
        DVec2::ONE,
        DVec2::ZERO,
        IntegratorOptions::default(),
    )
    .unwrap();

    let (initial_avg, initial_var) = spatial_stats(&sim.conc(0, 0, 0));
    assert!(initial_var > 0.0);

    let mut previous_var = initial_var;
    for _ in 0..5 {
        sim.run(2.0);
        assert_eq!(sim.error_message(), "");
        let (avg, var) = spatial_stats(&sim.conc(sim.n_time_points() - 1, 0, 0));
        // zero-flux boundaries: the spatial average is conserved
        assert!(
            (avg - initial_avg).abs() < 1e-9,
            "average drifted: {initial_avg} -> {avg}"
        );
        // diffusion monotonically smooths the field
        assert!(
            var <= previous_var + 1e-12,
            "variance increased: {previous_var} -> {var}"
        );
        previous_var = var;
    }
    // after a long time the field approaches uniformity
    assert!(previous_var < 0.1 * initial_var);
}

#[test]
fn uniform_decay_matches_the_analytic_solution() {
    let mut model =
        single_compartment_model(1.0, InitialConcentration::Uniform(2.0));
    model.reactions.push(ReactionDef {
        id: "decay".to_string(),
        domain_id: "domain".to_string(),
        rate_expression: "k * u".to_string(),
        stoichiometry: vec![("u".to_string(), -1.0)],
        constants: vec![("k".to_string(), 0.8)],
    });
    let image = LabelImage::filled(6, 6, 1);
    for scheme in [RkScheme::Rk212, RkScheme::Rk323, RkScheme::Rk435] {
        let options = IntegratorOptions {
            scheme,
            max_err: IntegratorError {
                abs: f64::MAX,
                rel: 1e-4,
            },
            ..IntegratorOptions::default()
        };
        let mut sim =
            PixelSim::new(&model, &image, DVec2::ONE, DVec2::ZERO, options).unwrap();
        sim.run(2.0);
        assert_eq!(sim.error_message(), "", "{scheme:?}");
        let stats = sim.avg_min_max(1, 0, 0);
        let exact = 2.0 * (-0.8f64 * 2.0).exp();
        assert!(
            (stats.avg - exact).abs() < 1e-3 * exact.max(1.0),
            "{scheme:?}: avg {} vs exact {exact}",
            stats.avg
        );
        // uniform field stays uniform
        assert!((stats.max - stats.min).abs() < 1e-12);
    }
}

fn two_compartment_transport_model() -> (Model, LabelImage) {
    let mut model = Model::new("transport");
    model.compartments.push(CompartmentDef {
        id: "left".to_string(),
        colour: 1,
    });
    model.compartments.push(CompartmentDef {
        id: "right".to_string(),
        colour: 2,
    });
    model.membranes.push(MembraneDef {
        id: "interface".to_string(),
        compartment_a: "left".to_string(),
        compartment_b: "right".to_string(),
    });
    model.species.push(SpeciesDef {
        id: "a".to_string(),
        compartment_id: "left".to_string(),
        diffusion_constant: 1.0,
        initial: InitialConcentration::Uniform(1.0),
        is_spatial: true,
    });
    model.species.push(SpeciesDef {
        id: "b".to_string(),
        compartment_id: "right".to_string(),
        diffusion_constant: 1.0,
        initial: InitialConcentration::Uniform(0.0),
        is_spatial: true,
    });
    model.reactions.push(ReactionDef {
        id: "transport".to_string(),
        domain_id: "interface".to_string(),
        rate_expression: "k * (a - b)".to_string(),
        stoichiometry: vec![("a".to_string(), -1.0), ("b".to_string(), 1.0)],
        constants: vec![("k".to_string(), 0.3)],
    });
    let mut image = LabelImage::filled(8, 4, 1);
    image.fill_rect(4, 0, 8, 4, 2);
    (model, image)
}

#[test]
fn membrane_transport_conserves_total_mass() {
    let (model, image) = two_compartment_transport_model();
    let mut sim = PixelSim::new(
        &model,
        &image,
        DVec2::ONE,
        DVec2::ZERO,
        IntegratorOptions::default(),
    )
    .unwrap();

    let total = |sim: &PixelSim, t: usize| -> f64 {
        sim.conc(t, 0, 0).iter().sum::<f64>() + sim.conc(t, 1, 0).iter().sum::<f64>()
    };
    let initial_total = total(&sim, 0);
    for _ in 0..4 {
        sim.run(0.5);
        assert_eq!(sim.error_message(), "");
    }
    let last = sim.n_time_points() - 1;
    assert!(
        (total(&sim, last) - initial_total).abs() < 1e-8 * initial_total,
        "membrane transport must move mass, not create it"
    );
    // mass actually crossed the interface
    let b_stats = sim.avg_min_max(last, 1, 0);
    assert!(b_stats.avg > 0.1);
    // and the two sides approach equilibrium
    let a_stats = sim.avg_min_max(last, 0, 0);
    assert!((a_stats.avg - b_stats.avg).abs() < 0.5);
}

#[test]
fn negative_abort_policy_fails_the_run() {
    // constant consumption drives the concentration negative
    let mut model =
        single_compartment_model(0.0, InitialConcentration::Uniform(0.01));
    model.reactions.push(ReactionDef {
        id: "sink".to_string(),
        domain_id: "domain".to_string(),
        rate_expression: "k".to_string(),
        stoichiometry: vec![("u".to_string(), -1.0)],
        constants: vec![("k".to_string(), 1.0)],
    });
    let image = LabelImage::filled(3, 3, 1);

    let abort_options = IntegratorOptions {
        negative_policy: NegativePolicy::Abort,
        max_timestep: 0.05,
        ..IntegratorOptions::default()
    };
    let mut sim = PixelSim::new(
        &model,
        &image,
        DVec2::ONE,
        DVec2::ZERO,
        abort_options,
    )
    .unwrap();
    sim.run(1.0);
    assert_eq!(sim.state(), SimState::Failed);
    assert!(sim.error_message().contains("negative concentration"));

    let clamp_options = IntegratorOptions {
        negative_policy: NegativePolicy::Clamp,
        max_timestep: 0.05,
        ..IntegratorOptions::default()
    };
    let mut sim = PixelSim::new(
        &model,
        &image,
        DVec2::ONE,
        DVec2::ZERO,
        clamp_options,
    )
    .unwrap();
    sim.run(1.0);
    assert_eq!(sim.error_message(), "");
    let stats = sim.avg_min_max(sim.n_time_points() - 1, 0, 0);
    assert_eq!(stats.min, 0.0);
}

#[test]
fn parallel_sweep_matches_single_threaded_result() {
    let (model, image) = two_compartment_transport_model();
    let mut reference = PixelSim::new(
        &model,
        &image,
        DVec2::ONE,
        DVec2::ZERO,
        IntegratorOptions::default(),
    )
    .unwrap();
    let mut parallel = PixelSim::new(
        &model,
        &image,
        DVec2::ONE,
        DVec2::ZERO,
        IntegratorOptions {
            max_threads: 4,
            ..IntegratorOptions::default()
        },
    )
    .unwrap();
    reference.run(1.0);
    parallel.run(1.0);
    for comp in 0..2 {
        let a = reference.conc(1, comp, 0);
        let b = parallel.conc(1, comp, 0);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-13, "parallel sweep diverged: {x} vs {y}");
        }
    }
}
