use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use glam::DVec2;
use rdsim_rs::geometry::LabelImage;
use rdsim_rs::mesh::{Mesh2d, trace_boundaries};
use rdsim_rs::pde::{CompartmentDef, InitialConcentration, Model, ReactionDef, SpeciesDef};
use rdsim_rs::sim::{IntegratorOptions, PixelSim};
use rdsim_rs::symbolic::{CompileOptions, SymbolicSource};

fn image_sizes() -> Vec<usize> {
    vec![32, 64]
}

fn nested_image(size: usize) -> LabelImage {
    let mut image = LabelImage::filled(size, size, 1);
    let quarter = size / 4;
    image.fill_rect(quarter, quarter, 3 * quarter, 3 * quarter, 2);
    image
}

fn diffusion_model() -> Model {
    let mut model = Model::new("bench");
    model.compartments.push(CompartmentDef {
        id: "outer".to_string(),
        colour: 1,
    });
    model.compartments.push(CompartmentDef {
        id: "inner".to_string(),
        colour: 2,
    });
    model.species.push(SpeciesDef {
        id: "u".to_string(),
        compartment_id: "outer".to_string(),
        diffusion_constant: 1.0,
        initial: InitialConcentration::Analytic("1 + x".to_string()),
        is_spatial: true,
    });
    model.species.push(SpeciesDef {
        id: "v".to_string(),
        compartment_id: "inner".to_string(),
        diffusion_constant: 0.5,
        initial: InitialConcentration::Uniform(1.0),
        is_spatial: true,
    });
    model.reactions.push(ReactionDef {
        id: "decay_v".to_string(),
        domain_id: "inner".to_string(),
        rate_expression: "k * v".to_string(),
        stoichiometry: vec![("v".to_string(), -1.0)],
        constants: vec![("k".to_string(), 0.1)],
    });
    model
}

fn bench_boundary_tracing(c: &mut Criterion) {
    let mut group = c.benchmark_group("boundary_tracing");
    for &size in &image_sizes() {
        let image = nested_image(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &_| {
            b.iter(|| {
                let boundaries = trace_boundaries(&image, &[1, 2]).unwrap();
                std::hint::black_box(boundaries);
            });
        });
    }
    group.finish();
}

fn bench_triangulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("triangulation");
    for &size in &image_sizes() {
        let image = nested_image(size);
        let max_area = (size * size) as f64 / 64.0;
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &_| {
            b.iter(|| {
                let mesh = Mesh2d::new(
                    &image,
                    &[1, 2],
                    &[],
                    &[max_area, max_area / 4.0],
                    DVec2::ONE,
                    DVec2::ZERO,
                )
                .unwrap();
                std::hint::black_box(mesh);
            });
        });
    }
    group.finish();
}

fn bench_simulation_interval(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation_interval");
    group.sample_size(20);
    let model = diffusion_model();
    for &size in &image_sizes() {
        let image = nested_image(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &_| {
            b.iter_batched(
                || {
                    PixelSim::new(
                        &model,
                        &image,
                        DVec2::ONE,
                        DVec2::ZERO,
                        IntegratorOptions::default(),
                    )
                    .unwrap()
                },
                |mut sim| {
                    sim.run(0.5);
                    std::hint::black_box(sim.error_message().len());
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_compiled_evaluation(c: &mut Criterion) {
    let variables = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let source = SymbolicSource::new(
        &["a * b / (1 + c^2) + exp(-a) * cos(b)"],
        &variables,
        &[],
        &[],
    );
    let prog = source.compile(CompileOptions::default()).unwrap();
    let mut scratch = prog.make_scratch();
    c.bench_function("compiled_evaluation", |b| {
        let mut out = [0.0];
        b.iter(|| {
            prog.eval_with_scratch(&mut scratch, &mut out, &[1.1, 2.2, 3.3]);
            std::hint::black_box(out[0]);
        });
    });
}

criterion_group!(
    benches,
    bench_boundary_tracing,
    bench_triangulation,
    bench_simulation_interval,
    bench_compiled_evaluation
);
criterion_main!(benches);
