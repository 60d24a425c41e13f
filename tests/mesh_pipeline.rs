use glam::DVec2;
use rdsim_rs::geometry::LabelImage;
use rdsim_rs::mesh::{Mesh2d, trace_boundaries};

fn triangle_area(points: &[DVec2], t: [usize; 3]) -> f64 {
    let [a, b, c] = t.map(|i| points[i]);
    0.5 * ((b - a).perp_dot(c - a)).abs()
}

fn total_area(mesh: &Mesh2d, compartment: usize) -> f64 {
    mesh.triangle_indices()[compartment]
        .iter()
        .map(|&t| triangle_area(mesh.vertices(), t))
        .sum()
}

#[test]
fn single_region_rectangle_meshes_to_two_triangles() {
    let (w, h) = (20usize, 10usize);
    let image = LabelImage::filled(w, h, 1);

    let boundaries = trace_boundaries(&image, &[1]).unwrap();
    assert_eq!(boundaries.len(), 1);
    assert!(boundaries[0].is_loop());

    let mesh = Mesh2d::new(&image, &[1], &[], &[1e9], DVec2::ONE, DVec2::ZERO).unwrap();
    assert!(mesh.is_valid(), "{}", mesh.error_message());
    assert_eq!(mesh.vertices().len(), 4);
    assert_eq!(mesh.triangle_indices()[0].len(), 2);
    let area = total_area(&mesh, 0);
    assert!(
        (area - (w * h) as f64).abs() < 1e-9,
        "triangle area sum {area} should equal {}",
        w * h
    );
}

#[test]
fn boundary_simplification_round_trips_through_the_cache() {
    // a cross-shaped region has a boundary with many genuine corners
    let mut image = LabelImage::filled(15, 15, 0);
    image.fill_rect(6, 1, 9, 14, 1);
    image.fill_rect(1, 6, 14, 9, 1);
    let mut boundaries = trace_boundaries(&image, &[1]).unwrap();
    assert_eq!(boundaries.len(), 1);
    let boundary = &mut boundaries[0];
    let original = boundary.points().to_vec();
    assert_eq!(original.len(), 12);

    for cap in [8, 6, 4] {
        boundary.set_max_points(cap);
        assert!(boundary.points().len() <= cap);
    }
    boundary.set_max_points(original.len() + 5);
    assert_eq!(boundary.points(), original.as_slice());
}

#[test]
fn decreasing_area_cap_monotonically_refines() {
    let image = LabelImage::filled(16, 16, 3);
    let mut mesh =
        Mesh2d::new(&image, &[3], &[], &[1e9], DVec2::ONE, DVec2::ZERO).unwrap();
    let mut previous = (mesh.vertices().len(), mesh.triangle_indices()[0].len());
    for cap in [64.0, 16.0, 4.0] {
        mesh.set_compartment_max_triangle_area(0, cap).unwrap();
        assert!(mesh.is_valid());
        let current = (mesh.vertices().len(), mesh.triangle_indices()[0].len());
        assert!(
            current.0 >= previous.0 && current.1 >= previous.1,
            "cap {cap} reduced mesh resolution: {previous:?} -> {current:?}"
        );
        // every triangle conforms to the new cap
        for &t in &mesh.triangle_indices()[0] {
            assert!(triangle_area(mesh.vertices(), t) <= cap);
        }
        previous = current;
    }
    // the compartment still covers the full image
    assert!((total_area(&mesh, 0) - 256.0).abs() < 1e-9);
}

#[test]
fn adjacent_compartments_share_interface_vertices() {
    let mut image = LabelImage::filled(12, 8, 1);
    image.fill_rect(6, 0, 12, 8, 2);
    let mesh = Mesh2d::new(
        &image,
        &[1, 2],
        &[],
        &[1e9, 1e9],
        DVec2::ONE,
        DVec2::ZERO,
    )
    .unwrap();
    assert!(mesh.is_valid(), "{}", mesh.error_message());
    assert_eq!(mesh.n_compartments(), 2);

    let used: Vec<std::collections::BTreeSet<usize>> = (0..2)
        .map(|c| {
            mesh.triangle_indices()[c]
                .iter()
                .flat_map(|t| t.iter().copied())
                .collect()
        })
        .collect();
    let shared: Vec<usize> = used[0].intersection(&used[1]).copied().collect();
    assert!(
        shared.len() >= 2,
        "compartments must reference shared interface vertices by the same index"
    );
    for &i in &shared {
        assert_eq!(mesh.vertices()[i].x, 6.0);
    }
    // compartment areas partition the image
    assert!((total_area(&mesh, 0) - 48.0).abs() < 1e-9);
    assert!((total_area(&mesh, 1) - 48.0).abs() < 1e-9);
}

#[test]
fn gmsh_export_reimports_as_readonly_mesh() {
    let mut image = LabelImage::filled(10, 10, 1);
    image.fill_rect(3, 3, 7, 7, 2);
    let mesh = Mesh2d::new(
        &image,
        &[1, 2],
        &[],
        &[20.0, 5.0],
        DVec2::new(0.5, 0.5),
        DVec2::new(-1.0, -1.0),
    )
    .unwrap();
    assert!(mesh.is_valid(), "{}", mesh.error_message());
    let msh = mesh.to_msh();

    let reloaded = Mesh2d::from_msh(&msh).unwrap();
    assert!(reloaded.is_readonly());
    assert_eq!(reloaded.vertices().len(), mesh.vertices().len());
    for c in 0..mesh.n_compartments() {
        assert_eq!(
            reloaded.triangle_indices()[c].len(),
            mesh.triangle_indices()[c].len()
        );
    }
    // reloaded vertices are physical coordinates
    let flat = mesh.vertices_as_flat_array();
    let reloaded_flat = reloaded.vertices_as_flat_array();
    for (a, b) in flat.iter().zip(&reloaded_flat) {
        assert!((a - b).abs() < 1e-12);
    }
}
