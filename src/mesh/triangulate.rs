use crate::mesh::boundary::Boundary;
use glam::DVec2;
use log::{debug, info};
use spade::handles::{FixedVertexHandle, InnerTag};
use spade::{
    ConstrainedDelaunayTriangulation, InsertionError, Point2, PositionInTriangulation,
    Triangulation,
};
use std::collections::HashMap;
use thiserror::Error;

type Cdt = ConstrainedDelaunayTriangulation<Point2<f64>>;

#[derive(Debug, Error)]
pub enum MeshingError {
    #[error("boundary segment intersects an existing boundary")]
    IntersectingBoundary,
    #[error("interior point ({0}, {1}) is not inside a meshable region")]
    SeedOutsideRegion(f64, f64),
    #[error(
        "triangle is outside of the boundary lines; an interior point is probably outside its region"
    )]
    OutsideBoundary,
    #[error("compartment {0} contains no triangles")]
    EmptyCompartment(usize),
    #[error("triangle refinement failed to reach the requested areas")]
    RefinementStalled,
    #[error("invalid vertex coordinate")]
    InvalidVertex(#[from] InsertionError),
}

/// Meshing request for one compartment: where it is and how fine it should
/// be triangulated.
#[derive(Clone, Debug)]
pub struct MeshCompartment {
    /// One seed per connected component of the compartment.
    pub interior_points: Vec<DVec2>,
    pub max_triangle_area: f64,
}

/// Constrained conforming Delaunay triangulation of the compartment
/// boundaries.
///
/// Thin wrapper over the `spade` triangulation: boundary polylines become
/// constraint segments, compartment membership is flood-filled from the
/// interior seed points across non-constrained edges, and any triangle not
/// reachable from a seed is treated as a hole and excluded. All compartments
/// share one global vertex index space, so triangles from different
/// compartments referencing a shared boundary vertex use the same index.
pub struct Triangulate {
    points: Vec<DVec2>,
    triangle_indices: Vec<Vec<[usize; 3]>>,
}

#[inline]
fn face_area(p: [Point2<f64>; 3]) -> f64 {
    0.5 * ((p[1].x - p[0].x) * (p[2].y - p[0].y) - (p[2].x - p[0].x) * (p[1].y - p[0].y)).abs()
}

#[inline]
fn face_centroid(p: [Point2<f64>; 3]) -> Point2<f64> {
    Point2::new(
        (p[0].x + p[1].x + p[2].x) / 3.0,
        (p[0].y + p[1].y + p[2].y) / 3.0,
    )
}

fn insert_boundaries(boundaries: &[Boundary]) -> Result<Cdt, MeshingError> {
    let mut cdt = Cdt::new();
    for boundary in boundaries {
        let points = boundary.points();
        let mut handles: Vec<FixedVertexHandle> = Vec::with_capacity(points.len());
        for p in points {
            // exactly coincident points (shared boundary endpoints) resolve
            // to the same vertex handle, giving the shared index space
            handles.push(cdt.insert(Point2::new(p.x, p.y))?);
        }
        let n = handles.len();
        let segments = if boundary.is_loop() { n } else { n.saturating_sub(1) };
        for i in 0..segments {
            let (a, b) = (handles[i], handles[(i + 1) % n]);
            if a == b {
                continue;
            }
            if !cdt.can_add_constraint(a, b) {
                return Err(MeshingError::IntersectingBoundary);
            }
            cdt.add_constraint(a, b);
        }
    }
    Ok(cdt)
}

fn locate_seed(cdt: &Cdt, seed: DVec2) -> Result<spade::handles::FixedFaceHandle<InnerTag>, MeshingError> {
    match cdt.locate(Point2::new(seed.x, seed.y)) {
        PositionInTriangulation::OnFace(face) => Ok(face),
        PositionInTriangulation::OnEdge(edge) => {
            let handle = cdt.directed_edge(edge);
            handle
                .face()
                .as_inner()
                .or_else(|| handle.rev().face().as_inner())
                .map(|f| f.fix())
                .ok_or(MeshingError::SeedOutsideRegion(seed.x, seed.y))
        }
        _ => Err(MeshingError::SeedOutsideRegion(seed.x, seed.y)),
    }
}

/// Flood-fill compartment membership: starting from each compartment's
/// seeds, spread across edges that are not constraints. Escaping to the
/// outer face means a seed ended up outside its boundary loop, which is a
/// fatal meshing error rather than something to paper over.
fn assign_regions(
    cdt: &Cdt,
    compartments: &[MeshCompartment],
) -> Result<HashMap<usize, usize>, MeshingError> {
    let mut assignment: HashMap<usize, usize> = HashMap::new();
    for (comp_index, compartment) in compartments.iter().enumerate() {
        for &seed in &compartment.interior_points {
            let start = locate_seed(cdt, seed)?;
            if assignment.contains_key(&start.index()) {
                continue;
            }
            let mut stack = vec![start];
            assignment.insert(start.index(), comp_index);
            while let Some(fixed) = stack.pop() {
                let face = cdt.face(fixed);
                for edge in face.adjacent_edges() {
                    if edge.as_undirected().is_constraint_edge() {
                        continue;
                    }
                    let neighbour = edge.rev().face();
                    let Some(inner) = neighbour.as_inner() else {
                        // unconstrained edge to the infinite face: we walked
                        // straight out of the boundary polygon
                        return Err(MeshingError::OutsideBoundary);
                    };
                    if !assignment.contains_key(&inner.fix().index()) {
                        assignment.insert(inner.fix().index(), comp_index);
                        stack.push(inner.fix());
                    }
                }
            }
        }
    }
    Ok(assignment)
}

/// Split every triangle of `comp_index` whose area exceeds the cap by
/// inserting its centroid, repeating until all triangles conform. Constraint
/// edges are never flipped, so refining one compartment cannot disturb
/// already-refined neighbours.
fn refine_compartment(
    cdt: &mut Cdt,
    compartments: &[MeshCompartment],
    comp_index: usize,
) -> Result<(), MeshingError> {
    const MAX_ROUNDS: usize = 64;
    let max_area = compartments[comp_index].max_triangle_area;
    for _ in 0..MAX_ROUNDS {
        let assignment = assign_regions(cdt, compartments)?;
        let centroids: Vec<Point2<f64>> = cdt
            .inner_faces()
            .filter(|face| assignment.get(&face.fix().index()) == Some(&comp_index))
            .filter_map(|face| {
                let positions = face.vertices().map(|v| v.position());
                (face_area(positions) > max_area).then(|| face_centroid(positions))
            })
            .collect();
        if centroids.is_empty() {
            return Ok(());
        }
        debug!(
            "compartment {}: splitting {} oversized triangles",
            comp_index,
            centroids.len()
        );
        for c in centroids {
            cdt.insert(c)?;
        }
    }
    Err(MeshingError::RefinementStalled)
}

impl Triangulate {
    pub fn new(
        boundaries: &[Boundary],
        compartments: &[MeshCompartment],
    ) -> Result<Self, MeshingError> {
        let mut cdt = insert_boundaries(boundaries)?;
        info!(
            "CDT: {} vertices, {} triangles before refinement",
            cdt.num_vertices(),
            cdt.num_inner_faces()
        );

        // refine in ascending order of area cap, so Steiner points never land
        // next to a still-coarse compartment's triangles
        let mut order: Vec<usize> = (0..compartments.len()).collect();
        order.sort_by(|&a, &b| {
            compartments[a]
                .max_triangle_area
                .total_cmp(&compartments[b].max_triangle_area)
        });
        for comp_index in order {
            refine_compartment(&mut cdt, compartments, comp_index)?;
        }

        let mut points = vec![DVec2::ZERO; cdt.num_vertices()];
        for vertex in cdt.vertices() {
            let p = vertex.position();
            points[vertex.fix().index()] = DVec2::new(p.x, p.y);
        }

        let assignment = assign_regions(&cdt, compartments)?;
        let mut triangle_indices: Vec<Vec<[usize; 3]>> = vec![Vec::new(); compartments.len()];
        for face in cdt.inner_faces() {
            // triangles not reachable from any seed are holes
            if let Some(&comp_index) = assignment.get(&face.fix().index()) {
                let [a, b, c] = face.vertices().map(|v| v.fix().index());
                triangle_indices[comp_index].push([a, b, c]);
            }
        }
        for (comp_index, triangles) in triangle_indices.iter().enumerate() {
            if triangles.is_empty() {
                return Err(MeshingError::EmptyCompartment(comp_index));
            }
            info!(
                "compartment {}: {} triangles",
                comp_index,
                triangles.len()
            );
        }
        Ok(Self {
            points,
            triangle_indices,
        })
    }

    /// Shared vertex array, indexed by the triangle index triples.
    pub fn points(&self) -> &[DVec2] {
        &self.points
    }

    /// Triangle index triples, one list per compartment.
    pub fn triangle_indices(&self) -> &[Vec<[usize; 3]>] {
        &self.triangle_indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rectangle_boundary(w: f64, h: f64) -> Boundary {
        Boundary::new(
            vec![
                DVec2::new(0.0, 0.0),
                DVec2::new(w, 0.0),
                DVec2::new(w, h),
                DVec2::new(0.0, h),
            ],
            true,
        )
    }

    fn triangle_area_of(points: &[DVec2], t: [usize; 3]) -> f64 {
        let [a, b, c] = t.map(|i| points[i]);
        0.5 * ((b - a).perp_dot(c - a)).abs()
    }

    #[test]
    fn rectangle_with_large_cap_gives_two_triangles() {
        let boundary = rectangle_boundary(4.0, 3.0);
        let comp = MeshCompartment {
            interior_points: vec![DVec2::new(2.0, 1.5)],
            max_triangle_area: 1e9,
        };
        let tri = Triangulate::new(&[boundary], &[comp]).unwrap();
        assert_eq!(tri.points().len(), 4);
        assert_eq!(tri.triangle_indices()[0].len(), 2);
        let area: f64 = tri.triangle_indices()[0]
            .iter()
            .map(|&t| triangle_area_of(tri.points(), t))
            .sum();
        assert!((area - 12.0).abs() < 1e-12);
    }

    #[test]
    fn smaller_cap_means_more_triangles() {
        let boundary = rectangle_boundary(4.0, 4.0);
        let mut counts = Vec::new();
        for cap in [1e9, 4.0, 1.0] {
            let comp = MeshCompartment {
                interior_points: vec![DVec2::new(2.0, 2.0)],
                max_triangle_area: cap,
            };
            let tri = Triangulate::new(&[boundary.clone()], &[comp.clone()]).unwrap();
            for &t in &tri.triangle_indices()[0] {
                assert!(triangle_area_of(tri.points(), t) <= cap);
            }
            counts.push((tri.points().len(), tri.triangle_indices()[0].len()));
        }
        assert!(counts[0].0 <= counts[1].0 && counts[1].0 <= counts[2].0);
        assert!(counts[0].1 <= counts[1].1 && counts[1].1 <= counts[2].1);
    }

    #[test]
    fn seed_outside_the_boundary_is_an_error() {
        let boundary = rectangle_boundary(2.0, 2.0);
        let comp = MeshCompartment {
            interior_points: vec![DVec2::new(50.0, 50.0)],
            max_triangle_area: 1e9,
        };
        let result = Triangulate::new(&[boundary], &[comp]);
        assert!(matches!(
            result,
            Err(MeshingError::SeedOutsideRegion(..) | MeshingError::OutsideBoundary)
        ));
    }

    #[test]
    fn hole_triangles_are_excluded() {
        // outer square with an inner square; only the outer ring is claimed
        let outer = rectangle_boundary(6.0, 6.0);
        let inner = Boundary::new(
            vec![
                DVec2::new(2.0, 2.0),
                DVec2::new(4.0, 2.0),
                DVec2::new(4.0, 4.0),
                DVec2::new(2.0, 4.0),
            ],
            true,
        );
        let ring = MeshCompartment {
            interior_points: vec![DVec2::new(1.0, 1.0)],
            max_triangle_area: 1e9,
        };
        let tri = Triangulate::new(&[outer, inner], &[ring]).unwrap();
        let total: f64 = tri.triangle_indices()[0]
            .iter()
            .map(|&t| triangle_area_of(tri.points(), t))
            .sum();
        // ring area = 36 - 4
        assert!((total - 32.0).abs() < 1e-12);
    }
}
