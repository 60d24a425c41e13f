use crate::geometry::LabelImage;
use crate::mesh::boundary::Boundary;
use crate::mesh::interior::interior_points;
use crate::mesh::tracer::{GeometryError, trace_boundaries};
use crate::mesh::triangulate::{MeshCompartment, MeshingError, Triangulate};
use glam::DVec2;
use log::{info, warn};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("boundary index {0} out of range ({1} boundaries)")]
    BoundaryIndexOutOfRange(usize, usize),
    #[error("compartment index {0} out of range ({1} compartments)")]
    CompartmentIndexOutOfRange(usize, usize),
    #[error("mesh is read-only")]
    ReadOnly,
    #[error(transparent)]
    Meshing(#[from] MeshingError),
    #[error("invalid mesh file: {0}")]
    Parse(String),
}

/// Triangulated 2d mesh of a segmented geometry image.
///
/// Owns the boundaries and interior points derived from the input image
/// together with the mutable per-boundary point caps and per-compartment
/// triangle area caps. Changing either re-simplifies / re-meshes; because
/// the vertex index space is shared between compartments the whole
/// triangulation is rebuilt. A failed rebuild leaves the previous mesh and
/// controls untouched and reports the error.
pub struct Mesh2d {
    origin: DVec2,
    pixel_size: DVec2,
    boundaries: Vec<Boundary>,
    compartment_max_triangle_area: Vec<f64>,
    compartment_interior_points: Vec<Vec<DVec2>>,
    vertices: Vec<DVec2>,
    triangle_indices: Vec<Vec<[usize; 3]>>,
    readonly: bool,
    valid: bool,
    error_message: String,
}

impl Mesh2d {
    /// Trace and mesh a segmented image.
    ///
    /// `boundary_max_points` and `max_triangle_areas` may be empty (or of
    /// mismatched length), in which case automatic values are used: full
    /// resolution boundaries, and an area cap proportional to the image
    /// size.
    pub fn new(
        image: &LabelImage,
        compartment_colours: &[u32],
        boundary_max_points: &[usize],
        max_triangle_areas: &[f64],
        pixel_size: DVec2,
        origin: DVec2,
    ) -> Result<Self, GeometryError> {
        let mut boundaries = trace_boundaries(image, compartment_colours)?;
        info!("found {} boundaries", boundaries.len());
        if boundary_max_points.len() == boundaries.len() {
            for (boundary, &cap) in boundaries.iter_mut().zip(boundary_max_points) {
                boundary.set_max_points(cap);
            }
        } else if !boundary_max_points.is_empty() {
            warn!(
                "boundary_max_points has size {}, but there are {} boundaries - using automatic values",
                boundary_max_points.len(),
                boundaries.len()
            );
        }
        let compartment_max_triangle_area = if max_triangle_areas.len()
            == compartment_colours.len()
        {
            max_triangle_areas.to_vec()
        } else {
            let auto = ((image.width() * image.height()) as f64 / 250.0).clamp(1.0, 999999.0);
            info!("no max triangle areas specified, using: {auto}");
            vec![auto; compartment_colours.len()]
        };
        let compartment_interior_points = compartment_colours
            .iter()
            .map(|&colour| interior_points(image, colour))
            .collect();
        let mut mesh = Self {
            origin,
            pixel_size,
            boundaries,
            compartment_max_triangle_area,
            compartment_interior_points,
            vertices: Vec::new(),
            triangle_indices: Vec::new(),
            readonly: false,
            valid: false,
            error_message: String::new(),
        };
        if let Err(e) = mesh.construct_mesh() {
            mesh.error_message = e.to_string();
            warn!("mesh construction failed: {}", mesh.error_message);
        } else {
            mesh.valid = true;
        }
        Ok(mesh)
    }

    /// Wrap precomputed vertex/triangle arrays, e.g. reloaded from a mesh
    /// file. The resulting mesh is read-only: resolution mutators are no-ops.
    pub fn from_mesh_data(
        vertices: Vec<DVec2>,
        triangle_indices: Vec<Vec<[usize; 3]>>,
        pixel_size: DVec2,
        origin: DVec2,
    ) -> Self {
        let n_compartments = triangle_indices.len();
        Self {
            origin,
            pixel_size,
            boundaries: Vec::new(),
            compartment_max_triangle_area: vec![0.0; n_compartments],
            compartment_interior_points: vec![Vec::new(); n_compartments],
            vertices,
            triangle_indices,
            readonly: true,
            valid: true,
            error_message: String::new(),
        }
    }

    fn construct_mesh(&mut self) -> Result<(), MeshingError> {
        let compartments: Vec<MeshCompartment> = self
            .compartment_interior_points
            .iter()
            .zip(&self.compartment_max_triangle_area)
            .map(|(pts, &area)| MeshCompartment {
                interior_points: pts.clone(),
                max_triangle_area: area,
            })
            .collect();
        let triangulate = Triangulate::new(&self.boundaries, &compartments)?;
        self.vertices = triangulate.points().to_vec();
        self.triangle_indices = triangulate.triangle_indices().to_vec();
        self.error_message.clear();
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn n_boundaries(&self) -> usize {
        self.boundaries.len()
    }

    pub fn n_compartments(&self) -> usize {
        self.triangle_indices.len()
    }

    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    pub fn boundary_max_points(&self, index: usize) -> Option<usize> {
        self.boundaries.get(index).map(|b| b.max_points())
    }

    pub fn compartment_max_triangle_area(&self, index: usize) -> Option<f64> {
        self.compartment_max_triangle_area.get(index).copied()
    }

    /// Cap the point count of one boundary and re-mesh. On failure the
    /// previous cap and mesh are restored and the error returned.
    pub fn set_boundary_max_points(
        &mut self,
        index: usize,
        max_points: usize,
    ) -> Result<(), MeshError> {
        if self.readonly {
            return Err(MeshError::ReadOnly);
        }
        let n = self.boundaries.len();
        let Some(boundary) = self.boundaries.get_mut(index) else {
            return Err(MeshError::BoundaryIndexOutOfRange(index, n));
        };
        let previous = boundary.max_points();
        if previous == max_points {
            return Ok(());
        }
        info!("boundary {index}: max points {previous} -> {max_points}");
        boundary.set_max_points(max_points);
        if let Err(e) = self.construct_mesh() {
            self.boundaries[index].set_max_points(previous);
            self.error_message = e.to_string();
            return Err(e.into());
        }
        self.valid = true;
        Ok(())
    }

    /// Cap the triangle area of one compartment and re-mesh. On failure the
    /// previous cap and mesh are restored and the error returned.
    pub fn set_compartment_max_triangle_area(
        &mut self,
        index: usize,
        max_area: f64,
    ) -> Result<(), MeshError> {
        if self.readonly {
            return Err(MeshError::ReadOnly);
        }
        let n = self.compartment_max_triangle_area.len();
        let Some(area) = self.compartment_max_triangle_area.get_mut(index) else {
            return Err(MeshError::CompartmentIndexOutOfRange(index, n));
        };
        let previous = *area;
        if previous == max_area {
            return Ok(());
        }
        info!("compartment {index}: max triangle area {previous} -> {max_area}");
        *area = max_area;
        if let Err(e) = self.construct_mesh() {
            self.compartment_max_triangle_area[index] = previous;
            self.error_message = e.to_string();
            return Err(e.into());
        }
        self.valid = true;
        Ok(())
    }

    #[inline]
    pub fn pixel_point_to_physical_point(&self, p: DVec2) -> DVec2 {
        self.origin + p * self.pixel_size
    }

    /// Vertices in pixel coordinates.
    pub fn vertices(&self) -> &[DVec2] {
        &self.vertices
    }

    pub fn triangle_indices(&self) -> &[Vec<[usize; 3]>] {
        &self.triangle_indices
    }

    /// Physical vertex coordinates as a flat `[x0, y0, x1, y1, ...]` array,
    /// for export to external solvers.
    pub fn vertices_as_flat_array(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(2 * self.vertices.len());
        for &v in &self.vertices {
            let p = self.pixel_point_to_physical_point(v);
            flat.push(p.x);
            flat.push(p.y);
        }
        flat
    }

    pub fn triangle_indices_as_flat_array(&self, compartment_index: usize) -> Vec<i32> {
        self.triangle_indices
            .get(compartment_index)
            .map(|triangles| {
                triangles
                    .iter()
                    .flat_map(|t| t.iter().map(|&i| i as i32))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serialize the mesh in the Gmsh 2.2 text format: a 1-indexed node list
    /// followed by 1-indexed triangle elements carrying their compartment
    /// index as both element tags.
    pub fn to_msh(&self) -> String {
        let mut msh = String::new();
        msh.push_str("$MeshFormat\n2.2 0 8\n$EndMeshFormat\n");
        let _ = writeln!(msh, "$Nodes\n{}", self.vertices.len());
        for (i, &v) in self.vertices.iter().enumerate() {
            let p = self.pixel_point_to_physical_point(v);
            let _ = writeln!(msh, "{} {} {} {}", i + 1, p.x, p.y, 0);
        }
        msh.push_str("$EndNodes\n");
        let n_elements: usize = self.triangle_indices.iter().map(Vec::len).sum();
        let _ = writeln!(msh, "$Elements\n{n_elements}");
        let mut element_index = 1;
        for (comp, triangles) in self.triangle_indices.iter().enumerate() {
            let tag = comp + 1;
            for t in triangles {
                let _ = writeln!(
                    msh,
                    "{} 2 2 {} {} {} {} {}",
                    element_index,
                    tag,
                    tag,
                    t[0] + 1,
                    t[1] + 1,
                    t[2] + 1
                );
                element_index += 1;
            }
        }
        msh.push_str("$EndElements\n");
        msh
    }

    /// Reload a mesh serialized by [`Mesh2d::to_msh`]. The result is
    /// read-only; vertices are taken as physical coordinates.
    pub fn from_msh(text: &str) -> Result<Self, MeshError> {
        let mut lines = text.lines();
        let mut vertices = Vec::new();
        let mut compartments: Vec<Vec<[usize; 3]>> = Vec::new();
        let parse =
            |s: &str| -> Result<f64, MeshError> {
                s.parse()
                    .map_err(|_| MeshError::Parse(format!("bad number '{s}'")))
            };
        while let Some(line) = lines.next() {
            match line.trim() {
                "$Nodes" => {
                    let n: usize = lines
                        .next()
                        .and_then(|l| l.trim().parse().ok())
                        .ok_or_else(|| MeshError::Parse("missing node count".into()))?;
                    for _ in 0..n {
                        let line = lines
                            .next()
                            .ok_or_else(|| MeshError::Parse("truncated node list".into()))?;
                        let fields: Vec<&str> = line.split_whitespace().collect();
                        if fields.len() != 4 {
                            return Err(MeshError::Parse(format!("bad node line '{line}'")));
                        }
                        vertices.push(DVec2::new(parse(fields[1])?, parse(fields[2])?));
                    }
                }
                "$Elements" => {
                    let n: usize = lines
                        .next()
                        .and_then(|l| l.trim().parse().ok())
                        .ok_or_else(|| MeshError::Parse("missing element count".into()))?;
                    for _ in 0..n {
                        let line = lines
                            .next()
                            .ok_or_else(|| MeshError::Parse("truncated element list".into()))?;
                        let fields: Vec<usize> = line
                            .split_whitespace()
                            .map(|f| f.parse().map_err(|_| {
                                MeshError::Parse(format!("bad element line '{line}'"))
                            }))
                            .collect::<Result<_, _>>()?;
                        // id type numTags tag... v1 v2 v3; only triangles
                        if fields.len() < 4 || fields[1] != 2 {
                            continue;
                        }
                        let n_tags = fields[2];
                        if fields.len() != 3 + n_tags + 3 || n_tags == 0 {
                            return Err(MeshError::Parse(format!("bad element line '{line}'")));
                        }
                        let comp = fields[3]
                            .checked_sub(1)
                            .ok_or_else(|| MeshError::Parse("element tag is 0".into()))?;
                        if comp >= compartments.len() {
                            compartments.resize(comp + 1, Vec::new());
                        }
                        let v = &fields[3 + n_tags..];
                        let triangle = [v[0], v[1], v[2]].map(|i| i - 1);
                        if triangle.iter().any(|&i| i >= vertices.len()) {
                            return Err(MeshError::Parse(format!(
                                "element references missing node in '{line}'"
                            )));
                        }
                        compartments[comp].push(triangle);
                    }
                }
                _ => {}
            }
        }
        Ok(Self::from_mesh_data(
            vertices,
            compartments,
            DVec2::ONE,
            DVec2::ZERO,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_region_image() -> (LabelImage, Vec<u32>) {
        let mut img = LabelImage::filled(10, 6, 1);
        img.fill_rect(5, 0, 10, 6, 2);
        (img, vec![1, 2])
    }

    #[test]
    fn mesh_from_image_is_valid_and_mutable() {
        let (img, colours) = two_region_image();
        let mut mesh = Mesh2d::new(
            &img,
            &colours,
            &[],
            &[1e9, 1e9],
            DVec2::ONE,
            DVec2::ZERO,
        )
        .unwrap();
        assert!(mesh.is_valid());
        assert!(!mesh.is_readonly());
        assert_eq!(mesh.n_compartments(), 2);
        let coarse = mesh.triangle_indices()[0].len();
        mesh.set_compartment_max_triangle_area(0, 2.0).unwrap();
        assert!(mesh.triangle_indices()[0].len() > coarse);
        // out of range is rejected without touching state
        assert!(matches!(
            mesh.set_compartment_max_triangle_area(5, 1.0),
            Err(MeshError::CompartmentIndexOutOfRange(5, 2))
        ));
    }

    #[test]
    fn msh_round_trip() {
        let (img, colours) = two_region_image();
        let mesh = Mesh2d::new(&img, &colours, &[], &[1e9, 1e9], DVec2::ONE, DVec2::ZERO)
            .unwrap();
        let msh = mesh.to_msh();
        assert!(msh.starts_with("$MeshFormat\n2.2 0 8\n"));
        let reloaded = Mesh2d::from_msh(&msh).unwrap();
        assert!(reloaded.is_readonly());
        assert_eq!(reloaded.vertices().len(), mesh.vertices().len());
        assert_eq!(reloaded.n_compartments(), mesh.n_compartments());
        for c in 0..mesh.n_compartments() {
            assert_eq!(
                reloaded.triangle_indices()[c],
                mesh.triangle_indices()[c]
            );
        }
        // read-only meshes reject resolution changes
        let mut reloaded = reloaded;
        assert!(matches!(
            reloaded.set_boundary_max_points(0, 4),
            Err(MeshError::ReadOnly)
        ));
    }
}
