pub mod boundary;
pub mod interior;
pub mod mesh2d;
pub mod tracer;
pub mod triangulate;

pub use boundary::Boundary;
pub use mesh2d::{Mesh2d, MeshError};
pub use tracer::{GeometryError, trace_boundaries};
pub use triangulate::{MeshCompartment, MeshingError, Triangulate};
