pub mod compartment;
pub mod image;
pub mod indexing;
pub mod membrane;

pub use compartment::PixelCompartment;
pub use image::LabelImage;
pub use indexing::{OrderedIntPairIndex, PointIndexer};
pub use membrane::{FluxDirection, PixelMembrane, build_membranes};
