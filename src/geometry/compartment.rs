use crate::geometry::image::LabelImage;
use crate::geometry::indexing::PointIndexer;

/// The set of pixels making up one compartment, with nearest-neighbour
/// indices for the diffusion stencil.
///
/// `voxels[up_x(i)]` is the +x neighbour of `voxels[i]`; a pixel on the
/// compartment edge is its own neighbour in that direction, which gives the
/// zero-flux Neumann boundary condition for free.
#[derive(Clone, Debug)]
pub struct PixelCompartment {
    id: String,
    colour: u32,
    voxels: Vec<(usize, usize)>,
    nn: Vec<usize>,
    image_width: usize,
    image_height: usize,
}

impl PixelCompartment {
    /// Collect all pixels of `colour` from the image, in raster order.
    pub fn new(id: impl Into<String>, image: &LabelImage, colour: u32) -> Self {
        let mut voxels = Vec::new();
        for y in 0..image.height() {
            for x in 0..image.width() {
                if image.pixel(x, y) == colour {
                    voxels.push((x, y));
                }
            }
        }
        let indexer = PointIndexer::from_points(image.width(), image.height(), &voxels);
        let mut nn = Vec::with_capacity(4 * voxels.len());
        for (i, &(x, y)) in voxels.iter().enumerate() {
            let (xi, yi) = (x as i64, y as i64);
            for (dx, dy) in [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)] {
                let neighbour = image
                    .colour_at(xi + dx, yi + dy)
                    .filter(|&c| c == colour)
                    .and_then(|_| {
                        indexer.index_of((xi + dx) as usize, (yi + dy) as usize)
                    });
                nn.push(neighbour.unwrap_or(i));
            }
        }
        Self {
            id: id.into(),
            colour,
            voxels,
            nn,
            image_width: image.width(),
            image_height: image.height(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn colour(&self) -> u32 {
        self.colour
    }

    pub fn n_voxels(&self) -> usize {
        self.voxels.len()
    }

    pub fn voxels(&self) -> &[(usize, usize)] {
        &self.voxels
    }

    #[inline]
    pub fn voxel(&self, i: usize) -> (usize, usize) {
        self.voxels[i]
    }

    pub fn image_width(&self) -> usize {
        self.image_width
    }

    pub fn image_height(&self) -> usize {
        self.image_height
    }

    #[inline]
    pub fn up_x(&self, i: usize) -> usize {
        self.nn[4 * i]
    }

    #[inline]
    pub fn dn_x(&self, i: usize) -> usize {
        self.nn[4 * i + 1]
    }

    #[inline]
    pub fn up_y(&self, i: usize) -> usize {
        self.nn[4 * i + 2]
    }

    #[inline]
    pub fn dn_y(&self, i: usize) -> usize {
        self.nn[4 * i + 3]
    }
}
