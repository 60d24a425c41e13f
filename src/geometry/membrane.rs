use crate::geometry::compartment::PixelCompartment;
use crate::geometry::image::LabelImage;
use crate::geometry::indexing::{OrderedIntPairIndex, PointIndexer};
use log::debug;

/// Orientation of the pixel face a membrane pair straddles. Determines which
/// voxel length converts a surface flux into a concentration change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FluxDirection {
    X,
    Y,
}

/// The interface between two adjacent compartments, as pairs of indices into
/// the two compartments' voxel arrays.
#[derive(Clone, Debug)]
pub struct PixelMembrane {
    id: String,
    comp_a: usize,
    comp_b: usize,
    pairs_x: Vec<(usize, usize)>,
    pairs_y: Vec<(usize, usize)>,
}

impl PixelMembrane {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Index of compartment A in the compartment list the membrane was built
    /// from.
    pub fn compartment_a(&self) -> usize {
        self.comp_a
    }

    pub fn compartment_b(&self) -> usize {
        self.comp_b
    }

    pub fn index_pairs(&self, direction: FluxDirection) -> &[(usize, usize)] {
        match direction {
            FluxDirection::X => &self.pairs_x,
            FluxDirection::Y => &self.pairs_y,
        }
    }

    pub fn n_pairs(&self) -> usize {
        self.pairs_x.len() + self.pairs_y.len()
    }
}

/// Find every membrane implied by the image: each unordered pair of adjacent
/// compartment colours becomes one membrane, its id derived from the two
/// compartment ids in list order.
pub fn build_membranes(
    image: &LabelImage,
    compartments: &[PixelCompartment],
) -> Vec<PixelMembrane> {
    let colour_to_comp = |colour: u32| compartments.iter().position(|c| c.colour() == colour);
    let indexers: Vec<PointIndexer> = compartments
        .iter()
        .map(|c| PointIndexer::from_points(image.width(), image.height(), c.voxels()))
        .collect();

    let mut membrane_index = OrderedIntPairIndex::new();
    let mut membranes: Vec<PixelMembrane> = Vec::new();

    let mut add_pair = |membranes: &mut Vec<PixelMembrane>,
                        membrane_index: &mut OrderedIntPairIndex,
                        ia: usize,
                        ib: usize,
                        pa: (usize, usize),
                        pb: (usize, usize),
                        direction: FluxDirection| {
        // canonical orientation: lower compartment index is side A
        let (ia, ib, pa, pb) = if ia <= ib {
            (ia, ib, pa, pb)
        } else {
            (ib, ia, pb, pa)
        };
        let m = membrane_index.find_or_insert(ia, ib);
        if m == membranes.len() {
            membranes.push(PixelMembrane {
                id: format!("{}_{}", compartments[ia].id(), compartments[ib].id()),
                comp_a: ia,
                comp_b: ib,
                pairs_x: Vec::new(),
                pairs_y: Vec::new(),
            });
        }
        let idx_a = indexers[ia].index_of(pa.0, pa.1).expect("voxel is indexed");
        let idx_b = indexers[ib].index_of(pb.0, pb.1).expect("voxel is indexed");
        match direction {
            FluxDirection::X => membranes[m].pairs_x.push((idx_a, idx_b)),
            FluxDirection::Y => membranes[m].pairs_y.push((idx_a, idx_b)),
        }
    };

    for y in 0..image.height() {
        for x in 0..image.width() {
            let c = image.pixel(x, y);
            if x + 1 < image.width() {
                let cx = image.pixel(x + 1, y);
                if cx != c {
                    if let (Some(ia), Some(ib)) = (colour_to_comp(c), colour_to_comp(cx)) {
                        add_pair(
                            &mut membranes,
                            &mut membrane_index,
                            ia,
                            ib,
                            (x, y),
                            (x + 1, y),
                            FluxDirection::X,
                        );
                    }
                }
            }
            if y + 1 < image.height() {
                let cy = image.pixel(x, y + 1);
                if cy != c {
                    if let (Some(ia), Some(ib)) = (colour_to_comp(c), colour_to_comp(cy)) {
                        add_pair(
                            &mut membranes,
                            &mut membrane_index,
                            ia,
                            ib,
                            (x, y),
                            (x, y + 1),
                            FluxDirection::Y,
                        );
                    }
                }
            }
        }
    }
    for m in &membranes {
        debug!(
            "membrane {}: {} x-pairs, {} y-pairs",
            m.id(),
            m.pairs_x.len(),
            m.pairs_y.len()
        );
    }
    membranes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_halves() -> (LabelImage, Vec<PixelCompartment>) {
        let mut img = LabelImage::filled(4, 2, 1);
        img.fill_rect(2, 0, 4, 2, 2);
        let comps = vec![
            PixelCompartment::new("left", &img, 1),
            PixelCompartment::new("right", &img, 2),
        ];
        (img, comps)
    }

    #[test]
    fn vertical_interface_yields_x_pairs() {
        let (img, comps) = two_halves();
        let membranes = build_membranes(&img, &comps);
        assert_eq!(membranes.len(), 1);
        let m = &membranes[0];
        assert_eq!(m.id(), "left_right");
        assert_eq!(m.index_pairs(FluxDirection::X).len(), 2);
        assert!(m.index_pairs(FluxDirection::Y).is_empty());
        // each pair joins the rightmost column of "left" to the leftmost of
        // "right": voxel (1,y) of left has in-compartment index 2*y+1
        for (row, &(ia, ib)) in m.index_pairs(FluxDirection::X).iter().enumerate() {
            assert_eq!(comps[0].voxel(ia), (1, row));
            assert_eq!(comps[1].voxel(ib), (2, row));
        }
    }

    #[test]
    fn nested_region_yields_both_directions() {
        let mut img = LabelImage::filled(4, 4, 1);
        img.fill_rect(1, 1, 3, 3, 2);
        let comps = vec![
            PixelCompartment::new("outer", &img, 1),
            PixelCompartment::new("inner", &img, 2),
        ];
        let membranes = build_membranes(&img, &comps);
        assert_eq!(membranes.len(), 1);
        let m = &membranes[0];
        // 2 columns x 2 sides in each direction
        assert_eq!(m.index_pairs(FluxDirection::X).len(), 4);
        assert_eq!(m.index_pairs(FluxDirection::Y).len(), 4);
    }
}
