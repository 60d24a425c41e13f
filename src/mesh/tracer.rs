use crate::geometry::LabelImage;
use crate::mesh::boundary::Boundary;
use glam::DVec2;
use log::{debug, trace};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeometryError {
    /// The contour walk arrived at a corner with no admissible continuation.
    /// This means the traced region mask is inconsistent; continuing with a
    /// default direction would silently corrupt the geometry.
    #[error("contour orientation not recognized at corner ({0}, {1})")]
    InvalidContour(usize, usize),
}

type Corner = (usize, usize);

/// Directions on the corner lattice, in screen coordinates (y down):
/// 0 = +x, 1 = +y, 2 = -x, 3 = -y.
const DELTAS: [(i64, i64); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

#[derive(Clone, Copy, Debug)]
struct DirectedEdge {
    corner: Corner,
    dir: u8,
}

impl DirectedEdge {
    fn end(&self) -> Corner {
        let (dx, dy) = DELTAS[self.dir as usize];
        (
            (self.corner.0 as i64 + dx) as usize,
            (self.corner.1 as i64 + dy) as usize,
        )
    }
}

/// All directed boundary edges of the mask `colour`, oriented so that the
/// region lies on a consistent side. Edges live on the (w+1)x(h+1) corner
/// lattice, so two adjacent regions produce geometrically coincident but
/// independently traceable boundaries.
fn boundary_edges(image: &LabelImage, colour: u32) -> Vec<DirectedEdge> {
    let mut edges = Vec::new();
    for y in 0..image.height() {
        for x in 0..image.width() {
            if image.pixel(x, y) != colour {
                continue;
            }
            let (xi, yi) = (x as i64, y as i64);
            if image.colour_at(xi, yi - 1) != Some(colour) {
                edges.push(DirectedEdge { corner: (x, y), dir: 0 });
            }
            if image.colour_at(xi + 1, yi) != Some(colour) {
                edges.push(DirectedEdge { corner: (x + 1, y), dir: 1 });
            }
            if image.colour_at(xi, yi + 1) != Some(colour) {
                edges.push(DirectedEdge { corner: (x + 1, y + 1), dir: 2 });
            }
            if image.colour_at(xi - 1, yi) != Some(colour) {
                edges.push(DirectedEdge { corner: (x, y + 1), dir: 3 });
            }
        }
    }
    edges
}

/// Chain the directed edges of one colour mask into closed corner contours.
///
/// At a pinch corner (two diagonally-touching regions of the same colour)
/// more than one continuation exists; the walk prefers the sharpest turn
/// that keeps the region on the same side, which keeps the two contours
/// separate. No admissible continuation is a hard error, never a guess.
fn chain_contours(
    image: &LabelImage,
    colour: u32,
) -> Result<Vec<Vec<Corner>>, GeometryError> {
    let edges = boundary_edges(image, colour);
    let mut by_corner: HashMap<Corner, Vec<usize>> = HashMap::new();
    for (i, e) in edges.iter().enumerate() {
        by_corner.entry(e.corner).or_default().push(i);
    }
    let mut used = vec![false; edges.len()];
    let mut contours = Vec::new();

    for start in 0..edges.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let start_corner = edges[start].corner;
        let mut contour = vec![start_corner];
        let mut current = edges[start];
        loop {
            let end = current.end();
            if end == start_corner {
                break;
            }
            contour.push(end);
            // preference: right turn, straight on, left turn
            let preferred = [
                (current.dir + 1) % 4,
                current.dir,
                (current.dir + 3) % 4,
            ];
            let next = preferred.iter().find_map(|&dir| {
                by_corner
                    .get(&end)?
                    .iter()
                    .find(|&&i| !used[i] && edges[i].dir == dir)
                    .copied()
            });
            let Some(next) = next else {
                return Err(GeometryError::InvalidContour(end.0, end.1));
            };
            used[next] = true;
            current = edges[next];
        }
        trace!("colour {colour:x}: contour with {} corners", contour.len());
        contours.push(contour);
    }
    Ok(contours)
}

/// A corner is a fixed point when three or more distinct colours (counting
/// the exterior) meet there. Fixed points anchor the endpoints of open
/// boundaries shared between compartments.
fn is_fixed_point(image: &LabelImage, corner: Corner) -> bool {
    let (cx, cy) = (corner.0 as i64, corner.1 as i64);
    let mut colours: Vec<Option<u32>> = [
        (cx - 1, cy - 1),
        (cx, cy - 1),
        (cx - 1, cy),
        (cx, cy),
    ]
    .into_iter()
    .map(|(x, y)| image.colour_at(x, y))
    .collect();
    colours.sort();
    colours.dedup();
    colours.len() >= 3
}

fn is_cyclic_permutation(a: &[Corner], b: &[Corner]) -> bool {
    if a.len() != b.len() || a.is_empty() {
        return a.len() == b.len();
    }
    let n = a.len();
    let check = |rev: bool| {
        (0..n).any(|shift| {
            (0..n).all(|i| {
                let j = if rev { (n - i) % n } else { i };
                a[i] == b[(j + shift) % n]
            })
        })
    };
    check(false) || check(true)
}

fn same_line(a: &[Corner], b: &[Corner]) -> bool {
    a == b || a.iter().rev().eq(b.iter())
}

/// Flip y so that the stored boundary points have their origin in the
/// bottom-left corner, matching the physical coordinate convention.
fn to_points_invert_y(corners: &[Corner], height: usize) -> Vec<DVec2> {
    corners
        .iter()
        .map(|&(x, y)| DVec2::new(x as f64, (height - y) as f64))
        .collect()
}

/// Extract the ordered boundary polylines separating the compartments of a
/// segmented image.
///
/// Each compartment colour is traced on the corner lattice; contours
/// touching a fixed point are split into open boundaries between consecutive
/// fixed points, contours without one stay closed loops. Boundaries shared
/// by two compartments are reported once.
pub fn trace_boundaries(
    image: &LabelImage,
    compartment_colours: &[u32],
) -> Result<Vec<Boundary>, GeometryError> {
    let mut boundaries = Vec::new();
    if image.is_empty() {
        return Ok(boundaries);
    }
    let mut loops: Vec<Vec<Corner>> = Vec::new();
    let mut lines: Vec<Vec<Corner>> = Vec::new();
    for &colour in compartment_colours {
        for contour in chain_contours(image, colour)? {
            let first_fixed = contour.iter().position(|&c| is_fixed_point(image, c));
            match first_fixed {
                None => {
                    if !loops.iter().any(|l| is_cyclic_permutation(&contour, l)) {
                        debug!("colour {colour:x}: loop with {} points", contour.len());
                        boundaries.push(Boundary::new(
                            to_points_invert_y(&contour, image.height()),
                            true,
                        ));
                        loops.push(contour);
                    }
                }
                Some(start) => {
                    // rotate so the contour starts at a fixed point, then
                    // split into lines between consecutive fixed points
                    let mut rotated = contour;
                    rotated.rotate_left(start);
                    rotated.push(rotated[0]);
                    let mut line = vec![rotated[0]];
                    for &corner in &rotated[1..] {
                        line.push(corner);
                        if is_fixed_point(image, corner) {
                            if !lines.iter().any(|l| same_line(&line, l)) {
                                debug!(
                                    "colour {colour:x}: line with {} points",
                                    line.len()
                                );
                                boundaries.push(Boundary::new(
                                    to_points_invert_y(&line, image.height()),
                                    false,
                                ));
                                lines.push(std::mem::take(&mut line));
                            } else {
                                line.clear();
                            }
                            line.push(corner);
                        }
                    }
                }
            }
        }
    }
    Ok(boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_image_yields_no_boundaries() {
        let img = LabelImage::from_pixels(0, 0, vec![]);
        assert!(trace_boundaries(&img, &[]).unwrap().is_empty());
    }

    #[test]
    fn single_region_yields_one_loop() {
        let img = LabelImage::filled(5, 3, 1);
        let boundaries = trace_boundaries(&img, &[1]).unwrap();
        assert_eq!(boundaries.len(), 1);
        assert!(boundaries[0].is_loop());
        // the full-resolution rectangle reduces to its 4 corners
        assert_eq!(boundaries[0].points().len(), 4);
    }

    #[test]
    fn single_interior_region_yields_one_loop() {
        let mut img = LabelImage::filled(8, 8, 0);
        img.fill_rect(2, 2, 6, 6, 1);
        let boundaries = trace_boundaries(&img, &[1]).unwrap();
        assert_eq!(boundaries.len(), 1);
        assert!(boundaries[0].is_loop());
    }

    #[test]
    fn two_compartments_split_at_fixed_points() {
        // left/right halves: the exterior turns the two junction corners
        // into fixed points, so each half contributes open lines and the
        // shared interface is reported once
        let mut img = LabelImage::filled(4, 2, 1);
        img.fill_rect(2, 0, 4, 2, 2);
        let boundaries = trace_boundaries(&img, &[1, 2]).unwrap();
        assert_eq!(boundaries.len(), 3);
        assert!(boundaries.iter().all(|b| !b.is_loop()));
        // the shared membrane line runs between the two fixed corners
        let shared: Vec<_> = boundaries
            .iter()
            .filter(|b| b.points().iter().all(|p| p.x == 2.0))
            .collect();
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn nested_compartments_share_one_loop() {
        let mut img = LabelImage::filled(8, 8, 1);
        img.fill_rect(2, 2, 6, 6, 2);
        let boundaries = trace_boundaries(&img, &[1, 2]).unwrap();
        // outer image border loop + one shared inner loop (deduplicated)
        assert_eq!(boundaries.len(), 2);
        assert!(boundaries.iter().all(|b| b.is_loop()));
    }

    #[test]
    fn diagonal_pinch_traces_two_separate_contours() {
        let mut img = LabelImage::filled(2, 2, 0);
        img.fill_rect(0, 0, 1, 1, 5);
        img.fill_rect(1, 1, 2, 2, 5);
        let contours = chain_contours(&img, 5).unwrap();
        assert_eq!(contours.len(), 2);
        assert!(contours.iter().all(|c| c.len() == 4));
    }
}
