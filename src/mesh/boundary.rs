use glam::DVec2;
use log::trace;

/// Area of the triangle spanned by three points. This is the Visvalingam
/// "effective area" of the middle vertex: how much the boundary shape changes
/// if it is removed.
#[inline]
fn triangle_area(a: DVec2, b: DVec2, c: DVec2) -> f64 {
    0.5 * ((b - a).perp_dot(c - a)).abs()
}

const DEGENERATE_AREA: f64 = 1e-9;

/// An ordered polyline approximating the pixel-level edge of a region.
///
/// Holds both the full-resolution traced points and the simplified working
/// set, so raising `max_points` back above the original count restores the
/// original points exactly. Open boundaries keep both endpoints fixed.
#[derive(Clone, Debug)]
pub struct Boundary {
    all_points: Vec<DVec2>,
    points: Vec<DVec2>,
    is_loop: bool,
    max_points: usize,
}

impl Boundary {
    /// Construct from traced corner points. Zero-length segments and
    /// collinear interior vertices are dropped up front; the result is the
    /// full-resolution point set that simplification operates on.
    pub fn new(traced: Vec<DVec2>, is_loop: bool) -> Self {
        let mut all_points = dedup_consecutive(traced, is_loop);
        remove_degenerate_vertices(&mut all_points, is_loop);
        let max_points = all_points.len();
        trace!(
            "boundary with {} points after degeneracy removal, loop={}",
            max_points, is_loop
        );
        Self {
            points: all_points.clone(),
            all_points,
            is_loop,
            max_points,
        }
    }

    pub fn is_loop(&self) -> bool {
        self.is_loop
    }

    pub fn points(&self) -> &[DVec2] {
        &self.points
    }

    /// The full-resolution point set, before any `max_points` cap.
    pub fn all_points(&self) -> &[DVec2] {
        &self.all_points
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    /// Simplify down to at most `max_points` points by iteratively removing
    /// the vertex whose removal introduces the smallest-area triangle with
    /// its neighbours, recomputing areas after each removal. A cap at or
    /// above the full-resolution count restores the original point set.
    pub fn set_max_points(&mut self, max_points: usize) {
        self.max_points = max_points;
        self.points = self.all_points.clone();
        let min_points = if self.is_loop { 3 } else { 2 };
        let target = max_points.max(min_points);
        while self.points.len() > target {
            let Some(i) = self.least_important_vertex() else {
                break;
            };
            self.points.remove(i);
        }
    }

    /// Index of the removable vertex with the smallest effective area, if
    /// any.
    fn least_important_vertex(&self) -> Option<usize> {
        let n = self.points.len();
        let mut best: Option<(usize, f64)> = None;
        let candidates: Box<dyn Iterator<Item = usize>> = if self.is_loop {
            Box::new(0..n)
        } else {
            // endpoints of an open boundary are pinned
            Box::new(1..n.saturating_sub(1))
        };
        for i in candidates {
            let prev = self.points[(i + n - 1) % n];
            let next = self.points[(i + 1) % n];
            let area = triangle_area(prev, self.points[i], next);
            if best.is_none_or(|(_, a)| area < a) {
                best = Some((i, area));
            }
        }
        best.map(|(i, _)| i)
    }
}

fn dedup_consecutive(mut points: Vec<DVec2>, is_loop: bool) -> Vec<DVec2> {
    points.dedup();
    if is_loop && points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points
}

/// Remove interior vertices that are collinear with their neighbours (within
/// tolerance). For loops every vertex is a candidate; for open lines the
/// endpoints stay.
fn remove_degenerate_vertices(points: &mut Vec<DVec2>, is_loop: bool) {
    let min_points = if is_loop { 3 } else { 2 };
    loop {
        let n = points.len();
        if n <= min_points {
            return;
        }
        let range: Box<dyn Iterator<Item = usize>> = if is_loop {
            Box::new(0..n)
        } else {
            Box::new(1..n - 1)
        };
        let mut removed = false;
        for i in range {
            let prev = points[(i + n - 1) % n];
            let next = points[(i + 1) % n];
            if triangle_area(prev, points[i], next) < DEGENERATE_AREA {
                points.remove(i);
                removed = true;
                break;
            }
        }
        if !removed {
            return;
        }
    }
}
