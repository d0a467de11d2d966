//! Planar geometry used by neighbour search: points, bounding boxes, rays and
//! simple polygons.
//!
//! All coordinates live in the layout plane. Polygons are stored in their
//! local frame; [`Polygon::translated`] produces the world-space copy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance for parallel tests and boundary hits.
pub const EPSILON: f64 = 1e-9;

/// Polygons with an absolute area below this are treated as degenerate.
pub const MIN_AREA: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn add(self, other: Point) -> Point {
        Point::new(self.x + other.x, self.y + other.y)
    }

    pub fn sub(self, other: Point) -> Point {
        Point::new(self.x - other.x, self.y - other.y)
    }

    pub fn scale(self, k: f64) -> Point {
        Point::new(self.x * k, self.y * k)
    }

    /// z-component of the 3D cross product.
    pub fn cross(self, other: Point) -> f64 {
        self.x * other.y - self.y * other.x
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point,
    pub max: Point,
}

impl Aabb {
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = *points.first()?;
        let mut b = Aabb {
            min: first,
            max: first,
        };
        for p in &points[1..] {
            b.min.x = b.min.x.min(p.x);
            b.min.y = b.min.y.min(p.y);
            b.max.x = b.max.x.max(p.x);
            b.max.y = b.max.y.max(p.y);
        }
        Some(b)
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
        )
    }

    /// Slab test: can `ray` touch this box at a parameter in `[0, max_t]`?
    ///
    /// Used as a cheap prefilter before testing individual edges.
    pub fn may_hit(&self, ray: &Ray, max_t: f64) -> bool {
        let mut t0 = -EPSILON;
        let mut t1 = max_t + EPSILON;

        for (o, d, lo, hi) in [
            (ray.origin.x, ray.dir.x, self.min.x, self.max.x),
            (ray.origin.y, ray.dir.y, self.min.y, self.max.y),
        ] {
            if d.abs() < EPSILON {
                if o < lo - EPSILON || o > hi + EPSILON {
                    return false;
                }
                continue;
            }
            let (mut a, mut b) = ((lo - o) / d, (hi - o) / d);
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            t0 = t0.max(a - EPSILON);
            t1 = t1.min(b + EPSILON);
            if t0 > t1 {
                return false;
            }
        }
        true
    }
}

/// Half-line `origin + t * dir`, `t >= 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Point,
    pub dir: Point,
}

impl Ray {
    pub fn new(origin: Point, dir: Point) -> Self {
        Self { origin, dir }
    }

    pub fn at(&self, t: f64) -> Point {
        self.origin.add(self.dir.scale(t))
    }

    /// Distance along the ray to segment `a..b`.
    ///
    /// Returns `None` for misses and for segments parallel to the ray: a ray
    /// sliding along a collinear edge has no well-defined first contact, so
    /// those grazing hits are not reported.
    pub fn hit_segment(&self, a: Point, b: Point) -> Option<f64> {
        let edge = b.sub(a);
        let denom = self.dir.cross(edge);
        if denom.abs() < EPSILON {
            return None;
        }
        let w = a.sub(self.origin);
        let t = w.cross(edge) / denom;
        let u = w.cross(self.dir) / denom;
        if t < -EPSILON || !(-EPSILON..=1.0 + EPSILON).contains(&u) {
            return None;
        }
        Some(t.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("polygon has {0} vertices, at least 3 are required")]
    TooFewVertices(usize),
    #[error("polygon encloses zero area")]
    ZeroArea,
    #[error("polygon edges {0} and {1} cross")]
    SelfIntersecting(usize, usize),
}

/// Simple polygon given by its vertices in order (either winding).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle with its lower-left corner at `(x, y)`.
    pub fn rect(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self::new(vec![
            Point::new(x, y),
            Point::new(x + w, y),
            Point::new(x + w, y + h),
            Point::new(x, y + h),
        ])
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Closed edge loop, last vertex wrapping to the first.
    pub fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| (self.points[i], self.points[(i + 1) % n]))
    }

    pub fn translated(&self, offset: Point) -> Polygon {
        Polygon::new(self.points.iter().map(|p| p.add(offset)).collect())
    }

    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(&self.points)
    }

    /// Shoelace area; positive for counter-clockwise winding.
    pub fn signed_area(&self) -> f64 {
        if self.points.len() < 3 {
            return 0.0;
        }
        0.5 * self.edges().map(|(a, b)| a.cross(b)).sum::<f64>()
    }

    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    /// Nearest crossing of `ray` with this polygon's boundary, if any.
    pub fn nearest_hit(&self, ray: &Ray) -> Option<f64> {
        self.edges()
            .filter_map(|(a, b)| ray.hit_segment(a, b))
            .min_by(f64::total_cmp)
    }

    /// Checks that the polygon is simple and encloses area.
    pub fn validate(&self) -> Result<(), GeometryError> {
        let n = self.points.len();
        if n < 3 {
            return Err(GeometryError::TooFewVertices(n));
        }
        let edges: Vec<(Point, Point)> = self.edges().collect();
        for i in 0..n {
            for j in (i + 1)..n {
                // Adjacent edges share a vertex by construction.
                if j == i + 1 || (i == 0 && j == n - 1) {
                    continue;
                }
                if segments_cross(edges[i], edges[j]) {
                    return Err(GeometryError::SelfIntersecting(i, j));
                }
            }
        }
        if self.area() < MIN_AREA {
            return Err(GeometryError::ZeroArea);
        }
        Ok(())
    }
}

fn orient(a: Point, b: Point, c: Point) -> f64 {
    b.sub(a).cross(c.sub(a))
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.x >= a.x.min(b.x) - EPSILON
        && p.x <= a.x.max(b.x) + EPSILON
        && p.y >= a.y.min(b.y) - EPSILON
        && p.y <= a.y.max(b.y) + EPSILON
}

fn segments_cross((p1, p2): (Point, Point), (q1, q2): (Point, Point)) -> bool {
    let d1 = orient(q1, q2, p1);
    let d2 = orient(q1, q2, p2);
    let d3 = orient(p1, p2, q1);
    let d4 = orient(p1, p2, q2);

    if ((d1 > EPSILON && d2 < -EPSILON) || (d1 < -EPSILON && d2 > EPSILON))
        && ((d3 > EPSILON && d4 < -EPSILON) || (d3 < -EPSILON && d4 > EPSILON))
    {
        return true;
    }

    (d1.abs() <= EPSILON && on_segment(q1, q2, p1))
        || (d2.abs() <= EPSILON && on_segment(q1, q2, p2))
        || (d3.abs() <= EPSILON && on_segment(p1, p2, q1))
        || (d4.abs() <= EPSILON && on_segment(p1, p2, q2))
}

/// Converts an area in square pixels to square millimetres.
pub fn px2_to_mm2(area_px: f64, ppi: f64) -> f64 {
    let mm_per_px = 25.4 / ppi;
    area_px * mm_per_px * mm_per_px
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_area_and_bounds() {
        let r = Polygon::rect(1.0, 2.0, 3.0, 4.0);
        assert!((r.area() - 12.0).abs() < 1e-12);
        let b = r.bounds().unwrap();
        assert_eq!(b.center(), Point::new(2.5, 4.0));
        assert_eq!(b.width(), 3.0);
        assert_eq!(b.height(), 4.0);
    }

    #[test]
    fn ray_hits_far_edge_from_inside() {
        let r = Polygon::rect(0.0, 0.0, 2.0, 1.0);
        let ray = Ray::new(Point::new(0.5, 0.5), Point::new(1.0, 0.0));
        let t = r.nearest_hit(&ray).unwrap();
        assert!((t - 1.5).abs() < 1e-12);
    }

    #[test]
    fn parallel_edges_are_not_hits() {
        let ray = Ray::new(Point::new(0.0, 1.0), Point::new(1.0, 0.0));
        assert_eq!(ray.hit_segment(Point::new(1.0, 1.0), Point::new(2.0, 1.0)), None);
    }

    #[test]
    fn touching_edge_reports_zero_distance() {
        let ray = Ray::new(Point::new(2.0, 0.5), Point::new(1.0, 0.0));
        assert_eq!(ray.hit_segment(Point::new(2.0, 0.0), Point::new(2.0, 1.0)), Some(0.0));
    }

    #[test]
    fn validate_rejects_bowtie_and_slivers() {
        let bowtie = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(1.0, 0.0),
            Point::new(0.0, 1.0),
        ]);
        assert!(matches!(
            bowtie.validate(),
            Err(GeometryError::SelfIntersecting(_, _))
        ));

        let line = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(2.0, 0.0),
        ]);
        assert_eq!(line.validate(), Err(GeometryError::ZeroArea));

        let pair = Polygon::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0)]);
        assert_eq!(pair.validate(), Err(GeometryError::TooFewVertices(2)));

        assert!(Polygon::rect(0.0, 0.0, 1.0, 1.0).validate().is_ok());
    }

    #[test]
    fn concave_polygon_is_simple() {
        // L-shape
        let l = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(2.0, 1.0),
            Point::new(1.0, 1.0),
            Point::new(1.0, 2.0),
            Point::new(0.0, 2.0),
        ]);
        assert!(l.validate().is_ok());
        assert!((l.area() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn slab_prefilter() {
        let b = Aabb::from_points(&[Point::new(2.0, 0.0), Point::new(3.0, 1.0)]).unwrap();
        let right = Ray::new(Point::new(0.0, 0.5), Point::new(1.0, 0.0));
        assert!(b.may_hit(&right, 10.0));
        assert!(!b.may_hit(&right, 1.0));
        let left = Ray::new(Point::new(0.0, 0.5), Point::new(-1.0, 0.0));
        assert!(!b.may_hit(&left, 10.0));
    }

    #[test]
    fn px_area_conversion_at_96_ppi() {
        let mm2 = px2_to_mm2(96.0 * 96.0, 96.0);
        assert!((mm2 - 25.4 * 25.4).abs() < 1e-9);
    }
}
