//! Directional neighbour search over an electrode [`Layout`].
//!
//! For a source electrode and a cardinal direction the resolver sweeps a fan
//! of parallel rays across the source's full perpendicular extent:
//!
//! 1. Each ray starts on the bounding-box centre line, offset along the scan
//!    axis, and is first cast against the source itself to find the source's
//!    real boundary at that offset (not the bounding-box edge).
//! 2. From that boundary point the ray is cast again against every other
//!    electrode; the nearest crossing is that sample's candidate.
//! 3. Candidates are reduced to one record per target, and the closest target
//!    within `max_distance` wins.
//!
//! Sweeping the whole extent handles irregular and concave shapes, offsets,
//! and neighbours that touch only part of an edge.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{GeometryError, Point, Ray};
use crate::layout::{Electrode, Layout};

/// Default reach of a neighbour search, in layout units.
pub const DEFAULT_MAX_DISTANCE: f64 = 0.5;

/// Default number of rays per direction.
pub const DEFAULT_NUM_STEPS: usize = 20;

/// Fewer rays than this miss neighbours that touch a short stretch of edge.
pub const MIN_NUM_STEPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Up,
    Down,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Left,
        Direction::Up,
        Direction::Down,
        Direction::Right,
    ];

    pub fn unit(self) -> Point {
        match self {
            Direction::Left => Point::new(-1.0, 0.0),
            Direction::Up => Point::new(0.0, 1.0),
            Direction::Down => Point::new(0.0, -1.0),
            Direction::Right => Point::new(1.0, 0.0),
        }
    }

    pub fn is_horizontal(self) -> bool {
        matches!(self, Direction::Left | Direction::Right)
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Left => Direction::Right,
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Right => Direction::Left,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Left => "left",
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Right => "right",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Direction::Left),
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "right" => Ok(Direction::Right),
            other => Err(format!("unknown direction `{}` (expected left|up|down|right)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighbourResult {
    pub source: String,
    pub direction: Direction,
    pub target: String,
    /// Gap between the source boundary and the target, `<= max_distance`.
    pub distance: f64,
}

/// Direction -> neighbouring electrode id.
pub type NeighbourMap = BTreeMap<Direction, String>;

fn default_num_steps() -> usize {
    DEFAULT_NUM_STEPS
}

fn default_max_distance() -> f64 {
    DEFAULT_MAX_DISTANCE
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Rays cast per direction across the source's perpendicular extent.
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    /// Reach used by the convenience queries that take no explicit distance.
    #[serde(default = "default_max_distance")]
    pub max_distance: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            num_steps: DEFAULT_NUM_STEPS,
            max_distance: DEFAULT_MAX_DISTANCE,
        }
    }
}

impl ResolverConfig {
    pub fn with_num_steps(mut self, n: usize) -> Self {
        self.num_steps = n;
        self
    }

    pub fn with_max_distance(mut self, d: f64) -> Self {
        self.max_distance = d;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct NeighbourResolver {
    cfg: ResolverConfig,
}

impl NeighbourResolver {
    pub fn new(cfg: ResolverConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.cfg
    }

    pub fn max_distance(&self) -> f64 {
        self.cfg.max_distance
    }

    fn num_steps(&self) -> usize {
        self.cfg.num_steps.max(MIN_NUM_STEPS)
    }

    /// Nearest electrode from `source_id` towards `direction`.
    ///
    /// Returns `Ok(None)` when the source is unknown, the layout is empty, or
    /// nothing lies within `max_distance`. Fails only when the source's own
    /// polygon is malformed.
    pub fn find_neighbour(
        &self,
        layout: &Layout,
        source_id: &str,
        direction: Direction,
        max_distance: f64,
    ) -> Result<Option<NeighbourResult>, GeometryError> {
        let Some(source) = layout.get(source_id) else {
            return Ok(None);
        };
        if let Some(err) = layout.geometry_error(source_id) {
            return Err(err);
        }

        let candidates = self.candidates(layout, source, direction, max_distance);
        let best = candidates
            .into_iter()
            // Ties keep the first candidate found.
            .reduce(|best, c| if c.1 < best.1 { c } else { best });

        Ok(best
            .filter(|&(_, d)| d <= max_distance)
            .map(|(target, distance)| NeighbourResult {
                source: source_id.to_string(),
                direction,
                target: layout.electrodes()[target].id().to_string(),
                distance,
            }))
    }

    /// Neighbours in every direction that has one.
    pub fn find_all_neighbours(
        &self,
        layout: &Layout,
        source_id: &str,
        max_distance: f64,
    ) -> Result<NeighbourMap, GeometryError> {
        let mut out = NeighbourMap::new();
        for dir in Direction::ALL {
            if let Some(n) = self.find_neighbour(layout, source_id, dir, max_distance)? {
                out.insert(dir, n.target);
            }
        }
        Ok(out)
    }

    /// Neighbour map for every well-formed electrode in the layout.
    pub fn neighbour_table(
        &self,
        layout: &Layout,
        max_distance: f64,
    ) -> BTreeMap<String, NeighbourMap> {
        let row = |e: &Electrode| {
            self.find_all_neighbours(layout, e.id(), max_distance)
                .ok()
                .map(|m| (e.id().to_string(), m))
        };

        #[cfg(feature = "parallel")]
        {
            layout.electrodes().par_iter().filter_map(row).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            layout.electrodes().iter().filter_map(row).collect()
        }
    }

    /// One `(electrode index, distance)` per reachable target, in the order
    /// targets were first seen.
    fn candidates(
        &self,
        layout: &Layout,
        source: &Electrode,
        direction: Direction,
        max_distance: f64,
    ) -> Vec<(usize, f64)> {
        let mut found: Vec<(usize, f64)> = Vec::new();
        let Some(bounds) = source.bounds() else {
            return found;
        };

        let dir = direction.unit();
        let center = bounds.center();
        let extent = if direction.is_horizontal() {
            bounds.height()
        } else {
            bounds.width()
        };
        let n = self.num_steps();
        let step = extent / n as f64;

        for i in 0..n {
            // Midpoints of n equal slices, so no ray starts on a corner.
            let offset = -0.5 * extent + step * (i as f64 + 0.5);
            let origin = if direction.is_horizontal() {
                Point::new(center.x, center.y + offset)
            } else {
                Point::new(center.x + offset, center.y)
            };

            let Some(edge_t) = source.world_shape().nearest_hit(&Ray::new(origin, dir)) else {
                continue;
            };
            let probe = Ray::new(Ray::new(origin, dir).at(edge_t), dir);

            let Some((target, distance)) = nearest_other(layout, source.id(), &probe, max_distance)
            else {
                continue;
            };

            match found.iter_mut().find(|(idx, _)| *idx == target) {
                Some(entry) => entry.1 = entry.1.min(distance),
                None => found.push((target, distance)),
            }
        }

        debug!(
            "{} {}: {} candidate(s) from {} rays",
            source.id(),
            direction,
            found.len(),
            n
        );
        found
    }
}

/// Nearest electrode other than `source_id` crossed by `ray` within `max_t`.
/// Malformed electrodes are not tested.
fn nearest_other(
    layout: &Layout,
    source_id: &str,
    ray: &Ray,
    max_t: f64,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, e) in layout.electrodes().iter().enumerate() {
        if e.id() == source_id || layout.geometry_error(e.id()).is_some() {
            continue;
        }
        match e.bounds() {
            Some(b) if b.may_hit(ray, max_t) => {}
            _ => continue,
        }
        if let Some(t) = e.world_shape().nearest_hit(ray) {
            if t <= max_t && best.map_or(true, |(_, d)| t < d) {
                best = Some((i, t));
            }
        }
    }
    best
}
