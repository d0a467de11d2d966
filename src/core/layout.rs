//! Electrode layout: the indexed set of electrode shapes for one device.
//!
//! A [`Layout`] is immutable once built. Replacing the device replaces the
//! whole layout; per-electrode on/off state lives with the selection
//! controller, not here.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::geometry::{px2_to_mm2, Aabb, GeometryError, Point, Polygon};

/// Hardware channel as published by the device model (string or number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Channel {
    Number(i64),
    Text(String),
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("duplicate electrode id `{0}`")]
    DuplicateId(String),
    #[error("invalid layout payload: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Wire shape of one entry in the device model's `three-object` payload.
///
/// Unknown fields (render hints, z coordinates) are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectrodeRecord {
    pub id: String,
    #[serde(default)]
    pub channel: Option<Channel>,
    /// Area in mm² as entered by the user, overriding the polygon's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    pub shape: Polygon,
    #[serde(default)]
    pub translation: Point,
}

#[derive(Debug, Clone)]
pub struct Electrode {
    id: String,
    channel: Option<Channel>,
    area: Option<f64>,
    shape: Polygon,
    translation: Point,
    // World-space copy of `shape`, cached for ray casting.
    world: Polygon,
    bounds: Option<Aabb>,
}

impl Electrode {
    pub fn new(id: impl Into<String>, shape: Polygon, translation: Point) -> Self {
        let world = shape.translated(translation);
        let bounds = world.bounds();
        Self {
            id: id.into(),
            channel: None,
            area: None,
            shape,
            translation,
            world,
            bounds,
        }
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn set_channel(&mut self, channel: Option<Channel>) {
        self.channel = channel;
    }

    pub fn set_area_mm2(&mut self, area: Option<f64>) {
        self.area = area;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn shape(&self) -> &Polygon {
        &self.shape
    }

    pub fn translation(&self) -> Point {
        self.translation
    }

    pub fn world_shape(&self) -> &Polygon {
        &self.world
    }

    /// World-space bounding box; `None` only for an empty polygon.
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    /// Enclosed area in layout units squared.
    pub fn area(&self) -> f64 {
        self.shape.area()
    }

    /// Stored area if one was set, else the enclosed area in mm² treating
    /// layout units as pixels at `ppi`.
    pub fn area_mm2(&self, ppi: f64) -> f64 {
        self.area.unwrap_or_else(|| px2_to_mm2(self.area(), ppi))
    }

    pub fn to_record(&self) -> ElectrodeRecord {
        ElectrodeRecord {
            id: self.id.clone(),
            channel: self.channel.clone(),
            area: self.area,
            shape: self.shape.clone(),
            translation: self.translation,
        }
    }
}

impl From<ElectrodeRecord> for Electrode {
    fn from(r: ElectrodeRecord) -> Self {
        let mut e = Electrode::new(r.id, r.shape, r.translation);
        e.channel = r.channel;
        e.area = r.area;
        e
    }
}

#[derive(Debug, Clone, Default)]
pub struct Layout {
    electrodes: Vec<Electrode>,
    index: HashMap<String, usize>,
    malformed: HashMap<String, GeometryError>,
}

impl Layout {
    /// Builds a layout, rejecting duplicate ids.
    ///
    /// Malformed polygons are kept but flagged; neighbour search skips them.
    pub fn new(electrodes: Vec<Electrode>) -> Result<Self, LayoutError> {
        let mut index = HashMap::with_capacity(electrodes.len());
        let mut malformed = HashMap::new();

        for (i, e) in electrodes.iter().enumerate() {
            if index.insert(e.id.clone(), i).is_some() {
                return Err(LayoutError::DuplicateId(e.id.clone()));
            }
            if let Err(err) = e.shape.validate() {
                warn!("Electrode {} has malformed geometry: {}", e.id, err);
                malformed.insert(e.id.clone(), err);
            }
        }

        Ok(Self {
            electrodes,
            index,
            malformed,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<ElectrodeRecord>) -> Result<Self, LayoutError> {
        Self::new(records.into_iter().map(Electrode::from).collect())
    }

    /// Parses a `three-object` payload (a JSON array of electrode records).
    pub fn from_value(value: serde_json::Value) -> Result<Self, LayoutError> {
        let records: Vec<ElectrodeRecord> = serde_json::from_value(value)?;
        Self::from_records(records)
    }

    pub fn from_json(text: &str) -> Result<Self, LayoutError> {
        let records: Vec<ElectrodeRecord> = serde_json::from_str(text)?;
        Self::from_records(records)
    }

    pub fn to_value(&self) -> serde_json::Value {
        let records: Vec<ElectrodeRecord> = self.electrodes.iter().map(|e| e.to_record()).collect();
        serde_json::to_value(records).unwrap_or(serde_json::Value::Null)
    }

    /// Copy of this layout with `edit` applied to electrode `id`.
    ///
    /// Only metadata setters are reachable through `&mut Electrode`, so the
    /// index and geometry flags stay valid.
    pub fn edited(&self, id: &str, edit: impl FnOnce(&mut Electrode)) -> Option<Layout> {
        let i = *self.index.get(id)?;
        let mut next = self.clone();
        edit(&mut next.electrodes[i]);
        Some(next)
    }

    pub fn get(&self, id: &str) -> Option<&Electrode> {
        self.index.get(id).map(|&i| &self.electrodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn electrodes(&self) -> &[Electrode] {
        &self.electrodes
    }

    pub fn iter(&self) -> impl Iterator<Item = &Electrode> {
        self.electrodes.iter()
    }

    pub fn len(&self) -> usize {
        self.electrodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.electrodes.is_empty()
    }

    pub fn geometry_error(&self, id: &str) -> Option<GeometryError> {
        self.malformed.get(id).copied()
    }

    /// Electrodes whose polygons failed validation, sorted by id.
    pub fn malformed(&self) -> Vec<(&str, GeometryError)> {
        let mut out: Vec<(&str, GeometryError)> = self
            .malformed
            .iter()
            .map(|(id, err)| (id.as_str(), *err))
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }
}

/// `rows x cols` grid of unit squares named `e{row}{col}`, row 0 at the top.
/// Grids wider or taller than ten cells use `e{row}_{col}`.
///
/// Cell `e{r}{c}` spans `x in [c, c+1]`, `y in [-r-1, -r]` so "up" decreases
/// the row index and "right" increases the column index.
pub fn unit_grid(rows: usize, cols: usize) -> Layout {
    let wide = rows > 10 || cols > 10;
    let mut electrodes = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            let id = if wide {
                format!("e{}_{}", r, c)
            } else {
                format!("e{}{}", r, c)
            };
            electrodes.push(
                Electrode::new(
                    id,
                    Polygon::rect(0.0, 0.0, 1.0, 1.0),
                    Point::new(c as f64, -(r as f64) - 1.0),
                )
                .with_channel(Channel::Number((r * cols + c) as i64)),
            );
        }
    }
    // Names are unique by construction.
    Layout::new(electrodes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_rejected() {
        let a = Electrode::new("a", Polygon::rect(0.0, 0.0, 1.0, 1.0), Point::ORIGIN);
        let b = Electrode::new("a", Polygon::rect(2.0, 0.0, 1.0, 1.0), Point::ORIGIN);
        assert!(matches!(
            Layout::new(vec![a, b]),
            Err(LayoutError::DuplicateId(id)) if id == "a"
        ));
    }

    #[test]
    fn world_bounds_include_translation() {
        let e = Electrode::new("a", Polygon::rect(0.0, 0.0, 2.0, 1.0), Point::new(10.0, 5.0));
        let b = e.bounds().unwrap();
        assert_eq!(b.min, Point::new(10.0, 5.0));
        assert_eq!(b.max, Point::new(12.0, 6.0));
    }

    #[test]
    fn parses_three_object_payload() {
        let payload = serde_json::json!([
            {
                "id": "electrode000",
                "channel": 12,
                "area": 4.2,
                "shape": [{"x": 0, "y": 0}, {"x": 2, "y": 0}, {"x": 2, "y": 2}, {"x": 0, "y": 2, "z": 0}],
                "translation": {"x": 1, "y": 1, "z": 0}
            },
            {
                "id": "electrode001",
                "channel": "A3",
                "shape": [{"x": 0, "y": 0}, {"x": 1, "y": 0}, {"x": 1, "y": 1}]
            }
        ]);
        let layout = Layout::from_value(payload).unwrap();
        assert_eq!(layout.len(), 2);
        let e = layout.get("electrode000").unwrap();
        assert_eq!(e.channel(), Some(&Channel::Number(12)));
        assert_eq!(e.translation(), Point::new(1.0, 1.0));
        assert!((e.area() - 4.0).abs() < 1e-12);
        assert_eq!(
            layout.get("electrode001").unwrap().channel(),
            Some(&Channel::Text("A3".to_string()))
        );
        assert_eq!(layout.get("electrode001").unwrap().translation(), Point::ORIGIN);
    }

    #[test]
    fn records_survive_serialisation() {
        let layout = unit_grid(2, 2);
        let back = Layout::from_value(layout.to_value()).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(
            back.get("e11").unwrap().bounds(),
            layout.get("e11").unwrap().bounds()
        );
    }

    #[test]
    fn malformed_shapes_are_flagged_not_rejected() {
        let good = Electrode::new("good", Polygon::rect(0.0, 0.0, 1.0, 1.0), Point::ORIGIN);
        let bad = Electrode::new(
            "bad",
            Polygon::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]),
            Point::ORIGIN,
        );
        let layout = Layout::new(vec![good, bad]).unwrap();
        assert_eq!(layout.len(), 2);
        assert_eq!(
            layout.geometry_error("bad"),
            Some(GeometryError::TooFewVertices(2))
        );
        assert_eq!(layout.geometry_error("good"), None);
        assert_eq!(layout.malformed().len(), 1);
    }

    #[test]
    fn grid_naming_and_placement() {
        let g = unit_grid(3, 3);
        assert_eq!(g.len(), 9);
        let b = g.get("e12").unwrap().bounds().unwrap();
        assert_eq!(b.min, Point::new(2.0, -2.0));
        assert_eq!(b.max, Point::new(3.0, -1.0));
    }

    #[test]
    fn edits_touch_only_the_target() {
        let g = unit_grid(2, 2);
        let edited = g
            .edited("e01", |e| {
                e.set_channel(Some(Channel::Text("A7".to_string())));
                e.set_area_mm2(Some(2.5));
            })
            .unwrap();
        let e = edited.get("e01").unwrap();
        assert_eq!(e.channel(), Some(&Channel::Text("A7".to_string())));
        assert_eq!(e.area_mm2(96.0), 2.5);
        assert_eq!(edited.get("e00").unwrap().channel(), Some(&Channel::Number(0)));
        assert_eq!(g.get("e01").unwrap().channel(), Some(&Channel::Number(1)));
        assert!(g.edited("e99", |_| {}).is_none());

        let back = Layout::from_value(edited.to_value()).unwrap();
        assert_eq!(back.get("e01").unwrap().area_mm2(96.0), 2.5);
        assert_eq!(edited.to_value()[0].get("area"), None);
    }
}
