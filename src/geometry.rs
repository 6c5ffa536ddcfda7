//! Walkable area loading.
//!
//! A trajectory file stores the walkable area as one or more WKT polygons.
//! They are unioned into a single polygon: one exterior boundary plus zero or
//! more holes (obstacles). The scene receives the rings as closed boundary
//! curves at ground level.

use std::str::FromStr;

use geo::{Area, BooleanOps, Geometry, LineString, MultiPolygon, Polygon};
use log::{debug, info};
use wkt::Wkt;

use crate::error::{PlaybackError, Result};
use crate::store::TrajectoryStore;
use crate::GROUND_Z;

/// Name of the exterior boundary curve handed to the scene.
pub const BOUNDARY_CURVE_NAME: &str = "Walkable_Area_Boundary";

/// A closed ring of vertices. The first vertex is repeated at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    pub coords: Vec<[f64; 2]>,
    /// Always true for walkable-area rings; kept explicit for the consumer.
    pub cyclic: bool,
}

impl Ring {
    fn from_line_string(line: &LineString<f64>) -> Self {
        Self {
            coords: line.coords().map(|c| [c.x, c.y]).collect(),
            cyclic: true,
        }
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Whether the last vertex repeats the first one.
    pub fn is_closed(&self) -> bool {
        self.coords.len() > 1 && self.coords.first() == self.coords.last()
    }
}

/// Boundary polyline handed to the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryCurve {
    pub name: String,
    pub points: Vec<[f64; 3]>,
    pub cyclic: bool,
    pub thickness: f64,
}

/// Traversable space: one exterior ring and its holes.
#[derive(Debug, Clone)]
pub struct WalkableArea {
    polygon: Polygon<f64>,
    exterior: Ring,
    interiors: Vec<Ring>,
}

impl WalkableArea {
    /// Build from a single polygon, rejecting degenerate input.
    pub fn from_polygon(polygon: Polygon<f64>) -> Result<Self> {
        if polygon.exterior().0.len() < 4 {
            return Err(geometry_invalid("exterior ring has fewer than 3 vertices"));
        }
        if polygon.unsigned_area() <= f64::EPSILON {
            return Err(geometry_invalid("polygon degenerates to a line or point"));
        }

        let exterior = Ring::from_line_string(polygon.exterior());
        let interiors = polygon
            .interiors()
            .iter()
            .map(Ring::from_line_string)
            .collect();

        Ok(Self {
            polygon,
            exterior,
            interiors,
        })
    }

    pub fn exterior(&self) -> &Ring {
        &self.exterior
    }

    pub fn interiors(&self) -> &[Ring] {
        &self.interiors
    }

    pub fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    pub fn area(&self) -> f64 {
        self.polygon.unsigned_area()
    }

    /// Exterior plus holes.
    pub fn ring_count(&self) -> usize {
        1 + self.interiors.len()
    }

    /// Boundary curves for the scene: the exterior first, then one
    /// `Obstacle_<i>` curve per hole.
    pub fn boundary_curves(&self, thickness: f64) -> Vec<BoundaryCurve> {
        let to_curve = |name: String, ring: &Ring| BoundaryCurve {
            name,
            points: ring
                .coords
                .iter()
                .map(|[x, y]| [*x, *y, GROUND_Z as f64])
                .collect(),
            cyclic: ring.cyclic,
            thickness,
        };

        std::iter::once(to_curve(BOUNDARY_CURVE_NAME.to_string(), &self.exterior))
            .chain(
                self.interiors
                    .iter()
                    .enumerate()
                    .map(|(i, ring)| to_curve(format!("Obstacle_{i}"), ring)),
            )
            .collect()
    }
}

/// Parse one WKT string into its polygons.
///
/// Accepts `POLYGON` and `MULTIPOLYGON`; anything else is rejected.
pub fn parse_wkt_polygons(text: &str) -> Result<Vec<Polygon<f64>>> {
    let parsed: Wkt<f64> = Wkt::from_str(text.trim())
        .map_err(|e| geometry_invalid(format!("unparsable WKT: {e}")))?;
    let geometry = Geometry::try_from(parsed)
        .map_err(|e| geometry_invalid(format!("unsupported WKT: {e}")))?;

    match geometry {
        Geometry::Polygon(polygon) => Ok(vec![polygon]),
        Geometry::MultiPolygon(multi) => Ok(multi.0),
        _ => Err(geometry_invalid(
            "expected POLYGON or MULTIPOLYGON geometry",
        )),
    }
}

/// Union polygons into a single walkable area.
///
/// Fails if the union is empty, has zero area, or splits into several
/// disjoint parts.
pub fn union_polygons(polygons: Vec<Polygon<f64>>) -> Result<WalkableArea> {
    if polygons.is_empty() {
        return Err(geometry_invalid("no walkable area polygons"));
    }
    // A single polygon still goes through the union so self-intersecting
    // rings are resolved into their actual parts.
    let merged = polygons
        .into_iter()
        .fold(MultiPolygon::new(Vec::new()), |acc, polygon| {
            acc.union(&MultiPolygon::new(vec![polygon]))
        });

    let mut parts: Vec<Polygon<f64>> = merged
        .0
        .into_iter()
        .filter(|p| p.unsigned_area() > f64::EPSILON)
        .collect();

    match parts.len() {
        0 => Err(geometry_invalid("union is empty or degenerate")),
        1 => WalkableArea::from_polygon(parts.remove(0)),
        n => Err(geometry_invalid(format!(
            "union has {n} disjoint parts, expected one polygon"
        ))),
    }
}

/// Load and union the store's walkable area.
///
/// Returns `Ok(None)` when the store has no geometry table.
pub fn load_walkable_area(store: &TrajectoryStore) -> Result<Option<WalkableArea>> {
    let Some(wkts) = store.geometry_wkts()? else {
        return Ok(None);
    };
    if wkts.is_empty() {
        return Err(geometry_invalid("geometry table is empty"));
    }

    let mut polygons = Vec::new();
    for text in &wkts {
        polygons.extend(parse_wkt_polygons(text)?);
    }
    debug!(
        "[Geometry] Parsed {} polygons from {} rows",
        polygons.len(),
        wkts.len()
    );

    let area = union_polygons(polygons)?;
    info!(
        "[Geometry] Walkable area: {} boundary rings, area {:.2}",
        area.ring_count(),
        area.area()
    );
    Ok(Some(area))
}

fn geometry_invalid(message: impl Into<String>) -> PlaybackError {
    PlaybackError::GeometryInvalid {
        message: message.into(),
    }
}
