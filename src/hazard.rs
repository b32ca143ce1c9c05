//! Hazard records as delivered by the ingestion side.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use geo::{
    Area, BooleanOps, BoundingRect, Closest, Coord, HaversineClosestPoint, HaversineDistance,
    HaversineLength, Intersects, LineString, MultiLineString, Point, Polygon, Rect,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::geometry::{check_coord, check_simple, circle_overlap_m, disc_bounds, RouteGeometry};

pub type HazardId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HazardType {
    Flood,
    Weather,
    Wildfire,
    Ice,
    Other,
}

impl HazardType {
    pub const ALL: [HazardType; 5] = [
        HazardType::Flood,
        HazardType::Weather,
        HazardType::Wildfire,
        HazardType::Ice,
        HazardType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HazardType::Flood => "flood",
            HazardType::Weather => "weather",
            HazardType::Wildfire => "wildfire",
            HazardType::Ice => "ice",
            HazardType::Other => "other",
        }
    }
}

impl FromStr for HazardType {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        HazardType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown hazard type {s:?}")))
    }
}

impl fmt::Display for HazardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal intensity; declaration order is the rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Moderate,
    Severe,
    Extreme,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Minor,
        Severity::Moderate,
        Severity::Severe,
        Severity::Extreme,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Minor => "minor",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
            Severity::Extreme => "extreme",
        }
    }
}

impl FromStr for Severity {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        Severity::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown severity {s:?}")))
    }
}

/// Footprint of a hazard in WGS84 lon/lat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GeometryRepr", into = "GeometryRepr")]
pub enum HazardGeometry {
    Polygon(Polygon<f64>),
    Circle { center: Point<f64>, radius_m: f64 },
}

/// Wire shape of [`HazardGeometry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum GeometryRepr {
    Polygon {
        exterior: Vec<[f64; 2]>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        holes: Vec<Vec<[f64; 2]>>,
    },
    Circle {
        center: [f64; 2],
        radius_m: f64,
    },
}

impl TryFrom<GeometryRepr> for HazardGeometry {
    type Error = EngineError;

    fn try_from(repr: GeometryRepr) -> EngineResult<Self> {
        match repr {
            GeometryRepr::Polygon { exterior, holes } => HazardGeometry::polygon(exterior, holes),
            GeometryRepr::Circle { center, radius_m } => HazardGeometry::circle(center, radius_m),
        }
    }
}

impl From<HazardGeometry> for GeometryRepr {
    fn from(geometry: HazardGeometry) -> Self {
        fn ring(ls: &LineString<f64>) -> Vec<[f64; 2]> {
            ls.coords().map(|c| [c.x, c.y]).collect()
        }
        match geometry {
            HazardGeometry::Polygon(poly) => GeometryRepr::Polygon {
                exterior: ring(poly.exterior()),
                holes: poly.interiors().iter().map(ring).collect(),
            },
            HazardGeometry::Circle { center, radius_m } => GeometryRepr::Circle {
                center: [center.x(), center.y()],
                radius_m,
            },
        }
    }
}

impl HazardGeometry {
    /// Build a polygon from `[lon, lat]` rings. Rings are closed automatically.
    pub fn polygon(exterior: Vec<[f64; 2]>, holes: Vec<Vec<[f64; 2]>>) -> EngineResult<Self> {
        fn ring(points: Vec<[f64; 2]>) -> LineString<f64> {
            points.into_iter().map(|[x, y]| Coord { x, y }).collect()
        }
        let geometry =
            HazardGeometry::Polygon(Polygon::new(ring(exterior), holes.into_iter().map(ring).collect()));
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn circle(center: [f64; 2], radius_m: f64) -> EngineResult<Self> {
        let geometry = HazardGeometry::Circle {
            center: Point::new(center[0], center[1]),
            radius_m,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self {
            HazardGeometry::Polygon(poly) => {
                for ls in std::iter::once(poly.exterior()).chain(poly.interiors()) {
                    for c in ls.coords() {
                        check_coord(c.x, c.y)?;
                    }
                }
                if poly.exterior().0.len() < 4 || poly.unsigned_area() <= 0.0 {
                    return Err(EngineError::InvalidGeometry(
                        "hazard polygon has no area".into(),
                    ));
                }
                for ring in std::iter::once(poly.exterior()).chain(poly.interiors()) {
                    check_simple(ring.lines(), true).map_err(|e| match e {
                        EngineError::InvalidGeometry(msg) => {
                            EngineError::InvalidGeometry(format!("hazard polygon ring: {msg}"))
                        }
                        other => other,
                    })?;
                }
                Ok(())
            }
            HazardGeometry::Circle { center, radius_m } => {
                check_coord(center.x(), center.y())?;
                if !radius_m.is_finite() || *radius_m <= 0.0 {
                    return Err(EngineError::InvalidGeometry(format!(
                        "hazard radius {radius_m} must be positive"
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn bounding_rect(&self) -> Rect<f64> {
        match self {
            HazardGeometry::Polygon(poly) => poly.bounding_rect().unwrap_or_else(|| {
                let c = poly.exterior().0.first().copied().unwrap_or_default();
                Rect::new(c, c)
            }),
            HazardGeometry::Circle { center, radius_m } => disc_bounds(*center, *radius_m),
        }
    }

    /// Distance in metres from `point` to the footprint; `0.0` inside it.
    ///
    /// `None` when the footprint is degenerate and no distance is defined.
    pub fn distance_m(&self, point: Point<f64>) -> Option<f64> {
        match self {
            HazardGeometry::Polygon(poly) => match poly.haversine_closest_point(&point) {
                Closest::Intersection(_) => Some(0.0),
                Closest::SinglePoint(p) => Some(p.haversine_distance(&point)),
                Closest::Indeterminate => None,
            },
            HazardGeometry::Circle { center, radius_m } => {
                Some((center.haversine_distance(&point) - radius_m).max(0.0))
            }
        }
    }

    /// Whether the footprint meets the lon/lat box `rect`.
    pub fn intersects_rect(&self, rect: &Rect<f64>) -> bool {
        match self {
            HazardGeometry::Polygon(poly) => poly.intersects(rect),
            HazardGeometry::Circle { center, radius_m } => {
                let nearest = Point::new(
                    center.x().clamp(rect.min().x, rect.max().x),
                    center.y().clamp(rect.min().y, rect.max().y),
                );
                center.haversine_distance(&nearest) <= *radius_m
            }
        }
    }

    /// Length in metres of `route` lying inside the footprint.
    pub fn overlap_m(&self, route: &RouteGeometry) -> f64 {
        match self {
            HazardGeometry::Polygon(poly) => {
                let lines = MultiLineString::new(vec![route.line_string().clone()]);
                poly.clip(&lines, false).haversine_length()
            }
            HazardGeometry::Circle { center, radius_m } => {
                circle_overlap_m(route.line_string(), *center, *radius_m)
            }
        }
    }
}

/// One hazard as seen by the engine. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardRecord {
    pub id: HazardId,
    pub hazard_type: HazardType,
    pub severity: Severity,
    pub geometry: HazardGeometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    /// Publishing agency or feed, e.g. `FEMA` or `NWS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HazardRecord {
    pub fn new(hazard_type: HazardType, severity: Severity, geometry: HazardGeometry) -> Self {
        Self {
            id: Uuid::new_v4(),
            hazard_type,
            severity,
            geometry,
            valid_from: None,
            valid_until: None,
            source: None,
            description: None,
        }
    }

    pub fn with_id(mut self, id: HazardId) -> Self {
        self.id = id;
        self
    }

    pub fn with_validity(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// `valid_from <= at < valid_until`, with open ends where unset.
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| at >= from)
            && self.valid_until.is_none_or(|until| at < until)
    }

    pub fn has_expired(&self, at: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| at >= until)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.geometry.validate()?;
        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until) {
            if from >= until {
                return Err(EngineError::InvalidArgument(format!(
                    "hazard {} has an empty validity window",
                    self.id
                )));
            }
        }
        Ok(())
    }
}
