//! Route geometry and the geometric measures used to score it.
//!
//! All coordinates are WGS84 `(lon, lat)` in degrees, matching the `x`/`y`
//! order of `geo` types. Lengths and distances are metres on the haversine
//! sphere used by `geo`.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{BoundingRect, Coord, HaversineLength, Line, LineString, Point, Rect};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};

use crate::error::{EngineError, EngineResult};

/// Mean earth radius used by `geo`'s haversine algorithms.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Metres per degree of latitude on the haversine sphere.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Reject non-finite or out-of-range WGS84 coordinates.
pub(crate) fn check_coord(lon: f64, lat: f64) -> EngineResult<()> {
    if !lon.is_finite() || !lat.is_finite() {
        return Err(EngineError::InvalidGeometry(format!(
            "non-finite coordinate ({lon}, {lat})"
        )));
    }
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return Err(EngineError::InvalidGeometry(format!(
            "coordinate ({lon}, {lat}) out of range"
        )));
    }
    Ok(())
}

/// A validated candidate path.
///
/// Construction guarantees at least two distinct vertices, in-range
/// coordinates, a positive length and no self-intersection. Consecutive
/// duplicate vertices are collapsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteGeometry {
    line: LineString<f64>,
    bbox: Rect<f64>,
    length_m: f64,
}

impl RouteGeometry {
    pub fn new(vertices: impl IntoIterator<Item = [f64; 2]>) -> EngineResult<Self> {
        let route = Self::build(vertices)?;
        check_simple(route.line.lines(), false)?;
        Ok(route)
    }

    /// Like [`new`](Self::new) but lets the path cross itself, as a road path
    /// does at bridges and overpasses.
    pub fn from_network_path(vertices: impl IntoIterator<Item = [f64; 2]>) -> EngineResult<Self> {
        Self::build(vertices)
    }

    fn build(vertices: impl IntoIterator<Item = [f64; 2]>) -> EngineResult<Self> {
        let mut coords: Vec<Coord<f64>> = Vec::new();
        for [lon, lat] in vertices {
            check_coord(lon, lat)?;
            let c = Coord { x: lon, y: lat };
            if coords.last() != Some(&c) {
                coords.push(c);
            }
        }
        if coords.len() < 2 {
            return Err(EngineError::InvalidGeometry(
                "route needs at least two distinct vertices".into(),
            ));
        }

        let line = LineString::new(coords);
        let length_m = line.haversine_length();
        if length_m <= 0.0 {
            return Err(EngineError::InvalidGeometry("route has zero length".into()));
        }

        let Some(bbox) = line.bounding_rect() else {
            return Err(EngineError::InvalidGeometry("route has no extent".into()));
        };
        Ok(Self { line, bbox, length_m })
    }

    pub fn line_string(&self) -> &LineString<f64> {
        &self.line
    }

    pub fn bounding_rect(&self) -> Rect<f64> {
        self.bbox
    }

    /// Haversine length in metres.
    pub fn length_m(&self) -> f64 {
        self.length_m
    }

    /// Vertices as `[lon, lat]` pairs.
    pub fn vertices(&self) -> impl Iterator<Item = [f64; 2]> + '_ {
        self.line.coords().map(|c| [c.x, c.y])
    }
}

/// Fail if any two segments cross, touch away from their shared vertex, or
/// fold back over each other. With `closed`, the last segment is taken to
/// join the first (a polygon ring).
///
/// Zero-length segments are ignored. Candidate pairs come from an R-tree
/// over segment envelopes, so long paths avoid the all-pairs scan.
pub(crate) fn check_simple(
    lines: impl IntoIterator<Item = Line<f64>>,
    closed: bool,
) -> EngineResult<()> {
    let segments: Vec<Line<f64>> = lines.into_iter().filter(|l| l.start != l.end).collect();
    let n = segments.len();
    let tree = RTree::bulk_load(
        segments
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let corners = ([l.start.x, l.start.y], [l.end.x, l.end.y]);
                GeomWithData::new(Rectangle::from_corners(corners.0, corners.1), i)
            })
            .collect(),
    );

    for (i, segment) in segments.iter().enumerate() {
        let envelope = AABB::from_corners(
            [segment.start.x, segment.start.y],
            [segment.end.x, segment.end.y],
        );
        for other in tree.locate_in_envelope_intersecting(&envelope) {
            let j = other.data;
            if j <= i {
                continue;
            }
            let Some(hit) = line_intersection(*segment, segments[j]) else {
                continue;
            };
            let adjacent = j == i + 1 || (closed && i == 0 && j == n - 1);
            let crossing = match hit {
                LineIntersection::Collinear { .. } => true,
                LineIntersection::SinglePoint { .. } => !adjacent,
            };
            if crossing {
                return Err(EngineError::InvalidGeometry(format!(
                    "self-intersection between segments {i} and {j}"
                )));
            }
        }
    }
    Ok(())
}

/// Grow `rect` by `margin_m` metres on every side, clamped to the globe.
pub(crate) fn expand_rect(rect: Rect<f64>, margin_m: f64) -> Rect<f64> {
    let dlat = margin_m / METERS_PER_DEGREE;
    let max_abs_lat = rect.min().y.abs().max(rect.max().y.abs()).min(89.0);
    let dlon = (dlat / max_abs_lat.to_radians().cos()).min(360.0);
    Rect::new(
        Coord {
            x: (rect.min().x - dlon).max(-180.0),
            y: (rect.min().y - dlat).max(-90.0),
        },
        Coord {
            x: (rect.max().x + dlon).min(180.0),
            y: (rect.max().y + dlat).min(90.0),
        },
    )
}

/// Project `c` onto a local tangent plane centred on `origin`, in metres.
fn local_xy(origin: Point<f64>, c: Coord<f64>) -> (f64, f64) {
    let x = (c.x - origin.x()) * METERS_PER_DEGREE * origin.y().to_radians().cos();
    let y = (c.y - origin.y()) * METERS_PER_DEGREE;
    (x, y)
}

/// Length in metres of the part of `line` inside the disc `(center, radius_m)`.
///
/// Each segment is intersected with the circle on a tangent plane at the
/// centre; the covered fraction is applied to the segment's haversine length.
pub(crate) fn circle_overlap_m(line: &LineString<f64>, center: Point<f64>, radius_m: f64) -> f64 {
    let mut overlap = 0.0;
    for segment in line.lines() {
        let (ax, ay) = local_xy(center, segment.start);
        let (bx, by) = local_xy(center, segment.end);
        let (dx, dy) = (bx - ax, by - ay);

        let a = dx * dx + dy * dy;
        if a == 0.0 {
            continue;
        }
        let b = 2.0 * (ax * dx + ay * dy);
        let c = ax * ax + ay * ay - radius_m * radius_m;
        let disc = b * b - 4.0 * a * c;
        if disc <= 0.0 {
            continue;
        }

        let root = disc.sqrt();
        let t0 = ((-b - root) / (2.0 * a)).max(0.0);
        let t1 = ((-b + root) / (2.0 * a)).min(1.0);
        if t1 > t0 {
            overlap += (t1 - t0) * segment.haversine_length();
        }
    }
    overlap
}

/// Lon/lat box enclosing the disc `(center, radius_m)`, clamped to the globe.
pub(crate) fn disc_bounds(center: Point<f64>, radius_m: f64) -> Rect<f64> {
    let dlat = radius_m / METERS_PER_DEGREE;
    let cos_lat = center.y().to_radians().cos().max(1e-6);
    let dlon = (radius_m / (METERS_PER_DEGREE * cos_lat)).min(360.0);
    Rect::new(
        Coord {
            x: (center.x() - dlon).max(-180.0),
            y: (center.y() - dlat).max(-90.0),
        },
        Coord {
            x: (center.x() + dlon).min(180.0),
            y: (center.y() + dlat).min(90.0),
        },
    )
}
