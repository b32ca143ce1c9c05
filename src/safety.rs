use std::collections::{HashMap, HashSet};

use geo::{Point, Rect};
use h3o::{CellIndex, LatLng, Resolution};

use crate::config::GridConfig;
use crate::error::{EngineError, EngineResult};
use crate::geometry::{expand_rect, METERS_PER_DEGREE};
use crate::hazard::HazardRecord;
use crate::penalty::PenaltyModel;

/// Hazard penalties rasterized onto H3 cells.
///
/// 0.0 = no known hazard nearby; values above 1.0 are possible for severe
/// hazards since penalties are not clamped here.
pub struct HazardGrid {
    resolution: Resolution,
    cells: HashMap<CellIndex, f64>,
}

impl HazardGrid {
    pub fn empty(resolution: Resolution) -> Self {
        Self {
            resolution,
            cells: HashMap::new(),
        }
    }

    /// Paint every hazard onto the cells whose centre lies within
    /// `config.halo_m` of its footprint. Overlapping hazards keep the
    /// highest penalty per cell.
    ///
    /// A hazard whose halo box would take more than
    /// `config.max_cells_per_hazard` cells is rejected rather than painted in
    /// part.
    pub fn rasterize<'a>(
        hazards: impl IntoIterator<Item = &'a HazardRecord>,
        model: &PenaltyModel,
        config: &GridConfig,
    ) -> EngineResult<Self> {
        let resolution = Resolution::try_from(config.resolution).map_err(|_| {
            EngineError::InvalidArgument(format!("invalid H3 resolution {}", config.resolution))
        })?;
        let mut cells: HashMap<CellIndex, f64> = HashMap::new();

        for hazard in hazards {
            let region = expand_rect(hazard.geometry.bounding_rect(), config.halo_m);
            let estimate = rect_area_m2(region) / resolution.area_m2();
            if estimate > config.max_cells_per_hazard as f64 {
                return Err(EngineError::InvalidArgument(format!(
                    "hazard {} spans about {estimate:.0} cells at resolution {}, limit is {}",
                    hazard.id, config.resolution, config.max_cells_per_hazard
                )));
            }

            for cell in cover(region, resolution) {
                let centre = LatLng::from(cell);
                let Some(distance) = hazard.geometry.distance_m(Point::new(centre.lng(), centre.lat()))
                else {
                    continue;
                };
                if distance > config.halo_m {
                    continue;
                }
                let penalty = model.penalty(hazard.hazard_type, hazard.severity, distance)?;
                let slot = cells.entry(cell).or_insert(0.0);
                if penalty > *slot {
                    *slot = penalty;
                }
            }
        }

        Ok(Self { resolution, cells })
    }

    /// Penalty of the cell containing `(lon, lat)`; 0.0 for unpainted cells
    /// and invalid coordinates.
    pub fn risk_at(&self, lon: f64, lat: f64) -> f64 {
        LatLng::new(lat, lon)
            .ok()
            .and_then(|ll| self.cells.get(&ll.to_cell(self.resolution)).copied())
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

fn rect_area_m2(rect: Rect<f64>) -> f64 {
    let mid_lat = rect.center().y.to_radians();
    rect.width() * METERS_PER_DEGREE * mid_lat.cos() * rect.height() * METERS_PER_DEGREE
}

/// Every cell meeting `rect`, found by sampling a lattice finer than the
/// cell inradius. The lattice overhangs `rect` by one step so cells centred
/// near its edge are still hit.
fn cover(rect: Rect<f64>, resolution: Resolution) -> HashSet<CellIndex> {
    let spacing_m = resolution.edge_length_m() / 2.0;
    let nearest_equator = if rect.min().y <= 0.0 && rect.max().y >= 0.0 {
        0.0
    } else {
        rect.min().y.abs().min(rect.max().y.abs())
    };
    let lat_step = spacing_m / METERS_PER_DEGREE;
    let lon_step = lat_step / nearest_equator.to_radians().cos().max(1e-6);

    let rows = (rect.height() / lat_step).ceil() as usize + 2;
    let cols = (rect.width() / lon_step).ceil() as usize + 2;
    let mut found = HashSet::new();
    for row in 0..=rows {
        let lat = (rect.min().y - lat_step + row as f64 * lat_step).clamp(-90.0, 90.0);
        for col in 0..=cols {
            let lon = (rect.min().x - lon_step + col as f64 * lon_step).clamp(-180.0, 180.0);
            if let Ok(ll) = LatLng::new(lat, lon) {
                found.insert(ll.to_cell(resolution));
            }
        }
    }
    found
}
