//! Hazard store: the engine's only source of hazard data.
//!
//! # Snapshots
//!
//! [`InMemoryHazardStore`] keeps an R-tree (via `rstar`) over hazard
//! bounding boxes inside an immutable snapshot behind `RwLock<Arc<_>>`.
//! Readers clone the `Arc` and release the lock before doing any geometry
//! work; writers build a new snapshot and swap it in. Records are shared as
//! `Arc<HazardRecord>`, so a query sees every record either entirely before
//! or entirely after an update.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use geo::{Point, Rect};
use rstar::{RTree, RTreeObject, AABB};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::geometry::{check_coord, disc_bounds, RouteGeometry};
use crate::hazard::{HazardId, HazardRecord, HazardType, Severity};

/// Hazards paired with their measure (distance or overlap, in metres).
///
/// The sequence owns everything it needs; it stays valid after the store
/// changes and is consumed lazily.
pub type HazardHits = Box<dyn Iterator<Item = (Arc<HazardRecord>, f64)> + Send>;

/// Spatial queries over hazards active at an instant.
///
/// An empty sequence means "no hazards"; any failure is an error. Both
/// queries are restartable: every call reads current state.
pub trait HazardStore: Send + Sync {
    /// Hazards within `radius_m` of `point`, ascending by distance.
    fn find_near(
        &self,
        point: Point<f64>,
        radius_m: f64,
        as_of: DateTime<Utc>,
    ) -> impl Future<Output = EngineResult<HazardHits>> + Send;

    /// Hazards whose footprint overlaps `route` along a positive length,
    /// paired with that length.
    fn find_intersecting(
        &self,
        route: &RouteGeometry,
        as_of: DateTime<Utc>,
    ) -> impl Future<Output = EngineResult<HazardHits>> + Send;
}

// ── R-tree entry ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct IndexedHazard {
    envelope: AABB<[f64; 2]>,
    record: Arc<HazardRecord>,
}

impl IndexedHazard {
    fn new(record: Arc<HazardRecord>) -> Self {
        let rect = record.geometry.bounding_rect();
        Self {
            envelope: to_aabb(rect),
            record,
        }
    }
}

impl RTreeObject for IndexedHazard {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn to_aabb(rect: Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Snapshot {
    tree: RTree<IndexedHazard>,
    by_id: HashMap<HazardId, Arc<HazardRecord>>,
}

impl Snapshot {
    fn build(by_id: HashMap<HazardId, Arc<HazardRecord>>) -> Self {
        let entries = by_id.values().cloned().map(IndexedHazard::new).collect();
        Self {
            tree: RTree::bulk_load(entries),
            by_id,
        }
    }

    /// Active hazards whose bounding box meets `rect`, ascending by id.
    fn candidates(&self, rect: Rect<f64>, as_of: DateTime<Utc>) -> Vec<Arc<HazardRecord>> {
        let mut found: Vec<_> = self
            .tree
            .locate_in_envelope_intersecting(&to_aabb(rect))
            .filter(|entry| entry.record.is_active(as_of))
            .map(|entry| Arc::clone(&entry.record))
            .collect();
        found.sort_by_key(|record| record.id);
        found
    }
}

// ── Listing filter ────────────────────────────────────────────────────────────

/// Attribute and area filter for [`InMemoryHazardStore::list`]. Unset
/// fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HazardQuery {
    /// Lon/lat box the footprint must meet.
    pub bbox: Option<Rect<f64>>,
    pub hazard_types: Option<BTreeSet<HazardType>>,
    pub min_severity: Option<Severity>,
}

impl HazardQuery {
    pub fn matches(&self, record: &HazardRecord) -> bool {
        self.hazard_types
            .as_ref()
            .is_none_or(|types| types.contains(&record.hazard_type))
            && self.min_severity.is_none_or(|min| record.severity >= min)
            && self
                .bbox
                .is_none_or(|bbox| record.geometry.intersects_rect(&bbox))
    }
}

// ── InMemoryHazardStore ───────────────────────────────────────────────────────

/// R-tree backed store written by the ingestion side and read by the engine.
#[derive(Default)]
pub struct InMemoryHazardStore {
    current: RwLock<Arc<Snapshot>>,
}

impl InMemoryHazardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = HazardRecord>) -> EngineResult<Self> {
        let store = Self::new();
        store.upsert_many(records)?;
        Ok(store)
    }

    fn snapshot(&self) -> EngineResult<Arc<Snapshot>> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| EngineError::StoreUnavailable("hazard index lock poisoned".into()))
    }

    /// Apply `change` to a copy of the record map and publish the result.
    fn update<R>(
        &self,
        change: impl FnOnce(&mut HashMap<HazardId, Arc<HazardRecord>>) -> R,
    ) -> EngineResult<R> {
        let mut current = self
            .current
            .write()
            .map_err(|_| EngineError::StoreUnavailable("hazard index lock poisoned".into()))?;
        let mut by_id = current.by_id.clone();
        let out = change(&mut by_id);
        *current = Arc::new(Snapshot::build(by_id));
        Ok(out)
    }

    /// Insert or replace one record.
    pub fn upsert(&self, record: HazardRecord) -> EngineResult<()> {
        self.upsert_many([record]).map(|_| ())
    }

    /// Insert or replace a batch atomically; nothing is stored if any record
    /// is invalid. Returns the number of records written.
    pub fn upsert_many(&self, records: impl IntoIterator<Item = HazardRecord>) -> EngineResult<usize> {
        let records: Vec<HazardRecord> = records.into_iter().collect();
        for record in &records {
            record.validate()?;
        }
        let written = records.len();
        self.update(move |by_id| {
            for record in records {
                by_id.insert(record.id, Arc::new(record));
            }
        })?;
        debug!(written, "hazards upserted");
        Ok(written)
    }

    pub fn remove(&self, id: HazardId) -> EngineResult<Option<Arc<HazardRecord>>> {
        self.update(|by_id| by_id.remove(&id))
    }

    /// Drop every record whose validity window ended at or before `as_of`.
    pub fn purge_expired(&self, as_of: DateTime<Utc>) -> EngineResult<usize> {
        let snapshot = self.snapshot()?;
        if !snapshot.by_id.values().any(|record| record.has_expired(as_of)) {
            return Ok(0);
        }
        self.update(|by_id| {
            let before = by_id.len();
            by_id.retain(|_, record| !record.has_expired(as_of));
            before - by_id.len()
        })
    }

    pub fn get(&self, id: HazardId) -> EngineResult<Option<Arc<HazardRecord>>> {
        Ok(self.snapshot()?.by_id.get(&id).cloned())
    }

    pub fn len(&self) -> EngineResult<usize> {
        Ok(self.snapshot()?.by_id.len())
    }

    pub fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Active hazards matching `query`, ascending by id. With a bounding box
    /// the R-tree narrows the candidates first.
    pub fn list(
        &self,
        query: &HazardQuery,
        as_of: DateTime<Utc>,
    ) -> EngineResult<Vec<Arc<HazardRecord>>> {
        let snapshot = self.snapshot()?;
        let mut found = match query.bbox {
            Some(bbox) => snapshot.candidates(bbox, as_of),
            None => {
                let mut all: Vec<_> = snapshot
                    .by_id
                    .values()
                    .filter(|record| record.is_active(as_of))
                    .cloned()
                    .collect();
                all.sort_by_key(|record| record.id);
                all
            }
        };
        found.retain(|record| query.matches(record));
        Ok(found)
    }

    /// Count of active hazards per type; every type is present.
    pub fn type_summary(&self, as_of: DateTime<Utc>) -> EngineResult<BTreeMap<HazardType, usize>> {
        let snapshot = self.snapshot()?;
        let mut counts: BTreeMap<HazardType, usize> =
            HazardType::ALL.iter().map(|t| (*t, 0)).collect();
        for record in snapshot.by_id.values().filter(|r| r.is_active(as_of)) {
            *counts.entry(record.hazard_type).or_default() += 1;
        }
        Ok(counts)
    }
}

impl HazardStore for InMemoryHazardStore {
    async fn find_near(
        &self,
        point: Point<f64>,
        radius_m: f64,
        as_of: DateTime<Utc>,
    ) -> EngineResult<HazardHits> {
        check_coord(point.x(), point.y())?;
        if !radius_m.is_finite() || radius_m < 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "search radius must be a non-negative number of metres, got {radius_m}"
            )));
        }

        let snapshot = self.snapshot()?;
        let mut hits: Vec<(Arc<HazardRecord>, f64)> = snapshot
            .candidates(disc_bounds(point, radius_m), as_of)
            .into_iter()
            .filter_map(|record| {
                let distance = record.geometry.distance_m(point)?;
                (distance <= radius_m).then_some((record, distance))
            })
            .collect();
        // Candidates arrive sorted by id, so the stable sort keeps id order on ties.
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(Box::new(hits.into_iter()))
    }

    async fn find_intersecting(
        &self,
        route: &RouteGeometry,
        as_of: DateTime<Utc>,
    ) -> EngineResult<HazardHits> {
        let snapshot = self.snapshot()?;
        let candidates = snapshot.candidates(route.bounding_rect(), as_of);
        let route = route.clone();
        Ok(Box::new(candidates.into_iter().filter_map(move |record| {
            let overlap = record.geometry.overlap_m(&route);
            (overlap > 0.0).then_some((record, overlap))
        })))
    }
}
