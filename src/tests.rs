//! Unit tests for the risk engine.
//!
//! All tests run on hand-built hazards along the equator, where one degree of
//! longitude is `METERS_PER_DEGREE` metres.

#[cfg(test)]
mod helpers {
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::config::EngineConfig;
    use crate::evaluator::RiskEvaluator;
    use crate::geometry::{RouteGeometry, METERS_PER_DEGREE};
    use crate::hazard::{HazardGeometry, HazardRecord, HazardType, Severity};
    use crate::store::InMemoryHazardStore;

    /// Degrees of longitude spanning 1 km on the equator.
    pub const KM: f64 = 1_000.0 / METERS_PER_DEGREE;

    pub fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    /// Straight 1 km route east from (0, 0).
    pub fn route_1km() -> RouteGeometry {
        RouteGeometry::new([[0.0, 0.0], [KM, 0.0]]).unwrap()
    }

    /// Hazard covering `min_lon..max_lon` over a band around the equator.
    pub fn band(n: u128, t: HazardType, s: Severity, min_lon: f64, max_lon: f64) -> HazardRecord {
        let geometry = HazardGeometry::polygon(
            vec![
                [min_lon, -0.01],
                [max_lon, -0.01],
                [max_lon, 0.01],
                [min_lon, 0.01],
            ],
            vec![],
        )
        .unwrap();
        HazardRecord::new(t, s, geometry).with_id(id(n))
    }

    pub fn disc(n: u128, t: HazardType, s: Severity, center: [f64; 2], radius_m: f64) -> HazardRecord {
        HazardRecord::new(t, s, HazardGeometry::circle(center, radius_m).unwrap()).with_id(id(n))
    }

    pub fn store_with(records: Vec<HazardRecord>) -> Arc<InMemoryHazardStore> {
        Arc::new(InMemoryHazardStore::with_records(records).unwrap())
    }

    pub fn evaluator(store: Arc<InMemoryHazardStore>) -> RiskEvaluator<InMemoryHazardStore> {
        RiskEvaluator::new(store, &EngineConfig::default()).unwrap()
    }
}

// ── Penalty model ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod penalty {
    use crate::error::EngineError;
    use crate::hazard::{HazardType, Severity};
    use crate::penalty::{PenaltyModel, PenaltyPolicy};

    #[test]
    fn base_times_multiplier_at_zero_distance() {
        let m = PenaltyModel::default();
        assert_eq!(m.penalty(HazardType::Flood, Severity::Extreme, 0.0).unwrap(), 1.0);
        assert_eq!(m.penalty(HazardType::Weather, Severity::Minor, 0.0).unwrap(), 0.3);
        assert!((m.penalty(HazardType::Ice, Severity::Severe, 0.0).unwrap() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn decay_halves_at_scale() {
        let m = PenaltyModel::default();
        let p = m.penalty(HazardType::Flood, Severity::Minor, 1_000.0).unwrap();
        assert!((p - 0.25).abs() < 1e-12);
    }

    #[test]
    fn monotone_in_distance() {
        let m = PenaltyModel::default();
        let distances = [0.0, 1.0, 10.0, 250.0, 1_000.0, 50_000.0];
        for t in HazardType::ALL {
            for s in Severity::ALL {
                for w in distances.windows(2) {
                    let near = m.penalty(t, s, w[0]).unwrap();
                    let far = m.penalty(t, s, w[1]).unwrap();
                    assert!(near >= far, "{t} {s:?}: {near} < {far}");
                }
            }
        }
    }

    #[test]
    fn monotone_in_severity() {
        let m = PenaltyModel::default();
        for t in HazardType::ALL {
            for d in [0.0, 500.0] {
                let ps: Vec<f64> = Severity::ALL.iter().map(|s| m.penalty(t, *s, d).unwrap()).collect();
                assert!(ps.windows(2).all(|w| w[0] <= w[1]), "{t}: {ps:?}");
            }
        }
    }

    #[test]
    fn negative_distance_is_rejected() {
        let m = PenaltyModel::default();
        let err = m.penalty(HazardType::Flood, Severity::Minor, -1.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert!(m.penalty(HazardType::Flood, Severity::Minor, f64::NAN).is_err());
    }

    #[test]
    fn policy_is_tunable() {
        let mut policy = PenaltyPolicy::default();
        policy.base.other = 0.8;
        policy.decay_scale_m = 100.0;
        let m = PenaltyModel::new(policy).unwrap();
        let p = m.penalty(HazardType::Other, Severity::Minor, 100.0).unwrap();
        assert!((p - 0.4).abs() < 1e-12);
    }

    #[test]
    fn decreasing_multipliers_are_rejected() {
        let mut policy = PenaltyPolicy::default();
        policy.severity.extreme = 1.1;
        assert!(matches!(
            PenaltyModel::new(policy),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn negative_base_is_rejected() {
        let mut policy = PenaltyPolicy::default();
        policy.base.ice = -0.1;
        assert!(PenaltyModel::new(policy).is_err());
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod geometry {
    use geo::Point;

    use super::helpers::*;
    use crate::error::EngineError;
    use crate::geometry::{RouteGeometry, METERS_PER_DEGREE};
    use crate::hazard::{HazardGeometry, HazardType, Severity};

    fn invalid(vertices: &[[f64; 2]]) -> bool {
        matches!(
            RouteGeometry::new(vertices.iter().copied()),
            Err(EngineError::InvalidGeometry(_))
        )
    }

    #[test]
    fn route_length_is_haversine() {
        let r = route_1km();
        assert!((r.length_m() - 1_000.0).abs() < 1e-6);
        assert_eq!(r.vertices().count(), 2);
    }

    #[test]
    fn rejects_malformed_routes() {
        assert!(invalid(&[]));
        assert!(invalid(&[[1.0, 1.0]]));
        assert!(invalid(&[[1.0, 1.0], [1.0, 1.0]]), "zero length");
        assert!(invalid(&[[0.0, 95.0], [0.0, 0.0]]), "latitude out of range");
        assert!(invalid(&[[181.0, 0.0], [0.0, 0.0]]), "longitude out of range");
        assert!(invalid(&[[f64::NAN, 0.0], [0.0, 0.0]]));
        assert!(invalid(&[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 1.0]]), "bow tie");
        assert!(invalid(&[[0.0, 0.0], [1.0, 0.0], [0.5, 0.0]]), "folds back");
    }

    #[test]
    fn accepts_turns_and_collapses_duplicates() {
        let r = RouteGeometry::new([[0.0, 0.0], [0.0, 0.0], [0.01, 0.0], [0.01, 0.01]]).unwrap();
        assert_eq!(r.vertices().count(), 3);
        // Straight continuation through a vertex is not a self-intersection.
        assert!(RouteGeometry::new([[0.0, 0.0], [0.01, 0.0], [0.02, 0.0]]).is_ok());
    }

    #[test]
    fn network_paths_may_cross_themselves() {
        let crossing = [[0.0, 0.0], [0.01, 0.01], [0.01, 0.0], [0.0, 0.01]];
        assert!(invalid(&crossing));
        let path = RouteGeometry::from_network_path(crossing).unwrap();
        assert_eq!(path.vertices().count(), 4);
        // Range and length checks still apply.
        assert!(RouteGeometry::from_network_path([[0.0, 0.0], [0.0, 0.0]]).is_err());
        assert!(RouteGeometry::from_network_path([[0.0, 0.0], [200.0, 0.0]]).is_err());
    }

    #[test]
    fn long_zigzag_is_checked_exactly() {
        let zigzag: Vec<[f64; 2]> = (0..2_000)
            .map(|i| [i as f64 * 0.001, (i % 2) as f64 * 0.001])
            .collect();
        assert!(RouteGeometry::new(zigzag.iter().copied()).is_ok());

        // Climb above the zigzag, then drop straight through its middle.
        let mut crossing = zigzag;
        crossing.push([1.0005, 0.002]);
        crossing.push([1.0005, -0.001]);
        assert!(invalid(&crossing));
    }

    #[test]
    fn polygon_overlap_is_clipped_length() {
        let r = route_1km();
        let full = band(1, HazardType::Flood, Severity::Minor, -0.01, 0.02);
        assert!((full.geometry.overlap_m(&r) - 1_000.0).abs() < 1e-3);

        let half = band(2, HazardType::Flood, Severity::Minor, -0.01, KM / 2.0);
        assert!((half.geometry.overlap_m(&r) - 500.0).abs() < 1e-3);

        let apart = band(3, HazardType::Flood, Severity::Minor, 0.5, 0.6);
        assert_eq!(apart.geometry.overlap_m(&r), 0.0);
    }

    #[test]
    fn circle_overlap_is_chord_length() {
        let r = route_1km();
        let c = HazardGeometry::circle([KM / 2.0, 0.0], 100.0).unwrap();
        assert!((c.overlap_m(&r) - 200.0).abs() < 0.5);

        let off_route = HazardGeometry::circle([KM / 2.0, 0.01], 100.0).unwrap();
        assert_eq!(off_route.overlap_m(&r), 0.0);
    }

    #[test]
    fn distance_is_zero_inside() {
        let b = band(1, HazardType::Ice, Severity::Minor, 0.0, 0.01);
        assert_eq!(b.geometry.distance_m(Point::new(0.005, 0.0)), Some(0.0));

        let c = HazardGeometry::circle([0.01, 0.0], 100.0).unwrap();
        let d = c.distance_m(Point::new(0.0, 0.0)).unwrap();
        assert!((d - (0.01 * METERS_PER_DEGREE - 100.0)).abs() < 1e-6);
    }

    #[test]
    fn invalid_hazard_geometry_is_rejected() {
        assert!(HazardGeometry::circle([0.0, 0.0], 0.0).is_err());
        assert!(HazardGeometry::circle([0.0, 100.0], 10.0).is_err());
        assert!(HazardGeometry::polygon(vec![[0.0, 0.0], [1.0, 1.0]], vec![]).is_err());
        assert!(HazardGeometry::polygon(vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]], vec![]).is_err());
    }

    #[test]
    fn self_intersecting_polygon_is_rejected() {
        let twisted = vec![[-0.01, -0.01], [0.03, 0.01], [0.03, -0.02], [-0.01, 0.01]];
        assert!(matches!(
            HazardGeometry::polygon(twisted, vec![]),
            Err(EngineError::InvalidGeometry(_))
        ));

        let crossed_hole = vec![[0.1, 0.1], [0.2, 0.2], [0.2, 0.1], [0.1, 0.2]];
        let square = vec![[0.0, 0.0], [0.3, 0.0], [0.3, 0.3], [0.0, 0.3]];
        assert!(HazardGeometry::polygon(square.clone(), vec![crossed_hole]).is_err());

        // Repeated vertices are not crossings.
        let repeated = vec![[0.0, 0.0], [0.3, 0.0], [0.3, 0.0], [0.3, 0.3], [0.0, 0.3]];
        assert!(HazardGeometry::polygon(repeated, vec![]).is_ok());
        assert!(HazardGeometry::polygon(square, vec![]).is_ok());
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("Flood".parse::<HazardType>().unwrap(), HazardType::Flood);
        assert_eq!(" ice ".parse::<HazardType>().unwrap(), HazardType::Ice);
        assert_eq!("SEVERE".parse::<Severity>().unwrap(), Severity::Severe);
        assert!(matches!(
            "lava".parse::<HazardType>(),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!("catastrophic".parse::<Severity>().is_err());
    }

    #[test]
    fn geometry_round_trips_through_json() {
        let raw = r#"{"type":"circle","center":[1.5,2.5],"radius_m":300.0}"#;
        let g: HazardGeometry = serde_json::from_str(raw).unwrap();
        assert_eq!(g, HazardGeometry::circle([1.5, 2.5], 300.0).unwrap());

        let bad = r#"{"type":"circle","center":[1.5,2.5],"radius_m":-3.0}"#;
        assert!(serde_json::from_str::<HazardGeometry>(bad).is_err());
    }
}

// ── Hazard store ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod store {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use geo::{Coord, Point, Rect};

    use super::helpers::*;
    use crate::error::EngineError;
    use crate::hazard::{HazardType, Severity};
    use crate::store::{HazardQuery, HazardStore, InMemoryHazardStore};

    #[tokio::test]
    async fn find_near_orders_by_distance() {
        let store = store_with(vec![
            disc(1, HazardType::Flood, Severity::Minor, [0.02, 0.0], 10.0),
            disc(2, HazardType::Ice, Severity::Minor, [0.005, 0.0], 10.0),
            disc(3, HazardType::Other, Severity::Minor, [0.5, 0.0], 10.0),
        ]);
        let hits: Vec<_> = store
            .find_near(Point::new(0.0, 0.0), 5_000.0, Utc::now())
            .await
            .unwrap()
            .collect();
        let ids: Vec<_> = hits.iter().map(|(h, _)| h.id).collect();
        assert_eq!(ids, vec![id(2), id(1)]);
        assert!(hits[0].1 < hits[1].1);
    }

    #[tokio::test]
    async fn find_near_is_restartable() {
        let store = store_with(vec![disc(1, HazardType::Flood, Severity::Minor, [0.001, 0.0], 10.0)]);
        let p = Point::new(0.0, 0.0);
        let first = store.find_near(p, 1_000.0, Utc::now()).await.unwrap().count();
        let second = store.find_near(p, 1_000.0, Utc::now()).await.unwrap().count();
        assert_eq!((first, second), (1, 1));
    }

    #[tokio::test]
    async fn validity_window_is_respected() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let store = store_with(vec![
            band(1, HazardType::Weather, Severity::Severe, -0.01, 0.02)
                .with_validity(Some(t0), Some(t0 + Duration::hours(2))),
        ]);
        let r = route_1km();
        let count_at = |at: DateTime<Utc>| {
            let store = store.clone();
            let r = r.clone();
            async move { store.find_intersecting(&r, at).await.unwrap().count() }
        };
        assert_eq!(count_at(t0 - Duration::minutes(1)).await, 0, "not yet valid");
        assert_eq!(count_at(t0).await, 1);
        assert_eq!(count_at(t0 + Duration::hours(2)).await, 0, "expired");
    }

    #[tokio::test]
    async fn find_intersecting_skips_disjoint_and_orders_by_id() {
        let store = store_with(vec![
            band(9, HazardType::Flood, Severity::Minor, -0.01, 0.02),
            band(4, HazardType::Ice, Severity::Minor, -0.01, 0.02),
            // Close to the route without touching it.
            disc(5, HazardType::Other, Severity::Minor, [KM / 2.0, 0.003], 50.0),
        ]);
        let ids: Vec<_> = store
            .find_intersecting(&route_1km(), Utc::now())
            .await
            .unwrap()
            .map(|(h, _)| h.id)
            .collect();
        assert_eq!(ids, vec![id(4), id(9)]);
    }

    #[tokio::test]
    async fn invalid_queries_fail() {
        let store = InMemoryHazardStore::new();
        let bad_point = store.find_near(Point::new(0.0, 91.0), 10.0, Utc::now()).await;
        assert!(matches!(bad_point, Err(EngineError::InvalidGeometry(_))));
        let bad_radius = store.find_near(Point::new(0.0, 0.0), -1.0, Utc::now()).await;
        assert!(matches!(bad_radius, Err(EngineError::InvalidArgument(_))));
        // Empty store: empty result, not an error.
        let empty = store.find_near(Point::new(0.0, 0.0), 10.0, Utc::now()).await;
        assert_eq!(empty.unwrap().count(), 0);
    }

    #[test]
    fn list_filters_by_box_type_and_severity() {
        let store = store_with(vec![
            band(3, HazardType::Flood, Severity::Extreme, 0.0, 0.01),
            disc(1, HazardType::Ice, Severity::Minor, [0.005, 0.0], 100.0),
            disc(2, HazardType::Ice, Severity::Severe, [1.0, 1.0], 100.0),
        ]);
        let now = Utc::now();
        let ids = |query: &HazardQuery| -> Vec<_> {
            store.list(query, now).unwrap().iter().map(|h| h.id).collect()
        };

        assert_eq!(ids(&HazardQuery::default()), vec![id(1), id(2), id(3)]);

        let near_origin = Rect::new(Coord { x: -0.05, y: -0.05 }, Coord { x: 0.05, y: 0.05 });
        let in_box = HazardQuery {
            bbox: Some(near_origin),
            ..HazardQuery::default()
        };
        assert_eq!(ids(&in_box), vec![id(1), id(3)]);

        let ice = HazardQuery {
            hazard_types: Some([HazardType::Ice].into_iter().collect()),
            ..HazardQuery::default()
        };
        assert_eq!(ids(&ice), vec![id(1), id(2)]);

        let serious_ice = HazardQuery {
            min_severity: Some(Severity::Severe),
            ..ice.clone()
        };
        assert_eq!(ids(&serious_ice), vec![id(2)]);

        // Box touches the circle's bounding box corner but not the circle.
        let corner = Rect::new(
            Coord { x: 1.0009, y: 1.0009 },
            Coord { x: 1.01, y: 1.01 },
        );
        let corner_only = HazardQuery {
            bbox: Some(corner),
            ..HazardQuery::default()
        };
        assert!(ids(&corner_only).is_empty());
    }

    #[test]
    fn upsert_replaces_and_remove_deletes() {
        let store = InMemoryHazardStore::new();
        store.upsert(band(1, HazardType::Flood, Severity::Minor, 0.0, 0.01)).unwrap();
        store.upsert(band(1, HazardType::Flood, Severity::Extreme, 0.0, 0.01)).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(id(1)).unwrap().unwrap().severity, Severity::Extreme);

        assert!(store.remove(id(1)).unwrap().is_some());
        assert!(store.remove(id(1)).unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn invalid_batch_stores_nothing() {
        let store = InMemoryHazardStore::new();
        let now = Utc::now();
        let bad = band(2, HazardType::Flood, Severity::Minor, 0.0, 0.01).with_validity(Some(now), Some(now));
        let res = store.upsert_many(vec![band(1, HazardType::Flood, Severity::Minor, 0.0, 0.01), bad]);
        assert!(res.is_err());
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn purge_and_summary() {
        let now = Utc::now();
        let store = store_with(vec![
            band(1, HazardType::Flood, Severity::Minor, 0.0, 0.01)
                .with_validity(None, Some(now - Duration::minutes(5))),
            band(2, HazardType::Flood, Severity::Minor, 0.0, 0.01),
            band(3, HazardType::Wildfire, Severity::Minor, 0.0, 0.01),
        ]);
        let summary = store.type_summary(now).unwrap();
        assert_eq!(summary[&HazardType::Flood], 1);
        assert_eq!(summary[&HazardType::Wildfire], 1);
        assert_eq!(summary[&HazardType::Ice], 0);

        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert_eq!(store.purge_expired(now).unwrap(), 0);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn reads_proceed_during_writes() {
        let store = InMemoryHazardStore::new();
        let route = route_1km();
        std::thread::scope(|s| {
            s.spawn(|| {
                for n in 0..200 {
                    store
                        .upsert(band(n, HazardType::Flood, Severity::Minor, -0.01, 0.02))
                        .unwrap();
                }
            });
            s.spawn(|| {
                let mut last = 0;
                for _ in 0..200 {
                    let hits: Vec<_> =
                        futures::executor::block_on(store.find_intersecting(&route, Utc::now()))
                            .unwrap()
                            .collect();
                    // Writers only add records, so snapshots never shrink.
                    assert!(hits.len() >= last);
                    assert!(hits.iter().all(|(_, overlap)| *overlap > 0.0));
                    last = hits.len();
                }
            });
        });
        assert_eq!(store.len().unwrap(), 200);
    }
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod evaluator {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use geo::Point;

    use super::helpers::*;
    use crate::cancel::CancelSource;
    use crate::config::{Aggregation, EngineConfig};
    use crate::error::{EngineError, EngineResult};
    use crate::evaluator::{EvaluateOptions, Measure, RiskEvaluator};
    use crate::geometry::RouteGeometry;
    use crate::hazard::{HazardType, Severity};
    use crate::store::{HazardHits, HazardStore, InMemoryHazardStore};

    /// Store whose index is unreachable.
    struct DownStore;

    impl HazardStore for DownStore {
        async fn find_near(&self, _: Point<f64>, _: f64, _: DateTime<Utc>) -> EngineResult<HazardHits> {
            Err(EngineError::StoreUnavailable("index offline".into()))
        }

        async fn find_intersecting(&self, _: &RouteGeometry, _: DateTime<Utc>) -> EngineResult<HazardHits> {
            Err(EngineError::StoreUnavailable("index offline".into()))
        }
    }

    /// Store whose queries never finish in test time.
    struct SlowStore;

    impl HazardStore for SlowStore {
        async fn find_near(&self, _: Point<f64>, _: f64, _: DateTime<Utc>) -> EngineResult<HazardHits> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Box::new(std::iter::empty()))
        }

        async fn find_intersecting(&self, _: &RouteGeometry, _: DateTime<Utc>) -> EngineResult<HazardHits> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Box::new(std::iter::empty()))
        }
    }

    /// Store whose hits cancel `source` once the first one has been taken.
    struct CancellingStore {
        source: Arc<CancelSource>,
    }

    impl HazardStore for CancellingStore {
        async fn find_near(&self, _: Point<f64>, _: f64, _: DateTime<Utc>) -> EngineResult<HazardHits> {
            Ok(Box::new(std::iter::empty()))
        }

        async fn find_intersecting(&self, _: &RouteGeometry, _: DateTime<Utc>) -> EngineResult<HazardHits> {
            let source = Arc::clone(&self.source);
            let hits = (0..3).map(move |n| {
                if n == 1 {
                    source.cancel();
                }
                let hazard = band(n, HazardType::Flood, Severity::Minor, -0.01, 0.02);
                (Arc::new(hazard), 1_000.0)
            });
            Ok(Box::new(hits))
        }
    }

    /// Store whose hits each take a while to compute.
    struct SlowHitsStore;

    impl HazardStore for SlowHitsStore {
        async fn find_near(&self, _: Point<f64>, _: f64, _: DateTime<Utc>) -> EngineResult<HazardHits> {
            Ok(Box::new(std::iter::empty()))
        }

        async fn find_intersecting(&self, _: &RouteGeometry, _: DateTime<Utc>) -> EngineResult<HazardHits> {
            let hits = (0..3).map(|n| {
                std::thread::sleep(Duration::from_millis(30));
                let hazard = band(n, HazardType::Flood, Severity::Minor, -0.01, 0.02);
                (Arc::new(hazard), 1_000.0)
            });
            Ok(Box::new(hits))
        }
    }

    #[tokio::test]
    async fn empty_store_scores_zero() {
        let ev = evaluator(Arc::new(InMemoryHazardStore::new()));
        let res = ev.evaluate(&route_1km()).await.unwrap();
        assert_eq!(res.score, 0.0);
        assert!(res.contributions.is_empty());
    }

    #[tokio::test]
    async fn extreme_flood_over_whole_route_scores_one() {
        let store = store_with(vec![band(1, HazardType::Flood, Severity::Extreme, -0.01, 0.02)]);
        let res = evaluator(store).evaluate(&route_1km()).await.unwrap();
        assert!((res.score - 1.0).abs() < 1e-6, "score {}", res.score);
        assert_eq!(res.contributions.len(), 1);
        match res.contributions[0].measure {
            Measure::Overlap(m) => assert!((m - 1_000.0).abs() < 1e-3),
            other => panic!("unexpected measure {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_hazards_average() {
        let store = store_with(vec![
            band(1, HazardType::Flood, Severity::Extreme, -0.01, KM / 2.0),
            band(2, HazardType::Weather, Severity::Minor, -0.01, 0.02),
        ]);
        let res = evaluator(store).evaluate(&route_1km()).await.unwrap();
        assert_eq!(res.contributions.len(), 2);
        let p1 = res.contributions[0].penalty;
        let p2 = res.contributions[1].penalty;
        assert!((p1 - 0.5).abs() < 1e-6, "flood contribution {p1}");
        assert!((p2 - 0.3).abs() < 1e-6, "weather contribution {p2}");
        assert!((res.score - ((p1 + p2) / 2.0).min(1.0)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn sum_aggregation_is_configurable() {
        let store = store_with(vec![
            band(1, HazardType::Flood, Severity::Extreme, -0.01, KM / 2.0),
            band(2, HazardType::Weather, Severity::Minor, -0.01, 0.02),
        ]);
        let config = EngineConfig {
            aggregation: Aggregation::Sum,
            ..EngineConfig::default()
        };
        let ev = RiskEvaluator::new(store, &config).unwrap();
        let res = ev.evaluate(&route_1km()).await.unwrap();
        assert!((res.score - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn score_is_clamped_in_dense_regions() {
        let hazards = (0..50)
            .map(|n| band(n, HazardType::Ice, Severity::Extreme, -0.01, 0.02))
            .collect();
        let config = EngineConfig {
            aggregation: Aggregation::Sum,
            ..EngineConfig::default()
        };
        let ev = RiskEvaluator::new(store_with(hazards), &config).unwrap();
        let res = ev.evaluate(&route_1km()).await.unwrap();
        assert_eq!(res.score, 1.0);
        assert_eq!(res.contributions.len(), 50);
    }

    #[tokio::test]
    async fn evaluation_is_idempotent() {
        let store = store_with(vec![
            band(1, HazardType::Wildfire, Severity::Moderate, 0.002, 0.004),
            disc(2, HazardType::Ice, Severity::Severe, [0.006, 0.0], 80.0),
        ]);
        let ev = evaluator(store);
        let at = Utc::now();
        let a = ev.evaluate_with(&route_1km(), EvaluateOptions::at(at)).await.unwrap();
        let b = ev.evaluate_with(&route_1km(), EvaluateOptions::at(at)).await.unwrap();
        assert_eq!(a.score, b.score);
        let ids = |r: &crate::evaluator::RouteRiskResult| {
            r.contributions.iter().map(|c| c.hazard.id).collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
        assert!(a.score > 0.0 && a.score <= 1.0);
    }

    #[tokio::test]
    async fn departure_time_selects_hazards() {
        let later = Utc::now() + chrono::Duration::hours(6);
        let store = store_with(vec![
            band(1, HazardType::Ice, Severity::Moderate, -0.01, 0.02)
                .with_validity(Some(later), None),
        ]);
        let ev = evaluator(store);
        assert_eq!(ev.evaluate(&route_1km()).await.unwrap().score, 0.0);
        let res = ev
            .evaluate_with(&route_1km(), EvaluateOptions::at(later))
            .await
            .unwrap();
        assert!(res.score > 0.0);
    }

    #[tokio::test]
    async fn store_failure_is_not_a_zero_score() {
        let ev = RiskEvaluator::new(Arc::new(DownStore), &EngineConfig::default()).unwrap();
        let err = ev.evaluate(&route_1km()).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn timeout_cancels() {
        let ev = RiskEvaluator::new(Arc::new(SlowStore), &EngineConfig::default()).unwrap();
        let opts = EvaluateOptions::default().with_timeout(Duration::from_millis(20));
        let err = ev.evaluate_with(&route_1km(), opts).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[tokio::test]
    async fn explicit_cancellation() {
        let ev = RiskEvaluator::new(Arc::new(SlowStore), &EngineConfig::default()).unwrap();
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        let task = {
            let ev = ev.clone();
            tokio::spawn(async move {
                ev.evaluate_with(&route_1km(), EvaluateOptions::default().with_cancel(token))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[tokio::test]
    async fn pre_cancelled_token_never_queries() {
        let ev = RiskEvaluator::new(Arc::new(SlowStore), &EngineConfig::default()).unwrap();
        let source = CancelSource::new();
        source.cancel();
        let opts = EvaluateOptions::default().with_cancel(source.token());
        let err = ev.evaluate_with(&route_1km(), opts).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_while_consuming_hits() {
        let source = Arc::new(CancelSource::new());
        let store = CancellingStore {
            source: Arc::clone(&source),
        };
        let ev = RiskEvaluator::new(Arc::new(store), &EngineConfig::default()).unwrap();
        let opts = EvaluateOptions::default().with_cancel(source.token());
        let err = ev.evaluate_with(&route_1km(), opts).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[tokio::test]
    async fn deadline_while_consuming_hits() {
        let ev = RiskEvaluator::new(Arc::new(SlowHitsStore), &EngineConfig::default()).unwrap();
        let opts = EvaluateOptions::default().with_timeout(Duration::from_millis(10));
        let err = ev.evaluate_with(&route_1km(), opts).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);

        // The same hits finish within a generous deadline.
        let opts = EvaluateOptions::default().with_timeout(Duration::from_secs(5));
        let res = ev.evaluate_with(&route_1km(), opts).await.unwrap();
        assert_eq!(res.contributions.len(), 3);
    }

    #[tokio::test]
    async fn type_filter_limits_contributions() {
        let store = store_with(vec![
            band(1, HazardType::Flood, Severity::Extreme, -0.01, KM / 2.0),
            band(2, HazardType::Weather, Severity::Minor, -0.01, 0.02),
        ]);
        let ev = evaluator(store);

        let weather = EvaluateOptions::default().with_hazard_types([HazardType::Weather]);
        let res = ev.evaluate_with(&route_1km(), weather).await.unwrap();
        assert_eq!(res.contributions.len(), 1);
        assert_eq!(res.contributions[0].hazard.id, id(2));
        assert!((res.score - 0.3).abs() < 1e-6);

        let nothing = EvaluateOptions::default().with_hazard_types([]);
        let res = ev.evaluate_with(&route_1km(), nothing).await.unwrap();
        assert_eq!(res.score, 0.0);

        let ice = EvaluateOptions::default().with_hazard_types([HazardType::Ice]);
        let near = ev.hazards_near(Point::new(0.0, 0.0), 5_000.0, ice).await.unwrap();
        assert!(near.is_empty());
    }

    #[tokio::test]
    async fn risk_factors_split_the_score() {
        let store = store_with(vec![
            band(1, HazardType::Flood, Severity::Extreme, -0.01, KM / 2.0),
            band(2, HazardType::Weather, Severity::Minor, -0.01, 0.02),
            band(3, HazardType::Weather, Severity::Minor, -0.01, KM / 2.0),
        ]);
        let res = evaluator(store).evaluate(&route_1km()).await.unwrap();
        let factors = res.risk_factors();
        assert_eq!(factors.len(), 2);
        let sum: f64 = factors.values().sum();
        assert!((sum - res.score).abs() < 1e-12);
        // Flood 0.5 against weather 0.3 + 0.15.
        assert!((factors[&HazardType::Flood] / factors[&HazardType::Weather] - 0.5 / 0.45).abs() < 1e-3);

        let empty = evaluator(Arc::new(InMemoryHazardStore::new()))
            .evaluate(&route_1km())
            .await
            .unwrap();
        assert!(empty.risk_factors().is_empty());
    }

    #[tokio::test]
    async fn hazards_near_are_decayed_and_ordered() {
        let store = store_with(vec![
            disc(1, HazardType::Flood, Severity::Minor, [0.02, 0.0], 10.0),
            disc(2, HazardType::Flood, Severity::Minor, [0.0, 0.0], 10.0),
        ]);
        let near = evaluator(store)
            .hazards_near(Point::new(0.0, 0.0), 5_000.0, EvaluateOptions::default())
            .await
            .unwrap();
        assert_eq!(near.len(), 2);
        assert_eq!(near[0].hazard.id, id(2));
        assert_eq!(near[0].penalty, 0.5);
        assert!(near[1].penalty < near[0].penalty);
        assert!(matches!(near[1].measure, Measure::Proximity(d) if d > 2_000.0));
    }
}

// ── Comparator ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod compare {
    use std::sync::Arc;

    use super::helpers::*;
    use crate::compare::{trade_off, RiskLabel, RouteComparator};
    use crate::config::LabelThresholds;
    use crate::geometry::RouteGeometry;
    use crate::hazard::{HazardType, Severity};
    use crate::store::InMemoryHazardStore;

    fn comparator(store: Arc<InMemoryHazardStore>) -> RouteComparator<InMemoryHazardStore> {
        RouteComparator::new(evaluator(store), LabelThresholds::default()).unwrap()
    }

    /// 1 km route along latitude `lat`.
    fn lane(lat: f64) -> RouteGeometry {
        RouteGeometry::new([[0.0, lat], [KM, lat]]).unwrap()
    }

    #[tokio::test]
    async fn ranks_safest_first() {
        // Hazard band covers only the equator lane.
        let store = store_with(vec![band(1, HazardType::Flood, Severity::Extreme, -0.01, 0.02)]);
        let routes = vec![lane(0.0), lane(0.05)];
        let ranked = comparator(store).compare(routes).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].input_index, 1);
        assert_eq!(ranked[0].label, RiskLabel::Safe);
        assert_eq!(ranked[1].input_index, 0);
        assert_eq!(ranked[1].label, RiskLabel::Avoid);
        assert_eq!((ranked[0].rank, ranked[1].rank), (0, 1));
    }

    #[tokio::test]
    async fn ties_keep_input_order() {
        let c = comparator(Arc::new(InMemoryHazardStore::new()));
        let ranked = c
            .compare(vec![lane(0.3), lane(0.1), lane(0.2)])
            .await
            .unwrap();
        let order: Vec<_> = ranked.iter().map(|r| r.input_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(ranked.iter().all(|r| r.risk.score == 0.0));
    }

    #[tokio::test]
    async fn empty_input_yields_empty_ranking() {
        let c = comparator(Arc::new(InMemoryHazardStore::new()));
        let ranked = c.compare(Vec::new()).await.unwrap();
        assert!(ranked.is_empty());
        assert!(trade_off(&ranked).is_none());
    }

    #[test]
    fn labels_follow_thresholds() {
        let t = LabelThresholds::default();
        assert_eq!(t.label(0.0), RiskLabel::Safe);
        assert_eq!(t.label(0.25), RiskLabel::Safe);
        assert_eq!(t.label(0.26), RiskLabel::Caution);
        assert_eq!(t.label(0.5), RiskLabel::Caution);
        assert_eq!(t.label(0.51), RiskLabel::Avoid);

        let strict = LabelThresholds {
            safe_max: 0.1,
            caution_max: 0.2,
        };
        assert_eq!(strict.label(0.15), RiskLabel::Caution);
        assert!(LabelThresholds { safe_max: 0.6, caution_max: 0.5 }.validate().is_err());
    }

    #[tokio::test]
    async fn trade_off_compares_safest_with_shortest() {
        // The short route runs through a storm band; the long one stays north of it.
        let store = store_with(vec![band(1, HazardType::Weather, Severity::Severe, -0.01, 0.02)]);
        let short = lane(0.0);
        let long = RouteGeometry::new([[0.0, 0.02], [KM, 0.02], [KM, 0.05]]).unwrap();
        let ranked = comparator(store).compare(vec![short, long]).await.unwrap();
        let summary = trade_off(&ranked).unwrap();
        assert_eq!(summary.shortest, 0);
        assert_eq!(summary.safest, ranked[0].input_index);
        assert_eq!(summary.safest, 1);
        assert!((summary.risk_reduction_percent - 100.0).abs() < 1e-9);
        assert!(summary.extra_distance_m > 3_000.0);
    }

    #[tokio::test]
    async fn no_reduction_when_shortest_is_clean() {
        let c = comparator(Arc::new(InMemoryHazardStore::new()));
        let ranked = c.compare(vec![lane(0.0)]).await.unwrap();
        let summary = trade_off(&ranked).unwrap();
        assert_eq!(summary.safest, summary.shortest);
        assert_eq!(summary.risk_reduction_percent, 0.0);
        assert_eq!(summary.extra_distance_m, 0.0);
    }
}

// ── Hazard grid & planner ─────────────────────────────────────────────────────

#[cfg(test)]
mod planner {
    use super::helpers::*;
    use crate::config::GridConfig;
    use crate::error::EngineError;
    use crate::graph::NavigationGraph;
    use crate::hazard::{HazardType, Severity};
    use crate::penalty::PenaltyModel;
    use crate::safety::HazardGrid;

    fn grid_config() -> GridConfig {
        GridConfig {
            resolution: 9,
            halo_m: 100.0,
            max_cells_per_hazard: 500_000,
            corridor_margin_m: 1_000.0,
        }
    }

    /// A(0,0) - B(0.005,0) - D(0.01,0) along the equator, plus a northern
    /// detour A - C(0.005,0.008) - D.
    fn diamond() -> NavigationGraph {
        let mut g = NavigationGraph::new();
        let a = g.add_node(0.0, 0.0);
        let b = g.add_node(0.005, 0.0);
        let c = g.add_node(0.005, 0.008);
        let d = g.add_node(0.01, 0.0);
        g.add_road(a, b);
        g.add_road(b, d);
        g.add_road(a, c);
        g.add_road(c, d);
        g
    }

    #[test]
    fn grid_paints_hazard_cells() {
        let hazard = disc(1, HazardType::Flood, Severity::Extreme, [0.005, 0.0], 150.0);
        let grid = HazardGrid::rasterize([&hazard], &PenaltyModel::default(), &grid_config()).unwrap();
        assert!(!grid.is_empty());
        assert!(grid.risk_at(0.005, 0.0) > 0.9);
        assert_eq!(grid.risk_at(0.05, 0.05), 0.0);
        assert_eq!(grid.risk_at(0.0, 120.0), 0.0, "invalid coordinates");
    }

    #[test]
    fn wide_hazard_is_painted_edge_to_edge() {
        // About 40 km east to west.
        let hazard = band(1, HazardType::Flood, Severity::Extreme, -0.18, 0.18);
        let grid = HazardGrid::rasterize([&hazard], &PenaltyModel::default(), &grid_config()).unwrap();
        for km in [0.0, 15.0, 19.0] {
            let lon = km * KM;
            assert!(grid.risk_at(lon, 0.0) > 0.99, "{km} km east");
            assert!(grid.risk_at(-lon, 0.0) > 0.99, "{km} km west");
        }
        assert_eq!(grid.risk_at(0.2, 0.0), 0.0, "beyond the halo");
    }

    #[test]
    fn oversized_hazard_is_refused() {
        let hazard = band(1, HazardType::Flood, Severity::Extreme, -0.18, 0.18);
        let config = GridConfig {
            max_cells_per_hazard: 100,
            ..grid_config()
        };
        let err = HazardGrid::rasterize([&hazard], &PenaltyModel::default(), &config).err();
        assert!(matches!(err, Some(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn grid_rejects_bad_resolution() {
        let config = GridConfig {
            resolution: 16,
            ..grid_config()
        };
        let none: [&crate::hazard::HazardRecord; 0] = [];
        assert!(HazardGrid::rasterize(none, &PenaltyModel::default(), &config).is_err());
    }

    #[test]
    fn fastest_goes_through_hazard_safest_detours() {
        let g = diamond();
        assert_eq!(g.node_count(), 4);
        assert_eq!(g.edge_count(), 8);

        let hazard = disc(1, HazardType::Flood, Severity::Extreme, [0.005, 0.0], 150.0);
        let grid = HazardGrid::rasterize([&hazard], &PenaltyModel::default(), &grid_config()).unwrap();

        let fastest = g.plan([0.0, 0.0], [0.01, 0.0], 0.0, &grid).unwrap().unwrap();
        let safest = g.plan([0.0, 0.0], [0.01, 0.0], 8.0, &grid).unwrap().unwrap();

        assert_eq!(fastest.geometry.vertices().count(), 3);
        assert!(fastest.geometry.vertices().all(|[_, lat]| lat == 0.0));
        assert!(safest.geometry.vertices().any(|[_, lat]| lat > 0.0));
        assert!(safest.distance_m > fastest.distance_m);
        assert!((fastest.distance_m - fastest.geometry.length_m()).abs() < 1e-6);
    }

    #[test]
    fn crossing_roads_still_plan() {
        // a-b and c-d cross like a bridge over a road, with no shared node.
        let mut g = NavigationGraph::new();
        let a = g.add_node(0.0, 0.0);
        let b = g.add_node(0.01, 0.01);
        let c = g.add_node(0.01, 0.0);
        let d = g.add_node(0.0, 0.01);
        g.add_road(a, b);
        g.add_road(b, c);
        g.add_road(c, d);

        let grid = HazardGrid::empty(h3o::Resolution::Nine);
        let planned = g.plan([0.0, 0.0], [0.0, 0.01], 0.0, &grid).unwrap().unwrap();
        assert_eq!(planned.geometry.vertices().count(), 4);
        assert!((planned.distance_m - planned.geometry.length_m()).abs() < 1e-6);
    }

    #[test]
    fn planning_edge_cases() {
        let g = diamond();
        let grid = HazardGrid::empty(h3o::Resolution::Nine);
        // Both ends snap to A.
        assert!(g.plan([0.0, 0.0], [0.0001, 0.0], 1.0, &grid).unwrap().is_none());
        assert!(g.plan([0.0, 0.0], [0.01, 0.0], -1.0, &grid).is_err());
        assert!(NavigationGraph::new()
            .plan([0.0, 0.0], [0.01, 0.0], 0.0, &grid)
            .unwrap()
            .is_none());
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod config {
    use crate::config::{Aggregation, ServiceConfig};

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.engine.aggregation, Aggregation::Mean);
        assert_eq!(config.profiles.len(), 3);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r#"{
            "bind": "127.0.0.1:8080",
            "engine": {
                "aggregation": "sum",
                "penalty": { "base": { "flood": 0.7 } },
                "labels": { "safe_max": 0.2 }
            }
        }"#;
        let config: ServiceConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.engine.aggregation, Aggregation::Sum);
        assert_eq!(config.engine.penalty.base.flood, 0.7);
        assert_eq!(config.engine.penalty.base.ice, 0.6);
        assert_eq!(config.engine.labels.safe_max, 0.2);
        assert_eq!(config.engine.labels.caution_max, 0.5);
        assert_eq!(config.grid.resolution, 9);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = ServiceConfig::default();
        config.engine.labels.caution_max = 1.5;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.profiles[1].name = "fastest".into();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.engine.overlap_unit_m = 0.0;
        assert!(config.validate().is_err());
    }
}
