//! Route risk evaluation.
//!
//! A route's score is built from one contribution per intersecting hazard:
//! `penalty(type, severity, 0) * overlap_m / overlap_unit_m`. Contributions
//! are combined by the configured [`Aggregation`] and clamped to `[0, 1]`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geo::Point;
use tracing::debug;

use crate::cancel::{guarded, Budget, CancelToken};
use crate::config::{Aggregation, EngineConfig};
use crate::error::EngineResult;
use crate::geometry::RouteGeometry;
use crate::hazard::{HazardRecord, HazardType};
use crate::penalty::PenaltyModel;
use crate::store::HazardStore;

/// Geometric measure behind a contribution, in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measure {
    /// Length of route inside the hazard.
    Overlap(f64),
    /// Distance from a query point to the hazard.
    Proximity(f64),
}

impl Measure {
    pub fn meters(self) -> f64 {
        match self {
            Measure::Overlap(m) | Measure::Proximity(m) => m,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PenaltyContribution {
    pub hazard: Arc<HazardRecord>,
    pub measure: Measure,
    pub penalty: f64,
}

#[derive(Debug, Clone)]
pub struct RouteRiskResult {
    /// Always within `[0, 1]`.
    pub score: f64,
    /// In the order the store yielded the hazards.
    pub contributions: Vec<PenaltyContribution>,
}

impl RouteRiskResult {
    /// The score split by hazard type, in proportion to each type's share of
    /// the summed contributions. The parts add up to `score`.
    pub fn risk_factors(&self) -> BTreeMap<HazardType, f64> {
        let mut factors: BTreeMap<HazardType, f64> = BTreeMap::new();
        for c in &self.contributions {
            *factors.entry(c.hazard.hazard_type).or_default() += c.penalty;
        }
        let total: f64 = factors.values().sum();
        if total > 0.0 {
            for share in factors.values_mut() {
                *share = self.score * *share / total;
            }
        }
        factors
    }
}

/// Per-call knobs. Unset fields fall back to "now" and the configured timeout.
#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions {
    /// Instant at which hazard validity is judged, e.g. a departure time.
    pub as_of: Option<DateTime<Utc>>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    /// Only these hazard types count; `None` counts every type.
    pub hazard_types: Option<BTreeSet<HazardType>>,
}

impl EvaluateOptions {
    pub fn at(as_of: DateTime<Utc>) -> Self {
        Self {
            as_of: Some(as_of),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_hazard_types(mut self, types: impl IntoIterator<Item = HazardType>) -> Self {
        self.hazard_types = Some(types.into_iter().collect());
        self
    }

    fn counts(&self, hazard: &HazardRecord) -> bool {
        self.hazard_types
            .as_ref()
            .is_none_or(|types| types.contains(&hazard.hazard_type))
    }
}

pub struct RiskEvaluator<S> {
    store: Arc<S>,
    model: PenaltyModel,
    aggregation: Aggregation,
    overlap_unit_m: f64,
    default_timeout: Option<Duration>,
}

impl<S> Clone for RiskEvaluator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            model: self.model.clone(),
            aggregation: self.aggregation,
            overlap_unit_m: self.overlap_unit_m,
            default_timeout: self.default_timeout,
        }
    }
}

impl<S: HazardStore> RiskEvaluator<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            model: PenaltyModel::new(config.penalty.clone())?,
            aggregation: config.aggregation,
            overlap_unit_m: config.overlap_unit_m,
            default_timeout: config.query_timeout(),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn model(&self) -> &PenaltyModel {
        &self.model
    }

    pub async fn evaluate(&self, route: &RouteGeometry) -> EngineResult<RouteRiskResult> {
        self.evaluate_with(route, EvaluateOptions::default()).await
    }

    /// Score `route`. A store failure, timeout or cancellation fails the whole
    /// evaluation; no partial score is produced.
    pub async fn evaluate_with(
        &self,
        route: &RouteGeometry,
        options: EvaluateOptions,
    ) -> EngineResult<RouteRiskResult> {
        let as_of = options.as_of.unwrap_or_else(Utc::now);
        let timeout = options.timeout.or(self.default_timeout);
        let budget = Budget::start(timeout, options.cancel.clone());
        let hits = guarded(
            self.store.find_intersecting(route, as_of),
            budget.remaining(),
            budget.token(),
        )
        .await?;

        let mut total = 0.0;
        let mut contributions = Vec::new();
        for (hazard, overlap_m) in hits {
            budget.check()?;
            if !options.counts(&hazard) || !overlap_m.is_finite() || overlap_m <= 0.0 {
                continue;
            }
            let unit = self.model.penalty(hazard.hazard_type, hazard.severity, 0.0)?;
            let penalty = unit * overlap_m / self.overlap_unit_m;
            total += penalty;
            contributions.push(PenaltyContribution {
                hazard,
                measure: Measure::Overlap(overlap_m),
                penalty,
            });
        }

        let score = self
            .aggregation
            .apply(total, contributions.len())
            .clamp(0.0, 1.0);
        debug!(
            score,
            hazards = contributions.len(),
            length_m = route.length_m(),
            "route evaluated"
        );
        Ok(RouteRiskResult {
            score,
            contributions,
        })
    }

    /// Hazards within `radius_m` of `point`, nearest first, each with its
    /// distance-decayed penalty.
    pub async fn hazards_near(
        &self,
        point: Point<f64>,
        radius_m: f64,
        options: EvaluateOptions,
    ) -> EngineResult<Vec<PenaltyContribution>> {
        let as_of = options.as_of.unwrap_or_else(Utc::now);
        let timeout = options.timeout.or(self.default_timeout);
        let budget = Budget::start(timeout, options.cancel.clone());
        let hits = guarded(
            self.store.find_near(point, radius_m, as_of),
            budget.remaining(),
            budget.token(),
        )
        .await?;

        let mut near = Vec::new();
        for (hazard, distance_m) in hits {
            budget.check()?;
            if !options.counts(&hazard) {
                continue;
            }
            let penalty = self
                .model
                .penalty(hazard.hazard_type, hazard.severity, distance_m)?;
            near.push(PenaltyContribution {
                hazard,
                measure: Measure::Proximity(distance_m),
                penalty,
            });
        }
        Ok(near)
    }
}
