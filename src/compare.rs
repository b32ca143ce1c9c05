//! Ranking of candidate routes by risk.

use chrono::Utc;
use futures::future::try_join_all;
use itertools::Itertools;
use serde::Serialize;

use crate::config::LabelThresholds;
use crate::error::EngineResult;
use crate::evaluator::{EvaluateOptions, RiskEvaluator, RouteRiskResult};
use crate::geometry::RouteGeometry;
use crate::store::HazardStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLabel {
    Safe,
    Caution,
    Avoid,
}

impl LabelThresholds {
    pub fn label(&self, score: f64) -> RiskLabel {
        if score <= self.safe_max {
            RiskLabel::Safe
        } else if score <= self.caution_max {
            RiskLabel::Caution
        } else {
            RiskLabel::Avoid
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankedRoute {
    /// Position in the ranking, 0 = safest.
    pub rank: usize,
    /// Position in the caller's input.
    pub input_index: usize,
    pub route: RouteGeometry,
    pub risk: RouteRiskResult,
    pub label: RiskLabel,
}

/// Safety-versus-distance trade-off between the safest and the shortest
/// candidate of one comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeOffSummary {
    pub safest: usize,
    pub shortest: usize,
    /// How much lower the safest score is than the shortest's, in percent.
    pub risk_reduction_percent: f64,
    /// Extra metres driven by taking the safest route.
    pub extra_distance_m: f64,
}

pub struct RouteComparator<S> {
    evaluator: RiskEvaluator<S>,
    thresholds: LabelThresholds,
}

impl<S: HazardStore> RouteComparator<S> {
    pub fn new(evaluator: RiskEvaluator<S>, thresholds: LabelThresholds) -> EngineResult<Self> {
        thresholds.validate()?;
        Ok(Self {
            evaluator,
            thresholds,
        })
    }

    pub fn evaluator(&self) -> &RiskEvaluator<S> {
        &self.evaluator
    }

    pub fn label(&self, score: f64) -> RiskLabel {
        self.thresholds.label(score)
    }

    pub async fn compare(&self, routes: Vec<RouteGeometry>) -> EngineResult<Vec<RankedRoute>> {
        self.compare_with(routes, EvaluateOptions::default()).await
    }

    /// Evaluate every candidate concurrently against one instant and sort
    /// ascending by score. Equal scores keep input order. The first failure
    /// fails the comparison.
    pub async fn compare_with(
        &self,
        routes: Vec<RouteGeometry>,
        mut options: EvaluateOptions,
    ) -> EngineResult<Vec<RankedRoute>> {
        options.as_of = Some(options.as_of.unwrap_or_else(Utc::now));

        let results = try_join_all(
            routes
                .iter()
                .map(|route| self.evaluator.evaluate_with(route, options.clone())),
        )
        .await?;

        let ranked = routes
            .into_iter()
            .zip(results)
            .enumerate()
            .sorted_by(|(_, (_, a)), (_, (_, b))| a.score.total_cmp(&b.score))
            .enumerate()
            .map(|(rank, (input_index, (route, risk)))| RankedRoute {
                rank,
                input_index,
                label: self.thresholds.label(risk.score),
                route,
                risk,
            })
            .collect();
        Ok(ranked)
    }
}

/// Compare the safest candidate (first in `ranked`) with the shortest one.
///
/// `None` for an empty ranking.
pub fn trade_off(ranked: &[RankedRoute]) -> Option<TradeOffSummary> {
    let safest = ranked.first()?;
    let shortest = ranked.iter().min_by(|a, b| {
        a.route
            .length_m()
            .total_cmp(&b.route.length_m())
            .then(a.input_index.cmp(&b.input_index))
    })?;

    let risk_reduction_percent = if shortest.risk.score > 0.0 {
        (shortest.risk.score - safest.risk.score) / shortest.risk.score * 100.0
    } else {
        0.0
    };
    Some(TradeOffSummary {
        safest: safest.input_index,
        shortest: shortest.input_index,
        risk_reduction_percent,
        extra_distance_m: safest.route.length_m() - shortest.route.length_m(),
    })
}
