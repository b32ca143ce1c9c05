//! `hazard-route`: hazard-aware route risk scoring.
//!
//! # Crate layout
//!
//! | Module        | Contents                                                         |
//! |---------------|------------------------------------------------------------------|
//! | [`hazard`]    | `HazardRecord`, `HazardType`, `Severity`, `HazardGeometry`       |
//! | [`geometry`]  | `RouteGeometry` validation and overlap measures                  |
//! | [`store`]     | `HazardStore` trait, R-tree backed `InMemoryHazardStore`         |
//! | [`penalty`]   | `PenaltyModel` and its tunable `PenaltyPolicy`                   |
//! | [`evaluator`] | `RiskEvaluator::evaluate`, `RouteRiskResult`                     |
//! | [`compare`]   | `RouteComparator::compare`, risk labels, trade-off summary       |
//! | [`cancel`]    | Timeouts and cancellation tokens for store queries               |
//! | [`safety`]    | `HazardGrid`: H3 cells carrying hazard penalties                 |
//! | [`graph`]     | `NavigationGraph`: road graph and hazard-weighted A*             |
//! | [`api`]       | axum router exposing the engine over HTTP                        |
//! | [`config`]    | `EngineConfig`, `ServiceConfig`                                  |
//! | [`error`]     | `EngineError`, `EngineResult<T>`                                 |
//!
//! # Feature flags
//!
//! | Flag  | Effect                                                  |
//! |-------|---------------------------------------------------------|
//! | `osm` | Enables OSM PBF road network loading via `osmpbf`.      |

pub mod api;
pub mod cancel;
pub mod compare;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod geometry;
pub mod graph;
pub mod hazard;
pub mod penalty;
pub mod safety;
pub mod store;

#[cfg(test)]
mod tests;

pub use cancel::{CancelSource, CancelToken};
pub use compare::{trade_off, RankedRoute, RiskLabel, RouteComparator, TradeOffSummary};
pub use config::{Aggregation, EngineConfig, LabelThresholds, ServiceConfig};
pub use error::{EngineError, EngineResult};
pub use evaluator::{EvaluateOptions, Measure, PenaltyContribution, RiskEvaluator, RouteRiskResult};
pub use geometry::RouteGeometry;
pub use hazard::{HazardGeometry, HazardId, HazardRecord, HazardType, Severity};
pub use penalty::{PenaltyModel, PenaltyPolicy};
pub use store::{HazardHits, HazardStore, InMemoryHazardStore};
