//! Engine policy and service configuration.
//!
//! Every struct deserializes with `#[serde(default)]`, so a JSON config file
//! only needs the keys it overrides.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::penalty::PenaltyPolicy;

/// How per-hazard contributions combine into a route score.
///
/// `Mean` favours routes that cross few distinct hazards; `Sum` favours
/// routes with lower total exposure. The two can order the same candidates
/// differently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Mean,
    Sum,
}

impl Aggregation {
    pub fn apply(self, total: f64, contributing: usize) -> f64 {
        match self {
            Aggregation::Mean if contributing > 0 => total / contributing as f64,
            Aggregation::Mean => 0.0,
            Aggregation::Sum => total,
        }
    }
}

/// Score thresholds for the `safe | caution | avoid` labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelThresholds {
    /// Scores at or below this are `safe`.
    pub safe_max: f64,
    /// Scores at or below this (and above `safe_max`) are `caution`.
    pub caution_max: f64,
}

impl Default for LabelThresholds {
    fn default() -> Self {
        Self {
            safe_max: 0.25,
            caution_max: 0.5,
        }
    }
}

impl LabelThresholds {
    pub fn validate(&self) -> EngineResult<()> {
        let ordered = 0.0 <= self.safe_max
            && self.safe_max <= self.caution_max
            && self.caution_max <= 1.0;
        if !ordered {
            return Err(EngineError::InvalidArgument(format!(
                "label thresholds must satisfy 0 <= safe_max ({}) <= caution_max ({}) <= 1",
                self.safe_max, self.caution_max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub penalty: PenaltyPolicy,
    pub aggregation: Aggregation,
    /// Overlap length that weighs 1.0 in a contribution, in metres.
    pub overlap_unit_m: f64,
    pub labels: LabelThresholds,
    /// Default per-query deadline; `null` disables it.
    pub query_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            penalty: PenaltyPolicy::default(),
            aggregation: Aggregation::Mean,
            overlap_unit_m: 1_000.0,
            labels: LabelThresholds::default(),
            query_timeout_ms: Some(5_000),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        self.penalty.validate()?;
        self.labels.validate()?;
        if !self.overlap_unit_m.is_finite() || self.overlap_unit_m <= 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "overlap unit must be positive, got {}",
                self.overlap_unit_m
            )));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }
}

/// Hazard rasterization settings for the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// H3 resolution, 0..=15.
    pub resolution: u8,
    /// Cells whose centre is further than this from a hazard stay empty.
    pub halo_m: f64,
    /// Upper bound on the cells one hazard (plus halo) may cover.
    pub max_cells_per_hazard: usize,
    /// Extra radius around the origin/destination corridor when collecting hazards.
    pub corridor_margin_m: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            resolution: 9,
            halo_m: 250.0,
            max_cells_per_hazard: 500_000,
            corridor_margin_m: 2_000.0,
        }
    }
}

/// A named planner preset: `alpha` scales how strongly cell risk inflates
/// edge cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteProfile {
    pub name: String,
    pub alpha: f64,
}

impl RouteProfile {
    pub fn new(name: impl Into<String>, alpha: f64) -> Self {
        Self {
            name: name.into(),
            alpha,
        }
    }
}

fn default_profiles() -> Vec<RouteProfile> {
    vec![
        RouteProfile::new("fastest", 0.0),
        RouteProfile::new("balanced", 2.0),
        RouteProfile::new("safest", 8.0),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    /// JSON array of hazard records loaded at startup.
    pub hazards_path: Option<PathBuf>,
    /// Road network extract (`.osm.pbf`, needs the `osm` feature).
    pub network_path: Option<PathBuf>,
    /// Period of the expired-hazard sweep; `0` disables it.
    pub purge_interval_secs: u64,
    pub engine: EngineConfig,
    pub grid: GridConfig,
    pub profiles: Vec<RouteProfile>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            hazards_path: None,
            network_path: None,
            purge_interval_secs: 300,
            engine: EngineConfig::default(),
            grid: GridConfig::default(),
            profiles: default_profiles(),
        }
    }
}

impl ServiceConfig {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ServiceConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate().context("engine policy")?;

        if self.grid.resolution > 15 {
            bail!("grid resolution {} is above 15", self.grid.resolution);
        }
        if !self.grid.halo_m.is_finite() || self.grid.halo_m < 0.0 {
            bail!("grid halo must be non-negative, got {}", self.grid.halo_m);
        }
        if self.grid.max_cells_per_hazard == 0 {
            bail!("grid max_cells_per_hazard must be positive");
        }
        if !self.grid.corridor_margin_m.is_finite() || self.grid.corridor_margin_m < 0.0 {
            bail!(
                "corridor margin must be non-negative, got {}",
                self.grid.corridor_margin_m
            );
        }

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.name.is_empty() || !seen.insert(profile.name.as_str()) {
                bail!("route profile names must be unique and non-empty");
            }
            if !profile.alpha.is_finite() || profile.alpha < 0.0 {
                bail!("profile {} has invalid alpha {}", profile.name, profile.alpha);
            }
        }
        Ok(())
    }
}
