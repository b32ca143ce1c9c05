//! Hazard penalty model.
//!
//! `penalty = base(type) * multiplier(severity) * decay(distance)`, where
//! `decay(d) = 1 / (1 + d / decay_scale_m)`. The model holds no mutable
//! state; every call is a pure function of its inputs and the policy.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::hazard::{HazardType, Severity};

/// Base penalty per hazard type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasePenalties {
    pub flood: f64,
    pub weather: f64,
    pub wildfire: f64,
    pub ice: f64,
    pub other: f64,
}

impl Default for BasePenalties {
    fn default() -> Self {
        Self {
            flood: 0.5,
            weather: 0.3,
            wildfire: 0.4,
            ice: 0.6,
            other: 0.1,
        }
    }
}

impl BasePenalties {
    pub fn get(&self, hazard_type: HazardType) -> f64 {
        match hazard_type {
            HazardType::Flood => self.flood,
            HazardType::Weather => self.weather,
            HazardType::Wildfire => self.wildfire,
            HazardType::Ice => self.ice,
            HazardType::Other => self.other,
        }
    }
}

/// Penalty multiplier per severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityMultipliers {
    pub minor: f64,
    pub moderate: f64,
    pub severe: f64,
    pub extreme: f64,
}

impl Default for SeverityMultipliers {
    fn default() -> Self {
        Self {
            minor: 1.0,
            moderate: 1.2,
            severe: 1.5,
            extreme: 2.0,
        }
    }
}

impl SeverityMultipliers {
    pub fn get(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Minor => self.minor,
            Severity::Moderate => self.moderate,
            Severity::Severe => self.severe,
            Severity::Extreme => self.extreme,
        }
    }
}

/// Tunable penalty constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyPolicy {
    pub base: BasePenalties,
    pub severity: SeverityMultipliers,
    /// Distance at which the penalty has halved, in metres.
    pub decay_scale_m: f64,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        Self {
            base: BasePenalties::default(),
            severity: SeverityMultipliers::default(),
            decay_scale_m: 1_000.0,
        }
    }
}

impl PenaltyPolicy {
    pub fn validate(&self) -> EngineResult<()> {
        for t in HazardType::ALL {
            let v = self.base.get(t);
            if !v.is_finite() || v < 0.0 {
                return Err(EngineError::InvalidArgument(format!(
                    "base penalty for {t} must be finite and non-negative, got {v}"
                )));
            }
        }

        let multipliers = Severity::ALL.map(|s| self.severity.get(s));
        if multipliers.iter().any(|m| !m.is_finite() || *m < 0.0) {
            return Err(EngineError::InvalidArgument(
                "severity multipliers must be finite and non-negative".into(),
            ));
        }
        if multipliers.windows(2).any(|w| w[0] > w[1]) {
            return Err(EngineError::InvalidArgument(
                "severity multipliers must not decrease with severity".into(),
            ));
        }

        if !self.decay_scale_m.is_finite() || self.decay_scale_m <= 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "decay scale must be positive, got {}",
                self.decay_scale_m
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyModel {
    policy: PenaltyPolicy,
}

impl Default for PenaltyModel {
    fn default() -> Self {
        Self {
            policy: PenaltyPolicy::default(),
        }
    }
}

impl PenaltyModel {
    pub fn new(policy: PenaltyPolicy) -> EngineResult<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &PenaltyPolicy {
        &self.policy
    }

    /// Distance decay factor: `1.0` at zero distance, tending to `0.0`.
    pub fn decay(&self, distance_m: f64) -> EngineResult<f64> {
        if !distance_m.is_finite() || distance_m < 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "distance must be a non-negative number of metres, got {distance_m}"
            )));
        }
        Ok(1.0 / (1.0 + distance_m / self.policy.decay_scale_m))
    }

    /// Unclamped penalty of one hazard at `distance_m` metres.
    pub fn penalty(
        &self,
        hazard_type: HazardType,
        severity: Severity,
        distance_m: f64,
    ) -> EngineResult<f64> {
        let decay = self.decay(distance_m)?;
        Ok(self.policy.base.get(hazard_type) * self.policy.severity.get(severity) * decay)
    }
}
