//! Cost estimation seam for paid capability calls.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A priced unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub capability: String,
    pub target_file: Option<String>,
    /// 1-indexed healing iteration, when the call belongs to one.
    pub iteration: Option<u32>,
}

pub trait CostEstimator: Send + Sync {
    /// Projected cost before the call is made.
    fn estimate(&self, unit: &UnitOfWork) -> f64;

    /// Cost to book after the call when the backend did not report one.
    fn actual(&self, unit: &UnitOfWork) -> f64 {
        self.estimate(unit)
    }
}

/// Flat per-capability price list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatCostEstimator {
    /// Price for capabilities missing from `per_capability`.
    pub default: f64,
    pub per_capability: HashMap<String, f64>,
}

impl FlatCostEstimator {
    pub fn new(default: f64) -> Self {
        Self {
            default,
            per_capability: HashMap::new(),
        }
    }

    pub fn with_price(mut self, capability: impl Into<String>, price: f64) -> Self {
        self.per_capability.insert(capability.into(), price);
        self
    }
}

impl CostEstimator for FlatCostEstimator {
    fn estimate(&self, unit: &UnitOfWork) -> f64 {
        self.per_capability
            .get(&unit.capability)
            .copied()
            .unwrap_or(self.default)
    }
}
