//! Cost budget arithmetic for bounded retry loops.

/// Running cost against a fixed ceiling.
///
/// Costs are non-negative; negative inputs are clamped to zero. A `NaN`
/// estimate is never admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct CostBudget {
    max_cost: f64,
    spent: f64,
}

impl CostBudget {
    pub fn new(max_cost: f64) -> Self {
        Self {
            max_cost: max_cost.max(0.0),
            spent: 0.0,
        }
    }

    pub fn max_cost(&self) -> f64 {
        self.max_cost
    }

    pub fn spent(&self) -> f64 {
        self.spent
    }

    /// Whether spending `estimate` more would stay within the ceiling.
    pub fn admits(&self, estimate: f64) -> bool {
        if estimate.is_nan() {
            return false;
        }
        self.spent + estimate.max(0.0) <= self.max_cost
    }

    /// Recorded spend is past the ceiling. Possible when a call costs more
    /// than its estimate.
    pub fn is_overspent(&self) -> bool {
        self.spent > self.max_cost
    }

    pub fn record(&mut self, cost: f64) {
        if cost.is_finite() {
            self.spent += cost.max(0.0);
        }
    }
}
