use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{FillStatistics, TrackedOrder};

/// Everything scoped to one ladder -> monitor -> exit run.
///
/// Owned by the controller and lent to the tracker; `reset()` is the only
/// way state crosses a cycle boundary (it doesn't).
#[derive(Debug, Clone)]
pub struct CycleState {
    pub orders: HashMap<String, TrackedOrder>,
    /// Submission order of `orders`
    pub created_ids: Vec<String>,
    /// Ids believed to be resting on the exchange
    pub pending: HashSet<String>,
    /// Ids already folded into `stats`; each enters at most once
    pub processed: HashSet<String>,
    /// `price_quantity` keys of submitted orders
    pub signatures: HashSet<String>,
    pub stats: FillStatistics,
    pub started_at: DateTime<Utc>,
}

impl CycleState {
    pub fn new() -> Self {
        Self {
            orders: HashMap::new(),
            created_ids: Vec::new(),
            pending: HashSet::new(),
            processed: HashSet::new(),
            signatures: HashSet::new(),
            stats: FillStatistics::default(),
            started_at: Utc::now(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_processed(&self, order_id: &str) -> bool {
        self.processed.contains(order_id)
    }

    /// Fold a fill once. Returns false if the id was already counted.
    pub fn fold_fill(&mut self, order_id: &str, amount: f64, quantity: f64) -> bool {
        if !self.processed.insert(order_id.to_string()) {
            return false;
        }
        self.stats.record_fill(amount, quantity);
        if let Some(order) = self.orders.get_mut(order_id) {
            order.processed = true;
        }
        true
    }

    /// Record an id as resolved without touching the statistics
    pub fn mark_resolved(&mut self, order_id: &str) {
        self.processed.insert(order_id.to_string());
        if let Some(order) = self.orders.get_mut(order_id) {
            order.processed = true;
        }
    }

    /// Orders still believed to be resting
    pub fn open_order_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}
