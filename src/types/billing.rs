//! Billing summary and quota records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::error::QuotaKind;

/// Canonical billing summary written to the context by the billing step.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BillingInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub cache_hit: bool,
}

/// Per-key quota standing for one quota kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub api_key_id: String,
    pub kind: QuotaKind,
    pub total: u64,
    pub used: u64,
    /// Seconds until `used` resets.
    pub reset_period_seconds: u64,
    pub period_start: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}
