//! Audit record: the non-sensitive projection of a finished request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::billing::BillingInfo;
use super::capability::{Capability, Channel};
use super::upstream::UpstreamResult;
use crate::error::ErrorSource;

/// Per-step execution timing captured by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepTiming {
    pub step: String,
    pub status: String,
    pub duration_ms: u64,
}

/// What the audit-log step ships to the append-only sink.
///
/// Must never contain a key matching `password|secret|token|api_key` at any
/// depth; `api_key_id` is the opaque row id, not the key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub trace_id: String,
    pub channel: Channel,
    pub capability: Capability,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub key_id: Option<String>,
    pub requested_model: Option<String>,
    pub upstream: Option<UpstreamResult>,
    pub billing: Option<BillingInfo>,
    pub steps: Vec<StepTiming>,
    pub success: bool,
    pub error_source: Option<ErrorSource>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
}
