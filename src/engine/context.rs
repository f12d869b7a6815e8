//! Workflow context: the single shared state of one request.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use crate::auth::SignatureParams;
use crate::error::{ErrorSource, GatewayError};
use crate::events::{StatusEmitter, StepState};
use crate::repo::ApiKeyRecord;
use crate::template::RenderedRequest;
use crate::types::{
    AuditRecord, BillingInfo, Capability, Channel, InboundDialect, StepTiming, UpstreamCandidate,
    UpstreamResult,
};
use crate::upstream::StreamFrame;
use crate::utils::{CancelHandle, new_cancel_handle};

/// Per-request mutable state bag shared across steps.
///
/// Mutated only by the step currently owning the turn; the engine runs
/// steps strictly sequentially, so no lock guards these fields.
pub struct WorkflowContext {
    pub trace_id: String,
    pub channel: Channel,
    pub capability: Capability,
    pub dialect: InboundDialect,
    pub requested_model: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    /// Resolved key row for the external channel.
    pub api_key: Option<ApiKeyRecord>,
    /// Signature material presented by an external client.
    pub signature: Option<SignatureParams>,
    pub source_ip: Option<String>,

    /// Raw inbound payload as received.
    pub raw_request: Value,
    response: Option<Value>,

    namespaces: HashMap<String, HashMap<String, Value>>,
    executed_steps: Vec<StepTiming>,

    pub success: bool,
    pub error_source: Option<ErrorSource>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_after: Option<u64>,

    pub upstream_result: Option<UpstreamResult>,
    pub billing: Option<BillingInfo>,

    /// Ordered failover list; `[0]` is the selected candidate.
    pub candidates: Vec<UpstreamCandidate>,
    pub affinity_hit: bool,
    /// Rendered request per candidate, in failover order. Holds resolved
    /// auth headers, so it never serialises into namespaces or audit.
    pub rendered: Vec<(UpstreamCandidate, RenderedRequest)>,

    /// Where stream frames go when the client asked for streaming.
    pub stream_sender: Option<UnboundedSender<StreamFrame>>,
    pub status: Option<StatusEmitter>,
    pub cancel: CancelHandle,
}

impl WorkflowContext {
    pub fn new(channel: Channel, capability: Capability) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            channel,
            capability,
            dialect: InboundDialect::default(),
            requested_model: None,
            tenant_id: None,
            user_id: None,
            api_key_id: None,
            api_key: None,
            signature: None,
            source_ip: None,
            raw_request: Value::Null,
            response: None,
            namespaces: HashMap::new(),
            executed_steps: Vec::new(),
            success: true,
            error_source: None,
            error_code: None,
            error_message: None,
            retry_after: None,
            upstream_result: None,
            billing: None,
            candidates: Vec::new(),
            affinity_hit: false,
            rendered: Vec::new(),
            stream_sender: None,
            status: None,
            cancel: new_cancel_handle(),
        }
    }

    pub fn with_request(mut self, raw: Value) -> Self {
        self.raw_request = raw;
        self
    }

    pub fn with_dialect(mut self, dialect: InboundDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn is_external(&self) -> bool {
        self.channel == Channel::External
    }

    /// Whether the validated request asked for streaming.
    pub fn wants_stream(&self) -> bool {
        self.get("validation", "validated")
            .and_then(|v| v.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.namespaces.get(namespace)?.get(key)
    }

    pub fn set(&mut self, namespace: &str, key: &str, value: Value) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// The response payload, when one was produced.
    pub fn response(&self) -> Option<&Value> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Value> {
        self.response.take()
    }

    /// Set the response payload. Refused once an error is marked: failed
    /// requests keep their error shape no matter what later steps do.
    pub fn set_response(&mut self, value: Value) {
        if self.error_code.is_some() {
            debug!(trace_id = %self.trace_id, "response write ignored after error");
            return;
        }
        self.response = Some(value);
    }

    /// In-place response rewrite for sanitisation; same error guard.
    pub fn modify_response(&mut self, f: impl FnOnce(&mut Value)) {
        if self.error_code.is_some() {
            return;
        }
        if let Some(resp) = self.response.as_mut() {
            f(resp);
        }
    }

    /// Mark a failure. First error wins; later errors only log.
    pub fn mark_error(&mut self, err: &GatewayError) {
        if self.error_code.is_some() {
            debug!(trace_id = %self.trace_id, error = %err, "secondary error ignored");
            return;
        }
        self.success = false;
        self.error_source = Some(err.source());
        self.error_code = Some(err.code().to_string());
        self.error_message = Some(err.to_string());
        self.retry_after = err.retry_after();
    }

    /// Append one executed-step record. Append-only by construction.
    pub(crate) fn record_step(&mut self, step: &str, status: &str, duration_ms: u64) {
        self.executed_steps.push(StepTiming {
            step: step.to_string(),
            status: status.to_string(),
            duration_ms,
        });
    }

    pub fn executed_steps(&self) -> &[StepTiming] {
        &self.executed_steps
    }

    pub fn emit_status(&self, step: &str, state: StepState, code: Option<&str>) {
        if let Some(status) = &self.status {
            status.step(step, state, code);
        }
    }

    /// HTTP status the transport should answer with.
    pub fn status_code(&self) -> u16 {
        match (&self.error_code, &self.error_source) {
            (None, _) => 200,
            (Some(code), Some(source)) => match (source, code.as_str()) {
                (_, "RATE_LIMITED") => 429,
                (_, "REQUEST_TOO_LARGE") | (_, "BAD_REQUEST") => 400,
                (_, "UNAUTHORIZED") => 401,
                (ErrorSource::Policy, _) => 403,
                (_, "NOT_FOUND") => 404,
                (_, "UPSTREAM_TIMEOUT") => 504,
                (ErrorSource::Upstream, _) => 502,
                (_, "NO_AVAILABLE_UPSTREAM") => 502,
                _ => 500,
            },
            _ => 500,
        }
    }

    /// Non-sensitive projection for the audit sink.
    pub fn to_audit_record(&self) -> AuditRecord {
        AuditRecord {
            trace_id: self.trace_id.clone(),
            channel: self.channel,
            capability: self.capability,
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            key_id: self.api_key_id.clone(),
            requested_model: self.requested_model.clone(),
            upstream: self.upstream_result.clone(),
            billing: self.billing.clone(),
            steps: self.executed_steps.clone(),
            success: self.success,
            error_source: self.error_source,
            error_code: self.error_code.clone(),
            error_message: self.error_message.clone(),
            status_code: self.status_code(),
            created_at: Utc::now(),
        }
    }

    /// Error body in the canonical response envelope.
    pub fn error_body(&self) -> Value {
        serde_json::json!({
            "error": {
                "source": self.error_source,
                "code": self.error_code,
                "message": self.error_message,
                "retry_after": self.retry_after,
            }
        })
    }
}
