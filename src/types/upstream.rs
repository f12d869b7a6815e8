//! Upstream candidate descriptors and bandit arm state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire dialect spoken by an upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    OpenAi,
    Anthropic,
    Azure,
    Gemini,
    Google,
    Custom,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Azure => "azure",
            Self::Gemini => "gemini",
            Self::Google => "google",
            Self::Custom => "custom",
        }
    }
}

/// How the upstream authenticates us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    Bearer,
    ApiKey,
    None,
}

/// Auth details accompanying [`AuthType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    /// Header carrying the credential for `api_key` auth.
    pub header: Option<String>,
    /// Optional value prefix, e.g. `Bearer `.
    pub prefix: Option<String>,
}

/// Bandit selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    EpsilonGreedy,
    Thompson,
    Weighted,
}

/// Per-candidate routing tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
    /// Exploration probability for epsilon-greedy.
    pub epsilon: f64,
    /// Cooldown applied after a failure burst, seconds.
    pub cooldown_seconds: u64,
    /// Per-call timeout override, milliseconds.
    pub timeout_ms: Option<u64>,
    /// Penalty subtracted per failure fraction in weighted mode.
    pub failure_penalty: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::EpsilonGreedy,
            epsilon: 0.1,
            cooldown_seconds: 60,
            timeout_ms: None,
            failure_penalty: 1.0,
        }
    }
}

/// Rate limits attached to a key or candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct LimitConfig {
    pub rpm: Option<u64>,
    pub tpm: Option<u64>,
}

/// Pricing knobs used by the billing step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct PricingConfig {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub cache_read_per_1k: Option<f64>,
    pub image_per_call: Option<f64>,
    pub audio_per_second: Option<f64>,
}

/// Which template engine renders the upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateEngineKind {
    #[default]
    SimpleReplace,
    Expr,
    Vendor,
}

/// Response post-processing rules configured per upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TransformRules {
    /// Dotted paths deleted from external responses.
    pub remove_fields: Vec<String>,
    /// Dotted paths partially masked in external responses.
    pub mask_fields: Vec<String>,
    /// Dotted path to delta content in vendor stream frames.
    pub content_path: Option<String>,
    /// Dotted path to reasoning deltas.
    pub reasoning_path: Option<String>,
    /// Dotted path to tool-call deltas.
    pub tool_calls_path: Option<String>,
}

/// Extra per-capability requirements a candidate may impose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct CapabilityConfig {
    /// Request fields that must be present for this candidate to apply,
    /// e.g. voice-clone upstreams require `reference_audio_url`.
    pub required_fields: Vec<String>,
}

/// Statistics and tuning state of one upstream candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditArmState {
    pub arm_id: String,
    pub alpha: f64,
    pub beta: f64,
    pub total_trials: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub latency_p95_ms: Option<u64>,
    pub total_cost: f64,
    pub last_reward: Option<f64>,
    /// Failures since the last success; feeds the cooldown trigger.
    pub consecutive_failures: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Monotonic CAS version; writers must re-read on mismatch.
    pub version: u64,
}

impl BanditArmState {
    pub fn fresh(arm_id: impl Into<String>) -> Self {
        Self {
            arm_id: arm_id.into(),
            alpha: 1.0,
            beta: 1.0,
            total_trials: 0,
            successes: 0,
            failures: 0,
            total_latency_ms: 0,
            latency_p95_ms: None,
            total_cost: 0.0,
            last_reward: None,
            consecutive_failures: 0,
            cooldown_until: None,
            version: 0,
        }
    }

    /// Laplace-smoothed success rate `(successes + 1) / (trials + 2)`.
    pub fn smoothed_success_rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.total_trials as f64 + 2.0)
    }

    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|t| t > now)
    }
}

/// A fully-specified route: one model at one provider with one credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamCandidate {
    pub preset_id: String,
    pub instance_id: String,
    pub model_id: String,
    /// Upstream-side model name sent on the wire.
    pub upstream_model: String,
    pub credential_ref: String,
    pub provider: String,
    pub base_url: String,
    pub upstream_path: String,
    pub protocol: ProtocolKind,
    pub auth_type: AuthType,
    pub auth_config: AuthConfig,
    pub default_headers: HashMap<String, String>,
    pub default_params: HashMap<String, serde_json::Value>,
    pub template_engine: TemplateEngineKind,
    pub request_template: serde_json::Value,
    pub response_transform: TransformRules,
    pub pricing: PricingConfig,
    pub limits: LimitConfig,
    pub routing: RoutingConfig,
    pub capability_config: CapabilityConfig,
    /// Explicit `/v1` suffix override; `None` means inspect the base URL.
    pub auto_append_v1: Option<bool>,
    pub weight: u32,
    pub priority: u32,
    pub enabled: bool,
    pub arm: BanditArmState,
}

impl UpstreamCandidate {
    /// Stable identity of the bandit arm behind this candidate.
    pub fn arm_id(&self) -> &str {
        &self.arm.arm_id
    }

    /// Host portion of the base URL, for circuit-breaker keying.
    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

/// Outcome summary of the upstream call recorded on the context.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamResult {
    pub provider: String,
    pub instance_id: String,
    pub model: String,
    pub status_code: Option<u16>,
    pub error_code: Option<String>,
    pub latency_ms: u64,
    pub attempts: u32,
}
