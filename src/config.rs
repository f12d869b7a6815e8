//! Gateway Configuration
//!
//! A single process-wide configuration record, loaded once at startup and
//! passed into components by constructor injection. There is no ambient
//! global; every component keeps the slice of config it needs.

use std::time::Duration;

use serde::Deserialize;

/// Process-wide gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    /// Hard ceiling on serialized request size in bytes.
    pub max_request_bytes: usize,

    /// Accepted clock skew for signed requests, seconds either way.
    pub signature_skew_seconds: i64,
    /// Signature failures within the rolling window before blacklisting.
    pub signature_blacklist_threshold: u32,
    /// Blacklist cooldown; also the failure-bucket TTL.
    pub signature_blacklist_cooldown: Duration,

    /// Allow upstream hosts resolving to private/loopback ranges.
    pub allow_internal_networks: bool,
    /// When non-empty, outbound hosts must match one of these suffixes.
    pub outbound_whitelist: Vec<String>,

    /// Consecutive failures that open a host circuit.
    pub circuit_failure_threshold: u32,
    /// Seconds an open circuit waits before half-open probing.
    pub circuit_reset_seconds: u64,
    /// Consecutive half-open successes that close the circuit.
    pub circuit_close_successes: u32,

    /// Soft budget for the routing step.
    pub routing_timeout: Duration,
    /// Connect timeout for upstream calls.
    pub upstream_connect_timeout: Duration,
    /// Total timeout for non-streaming upstream calls.
    pub upstream_timeout: Duration,
    /// Idle timeout between stream frames.
    pub upstream_idle_timeout: Duration,
    /// Maximum failover attempts across the candidate list.
    pub upstream_max_attempts: u32,

    /// Bandit CAS retries before dropping an arm update.
    pub bandit_cas_retries: u32,
    /// Consecutive arm failures before a cooldown is imposed.
    pub arm_cooldown_failures: u32,

    /// Affinity routing toggles.
    pub affinity_enabled: bool,
    /// Score bonus granted to the affine arm.
    pub affinity_bonus: f64,
    /// Fraction of leading messages hashed into the affinity key.
    pub affinity_prefix_ratio: f64,
    /// TTL of affinity records in the KV store.
    pub affinity_ttl: Duration,

    /// Default per-step timeout when a template gives none.
    pub step_timeout: Duration,
    /// Default retry ceiling for steps that opt into retries.
    pub step_max_retries: u32,

    /// Idle window before a conversation summary fires.
    pub summary_idle: Duration,
    /// TTL for conversation KV metadata.
    pub conversation_meta_ttl: Duration,

    /// TTL for cached upstream credentials.
    pub secret_cache_ttl: Duration,

    /// Relative jitter applied to cache TTLs.
    pub cache_ttl_jitter: f64,

    /// Emit debug headers (X-Request-Id on external responses).
    pub debug: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 1 << 20,
            signature_skew_seconds: 300,
            signature_blacklist_threshold: 5,
            signature_blacklist_cooldown: Duration::from_secs(600),
            allow_internal_networks: false,
            outbound_whitelist: Vec::new(),
            circuit_failure_threshold: 5,
            circuit_reset_seconds: 30,
            circuit_close_successes: 1,
            routing_timeout: Duration::from_millis(150),
            upstream_connect_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(60),
            upstream_idle_timeout: Duration::from_secs(30),
            upstream_max_attempts: 3,
            bandit_cas_retries: 3,
            arm_cooldown_failures: 3,
            affinity_enabled: true,
            affinity_bonus: 0.05,
            affinity_prefix_ratio: 0.5,
            affinity_ttl: Duration::from_secs(1800),
            step_timeout: Duration::from_secs(120),
            step_max_retries: 2,
            summary_idle: Duration::from_secs(300),
            conversation_meta_ttl: Duration::from_secs(86400),
            secret_cache_ttl: Duration::from_secs(300),
            cache_ttl_jitter: 0.1,
            debug: false,
        }
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG`.
///
/// Call once from the embedding binary; repeated calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
}
