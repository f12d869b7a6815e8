//! Upstream Caller
//!
//! Outbound HTTP with SSRF guarding, per-host circuit breaking, failover
//! across the selector's candidate list, streaming, and bandit-arm
//! bookkeeping after every attempt.

pub mod circuit;
pub mod retry;
pub mod ssrf;
pub mod stream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::repo::BanditRepository;
use crate::template::RenderedRequest;
use crate::types::UpstreamCandidate;
use crate::utils::CancelHandle;

pub use circuit::{CircuitBreaker, CircuitDecision};
pub use retry::RetryPolicy;
pub use ssrf::SsrfGuard;
pub use stream::{StreamFrame, StreamOutcome, StreamTotals, TokenAccumulator, pump_sse};

/// Result of a successful non-streaming call.
#[derive(Debug)]
pub struct CallOutcome {
    pub candidate: UpstreamCandidate,
    pub status: u16,
    pub body: Value,
    pub latency_ms: u64,
    pub attempts: u32,
}

/// A successfully opened stream, ready to pump.
pub struct OpenedStream {
    pub candidate: UpstreamCandidate,
    pub response: reqwest::Response,
    pub attempts: u32,
    pub first_byte_latency_ms: u64,
}

pub struct UpstreamCaller {
    http: reqwest::Client,
    ssrf: SsrfGuard,
    breaker: CircuitBreaker,
    bandit: Arc<dyn BanditRepository>,
    retry: RetryPolicy,
    upstream_timeout: Duration,
    max_attempts: u32,
    cas_retries: u32,
    cooldown_failures: u32,
}

impl UpstreamCaller {
    pub fn new(
        ssrf: SsrfGuard,
        breaker: CircuitBreaker,
        bandit: Arc<dyn BanditRepository>,
        config: &GatewayConfig,
    ) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("http client build failed: {e}")))?;
        Ok(Self {
            http,
            ssrf,
            breaker,
            bandit,
            retry: RetryPolicy::default().with_max_attempts(config.upstream_max_attempts),
            upstream_timeout: config.upstream_timeout,
            max_attempts: config.upstream_max_attempts,
            cas_retries: config.bandit_cas_retries,
            cooldown_failures: config.arm_cooldown_failures,
        })
    }

    /// Record one arm trial. CAS with bounded retries; a lost update is
    /// dropped because the next request corrects the statistics. A streak
    /// of failures puts the arm on cooldown so the selector stops offering
    /// it until the window passes.
    pub async fn record_trial(
        &self,
        arm_id: &str,
        success: bool,
        latency_ms: u64,
        cooldown_seconds: u64,
    ) {
        for _ in 0..=self.cas_retries {
            let current = match self.bandit.get_arm(arm_id).await {
                Ok(Some(arm)) => arm,
                Ok(None) => crate::types::BanditArmState::fresh(arm_id),
                Err(e) => {
                    warn!(arm_id, error = %e, "bandit read failed, dropping trial");
                    return;
                }
            };
            let mut next = current;
            next.total_trials += 1;
            next.total_latency_ms += latency_ms;
            // Decaying max approximates the latency tail without a sketch.
            next.latency_p95_ms = Some(match next.latency_p95_ms {
                Some(p95) if latency_ms <= p95 => (p95 as f64 * 0.95) as u64,
                _ => latency_ms,
            });
            if success {
                next.successes += 1;
                next.alpha += 1.0;
                next.last_reward = Some(1.0);
                next.consecutive_failures = 0;
            } else {
                next.failures += 1;
                next.beta += 1.0;
                next.last_reward = Some(0.0);
                next.consecutive_failures += 1;
                if next.consecutive_failures >= self.cooldown_failures as u64
                    && cooldown_seconds > 0
                {
                    next.cooldown_until = Some(
                        chrono::Utc::now() + chrono::Duration::seconds(cooldown_seconds as i64),
                    );
                    next.consecutive_failures = 0;
                    warn!(arm_id, cooldown_seconds, "arm placed on cooldown");
                }
            }
            match self.bandit.cas_update(&next).await {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    warn!(arm_id, error = %e, "bandit write failed, dropping trial");
                    return;
                }
            }
        }
        debug!(arm_id, "bandit update dropped after CAS retries");
    }

    async fn preflight(&self, candidate: &UpstreamCandidate, url: &str) -> GatewayResult<()> {
        self.ssrf.check(url).await?;
        let host = candidate
            .host()
            .ok_or_else(|| GatewayError::BadRequest("candidate base url has no host".into()))?;
        match self.breaker.check(&host).await? {
            CircuitDecision::Open => Err(GatewayError::UpstreamCircuitOpen { host }),
            CircuitDecision::Closed | CircuitDecision::HalfOpenProbe => Ok(()),
        }
    }

    fn classify_status(status: u16, body_text: &str) -> Result<(), GatewayError> {
        if (200..300).contains(&status) {
            return Ok(());
        }
        let message = body_text.chars().take(512).collect::<String>();
        if (400..500).contains(&status) {
            Err(GatewayError::Upstream4xx { status, message })
        } else {
            Err(GatewayError::Upstream5xx { status, message })
        }
    }

    fn attempt_timeout(&self, candidate: &UpstreamCandidate) -> Duration {
        candidate
            .routing
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.upstream_timeout)
    }

    async fn bookkeep(&self, candidate: &UpstreamCandidate, success: bool, latency_ms: u64) {
        self.record_trial(
            candidate.arm_id(),
            success,
            latency_ms,
            candidate.routing.cooldown_seconds,
        )
        .await;
        if let Some(host) = candidate.host() {
            let result = if success {
                self.breaker.record_success(&host).await
            } else {
                self.breaker.record_failure(&host).await
            };
            if let Err(e) = result {
                warn!(host, error = %e, "circuit bookkeeping failed");
            }
        }
    }

    /// Non-streaming call: walk the failover list until a candidate
    /// answers, the error turns non-retryable, or attempts run out.
    pub async fn call_json(
        &self,
        attempts: &[(UpstreamCandidate, RenderedRequest)],
        cancel: &CancelHandle,
    ) -> GatewayResult<CallOutcome> {
        let mut last_error = GatewayError::NoAvailableUpstream { model: String::new() };
        let budget = self.max_attempts.min(attempts.len() as u32);

        for (i, (candidate, rendered)) in attempts.iter().take(budget as usize).enumerate() {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            if i > 0 {
                tokio::time::sleep(self.retry.calculate_delay(i as u32 - 1)).await;
            }

            let started = Instant::now();
            let result = self.attempt_json(candidate, rendered).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok((status, body)) => {
                    self.bookkeep(candidate, true, latency_ms).await;
                    return Ok(CallOutcome {
                        candidate: candidate.clone(),
                        status,
                        body,
                        latency_ms,
                        attempts: i as u32 + 1,
                    });
                }
                Err(err) => {
                    // An open circuit never counts as an arm trial; the
                    // host was not called.
                    if !matches!(err, GatewayError::UpstreamCircuitOpen { .. }) {
                        self.bookkeep(candidate, false, latency_ms).await;
                    }
                    debug!(
                        arm = candidate.arm_id(),
                        error = %err,
                        attempt = i + 1,
                        "upstream attempt failed"
                    );
                    let retryable = self.retry.should_retry(&err);
                    last_error = err;
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn attempt_json(
        &self,
        candidate: &UpstreamCandidate,
        rendered: &RenderedRequest,
    ) -> GatewayResult<(u16, Value)> {
        self.preflight(candidate, &rendered.url).await?;

        let mut request = self
            .http
            .post(&rendered.url)
            .query(&rendered.query)
            .json(&rendered.body);
        for (k, v) in &rendered.headers {
            request = request.header(k, v);
        }

        let timeout = self.attempt_timeout(candidate);
        let started = Instant::now();
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| GatewayError::UpstreamTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            })??;

        let status = response.status().as_u16();
        let text = tokio::time::timeout(timeout, response.text())
            .await
            .map_err(|_| GatewayError::UpstreamTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            })??;

        Self::classify_status(status, &text)?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Parse(format!("upstream body: {e}")))?;
        Ok((status, body))
    }

    /// Close the books on a pumped stream: one arm trial plus circuit
    /// bookkeeping, with success meaning the stream ended cleanly.
    pub async fn finish_stream(
        &self,
        candidate: &UpstreamCandidate,
        success: bool,
        latency_ms: u64,
    ) {
        self.bookkeep(candidate, success, latency_ms).await;
    }

    /// Streaming call: failover applies only until a response opens with a
    /// success status. Anything after the first byte belongs to
    /// [`pump_sse`].
    pub async fn call_stream(
        &self,
        attempts: &[(UpstreamCandidate, RenderedRequest)],
        cancel: &CancelHandle,
    ) -> GatewayResult<OpenedStream> {
        let mut last_error = GatewayError::NoAvailableUpstream { model: String::new() };
        let budget = self.max_attempts.min(attempts.len() as u32);

        for (i, (candidate, rendered)) in attempts.iter().take(budget as usize).enumerate() {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            if i > 0 {
                tokio::time::sleep(self.retry.calculate_delay(i as u32 - 1)).await;
            }

            let started = Instant::now();
            match self.attempt_stream(candidate, rendered).await {
                Ok(response) => {
                    return Ok(OpenedStream {
                        candidate: candidate.clone(),
                        response,
                        attempts: i as u32 + 1,
                        first_byte_latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(err) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    if !matches!(err, GatewayError::UpstreamCircuitOpen { .. }) {
                        self.bookkeep(candidate, false, latency_ms).await;
                    }
                    let retryable = self.retry.should_retry(&err);
                    last_error = err;
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn attempt_stream(
        &self,
        candidate: &UpstreamCandidate,
        rendered: &RenderedRequest,
    ) -> GatewayResult<reqwest::Response> {
        self.preflight(candidate, &rendered.url).await?;

        let mut request = self
            .http
            .post(&rendered.url)
            .query(&rendered.query)
            .json(&rendered.body)
            .header("accept", "text/event-stream");
        for (k, v) in &rendered.headers {
            request = request.header(k, v);
        }

        let timeout = self.attempt_timeout(candidate);
        let started = Instant::now();
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| GatewayError::UpstreamTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            })??;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            Self::classify_status(status, &text)?;
            unreachable!("classify_status always errs for non-2xx status");
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_buckets() {
        assert!(UpstreamCaller::classify_status(200, "").is_ok());
        assert!(matches!(
            UpstreamCaller::classify_status(429, "slow down"),
            Err(GatewayError::Upstream4xx { status: 429, .. })
        ));
        assert!(matches!(
            UpstreamCaller::classify_status(503, "down"),
            Err(GatewayError::Upstream5xx { status: 503, .. })
        ));
    }
}
