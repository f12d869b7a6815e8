//! API-key signature verification.
//!
//! External requests carry `X-Api-Key`, `X-Timestamp`, `X-Nonce`,
//! `X-Signature` where the signature is HMAC-SHA256 over
//! `api_key || timestamp || nonce` keyed by the key's secret. The verifier
//! keeps a nonce replay cache scoped to the skew window and blacklists keys
//! after repeated failures. The blacklist is consulted before any other
//! work so a hammering client costs one KV read.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::cache::{CacheKeys, KvStore};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

/// Inbound signature material.
#[derive(Debug, Clone)]
pub struct SignatureParams {
    pub api_key: String,
    pub timestamp: i64,
    pub nonce: String,
    pub signature_hex: String,
    pub source_ip: Option<String>,
}

/// What the verifier decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureOutcome {
    Valid,
    /// Source IP is whitelisted; signature skipped, quota still applies.
    WhitelistBypass,
}

/// SHA-256 of the presented key; the repository stores only this.
pub fn hash_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// Produce the signature a well-behaved client sends. Shared with tests.
pub fn sign_request(secret: &str, api_key: &str, timestamp: i64, nonce: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(api_key.as_bytes());
    mac.update(timestamp.to_string().as_bytes());
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub struct SignatureVerifier {
    kv: Arc<dyn KvStore>,
    skew_seconds: i64,
    blacklist_threshold: u32,
    blacklist_cooldown: std::time::Duration,
}

impl SignatureVerifier {
    pub fn new(kv: Arc<dyn KvStore>, config: &GatewayConfig) -> Self {
        Self {
            kv,
            skew_seconds: config.signature_skew_seconds,
            blacklist_threshold: config.signature_blacklist_threshold,
            blacklist_cooldown: config.signature_blacklist_cooldown,
        }
    }

    /// Verify a signed request for the key row `api_key_id` whose stored
    /// signing secret is `secret`. `whitelist_ips` bypasses the signature
    /// check entirely.
    pub async fn verify(
        &self,
        api_key_id: &str,
        secret: &str,
        whitelist_ips: &[String],
        params: &SignatureParams,
        now: i64,
    ) -> GatewayResult<SignatureOutcome> {
        let blacklist_key = CacheKeys::api_key_blacklist(api_key_id);
        if self.kv.get(&blacklist_key).await?.is_some() {
            return Err(GatewayError::Unauthorized("api key temporarily blocked".into()));
        }

        if let Some(ip) = &params.source_ip {
            if whitelist_ips.iter().any(|w| w == ip) {
                return Ok(SignatureOutcome::WhitelistBypass);
            }
        }

        if (params.timestamp - now).abs() > self.skew_seconds {
            self.count_failure(api_key_id).await?;
            return Err(GatewayError::Unauthorized("timestamp outside accepted window".into()));
        }

        // Replay guard: a nonce is good for one request within the window.
        let nonce_key = CacheKeys::signature_nonce(api_key_id, &params.nonce);
        let nonce_ttl = std::time::Duration::from_secs(self.skew_seconds.unsigned_abs());
        if !self.kv.set_nx(&nonce_key, "1", nonce_ttl).await? {
            self.count_failure(api_key_id).await?;
            return Err(GatewayError::Unauthorized("nonce already used".into()));
        }

        let expected = sign_request(secret, &params.api_key, params.timestamp, &params.nonce);
        let provided = params.signature_hex.to_ascii_lowercase();
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            self.count_failure(api_key_id).await?;
            return Err(GatewayError::Unauthorized("signature mismatch".into()));
        }

        Ok(SignatureOutcome::Valid)
    }

    async fn count_failure(&self, api_key_id: &str) -> GatewayResult<()> {
        let fail_key = CacheKeys::signature_fail(api_key_id);
        let count = self.kv.incr_by(&fail_key, 1).await?;
        // The failure bucket and the blacklist share one window, so a quiet
        // period resets both together.
        self.kv.expire(&fail_key, self.blacklist_cooldown).await?;
        if count >= self.blacklist_threshold as i64 {
            warn!(api_key_id, failures = count, "blacklisting api key");
            self.kv
                .set(
                    &CacheKeys::api_key_blacklist(api_key_id),
                    "1",
                    Some(self.blacklist_cooldown),
                )
                .await?;
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(Arc::new(MemoryStore::new()), &GatewayConfig::default())
    }

    fn params(secret: &str, ts: i64, nonce: &str) -> SignatureParams {
        SignatureParams {
            api_key: "mk-live-1".into(),
            timestamp: ts,
            nonce: nonce.into(),
            signature_hex: sign_request(secret, "mk-live-1", ts, nonce),
            source_ip: None,
        }
    }

    #[tokio::test]
    async fn valid_signature_passes() {
        let v = verifier();
        let p = params("s3cret", 1_000, "n-1");
        let out = v.verify("ak-1", "s3cret", &[], &p, 1_000).await.unwrap();
        assert_eq!(out, SignatureOutcome::Valid);
    }

    #[tokio::test]
    async fn skewed_timestamp_rejected() {
        let v = verifier();
        let p = params("s3cret", 1_000, "n-1");
        let err = v.verify("ak-1", "s3cret", &[], &p, 2_000).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn nonce_replay_rejected() {
        let v = verifier();
        let p = params("s3cret", 1_000, "n-1");
        v.verify("ak-1", "s3cret", &[], &p, 1_000).await.unwrap();
        let err = v.verify("ak-1", "s3cret", &[], &p, 1_000).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn five_failures_blacklist_the_key() {
        let v = verifier();
        for i in 0..5 {
            let mut p = params("s3cret", 1_000, &format!("n-{i}"));
            p.signature_hex = "deadbeef".into();
            let _ = v.verify("ak-1", "s3cret", &[], &p, 1_000).await;
        }
        // A perfectly valid request is now short-circuited.
        let p = params("s3cret", 1_000, "n-ok");
        let err = v.verify("ak-1", "s3cret", &[], &p, 1_000).await.unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn whitelist_ip_bypasses_signature_only() {
        let v = verifier();
        let mut p = params("s3cret", 1_000, "n-1");
        p.signature_hex = "not-checked".into();
        p.source_ip = Some("10.1.2.3".into());
        let out = v
            .verify("ak-1", "s3cret", &["10.1.2.3".into()], &p, 1_000)
            .await
            .unwrap();
        assert_eq!(out, SignatureOutcome::WhitelistBypass);
    }
}
