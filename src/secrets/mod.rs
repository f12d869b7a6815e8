//! Secret Manager
//!
//! Resolves `secret_ref_id` references to plaintext upstream credentials.
//! Plaintext never sits in candidate descriptors or templates; it is pulled
//! here at call time, cached with a TTL, and dropped from the cache when a
//! rotation lands.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};

/// Backing store for credential material (Vault, KMS, env, …).
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, provider: &str, secret_ref_id: &str)
    -> GatewayResult<Option<SecretString>>;

    /// Persist a rotated credential. Default stores are read-only.
    async fn put(
        &self,
        _provider: &str,
        _secret_ref_id: &str,
        _secret: SecretString,
    ) -> GatewayResult<()> {
        Err(GatewayError::Internal("secret store is read-only".into()))
    }
}

/// Reads `UPSTREAM_<PROVIDER>_SECRET` style variables from the environment.
/// Development fallback; production wires a real store.
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(
        &self,
        provider: &str,
        _secret_ref_id: &str,
    ) -> GatewayResult<Option<SecretString>> {
        let var = format!("UPSTREAM_{}_SECRET", provider.to_ascii_uppercase());
        Ok(std::env::var(var).ok().map(SecretString::from))
    }
}

struct CachedSecret {
    secret: SecretString,
    fetched_at: Instant,
}

/// TTL-cached resolver in front of a [`SecretStore`].
pub struct SecretManager {
    store: Arc<dyn SecretStore>,
    cache: Mutex<LruCache<String, CachedSecret>>,
    ttl: Duration,
}

impl SecretManager {
    pub fn new(store: Arc<dyn SecretStore>, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn cache_key(provider: &str, secret_ref_id: &str) -> String {
        crate::cache::CacheKeys::upstream_credential(provider, secret_ref_id)
    }

    /// Resolve a credential reference to plaintext.
    pub async fn get(
        &self,
        provider: &str,
        secret_ref_id: &str,
    ) -> GatewayResult<Option<SecretString>> {
        let key = Self::cache_key(provider, secret_ref_id);
        {
            let mut cache = self.cache.lock();
            if let Some(hit) = cache.get(&key) {
                if hit.fetched_at.elapsed() < self.ttl {
                    return Ok(Some(hit.secret.clone()));
                }
                cache.pop(&key);
            }
        }

        let fetched = self.store.fetch(provider, secret_ref_id).await?;
        if let Some(secret) = &fetched {
            self.cache.lock().put(
                key,
                CachedSecret { secret: secret.clone(), fetched_at: Instant::now() },
            );
        }
        Ok(fetched)
    }

    /// Rotate a credential: write the new value and invalidate every cached
    /// credential of the provider, so stale aliases cannot linger.
    pub async fn rotate(
        &self,
        provider: &str,
        secret_ref_id: &str,
        new_secret: SecretString,
    ) -> GatewayResult<()> {
        if provider.is_empty() || secret_ref_id.is_empty() {
            return Err(GatewayError::BadRequest("provider and secret_ref_id required".into()));
        }
        if let Err(e) = self.store.put(provider, secret_ref_id, new_secret.clone()).await {
            warn!(provider, secret_ref_id, error = %e, "secret store write failed");
            return Err(e);
        }

        let prefix = format!("upstream_credential:{provider}:");
        let mut cache = self.cache.lock();
        let stale: Vec<String> = cache
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| k.starts_with(&prefix))
            .collect();
        for k in stale {
            cache.pop(&k);
        }
        drop(cache);

        let exposed = new_secret.expose_secret();
        let hint = if exposed.len() >= 4 {
            &exposed[exposed.len() - 4..]
        } else {
            "****"
        };
        info!(provider, secret_ref_id, secret_hint = hint, "secret rotated");
        Ok(())
    }
}
