//! # Modelgate
//!
//! An AI model gateway core. Sits between client applications and
//! heterogeneous LLM upstreams: authenticates signed requests, enforces
//! per-key quotas and rate limits, selects an upstream via multi-armed
//! bandit with failover and circuit breaking, rewrites requests into
//! provider wire formats, forwards them (streaming included), normalises
//! responses back to a canonical OpenAI shape, records billing and audit
//! facts, and maintains conversational state.
//!
//! The heart is the request pipeline: a declarative per-channel DAG of
//! composable steps driven by a shared [`engine::WorkflowContext`]. HTTP
//! routing, admin surfaces and storage engines stay outside; the core
//! talks to repositories and a KV store through traits.
//!
//! ```rust,ignore
//! use modelgate::{Gateway, GatewayConfig};
//! use modelgate::engine::WorkflowContext;
//! use modelgate::types::{Capability, Channel};
//!
//! let gateway = Gateway::embedded(GatewayConfig::default()).await?;
//! let mut ctx = WorkflowContext::new(Channel::Internal, Capability::Chat)
//!     .with_request(serde_json::json!({
//!         "model": "gpt-4",
//!         "messages": [{"role": "user", "content": "hi"}],
//!     }));
//! gateway.handle(&mut ctx).await?;
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod limit;
pub mod protocol;
pub mod repo;
pub mod routing;
pub mod secrets;
pub mod steps;
pub mod template;
pub mod types;
pub mod upstream;
pub mod utils;

use std::sync::Arc;

pub use config::{GatewayConfig, init_tracing};
pub use error::{GatewayError, GatewayResult};

use auth::SignatureVerifier;
use cache::{KvStore, MemoryStore, ScriptSet};
use conversation::{ConversationService, SummaryJob, SummaryScheduler};
use engine::{ExecutionResult, OrchestrationEngine, StepRegistry, WorkflowContext, workflow_for};
use limit::{QuotaEnforcer, RateLimiter};
use repo::{
    ApiKeyRepository, AuditSink, BanditRepository, ConversationRepository, QuotaRepository,
    UpstreamCatalog, VectorStore,
};
use routing::{AffinityTracker, RoutingSelector};
use secrets::{SecretManager, SecretStore};
use steps::{GatewayDeps, default_registry};
use tokio::sync::mpsc::UnboundedReceiver;
use upstream::{CircuitBreaker, SsrfGuard, UpstreamCaller};

/// External storage and capability hooks the gateway core is wired to.
pub struct GatewayStores {
    pub kv: Arc<dyn KvStore>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub catalog: Arc<dyn UpstreamCatalog>,
    pub bandit: Arc<dyn BanditRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub quotas: Arc<dyn QuotaRepository>,
    pub audit: Arc<dyn AuditSink>,
    pub vector: Arc<dyn VectorStore>,
    pub secrets: Arc<dyn SecretStore>,
}

/// The assembled gateway: registry, engine and all shared services.
pub struct Gateway {
    registry: StepRegistry,
    engine: OrchestrationEngine,
    deps: GatewayDeps,
    summary_jobs: Option<UnboundedReceiver<SummaryJob>>,
}

impl Gateway {
    /// Wire the core against concrete stores.
    pub async fn new(config: GatewayConfig, stores: GatewayStores) -> GatewayResult<Self> {
        let scripts = Arc::new(ScriptSet::register(stores.kv.clone()).await?);
        let verifier = Arc::new(SignatureVerifier::new(stores.kv.clone(), &config));
        let rate_limiter = Arc::new(RateLimiter::new(scripts.clone()));
        let quota_enforcer = Arc::new(QuotaEnforcer::new(
            stores.kv.clone(),
            scripts.clone(),
            stores.quotas.clone(),
        ));
        let affinity = Arc::new(AffinityTracker::new(
            stores.kv.clone(),
            config.affinity_prefix_ratio,
            config.affinity_ttl,
        ));
        let selector = Arc::new(RoutingSelector::new(
            stores.catalog.clone(),
            affinity.clone(),
            &config,
        ));
        let secrets = Arc::new(SecretManager::new(
            stores.secrets.clone(),
            config.secret_cache_ttl,
        ));
        let caller = Arc::new(UpstreamCaller::new(
            SsrfGuard::new(&config),
            CircuitBreaker::new(stores.kv.clone(), &config),
            stores.bandit.clone(),
            &config,
        )?);
        let conversations = Arc::new(ConversationService::new(
            stores.conversations.clone(),
            stores.kv.clone(),
            scripts.clone(),
            &config,
        ));
        let (summaries, summary_jobs) = SummaryScheduler::new(stores.kv.clone(), &config);

        let deps = GatewayDeps {
            config: config.clone(),
            kv: stores.kv,
            scripts,
            api_keys: stores.api_keys,
            verifier,
            rate_limiter,
            quotas: quota_enforcer,
            selector,
            secrets,
            caller,
            affinity,
            conversations,
            summaries,
            vector: stores.vector,
            audit: stores.audit,
        };

        Ok(Self {
            registry: default_registry(&deps)?,
            engine: OrchestrationEngine::new(&config),
            deps,
            summary_jobs: Some(summary_jobs),
        })
    }

    /// Fully in-memory wiring for tests and single-node embedding.
    pub async fn embedded(config: GatewayConfig) -> GatewayResult<Self> {
        let stores = GatewayStores {
            kv: Arc::new(MemoryStore::new()),
            api_keys: Arc::new(repo::MemoryApiKeys::new()),
            catalog: Arc::new(repo::MemoryCatalog::new()),
            bandit: Arc::new(repo::MemoryBanditArms::new()),
            conversations: Arc::new(repo::MemoryConversations::new()),
            quotas: Arc::new(repo::MemoryQuotas::new()),
            audit: Arc::new(repo::MemoryAuditSink::new()),
            vector: Arc::new(repo::MemoryVectorStore::new()),
            secrets: Arc::new(secrets::EnvSecretStore),
        };
        Self::new(config, stores).await
    }

    /// The shared services, e.g. for admin surfaces built on top.
    pub fn deps(&self) -> &GatewayDeps {
        &self.deps
    }

    /// Take the summary-job queue; the embedding process drains it.
    pub fn take_summary_jobs(&mut self) -> Option<UnboundedReceiver<SummaryJob>> {
        self.summary_jobs.take()
    }

    /// Run the workflow for `ctx`'s channel and capability to completion.
    pub async fn handle(&self, ctx: &mut WorkflowContext) -> GatewayResult<ExecutionResult> {
        let template = workflow_for(ctx.channel, ctx.capability);
        let handles = self
            .registry
            .get_many(template, &Default::default())?;
        self.engine
            .execute(&handles, ctx)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Resolve an external api key by its presented plaintext and attach it
    /// to the context. The transport layer calls this before `handle`.
    pub async fn attach_api_key(
        &self,
        ctx: &mut WorkflowContext,
        presented_key: &str,
    ) -> GatewayResult<()> {
        let hash = auth::hash_key(presented_key);
        let record = self.deps.api_keys.find_by_key_hash(&hash).await?;
        match record {
            Some(record) => {
                ctx.api_key_id = Some(record.id.clone());
                ctx.api_key = Some(record);
                Ok(())
            }
            None => Err(GatewayError::Unauthorized("unknown api key".into())),
        }
    }
}

// Re-exported for downstream wiring without deep paths.
pub use engine::WorkflowContext as Context;
