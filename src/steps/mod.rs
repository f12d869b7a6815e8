//! Concrete pipeline steps and their registry wiring.
//!
//! Every step holds the services it needs behind `Arc`s injected at
//! registry construction; nothing reaches for ambient state. Templates
//! reference steps by name only (see [`crate::engine::templates`]).

mod audit_log;
mod billing;
mod conversation_append;
mod conversation_load;
mod memory_write;
mod quota_check;
mod rate_limit;
mod request_adapter;
mod response_transform;
mod routing;
mod sanitize;
mod signature_verify;
mod template_render;
mod upstream_call;
mod validation;

use std::sync::Arc;

use crate::auth::SignatureVerifier;
use crate::cache::{KvStore, ScriptSet};
use crate::config::GatewayConfig;
use crate::conversation::{ConversationService, SummaryScheduler};
use crate::engine::StepRegistry;
use crate::error::GatewayResult;
use crate::limit::{QuotaEnforcer, RateLimiter};
use crate::repo::{ApiKeyRepository, AuditSink, VectorStore};
use crate::routing::{AffinityTracker, RoutingSelector};
use crate::secrets::SecretManager;
use crate::upstream::UpstreamCaller;

pub use audit_log::AuditLogStep;
pub use billing::BillingStep;
pub use conversation_append::ConversationAppendStep;
pub use conversation_load::ConversationLoadStep;
pub use memory_write::MemoryWriteStep;
pub use quota_check::QuotaCheckStep;
pub use rate_limit::RateLimitStep;
pub use request_adapter::RequestAdapterStep;
pub use response_transform::ResponseTransformStep;
pub use routing::RoutingStep;
pub use sanitize::SanitizeStep;
pub use signature_verify::SignatureVerifyStep;
pub use template_render::TemplateRenderStep;
pub use upstream_call::UpstreamCallStep;
pub use validation::ValidationStep;

/// Everything the steps need, assembled once at startup.
#[derive(Clone)]
pub struct GatewayDeps {
    pub config: GatewayConfig,
    pub kv: Arc<dyn KvStore>,
    pub scripts: Arc<ScriptSet>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub verifier: Arc<SignatureVerifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quotas: Arc<QuotaEnforcer>,
    pub selector: Arc<RoutingSelector>,
    pub secrets: Arc<SecretManager>,
    pub caller: Arc<UpstreamCaller>,
    pub affinity: Arc<AffinityTracker>,
    pub conversations: Arc<ConversationService>,
    pub summaries: Arc<SummaryScheduler>,
    pub vector: Arc<dyn VectorStore>,
    pub audit: Arc<dyn AuditSink>,
}

/// Build the registry with every builtin step wired to `deps`.
pub fn default_registry(deps: &GatewayDeps) -> GatewayResult<StepRegistry> {
    let mut registry = StepRegistry::new();

    registry.register("request_adapter", |_| Arc::new(RequestAdapterStep))?;
    {
        let config = deps.config.clone();
        registry.register("validation", move |_| {
            Arc::new(ValidationStep::new(config.max_request_bytes))
        })?;
    }
    {
        let verifier = deps.verifier.clone();
        registry.register("signature_verify", move |_| {
            Arc::new(SignatureVerifyStep::new(verifier.clone()))
        })?;
    }
    {
        let quotas = deps.quotas.clone();
        registry
            .register("quota_check", move |_| Arc::new(QuotaCheckStep::new(quotas.clone())))?;
    }
    {
        let limiter = deps.rate_limiter.clone();
        registry
            .register("rate_limit", move |_| Arc::new(RateLimitStep::new(limiter.clone())))?;
    }
    {
        let conversations = deps.conversations.clone();
        registry.register("conversation_load", move |_| {
            Arc::new(ConversationLoadStep::new(conversations.clone()))
        })?;
    }
    {
        let selector = deps.selector.clone();
        registry.register("routing", move |_| Arc::new(RoutingStep::new(selector.clone())))?;
    }
    {
        let secrets = deps.secrets.clone();
        registry.register("template_render", move |_| {
            Arc::new(TemplateRenderStep::new(secrets.clone()))
        })?;
    }
    {
        let caller = deps.caller.clone();
        let affinity = deps.affinity.clone();
        let quotas = deps.quotas.clone();
        let config = deps.config.clone();
        registry.register("upstream_call", move |_| {
            Arc::new(UpstreamCallStep::new(
                caller.clone(),
                affinity.clone(),
                quotas.clone(),
                config.upstream_idle_timeout,
            ))
        })?;
    }
    registry.register("response_transform", |_| Arc::new(ResponseTransformStep))?;
    registry.register("sanitize", |_| Arc::new(SanitizeStep))?;
    {
        let conversations = deps.conversations.clone();
        let summaries = deps.summaries.clone();
        registry.register("conversation_append", move |_| {
            Arc::new(ConversationAppendStep::new(conversations.clone(), summaries.clone()))
        })?;
    }
    {
        let vector = deps.vector.clone();
        registry.register("memory_write", move |_| {
            Arc::new(MemoryWriteStep::new(vector.clone()))
        })?;
    }
    {
        let quotas = deps.quotas.clone();
        let kv = deps.kv.clone();
        registry
            .register("billing", move |_| Arc::new(BillingStep::new(quotas.clone(), kv.clone())))?;
    }
    {
        let audit = deps.audit.clone();
        registry.register("audit_log", move |_| Arc::new(AuditLogStep::new(audit.clone())))?;
    }

    Ok(registry)
}
