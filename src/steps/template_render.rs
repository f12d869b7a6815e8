//! Template rendering for every candidate on the failover list.
//!
//! Each candidate gets its own rendered request (its template, URL and
//! credential differ), so the upstream caller can fail over without coming
//! back to this step. Credentials resolve here and live only in the typed
//! `rendered` slot.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::engine::{Step, StepResult, WorkflowContext};
use crate::error::GatewayError;
use crate::secrets::SecretManager;
use crate::template;

pub struct TemplateRenderStep {
    secrets: Arc<SecretManager>,
}

impl TemplateRenderStep {
    pub fn new(secrets: Arc<SecretManager>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl Step for TemplateRenderStep {
    fn name(&self) -> &'static str {
        "template_render"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["routing"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        if ctx.candidates.is_empty() {
            return StepResult::fail_with(
                ctx,
                GatewayError::Internal("template render before routing".into()),
            );
        }
        let Some(validated) = ctx.get("validation", "validated").cloned() else {
            return StepResult::fail_with(
                ctx,
                GatewayError::Internal("no validated request to render".into()),
            );
        };

        let mut rendered = Vec::with_capacity(ctx.candidates.len());
        let candidates = ctx.candidates.clone();
        for candidate in candidates {
            let credential = match self
                .secrets
                .get(&candidate.provider, &candidate.credential_ref)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(
                        provider = %candidate.provider,
                        error = %e,
                        "credential resolution failed, candidate dropped"
                    );
                    continue;
                }
            };
            match template::render(&candidate, &validated, credential.as_ref()) {
                Ok(request) => rendered.push((candidate, request)),
                Err(err) => {
                    // A broken template on the primary is fatal only when
                    // no other candidate renders.
                    warn!(
                        provider = %candidate.provider,
                        error = %err,
                        "template render failed for candidate"
                    );
                }
            }
        }

        if rendered.is_empty() {
            return StepResult::fail_with(
                ctx,
                GatewayError::TemplateRenderFailed("no candidate rendered".into()),
            );
        }

        ctx.set("template_render", "rendered_count", json!(rendered.len()));
        ctx.set("template_render", "upstream_url", json!(rendered[0].1.url));
        ctx.rendered = rendered;
        StepResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepStatus;
    use crate::secrets::{EnvSecretStore, SecretManager};
    use crate::types::{
        AuthConfig, AuthType, BanditArmState, Capability, Channel, ProtocolKind,
        TemplateEngineKind, UpstreamCandidate,
    };
    use serde_json::Value;
    use std::collections::HashMap;
    use std::time::Duration;

    fn step() -> TemplateRenderStep {
        TemplateRenderStep::new(Arc::new(SecretManager::new(
            Arc::new(EnvSecretStore),
            Duration::from_secs(60),
        )))
    }

    fn candidate() -> UpstreamCandidate {
        UpstreamCandidate {
            preset_id: "p".into(),
            instance_id: "i".into(),
            model_id: "m".into(),
            upstream_model: "gpt-4-0613".into(),
            credential_ref: "ref-1".into(),
            provider: "openai".into(),
            base_url: "https://api.openai.com".into(),
            upstream_path: "chat/completions".into(),
            protocol: ProtocolKind::OpenAi,
            auth_type: AuthType::Bearer,
            auth_config: AuthConfig::default(),
            default_headers: HashMap::new(),
            default_params: HashMap::new(),
            template_engine: TemplateEngineKind::SimpleReplace,
            request_template: Value::Null,
            response_transform: Default::default(),
            pricing: Default::default(),
            limits: Default::default(),
            routing: Default::default(),
            capability_config: Default::default(),
            auto_append_v1: None,
            weight: 1,
            priority: 1,
            enabled: true,
            arm: BanditArmState::fresh("arm"),
        }
    }

    #[tokio::test]
    async fn renders_every_candidate_for_failover() {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        ctx.candidates = vec![candidate(), candidate()];
        ctx.set(
            "validation",
            "validated",
            serde_json::json!({"model": "gpt-4", "messages": [{"role":"user","content":"hi"}]}),
        );

        let result = step().execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(ctx.rendered.len(), 2);
        assert_eq!(
            ctx.get("template_render", "upstream_url"),
            Some(&serde_json::json!("https://api.openai.com/v1/chat/completions"))
        );
        assert_eq!(ctx.rendered[0].1.body["model"], "gpt-4-0613");
    }

    #[tokio::test]
    async fn missing_routing_is_fatal() {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        let result = step().execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Failed);
    }
}
