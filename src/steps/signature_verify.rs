//! External-channel signature verification step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::auth::{SignatureOutcome, SignatureVerifier};
use crate::engine::{Step, StepResult, WorkflowContext};
use crate::error::GatewayError;

pub struct SignatureVerifyStep {
    verifier: Arc<SignatureVerifier>,
}

impl SignatureVerifyStep {
    pub fn new(verifier: Arc<SignatureVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Step for SignatureVerifyStep {
    fn name(&self) -> &'static str {
        "signature_verify"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["validation"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        if !ctx.is_external() {
            return StepResult::skipped("internal_channel");
        }

        let Some(key) = ctx.api_key.clone() else {
            return StepResult::fail_with(
                ctx,
                GatewayError::Unauthorized("unknown api key".into()),
            );
        };
        if key.disabled {
            return StepResult::fail_with(ctx, GatewayError::Unauthorized("api key revoked".into()));
        }
        if !key.allowed_ips.is_empty() {
            let permitted = ctx
                .source_ip
                .as_ref()
                .is_some_and(|ip| key.allowed_ips.iter().any(|a| a == ip));
            if !permitted {
                let ip = ctx.source_ip.clone().unwrap_or_else(|| "unknown".into());
                return StepResult::fail_with(ctx, GatewayError::IpNotAllowed { ip });
            }
        }
        if !key.allowed_models.is_empty() {
            let model = ctx.requested_model.clone().unwrap_or_default();
            if !key.allowed_models.contains(&model) {
                return StepResult::fail_with(ctx, GatewayError::ModelNotAllowed { model });
            }
        }
        let Some(params) = ctx.signature.clone() else {
            return StepResult::fail_with(
                ctx,
                GatewayError::Unauthorized("missing signature headers".into()),
            );
        };

        match self
            .verifier
            .verify(
                &key.id,
                &key.secret_hash,
                &key.whitelist_ips,
                &params,
                Utc::now().timestamp(),
            )
            .await
        {
            Ok(outcome) => {
                let whitelisted = outcome == SignatureOutcome::WhitelistBypass;
                ctx.set("signature_verify", "is_whitelist", json!(whitelisted));
                ctx.api_key_id = Some(key.id.clone());
                ctx.tenant_id = key.tenant_id.clone();
                ctx.user_id.get_or_insert_with(|| key.user_id.clone());
                StepResult::success()
            }
            Err(err) => StepResult::fail_with(ctx, err),
        }
    }
}
