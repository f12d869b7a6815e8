//! Response sanitisation for the external channel.
//!
//! Sensitive headers are stripped, and per-upstream body rules apply:
//! `remove_fields` paths are deleted, `mask_fields` partially masked.

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::{Step, StepResult, WorkflowContext};

const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-upstream-latency",
    "x-proxy-timing",
];

fn remove_path(value: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    remove_path_inner(value, &segments);
}

fn remove_path_inner(value: &mut Value, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else { return };
    match value {
        Value::Object(map) => {
            if rest.is_empty() {
                map.remove(*head);
            } else if let Some(next) = map.get_mut(*head) {
                remove_path_inner(next, rest);
            }
        }
        Value::Array(items) => {
            if let Ok(idx) = head.parse::<usize>() {
                if let Some(next) = items.get_mut(idx) {
                    if rest.is_empty() {
                        *next = Value::Null;
                    } else {
                        remove_path_inner(next, rest);
                    }
                }
            }
        }
        _ => {}
    }
}

fn mask_path(value: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    mask_path_inner(value, &segments);
}

fn mask_path_inner(value: &mut Value, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else { return };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get_mut(*head) {
                if rest.is_empty() {
                    *next = Value::String(mask_value(next));
                } else {
                    mask_path_inner(next, rest);
                }
            }
        }
        Value::Array(items) => {
            if let Ok(idx) = head.parse::<usize>() {
                if let Some(next) = items.get_mut(idx) {
                    if rest.is_empty() {
                        *next = Value::String(mask_value(next));
                    } else {
                        mask_path_inner(next, rest);
                    }
                }
            }
        }
        _ => {}
    }
}

fn mask_value(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.len() <= 4 {
        return "***".into();
    }
    format!("{}***", &raw[..2])
}

pub struct SanitizeStep;

#[async_trait]
impl Step for SanitizeStep {
    fn name(&self) -> &'static str {
        "sanitize"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["response_transform"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        if !ctx.is_external() {
            return StepResult::skipped("internal_channel");
        }

        if let Some(mut headers) = ctx.get("response", "headers").cloned() {
            if let Value::Object(map) = &mut headers {
                map.retain(|k, _| !STRIPPED_HEADERS.contains(&k.to_ascii_lowercase().as_str()));
            }
            ctx.set("response", "headers", headers);
        }

        let rules = ctx
            .candidates
            .first()
            .map(|c| c.response_transform.clone())
            .unwrap_or_default();
        if !rules.remove_fields.is_empty() || !rules.mask_fields.is_empty() {
            ctx.modify_response(|resp| {
                for path in &rules.remove_fields {
                    remove_path(resp, path);
                }
                for path in &rules.mask_fields {
                    mask_path(resp, path);
                }
            });
        }
        StepResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepStatus;
    use crate::types::{Capability, Channel, TransformRules};
    use serde_json::json;

    #[tokio::test]
    async fn removes_and_masks_configured_paths() {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        let mut candidate = crate::types::UpstreamCandidate {
            preset_id: "p".into(),
            instance_id: "i".into(),
            model_id: "m".into(),
            upstream_model: "m".into(),
            credential_ref: "r".into(),
            provider: "openai".into(),
            base_url: "https://x".into(),
            upstream_path: "y".into(),
            protocol: crate::types::ProtocolKind::OpenAi,
            auth_type: crate::types::AuthType::Bearer,
            auth_config: Default::default(),
            default_headers: Default::default(),
            default_params: Default::default(),
            template_engine: Default::default(),
            request_template: Value::Null,
            response_transform: TransformRules {
                remove_fields: vec!["system_fingerprint".into()],
                mask_fields: vec!["metadata.organization".into()],
                ..Default::default()
            },
            pricing: Default::default(),
            limits: Default::default(),
            routing: Default::default(),
            capability_config: Default::default(),
            auto_append_v1: None,
            weight: 1,
            priority: 1,
            enabled: true,
            arm: crate::types::BanditArmState::fresh("a"),
        };
        candidate.enabled = true;
        ctx.candidates = vec![candidate];
        ctx.set_response(json!({
            "id": "r1",
            "system_fingerprint": "fp_abc",
            "metadata": {"organization": "org-supersecret"}
        }));
        ctx.set(
            "response",
            "headers",
            json!({"Authorization": "Bearer x", "X-Request-Id": "t"}),
        );

        let result = SanitizeStep.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);

        let resp = ctx.response().unwrap();
        assert!(resp.get("system_fingerprint").is_none());
        assert_eq!(resp["metadata"]["organization"], "or***");

        let headers = ctx.get("response", "headers").unwrap();
        assert!(headers.get("Authorization").is_none());
        assert!(headers.get("X-Request-Id").is_some());
    }

    #[tokio::test]
    async fn internal_channel_is_untouched() {
        let mut ctx = WorkflowContext::new(Channel::Internal, Capability::Chat);
        ctx.set_response(json!({"system_fingerprint": "kept"}));
        let result = SanitizeStep.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Skipped);
        assert!(ctx.response().unwrap().get("system_fingerprint").is_some());
    }
}
