//! Template Engine
//!
//! Turns a validated canonical request plus an upstream candidate into a
//! ready-to-send upstream request: body, URL, query params and headers.
//! Three render modes: `simple_replace` (merge-patch), `expr`
//! (`{{ var.path }}` substitution) and `vendor` (protocol builders).

mod expr;
mod headers;
mod simple_replace;
mod url;

use std::collections::HashMap;

use secrecy::SecretString;
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol;
use crate::types::{ChatRequest, ProtocolKind, TemplateEngineKind, UpstreamCandidate};

pub use expr::render_expressions;
pub use headers::{build_headers, resolve_auth_for_protocol};
pub use simple_replace::merge_patch;
pub use url::{build_upstream_url, build_upstream_url_with_params};

/// Fully rendered upstream request.
#[derive(Debug, Clone)]
pub struct RenderedRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Render the upstream request for `candidate` from the validated payload.
///
/// `credential` is the resolved plaintext the headers need; it never lands
/// in the body or the context.
pub fn render(
    candidate: &UpstreamCandidate,
    validated: &Value,
    credential: Option<&SecretString>,
) -> GatewayResult<RenderedRequest> {
    let mut body = match candidate.template_engine {
        TemplateEngineKind::SimpleReplace => merge_patch(validated, &candidate.request_template),
        TemplateEngineKind::Expr => {
            let vars = serde_json::json!({
                "request": validated,
                "model": candidate.upstream_model,
                "provider": candidate.provider,
            });
            render_expressions(&candidate.request_template, &vars)?
        }
        TemplateEngineKind::Vendor => {
            let req: ChatRequest = serde_json::from_value(validated.clone())
                .map_err(|e| GatewayError::TemplateRenderFailed(e.to_string()))?;
            protocol::build_request_body(&candidate.protocol, &req)
                .map_err(|e| GatewayError::TemplateRenderFailed(e.to_string()))?
        }
    };

    // The wire-side model name comes from the candidate, not the client.
    // Gemini carries the model in the path instead of the body.
    if !matches!(candidate.protocol, ProtocolKind::Gemini | ProtocolKind::Google) {
        if let Value::Object(map) = &mut body {
            map.insert("model".into(), Value::String(candidate.upstream_model.clone()));
        }
    }

    if let Value::Object(map) = &mut body {
        for (k, v) in &candidate.default_params {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        // Gateway-internal fields never travel upstream.
        map.remove("session_id");
        map.remove("idempotency_key");
    }

    let (url, query) = build_upstream_url_with_params(
        &candidate.base_url,
        &candidate.upstream_path,
        &candidate.protocol,
        candidate.auto_append_v1,
        None,
    );

    let headers = build_headers(candidate, credential)?;

    Ok(RenderedRequest { url, query, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthConfig, AuthType, BanditArmState};
    use serde_json::json;

    fn candidate(engine: TemplateEngineKind, protocol: ProtocolKind) -> UpstreamCandidate {
        UpstreamCandidate {
            preset_id: "p1".into(),
            instance_id: "i1".into(),
            model_id: "m1".into(),
            upstream_model: "gpt-4-0613".into(),
            credential_ref: "ref".into(),
            provider: "openai".into(),
            base_url: "https://api.openai.com".into(),
            upstream_path: "chat/completions".into(),
            protocol,
            auth_type: AuthType::Bearer,
            auth_config: AuthConfig::default(),
            default_headers: HashMap::new(),
            default_params: HashMap::new(),
            template_engine: engine,
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
            arm: BanditArmState::fresh("arm-1"),
        }
    }

    #[test]
    fn render_overrides_model_with_upstream_name() {
        let cand = candidate(TemplateEngineKind::SimpleReplace, ProtocolKind::OpenAi);
        let validated = json!({"model": "gpt-4", "messages": [{"role":"user","content":"hi"}]});
        let rendered = render(&cand, &validated, None).unwrap();
        assert_eq!(rendered.body["model"], "gpt-4-0613");
        assert_eq!(rendered.url, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn default_params_fill_absent_fields_only() {
        let mut cand = candidate(TemplateEngineKind::SimpleReplace, ProtocolKind::OpenAi);
        cand.default_params
            .insert("temperature".into(), json!(0.2));
        let validated = json!({"model": "gpt-4", "temperature": 0.9});
        let rendered = render(&cand, &validated, None).unwrap();
        assert_eq!(rendered.body["temperature"], 0.9);

        let rendered = render(&cand, &json!({"model": "gpt-4"}), None).unwrap();
        assert_eq!(rendered.body["temperature"], 0.2);
    }

    #[test]
    fn vendor_engine_builds_anthropic_body() {
        let mut cand = candidate(TemplateEngineKind::Vendor, ProtocolKind::Anthropic);
        cand.upstream_model = "claude-3-5-sonnet".into();
        let validated = json!({
            "model": "claude",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hi"}
            ]
        });
        let rendered = render(&cand, &validated, None).unwrap();
        assert_eq!(rendered.body["system"], "sys");
        assert_eq!(rendered.body["model"], "claude-3-5-sonnet");
        assert!(rendered.body["max_tokens"].as_u64().is_some());
    }
}
