//! Streaming pipeline tests: clean streams, broken streams, billing of
//! delivered frames.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use modelgate::cache::MemoryStore;
use modelgate::engine::WorkflowContext;
use modelgate::repo::{
    MemoryApiKeys, MemoryAuditSink, MemoryBanditArms, MemoryCatalog, MemoryConversations,
    MemoryQuotas, MemoryVectorStore,
};
use modelgate::secrets::EnvSecretStore;
use modelgate::types::{
    AuthConfig, AuthType, BanditArmState, Capability, Channel, ProtocolKind, TemplateEngineKind,
    UpstreamCandidate,
};
use modelgate::upstream::StreamFrame;
use modelgate::{Gateway, GatewayConfig, GatewayStores};

async fn gateway_with_catalog() -> (Gateway, Arc<MemoryCatalog>) {
    let catalog = Arc::new(MemoryCatalog::new());
    let mut config = GatewayConfig::default();
    config.allow_internal_networks = true;

    let stores = GatewayStores {
        kv: Arc::new(MemoryStore::new()),
        api_keys: Arc::new(MemoryApiKeys::new()),
        catalog: catalog.clone(),
        bandit: Arc::new(MemoryBanditArms::new()),
        conversations: Arc::new(MemoryConversations::new()),
        quotas: Arc::new(MemoryQuotas::new()),
        audit: Arc::new(MemoryAuditSink::new()),
        vector: Arc::new(MemoryVectorStore::new()),
        secrets: Arc::new(EnvSecretStore),
    };
    (Gateway::new(config, stores).await.unwrap(), catalog)
}

fn candidate(base_url: &str) -> UpstreamCandidate {
    UpstreamCandidate {
        preset_id: "p".into(),
        instance_id: "inst-1".into(),
        model_id: "gpt-4".into(),
        upstream_model: "gpt-4-0613".into(),
        credential_ref: "cred".into(),
        provider: "openai".into(),
        base_url: base_url.into(),
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
        auto_append_v1: Some(false),
        weight: 1,
        priority: 1,
        enabled: true,
        arm: BanditArmState::fresh("arm-stream"),
    }
}

fn sse_frame(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"index": 0, "delta": {"content": text}}]})
    )
}

fn stream_ctx() -> WorkflowContext {
    WorkflowContext::new(Channel::Internal, Capability::Chat).with_request(json!({
        "model": "gpt-4",
        "stream": true,
        "messages": [{"role": "user", "content": "tell me a story"}]
    }))
}

#[tokio::test]
async fn clean_stream_forwards_chunks_and_bills_delta_sum() {
    let upstream = MockServer::start().await;
    let body = format!(
        "{}{}{}data: [DONE]\n\n",
        sse_frame("Once "),
        sse_frame("upon "),
        sse_frame("a time")
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let (gateway, catalog) = gateway_with_catalog().await;
    catalog.add("gpt-4", candidate(&upstream.uri()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut ctx = stream_ctx();
    ctx.stream_sender = Some(tx);

    let result = gateway.handle(&mut ctx).await.unwrap();
    assert!(result.success, "error: {:?}", ctx.error_message);

    let mut chunks = 0u64;
    let mut delta_tokens = 0u64;
    let mut done = false;
    while let Ok(frame) = rx.try_recv() {
        match frame {
            StreamFrame::Chunk(chunk) => {
                chunks += 1;
                let content = chunk["choices"][0]["delta"]["content"].as_str().unwrap();
                delta_tokens += ((content.chars().count() as u64) / 4).max(1);
            }
            StreamFrame::Done => done = true,
            StreamFrame::Error { code, .. } => panic!("unexpected error frame {code}"),
        }
    }
    assert_eq!(chunks, 3);
    assert!(done);

    // Tokens billed equal the deltas the client actually received.
    let billing = ctx.billing.as_ref().unwrap();
    assert_eq!(billing.output_tokens, delta_tokens);
}

#[tokio::test]
async fn broken_stream_emits_error_frame_and_bills_partial() {
    let upstream = MockServer::start().await;
    // Three frames and then the body just ends: no [DONE], no finish.
    let body = format!("{}{}{}", sse_frame("one "), sse_frame("two "), sse_frame("three "));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let (gateway, catalog) = gateway_with_catalog().await;
    catalog.add("gpt-4", candidate(&upstream.uri()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut ctx = stream_ctx();
    ctx.stream_sender = Some(tx);

    let result = gateway.handle(&mut ctx).await.unwrap();
    assert!(!result.success);
    assert_eq!(ctx.error_code.as_deref(), Some("UPSTREAM_STREAM_BROKEN"));

    let mut chunks = 0;
    let mut error_frame = None;
    while let Ok(frame) = rx.try_recv() {
        match frame {
            StreamFrame::Chunk(_) => chunks += 1,
            StreamFrame::Error { code, .. } => error_frame = Some(code),
            StreamFrame::Done => panic!("broken stream must not end cleanly"),
        }
    }
    assert_eq!(chunks, 3, "client got the delivered frames");
    assert_eq!(error_frame.as_deref(), Some("UPSTREAM_STREAM_BROKEN"));

    // The delivered portion is billed even though the request failed.
    let billing = ctx.billing.as_ref().expect("partial billing recorded");
    assert_eq!(billing.output_tokens, 3);
    assert!(billing.input_tokens > 0);
}

#[tokio::test]
async fn stream_with_usage_frame_trusts_upstream_numbers() {
    let upstream = MockServer::start().await;
    let usage_frame = format!(
        "data: {}\n\n",
        json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 11, "completion_tokens": 22, "total_tokens": 33}
        })
    );
    let body = format!("{}{}data: [DONE]\n\n", sse_frame("hello"), usage_frame);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let (gateway, catalog) = gateway_with_catalog().await;
    catalog.add("gpt-4", candidate(&upstream.uri()));

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let mut ctx = stream_ctx();
    ctx.stream_sender = Some(tx);

    let result = gateway.handle(&mut ctx).await.unwrap();
    assert!(result.success);
    let billing = ctx.billing.as_ref().unwrap();
    assert_eq!(billing.input_tokens, 11);
    assert_eq!(billing.output_tokens, 22);
}
