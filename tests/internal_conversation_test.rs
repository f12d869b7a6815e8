//! Internal-channel chat: history load, turn reservation, persistence.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use modelgate::cache::MemoryStore;
use modelgate::engine::WorkflowContext;
use modelgate::repo::{
    ConversationRepository, MemoryApiKeys, MemoryAuditSink, MemoryBanditArms, MemoryCatalog,
    MemoryConversations, MemoryQuotas, MemoryVectorStore,
};
use modelgate::secrets::EnvSecretStore;
use modelgate::types::{
    AuthConfig, AuthType, BanditArmState, Capability, Channel, ConversationMessage,
    ConversationSession, ProtocolKind, Role, TemplateEngineKind, UpstreamCandidate,
};
use modelgate::{Gateway, GatewayConfig, GatewayStores};

async fn fixture() -> (Gateway, Arc<MemoryCatalog>, Arc<MemoryConversations>) {
    let catalog = Arc::new(MemoryCatalog::new());
    let conversations = Arc::new(MemoryConversations::new());
    let mut config = GatewayConfig::default();
    config.allow_internal_networks = true;

    let stores = GatewayStores {
        kv: Arc::new(MemoryStore::new()),
        api_keys: Arc::new(MemoryApiKeys::new()),
        catalog: catalog.clone(),
        bandit: Arc::new(MemoryBanditArms::new()),
        conversations: conversations.clone(),
        quotas: Arc::new(MemoryQuotas::new()),
        audit: Arc::new(MemoryAuditSink::new()),
        vector: Arc::new(MemoryVectorStore::new()),
        secrets: Arc::new(EnvSecretStore),
    };
    (
        Gateway::new(config, stores).await.unwrap(),
        catalog,
        conversations,
    )
}

fn candidate(base_url: &str) -> UpstreamCandidate {
    UpstreamCandidate {
        preset_id: "p".into(),
        instance_id: "inst".into(),
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
        arm: BanditArmState::fresh("arm-int"),
    }
}

fn ok_response(text: &str) -> Value {
    json!({
        "id": "chatcmpl-1", "object": "chat.completion", "created": 1,
        "model": "gpt-4-0613",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 8, "completion_tokens": 3, "total_tokens": 11}
    })
}

#[tokio::test]
async fn exchange_appends_gap_free_turns_and_sends_history_upstream() {
    let upstream = MockServer::start().await;
    // The second call must carry the stored history before the new turn.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_response("answer")))
        .mount(&upstream)
        .await;

    let (gateway, catalog, conversations) = fixture().await;
    catalog.add("gpt-4", candidate(&upstream.uri()));
    conversations
        .upsert_session(&ConversationSession::new("s1", "u1", Channel::Internal))
        .await
        .unwrap();

    for (i, question) in ["first question", "second question"].iter().enumerate() {
        let mut ctx = WorkflowContext::new(Channel::Internal, Capability::Chat)
            .with_user("u1")
            .with_request(json!({
                "model": "gpt-4",
                "session_id": "s1",
                "messages": [{"role": "user", "content": question}]
            }));
        let result = gateway.handle(&mut ctx).await.unwrap();
        assert!(result.success, "round {i} failed: {:?}", ctx.error_message);
    }

    let history = conversations.recent_messages("s1", 100).await.unwrap();
    let turns: Vec<u64> = history.iter().map(|m| m.turn_index).collect();
    assert_eq!(turns, vec![1, 2, 3, 4], "turn indexes are gap-free");

    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);

    let session = conversations.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.message_count, 4);
}

#[tokio::test]
async fn history_rides_along_on_the_second_request() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "user", "content": "remembered question"},
                {"role": "assistant", "content": "remembered answer"},
                {"role": "user", "content": "follow-up"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_response("done")))
        .expect(1)
        .mount(&upstream)
        .await;

    let (gateway, catalog, conversations) = fixture().await;
    catalog.add("gpt-4", candidate(&upstream.uri()));
    conversations
        .upsert_session(&ConversationSession::new("s1", "u1", Channel::Internal))
        .await
        .unwrap();
    conversations
        .append_messages(
            "s1",
            &[
                ConversationMessage::text("s1", 1, Role::User, "remembered question"),
                ConversationMessage::text("s1", 2, Role::Assistant, "remembered answer"),
            ],
        )
        .await
        .unwrap();

    let mut ctx = WorkflowContext::new(Channel::Internal, Capability::Chat)
        .with_user("u1")
        .with_request(json!({
            "model": "gpt-4",
            "session_id": "s1",
            "messages": [{"role": "user", "content": "follow-up"}]
        }));
    let result = gateway.handle(&mut ctx).await.unwrap();
    assert!(result.success, "error: {:?}", ctx.error_message);
}
