//! Routing Selector
//!
//! Gathers upstream candidates for a requested model, filters out the
//! unusable ones, scores the survivors with the configured bandit strategy
//! and returns an ordered failover list. The caller walks that list; the
//! selector never returns a single choice.

pub mod affinity;
pub mod bandit;

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::repo::UpstreamCatalog;
use crate::types::{
    Capability, Channel, ChatMessage, RoutingStrategy, UpstreamCandidate,
};

pub use affinity::AffinityTracker;

/// Ordered selection result; `candidates[0]` is the primary.
#[derive(Debug, Clone)]
pub struct Selection {
    pub candidates: Vec<UpstreamCandidate>,
    pub affinity_hit: bool,
}

pub struct RoutingSelector {
    catalog: Arc<dyn UpstreamCatalog>,
    affinity: Arc<AffinityTracker>,
    affinity_enabled: bool,
    affinity_bonus: f64,
}

impl RoutingSelector {
    pub fn new(
        catalog: Arc<dyn UpstreamCatalog>,
        affinity: Arc<AffinityTracker>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            catalog,
            affinity,
            affinity_enabled: config.affinity_enabled,
            affinity_bonus: config.affinity_bonus,
        }
    }

    /// Select an ordered failover list for `model`.
    pub async fn select(
        &self,
        model: &str,
        capability: Capability,
        channel: Channel,
        user_id: Option<&str>,
        request_fields: &serde_json::Value,
        messages: &[ChatMessage],
    ) -> GatewayResult<Selection> {
        // An owned RNG keeps the future Send; ThreadRng must not be held
        // across the repository awaits.
        let mut rng = StdRng::from_entropy();
        self.select_with_rng(
            model,
            capability,
            channel,
            user_id,
            request_fields,
            messages,
            &mut rng,
        )
        .await
    }

    /// Deterministic variant for tests; callers pass their own RNG.
    #[allow(clippy::too_many_arguments)]
    pub async fn select_with_rng<R: Rng + ?Sized>(
        &self,
        model: &str,
        capability: Capability,
        channel: Channel,
        user_id: Option<&str>,
        request_fields: &serde_json::Value,
        messages: &[ChatMessage],
        rng: &mut R,
    ) -> GatewayResult<Selection> {
        let gathered = self
            .catalog
            .candidates_for_model(model, capability, channel, user_id)
            .await?;

        let now = Utc::now();
        let mut eligible: Vec<UpstreamCandidate> = gathered
            .into_iter()
            .filter(|c| c.enabled)
            .filter(|c| !c.arm.is_cooling(now))
            .filter(|c| {
                c.capability_config
                    .required_fields
                    .iter()
                    .all(|field| request_fields.get(field).is_some_and(|v| !v.is_null()))
            })
            .collect();

        if eligible.is_empty() {
            return Err(GatewayError::NoAvailableUpstream { model: model.to_string() });
        }

        let affine_arm = if self.affinity_enabled {
            self.affinity.lookup(model, messages).await.unwrap_or(None)
        } else {
            None
        };
        let affinity_hit =
            affine_arm.as_deref().is_some_and(|id| eligible.iter().any(|c| c.arm_id() == id));

        let strategy = eligible[0].routing.strategy;
        let epsilon = eligible[0].routing.epsilon;

        let mut scored: Vec<(f64, UpstreamCandidate)> = eligible
            .drain(..)
            .map(|c| {
                let mut s = bandit::score(&c, strategy, rng);
                if affine_arm.as_deref() == Some(c.arm_id()) {
                    s += self.affinity_bonus;
                }
                (s, c)
            })
            .collect();

        // Score descending; ties broken by priority (lower value first),
        // then weight (higher first).
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| b.weight.cmp(&a.weight))
        });

        let mut candidates: Vec<UpstreamCandidate> =
            scored.into_iter().map(|(_, c)| c).collect();

        // Epsilon-greedy exploration promotes a uniformly random candidate
        // to primary; the rest keep their exploitation order.
        if strategy == RoutingStrategy::EpsilonGreedy
            && candidates.len() > 1
            && rng.r#gen::<f64>() < epsilon
        {
            let pick = candidates
                .choose(rng)
                .map(|c| c.arm_id().to_string())
                .unwrap_or_default();
            if let Some(pos) = candidates.iter().position(|c| c.arm_id() == pick) {
                let chosen = candidates.remove(pos);
                candidates.insert(0, chosen);
            }
        }

        debug!(
            model,
            primary = candidates[0].arm_id(),
            pool = candidates.len(),
            affinity_hit,
            "routing selection complete"
        );

        Ok(Selection { candidates, affinity_hit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::repo::MemoryCatalog;
    use crate::types::{AuthConfig, AuthType, BanditArmState, ProtocolKind};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;
    use std::time::Duration;

    fn candidate(arm_id: &str, priority: u32, weight: u32) -> UpstreamCandidate {
        UpstreamCandidate {
            preset_id: "p".into(),
            instance_id: format!("inst-{arm_id}"),
            model_id: "m".into(),
            upstream_model: "gpt-4".into(),
            credential_ref: "r".into(),
            provider: "openai".into(),
            base_url: "https://api.example.com".into(),
            upstream_path: "chat/completions".into(),
            protocol: ProtocolKind::OpenAi,
            auth_type: AuthType::Bearer,
            auth_config: AuthConfig::default(),
            default_headers: HashMap::new(),
            default_params: HashMap::new(),
            template_engine: Default::default(),
            request_template: serde_json::Value::Null,
            response_transform: Default::default(),
            pricing: Default::default(),
            limits: Default::default(),
            routing: Default::default(),
            capability_config: Default::default(),
            auto_append_v1: None,
            weight,
            priority,
            enabled: true,
            arm: BanditArmState::fresh(arm_id),
        }
    }

    fn selector(catalog: Arc<MemoryCatalog>) -> RoutingSelector {
        let kv = Arc::new(MemoryStore::new());
        let affinity = Arc::new(AffinityTracker::new(kv, 0.5, Duration::from_secs(60)));
        RoutingSelector::new(catalog, affinity, &GatewayConfig::default())
    }

    #[tokio::test]
    async fn cold_start_orders_by_priority_then_weight() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add("gpt-4", candidate("arm-low-prio", 2, 9));
        catalog.add("gpt-4", candidate("arm-heavy", 1, 5));
        catalog.add("gpt-4", candidate("arm-light", 1, 2));

        // Seed chosen so the exploration draw exceeds epsilon.
        let mut rng = StdRng::seed_from_u64(3);
        let sel = selector(catalog)
            .select_with_rng(
                "gpt-4",
                Capability::Chat,
                Channel::External,
                None,
                &serde_json::json!({}),
                &[],
                &mut rng,
            )
            .await
            .unwrap();

        let order: Vec<&str> = sel.candidates.iter().map(|c| c.arm_id()).collect();
        assert_eq!(order, vec!["arm-heavy", "arm-light", "arm-low-prio"]);
        assert_eq!(sel.candidates.len(), 3, "failover list covers every enabled arm");
    }

    #[tokio::test]
    async fn disabled_and_cooling_arms_are_filtered() {
        let catalog = Arc::new(MemoryCatalog::new());
        let mut dead = candidate("arm-dead", 1, 1);
        dead.enabled = false;
        let mut cooling = candidate("arm-cooling", 1, 1);
        cooling.arm.cooldown_until = Some(Utc::now() + chrono::Duration::seconds(300));
        catalog.add("gpt-4", dead);
        catalog.add("gpt-4", cooling);
        catalog.add("gpt-4", candidate("arm-ok", 1, 1));

        let sel = selector(catalog)
            .select(
                "gpt-4",
                Capability::Chat,
                Channel::External,
                None,
                &serde_json::json!({}),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(sel.candidates.len(), 1);
        assert_eq!(sel.candidates[0].arm_id(), "arm-ok");
    }

    #[tokio::test]
    async fn capability_requirements_drop_unfit_candidates() {
        let catalog = Arc::new(MemoryCatalog::new());
        let mut clone_only = candidate("arm-clone", 1, 1);
        clone_only.capability_config.required_fields = vec!["reference_audio_url".into()];
        catalog.add("tts-1", clone_only);
        catalog.add("tts-1", candidate("arm-plain", 2, 1));

        let sel = selector(catalog.clone())
            .select(
                "tts-1",
                Capability::TextToSpeech,
                Channel::External,
                None,
                &serde_json::json!({}),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(sel.candidates[0].arm_id(), "arm-plain");
        assert_eq!(sel.candidates.len(), 1);

        let sel = selector(catalog)
            .select(
                "tts-1",
                Capability::TextToSpeech,
                Channel::External,
                None,
                &serde_json::json!({"reference_audio_url": "https://a/b.wav"}),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(sel.candidates.len(), 2);
    }

    #[tokio::test]
    async fn no_candidates_is_a_gateway_error() {
        let catalog = Arc::new(MemoryCatalog::new());
        let err = selector(catalog)
            .select(
                "unknown-model",
                Capability::Chat,
                Channel::External,
                None,
                &serde_json::json!({}),
                &[],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_AVAILABLE_UPSTREAM");
    }

    #[tokio::test]
    async fn affinity_bonus_promotes_recorded_arm() {
        let kv = Arc::new(MemoryStore::new());
        let affinity = Arc::new(AffinityTracker::new(kv, 1.0, Duration::from_secs(60)));
        let catalog = Arc::new(MemoryCatalog::new());

        // arm-b has the better raw success rate
        let mut a = candidate("arm-a", 1, 1);
        a.arm.total_trials = 10;
        a.arm.successes = 4;
        a.arm.failures = 6;
        let mut b = candidate("arm-b", 1, 1);
        b.arm.total_trials = 10;
        b.arm.successes = 6;
        b.arm.failures = 4;
        catalog.add("gpt-4", a);
        catalog.add("gpt-4", b);

        let messages = vec![ChatMessage::user("hi")];
        affinity.record("gpt-4", &messages, "arm-a").await.unwrap();

        let mut cfg = GatewayConfig::default();
        cfg.affinity_bonus = 1.0;
        let selector = RoutingSelector::new(catalog, affinity, &cfg);

        let mut rng = StdRng::seed_from_u64(3);
        let sel = selector
            .select_with_rng(
                "gpt-4",
                Capability::Chat,
                Channel::External,
                None,
                &serde_json::json!({}),
                &messages,
                &mut rng,
            )
            .await
            .unwrap();
        assert!(sel.affinity_hit);
        assert_eq!(sel.candidates[0].arm_id(), "arm-a");
    }
}
