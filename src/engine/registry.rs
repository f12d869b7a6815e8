//! Step registry: `name → factory`, the only way workflows reach concrete
//! step types.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GatewayError, GatewayResult};

use super::step::{Step, StepConfig};

type StepFactory = Arc<dyn Fn(StepConfig) -> Arc<dyn Step> + Send + Sync>;

/// Instantiated step plus its resolved per-step config.
pub struct StepHandle {
    pub step: Arc<dyn Step>,
    pub config: StepConfig,
}

#[derive(Default)]
pub struct StepRegistry {
    factories: HashMap<&'static str, StepFactory>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Duplicate or empty names are configuration
    /// errors and rejected outright.
    pub fn register(
        &mut self,
        name: &'static str,
        factory: impl Fn(StepConfig) -> Arc<dyn Step> + Send + Sync + 'static,
    ) -> GatewayResult<()> {
        if name.is_empty() {
            return Err(GatewayError::Internal("step name must not be empty".into()));
        }
        if self.factories.contains_key(name) {
            return Err(GatewayError::Internal(format!("step '{name}' already registered")));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn get(&self, name: &str, config: StepConfig) -> GatewayResult<StepHandle> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| GatewayError::Internal(format!("step '{name}' not registered")))?;
        Ok(StepHandle { step: factory(config.clone()), config })
    }

    /// Instantiate a list of steps with optional per-name configs.
    pub fn get_many(
        &self,
        names: &[&str],
        configs: &HashMap<String, StepConfig>,
    ) -> GatewayResult<Vec<StepHandle>> {
        names
            .iter()
            .map(|name| self.get(name, configs.get(*name).cloned().unwrap_or_default()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::WorkflowContext;
    use crate::engine::step::StepResult;
    use async_trait::async_trait;

    struct NoopStep;

    #[async_trait]
    impl Step for NoopStep {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn execute(&self, _ctx: &mut WorkflowContext) -> StepResult {
            StepResult::success()
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = StepRegistry::new();
        registry.register("noop", |_| Arc::new(NoopStep)).unwrap();
        assert!(registry.register("noop", |_| Arc::new(NoopStep)).is_err());
        assert!(registry.register("", |_| Arc::new(NoopStep)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_many_resolves_configs_by_name() {
        let mut registry = StepRegistry::new();
        registry.register("noop", |_| Arc::new(NoopStep)).unwrap();
        let mut configs = HashMap::new();
        configs.insert(
            "noop".to_string(),
            StepConfig { max_retries: Some(5), ..Default::default() },
        );
        let handles = registry.get_many(&["noop"], &configs).unwrap();
        assert_eq!(handles[0].config.max_retries, Some(5));
    }

    #[test]
    fn unknown_step_is_an_error() {
        let registry = StepRegistry::new();
        assert!(registry.get("ghost", StepConfig::default()).is_err());
    }
}
