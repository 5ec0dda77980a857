use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::info;
use wheelspin_types::{ConfigError, SpinPolicyConfig};

/// Source of per-template policy configs, read before every spin.
pub trait TemplateStore: Send + Sync {
    fn get(&self, template: &str) -> Option<Arc<SpinPolicyConfig>>;

    /// Validate and store `config` under `template`, replacing any previous
    /// config. Invalid configs are rejected here so draws never see them.
    fn put(
        &self,
        template: &str,
        config: SpinPolicyConfig,
    ) -> Result<Arc<SpinPolicyConfig>, ConfigError>;

    /// Known template ids, sorted.
    fn ids(&self) -> Vec<String>;
}

/// In-process [TemplateStore].
#[derive(Debug, Default)]
pub struct Templates {
    configs: RwLock<HashMap<String, Arc<SpinPolicyConfig>>>,
    exclude_guaranteed_from_free: Option<bool>,
}

impl Templates {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that forces `excludeGuaranteedFromFree` on every config it
    /// stores, when `exclude` is set.
    pub fn with_exclusion_override(exclude: Option<bool>) -> Self {
        Self {
            configs: RwLock::default(),
            exclude_guaranteed_from_free: exclude,
        }
    }

    /// Build a store from already-loaded configs, validating each.
    pub fn from_configs(
        configs: impl IntoIterator<Item = (String, SpinPolicyConfig)>,
    ) -> Result<Self, (String, ConfigError)> {
        Self::new().load(configs)
    }

    /// Store every config, naming the first template that fails validation.
    pub fn load(
        self,
        configs: impl IntoIterator<Item = (String, SpinPolicyConfig)>,
    ) -> Result<Self, (String, ConfigError)> {
        for (template, config) in configs {
            self.put(&template, config)
                .map_err(|e| (template.clone(), e))?;
        }
        Ok(self)
    }
}

impl TemplateStore for Templates {
    fn get(&self, template: &str) -> Option<Arc<SpinPolicyConfig>> {
        // Writers swap whole entries, so a poisoned map is still consistent.
        let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        configs.get(template).cloned()
    }

    fn put(
        &self,
        template: &str,
        mut config: SpinPolicyConfig,
    ) -> Result<Arc<SpinPolicyConfig>, ConfigError> {
        if let Some(exclude) = self.exclude_guaranteed_from_free {
            config.exclude_guaranteed_from_free = exclude;
        }
        let config = Arc::new(config.sanitize()?);
        let mut configs = self.configs.write().unwrap_or_else(PoisonError::into_inner);
        configs.insert(template.to_string(), config.clone());
        info!(
            template,
            prizes = config.prizes.len(),
            cycle_length = config.cycle_length,
            "stored template"
        );
        Ok(config)
    }

    fn ids(&self) -> Vec<String> {
        let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = configs.keys().cloned().collect();
        ids.sort();
        ids
    }
}
