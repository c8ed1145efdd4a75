//! Role-keyed registry of provider managers
//!
//! One process holds one manager per logical role. Reload replaces a role's
//! manager wholesale and atomically; in-flight calls keep their `Arc` to the
//! old manager and drain naturally.

use crate::config::{GateConfig, RoleConfig};
use crate::error::GateResult;
use crate::manager::ProviderManager;
use crate::provider::HealthPolicy;
use crate::store::CounterStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Process-wide registry mapping role names to their provider managers
pub struct GateRegistry {
    store: Arc<dyn CounterStore>,
    policy: HealthPolicy,
    managers: RwLock<HashMap<String, Arc<ProviderManager>>>,
}

impl GateRegistry {
    /// Create an empty registry over the given counter store
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            policy: HealthPolicy::default(),
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry with one manager per configured role
    pub fn from_config(config: &GateConfig, store: Arc<dyn CounterStore>) -> GateResult<Self> {
        let registry = Self::new(store);
        registry.reload(config)?;
        Ok(registry)
    }

    /// Override the health policy applied to newly built managers
    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shared handle to one role's manager
    pub fn manager(&self, role: &str) -> Option<Arc<ProviderManager>> {
        self.managers.read().get(role).cloned()
    }

    /// Names of all registered roles
    pub fn roles(&self) -> Vec<String> {
        self.managers.read().keys().cloned().collect()
    }

    /// Replace one role's manager from fresh configuration
    pub fn reload_role(&self, role: &str, config: &RoleConfig) -> GateResult<()> {
        let manager = Arc::new(self.build(role, config)?);
        self.managers.write().insert(role.to_string(), manager);
        info!(role, "provider manager reloaded");
        Ok(())
    }

    /// Replace the whole registry from fresh configuration
    ///
    /// Builds every manager first, then swaps the map in one step, so a bad
    /// role leaves the running registry untouched.
    pub fn reload(&self, config: &GateConfig) -> GateResult<()> {
        let mut next = HashMap::with_capacity(config.roles.len());
        for (role, role_config) in &config.roles {
            next.insert(role.clone(), Arc::new(self.build(role, role_config)?));
        }
        *self.managers.write() = next;
        info!(roles = config.roles.len(), "provider registry reloaded");
        Ok(())
    }

    fn build(&self, role: &str, config: &RoleConfig) -> GateResult<ProviderManager> {
        ProviderManager::with_policy(
            role,
            config.providers.clone(),
            config.rotation_strategy,
            self.store.clone(),
            self.policy,
        )
    }
}
