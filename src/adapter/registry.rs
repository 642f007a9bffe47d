//! Adapter registry - name → adapter lookup

use super::{Adapter, CommandAdapter, CommandProfile};
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Registered adapters, keyed by name
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding a `CommandAdapter` for every built-in profile
    pub fn builtin(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        for profile in CommandProfile::builtin() {
            registry.register(Arc::new(CommandAdapter::new(profile, config)));
        }
        registry
    }

    /// Register an adapter, returning any previous one with the same name
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) -> Option<Arc<dyn Adapter>> {
        self.adapters.insert(adapter.name().to_string(), adapter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Adapter names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<dyn Adapter>> {
        self.adapters.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_are_registered() {
        let registry = AdapterRegistry::builtin(&AppConfig::default());
        assert_eq!(registry.names(), vec!["aider", "claude", "codex", "gemini"]);
        assert!(registry.get("claude").is_some());
        assert!(registry.get("cursor").is_none());
    }

    #[test]
    fn registering_twice_replaces() {
        let config = AppConfig::default();
        let mut registry = AdapterRegistry::new();
        assert!(registry
            .register(Arc::new(CommandAdapter::new(CommandProfile::claude(), &config)))
            .is_none());
        assert!(registry
            .register(Arc::new(CommandAdapter::new(CommandProfile::claude(), &config)))
            .is_some());
        assert_eq!(registry.len(), 1);
    }
}
