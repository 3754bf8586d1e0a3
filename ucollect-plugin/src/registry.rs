use std::collections::HashMap;
use std::sync::Arc;

use crate::plugin::Plugin;

/// Name-keyed table of hosted plugins, built once at startup and shared
/// read-only thereafter (adapted from `ando-plugin::registry::PluginRegistry`,
/// which is likewise a plain `HashMap` behind an `Arc` rather than a
/// concurrent map — the set of plugins a process hosts never changes after
/// boot, unlike the per-client version negotiation it gates).
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        tracing::info!(plugin = %name, "registered plugin");
        self.plugins.insert(name, plugin);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::CountingPlugin;

    #[test]
    fn register_and_get_round_trip() {
        let mut registry = PluginRegistry::new();
        registry.register(CountingPlugin::new("buckets"));
        assert!(registry.get("buckets").is_some());
        assert!(registry.get("sniff").is_none());
    }

    #[test]
    fn list_reports_every_registered_name() {
        let mut registry = PluginRegistry::new();
        registry.register(CountingPlugin::new("buckets"));
        registry.register(CountingPlugin::new("count"));
        let mut names = registry.list();
        names.sort_unstable();
        assert_eq!(names, vec!["buckets", "count"]);
    }

    #[test]
    fn empty_registry_reports_empty() {
        let registry = PluginRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }
}
