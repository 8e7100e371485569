//! Layered configuration options.
//!
//! A cluster and each of its nodes carry a [`ConfigLayer`]. Before a node's
//! configuration file is written the two layers are merged, node first, and
//! applied over the defaults shipped with the install.

use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::{Mapping, Value};

/// Default batch window used by [`ConfigLayer::batch_commitlog`].
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 5;

/// A set of option overrides.
///
/// Every key is in one of three states: set to a value, explicitly removed
/// from the written file, or absent, in which case the underlying file
/// keeps its default.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigLayer {
    removed: BTreeSet<String>,
    values: BTreeMap<String, Value>,
}

impl ConfigLayer {
    /// Creates an empty layer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a layer from persisted parts.
    #[must_use]
    pub fn from_parts(
        values: impl IntoIterator<Item = (String, Value)>,
        removed: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut layer = Self::new();
        for key in removed {
            layer.remove(key);
        }
        for (key, value) in values {
            layer.set(key, value);
        }
        layer
    }

    /// Sets `key` to `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.removed.remove(&key);
        self.values.insert(key, value.into());
    }

    /// Drops `key` from this layer so the underlying default applies again.
    ///
    /// Returns whether the layer changed.
    pub fn unset(&mut self, key: &str) -> bool {
        let had_value = self.values.remove(key).is_some();
        let was_removed = self.removed.remove(key);
        had_value || was_removed
    }

    /// Marks `key` for deletion from the written file.
    pub fn remove(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.values.remove(&key);
        self.removed.insert(key);
    }

    /// Value set for `key` in this layer.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether `key` is marked for deletion.
    #[must_use]
    pub fn is_removed(&self, key: &str) -> bool {
        self.removed.contains(key)
    }

    /// Whether the layer overrides nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.removed.is_empty()
    }

    /// Keys and values set in this layer, sorted by key.
    pub fn values(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Keys marked for deletion, sorted.
    pub fn removed(&self) -> impl Iterator<Item = &String> {
        self.removed.iter()
    }

    /// Switches the commit log to batch mode with the given window.
    pub fn batch_commitlog(&mut self, window_ms: u64) {
        self.set("commitlog_sync", "batch");
        self.set("commitlog_sync_batch_window_in_ms", window_ms);
        self.remove("commitlog_sync_period_in_ms");
    }

    /// Enables or disables hinted handoff.
    pub fn hinted_handoff(&mut self, enabled: bool) {
        self.set("hinted_handoff_enabled", enabled);
    }

    /// Sets the rpc timeout.
    pub fn rpc_timeout(&mut self, timeout_ms: u64) {
        self.set("rpc_timeout_in_ms", timeout_ms);
    }
}

/// Options in effect for one node. Derived on demand, never persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EffectiveConfig {
    removed: BTreeSet<String>,
    values: BTreeMap<String, Value>,
}

impl EffectiveConfig {
    /// Value in effect for `key`, if overridden.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether `key` will be deleted from the written file.
    #[must_use]
    pub fn is_removed(&self, key: &str) -> bool {
        self.removed.contains(key)
    }

    /// Applies the overrides to a parsed configuration document.
    pub fn apply(&self, document: &mut Mapping) {
        for key in &self.removed {
            document.remove(key.as_str());
        }

        for (key, value) in &self.values {
            document.insert(Value::String(key.clone()), value.clone());
        }
    }
}

/// Merges cluster-wide options with a node's own overrides.
///
/// The node layer wins on every key it mentions, whether it sets or
/// removes it.
#[must_use]
pub fn merge(cluster: &ConfigLayer, node: &ConfigLayer) -> EffectiveConfig {
    let mut values = cluster.values.clone();
    let mut removed = cluster.removed.clone();

    for (key, value) in &node.values {
        removed.remove(key);
        values.insert(key.clone(), value.clone());
    }

    for key in &node.removed {
        values.remove(key);
        removed.insert(key.clone());
    }

    EffectiveConfig { removed, values }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> Mapping {
        serde_yaml::from_str(
            "cluster_name: Test Cluster\n\
             commitlog_sync: periodic\n\
             commitlog_sync_period_in_ms: 10000\n\
             hinted_handoff_enabled: true\n",
        )
        .unwrap()
    }

    #[test]
    fn test_node_override_wins() {
        let mut cluster = ConfigLayer::new();
        cluster.set("concurrent_reads", 32);
        cluster.set("concurrent_writes", 32);

        let mut node = ConfigLayer::new();
        node.set("concurrent_reads", 8);

        let effective = merge(&cluster, &node);

        assert_eq!(effective.get("concurrent_reads"), Some(&Value::from(8)));
        assert_eq!(effective.get("concurrent_writes"), Some(&Value::from(32)));
    }

    #[test]
    fn test_node_can_restore_removed_key() {
        let mut cluster = ConfigLayer::new();
        cluster.remove("commitlog_sync_period_in_ms");

        let mut node = ConfigLayer::new();
        node.set("commitlog_sync_period_in_ms", 5000);

        let effective = merge(&cluster, &node);

        assert!(!effective.is_removed("commitlog_sync_period_in_ms"));
        assert_eq!(
            effective.get("commitlog_sync_period_in_ms"),
            Some(&Value::from(5000))
        );
    }

    #[test]
    fn test_set_then_unset_restores_default() {
        let mut layer = ConfigLayer::new();
        layer.set("hinted_handoff_enabled", false);
        assert!(layer.unset("hinted_handoff_enabled"));
        assert!(!layer.unset("hinted_handoff_enabled"));

        let mut doc = document();
        merge(&layer, &ConfigLayer::new()).apply(&mut doc);

        assert_eq!(doc, document());
    }

    #[test]
    fn test_batch_commitlog() {
        let mut layer = ConfigLayer::new();
        layer.batch_commitlog(DEFAULT_BATCH_WINDOW_MS);

        let mut doc = document();
        merge(&layer, &ConfigLayer::new()).apply(&mut doc);

        assert_eq!(doc.get("commitlog_sync"), Some(&Value::from("batch")));
        assert_eq!(
            doc.get("commitlog_sync_batch_window_in_ms"),
            Some(&Value::from(5))
        );
        assert!(doc.get("commitlog_sync_period_in_ms").is_none());
        assert_eq!(doc.get("cluster_name"), Some(&Value::from("Test Cluster")));
    }

    #[test]
    fn test_from_parts_prefers_values() {
        let layer = ConfigLayer::from_parts(
            [("rpc_timeout_in_ms".to_string(), Value::from(1000))],
            ["rpc_timeout_in_ms".to_string(), "num_tokens".to_string()],
        );

        assert_eq!(layer.get("rpc_timeout_in_ms"), Some(&Value::from(1000)));
        assert!(!layer.is_removed("rpc_timeout_in_ms"));
        assert!(layer.is_removed("num_tokens"));
    }
}
