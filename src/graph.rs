//! Request-scoped dependency graph
//!
//! Built once per initialization request from metadata lookups, read-only
//! afterwards. Dependencies outside the requested set are treated as already
//! satisfied and never enter the graph.

use std::collections::HashMap;

use ahash::RandomState;

use crate::key::ServiceKey;
use crate::metadata::MetadataProvider;

#[cfg(feature = "logging")]
use tracing::trace;

/// Forward and reverse adjacency over one initialization request.
///
/// Every requested key has an entry in both maps, possibly empty; that is
/// what makes downstream zero-in-degree detection correct.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Requested keys in input order
    nodes: Vec<ServiceKey>,
    /// node -> its in-set dependencies
    dependencies: HashMap<ServiceKey, Vec<ServiceKey>, RandomState>,
    /// node -> in-set nodes depending on it
    dependents: HashMap<ServiceKey, Vec<ServiceKey>, RandomState>,
}

impl DependencyGraph {
    /// Requested keys in input order.
    #[inline]
    pub fn nodes(&self) -> &[ServiceKey] {
        &self.nodes
    }

    /// Number of nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// In-set dependencies of a node (empty for unknown keys).
    #[inline]
    pub fn dependencies_of(&self, key: ServiceKey) -> &[ServiceKey] {
        self.dependencies.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// In-set dependents of a node (empty for unknown keys).
    #[inline]
    pub fn dependents_of(&self, key: ServiceKey) -> &[ServiceKey] {
        self.dependents.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the key is part of this request.
    #[inline]
    pub fn contains(&self, key: ServiceKey) -> bool {
        self.dependencies.contains_key(&key)
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(Vec::len).sum()
    }
}

/// Builds a [`DependencyGraph`] from metadata lookups.
///
/// No cycle detection happens here; cycles are reported precisely at sort
/// time.
pub struct DependencyGraphBuilder;

impl DependencyGraphBuilder {
    /// Build the graph for `types`, consulting `provider` once per type.
    ///
    /// Duplicate keys in the input collapse to one node. Types the provider
    /// does not know get an empty dependency list; whether that is an error
    /// is the caller's call (resolution will fail later with a precise
    /// not-registered error).
    pub fn build(types: &[ServiceKey], provider: &dyn MetadataProvider) -> DependencyGraph {
        let hasher = RandomState::new();
        let mut dependencies: HashMap<ServiceKey, Vec<ServiceKey>, RandomState> =
            HashMap::with_capacity_and_hasher(types.len(), hasher.clone());
        let mut dependents: HashMap<ServiceKey, Vec<ServiceKey>, RandomState> =
            HashMap::with_capacity_and_hasher(types.len(), hasher);

        let mut nodes = Vec::with_capacity(types.len());
        for &key in types {
            if dependencies.contains_key(&key) {
                continue;
            }
            nodes.push(key);
            dependencies.insert(key, Vec::new());
            dependents.insert(key, Vec::new());
        }

        for &key in &nodes {
            let declared = provider
                .metadata(key)
                .map(|d| d.dependencies)
                .unwrap_or_default();

            // Restrict to the requested set; external deps are assumed
            // already satisfied.
            let in_set: Vec<ServiceKey> = declared
                .into_iter()
                .filter(|dep| dependencies.contains_key(dep) && *dep != key)
                .collect();

            #[cfg(feature = "logging")]
            trace!(
                target: "ignition",
                service = key.name(),
                in_set_dependencies = in_set.len(),
                "Graph node populated"
            );

            for &dep in &in_set {
                dependents
                    .get_mut(&dep)
                    .expect("dependency filtered to requested set")
                    .push(key);
            }
            *dependencies
                .get_mut(&key)
                .expect("node inserted above") = in_set;
        }

        DependencyGraph {
            nodes,
            dependencies,
            dependents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ServiceRegistry;

    struct Config;
    struct Logger;
    struct Cache;
    struct Api;

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry.factory(|| Config);
        registry.factory(|| Logger).depends_on::<Config>();
        registry.factory(|| Cache).depends_on::<Config>();
        registry
            .factory(|| Api)
            .depends_on::<Logger>()
            .depends_on::<Cache>();
        registry
    }

    #[test]
    fn builds_forward_and_reverse_maps() {
        let registry = registry();
        let types = [
            ServiceKey::of::<Config>(),
            ServiceKey::of::<Logger>(),
            ServiceKey::of::<Cache>(),
            ServiceKey::of::<Api>(),
        ];
        let graph = DependencyGraphBuilder::build(&types, &registry);

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.edge_count(), 4);
        assert!(graph.dependencies_of(ServiceKey::of::<Config>()).is_empty());
        assert_eq!(
            graph.dependencies_of(ServiceKey::of::<Api>()).len(),
            2,
        );

        let config_dependents = graph.dependents_of(ServiceKey::of::<Config>());
        assert!(config_dependents.contains(&ServiceKey::of::<Logger>()));
        assert!(config_dependents.contains(&ServiceKey::of::<Cache>()));
    }

    #[test]
    fn out_of_set_dependencies_are_excluded() {
        let registry = registry();
        // Logger depends on Config, but Config is not requested.
        let types = [ServiceKey::of::<Logger>(), ServiceKey::of::<Api>()];
        let graph = DependencyGraphBuilder::build(&types, &registry);

        assert_eq!(graph.len(), 2);
        assert!(graph.dependencies_of(ServiceKey::of::<Logger>()).is_empty());
        // Api keeps only its in-set edge to Logger.
        assert_eq!(
            graph.dependencies_of(ServiceKey::of::<Api>()),
            &[ServiceKey::of::<Logger>()]
        );
    }

    #[test]
    fn unknown_types_get_empty_entries() {
        struct Stranger;

        let registry = registry();
        let types = [ServiceKey::of::<Stranger>()];
        let graph = DependencyGraphBuilder::build(&types, &registry);

        assert_eq!(graph.len(), 1);
        assert!(graph.dependencies_of(ServiceKey::of::<Stranger>()).is_empty());
        assert!(graph.dependents_of(ServiceKey::of::<Stranger>()).is_empty());
    }

    #[test]
    fn duplicate_inputs_collapse() {
        let registry = registry();
        let key = ServiceKey::of::<Config>();
        let graph = DependencyGraphBuilder::build(&[key, key, key], &registry);
        assert_eq!(graph.len(), 1);
    }
}
