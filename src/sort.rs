//! Wave-grouping topological sort
//!
//! A Kahn's-algorithm variant that emits the graph as ordered waves of
//! mutually independent services. Strict mode reports cycles as errors; the
//! defensive cycle-breaking lives only in the parallel grouping helper of the
//! optimizer, never here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;

use crate::error::{IgnitionError, Result};
use crate::graph::DependencyGraph;
use crate::key::{Priority, ServiceKey};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Map from service key to its tie-break priority
pub type PriorityMap = HashMap<ServiceKey, Priority, RandomState>;

/// Fixed seeds so the graph content hash is stable within a process run.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Configuration for the sort engine
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Allow O(n) incremental insertion into a previously computed order
    pub incremental: bool,
    /// Node count above which connected components are sorted on worker threads
    pub parallel_threshold: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            incremental: true,
            parallel_threshold: 64,
        }
    }
}

/// An ordered list of waves covering every requested service exactly once.
///
/// For every edge `u depends on v`, `v`'s wave index is strictly less than
/// `u`'s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    waves: Vec<Vec<ServiceKey>>,
}

impl ExecutionPlan {
    /// The waves, in execution order.
    #[inline]
    pub fn waves(&self) -> &[Vec<ServiceKey>] {
        &self.waves
    }

    /// Flatten the waves into one linear order.
    pub fn linear(&self) -> Vec<ServiceKey> {
        self.waves.iter().flatten().copied().collect()
    }

    /// Total number of services across all waves.
    pub fn service_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Number of waves.
    #[inline]
    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    /// Size of the widest wave.
    pub fn max_width(&self) -> usize {
        self.waves.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Index of the wave containing `key`, if any.
    pub fn wave_of(&self, key: ServiceKey) -> Option<usize> {
        self.waves.iter().position(|w| w.contains(&key))
    }
}

/// Counters for plan-cache effectiveness
#[derive(Debug, Clone, Copy, Default)]
pub struct SortStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cached_plans: usize,
}

impl SortStats {
    /// Cache hit ratio in `[0, 1]`.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Computes execution plans and caches them by graph content hash.
///
/// The cache is best-effort acceleration: identical graphs return the cached
/// plan without recomputation, and 64-bit hash collisions are trusted rather
/// than defended against. Callers needing a guaranteed fresh computation use
/// [`TopologicalSortEngine::sort_uncached`].
pub struct TopologicalSortEngine {
    config: SortConfig,
    plans: DashMap<u64, Arc<ExecutionPlan>, RandomState>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl TopologicalSortEngine {
    /// Create an engine with the given configuration.
    pub fn new(config: SortConfig) -> Self {
        Self {
            config,
            plans: DashMap::with_hasher(RandomState::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Compute (or fetch from cache) the execution plan for `graph`.
    ///
    /// `priorities` refines within-wave draining order: `Critical` first,
    /// then by type name. Pass `None` for pure name ordering.
    ///
    /// Cached plans are keyed by graph content alone, so `priorities` takes
    /// effect only on the call that computes a plan; a later call with the
    /// same graph but different priorities returns the cached intra-wave
    /// order. Priorities never affect wave membership. Use
    /// [`TopologicalSortEngine::sort_uncached`] to re-rank an existing graph.
    pub fn sort(
        &self,
        graph: &DependencyGraph,
        priorities: Option<&PriorityMap>,
    ) -> Result<Arc<ExecutionPlan>> {
        let hash = Self::content_hash(graph);

        if let Some(plan) = self.plans.get(&hash) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "logging")]
            trace!(
                target: "ignition",
                graph_hash = hash,
                waves = plan.wave_count(),
                "Execution plan served from cache"
            );

            return Ok(Arc::clone(plan.value()));
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let plan = Arc::new(self.sort_uncached(graph, priorities)?);
        self.plans.insert(hash, Arc::clone(&plan));
        Ok(plan)
    }

    /// Compute the execution plan without consulting or filling the cache.
    pub fn sort_uncached(
        &self,
        graph: &DependencyGraph,
        priorities: Option<&PriorityMap>,
    ) -> Result<ExecutionPlan> {
        let waves = if graph.len() > self.config.parallel_threshold {
            self.sort_by_components(graph, priorities)?
        } else {
            kahn_waves(graph.nodes(), graph, priorities)?
        };

        #[cfg(feature = "logging")]
        debug!(
            target: "ignition",
            services = graph.len(),
            waves = waves.len(),
            "Execution plan computed"
        );

        Ok(ExecutionPlan { waves })
    }

    /// Insert one new node into a previously computed linear order.
    ///
    /// Returns the extended order: one past the last position of any of the
    /// node's dependencies, or position 0 when it has none. This O(n)
    /// approximation is valid only while the prior order itself remains
    /// valid and already contains the dependencies. Returns `None` when
    /// incremental mode is disabled or there is no prior order, in which case
    /// the caller falls back to a full sort.
    pub fn insert_incremental(
        &self,
        order: &[ServiceKey],
        key: ServiceKey,
        dependencies: &[ServiceKey],
    ) -> Option<Vec<ServiceKey>> {
        if !self.config.incremental || order.is_empty() {
            return None;
        }

        let insert_at = order
            .iter()
            .enumerate()
            .filter(|(_, k)| dependencies.contains(k))
            .map(|(i, _)| i + 1)
            .max()
            .unwrap_or(0);

        let mut extended = Vec::with_capacity(order.len() + 1);
        extended.extend_from_slice(&order[..insert_at]);
        extended.push(key);
        extended.extend_from_slice(&order[insert_at..]);
        Some(extended)
    }

    /// Drop all cached plans.
    pub fn clear_cache(&self) {
        self.plans.clear();
    }

    /// Cache effectiveness counters.
    pub fn stats(&self) -> SortStats {
        SortStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cached_plans: self.plans.len(),
        }
    }

    /// Deterministic content hash over `(type name, sorted dep names)` pairs.
    fn content_hash(graph: &DependencyGraph) -> u64 {
        use std::hash::{BuildHasher, Hash, Hasher};

        let mut entries: Vec<(&str, Vec<&str>)> = graph
            .nodes()
            .iter()
            .map(|&key| {
                let mut deps: Vec<&str> = graph
                    .dependencies_of(key)
                    .iter()
                    .map(|d| d.name())
                    .collect();
                deps.sort_unstable();
                (key.name(), deps)
            })
            .collect();
        entries.sort_unstable_by_key(|(name, _)| *name);

        let state = RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
        let mut hasher = state.build_hasher();
        entries.hash(&mut hasher);
        hasher.finish()
    }

    /// Sort independent connected components on scoped worker threads, then
    /// merge wave-index by wave-index. Component discovery treats the graph
    /// as undirected; ordering inside each component is still Kahn's.
    fn sort_by_components(
        &self,
        graph: &DependencyGraph,
        priorities: Option<&PriorityMap>,
    ) -> Result<Vec<Vec<ServiceKey>>> {
        let components = connected_components(graph);

        #[cfg(feature = "logging")]
        debug!(
            target: "ignition",
            services = graph.len(),
            components = components.len(),
            "Large graph decomposed for parallel sorting"
        );

        if components.len() == 1 {
            return kahn_waves(&components[0], graph, priorities);
        }

        let results: Vec<Result<Vec<Vec<ServiceKey>>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = components
                .iter()
                .map(|component| {
                    scope.spawn(move || kahn_waves(component, graph, priorities))
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("sort worker panicked")).collect()
        });

        let mut merged: Vec<Vec<ServiceKey>> = Vec::new();
        let mut cycle_remainder: Vec<ServiceKey> = Vec::new();
        for result in results {
            match result {
                Ok(waves) => {
                    for (index, wave) in waves.into_iter().enumerate() {
                        if merged.len() <= index {
                            merged.push(Vec::new());
                        }
                        merged[index].extend(wave);
                    }
                }
                Err(IgnitionError::CycleDetected { remaining }) => {
                    cycle_remainder.extend(remaining);
                }
                Err(other) => return Err(other),
            }
        }

        if !cycle_remainder.is_empty() {
            return Err(IgnitionError::cycle(cycle_remainder));
        }
        Ok(merged)
    }
}

impl Default for TopologicalSortEngine {
    fn default() -> Self {
        Self::new(SortConfig::default())
    }
}

impl std::fmt::Debug for TopologicalSortEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologicalSortEngine")
            .field("cached_plans", &self.plans.len())
            .finish()
    }
}

/// Kahn frontier grouping restricted to `nodes`.
///
/// In-degree of a node is its number of in-set declared dependencies. Each
/// zero-in-degree frontier becomes one wave; dependents released by a wave
/// join the next frontier, never the current one.
fn kahn_waves(
    nodes: &[ServiceKey],
    graph: &DependencyGraph,
    priorities: Option<&PriorityMap>,
) -> Result<Vec<Vec<ServiceKey>>> {
    let member: std::collections::HashSet<ServiceKey, RandomState> =
        nodes.iter().copied().collect();

    let mut in_degree: HashMap<ServiceKey, usize, RandomState> =
        HashMap::with_capacity_and_hasher(nodes.len(), RandomState::new());
    for &key in nodes {
        let degree = graph
            .dependencies_of(key)
            .iter()
            .filter(|d| member.contains(d))
            .count();
        in_degree.insert(key, degree);
    }

    let rank = |key: ServiceKey| -> (Priority, ServiceKey) {
        let priority = priorities
            .and_then(|p| p.get(&key).copied())
            .unwrap_or_default();
        (priority, key)
    };

    let mut ready: Vec<ServiceKey> = nodes
        .iter()
        .copied()
        .filter(|k| in_degree[k] == 0)
        .collect();
    ready.sort_by_key(|&k| rank(k));

    let mut waves: Vec<Vec<ServiceKey>> = Vec::new();
    let mut emitted = 0usize;

    while !ready.is_empty() {
        let mut next: Vec<ServiceKey> = Vec::new();
        for &key in &ready {
            for &dependent in graph.dependents_of(key) {
                if !member.contains(&dependent) {
                    continue;
                }
                let degree = in_degree
                    .get_mut(&dependent)
                    .expect("dependent is a member node");
                *degree -= 1;
                if *degree == 0 {
                    next.push(dependent);
                }
            }
        }
        emitted += ready.len();
        next.sort_by_key(|&k| rank(k));
        waves.push(std::mem::take(&mut ready));
        ready = next;
    }

    if emitted < nodes.len() {
        let mut remaining: Vec<ServiceKey> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree > 0)
            .map(|(&key, _)| key)
            .collect();
        remaining.sort();
        return Err(IgnitionError::cycle(remaining));
    }

    Ok(waves)
}

/// Undirected connected components, each in deterministic (input) order.
fn connected_components(graph: &DependencyGraph) -> Vec<Vec<ServiceKey>> {
    let mut visited: std::collections::HashSet<ServiceKey, RandomState> =
        std::collections::HashSet::with_capacity_and_hasher(graph.len(), RandomState::new());
    let mut components = Vec::new();

    for &start in graph.nodes() {
        if visited.contains(&start) {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = std::collections::VecDeque::from([start]);
        visited.insert(start);

        while let Some(key) = queue.pop_front() {
            component.push(key);
            for &next in graph
                .dependencies_of(key)
                .iter()
                .chain(graph.dependents_of(key))
            {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        components.push(component);
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraphBuilder;
    use crate::metadata::ServiceRegistry;

    struct Config;
    struct Logger;
    struct Cache;
    struct Api;

    fn diamond_registry() -> ServiceRegistry {
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

    fn diamond_keys() -> Vec<ServiceKey> {
        vec![
            ServiceKey::of::<Api>(),
            ServiceKey::of::<Cache>(),
            ServiceKey::of::<Logger>(),
            ServiceKey::of::<Config>(),
        ]
    }

    #[test]
    fn waves_respect_dependency_order() {
        let registry = diamond_registry();
        let graph = DependencyGraphBuilder::build(&diamond_keys(), &registry);
        let engine = TopologicalSortEngine::default();
        let plan = engine.sort(&graph, None).unwrap();

        assert_eq!(plan.wave_count(), 3);
        assert_eq!(plan.waves()[0], vec![ServiceKey::of::<Config>()]);
        assert_eq!(plan.waves()[2], vec![ServiceKey::of::<Api>()]);
        assert_eq!(plan.waves()[1].len(), 2);
        assert!(plan.waves()[1].contains(&ServiceKey::of::<Logger>()));
        assert!(plan.waves()[1].contains(&ServiceKey::of::<Cache>()));

        // Edge invariant: dependency's wave strictly before dependent's.
        for &key in graph.nodes() {
            for &dep in graph.dependencies_of(key) {
                assert!(plan.wave_of(dep).unwrap() < plan.wave_of(key).unwrap());
            }
        }
        assert_eq!(plan.service_count(), 4);
    }

    #[test]
    fn cycle_is_reported_with_members() {
        struct A;
        struct B;
        struct C;

        let registry = ServiceRegistry::new();
        registry.factory(|| A).depends_on::<B>();
        registry.factory(|| B).depends_on::<C>();
        registry.factory(|| C).depends_on::<A>();

        let keys = [
            ServiceKey::of::<A>(),
            ServiceKey::of::<B>(),
            ServiceKey::of::<C>(),
        ];
        let graph = DependencyGraphBuilder::build(&keys, &registry);
        let engine = TopologicalSortEngine::default();

        match engine.sort(&graph, None) {
            Err(IgnitionError::CycleDetected { remaining }) => {
                assert_eq!(remaining.len(), 3);
                assert!(remaining.contains(&ServiceKey::of::<A>()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn second_sort_hits_the_cache() {
        let registry = diamond_registry();
        let engine = TopologicalSortEngine::default();

        // Different input iteration orders of the same graph must hash alike.
        let graph_a = DependencyGraphBuilder::build(&diamond_keys(), &registry);
        let mut reversed = diamond_keys();
        reversed.reverse();
        let graph_b = DependencyGraphBuilder::build(&reversed, &registry);

        let plan_a = engine.sort(&graph_a, None).unwrap();
        let plan_b = engine.sort(&graph_b, None).unwrap();

        assert_eq!(*plan_a, *plan_b);
        let stats = engine.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert!(stats.hit_ratio() > 0.49);
    }

    #[test]
    fn priority_breaks_first_wave_ties() {
        struct X;
        struct Y;
        struct Z;

        let registry = ServiceRegistry::new();
        registry.factory(|| X).with_priority(Priority::Low);
        registry.factory(|| Y).with_priority(Priority::Critical);
        registry.factory(|| Z).with_priority(Priority::Medium);

        let keys = [
            ServiceKey::of::<X>(),
            ServiceKey::of::<Y>(),
            ServiceKey::of::<Z>(),
        ];
        let graph = DependencyGraphBuilder::build(&keys, &registry);

        let mut priorities = PriorityMap::default();
        priorities.insert(ServiceKey::of::<X>(), Priority::Low);
        priorities.insert(ServiceKey::of::<Y>(), Priority::Critical);
        priorities.insert(ServiceKey::of::<Z>(), Priority::Medium);

        let engine = TopologicalSortEngine::default();
        let plan = engine.sort(&graph, Some(&priorities)).unwrap();
        assert_eq!(
            plan.waves()[0],
            vec![
                ServiceKey::of::<Y>(),
                ServiceKey::of::<Z>(),
                ServiceKey::of::<X>(),
            ]
        );
    }

    #[test]
    fn cached_plan_keeps_the_computing_calls_priority_order() {
        struct X;
        struct Y;

        let registry = ServiceRegistry::new();
        registry.factory(|| X);
        registry.factory(|| Y);
        let keys = [ServiceKey::of::<X>(), ServiceKey::of::<Y>()];
        let graph = DependencyGraphBuilder::build(&keys, &registry);

        let mut favor_y = PriorityMap::default();
        favor_y.insert(ServiceKey::of::<Y>(), Priority::Critical);

        let engine = TopologicalSortEngine::default();
        let first = engine.sort(&graph, Some(&favor_y)).unwrap();
        assert_eq!(first.waves()[0][0], ServiceKey::of::<Y>());

        // Same graph, different priorities: the cached order is returned.
        let mut favor_x = PriorityMap::default();
        favor_x.insert(ServiceKey::of::<X>(), Priority::Critical);
        let second = engine.sort(&graph, Some(&favor_x)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Re-ranking an unchanged graph goes through sort_uncached.
        let fresh = engine.sort_uncached(&graph, Some(&favor_x)).unwrap();
        assert_eq!(fresh.waves()[0][0], ServiceKey::of::<X>());
    }

    #[test]
    fn incremental_insertion_after_dependencies() {
        struct A;
        struct B;
        struct C;
        struct D;

        let b = ServiceKey::of::<B>();
        let a = ServiceKey::of::<A>();
        let engine = TopologicalSortEngine::default();

        // Order [B, A] where A depends on B; C depends on A.
        let order = vec![b, a];
        let with_c = engine
            .insert_incremental(&order, ServiceKey::of::<C>(), &[a])
            .unwrap();
        assert_eq!(with_c, vec![b, a, ServiceKey::of::<C>()]);

        // D has no dependencies: front insertion.
        let with_d = engine
            .insert_incremental(&order, ServiceKey::of::<D>(), &[])
            .unwrap();
        assert_eq!(with_d, vec![ServiceKey::of::<D>(), b, a]);
    }

    #[test]
    fn incremental_disabled_falls_back() {
        struct A;

        let engine = TopologicalSortEngine::new(SortConfig {
            incremental: false,
            ..SortConfig::default()
        });
        assert!(engine
            .insert_incremental(&[ServiceKey::of::<A>()], ServiceKey::of::<A>(), &[])
            .is_none());
        // No prior order behaves the same.
        let enabled = TopologicalSortEngine::default();
        assert!(enabled
            .insert_incremental(&[], ServiceKey::of::<A>(), &[])
            .is_none());
    }

    #[test]
    fn component_decomposition_preserves_ordering() {
        // Two disjoint chains, threshold forced low so the parallel path runs.
        struct A1;
        struct A2;
        struct B1;
        struct B2;

        let registry = ServiceRegistry::new();
        registry.factory(|| A1);
        registry.factory(|| A2).depends_on::<A1>();
        registry.factory(|| B1);
        registry.factory(|| B2).depends_on::<B1>();

        let keys = [
            ServiceKey::of::<A1>(),
            ServiceKey::of::<A2>(),
            ServiceKey::of::<B1>(),
            ServiceKey::of::<B2>(),
        ];
        let graph = DependencyGraphBuilder::build(&keys, &registry);
        assert_eq!(connected_components(&graph).len(), 2);

        let engine = TopologicalSortEngine::new(SortConfig {
            parallel_threshold: 2,
            ..SortConfig::default()
        });
        let plan = engine.sort(&graph, None).unwrap();

        assert_eq!(plan.wave_count(), 2);
        assert_eq!(plan.service_count(), 4);
        for &key in graph.nodes() {
            for &dep in graph.dependencies_of(key) {
                assert!(plan.wave_of(dep).unwrap() < plan.wave_of(key).unwrap());
            }
        }
        // Wave 0 holds both chain heads.
        assert!(plan.waves()[0].contains(&ServiceKey::of::<A1>()));
        assert!(plan.waves()[0].contains(&ServiceKey::of::<B1>()));
    }
}
