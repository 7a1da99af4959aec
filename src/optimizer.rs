//! Cost-weighted resolution path analysis
//!
//! The optimizer works on a heuristic per-type resolution cost: cheap for
//! pre-built singletons and factories, more expensive for wide constructors
//! and deep dependency lists. Costs order dependency-first traversal and
//! weight shortest-path search; they are never measured runtimes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ahash::RandomState;

use crate::error::{IgnitionError, Result};
use crate::key::ServiceKey;
use crate::metadata::{ConstructionKind, MetadataProvider};

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Multiplier for pre-built singleton instances
const SINGLETON_FACTOR: f64 = 0.1;
/// Multiplier for factory construction
const FACTORY_FACTOR: f64 = 0.5;
/// Per-constructor-parameter scale-up
const PARAMETER_FACTOR: f64 = 0.2;
/// Per-dependency scale-up
const DEPENDENCY_FACTOR: f64 = 0.1;
/// Individual node cost above which validation flags the node
const HIGH_COST_THRESHOLD: f64 = 5.0;
/// Path length above which validation flags a deep dependency chain
const DEEP_CHAIN_THRESHOLD: usize = 10;

/// Optimized resolution ordering for one target service.
#[derive(Debug, Clone)]
pub struct ResolutionPlan {
    /// The service this plan resolves
    pub target: ServiceKey,
    /// Dependencies-first order, target last
    pub order: Vec<ServiceKey>,
    /// Sum of per-type costs over the order
    pub total_cost: f64,
    /// Costliest subset of the order, cost-descending (diagnostics only)
    pub critical_path: Vec<ServiceKey>,
    /// Greedy dependency-respecting groupings for concurrent resolution
    pub parallel_groups: Vec<Vec<ServiceKey>>,
}

/// Advisory finding from [`ResolutionPathOptimizer::validate_path`].
#[derive(Debug, Clone, PartialEq)]
pub enum PathIssue {
    /// The same type appears more than once (cycle symptom)
    RepeatedType(ServiceKey),
    /// One node's cost exceeds the high-cost threshold
    HighCostNode { key: ServiceKey, cost: f64 },
    /// The whole path is longer than the deep-chain threshold
    DeepChain { length: usize, threshold: usize },
}

impl std::fmt::Display for PathIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RepeatedType(key) => write!(f, "type {key} appears more than once"),
            Self::HighCostNode { key, cost } => {
                write!(f, "high-cost node {key} (cost {cost:.2})")
            }
            Self::DeepChain { length, threshold } => {
                write!(f, "deep dependency chain: {length} nodes (threshold {threshold})")
            }
        }
    }
}

/// Result of validating a candidate resolution order.
#[derive(Debug, Clone)]
pub struct PathReport {
    /// False only when a repeated type was found; other issues are advisory
    pub valid: bool,
    pub issues: Vec<PathIssue>,
}

type CostMap = HashMap<ServiceKey, f64, RandomState>;
type PlanCache = HashMap<(ServiceKey, u64), Arc<ResolutionPlan>, RandomState>;

/// Derives per-type costs, optimized orders and weighted shortest paths.
///
/// Costs are memoized for the lifetime of the optimizer instance; resolution
/// plans are additionally keyed by the provider's generation so registry
/// changes invalidate them.
pub struct ResolutionPathOptimizer {
    provider: Arc<dyn MetadataProvider>,
    costs: Mutex<CostMap>,
    plans: Mutex<PlanCache>,
}

impl ResolutionPathOptimizer {
    /// Create an optimizer over the given metadata source.
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            costs: Mutex::new(CostMap::default()),
            plans: Mutex::new(PlanCache::default()),
        }
    }

    /// Heuristic resolution cost for one type.
    ///
    /// Base 1.0; ×0.1 for a pre-built singleton, ×0.5 for a factory, or
    /// scaled up by `1 + 0.2·parameters` for a constructor; then scaled by
    /// `1 + 0.1·dependencies`. Unregistered types cost the base.
    pub fn cost(&self, key: ServiceKey) -> f64 {
        if let Some(&cost) = self.costs.lock().unwrap().get(&key) {
            return cost;
        }

        let cost = match self.provider.metadata(key) {
            Some(desc) => {
                let construction = match &desc.kind {
                    ConstructionKind::Singleton(_) => SINGLETON_FACTOR,
                    ConstructionKind::Factory(_) => FACTORY_FACTOR,
                    ConstructionKind::Constructor { parameter_count, .. } => {
                        1.0 + PARAMETER_FACTOR * *parameter_count as f64
                    }
                };
                construction * (1.0 + DEPENDENCY_FACTOR * desc.dependencies.len() as f64)
            }
            None => 1.0,
        };

        self.costs.lock().unwrap().insert(key, cost);
        cost
    }

    /// Dependencies-first order over `types`, visiting each node's
    /// dependencies in ascending cost so cheap dependencies complete first.
    pub fn optimal_order(&self, types: &[ServiceKey]) -> Vec<ServiceKey> {
        let member: std::collections::HashSet<ServiceKey, RandomState> =
            types.iter().copied().collect();
        let mut visited: std::collections::HashSet<ServiceKey, RandomState> =
            std::collections::HashSet::with_capacity_and_hasher(types.len(), RandomState::new());
        let mut order = Vec::with_capacity(types.len());

        for &key in types {
            self.visit_cheap_first(key, &member, &mut visited, &mut order);
        }
        order
    }

    fn visit_cheap_first(
        &self,
        key: ServiceKey,
        member: &std::collections::HashSet<ServiceKey, RandomState>,
        visited: &mut std::collections::HashSet<ServiceKey, RandomState>,
        order: &mut Vec<ServiceKey>,
    ) {
        if !visited.insert(key) {
            return;
        }

        let mut deps: Vec<ServiceKey> = self
            .provider
            .metadata(key)
            .map(|d| d.dependencies)
            .unwrap_or_default()
            .into_iter()
            .filter(|d| member.contains(d) && *d != key)
            .collect();
        deps.sort_by(|&a, &b| {
            self.cost(a)
                .total_cmp(&self.cost(b))
                .then_with(|| a.cmp(&b))
        });

        for dep in deps {
            self.visit_cheap_first(dep, member, visited, order);
        }
        order.push(key);
    }

    /// Lowest-total-cost chain from `source` to `target` along dependency
    /// edges, or `None` when unreachable. Ties break by discovery order.
    pub fn shortest_path(&self, source: ServiceKey, target: ServiceKey) -> Option<Vec<ServiceKey>> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        #[derive(PartialEq)]
        struct Candidate {
            cost: f64,
            discovery: u64,
            key: ServiceKey,
        }

        impl Eq for Candidate {}

        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.cost
                    .total_cmp(&other.cost)
                    .then_with(|| self.discovery.cmp(&other.discovery))
            }
        }

        let mut best: HashMap<ServiceKey, f64, RandomState> = HashMap::default();
        let mut previous: HashMap<ServiceKey, ServiceKey, RandomState> = HashMap::default();
        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut discovery = 0u64;

        best.insert(source, 0.0);
        heap.push(Reverse(Candidate {
            cost: 0.0,
            discovery,
            key: source,
        }));

        while let Some(Reverse(candidate)) = heap.pop() {
            if candidate.key == target {
                let mut path = vec![target];
                let mut cursor = target;
                while let Some(&prev) = previous.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }

            if candidate.cost > *best.get(&candidate.key).unwrap_or(&f64::INFINITY) {
                continue;
            }

            let deps = self
                .provider
                .metadata(candidate.key)
                .map(|d| d.dependencies)
                .unwrap_or_default();
            for dep in deps {
                let next_cost = candidate.cost + self.cost(dep);
                if next_cost < *best.get(&dep).unwrap_or(&f64::INFINITY) {
                    best.insert(dep, next_cost);
                    previous.insert(dep, candidate.key);
                    discovery += 1;
                    heap.push(Reverse(Candidate {
                        cost: next_cost,
                        discovery,
                        key: dep,
                    }));
                }
            }
        }
        None
    }

    /// Walk a candidate resolution order and flag suspicious shapes.
    ///
    /// Repeated types mark the path invalid (cycle symptom); high-cost nodes
    /// and over-long chains are advisory warnings.
    pub fn validate_path(&self, path: &[ServiceKey]) -> PathReport {
        let mut issues = Vec::new();
        let mut seen: std::collections::HashSet<ServiceKey, RandomState> =
            std::collections::HashSet::with_capacity_and_hasher(path.len(), RandomState::new());
        let mut valid = true;

        for &key in path {
            if !seen.insert(key) {
                issues.push(PathIssue::RepeatedType(key));
                valid = false;
            }
            let cost = self.cost(key);
            if cost > HIGH_COST_THRESHOLD {
                issues.push(PathIssue::HighCostNode { key, cost });
            }
        }

        if path.len() > DEEP_CHAIN_THRESHOLD {
            issues.push(PathIssue::DeepChain {
                length: path.len(),
                threshold: DEEP_CHAIN_THRESHOLD,
            });
        }

        PathReport { valid, issues }
    }

    /// Greedily bucket `types` into groups where every member's in-set
    /// dependencies were already processed by an earlier group.
    ///
    /// A pass that qualifies nobody (cycle) forces one remaining type into a
    /// singleton group so the call always terminates.
    pub fn group_for_parallel(&self, types: &[ServiceKey]) -> Vec<Vec<ServiceKey>> {
        let member: std::collections::HashSet<ServiceKey, RandomState> =
            types.iter().copied().collect();
        let mut processed: std::collections::HashSet<ServiceKey, RandomState> =
            std::collections::HashSet::with_capacity_and_hasher(types.len(), RandomState::new());
        let mut remaining: Vec<ServiceKey> = {
            let mut seen = std::collections::HashSet::<ServiceKey, RandomState>::default();
            types.iter().copied().filter(|k| seen.insert(*k)).collect()
        };
        let mut groups = Vec::new();

        while !remaining.is_empty() {
            let mut group = Vec::new();
            let mut rest = Vec::new();

            for &key in &remaining {
                let deps_ready = self
                    .provider
                    .metadata(key)
                    .map(|d| {
                        d.dependencies
                            .iter()
                            .filter(|dep| member.contains(dep) && **dep != key)
                            .all(|dep| processed.contains(dep))
                    })
                    .unwrap_or(true);
                if deps_ready {
                    group.push(key);
                } else {
                    rest.push(key);
                }
            }

            if group.is_empty() {
                // Cycle among the remainder: break it by forcing one type
                // into its own group.
                let forced = rest.remove(0);

                #[cfg(feature = "logging")]
                warn!(
                    target: "ignition",
                    service = forced.name(),
                    "Cycle in parallel grouping; forcing service into its own group"
                );

                group.push(forced);
            }

            for &key in &group {
                processed.insert(key);
            }
            groups.push(group);
            remaining = rest;
        }
        groups
    }

    /// Full resolution plan for one target's transitive dependency closure.
    ///
    /// Cached per `(target, registry generation)`.
    pub fn plan(&self, target: ServiceKey) -> Result<Arc<ResolutionPlan>> {
        let generation = self.provider.generation();
        if let Some(plan) = self.plans.lock().unwrap().get(&(target, generation)) {
            return Ok(Arc::clone(plan));
        }

        if self.provider.metadata(target).is_none() {
            return Err(IgnitionError::not_registered(target));
        }

        let closure = self.transitive_closure(target);
        let order = self.optimal_order(&closure);
        let total_cost: f64 = order.iter().map(|&k| self.cost(k)).sum();
        let critical_path = self.critical_path(&order);
        let parallel_groups = self.group_for_parallel(&order);

        let plan = Arc::new(ResolutionPlan {
            target,
            order,
            total_cost,
            critical_path,
            parallel_groups,
        });

        #[cfg(feature = "logging")]
        debug!(
            target: "ignition",
            service = target.name(),
            order_len = plan.order.len(),
            total_cost = plan.total_cost,
            "Resolution plan computed"
        );

        self.plans
            .lock()
            .unwrap()
            .insert((target, generation), Arc::clone(&plan));
        Ok(plan)
    }

    /// Target plus every transitively reachable registered dependency.
    fn transitive_closure(&self, target: ServiceKey) -> Vec<ServiceKey> {
        let mut closure = Vec::new();
        let mut visited: std::collections::HashSet<ServiceKey, RandomState> =
            std::collections::HashSet::default();
        let mut stack = vec![target];

        while let Some(key) = stack.pop() {
            if !visited.insert(key) {
                continue;
            }
            closure.push(key);
            if let Some(desc) = self.provider.metadata(key) {
                stack.extend(desc.dependencies);
            }
        }
        closure
    }

    /// Costliest ~third of the order (at least one node), cost-descending.
    fn critical_path(&self, order: &[ServiceKey]) -> Vec<ServiceKey> {
        if order.is_empty() {
            return Vec::new();
        }
        let mut by_cost: Vec<ServiceKey> = order.to_vec();
        by_cost.sort_by(|&a, &b| {
            self.cost(b)
                .total_cmp(&self.cost(a))
                .then_with(|| a.cmp(&b))
        });
        let take = (order.len() / 3).max(1);
        by_cost.truncate(take);
        by_cost
    }
}

impl std::fmt::Debug for ResolutionPathOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionPathOptimizer")
            .field("memoized_costs", &self.costs.lock().unwrap().len())
            .field("cached_plans", &self.plans.lock().unwrap().len())
            .finish()
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

    fn optimizer(registry: ServiceRegistry) -> ResolutionPathOptimizer {
        ResolutionPathOptimizer::new(Arc::new(registry))
    }

    fn diamond() -> ResolutionPathOptimizer {
        let registry = ServiceRegistry::new();
        registry.singleton(Config);
        registry.factory(|| Logger).depends_on::<Config>();
        registry.factory(|| Cache).depends_on::<Config>();
        registry
            .constructor(2, |_| Ok(Api))
            .depends_on::<Logger>()
            .depends_on::<Cache>();
        optimizer(registry)
    }

    #[test]
    fn cost_model_matches_construction_kind() {
        let opt = diamond();

        // Singleton, no deps: 1.0 * 0.1
        assert!((opt.cost(ServiceKey::of::<Config>()) - 0.1).abs() < 1e-9);
        // Factory, one dep: 0.5 * 1.1
        assert!((opt.cost(ServiceKey::of::<Logger>()) - 0.55).abs() < 1e-9);
        // Constructor with 2 params, 2 deps: (1 + 0.4) * (1 + 0.2)
        assert!((opt.cost(ServiceKey::of::<Api>()) - 1.68).abs() < 1e-9);
        // Unregistered types cost the base.
        struct Stranger;
        assert!((opt.cost(ServiceKey::of::<Stranger>()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn optimal_order_puts_dependencies_first() {
        let opt = diamond();
        let types = [
            ServiceKey::of::<Api>(),
            ServiceKey::of::<Config>(),
            ServiceKey::of::<Logger>(),
            ServiceKey::of::<Cache>(),
        ];
        let order = opt.optimal_order(&types);

        assert_eq!(order.len(), 4);
        assert_eq!(order[0], ServiceKey::of::<Config>());
        assert_eq!(*order.last().unwrap(), ServiceKey::of::<Api>());
        let position = |k: ServiceKey| order.iter().position(|&x| x == k).unwrap();
        assert!(position(ServiceKey::of::<Logger>()) < position(ServiceKey::of::<Api>()));
        assert!(position(ServiceKey::of::<Cache>()) < position(ServiceKey::of::<Api>()));
    }

    #[test]
    fn shortest_path_follows_dependency_edges() {
        let opt = diamond();
        let path = opt
            .shortest_path(ServiceKey::of::<Api>(), ServiceKey::of::<Config>())
            .unwrap();

        assert_eq!(path.first(), Some(&ServiceKey::of::<Api>()));
        assert_eq!(path.last(), Some(&ServiceKey::of::<Config>()));
        assert_eq!(path.len(), 3);

        // Reverse direction is unreachable: edges point from dependent to
        // dependency.
        assert!(opt
            .shortest_path(ServiceKey::of::<Config>(), ServiceKey::of::<Api>())
            .is_none());
    }

    #[test]
    fn validate_path_flags_repeats_and_depth() {
        let opt = diamond();
        let a = ServiceKey::of::<Api>();

        let report = opt.validate_path(&[a, ServiceKey::of::<Logger>(), a]);
        assert!(!report.valid);
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, PathIssue::RepeatedType(k) if *k == a)));

        // A wide constructor pushes past the high-cost threshold.
        struct Heavy;
        let registry = ServiceRegistry::new();
        registry.constructor(30, |_| Ok(Heavy));
        let heavy_opt = optimizer(registry);
        let report = heavy_opt.validate_path(&[ServiceKey::of::<Heavy>()]);
        assert!(report.valid);
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, PathIssue::HighCostNode { .. })));
    }

    #[test]
    fn deep_chains_are_advisory() {
        let opt = diamond();
        let path: Vec<ServiceKey> = (0..12).map(|_| ServiceKey::of::<Config>()).collect();
        let report = opt.validate_path(&path);
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, PathIssue::DeepChain { length: 12, .. })));
    }

    #[test]
    fn parallel_grouping_respects_dependencies() {
        let opt = diamond();
        let types = [
            ServiceKey::of::<Config>(),
            ServiceKey::of::<Logger>(),
            ServiceKey::of::<Cache>(),
            ServiceKey::of::<Api>(),
        ];
        let groups = opt.group_for_parallel(&types);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec![ServiceKey::of::<Config>()]);
        assert_eq!(groups[1].len(), 2);
        assert_eq!(groups[2], vec![ServiceKey::of::<Api>()]);
    }

    #[test]
    fn parallel_grouping_terminates_on_cycles() {
        struct A;
        struct B;

        let registry = ServiceRegistry::new();
        registry.factory(|| A).depends_on::<B>();
        registry.factory(|| B).depends_on::<A>();
        let opt = optimizer(registry);

        let groups = opt.group_for_parallel(&[ServiceKey::of::<A>(), ServiceKey::of::<B>()]);
        // Forced singleton group breaks the deadlock; everything is emitted.
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 2);
        assert_eq!(groups[0].len(), 1);
    }

    #[test]
    fn plan_covers_closure_and_is_cached() {
        let opt = diamond();
        let plan = opt.plan(ServiceKey::of::<Api>()).unwrap();

        assert_eq!(plan.order.len(), 4);
        assert_eq!(*plan.order.last().unwrap(), ServiceKey::of::<Api>());
        assert!(plan.total_cost > 0.0);
        assert!(!plan.critical_path.is_empty());
        // Api is the costliest node in this closure.
        assert_eq!(plan.critical_path[0], ServiceKey::of::<Api>());

        let again = opt.plan(ServiceKey::of::<Api>()).unwrap();
        assert!(Arc::ptr_eq(&plan, &again));
    }

    #[test]
    fn plan_for_unregistered_type_fails() {
        struct Stranger;
        let opt = diamond();
        assert!(matches!(
            opt.plan(ServiceKey::of::<Stranger>()),
            Err(IgnitionError::NotRegistered { .. })
        ));
    }
}
