//! Engine facade wiring the registry, sorter, optimizer, cache, compiler
//! and orchestrator together
//!
//! [`InitializationEngine`] is the crate's front door: callers register
//! services on its registry, then either run wave-parallel initialization or
//! resolve individual instances through the cache-backed compiled path. The
//! engine is cheap to clone and shares all internals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{CacheStats, ResolutionCache, DEFAULT_CACHE_CAPACITY};
use crate::error::{IgnitionError, Result};
use crate::graph::DependencyGraphBuilder;
use crate::key::ServiceKey;
use crate::metadata::{ErasedInstance, GenericServiceProvider, MetadataProvider, ServiceRegistry};
use crate::optimizer::{ResolutionPathOptimizer, ResolutionPlan};
use crate::orchestrator::{
    InitOptions, ParallelInitializationOrchestrator, ResolveFn, RunReport,
};
use crate::resolver::{FastResolverCompiler, ResolverStats, DEFAULT_DEPTH_LIMIT};
use crate::sort::{ExecutionPlan, PriorityMap, SortConfig, SortStats, TopologicalSortEngine};

#[cfg(feature = "logging")]
use tracing::debug;

/// Construction-time knobs for [`InitializationEngine`].
pub struct EngineConfig {
    /// Bound on the resolved-instance cache
    pub cache_capacity: usize,
    /// Topological sort configuration
    pub sort: SortConfig,
    /// Bound on constructor sub-resolution depth
    pub depth_limit: usize,
    /// Last-resort provider consulted when no binding is registered
    pub fallback: Option<Arc<dyn GenericServiceProvider>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            sort: SortConfig::default(),
            depth_limit: DEFAULT_DEPTH_LIMIT,
            fallback: None,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("cache_capacity", &self.cache_capacity)
            .field("sort", &self.sort)
            .field("depth_limit", &self.depth_limit)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Parallelization analysis for a set of service types.
#[derive(Debug, Clone)]
pub struct ParallelizationReport {
    /// The computed waves, in execution order
    pub waves: Vec<Vec<ServiceKey>>,
    /// Width of the widest wave
    pub max_parallelism: usize,
    /// Fraction of wave slots actually filled: `services / (waves × width)`
    pub efficiency: f64,
    /// Members of single-service waves; these serialize the run
    pub bottlenecks: Vec<ServiceKey>,
    /// Sequential steps over parallel steps: `services / waves`
    pub estimated_speedup: f64,
}

struct EngineInner {
    registry: Arc<ServiceRegistry>,
    sorter: TopologicalSortEngine,
    optimizer: ResolutionPathOptimizer,
    cache: ResolutionCache,
    compiler: FastResolverCompiler,
    fallback: Option<Arc<dyn GenericServiceProvider>>,
    /// Registry generation the cache and compiler were last synced against
    seen_generation: AtomicU64,
}

/// Front door for registration, analysis and wave-parallel initialization.
///
/// # Examples
///
/// ```rust,no_run
/// use ignition::{InitializationEngine, InitOptions, ServiceKey};
///
/// struct Config;
/// struct Server;
///
/// # async fn demo() -> ignition::Result<()> {
/// let engine = InitializationEngine::default();
/// engine.registry().singleton(Config);
/// engine.registry().factory(|| Server).depends_on::<Config>();
///
/// let report = engine
///     .initialize_services(
///         &[ServiceKey::of::<Config>(), ServiceKey::of::<Server>()],
///         InitOptions::new(),
///     )
///     .await?;
/// assert!(report.success);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InitializationEngine {
    inner: Arc<EngineInner>,
}

impl InitializationEngine {
    /// Create an engine with default configuration over a fresh registry.
    pub fn new() -> Self {
        Self::with_config(Arc::new(ServiceRegistry::new()), EngineConfig::default())
    }

    /// Create an engine over an existing registry.
    pub fn with_registry(registry: Arc<ServiceRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    /// Create a fully configured engine.
    pub fn with_config(registry: Arc<ServiceRegistry>, config: EngineConfig) -> Self {
        let provider: Arc<dyn MetadataProvider> = Arc::clone(&registry) as _;
        Self {
            inner: Arc::new(EngineInner {
                sorter: TopologicalSortEngine::new(config.sort),
                optimizer: ResolutionPathOptimizer::new(Arc::clone(&provider)),
                cache: ResolutionCache::new(config.cache_capacity),
                compiler: FastResolverCompiler::new(provider, config.depth_limit),
                fallback: config.fallback,
                seen_generation: AtomicU64::new(registry.generation()),
                registry,
            }),
        }
    }

    /// The underlying registry, for service registration.
    #[inline]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// Compute the wave execution plan for `types`.
    ///
    /// Priorities come from the registered descriptors. Fails on dependency
    /// cycles.
    pub fn plan(&self, types: &[ServiceKey]) -> Result<Arc<ExecutionPlan>> {
        let graph = DependencyGraphBuilder::build(types, &*self.inner.registry);
        let mut priorities = PriorityMap::default();
        for &key in graph.nodes() {
            if let Some(desc) = self.inner.registry.metadata(key) {
                priorities.insert(key, desc.priority);
            }
        }
        self.inner.sorter.sort(&graph, Some(&priorities))
    }

    /// Analyze how much parallelism the dependency structure of `types`
    /// permits.
    pub fn analyze_parallelization(&self, types: &[ServiceKey]) -> Result<ParallelizationReport> {
        let plan = self.plan(types)?;
        let waves: Vec<Vec<ServiceKey>> = plan.waves().to_vec();
        let service_count = plan.service_count();
        let wave_count = plan.wave_count();
        let max_parallelism = plan.max_width();

        let efficiency = if wave_count == 0 || max_parallelism == 0 {
            0.0
        } else {
            service_count as f64 / (wave_count * max_parallelism) as f64
        };
        let estimated_speedup = if wave_count == 0 {
            1.0
        } else {
            service_count as f64 / wave_count as f64
        };
        let bottlenecks: Vec<ServiceKey> = if wave_count > 1 {
            waves
                .iter()
                .filter(|w| w.len() == 1)
                .flatten()
                .copied()
                .collect()
        } else {
            Vec::new()
        };

        Ok(ParallelizationReport {
            waves,
            max_parallelism,
            efficiency,
            bottlenecks,
            estimated_speedup,
        })
    }

    /// Initialize `types` wave by wave under `options`.
    ///
    /// Fails up front on structural problems (dependency cycles); per-service
    /// failures are contained in the returned report instead.
    pub async fn initialize_services(
        &self,
        types: &[ServiceKey],
        options: InitOptions,
    ) -> Result<RunReport> {
        let plan = self.plan(types)?;

        #[cfg(feature = "logging")]
        debug!(
            target: "ignition",
            services = plan.service_count(),
            waves = plan.wave_count(),
            "Starting wave-parallel initialization"
        );

        let resolver_engine = self.clone();
        let resolve: ResolveFn = Arc::new(move |key| resolver_engine.resolve_instance(key));
        let runner = ParallelInitializationOrchestrator::new(
            Arc::clone(&self.inner.registry) as Arc<dyn MetadataProvider>,
            resolve,
        );
        Ok(runner.run(&plan, &options).await)
    }

    /// Resolve one instance: cache first, then the compiled fast path, then
    /// the configured fallback provider.
    pub fn resolve_instance(&self, key: ServiceKey) -> Result<ErasedInstance> {
        self.sync_generation();

        if let Some(instance) = self.inner.cache.get(key) {
            return Ok(instance);
        }

        match self.inner.compiler.resolve(key, self) {
            Ok(instance) => {
                self.inner.cache.set(key, Arc::clone(&instance));
                Ok(instance)
            }
            Err(IgnitionError::NotRegistered { .. }) if self.inner.fallback.is_some() => {
                self.inner.compiler.record_fallback();
                let fallback = self.inner.fallback.as_ref().unwrap();
                let instance = fallback.resolve(key)?;
                self.inner.cache.set(key, Arc::clone(&instance));
                Ok(instance)
            }
            Err(error) => Err(error),
        }
    }

    /// Resolve and downcast one instance.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let key = ServiceKey::of::<T>();
        self.resolve_instance(key)?
            .downcast::<T>()
            .map_err(|_| IgnitionError::Internal(format!("cached instance for {key} has unexpected type")))
    }

    /// Optimized resolution plan for one target's dependency closure.
    pub fn optimized_plan(&self, target: ServiceKey) -> Result<Arc<ResolutionPlan>> {
        self.inner.optimizer.plan(target)
    }

    /// Cheapest dependency chain from `source` to `target`, if reachable.
    pub fn shortest_path(
        &self,
        source: ServiceKey,
        target: ServiceKey,
    ) -> Option<Vec<ServiceKey>> {
        self.inner.optimizer.shortest_path(source, target)
    }

    /// The cost-model optimizer, for standalone path analysis.
    #[inline]
    pub fn optimizer(&self) -> &ResolutionPathOptimizer {
        &self.inner.optimizer
    }

    /// Instance-cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Plan-cache counters.
    pub fn sort_stats(&self) -> SortStats {
        self.inner.sorter.stats()
    }

    /// Compiled-resolver counters.
    pub fn resolver_stats(&self) -> ResolverStats {
        self.inner.compiler.stats()
    }

    /// Drop cached instances and compiled resolvers if the registry changed
    /// since the last resolution.
    fn sync_generation(&self) {
        let current = self.inner.registry.generation();
        let seen = self.inner.seen_generation.swap(current, Ordering::AcqRel);
        if seen != current {
            #[cfg(feature = "logging")]
            debug!(
                target: "ignition",
                generation = current,
                "Registry changed; dropping cached instances and resolvers"
            );

            self.inner.cache.clear();
            self.inner.compiler.clear();
        }
    }
}

impl GenericServiceProvider for InitializationEngine {
    fn try_resolve(&self, key: ServiceKey) -> Option<ErasedInstance> {
        self.resolve_instance(key).ok()
    }

    fn resolve(&self, key: ServiceKey) -> Result<ErasedInstance> {
        self.resolve_instance(key)
    }
}

impl Default for InitializationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InitializationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationEngine")
            .field("registry", &self.inner.registry)
            .field("cache", &self.inner.cache.stats().len)
            .finish()
    }
}
