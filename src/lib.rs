//! # Ignition - Dependency-Aware Parallel Service Initialization
//!
//! A graph-driven initialization engine: declare your services and their
//! dependencies, and Ignition computes which services can start together,
//! runs each wave concurrently under per-service timeouts, and hands back a
//! full per-service report.
//!
//! ## Features
//!
//! - ⚡ **Wave-parallel startup** - Kahn's-algorithm grouping into waves of
//!   mutually independent services, executed concurrently
//! - 🔒 **Strict ordering** - a wave never starts before the previous wave
//!   has fully finished, success or failure
//! - 🧮 **Cost-weighted planning** - heuristic per-type costs drive
//!   dependency-first ordering and weighted shortest-path analysis
//! - 🗃️ **LRU instance cache** - lock-free reads via `DashMap`, batched
//!   eviction under pressure
//! - 🏭 **Compiled resolvers** - one specialized construction closure per
//!   type, cached after the first request
//! - ⏱️ **Timeouts and cancellation** - per-service time bounds and
//!   between-wave run cancellation
//! - 📊 **Observable** - optional tracing integration with JSON or pretty
//!   output
//!
//! ## Quick Start
//!
//! ```rust
//! use ignition::{InitializationEngine, InitOptions, ServiceKey};
//!
//! struct Config { url: String }
//! struct Database;
//! struct HttpServer;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ignition::Result<()> {
//! let engine = InitializationEngine::new();
//! engine.registry().singleton(Config { url: "postgres://localhost".into() });
//! engine.registry().factory(|| Database).depends_on::<Config>();
//! engine.registry().factory(|| HttpServer).depends_on::<Database>();
//!
//! let report = engine
//!     .initialize_services(
//!         &[
//!             ServiceKey::of::<Config>(),
//!             ServiceKey::of::<Database>(),
//!             ServiceKey::of::<HttpServer>(),
//!         ],
//!         InitOptions::new(),
//!     )
//!     .await?;
//!
//! assert!(report.success);
//! assert_eq!(report.waves.len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle Hooks
//!
//! Services with async startup work implement [`LifecycleInitializable`] and
//! opt in at registration:
//!
//! ```rust
//! use ignition::{CancellationToken, InitializationEngine, LifecycleInitializable};
//!
//! struct Cache;
//!
//! #[async_trait::async_trait]
//! impl LifecycleInitializable for Cache {
//!     async fn initialize(&self, _cancel: &CancellationToken) -> ignition::Result<()> {
//!         // warm up, connect, preload
//!         Ok(())
//!     }
//! }
//!
//! let engine = InitializationEngine::new();
//! engine.registry().factory(|| Cache).with_lifecycle();
//! ```
//!
//! ## Parallelization Analysis
//!
//! ```rust
//! use ignition::{InitializationEngine, ServiceKey};
//!
//! struct A;
//! struct B;
//!
//! let engine = InitializationEngine::new();
//! engine.registry().factory(|| A);
//! engine.registry().factory(|| B);
//!
//! let analysis = engine
//!     .analyze_parallelization(&[ServiceKey::of::<A>(), ServiceKey::of::<B>()])
//!     .unwrap();
//! assert_eq!(analysis.max_parallelism, 2);
//! ```

mod cache;
mod cancel;
mod engine;
mod error;
mod graph;
mod key;
#[cfg(feature = "logging")]
pub mod logging;
mod metadata;
mod optimizer;
mod orchestrator;
mod resolver;
mod sort;

pub use cache::{CacheStats, ResolutionCache, DEFAULT_CACHE_CAPACITY};
pub use cancel::CancellationToken;
pub use engine::{EngineConfig, InitializationEngine, ParallelizationReport};
pub use error::{IgnitionError, Result};
pub use graph::{DependencyGraph, DependencyGraphBuilder};
pub use key::{Priority, ServiceKey};
pub use metadata::{
    BoxFuture, ConstructionKind, CtorFn, ErasedInstance, FactoryFn, GenericServiceProvider,
    InitHook, LifecycleInitializable, MetadataProvider, Registration, ServiceDescriptor,
    ServiceRegistry,
};
pub use optimizer::{PathIssue, PathReport, ResolutionPathOptimizer, ResolutionPlan};
pub use orchestrator::{
    InitOptions, ParallelInitializationOrchestrator, RunReport, ServiceRecord, ServiceState,
    WaveResult, DEFAULT_CONCURRENCY, DEFAULT_SERVICE_TIMEOUT,
};
pub use resolver::{FastResolverCompiler, ResolverStats, DEFAULT_DEPTH_LIMIT};
pub use sort::{ExecutionPlan, SortConfig, SortStats, TopologicalSortEngine};

// Re-export tracing macros for convenience when logging feature is enabled
#[cfg(feature = "logging")]
pub use tracing::{debug, error, info, trace, warn};

// Re-export for convenience
pub use std::sync::Arc;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CancellationToken, InitOptions, InitializationEngine, LifecycleInitializable, Priority,
        Result, RunReport, ServiceKey, ServiceRegistry, ServiceState,
    };
    pub use std::sync::Arc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Config;
    struct Logger;
    struct Cache;
    struct Api;

    static STARTED: AtomicU32 = AtomicU32::new(0);

    #[async_trait::async_trait]
    impl LifecycleInitializable for Logger {
        async fn initialize(&self, _cancel: &CancellationToken) -> Result<()> {
            STARTED.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }
    }

    fn app_engine() -> InitializationEngine {
        let engine = InitializationEngine::new();
        engine
            .registry()
            .singleton(Config)
            .with_priority(Priority::Critical);
        engine
            .registry()
            .factory(|| Logger)
            .depends_on::<Config>()
            .with_lifecycle();
        engine.registry().factory(|| Cache).depends_on::<Config>();
        engine
            .registry()
            .factory(|| Api)
            .depends_on::<Logger>()
            .depends_on::<Cache>();
        engine
    }

    fn app_keys() -> Vec<ServiceKey> {
        vec![
            ServiceKey::of::<Config>(),
            ServiceKey::of::<Logger>(),
            ServiceKey::of::<Cache>(),
            ServiceKey::of::<Api>(),
        ]
    }

    #[tokio::test]
    async fn full_startup_reports_every_service_completed() {
        let engine = app_engine();
        let report = engine
            .initialize_services(&app_keys(), InitOptions::new())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.initialized.len(), 4);
        assert!(report.failed.is_empty());
        assert_eq!(report.waves.len(), 3);
        assert!(report.speedup_ratio >= 1.0);
        for key in app_keys() {
            assert_eq!(report.state_of(key), Some(ServiceState::Completed));
        }
        assert!(STARTED.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn expected_wave_shape_for_the_app_graph() {
        let engine = app_engine();
        let plan = engine.plan(&app_keys()).unwrap();

        assert_eq!(plan.waves()[0], vec![ServiceKey::of::<Config>()]);
        assert_eq!(plan.waves()[1].len(), 2);
        assert_eq!(plan.waves()[2], vec![ServiceKey::of::<Api>()]);
    }

    #[tokio::test]
    async fn failed_service_does_not_take_down_siblings() {
        struct Good;
        struct Bad;

        #[async_trait::async_trait]
        impl LifecycleInitializable for Bad {
            async fn initialize(&self, _cancel: &CancellationToken) -> Result<()> {
                Err(IgnitionError::init_failed(
                    ServiceKey::of::<Bad>(),
                    "bind: address already in use",
                ))
            }
        }

        let engine = InitializationEngine::new();
        engine.registry().factory(|| Good);
        engine.registry().factory(|| Bad).with_lifecycle();

        let keys = [ServiceKey::of::<Good>(), ServiceKey::of::<Bad>()];
        let report = engine
            .initialize_services(&keys, InitOptions::new().continue_on_failure())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.state_of(ServiceKey::of::<Good>()), Some(ServiceState::Completed));
        assert_eq!(report.state_of(ServiceKey::of::<Bad>()), Some(ServiceState::Failed));
    }

    #[tokio::test]
    async fn cancelled_run_leaves_later_waves_pending() {
        let engine = app_engine();
        let token = CancellationToken::new();
        token.cancel();

        let report = engine
            .initialize_services(&app_keys(), InitOptions::new().with_cancellation(token))
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.initialized.len(), 0);
        assert_eq!(report.pending().len(), 4);
    }

    #[test]
    fn engine_stats_surface_is_wired() {
        let engine = app_engine();
        let _ = engine.resolve_instance(ServiceKey::of::<Cache>()).unwrap();
        let _ = engine.resolve_instance(ServiceKey::of::<Cache>()).unwrap();

        assert!(engine.cache_stats().hits >= 1);
        assert!(engine.resolver_stats().compiled >= 1);

        let _ = engine.plan(&app_keys()).unwrap();
        let _ = engine.plan(&app_keys()).unwrap();
        assert!(engine.sort_stats().cache_hits >= 1);
    }
}
