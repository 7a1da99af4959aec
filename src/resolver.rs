//! Compiled resolvers: resolve once, invoke many times
//!
//! Each service type gets one specialized construction closure, built from
//! its registration-time binding and cached. Constructor closures resolve
//! their parameters through a [`GenericServiceProvider`], which can recurse;
//! a thread-local in-flight stack turns cyclic constructor dependencies into
//! a fast, precise error instead of unbounded recursion.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;

use crate::error::{IgnitionError, Result};
use crate::key::ServiceKey;
use crate::metadata::{
    ConstructionKind, CtorFn, ErasedInstance, FactoryFn, GenericServiceProvider, MetadataProvider,
};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Default bound on constructor sub-resolution depth
pub const DEFAULT_DEPTH_LIMIT: usize = 32;

thread_local! {
    /// Constructor invocations currently on this thread's stack
    static IN_FLIGHT: RefCell<Vec<ServiceKey>> = const { RefCell::new(Vec::new()) };
}

/// Frame on the in-flight stack. Popping on `Drop` keeps the stack balanced
/// even when a user constructor panics and the panic is caught further up
/// (the orchestrator converts task panics into per-service failures, and
/// worker threads are reused).
struct InFlightFrame;

impl InFlightFrame {
    fn enter(key: ServiceKey, depth_limit: usize) -> Result<Self> {
        IN_FLIGHT.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&key) {
                return Err(IgnitionError::circular(key));
            }
            if stack.len() >= depth_limit {
                return Err(IgnitionError::DepthLimitExceeded {
                    type_name: key.name(),
                    limit: depth_limit,
                });
            }
            stack.push(key);
            Ok(())
        })?;
        Ok(Self)
    }
}

impl Drop for InFlightFrame {
    fn drop(&mut self) {
        // Frames drop strictly LIFO, unwinding included.
        IN_FLIGHT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// A specialized construction function for one service type.
pub enum CompiledResolver {
    /// Pre-built instance; invocation is an `Arc` clone
    Singleton(ErasedInstance),
    /// Zero-argument factory call
    Factory(FactoryFn),
    /// Constructor invocation with provider-driven parameter resolution
    Constructor(CtorFn),
}

impl CompiledResolver {
    #[cfg(feature = "logging")]
    fn label(&self) -> &'static str {
        match self {
            Self::Singleton(_) => "singleton",
            Self::Factory(_) => "factory",
            Self::Constructor(_) => "constructor",
        }
    }
}

/// Counters for compiled-resolver effectiveness.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverStats {
    /// Resolvers compiled (first request per type)
    pub compiled: u64,
    /// Requests served by an already-compiled resolver
    pub fast_hits: u64,
    /// Requests that fell back to the generic provider path
    pub fallbacks: u64,
    /// Requests with no compilable binding and no fallback available
    pub compile_failures: u64,
}

/// Builds and caches one construction closure per service type.
pub struct FastResolverCompiler {
    provider: Arc<dyn MetadataProvider>,
    resolvers: DashMap<ServiceKey, Arc<CompiledResolver>, RandomState>,
    depth_limit: usize,
    compiled: AtomicU64,
    fast_hits: AtomicU64,
    fallbacks: AtomicU64,
    compile_failures: AtomicU64,
}

impl FastResolverCompiler {
    /// Create a compiler over the given metadata source.
    pub fn new(provider: Arc<dyn MetadataProvider>, depth_limit: usize) -> Self {
        Self {
            provider,
            resolvers: DashMap::with_hasher(RandomState::new()),
            depth_limit: depth_limit.max(1),
            compiled: AtomicU64::new(0),
            fast_hits: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            compile_failures: AtomicU64::new(0),
        }
    }

    /// Fetch (compiling on first request) the specialized resolver for a
    /// type. `None` means no binding is registered; the caller must use the
    /// generic fallback path.
    pub fn resolver(&self, key: ServiceKey) -> Option<Arc<CompiledResolver>> {
        if let Some(resolver) = self.resolvers.get(&key) {
            self.fast_hits.fetch_add(1, Ordering::Relaxed);
            return Some(Arc::clone(resolver.value()));
        }

        let Some(descriptor) = self.provider.metadata(key) else {
            self.compile_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let resolver = Arc::new(match descriptor.kind {
            ConstructionKind::Singleton(instance) => CompiledResolver::Singleton(instance),
            ConstructionKind::Factory(factory) => CompiledResolver::Factory(factory),
            ConstructionKind::Constructor { ctor, .. } => CompiledResolver::Constructor(ctor),
        });
        self.compiled.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "logging")]
        debug!(
            target: "ignition",
            service = key.name(),
            kind = resolver.label(),
            "Compiled specialized resolver"
        );

        self.resolvers.insert(key, Arc::clone(&resolver));
        Some(resolver)
    }

    /// Resolve an instance through the compiled resolver for `key`.
    ///
    /// Constructor resolvers run under the in-flight guard: re-entering a
    /// key already being constructed on this thread fails with
    /// [`IgnitionError::CircularConstructor`], and recursion past the depth
    /// limit fails with [`IgnitionError::DepthLimitExceeded`].
    pub fn resolve(
        &self,
        key: ServiceKey,
        provider: &dyn GenericServiceProvider,
    ) -> Result<ErasedInstance> {
        let resolver = self
            .resolver(key)
            .ok_or_else(|| IgnitionError::not_registered(key))?;

        match &*resolver {
            CompiledResolver::Singleton(instance) => Ok(Arc::clone(instance)),
            CompiledResolver::Factory(factory) => Ok(factory()),
            CompiledResolver::Constructor(ctor) => self.invoke_guarded(key, ctor, provider),
        }
    }

    fn invoke_guarded(
        &self,
        key: ServiceKey,
        ctor: &CtorFn,
        provider: &dyn GenericServiceProvider,
    ) -> Result<ErasedInstance> {
        let _frame = InFlightFrame::enter(key, self.depth_limit)?;

        #[cfg(feature = "logging")]
        trace!(
            target: "ignition",
            service = key.name(),
            "Invoking compiled constructor"
        );

        ctor(provider)
    }

    /// Record that a resolution went through the generic fallback path.
    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop all compiled resolvers (e.g. after re-registration).
    pub fn clear(&self) {
        self.resolvers.clear();
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            compiled: self.compiled.load(Ordering::Relaxed),
            fast_hits: self.fast_hits.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FastResolverCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastResolverCompiler")
            .field("cached_resolvers", &self.resolvers.len())
            .field("depth_limit", &self.depth_limit)
            .finish()
    }
}
