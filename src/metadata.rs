//! Service metadata: descriptors, construction bindings, and the registry
//!
//! The engine never inspects types reflectively. Everything it needs to know
//! about a service (dependency list, construction binding, priority, whether
//! it wants a lifecycle-initialize call) is bound explicitly at registration
//! time into a [`ServiceDescriptor`] and served back through the
//! [`MetadataProvider`] contract.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;

use crate::cancel::CancellationToken;
use crate::error::{IgnitionError, Result};
use crate::key::{Priority, ServiceKey};

#[cfg(feature = "logging")]
use tracing::debug;

/// A resolved service instance, type-erased for storage and transport
pub type ErasedInstance = Arc<dyn Any + Send + Sync>;

/// Zero-argument erased factory
pub type FactoryFn = Arc<dyn Fn() -> ErasedInstance + Send + Sync>;

/// Erased constructor; resolves its parameters through the given provider
pub type CtorFn =
    Arc<dyn Fn(&dyn GenericServiceProvider) -> Result<ErasedInstance> + Send + Sync>;

/// Boxed future used by the erased lifecycle hook
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Erased lifecycle-initialize hook, recorded once at registration
pub type InitHook =
    Arc<dyn Fn(ErasedInstance, CancellationToken) -> BoxFuture<Result<()>> + Send + Sync>;

// =============================================================================
// Boundary contracts
// =============================================================================

/// Read side of the registry: per-type metadata lookups.
///
/// Must be a pure, cacheable lookup; the engine consults it once per type
/// per run and works from the snapshot afterwards.
pub trait MetadataProvider: Send + Sync {
    /// Fetch the descriptor for a service type, if registered.
    fn metadata(&self, key: ServiceKey) -> Option<ServiceDescriptor>;

    /// Monotonic counter bumped on every registry mutation.
    ///
    /// Derived artifacts (resolution plans, memoized costs) use this to
    /// detect that the graph changed underneath them.
    fn generation(&self) -> u64 {
        0
    }
}

/// Generic resolution contract.
///
/// Used two ways: compiled constructor closures resolve each parameter
/// through it, and it is the fallback path when no specialized resolver can
/// be compiled for a type.
pub trait GenericServiceProvider: Send + Sync {
    /// Resolve an instance, or `None` when the type is unknown.
    fn try_resolve(&self, key: ServiceKey) -> Option<ErasedInstance>;

    /// Resolve an instance, failing with [`IgnitionError::NotRegistered`].
    fn resolve(&self, key: ServiceKey) -> Result<ErasedInstance> {
        self.try_resolve(key)
            .ok_or_else(|| IgnitionError::not_registered(key))
    }
}

/// Optional capability on resolved instances: an async initialize step the
/// orchestrator invokes under its per-service timeout.
///
/// Services without this capability are treated as immediately initialized.
#[async_trait::async_trait]
pub trait LifecycleInitializable: Send + Sync {
    /// Perform startup work. Observe `cancel` for cooperative shutdown.
    async fn initialize(&self, cancel: &CancellationToken) -> Result<()>;
}

// =============================================================================
// Descriptor
// =============================================================================

/// How a service instance is produced.
#[derive(Clone)]
pub enum ConstructionKind {
    /// Pre-built instance; resolution is an `Arc` clone
    Singleton(ErasedInstance),
    /// Zero-argument factory invoked on every resolution request
    Factory(FactoryFn),
    /// Constructor that resolves its parameters through a provider
    Constructor {
        ctor: CtorFn,
        /// Declared parameter count; feeds the cost model only
        parameter_count: usize,
    },
}

impl ConstructionKind {
    /// Short label for logs and reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Singleton(_) => "singleton",
            Self::Factory(_) => "factory",
            Self::Constructor { .. } => "constructor",
        }
    }
}

impl std::fmt::Debug for ConstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constructor { parameter_count, .. } => f
                .debug_struct("Constructor")
                .field("parameter_count", parameter_count)
                .finish(),
            other => f.write_str(other.label()),
        }
    }
}

/// Immutable description of one registered service.
#[derive(Clone)]
pub struct ServiceDescriptor {
    /// Identity of the service type
    pub key: ServiceKey,
    /// Declared dependency types (may include types outside any given run)
    pub dependencies: Vec<ServiceKey>,
    /// Construction binding
    pub kind: ConstructionKind,
    /// Ready-queue tie-break priority
    pub priority: Priority,
    /// Lifecycle-initialize hook, present only when the service opted in
    pub init_hook: Option<InitHook>,
}

impl ServiceDescriptor {
    /// Constructor parameter count (0 for singletons and factories)
    #[inline]
    pub fn parameter_count(&self) -> usize {
        match &self.kind {
            ConstructionKind::Constructor { parameter_count, .. } => *parameter_count,
            _ => 0,
        }
    }

    /// Whether this service is a pre-built singleton
    #[inline]
    pub fn is_singleton(&self) -> bool {
        matches!(self.kind, ConstructionKind::Singleton(_))
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("key", &self.key.short_name())
            .field("dependencies", &self.dependencies.len())
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("has_init_hook", &self.init_hook.is_some())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registration-time binding surface.
///
/// Thread-safe; uses a `DashMap` so registration and lookup never block each
/// other. Each mutation bumps a generation counter that invalidates derived
/// plans.
///
/// # Examples
///
/// ```rust
/// use ignition::{ServiceRegistry, Priority};
///
/// struct Config { debug: bool }
/// struct Logger;
///
/// let registry = ServiceRegistry::new();
/// registry.singleton(Config { debug: true }).with_priority(Priority::Critical);
/// registry
///     .factory(|| Logger)
///     .depends_on::<Config>();
/// ```
pub struct ServiceRegistry {
    descriptors: DashMap<ServiceKey, ServiceDescriptor, RandomState>,
    generation: AtomicU64,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            descriptors: DashMap::with_hasher(RandomState::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Register a pre-built singleton instance.
    pub fn singleton<T: Send + Sync + 'static>(&self, instance: T) -> Registration<'_, T> {
        self.install::<T>(ConstructionKind::Singleton(Arc::new(instance)))
    }

    /// Register a singleton from an existing `Arc`.
    pub fn singleton_arc<T: Send + Sync + 'static>(&self, instance: Arc<T>) -> Registration<'_, T> {
        self.install::<T>(ConstructionKind::Singleton(instance))
    }

    /// Register a zero-argument factory.
    pub fn factory<T, F>(&self, factory: F) -> Registration<'_, T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.install::<T>(ConstructionKind::Factory(Arc::new(move || {
            Arc::new(factory()) as ErasedInstance
        })))
    }

    /// Register a constructor that resolves its parameters through a provider.
    ///
    /// `parameter_count` is the declared constructor arity; it feeds the cost
    /// model, not control flow.
    pub fn constructor<T, F>(&self, parameter_count: usize, ctor: F) -> Registration<'_, T>
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn GenericServiceProvider) -> Result<T> + Send + Sync + 'static,
    {
        self.install::<T>(ConstructionKind::Constructor {
            ctor: Arc::new(move |provider| Ok(Arc::new(ctor(provider)?) as ErasedInstance)),
            parameter_count,
        })
    }

    fn install<T: Send + Sync + 'static>(&self, kind: ConstructionKind) -> Registration<'_, T> {
        let key = ServiceKey::of::<T>();

        #[cfg(feature = "logging")]
        debug!(
            target: "ignition",
            service = key.name(),
            kind = kind.label(),
            "Registering service"
        );

        self.descriptors.insert(
            key,
            ServiceDescriptor {
                key,
                dependencies: Vec::new(),
                kind,
                priority: Priority::default(),
                init_hook: None,
            },
        );
        self.bump();

        Registration {
            registry: self,
            key,
            _marker: PhantomData,
        }
    }

    /// Number of registered services.
    #[inline]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Whether a type is registered.
    #[inline]
    pub fn contains(&self, key: ServiceKey) -> bool {
        self.descriptors.contains_key(&key)
    }

    /// All registered keys.
    pub fn keys(&self) -> Vec<ServiceKey> {
        self.descriptors.iter().map(|r| *r.key()).collect()
    }

    /// Remove a registration. Returns whether anything was removed.
    pub fn remove(&self, key: ServiceKey) -> bool {
        let removed = self.descriptors.remove(&key).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    #[inline]
    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn update<F: FnOnce(&mut ServiceDescriptor)>(&self, key: ServiceKey, f: F) {
        if let Some(mut entry) = self.descriptors.get_mut(&key) {
            f(entry.value_mut());
        }
        self.bump();
    }
}

impl MetadataProvider for ServiceRegistry {
    fn metadata(&self, key: ServiceKey) -> Option<ServiceDescriptor> {
        self.descriptors.get(&key).map(|r| r.value().clone())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Registration builder
// =============================================================================

/// Fluent continuation of a registration.
///
/// The service is registered as soon as the `singleton`/`factory`/
/// `constructor` call returns; the builder only refines the stored
/// descriptor, so dropping it without further calls is fine.
pub struct Registration<'a, T> {
    registry: &'a ServiceRegistry,
    key: ServiceKey,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Send + Sync + 'static> Registration<'a, T> {
    /// Declare a dependency on service type `D`.
    pub fn depends_on<D: 'static>(self) -> Self {
        let dep = ServiceKey::of::<D>();
        self.registry.update(self.key, |d| {
            if !d.dependencies.contains(&dep) {
                d.dependencies.push(dep);
            }
        });
        self
    }

    /// Declare dependencies from a pre-built key list.
    pub fn with_dependencies(self, deps: &[ServiceKey]) -> Self {
        self.registry.update(self.key, |d| {
            for &dep in deps {
                if !d.dependencies.contains(&dep) {
                    d.dependencies.push(dep);
                }
            }
        });
        self
    }

    /// Set the ready-queue priority.
    pub fn with_priority(self, priority: Priority) -> Self {
        self.registry.update(self.key, |d| d.priority = priority);
        self
    }

    /// Record the lifecycle-initialize capability.
    ///
    /// The hook downcasts the resolved instance back to `T` and awaits
    /// [`LifecycleInitializable::initialize`]. Recorded once here instead of
    /// probed per call.
    pub fn with_lifecycle(self) -> Self
    where
        T: LifecycleInitializable,
    {
        let hook: InitHook = Arc::new(|instance: ErasedInstance, cancel: CancellationToken| {
            let typed = instance.downcast::<T>();
            Box::pin(async move {
                match typed {
                    Ok(service) => service.initialize(&cancel).await,
                    Err(_) => Err(IgnitionError::Internal(
                        "lifecycle hook received an instance of the wrong type".into(),
                    )),
                }
            })
        });
        self.registry.update(self.key, |d| d.init_hook = Some(hook));
        self
    }

    /// Record a custom erased initialization hook.
    pub fn with_init(self, hook: InitHook) -> Self {
        self.registry.update(self.key, |d| d.init_hook = Some(hook));
        self
    }

    /// The key being registered.
    #[inline]
    pub fn key(&self) -> ServiceKey {
        self.key
    }
}
