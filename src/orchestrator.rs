//! Wave-parallel initialization runner
//!
//! Executes an [`ExecutionPlan`] wave by wave: every member of a wave is
//! initialized concurrently under a per-service timeout, and the next wave
//! never starts until the current one has fully finished. Failures are
//! contained to their service; whether the run continues past a failed wave
//! is the caller's choice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancellationToken;
use crate::error::{IgnitionError, Result};
use crate::key::ServiceKey;
use crate::metadata::{ErasedInstance, MetadataProvider};
use crate::sort::ExecutionPlan;

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Default per-service initialization timeout
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on concurrently running initialization tasks
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Fixed per-service estimate for the sequential baseline. Informational
/// only; never used for control decisions.
const SEQUENTIAL_ESTIMATE_PER_SERVICE: Duration = Duration::from_millis(50);

/// Resolves one service instance; supplied by the engine so the runner stays
/// independent of the cache and compiler wiring.
pub type ResolveFn = Arc<dyn Fn(ServiceKey) -> Result<ErasedInstance> + Send + Sync>;

/// Options for one initialization run.
#[derive(Clone)]
pub struct InitOptions {
    /// Per-service initialization timeout
    pub timeout: Duration,
    /// Keep executing later waves after a wave records a failure
    pub continue_on_failure: bool,
    /// Cap on concurrently running initialization tasks
    pub concurrency: usize,
    /// Caller-supplied cancellation; observed between waves
    pub cancellation: Option<CancellationToken>,
}

impl InitOptions {
    /// Options with the default timeout and concurrency, stopping at the
    /// first failed wave.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_SERVICE_TIMEOUT,
            continue_on_failure: false,
            concurrency: DEFAULT_CONCURRENCY,
            cancellation: None,
        }
    }

    /// Set the per-service timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Keep executing later waves after a failure.
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    /// Cap concurrently running initialization tasks.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Attach a cancellation token for the whole run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl Default for InitOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-run lifecycle state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not yet scheduled; how unattempted services appear in the report
    /// after an early stop
    Pending,
    /// Scheduled in the current wave. Entered when the wave launches, which
    /// under a tight concurrency cap includes time queued for a permit;
    /// `started` marks actual work start
    Initializing,
    Completed,
    Failed,
}

/// Per-service outcome record for one run.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub state: ServiceState,
    /// Index of the wave this service was scheduled in
    pub wave: usize,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
    pub error: Option<IgnitionError>,
}

impl ServiceRecord {
    /// Wall time spent initializing, once finished.
    pub fn duration(&self) -> Option<Duration> {
        Some(self.finished? - self.started?)
    }
}

/// Aggregated outcome of one wave.
#[derive(Debug, Clone)]
pub struct WaveResult {
    pub index: usize,
    pub initialized: usize,
    pub failed: usize,
    pub duration: Duration,
}

/// Aggregated outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Every service completed
    pub success: bool,
    /// The run stopped early on caller cancellation
    pub cancelled: bool,
    pub initialized: Vec<ServiceKey>,
    pub failed: Vec<(ServiceKey, IgnitionError)>,
    pub services: Vec<ServiceRecord>,
    pub waves: Vec<WaveResult>,
    pub elapsed: Duration,
    /// Estimated-sequential over actual wall time; informational only
    pub speedup_ratio: f64,
}

impl RunReport {
    /// Record for one service, if it was part of the run.
    pub fn record(&self, key: ServiceKey) -> Option<&ServiceRecord> {
        self.services.iter().find(|r| r.key == key)
    }

    /// Final state of one service.
    pub fn state_of(&self, key: ServiceKey) -> Option<ServiceState> {
        self.record(key).map(|r| r.state)
    }

    /// Run-level error for an unsuccessful run: [`IgnitionError::RunCancelled`]
    /// when the caller cancelled between waves, otherwise the first recorded
    /// per-service failure. `None` when the run succeeded.
    pub fn run_error(&self) -> Option<IgnitionError> {
        if self.cancelled {
            return Some(IgnitionError::RunCancelled);
        }
        if self.success {
            return None;
        }
        self.failed.first().map(|(_, error)| error.clone())
    }

    /// Services the run never attempted.
    pub fn pending(&self) -> Vec<ServiceKey> {
        self.services
            .iter()
            .filter(|r| r.state == ServiceState::Pending)
            .map(|r| r.key)
            .collect()
    }
}

/// Runs execution plans wave by wave with bounded task concurrency.
pub struct ParallelInitializationOrchestrator {
    provider: Arc<dyn MetadataProvider>,
    resolve: ResolveFn,
}

impl ParallelInitializationOrchestrator {
    /// Create a runner over the given metadata source and resolution path.
    pub fn new(provider: Arc<dyn MetadataProvider>, resolve: ResolveFn) -> Self {
        Self { provider, resolve }
    }

    /// Execute `plan` under `options` and aggregate the outcome.
    ///
    /// Strict wave barrier: no member of wave `k + 1` starts before every
    /// member of wave `k` has finished. Cancellation is observed between
    /// waves; unattempted services stay [`ServiceState::Pending`].
    pub async fn run(&self, plan: &ExecutionPlan, options: &InitOptions) -> RunReport {
        let run_start = Instant::now();
        let run_token = match &options.cancellation {
            Some(token) => token.clone(),
            None => CancellationToken::new(),
        };
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));

        let mut records: Vec<ServiceRecord> = plan
            .waves()
            .iter()
            .enumerate()
            .flat_map(|(wave, members)| {
                members.iter().map(move |&key| ServiceRecord {
                    key,
                    state: ServiceState::Pending,
                    wave,
                    started: None,
                    finished: None,
                    error: None,
                })
            })
            .collect();
        let index_of: HashMap<ServiceKey, usize, RandomState> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key, i))
            .collect();

        let mut wave_results: Vec<WaveResult> = Vec::with_capacity(plan.wave_count());
        let mut cancelled = false;
        let mut stopped_on_failure = false;

        for (wave_index, members) in plan.waves().iter().enumerate() {
            if run_token.is_cancelled() {
                cancelled = true;

                #[cfg(feature = "logging")]
                warn!(
                    target: "ignition",
                    wave = wave_index,
                    "Run cancelled; remaining services left pending"
                );
                break;
            }

            let wave_start = Instant::now();
            let mut tasks = JoinSet::new();
            let mut task_keys: HashMap<tokio::task::Id, ServiceKey, RandomState> =
                HashMap::with_capacity_and_hasher(members.len(), RandomState::new());

            for &key in members {
                records[index_of[&key]].state = ServiceState::Initializing;
                let resolve = Arc::clone(&self.resolve);
                let provider = Arc::clone(&self.provider);
                let token = run_token.child_token();
                let timeout = options.timeout;
                let semaphore = Arc::clone(&semaphore);

                let handle = tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let started = Instant::now();
                    let result = initialize_one(key, &resolve, &*provider, token, timeout).await;
                    (key, started, Instant::now(), result)
                });
                task_keys.insert(handle.id(), key);
            }

            let mut wave_initialized = 0usize;
            let mut wave_failed = 0usize;

            while let Some(joined) = tasks.join_next_with_id().await {
                let (key, started, finished, result) = match joined {
                    Ok((_, output)) => output,
                    Err(join_error) => {
                        let key = task_keys
                            .get(&join_error.id())
                            .copied()
                            .expect("joined task was spawned this wave");
                        let now = Instant::now();
                        let error = IgnitionError::init_failed(key, "initialization task panicked");
                        (key, now, now, Err(error))
                    }
                };

                let record = &mut records[index_of[&key]];
                record.started = Some(started);
                record.finished = Some(finished);
                match result {
                    Ok(()) => {
                        record.state = ServiceState::Completed;
                        wave_initialized += 1;
                    }
                    Err(error) => {
                        #[cfg(feature = "logging")]
                        warn!(
                            target: "ignition",
                            service = key.name(),
                            wave = wave_index,
                            error = %error,
                            "Service initialization failed"
                        );

                        record.state = ServiceState::Failed;
                        record.error = Some(error);
                        wave_failed += 1;
                    }
                }
            }

            let wave_duration = wave_start.elapsed();

            #[cfg(feature = "logging")]
            debug!(
                target: "ignition",
                wave = wave_index,
                initialized = wave_initialized,
                failed = wave_failed,
                elapsed_ms = wave_duration.as_millis() as u64,
                "Wave finished"
            );

            wave_results.push(WaveResult {
                index: wave_index,
                initialized: wave_initialized,
                failed: wave_failed,
                duration: wave_duration,
            });

            if wave_failed > 0 && !options.continue_on_failure {
                stopped_on_failure = true;
                break;
            }
        }

        let elapsed = run_start.elapsed();
        let initialized: Vec<ServiceKey> = records
            .iter()
            .filter(|r| r.state == ServiceState::Completed)
            .map(|r| r.key)
            .collect();
        let failed: Vec<(ServiceKey, IgnitionError)> = records
            .iter()
            .filter(|r| r.state == ServiceState::Failed)
            .map(|r| {
                let error = r
                    .error
                    .clone()
                    .unwrap_or_else(|| IgnitionError::init_failed(r.key, "unknown failure"));
                (r.key, error)
            })
            .collect();

        let estimate = SEQUENTIAL_ESTIMATE_PER_SERVICE * plan.service_count() as u32;
        let speedup_ratio = estimate.as_secs_f64() / elapsed.as_secs_f64().max(1e-9);

        RunReport {
            success: !cancelled && !stopped_on_failure && failed.is_empty(),
            cancelled,
            initialized,
            failed,
            services: records,
            waves: wave_results,
            elapsed,
            speedup_ratio,
        }
    }
}

impl std::fmt::Debug for ParallelInitializationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelInitializationOrchestrator").finish()
    }
}

/// Resolve one instance, then run its lifecycle hook (if any) under the
/// per-service timeout. A timeout fails only this service.
async fn initialize_one(
    key: ServiceKey,
    resolve: &ResolveFn,
    provider: &dyn MetadataProvider,
    token: CancellationToken,
    timeout: Duration,
) -> Result<()> {
    let instance = resolve(key)?;

    let Some(hook) = provider.metadata(key).and_then(|d| d.init_hook) else {
        return Ok(());
    };

    match tokio::time::timeout(timeout, hook(instance, token)).await {
        Ok(result) => result,
        Err(_) => Err(IgnitionError::timeout(key, timeout)),
    }
}
