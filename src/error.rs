//! Error types for the initialization engine

use std::time::Duration;
use thiserror::Error;

use crate::key::ServiceKey;

/// Errors that can occur while planning or running service initialization
#[derive(Error, Debug)]
pub enum IgnitionError {
    /// The dependency graph contains a cycle; names the unresolved remainder
    #[error("dependency cycle detected among: {}", format_keys(.remaining))]
    CycleDetected { remaining: Vec<ServiceKey> },

    /// One service's initialization task exceeded its time bound
    #[error("initialization of {type_name} timed out after {timeout:?}")]
    InitializationTimeout {
        type_name: &'static str,
        timeout: Duration,
    },

    /// A lifecycle-initialize call failed or panicked
    #[error("initialization of {type_name} failed: {reason}")]
    InitializationFailed {
        type_name: &'static str,
        reason: String,
    },

    /// A compiled constructor re-entered itself while resolving its parameters
    #[error("circular constructor dependency while resolving: {type_name}")]
    CircularConstructor { type_name: &'static str },

    /// Constructor sub-resolution recursed past the configured depth limit
    #[error("resolution of {type_name} exceeded depth limit {limit}")]
    DepthLimitExceeded {
        type_name: &'static str,
        limit: usize,
    },

    /// No metadata is registered for the requested service type
    #[error("service not registered: {type_name}")]
    NotRegistered { type_name: &'static str },

    /// The caller cancelled the run between waves
    #[error("initialization run cancelled")]
    RunCancelled,

    /// Internal engine error
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl IgnitionError {
    /// Create a CycleDetected error from the unresolved remainder
    #[inline]
    pub fn cycle(remaining: Vec<ServiceKey>) -> Self {
        Self::CycleDetected { remaining }
    }

    /// Create a NotRegistered error for a key
    #[inline]
    pub fn not_registered(key: ServiceKey) -> Self {
        Self::NotRegistered {
            type_name: key.name(),
        }
    }

    /// Create an InitializationTimeout error
    #[inline]
    pub fn timeout(key: ServiceKey, timeout: Duration) -> Self {
        Self::InitializationTimeout {
            type_name: key.name(),
            timeout,
        }
    }

    /// Create an InitializationFailed error
    #[inline]
    pub fn init_failed(key: ServiceKey, reason: impl Into<String>) -> Self {
        Self::InitializationFailed {
            type_name: key.name(),
            reason: reason.into(),
        }
    }

    /// Create a CircularConstructor error
    #[inline]
    pub fn circular(key: ServiceKey) -> Self {
        Self::CircularConstructor {
            type_name: key.name(),
        }
    }

    /// True for errors that abort a whole run rather than one service
    #[inline]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. } | Self::RunCancelled | Self::Internal(_)
        )
    }
}

fn format_keys(keys: &[ServiceKey]) -> String {
    keys.iter()
        .map(|k| k.name())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Clone for IgnitionError {
    fn clone(&self) -> Self {
        match self {
            Self::CycleDetected { remaining } => Self::CycleDetected {
                remaining: remaining.clone(),
            },
            Self::InitializationTimeout { type_name, timeout } => Self::InitializationTimeout {
                type_name,
                timeout: *timeout,
            },
            Self::InitializationFailed { type_name, reason } => Self::InitializationFailed {
                type_name,
                reason: reason.clone(),
            },
            Self::CircularConstructor { type_name } => Self::CircularConstructor { type_name },
            Self::DepthLimitExceeded { type_name, limit } => Self::DepthLimitExceeded {
                type_name,
                limit: *limit,
            },
            Self::NotRegistered { type_name } => Self::NotRegistered { type_name },
            Self::RunCancelled => Self::RunCancelled,
            Self::Internal(s) => Self::Internal(s.clone()),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, IgnitionError>;
