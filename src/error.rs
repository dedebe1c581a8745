//! Error types for the tether mutation engine

use std::time::Duration;

use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested object (workload, service, or port) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A selection matched more than one candidate
    #[error("ambiguous match: {0}")]
    AmbiguousMatch(String),

    /// The workload already carries a traffic-agent container
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// No container port on the workload satisfies the service selection
    #[error("no acceptable workload: {0}")]
    NoAcceptableWorkload(String),

    /// Applying the install plan failed; no annotation was written
    #[error("failed to establish intercept: {0}")]
    FailedToEstablish(String),

    /// Undoing a persisted plan failed; the annotation is left in place
    /// unless the object was fully restored
    #[error("failed to remove agent: {0}")]
    FailedToRemove(String),

    /// A persisted plan was written by an engine this build does not
    /// understand
    #[error("version skew: {0}")]
    VersionSkew(String),

    /// The workload did not report a ready rollout before the deadline
    #[error("workload {workload} did not become ready within {timeout:?}")]
    RolloutTimeout {
        /// Name of the workload that was being waited on
        workload: String,
        /// The deadline that expired
        timeout: Duration,
    },

    /// A Kubernetes API call exceeded its deadline
    #[error("{operation} timed out after {timeout:?}")]
    ApiTimeout {
        /// The call that was in flight
        operation: String,
        /// The deadline that expired
        timeout: Duration,
    },

    /// The operation was cancelled through its cancellation token
    #[error("operation interrupted")]
    Interrupted,

    /// A persisted plan could not be parsed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Kubernetes API error, surfaced verbatim
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an ambiguous-match error with the given message
    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::AmbiguousMatch(msg.into())
    }

    /// Create an already-exists error with the given message
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a no-acceptable-workload error with the given message
    pub fn no_acceptable(msg: impl Into<String>) -> Self {
        Self::NoAcceptableWorkload(msg.into())
    }

    /// Create a failed-to-establish error with the given message
    pub fn establish(msg: impl Into<String>) -> Self {
        Self::FailedToEstablish(msg.into())
    }

    /// Create a failed-to-remove error with the given message
    pub fn remove(msg: impl Into<String>) -> Self {
        Self::FailedToRemove(msg.into())
    }

    /// Create a version-skew error with the given message
    pub fn version_skew(msg: impl Into<String>) -> Self {
        Self::VersionSkew(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// The stable wire code for this error kind.
    ///
    /// These strings are part of the RPC contract with the connector; the
    /// mapping must not change across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AmbiguousMatch(_) => "AMBIGUOUS_MATCH",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::NoAcceptableWorkload(_) => "NO_ACCEPTABLE_DEPLOYMENT",
            Self::FailedToEstablish(_) => "FAILED_TO_ESTABLISH",
            Self::FailedToRemove(_) => "FAILED_TO_REMOVE",
            Self::VersionSkew(_) => "VERSION_SKEW",
            Self::RolloutTimeout { .. } => "ROLLOUT_TIMEOUT",
            Self::ApiTimeout { .. } => "DEADLINE_EXCEEDED",
            Self::Interrupted => "INTERRUPTED",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Kube(_) => "TRANSPORT",
        }
    }

    /// Whether this error is a resource-version conflict on write.
    ///
    /// Conflicts are the optimistic-concurrency signal: the driver re-reads
    /// and re-plans instead of surfacing them.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Whether this error is a 404 from the Kubernetes API.
    pub fn is_api_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}
