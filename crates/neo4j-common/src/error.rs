//! Error types for the Neo4j operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information such as the cluster name,
//! the member being queried, or the operation that ran out of retries.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Category of a failure talking to the database protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Credentials were rejected
    Auth,
    /// Transport-level failure (DNS, refused, reset)
    Connection,
    /// The request did not complete before its deadline
    Timeout,
    /// The server answered with a query error
    Query,
    /// The circuit breaker is open and the call was not attempted
    CircuitOpen,
}

impl ProtocolErrorKind {
    /// Short label used in log fields and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Query => "query",
            Self::CircuitOpen => "circuit-open",
        }
    }
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Structural validation error for a cluster spec
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.topology.primaries")
        field: Option<String>,
    },

    /// Optimistic-concurrency conflict: the resource changed since it was read
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// Resource that was being written
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// A bounded retry loop gave up
    #[error("{operation} gave up after {attempts} attempts: {message}")]
    RetryExhausted {
        /// Operation that was retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        message: String,
    },

    /// Failure talking to the database over its query protocol
    #[error("protocol error [{kind}] for {cluster}: {message}")]
    Protocol {
        /// Cluster being queried
        cluster: String,
        /// Failure category
        kind: ProtocolErrorKind,
        /// Description of what failed
        message: String,
        /// Address of the member that was queried, if a single member
        member: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "health-refresh")
        context: String,
    },
}

impl Error {
    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an optimistic-concurrency conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a retry-exhausted error
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: u32,
        msg: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            message: msg.into(),
        }
    }

    /// Create a protocol error for a cluster
    pub fn protocol(
        cluster: impl Into<String>,
        kind: ProtocolErrorKind,
        msg: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            cluster: cluster.into(),
            kind,
            message: msg.into(),
            member: None,
        }
    }

    /// Create a protocol error for a single member of a cluster
    pub fn protocol_for_member(
        cluster: impl Into<String>,
        member: impl Into<String>,
        kind: ProtocolErrorKind,
        msg: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            cluster: cluster.into(),
            kind,
            message: msg.into(),
            member: Some(member.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a spec fix).
    /// Conflicts and exhausted retry budgets are transient by definition.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is a conflict and worth another pass; other 4xx are not
                match source {
                    kube::Error::Api(ae) if ae.code == 409 => true,
                    kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::RetryExhausted { .. } => true,
            Error::Protocol { kind, .. } => *kind != ProtocolErrorKind::Auth,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Label used by the reconcile error counter
    pub fn error_type(&self) -> &'static str {
        if self.is_retryable() {
            "transient"
        } else {
            "permanent"
        }
    }
}
