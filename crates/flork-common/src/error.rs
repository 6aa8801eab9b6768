//! Error types for the flork controller
//!
//! Errors carry the resource key or lease name they relate to so that log
//! lines are useful on their own. Cancellation has its own variant: callers
//! must propagate it instead of treating it like any other failure.

use thiserror::Error;

/// Main error type for flork operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Workload submission failed
    #[error("deployment of {key} failed: {source}")]
    Deploy {
        /// Resource key (`namespace/name`)
        key: String,
        /// Root error reported by the deployer
        #[source]
        source: DeployError,
    },

    /// The runtime's management endpoint failed
    #[error("runtime error for {key}: {message}")]
    Runtime {
        /// Resource key (`namespace/name`)
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Lease bookkeeping failed
    #[error("lease error [{lease}]: {message}")]
    Lease {
        /// Lease name
        lease: String,
        /// Description of what failed
        message: String,
    },

    /// A resource could not be found where it was expected
    #[error("resource {key} not found")]
    NotFound {
        /// Resource key (`namespace/name`)
        key: String,
    },

    /// Capability intentionally left unimplemented for a resource kind
    #[error("{operation} is not implemented for {kind}")]
    NotImplemented {
        /// Resource kind
        kind: String,
        /// Operation that was requested
        operation: String,
    },

    /// The surrounding task tree was cancelled
    #[error("cancelled: {context}")]
    Cancelled {
        /// What was running when cancellation happened
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a runtime error
    pub fn runtime(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runtime {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a lease error
    pub fn lease(lease: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Lease {
            lease: lease.into(),
            message: msg.into(),
        }
    }

    /// Create a not-implemented error
    pub fn not_implemented(kind: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            kind: kind.into(),
            operation: operation.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create an internal error
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error stems from cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether this is a Kubernetes API error with the given HTTP status code
    pub fn is_api_code(&self, code: u16) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(e) } if e.code == code)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Failure reported by the workload deployer.
///
/// Deployers wrap the error that actually caused the failure, so callers
/// inspect [`DeployError::root_cause`] instead of the outermost variant.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeployError {
    /// Resources of a previous deployment are still present
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    /// The runtime rejected its configuration
    #[error("illegal configuration: {0}")]
    IllegalConfiguration(String),

    /// Any other failure, optionally wrapping its cause
    #[error("{message}")]
    Failed {
        /// Description of what failed
        message: String,
        /// Underlying cause
        #[source]
        cause: Option<Box<DeployError>>,
    },
}

impl DeployError {
    /// Wrap `cause` in a generic failure
    pub fn wrapping(message: impl Into<String>, cause: DeployError) -> Self {
        Self::Failed {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Innermost cause of this error
    pub fn root_cause(&self) -> &DeployError {
        let mut current = self;
        while let Self::Failed {
            cause: Some(inner), ..
        } = current
        {
            current = inner;
        }
        current
    }

    /// Leftovers of an earlier deployment collide with this one
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            Self::Failed { message, .. } => message.contains("already exists"),
            Self::IllegalConfiguration(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_walks_nested_failures() {
        let err = DeployError::wrapping(
            "could not deploy",
            DeployError::wrapping(
                "descriptor failed",
                DeployError::IllegalConfiguration("security.ssl.rest.keystore".into()),
            ),
        );
        assert_eq!(
            err.root_cause(),
            &DeployError::IllegalConfiguration("security.ssl.rest.keystore".into())
        );
    }

    #[test]
    fn root_cause_of_leaf_is_itself() {
        let err = DeployError::AlreadyExists("deployment foo".into());
        assert_eq!(err.root_cause(), &err);
    }

    #[test]
    fn already_exists_is_detected_from_message() {
        let err = DeployError::Failed {
            message: "deployments.apps \"foo\" already exists".into(),
            cause: None,
        };
        assert!(err.is_already_exists());
        assert!(!DeployError::IllegalConfiguration("x".into()).is_already_exists());
    }

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(Error::cancelled("loop").is_cancelled());
        assert!(!Error::internal("loop", "boom").is_cancelled());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::not_implemented("FlinkSession", "submit");
        assert_eq!(err.to_string(), "submit is not implemented for FlinkSession");

        let err = Error::lease("flork-lease-ns-foo", "missing resourceVersion");
        assert!(err.to_string().contains("flork-lease-ns-foo"));
    }
}
