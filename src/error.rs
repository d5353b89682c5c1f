//! Error types for the CloudStack provider
//!
//! Lower layers wrap failures with the operation that produced them and
//! return them unchanged. Only the engine's error policy decides whether an
//! error means "requeue now", "back off" or "surface on status".

use thiserror::Error;

/// Classification of a failed CloudStack API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// The addressed resource does not exist ("no match found")
    NotFound,
    /// A create raced with another writer or was already performed
    AlreadyExists,
    /// Network failure, timeout or rate limiting
    Transient,
    /// The provider rejected the request
    Rejected,
}

impl CloudErrorKind {
    /// Classify a provider error message
    ///
    /// CloudStack reports most failures as free text, so classification is
    /// substring based and case-insensitive.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("no match")
            || lower.contains("not found")
            || lower.contains("does not exist")
            || lower.contains("unable to find")
        {
            Self::NotFound
        } else if lower.contains("already exists") {
            Self::AlreadyExists
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("temporarily")
        {
            Self::Transient
        } else {
            Self::Rejected
        }
    }
}

impl std::fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Transient => "transient",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Main error type for provider operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object addressed in the resource store does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// Optimistic-concurrency patch hit a stale resourceVersion
    #[error("conflict patching {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Name of the object
        name: String,
        /// Message returned by the store
        message: String,
    },

    /// CloudStack API call failed
    #[error("cloudstack {operation} failed ({kind}): {message}")]
    Cloud {
        /// Operation that failed (e.g. "createNetwork")
        operation: String,
        /// Classified failure kind
        kind: CloudErrorKind,
        /// Message returned by the provider
        message: String,
    },

    /// A relationship the reconciler depends on is broken
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Version conversion failed
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Reconcile exceeded its deadline
    #[error("reconcile of {0} timed out")]
    Timeout(String),

    /// Internal error with context
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
        /// Where the error happened
        context: String,
    },
}

impl Error {
    /// Create a store not-found error
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a cloud error, classifying the provider message
    pub fn cloud(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Cloud {
            operation: operation.into(),
            kind: CloudErrorKind::classify(&message),
            message,
        }
    }

    /// Create a cloud error with an explicit kind
    pub fn cloud_kind(
        operation: impl Into<String>,
        kind: CloudErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Cloud {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create an invariant error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a conversion error with the given message
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if the addressed object is absent, in the store or in the cloud
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Cloud { kind, .. } => *kind == CloudErrorKind::NotFound,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// True if a create found the object already present
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Cloud { kind, .. } => *kind == CloudErrorKind::AlreadyExists,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// True if an optimistic patch lost a race
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409 && ae.reason == "Conflict",
            _ => false,
        }
    }

    /// True if the error should be written to the subject's status
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Validation(_))
    }

    /// True if retrying the same request could succeed without user action
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => {
                !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
            }
            Self::Kube(_) => true,
            Self::Cloud { kind, .. } => *kind != CloudErrorKind::Rejected,
            Self::Conflict { .. } | Self::Timeout(_) | Self::NotFound { .. } => true,
            Self::Internal { .. } => true,
            Self::Invariant(_)
            | Self::Validation(_)
            | Self::Serialization(_)
            | Self::Conversion(_) => false,
        }
    }

    /// Prefix the message with the operation that was in progress
    ///
    /// Classification is preserved for cloud errors so callers further up
    /// can still detect not-found and already-exists.
    pub fn with_context(self, context: &str) -> Self {
        match self {
            Self::Cloud {
                operation,
                kind,
                message,
            } => Self::Cloud {
                operation,
                kind,
                message: format!("{context}: {message}"),
            },
            Self::Invariant(msg) => Self::Invariant(format!("{context}: {msg}")),
            Self::Validation(msg) => Self::Validation(format!("{context}: {msg}")),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Classifying CloudStack Failures
    // ==========================================================================
    //
    // CloudStack returns free-text errors. The lifecycle manager relies on the
    // classification to treat "no match" as already-deleted during teardown
    // and "already exists" as a lost create race.

    /// Story: Teardown of an already-deleted network reports "no match found"
    #[test]
    fn story_no_match_is_classified_as_not_found() {
        let err = Error::cloud("deleteNetwork", "No match found for 7f3a: Network");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());

        let err = Error::cloud("listTags", "entity does not exist");
        assert!(err.is_not_found());
    }

    /// Story: Two reconciles race to tag the same network
    #[test]
    fn story_duplicate_tag_is_classified_as_already_exists() {
        let err = Error::cloud("createTags", "tag CAPC_cluster_abc already exists on network");
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
    }

    /// Story: Provider throttling is retried, a rejected request is not
    #[test]
    fn story_transient_and_rejected_failures() {
        let throttled = Error::cloud("associateIpAddress", "Rate limit exceeded");
        assert!(matches!(
            throttled,
            Error::Cloud {
                kind: CloudErrorKind::Transient,
                ..
            }
        ));
        assert!(throttled.is_retryable());

        let rejected = Error::cloud("deployVirtualMachine", "insufficient capacity in pod");
        assert!(!rejected.is_retryable());
    }

    /// Story: Context is prepended without losing classification
    #[test]
    fn story_context_preserves_classification() {
        let err = Error::cloud("deleteNetwork", "no match found")
            .with_context("disposing isolated network net-1");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("disposing isolated network net-1"));
        assert!(err.to_string().contains("deleteNetwork"));
    }

    // ==========================================================================
    // Story Tests: Store Errors
    // ==========================================================================

    /// Story: A stale resourceVersion surfaces as a conflict
    #[test]
    fn story_stale_patch_is_conflict_not_failure() {
        let err = Error::from(api_error(409, "Conflict"));
        assert!(err.is_conflict());
        assert!(!err.is_already_exists());
        assert!(err.is_retryable());

        let err = Error::conflict("CloudStackIsolatedNetwork", "net", "object was modified");
        assert!(err.is_conflict());
    }

    /// Story: Missing owner is an invariant that must be surfaced
    #[test]
    fn story_invariant_is_not_retryable_silently() {
        let err = Error::invariant("CloudStackMachine m-1 has no owner Machine");
        assert!(err.is_invariant());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("has no owner Machine"));
    }

    #[test]
    fn kube_404_is_not_found() {
        let err = Error::from(api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn kube_client_errors_other_than_conflict_and_throttling_are_final() {
        assert!(Error::from(api_error(409, "Conflict")).is_retryable());
        assert!(Error::from(api_error(429, "TooManyRequests")).is_retryable());
        assert!(!Error::from(api_error(403, "Forbidden")).is_retryable());
        assert!(Error::from(api_error(503, "ServiceUnavailable")).is_retryable());
    }
}
