//! Error types for dormant-kube

use std::time::Duration;
use thiserror::Error;

use dormant_core::ClaimRole;

/// Result type for dormant-kube operations
pub type Result<T> = std::result::Result<T, HibernateError>;

/// Errors that can occur while hibernating, resuming or inspecting a cluster
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HibernateError {
    /// The object store is temporarily unavailable
    #[error("object store unavailable during {operation}: {message}")]
    TransientStore { operation: String, message: String },

    /// Dependent objects still exist after the teardown deadline
    #[error(
        "teardown of cluster '{cluster}' incomplete after {waited:?}, still present: {}\nHint: rerun `dormant hibernate on {cluster}` once the objects are gone",
        .remaining.join(", ")
    )]
    TeardownIncomplete {
        cluster: String,
        waited: Duration,
        remaining: Vec<String>,
    },

    /// The live cluster could not be turned into a manifest
    #[error("cannot serialize cluster '{cluster}': {message}")]
    Serialization { cluster: String, message: String },

    /// A stored manifest does not decode into a cluster
    #[error("hibernation manifest on claim '{claim}' is corrupt: {reason}")]
    ManifestCorrupt { claim: String, reason: String },

    /// Nothing to resume or report on
    #[error("no hibernated cluster '{cluster}': {reason}")]
    NoHibernatedCluster { cluster: String, reason: String },

    /// The recreated cluster never became ready
    #[error(
        "cluster '{cluster}' not ready after {waited:?}: {detail}\nHint: the recreated objects were kept, inspect them or rerun `dormant hibernate off {cluster}`"
    )]
    ReadinessTimeout {
        cluster: String,
        waited: Duration,
        detail: String,
    },

    /// Hibernate on needs a live cluster
    #[error("cluster '{cluster}' not found")]
    ClusterNotFound { cluster: String },

    /// The cluster has no elected primary to preserve
    #[error("cluster '{cluster}' has no elected primary")]
    NoPrimary { cluster: String },

    /// The primary is missing a claim for one of its requested roles
    #[error("primary instance '{instance}' has no storage claim for role(s): {}", format_roles(.roles))]
    MissingStorageClaims {
        instance: String,
        roles: Vec<ClaimRole>,
    },

    /// The observed objects match no hibernation state the operation can act on
    #[error("cluster '{cluster}' is in an inconsistent state: {reason}")]
    InconsistentState { cluster: String, reason: String },

    /// An annotation write did not read back identically
    #[error("annotation '{annotation}' on claim '{claim}' was not persisted")]
    AnnotationNotPersisted { claim: String, annotation: String },

    /// A preserved claim would be garbage collected with the cluster
    #[error(
        "claim '{claim}' is still owned by '{owner}' and would be deleted with it\nHint: remove its ownerReferences and rerun `dormant hibernate on`"
    )]
    ClaimStillOwned { claim: String, owner: String },

    /// Instances kept running after the cluster was fenced
    #[error(
        "instances of cluster '{cluster}' still running {waited:?} after fencing: {}",
        .running.join(", ")
    )]
    FenceTimeout {
        cluster: String,
        waited: Duration,
        running: Vec<String>,
    },

    /// The control snapshot could not be captured
    #[error("cannot capture control data from instance '{instance}': {message}")]
    ControlData { instance: String, message: String },

    /// Invalid configuration file
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

fn format_roles(roles: &[ClaimRole]) -> String {
    roles
        .iter()
        .map(ClaimRole::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl HibernateError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, HibernateError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Check if this is an "already exists" error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, HibernateError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            HibernateError::TransientStore { .. } => true,
            HibernateError::Api(kube::Error::Api(resp)) => {
                resp.code == 429 || resp.code >= 500
            }
            HibernateError::Api(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            _ => false,
        }
    }

    /// Stable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            HibernateError::TransientStore { .. } => "transient_store",
            HibernateError::TeardownIncomplete { .. } => "teardown_incomplete",
            HibernateError::Serialization { .. } => "serialization",
            HibernateError::ManifestCorrupt { .. } => "manifest_corrupt",
            HibernateError::NoHibernatedCluster { .. } => "no_hibernated_cluster",
            HibernateError::ReadinessTimeout { .. } => "readiness_timeout",
            HibernateError::ClusterNotFound { .. } => "cluster_not_found",
            HibernateError::NoPrimary { .. } => "no_primary",
            HibernateError::MissingStorageClaims { .. } => "missing_storage_claims",
            HibernateError::InconsistentState { .. } => "inconsistent_state",
            HibernateError::AnnotationNotPersisted { .. } => "annotation_not_persisted",
            HibernateError::ClaimStillOwned { .. } => "claim_still_owned",
            HibernateError::FenceTimeout { .. } => "fence_timeout",
            HibernateError::ControlData { .. } => "control_data",
            HibernateError::InvalidConfig(_) => "invalid_config",
            HibernateError::Api(_) => "api",
        }
    }

    pub(crate) fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        HibernateError::TransientStore {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
