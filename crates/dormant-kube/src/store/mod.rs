//! Object store access for the hibernation protocol
//!
//! The protocol never talks to the API server directly; it goes through the
//! [`ObjectStore`] trait:
//! - **KubeStore**: the real thing, backed by a `kube::Client`
//! - **MockObjectStore**: in-memory, for tests without a Kubernetes cluster
//!
//! Implementations translate "not found" and "already exists" into return
//! values, so callers only see errors that mean something went wrong.

mod api;
mod mock;

pub use api::KubeStore;
pub use mock::{MockObjectStore, OperationCounts};

use async_trait::async_trait;
use std::collections::BTreeMap;

use dormant_core::{Cluster, ClusterRef, ControlSnapshot, StorageClaim};

use crate::error::Result;
use crate::resources::{ObjectRef, RenderedObject, ResourceKind};

/// A compute instance of a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    /// Whether the instance reports ready
    pub ready: bool,
}

/// Object store trait for cluster, claim and dependent objects
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get a cluster, `None` if it does not exist
    async fn get_cluster(&self, id: &ClusterRef) -> Result<Option<Cluster>>;

    /// Names of every cluster in a namespace
    async fn list_clusters(&self, namespace: &str) -> Result<Vec<String>>;

    /// Create a cluster and return the stored object
    ///
    /// If the cluster already exists, the existing object is returned.
    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster>;

    /// Merge `annotations` into the cluster's annotations
    ///
    /// A `None` value removes the key.
    async fn patch_cluster_annotations(
        &self,
        id: &ClusterRef,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    /// Storage claims labelled with the cluster
    async fn list_claims(&self, id: &ClusterRef) -> Result<Vec<StorageClaim>>;

    /// Merge `annotations` into a claim's annotations and release the claim
    ///
    /// Releasing drops the claim's owner references in the same write, so
    /// deleting the cluster no longer garbage collects it.
    async fn annotate_claim(
        &self,
        namespace: &str,
        claim: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Compute instances of the cluster
    async fn list_instances(&self, id: &ClusterRef) -> Result<Vec<Instance>>;

    /// Names of the objects of `kind` matching a label selector
    async fn list_names(
        &self,
        namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<String>>;

    /// Whether an object exists
    async fn exists(&self, namespace: &str, object: &ObjectRef) -> Result<bool>;

    /// Issue the deletion of an object
    ///
    /// Returns `false` if the object was already gone.
    async fn delete(&self, namespace: &str, object: &ObjectRef) -> Result<bool>;

    /// Create a rendered object
    ///
    /// Returns `false` if it already existed.
    async fn create(&self, namespace: &str, object: &RenderedObject) -> Result<bool>;

    /// Raw control data of the database engine of one instance
    async fn control_data(&self, namespace: &str, instance: &str) -> Result<ControlSnapshot>;
}
