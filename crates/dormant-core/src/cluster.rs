//! The database `Cluster` custom resource
//!
//! Only the fields the hibernation protocol reads are typed. Everything else in
//! `spec` and `status` lands in the flattened `extra` maps, so a cluster read
//! from the API server serializes back without losing fields this crate does
//! not know about.

use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::annotations::{FENCED_INSTANCES_ANNOTATION, RESUMING_ANNOTATION};
use crate::claim::ClaimRole;

/// Label carried by every object that belongs to a cluster
pub const CLUSTER_LABEL: &str = "cnpg.io/cluster";

/// Phase reported by the operator once every instance is up
pub const HEALTHY_PHASE: &str = "Cluster in healthy state";

/// Value of the fencing annotation that fences every instance
pub const FENCE_ALL: &str = "*";

/// Declarative part of a database cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    namespaced,
    status = "ClusterStatus",
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of instances (primary + replicas)
    #[serde(default = "default_instances")]
    pub instances: u32,

    /// Data volume configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfiguration>,

    /// Dedicated WAL volume configuration; requests a WAL claim per instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_storage: Option<StorageConfiguration>,

    /// Every other spec field, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_instances() -> u32 {
    1
}

impl ClusterSpec {
    /// A spec with `instances` instances and a data volume of `size`
    pub fn new(instances: u32, size: impl Into<String>) -> Self {
        Self {
            instances,
            storage: Some(StorageConfiguration::sized(size)),
            wal_storage: None,
            extra: BTreeMap::new(),
        }
    }

    /// Add a dedicated WAL volume
    pub fn with_wal_storage(mut self, size: impl Into<String>) -> Self {
        self.wal_storage = Some(StorageConfiguration::sized(size));
        self
    }

    /// Storage roles every instance of this cluster requests
    pub fn requested_roles(&self) -> Vec<ClaimRole> {
        let mut roles = vec![ClaimRole::PgData];
        if self.wal_storage.is_some() {
            roles.push(ClaimRole::PgWal);
        }
        roles
    }
}

/// Volume configuration for one storage role
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl StorageConfiguration {
    pub fn sized(size: impl Into<String>) -> Self {
        Self {
            size: Some(size.into()),
            ..Default::default()
        }
    }
}

/// Observed part of a database cluster
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_instances: Option<u32>,

    /// Name of the instance currently elected primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Cluster {
    /// Namespace/name identity of this cluster
    pub fn identity(&self) -> ClusterRef {
        ClusterRef::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Elected primary, if the operator has reported one
    pub fn current_primary(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.current_primary.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// Ready means a primary is elected and every requested instance is serving
    pub fn is_ready(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        self.current_primary().is_some()
            && status.ready_instances.unwrap_or(0) >= self.spec.instances
            && status.phase.as_deref() == Some(HEALTHY_PHASE)
    }

    /// Whether the fencing annotation stops at least one instance
    pub fn is_fenced(&self) -> bool {
        self.annotations()
            .get(FENCED_INSTANCES_ANNOTATION)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .is_some_and(|fenced| !fenced.is_empty())
    }

    /// Recreated by hibernate off and not yet confirmed ready
    pub fn is_resuming(&self) -> bool {
        self.annotations().contains_key(RESUMING_ANNOTATION)
    }
}

/// Identity of one cluster: the unit every hibernation operation targets
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
}

impl ClusterRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Label selector matching every object owned by this cluster
    pub fn label_selector(&self) -> String {
        format!("{}={}", CLUSTER_LABEL, self.name)
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy(mut cluster: Cluster, ready: u32) -> Cluster {
        cluster.status = Some(ClusterStatus {
            instances: Some(cluster.spec.instances),
            ready_instances: Some(ready),
            current_primary: Some("c1-1".to_string()),
            phase: Some(HEALTHY_PHASE.to_string()),
            extra: BTreeMap::new(),
        });
        cluster
    }

    #[test]
    fn test_requested_roles() {
        let spec = ClusterSpec::new(3, "1Gi");
        assert_eq!(spec.requested_roles(), vec![ClaimRole::PgData]);

        let spec = spec.with_wal_storage("1Gi");
        assert_eq!(
            spec.requested_roles(),
            vec![ClaimRole::PgData, ClaimRole::PgWal]
        );
    }

    #[test]
    fn test_readiness() {
        let cluster = Cluster::new("c1", ClusterSpec::new(3, "1Gi"));
        assert!(!cluster.is_ready());

        assert!(!healthy(cluster.clone(), 2).is_ready());
        assert!(healthy(cluster.clone(), 3).is_ready());

        let mut no_primary = healthy(cluster, 3);
        no_primary.status.as_mut().unwrap().current_primary = Some(String::new());
        assert!(!no_primary.is_ready());
    }

    #[test]
    fn test_fenced_annotation() {
        let mut cluster = Cluster::new("c1", ClusterSpec::new(1, "1Gi"));
        assert!(!cluster.is_fenced());

        cluster
            .annotations_mut()
            .insert(FENCED_INSTANCES_ANNOTATION.to_string(), "[\"*\"]".to_string());
        assert!(cluster.is_fenced());

        cluster
            .annotations_mut()
            .insert(FENCED_INSTANCES_ANNOTATION.to_string(), "[]".to_string());
        assert!(!cluster.is_fenced());
    }

    #[test]
    fn test_resuming_marker() {
        let mut cluster = Cluster::new("c1", ClusterSpec::new(1, "1Gi"));
        assert!(!cluster.is_resuming());

        cluster
            .annotations_mut()
            .insert(RESUMING_ANNOTATION.to_string(), "c1-1".to_string());
        assert!(cluster.is_resuming());
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let json = r#"{
            "apiVersion": "postgresql.cnpg.io/v1",
            "kind": "Cluster",
            "metadata": {"name": "c1", "namespace": "ns1"},
            "spec": {
                "instances": 3,
                "imageName": "ghcr.io/cloudnative-pg/postgresql:16",
                "storage": {"size": "1Gi", "pvcTemplate": {"volumeMode": "Filesystem"}},
                "bootstrap": {"initdb": {"database": "app", "owner": "app"}}
            },
            "status": {"currentPrimary": "c1-1", "timelineID": 1}
        }"#;

        let cluster: Cluster = serde_json::from_str(json).unwrap();
        assert_eq!(cluster.spec.instances, 3);
        assert!(cluster.spec.extra.contains_key("imageName"));
        assert!(cluster.spec.extra.contains_key("bootstrap"));
        assert_eq!(cluster.current_primary(), Some("c1-1"));

        let back = serde_json::to_value(&cluster).unwrap();
        assert_eq!(back["spec"]["storage"]["pvcTemplate"]["volumeMode"], "Filesystem");
        assert_eq!(back["status"]["timelineID"], 1);
    }

    #[test]
    fn test_cluster_ref() {
        let id = ClusterRef::new("ns1", "c1");
        assert_eq!(id.to_string(), "ns1/c1");
        assert_eq!(id.label_selector(), "cnpg.io/cluster=c1");
    }
}
