//! The objects a cluster owns
//!
//! Every object the sweep touches is addressed as an [`ObjectRef`]: a
//! [`ResourceKind`] plus a name inside the cluster's namespace. The kinds form
//! a closed set; each one knows how to find its objects for a given cluster
//! and whether resume renders it or leaves it to the operator.

use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use dormant_core::Cluster;
use dormant_core::cluster::CLUSTER_LABEL;

/// Monitoring queries shared by every cluster in a namespace
pub const DEFAULT_MONITORING_CONFIGMAP: &str = "cnpg-default-monitoring";

/// Secrets generated for every cluster, as name suffixes
const SECRET_SUFFIXES: [&str; 5] = ["app", "superuser", "ca", "replication", "server"];

/// Kind of object owned by a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Cluster,
    Instance,
    MonitoringConfig,
    Secret,
    Role,
    RoleBinding,
    StorageClaim,
}

/// How resume brings an object back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePolicy {
    /// Rendered from the cluster and created by resume
    Render,
    /// Regenerated by the operator once the cluster exists
    Reconciled,
}

impl ResourceKind {
    /// Non-volume objects owned by a cluster, in teardown order
    pub const DEPENDENTS: [ResourceKind; 5] = [
        ResourceKind::Instance,
        ResourceKind::MonitoringConfig,
        ResourceKind::Secret,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
    ];

    /// Platform kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "Cluster",
            ResourceKind::Instance => "Pod",
            ResourceKind::MonitoringConfig => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::StorageClaim => "PersistentVolumeClaim",
        }
    }

    /// Names the operator always gives this kind for `cluster`
    pub fn conventional_names(&self, cluster: &str) -> Vec<String> {
        match self {
            ResourceKind::Cluster | ResourceKind::Role | ResourceKind::RoleBinding => {
                vec![cluster.to_string()]
            }
            ResourceKind::MonitoringConfig => vec![DEFAULT_MONITORING_CONFIGMAP.to_string()],
            ResourceKind::Secret => SECRET_SUFFIXES
                .iter()
                .map(|suffix| format!("{}-{}", cluster, suffix))
                .collect(),
            ResourceKind::Instance | ResourceKind::StorageClaim => Vec::new(),
        }
    }

    /// Whether objects of this kind are also found by the cluster label
    pub fn is_labelled(&self) -> bool {
        matches!(
            self,
            ResourceKind::Instance | ResourceKind::Secret | ResourceKind::StorageClaim
        )
    }

    /// Whether one object of this kind serves every cluster in the namespace
    pub fn is_shared(&self) -> bool {
        matches!(self, ResourceKind::MonitoringConfig)
    }

    pub fn restore_policy(&self) -> RestorePolicy {
        match self {
            ResourceKind::Cluster | ResourceKind::Role | ResourceKind::RoleBinding => {
                RestorePolicy::Render
            }
            _ => RestorePolicy::Reconciled,
        }
    }

    pub fn named(self, name: impl Into<String>) -> ObjectRef {
        ObjectRef {
            kind: self,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object in the cluster's namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// An object resume creates itself
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedObject {
    Role(Role),
    RoleBinding(RoleBinding),
}

impl RenderedObject {
    pub fn object_ref(&self) -> ObjectRef {
        match self {
            RenderedObject::Role(role) => ResourceKind::Role.named(role.name_any()),
            RenderedObject::RoleBinding(binding) => {
                ResourceKind::RoleBinding.named(binding.name_any())
            }
        }
    }
}

/// Render the objects of `kind` that resume creates for `cluster`
///
/// `cluster` must be the object returned by the API server, so that the owner
/// reference carries its uid.
pub fn render(kind: ResourceKind, cluster: &Cluster) -> Vec<RenderedObject> {
    match kind {
        ResourceKind::Role => vec![RenderedObject::Role(render_role(cluster))],
        ResourceKind::RoleBinding => vec![RenderedObject::RoleBinding(render_role_binding(cluster))],
        _ => Vec::new(),
    }
}

fn owned_metadata(cluster: &Cluster) -> ObjectMeta {
    let name = cluster.name_any();
    let mut labels = BTreeMap::new();
    labels.insert(CLUSTER_LABEL.to_string(), name.clone());

    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(labels),
        owner_references: cluster.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

fn rule(group: &str, resources: &[&str], verbs: &[&str], names: &[String]) -> PolicyRule {
    let to_vec = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(to_vec(resources)),
        verbs: to_vec(verbs),
        resource_names: (!names.is_empty()).then(|| names.to_vec()),
        ..Default::default()
    }
}

/// Role used by the instance manager of every instance
fn render_role(cluster: &Cluster) -> Role {
    let name = cluster.name_any();
    let group = Cluster::group(&()).to_string();
    let secrets = ResourceKind::Secret.conventional_names(&name);
    let monitoring = ResourceKind::MonitoringConfig.conventional_names(&name);

    Role {
        metadata: owned_metadata(cluster),
        rules: Some(vec![
            rule("", &["configmaps"], &["get", "watch"], &monitoring),
            rule("", &["secrets"], &["get", "watch"], &secrets),
            rule("", &["events"], &["create", "patch"], &[]),
            rule(&group, &["clusters"], &["get", "list", "watch"], &[name.clone()]),
            rule(
                &group,
                &["clusters/status"],
                &["get", "patch", "update", "watch"],
                &[name],
            ),
            rule(&group, &["backups"], &["get", "list", "delete"], &[]),
            rule(&group, &["backups/status"], &["get", "patch", "update"], &[]),
        ]),
    }
}

/// Binding of the cluster's service account to its role
fn render_role_binding(cluster: &Cluster) -> RoleBinding {
    let name = cluster.name_any();

    RoleBinding {
        metadata: owned_metadata(cluster),
        role_ref: RoleRef {
            api_group: Role::group(&()).to_string(),
            kind: Role::kind(&()).to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: cluster.namespace(),
            ..Default::default()
        }]),
    }
}
