//! Kubernetes-backed object store

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

use dormant_core::annotations::{INSTANCE_NAME_LABEL, PVC_ROLE_LABEL};
use dormant_core::{ClaimRole, Cluster, ClusterRef, ControlSnapshot, StorageClaim};

use super::{Instance, ObjectStore};
use crate::error::{HibernateError, Result};
use crate::resources::{ObjectRef, RenderedObject, ResourceKind};

/// Container running the database engine in every instance
const POSTGRES_CONTAINER: &str = "postgres";

/// Object store backed by the Kubernetes API
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store from the default kubeconfig or in-cluster config
    pub async fn new() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    /// Create with an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn delete_named<K>(api: Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn exists_named<K>(api: Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?.is_some())
}

async fn list_named<K>(api: Api<K>, selector: &str) -> Result<Vec<String>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let list = api.list(&ListParams::default().labels(selector)).await?;
    Ok(list.items.iter().map(|o| o.name_any()).collect())
}

async fn create_tolerant<K>(api: Api<K>, object: &K) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn annotation_patch(annotations: &BTreeMap<String, Option<String>>) -> Patch<serde_json::Value> {
    Patch::Merge(serde_json::json!({ "metadata": { "annotations": annotations } }))
}

/// Annotate a claim and drop its owner references
///
/// A null list in a merge patch removes the field.
fn claim_release_patch(annotations: &BTreeMap<String, String>) -> Patch<serde_json::Value> {
    Patch::Merge(serde_json::json!({
        "metadata": {
            "annotations": annotations,
            "ownerReferences": null,
        }
    }))
}

fn storage_claim(pvc: &PersistentVolumeClaim) -> StorageClaim {
    let labels = pvc.labels();
    StorageClaim {
        name: pvc.name_any(),
        uid: pvc.uid(),
        role: labels.get(PVC_ROLE_LABEL).map(|role| ClaimRole::from_label(role)),
        instance: labels.get(INSTANCE_NAME_LABEL).cloned(),
        owner: pvc
            .owner_references()
            .iter()
            .find(|owner| owner.controller == Some(true))
            .map(|owner| owner.name.clone()),
        annotations: pvc.annotations().clone(),
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_cluster(&self, id: &ClusterRef) -> Result<Option<Cluster>> {
        Ok(self.api::<Cluster>(&id.namespace).get_opt(&id.name).await?)
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<String>> {
        let list = self
            .api::<Cluster>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items.iter().map(|c| c.name_any()).collect())
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| HibernateError::Serialization {
                cluster: cluster.name_any(),
                message: "cluster has no namespace".to_string(),
            })?;
        let api = self.api::<Cluster>(&namespace);

        match api.create(&PostParams::default(), cluster).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!(namespace = %namespace, cluster = %cluster.name_any(), "Cluster already exists");
                Ok(api.get(&cluster.name_any()).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_cluster_annotations(
        &self,
        id: &ClusterRef,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.api::<Cluster>(&id.namespace)
            .patch(&id.name, &PatchParams::default(), &annotation_patch(annotations))
            .await?;
        Ok(())
    }

    async fn list_claims(&self, id: &ClusterRef) -> Result<Vec<StorageClaim>> {
        let list = self
            .api::<PersistentVolumeClaim>(&id.namespace)
            .list(&ListParams::default().labels(&id.label_selector()))
            .await?;
        Ok(list.items.iter().map(storage_claim).collect())
    }

    async fn annotate_claim(
        &self,
        namespace: &str,
        claim: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.api::<PersistentVolumeClaim>(namespace)
            .patch(claim, &PatchParams::default(), &claim_release_patch(annotations))
            .await?;
        Ok(())
    }

    async fn list_instances(&self, id: &ClusterRef) -> Result<Vec<Instance>> {
        let list = self
            .api::<Pod>(&id.namespace)
            .list(&ListParams::default().labels(&id.label_selector()))
            .await?;
        Ok(list
            .items
            .iter()
            .map(|pod| Instance {
                name: pod.name_any(),
                ready: is_pod_ready(pod),
            })
            .collect())
    }

    async fn list_names(
        &self,
        namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<String>> {
        match kind {
            ResourceKind::Cluster => list_named(self.api::<Cluster>(namespace), selector).await,
            ResourceKind::Instance => list_named(self.api::<Pod>(namespace), selector).await,
            ResourceKind::MonitoringConfig => {
                list_named(self.api::<ConfigMap>(namespace), selector).await
            }
            ResourceKind::Secret => list_named(self.api::<Secret>(namespace), selector).await,
            ResourceKind::Role => list_named(self.api::<Role>(namespace), selector).await,
            ResourceKind::RoleBinding => {
                list_named(self.api::<RoleBinding>(namespace), selector).await
            }
            ResourceKind::StorageClaim => {
                list_named(self.api::<PersistentVolumeClaim>(namespace), selector).await
            }
        }
    }

    async fn exists(&self, namespace: &str, object: &ObjectRef) -> Result<bool> {
        let name = object.name.as_str();
        match object.kind {
            ResourceKind::Cluster => exists_named(self.api::<Cluster>(namespace), name).await,
            ResourceKind::Instance => exists_named(self.api::<Pod>(namespace), name).await,
            ResourceKind::MonitoringConfig => {
                exists_named(self.api::<ConfigMap>(namespace), name).await
            }
            ResourceKind::Secret => exists_named(self.api::<Secret>(namespace), name).await,
            ResourceKind::Role => exists_named(self.api::<Role>(namespace), name).await,
            ResourceKind::RoleBinding => {
                exists_named(self.api::<RoleBinding>(namespace), name).await
            }
            ResourceKind::StorageClaim => {
                exists_named(self.api::<PersistentVolumeClaim>(namespace), name).await
            }
        }
    }

    async fn delete(&self, namespace: &str, object: &ObjectRef) -> Result<bool> {
        let name = object.name.as_str();
        match object.kind {
            ResourceKind::Cluster => delete_named(self.api::<Cluster>(namespace), name).await,
            ResourceKind::Instance => delete_named(self.api::<Pod>(namespace), name).await,
            ResourceKind::MonitoringConfig => {
                delete_named(self.api::<ConfigMap>(namespace), name).await
            }
            ResourceKind::Secret => delete_named(self.api::<Secret>(namespace), name).await,
            ResourceKind::Role => delete_named(self.api::<Role>(namespace), name).await,
            ResourceKind::RoleBinding => {
                delete_named(self.api::<RoleBinding>(namespace), name).await
            }
            ResourceKind::StorageClaim => {
                delete_named(self.api::<PersistentVolumeClaim>(namespace), name).await
            }
        }
    }

    async fn create(&self, namespace: &str, object: &RenderedObject) -> Result<bool> {
        match object {
            RenderedObject::Role(role) => create_tolerant(self.api::<Role>(namespace), role).await,
            RenderedObject::RoleBinding(binding) => {
                create_tolerant(self.api::<RoleBinding>(namespace), binding).await
            }
        }
    }

    async fn control_data(&self, namespace: &str, instance: &str) -> Result<ControlSnapshot> {
        // kube-rs exec needs the websocket feature; kubectl is already a
        // requirement of every environment this runs in
        let output = tokio::process::Command::new("kubectl")
            .args([
                "exec",
                "-n",
                namespace,
                instance,
                "-c",
                POSTGRES_CONTAINER,
                "--",
                "pg_controldata",
            ])
            .output()
            .await
            .map_err(|e| HibernateError::ControlData {
                instance: instance.to_string(),
                message: format!("failed to run kubectl: {}", e),
            })?;

        if !output.status.success() {
            return Err(HibernateError::ControlData {
                instance: instance.to_string(),
                message: format!(
                    "pg_controldata exited with code {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(ControlSnapshot::new(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}
