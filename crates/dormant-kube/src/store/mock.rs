//! Mock object store for testing
//!
//! This store keeps clusters, claims and dependent objects in memory, useful
//! for exercising the hibernation protocol without a Kubernetes cluster. It
//! can stand in for the operator too: with reconcile enabled, creating a
//! cluster brings up its instances and fencing it stops them.
//!
//! Claims are owned by their cluster like the operator's are. Deleting a
//! cluster garbage collects the claims it still owns: at once when no
//! instance uses them, otherwise once that instance is deleted.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::DateTime;
use kube::ResourceExt;
use kube::core::ErrorResponse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use dormant_core::annotations::FENCED_INSTANCES_ANNOTATION;
use dormant_core::cluster::{CLUSTER_LABEL, HEALTHY_PHASE};
use dormant_core::{
    ClaimRole, Cluster, ClusterRef, ClusterSpec, ClusterStatus, ControlSnapshot, StorageClaim,
};

use super::{Instance, ObjectStore};
use crate::error::{HibernateError, Result};
use crate::resources::{ObjectRef, RenderedObject, ResourceKind};

/// Control data returned unless a test sets its own
const DEFAULT_CONTROL_DATA: &str = "pg_control version number:            1300\n\
Catalog version number:               202307071\n\
Database cluster state:               shut down\n\
Latest checkpoint location:           0/3000028\n";

/// In-memory object store for testing
#[derive(Clone)]
pub struct MockObjectStore {
    state: Arc<RwLock<MockState>>,
    /// Track operation counts for assertions
    operations: Arc<RwLock<OperationCounts>>,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub patches: usize,
    pub deletes: usize,
    pub execs: usize,
}

#[derive(Debug, Clone)]
struct MockClaim {
    cluster: String,
    claim: StorageClaim,
    /// Collected with its owner, waiting for its instance to go away
    deleting: bool,
}

#[derive(Debug, Clone)]
struct MockObject {
    /// Value of the cluster label, if any
    cluster: Option<String>,
    /// Readiness, meaningful for instances only
    ready: bool,
}

#[derive(Debug)]
struct MockState {
    clusters: HashMap<ClusterRef, Cluster>,
    /// (namespace, name) -> claim
    claims: BTreeMap<(String, String), MockClaim>,
    /// (namespace, object) -> object, for every kind but clusters and claims
    objects: BTreeMap<(String, ObjectRef), MockObject>,
    /// Objects that ignore deletion
    pinned: HashSet<(String, ObjectRef)>,
    /// Calls left to fail with a transient error
    failures_left: u32,
    reconcile: bool,
    /// Annotating a claim leaves its owner references in place
    keep_claim_owners: bool,
    control_data: String,
    next_uid: u64,
    /// Seconds added to creation timestamps, so each object is newer
    clock: i64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            clusters: HashMap::new(),
            claims: BTreeMap::new(),
            objects: BTreeMap::new(),
            pinned: HashSet::new(),
            failures_left: 0,
            reconcile: true,
            keep_claim_owners: false,
            control_data: DEFAULT_CONTROL_DATA.to_string(),
            next_uid: 0,
            clock: 0,
        }
    }
}

impl MockState {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("00000000-0000-0000-0000-{:012}", self.next_uid)
    }

    fn now(&mut self) -> Time {
        self.clock += 1;
        Time(DateTime::from_timestamp(1_700_000_000 + self.clock, 0).unwrap_or_default())
    }

    /// Give a new cluster its server-assigned identity
    fn admit(&mut self, cluster: &mut Cluster) {
        if cluster.metadata.uid.is_none() {
            cluster.metadata.uid = Some(self.uid());
        }
        if cluster.metadata.creation_timestamp.is_none() {
            cluster.metadata.creation_timestamp = Some(self.now());
        }
    }

    /// Create the claim, or adopt it if it survived a previous cluster
    fn add_claim(&mut self, namespace: &str, cluster: &str, instance: &str, role: &ClaimRole) {
        let name = role.claim_name(instance);
        let key = (namespace.to_string(), name.clone());
        if let Some(existing) = self.claims.get_mut(&key) {
            existing.claim.owner = Some(cluster.to_string());
            return;
        }
        let uid = self.uid();
        self.claims.insert(
            key,
            MockClaim {
                cluster: cluster.to_string(),
                claim: StorageClaim {
                    name,
                    uid: Some(uid),
                    role: Some(role.clone()),
                    instance: Some(instance.to_string()),
                    owner: Some(cluster.to_string()),
                    annotations: BTreeMap::new(),
                },
                deleting: false,
            },
        );
    }

    fn is_pinned(&self, namespace: &str, object: &ObjectRef) -> bool {
        self.pinned.contains(&(namespace.to_string(), object.clone()))
    }

    /// Garbage collect the claims a deleted cluster still owns
    fn collect_owned_claims(&mut self, namespace: &str, cluster: &str) {
        let owned: Vec<(String, Option<String>)> = self
            .claims
            .iter()
            .filter(|((ns, _), c)| ns == namespace && c.claim.owner.as_deref() == Some(cluster))
            .map(|((_, name), c)| (name.clone(), c.claim.instance.clone()))
            .collect();

        for (name, instance) in owned {
            if self.is_pinned(namespace, &ResourceKind::StorageClaim.named(&name)) {
                continue;
            }
            let in_use = instance.is_some_and(|instance| {
                self.objects.contains_key(&(
                    namespace.to_string(),
                    ResourceKind::Instance.named(instance),
                ))
            });
            let key = (namespace.to_string(), name);
            if in_use {
                if let Some(entry) = self.claims.get_mut(&key) {
                    entry.deleting = true;
                }
            } else {
                self.claims.remove(&key);
            }
        }
    }

    /// Release the collected claims an instance was holding on to
    fn release_instance_claims(&mut self, namespace: &str, instance: &str) {
        self.claims.retain(|(ns, _), c| {
            !(ns == namespace && c.deleting && c.claim.instance.as_deref() == Some(instance))
        });
    }

    fn add_object(&mut self, namespace: &str, object: ObjectRef, cluster: Option<&str>) {
        self.objects
            .entry((namespace.to_string(), object))
            .or_insert(MockObject {
                cluster: cluster.map(str::to_string),
                ready: true,
            });
    }

    /// Bring up everything the operator would create for a cluster
    fn reconcile_cluster(&mut self, id: &ClusterRef) {
        let Some(spec) = self.clusters.get(id).map(|c| c.spec.clone()) else {
            return;
        };
        let namespace = id.namespace.as_str();

        // The primary comes back on the data claim that survived
        let primary = self
            .claims
            .iter()
            .filter(|((ns, _), c)| ns == namespace && c.cluster == id.name)
            .filter(|(_, c)| c.claim.role == Some(ClaimRole::PgData))
            .max_by_key(|(_, c)| c.claim.is_hibernated())
            .map(|(_, c)| c.claim.instance.clone().unwrap_or_else(|| c.claim.name.clone()))
            .unwrap_or_else(|| format!("{}-1", id.name));

        let mut instances = vec![primary.clone()];
        let mut serial = 1;
        while instances.len() < spec.instances as usize {
            let name = format!("{}-{}", id.name, serial);
            if !instances.contains(&name) {
                instances.push(name);
            }
            serial += 1;
        }

        for instance in &instances {
            self.add_object(
                namespace,
                ResourceKind::Instance.named(instance),
                Some(id.name.as_str()),
            );
            for role in spec.requested_roles() {
                self.add_claim(namespace, &id.name, instance, &role);
            }
        }
        for name in ResourceKind::Secret.conventional_names(&id.name) {
            self.add_object(
                namespace,
                ResourceKind::Secret.named(name),
                Some(id.name.as_str()),
            );
        }
        for name in ResourceKind::MonitoringConfig.conventional_names(&id.name) {
            self.add_object(namespace, ResourceKind::MonitoringConfig.named(name), None);
        }

        if let Some(cluster) = self.clusters.get_mut(id) {
            cluster.status = Some(ClusterStatus {
                instances: Some(spec.instances),
                ready_instances: Some(spec.instances),
                current_primary: Some(primary),
                phase: Some(HEALTHY_PHASE.to_string()),
                ..Default::default()
            });
        }
    }

    /// Stop every instance of a fenced cluster
    fn reconcile_fencing(&mut self, id: &ClusterRef) {
        let fenced = self.clusters.get(id).is_some_and(Cluster::is_fenced);
        if !fenced {
            return;
        }
        for ((ns, object), entry) in self.objects.iter_mut() {
            if ns == &id.namespace
                && object.kind == ResourceKind::Instance
                && entry.cluster.as_deref() == Some(id.name.as_str())
            {
                entry.ready = false;
            }
        }
        if let Some(status) = self.clusters.get_mut(id).and_then(|c| c.status.as_mut()) {
            status.ready_instances = Some(0);
            status.phase = Some("Cluster is fenced".to_string());
        }
    }
}

fn not_found(object: &str) -> HibernateError {
    HibernateError::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} not found", object),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

/// Value of the cluster label in a `key=value` selector
fn selector_value(selector: &str) -> Option<&str> {
    selector
        .split_once('=')
        .filter(|(key, _)| *key == CLUSTER_LABEL)
        .map(|(_, value)| value)
}

impl MockObjectStore {
    /// Create a new empty mock store, with reconcile enabled
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            operations: Arc::new(RwLock::new(OperationCounts::default())),
        }
    }

    /// Seed a healthy cluster with every object the operator creates
    ///
    /// Instances are named `<cluster>-1..n`; the first one is the primary.
    pub fn deploy(&self, id: &ClusterRef, instances: u32, wal: bool) -> Cluster {
        let mut spec = ClusterSpec::new(instances, "1Gi");
        if wal {
            spec = spec.with_wal_storage("1Gi");
        }
        let mut cluster = Cluster::new(&id.name, spec);
        cluster.metadata.namespace = Some(id.namespace.clone());
        self.insert_cluster(cluster);

        let mut state = self.state.write().unwrap();
        state.reconcile_cluster(id);
        for kind in [ResourceKind::Role, ResourceKind::RoleBinding] {
            state.add_object(&id.namespace, kind.named(&id.name), Some(id.name.as_str()));
        }
        state.clusters[id].clone()
    }

    /// Insert a cluster object as-is, assigning a uid and creation time if missing
    pub fn insert_cluster(&self, mut cluster: Cluster) {
        let mut state = self.state.write().unwrap();
        state.admit(&mut cluster);
        state.clusters.insert(cluster.identity(), cluster);
    }

    /// Insert an object labelled with `cluster`
    pub fn insert_object(&self, namespace: &str, object: ObjectRef, cluster: Option<&str>) {
        let mut state = self.state.write().unwrap();
        if object.kind == ResourceKind::Cluster {
            return;
        }
        state.add_object(namespace, object, cluster);
    }

    /// Make deletions of `object` succeed without removing it
    pub fn pin(&self, namespace: &str, object: ObjectRef) {
        let mut state = self.state.write().unwrap();
        state.pinned.insert((namespace.to_string(), object));
    }

    pub fn unpin(&self, namespace: &str, object: &ObjectRef) {
        let mut state = self.state.write().unwrap();
        state.pinned.remove(&(namespace.to_string(), object.clone()));
    }

    /// Fail the next `count` calls with a transient error
    pub fn fail_next(&self, count: u32) {
        self.state.write().unwrap().failures_left = count;
    }

    /// Enable or disable the simulated operator
    pub fn set_reconcile(&self, reconcile: bool) {
        self.state.write().unwrap().reconcile = reconcile;
    }

    /// Leave owner references on annotated claims, as a server ignoring the
    /// release would
    pub fn keep_claim_owners(&self, keep: bool) {
        self.state.write().unwrap().keep_claim_owners = keep;
    }

    pub fn set_control_data(&self, raw: &str) {
        self.state.write().unwrap().control_data = raw.to_string();
    }

    /// Stop one instance, as a crash or fencing would
    pub fn set_instance_ready(&self, namespace: &str, instance: &str, ready: bool) {
        let mut state = self.state.write().unwrap();
        let key = (namespace.to_string(), ResourceKind::Instance.named(instance));
        if let Some(entry) = state.objects.get_mut(&key) {
            entry.ready = ready;
        }
    }

    pub fn cluster(&self, id: &ClusterRef) -> Option<Cluster> {
        self.state.read().unwrap().clusters.get(id).cloned()
    }

    /// Claims labelled with the cluster, sorted by name
    pub fn claims(&self, id: &ClusterRef) -> Vec<StorageClaim> {
        let state = self.state.read().unwrap();
        state
            .claims
            .iter()
            .filter(|((ns, _), c)| *ns == id.namespace && c.cluster == id.name)
            .map(|(_, c)| c.claim.clone())
            .collect()
    }

    /// Whether an object of any kind exists
    pub fn contains(&self, namespace: &str, object: &ObjectRef) -> bool {
        let state = self.state.read().unwrap();
        contains(&state, namespace, object)
    }

    /// Every non-cluster, non-claim object in a namespace
    pub fn objects(&self, namespace: &str) -> Vec<ObjectRef> {
        let state = self.state.read().unwrap();
        state
            .objects
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, object)| object.clone())
            .collect()
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap().clone()
    }

    /// Reset operation counts
    pub fn reset_counts(&self) {
        let mut ops = self.operations.write().unwrap();
        *ops = OperationCounts::default();
    }

    fn record(&self, update: impl FnOnce(&mut OperationCounts)) {
        let mut ops = self.operations.write().unwrap();
        update(&mut ops);
    }

    /// Consume one injected failure, if any
    fn check_available(&self, operation: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(HibernateError::transient(operation, "injected failure"));
        }
        Ok(())
    }
}

impl Default for MockObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

fn contains(state: &MockState, namespace: &str, object: &ObjectRef) -> bool {
    match object.kind {
        ResourceKind::Cluster => state
            .clusters
            .contains_key(&ClusterRef::new(namespace, &object.name)),
        ResourceKind::StorageClaim => state
            .claims
            .contains_key(&(namespace.to_string(), object.name.clone())),
        _ => state
            .objects
            .contains_key(&(namespace.to_string(), object.clone())),
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn get_cluster(&self, id: &ClusterRef) -> Result<Option<Cluster>> {
        self.record(|ops| ops.gets += 1);
        self.check_available("get cluster")?;
        Ok(self.cluster(id))
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<String>> {
        self.record(|ops| ops.lists += 1);
        self.check_available("list clusters")?;
        let state = self.state.read().unwrap();
        let mut names: Vec<String> = state
            .clusters
            .keys()
            .filter(|id| id.namespace == namespace)
            .map(|id| id.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        self.record(|ops| ops.creates += 1);
        self.check_available("create cluster")?;
        let id = cluster.identity();
        let mut state = self.state.write().unwrap();

        if let Some(existing) = state.clusters.get(&id) {
            return Ok(existing.clone());
        }

        let mut created = cluster.clone();
        created.metadata.uid = None;
        created.metadata.creation_timestamp = None;
        state.admit(&mut created);
        created.metadata.resource_version = Some("1".to_string());
        state.clusters.insert(id.clone(), created);
        if state.reconcile {
            state.reconcile_cluster(&id);
        }
        Ok(state.clusters[&id].clone())
    }

    async fn patch_cluster_annotations(
        &self,
        id: &ClusterRef,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.record(|ops| ops.patches += 1);
        self.check_available("patch cluster")?;
        let mut state = self.state.write().unwrap();
        let cluster = state
            .clusters
            .get_mut(id)
            .ok_or_else(|| not_found(&format!("Cluster/{}", id.name)))?;
        for (key, value) in annotations {
            match value {
                Some(value) => {
                    cluster.annotations_mut().insert(key.clone(), value.clone());
                }
                None => {
                    cluster.annotations_mut().remove(key);
                }
            }
        }

        if state.reconcile && annotations.contains_key(FENCED_INSTANCES_ANNOTATION) {
            state.reconcile_fencing(id);
        }
        Ok(())
    }

    async fn list_claims(&self, id: &ClusterRef) -> Result<Vec<StorageClaim>> {
        self.record(|ops| ops.lists += 1);
        self.check_available("list claims")?;
        Ok(self.claims(id))
    }

    async fn annotate_claim(
        &self,
        namespace: &str,
        claim: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record(|ops| ops.patches += 1);
        self.check_available("annotate claim")?;
        let mut state = self.state.write().unwrap();
        let keep_owner = state.keep_claim_owners;
        let entry = state
            .claims
            .get_mut(&(namespace.to_string(), claim.to_string()))
            .ok_or_else(|| not_found(&format!("PersistentVolumeClaim/{}", claim)))?;
        entry.claim.annotations.extend(annotations.clone());
        if !keep_owner {
            entry.claim.owner = None;
        }
        Ok(())
    }

    async fn list_instances(&self, id: &ClusterRef) -> Result<Vec<Instance>> {
        self.record(|ops| ops.lists += 1);
        self.check_available("list instances")?;
        let state = self.state.read().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|((ns, object), entry)| {
                *ns == id.namespace
                    && object.kind == ResourceKind::Instance
                    && entry.cluster.as_deref() == Some(id.name.as_str())
            })
            .map(|((_, object), entry)| Instance {
                name: object.name.clone(),
                ready: entry.ready,
            })
            .collect())
    }

    async fn list_names(
        &self,
        namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<String>> {
        self.record(|ops| ops.lists += 1);
        self.check_available("list objects")?;
        let Some(cluster) = selector_value(selector) else {
            return Ok(Vec::new());
        };
        let state = self.state.read().unwrap();

        let names = match kind {
            ResourceKind::Cluster => state
                .clusters
                .values()
                .filter(|c| c.namespace().as_deref() == Some(namespace))
                .filter(|c| c.labels().get(CLUSTER_LABEL).map(String::as_str) == Some(cluster))
                .map(|c| c.name_any())
                .collect(),
            ResourceKind::StorageClaim => state
                .claims
                .iter()
                .filter(|((ns, _), c)| ns == namespace && c.cluster == cluster)
                .map(|((_, name), _)| name.clone())
                .collect(),
            _ => state
                .objects
                .iter()
                .filter(|((ns, object), entry)| {
                    ns == namespace
                        && object.kind == kind
                        && entry.cluster.as_deref() == Some(cluster)
                })
                .map(|((_, object), _)| object.name.clone())
                .collect(),
        };
        Ok(names)
    }

    async fn exists(&self, namespace: &str, object: &ObjectRef) -> Result<bool> {
        self.record(|ops| ops.gets += 1);
        self.check_available("get object")?;
        Ok(self.contains(namespace, object))
    }

    async fn delete(&self, namespace: &str, object: &ObjectRef) -> Result<bool> {
        self.record(|ops| ops.deletes += 1);
        self.check_available("delete object")?;
        let mut state = self.state.write().unwrap();

        if !contains(&state, namespace, object) {
            return Ok(false);
        }
        if state.is_pinned(namespace, object) {
            return Ok(true);
        }

        match object.kind {
            ResourceKind::Cluster => {
                state
                    .clusters
                    .remove(&ClusterRef::new(namespace, &object.name));
                state.collect_owned_claims(namespace, &object.name);
            }
            ResourceKind::StorageClaim => {
                state
                    .claims
                    .remove(&(namespace.to_string(), object.name.clone()));
            }
            ResourceKind::Instance => {
                state
                    .objects
                    .remove(&(namespace.to_string(), object.clone()));
                state.release_instance_claims(namespace, &object.name);
            }
            _ => {
                state
                    .objects
                    .remove(&(namespace.to_string(), object.clone()));
            }
        }
        Ok(true)
    }

    async fn create(&self, namespace: &str, object: &RenderedObject) -> Result<bool> {
        self.record(|ops| ops.creates += 1);
        self.check_available("create object")?;
        let object_ref = object.object_ref();
        let mut state = self.state.write().unwrap();
        if contains(&state, namespace, &object_ref) {
            return Ok(false);
        }

        let cluster = match object {
            RenderedObject::Role(role) => role.labels().get(CLUSTER_LABEL).cloned(),
            RenderedObject::RoleBinding(binding) => binding.labels().get(CLUSTER_LABEL).cloned(),
        };
        state.add_object(namespace, object_ref, cluster.as_deref());
        Ok(true)
    }

    async fn control_data(&self, _namespace: &str, _instance: &str) -> Result<ControlSnapshot> {
        self.record(|ops| ops.execs += 1);
        self.check_available("capture control data")?;
        Ok(ControlSnapshot::new(
            self.state.read().unwrap().control_data.clone(),
        ))
    }
}
