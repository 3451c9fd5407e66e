//! Hibernation state discovery
//!
//! The state of a cluster is never stored; every operation starts by
//! computing it from what exists:
//!
//! | Cluster object | Claims of the primary | Other objects | State |
//! |---|---|---|---|
//! | present, resume marker | any | any | `Resuming` |
//! | present, fenced | annotated for this object | any | `Hibernating` |
//! | present | otherwise | any | `Active` |
//! | absent | annotated | leftovers | `Hibernating` |
//! | absent | annotated | none | `Hibernated` |
//! | absent | none annotated | any | nothing to act on |
//!
//! Annotations outlive the cycle that wrote them. A live cluster only counts
//! annotations whose manifest carries its own uid; without a cluster object
//! the most recently created manifest wins.

use dormant_core::{
    ClaimRole, Cluster, ClusterRef, ControlSnapshot, HibernationState, StorageClaim, decode,
    instance_claims,
};
use kube::ResourceExt;
use tracing::debug;

use crate::config::HibernationConfig;
use crate::error::{HibernateError, Result};
use crate::resources::ObjectRef;
use crate::retry::retry_transient;
use crate::store::ObjectStore;
use crate::sweep::SweepEngine;

/// What discovery found for one cluster identity
#[derive(Debug, Clone)]
pub enum Discovery {
    /// Neither a cluster object nor annotated claims
    Absent,

    /// A cluster object exists
    Live(LiveCluster),

    /// No cluster object; the definition lives on the claims
    Stored(StoredCluster),
}

impl Discovery {
    /// Lifecycle state, `None` when there is nothing to act on
    pub fn state(&self) -> Option<HibernationState> {
        match self {
            Discovery::Absent => None,
            Discovery::Live(live) => Some(live.state),
            Discovery::Stored(stored) => Some(stored.state),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveCluster {
    pub cluster: Cluster,
    pub state: HibernationState,
    /// Claims labelled with the cluster
    pub claims: Vec<StorageClaim>,
    /// Whether a claim of the primary carries hibernation annotations from any cycle
    pub annotated: bool,
    /// Whether a claim of the primary was annotated for this cluster object
    pub current: bool,
}

impl LiveCluster {
    /// Claims annotated for this cluster object, data claim first
    pub fn current_claims(&self) -> Vec<&StorageClaim> {
        let uid = self.cluster.uid();
        annotated(&self.claims)
            .into_iter()
            .filter(|c| is_current(c, uid.as_deref()))
            .collect()
    }

    /// Whether `claim` holds a manifest of this cluster object
    pub fn is_current(&self, claim: &StorageClaim) -> bool {
        is_current(claim, self.cluster.uid().as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct StoredCluster {
    /// The cluster decoded from the manifest
    pub cluster: Cluster,
    pub state: HibernationState,
    /// Claim the manifest was read from
    pub source: String,
    pub snapshot: ControlSnapshot,
    /// Names of the claims hibernation keeps
    pub preserved: Vec<String>,
    /// Teardown targets that still exist
    pub leftovers: Vec<ObjectRef>,
}

/// Annotated claims, the data claim first
fn annotated(claims: &[StorageClaim]) -> Vec<&StorageClaim> {
    let mut found: Vec<&StorageClaim> = claims.iter().filter(|c| c.is_hibernated()).collect();
    found.sort_by_key(|c| c.role != Some(ClaimRole::PgData));
    found
}

/// Uid of the cluster object a claim's manifest was encoded from
fn manifest_uid(claim: &StorageClaim) -> Option<String> {
    claim
        .manifest()
        .and_then(|raw| decode(raw).ok())
        .and_then(|cluster| cluster.metadata.uid)
}

fn is_current(claim: &StorageClaim, uid: Option<&str>) -> bool {
    claim.is_hibernated() && uid.is_some() && manifest_uid(claim).as_deref() == uid
}

/// Compute the hibernation state of `id`
pub async fn discover<S: ObjectStore + ?Sized>(
    store: &S,
    config: &HibernationConfig,
    id: &ClusterRef,
) -> Result<Discovery> {
    let cluster = retry_transient(&config.retry, "get cluster", || store.get_cluster(id)).await?;
    let claims = retry_transient(&config.retry, "list claims", || store.list_claims(id)).await?;

    let discovery = match cluster {
        Some(cluster) => Discovery::Live(live(cluster, claims)),
        None => match stored(store, config, id, &claims).await? {
            Some(stored) => Discovery::Stored(stored),
            None => Discovery::Absent,
        },
    };

    debug!(
        namespace = %id.namespace,
        cluster = %id.name,
        state = ?discovery.state(),
        "Discovered hibernation state"
    );
    Ok(discovery)
}

fn live(cluster: Cluster, claims: Vec<StorageClaim>) -> LiveCluster {
    let uid = cluster.uid();
    let primary_claims: Vec<&StorageClaim> = match cluster.current_primary() {
        Some(primary) => claims
            .iter()
            .filter(|c| c.role_for(primary).is_some())
            .collect(),
        None => claims.iter().collect(),
    };
    let annotated = primary_claims.iter().any(|c| c.is_hibernated());
    let current = primary_claims
        .iter()
        .any(|c| is_current(c, uid.as_deref()));

    let state = if cluster.is_resuming() {
        HibernationState::Resuming
    } else if cluster.is_fenced() && current {
        HibernationState::Hibernating
    } else {
        HibernationState::Active
    };

    LiveCluster {
        cluster,
        state,
        claims,
        annotated,
        current,
    }
}

async fn stored<S: ObjectStore + ?Sized>(
    store: &S,
    config: &HibernationConfig,
    id: &ClusterRef,
    claims: &[StorageClaim],
) -> Result<Option<StoredCluster>> {
    let mut decoded = Vec::new();
    for claim in annotated(claims) {
        let raw = claim.manifest().unwrap_or_default();
        let cluster = decode(raw).map_err(|e| HibernateError::ManifestCorrupt {
            claim: claim.name.clone(),
            reason: e.to_string(),
        })?;
        decoded.push((claim, cluster));
    }

    // Newest manifest wins; on a tie the data claim, listed first, is kept
    let created = |c: &Cluster| c.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let mut newest: Option<(&StorageClaim, Cluster)> = None;
    for (claim, cluster) in decoded {
        let is_newer = newest
            .as_ref()
            .is_none_or(|(_, best)| created(&cluster) > created(best));
        if is_newer {
            newest = Some((claim, cluster));
        }
    }
    let Some((source, cluster)) = newest else {
        return Ok(None);
    };
    let uid = cluster.uid();

    let primary = cluster
        .current_primary()
        .or(source.instance.as_deref())
        .unwrap_or(&source.name)
        .to_string();

    let preserved = instance_claims(claims, &primary, &cluster.spec.requested_roles()).map_err(
        |missing| HibernateError::InconsistentState {
            cluster: id.to_string(),
            reason: format!(
                "hibernated primary '{}' lost its claim(s) for {}",
                primary,
                missing
                    .iter()
                    .map(ClaimRole::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        },
    )?;
    if let Some(bare) = preserved.iter().find(|c| !c.is_hibernated()) {
        return Err(HibernateError::InconsistentState {
            cluster: id.to_string(),
            reason: format!("claim '{}' of the primary is not annotated", bare.name),
        });
    }
    if let Some(stale) = preserved.iter().find(|c| manifest_uid(c) != uid) {
        return Err(HibernateError::InconsistentState {
            cluster: id.to_string(),
            reason: format!(
                "claim '{}' holds a manifest of another cluster object than claim '{}'",
                stale.name, source.name
            ),
        });
    }

    let preserved: Vec<String> = preserved.iter().map(|c| c.name.clone()).collect();
    let leftovers = SweepEngine::new(store, config)
        .leftovers(id, &preserved)
        .await?;
    let state = if leftovers.is_empty() {
        HibernationState::Hibernated
    } else {
        HibernationState::Hibernating
    };

    Ok(Some(StoredCluster {
        cluster,
        state,
        source: source.name.clone(),
        snapshot: ControlSnapshot::new(source.control_data().unwrap_or_default()),
        preserved,
        leftovers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;
    use crate::store::MockObjectStore;
    use dormant_core::annotations::{
        CLUSTER_MANIFEST_ANNOTATION, FENCED_INSTANCES_ANNOTATION, PG_CONTROL_DATA_ANNOTATION,
        RESUMING_ANNOTATION,
    };
    use dormant_core::encode;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::chrono;
    use std::collections::BTreeMap;

    fn id() -> ClusterRef {
        ClusterRef::new("ns1", "c1")
    }

    fn annotations(manifest: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLUSTER_MANIFEST_ANNOTATION.to_string(), manifest.to_string()),
            (PG_CONTROL_DATA_ANNOTATION.to_string(), "snapshot".to_string()),
        ])
    }

    async fn annotate(store: &MockObjectStore, cluster: &Cluster, claims: &[&str]) {
        let manifest = encode(cluster).unwrap();
        for claim in claims {
            store
                .annotate_claim("ns1", claim, &annotations(manifest.as_str()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_absent() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let discovery = discover(&store, &config, &id()).await.unwrap();
        assert!(matches!(discovery, Discovery::Absent));
        assert_eq!(discovery.state(), None);
    }

    #[tokio::test]
    async fn test_live_states() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let cluster = store.deploy(&id(), 2, false);

        let state = discover(&store, &config, &id()).await.unwrap().state();
        assert_eq!(state, Some(HibernationState::Active));

        annotate(&store, &cluster, &["c1-1"]).await;
        let state = discover(&store, &config, &id()).await.unwrap().state();
        assert_eq!(state, Some(HibernationState::Active));

        let fence = BTreeMap::from([(
            FENCED_INSTANCES_ANNOTATION.to_string(),
            Some("[\"*\"]".to_string()),
        )]);
        store.patch_cluster_annotations(&id(), &fence).await.unwrap();
        let state = discover(&store, &config, &id()).await.unwrap().state();
        assert_eq!(state, Some(HibernationState::Hibernating));
    }

    #[tokio::test]
    async fn test_resume_marker_means_resuming() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let cluster = store.deploy(&id(), 1, false);
        annotate(&store, &cluster, &["c1-1"]).await;

        let marker = BTreeMap::from([(RESUMING_ANNOTATION.to_string(), Some("c1-1".to_string()))]);
        store.patch_cluster_annotations(&id(), &marker).await.unwrap();
        let state = discover(&store, &config, &id()).await.unwrap().state();
        assert_eq!(state, Some(HibernationState::Resuming));
    }

    #[tokio::test]
    async fn test_degraded_cluster_without_marker_is_active() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let mut cluster = store.deploy(&id(), 2, false);
        annotate(&store, &cluster, &["c1-1"]).await;

        cluster.status.as_mut().unwrap().ready_instances = Some(1);
        store.insert_cluster(cluster);
        let Discovery::Live(live) = discover(&store, &config, &id()).await.unwrap() else {
            panic!("expected a live cluster");
        };
        assert_eq!(live.state, HibernationState::Active);
        assert!(live.annotated);
    }

    #[tokio::test]
    async fn test_fenced_with_stale_annotations_is_active() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let cluster = store.deploy(&id(), 1, false);

        // Written for an earlier object of the same name
        let mut earlier = cluster.clone();
        earlier.metadata.uid = Some("retired-uid".to_string());
        annotate(&store, &earlier, &["c1-1"]).await;

        let fence = BTreeMap::from([(
            FENCED_INSTANCES_ANNOTATION.to_string(),
            Some("[\"*\"]".to_string()),
        )]);
        store.patch_cluster_annotations(&id(), &fence).await.unwrap();

        let Discovery::Live(live) = discover(&store, &config, &id()).await.unwrap() else {
            panic!("expected a live cluster");
        };
        assert_eq!(live.state, HibernationState::Active);
        assert!(live.annotated);
        assert!(!live.current);
        assert!(live.current_claims().is_empty());
    }

    #[tokio::test]
    async fn test_stored_states() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let cluster = store.deploy(&id(), 1, true);
        annotate(&store, &cluster, &["c1-1", "c1-1-wal"]).await;
        store.delete("ns1", &ResourceKind::Cluster.named("c1")).await.unwrap();

        let Discovery::Stored(stored) = discover(&store, &config, &id()).await.unwrap() else {
            panic!("expected a stored cluster");
        };
        assert_eq!(stored.state, HibernationState::Hibernating);
        assert_eq!(stored.source, "c1-1");
        assert_eq!(stored.preserved, vec!["c1-1", "c1-1-wal"]);
        assert_eq!(stored.snapshot.as_str(), "snapshot");
        assert!(stored.leftovers.contains(&ResourceKind::Instance.named("c1-1")));

        for object in store.objects("ns1") {
            store.delete("ns1", &object).await.unwrap();
        }
        let Discovery::Stored(stored) = discover(&store, &config, &id()).await.unwrap() else {
            panic!("expected a stored cluster");
        };
        assert_eq!(stored.state, HibernationState::Hibernated);
        assert!(stored.leftovers.is_empty());
        assert_eq!(stored.cluster.spec, cluster.spec);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_names_claim() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        store.deploy(&id(), 1, false);
        store
            .annotate_claim("ns1", "c1-1", &annotations("{not json"))
            .await
            .unwrap();
        store.delete("ns1", &ResourceKind::Cluster.named("c1")).await.unwrap();

        let err = discover(&store, &config, &id()).await.unwrap_err();
        match err {
            HibernateError::ManifestCorrupt { claim, .. } => assert_eq!(claim, "c1-1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stored_prefers_newest_manifest() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let cluster = store.deploy(&id(), 2, false);

        let mut newer = cluster.clone();
        newer.metadata.uid = Some("second-cycle".to_string());
        let created = cluster.metadata.creation_timestamp.clone().unwrap().0;
        newer.metadata.creation_timestamp = Some(Time(created + chrono::Duration::hours(1)));
        newer.status.as_mut().unwrap().current_primary = Some("c1-2".to_string());
        newer
            .spec
            .extra
            .insert("imageName".to_string(), serde_json::json!("postgres:17"));

        annotate(&store, &cluster, &["c1-1"]).await;
        annotate(&store, &newer, &["c1-2"]).await;
        store.delete("ns1", &ResourceKind::Cluster.named("c1")).await.unwrap();

        let Discovery::Stored(stored) = discover(&store, &config, &id()).await.unwrap() else {
            panic!("expected a stored cluster");
        };
        assert_eq!(stored.source, "c1-2");
        assert_eq!(stored.preserved, vec!["c1-2"]);
        assert_eq!(stored.cluster.spec.extra["imageName"], "postgres:17");
        assert!(stored.leftovers.contains(&ResourceKind::StorageClaim.named("c1-1")));
    }

    #[tokio::test]
    async fn test_primary_claims_from_different_cycles_are_inconsistent() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let cluster = store.deploy(&id(), 1, true);

        let mut earlier = cluster.clone();
        earlier.metadata.uid = Some("retired-uid".to_string());
        earlier.metadata.creation_timestamp = None;
        annotate(&store, &cluster, &["c1-1"]).await;
        annotate(&store, &earlier, &["c1-1-wal"]).await;
        store.delete("ns1", &ResourceKind::Cluster.named("c1")).await.unwrap();

        let err = discover(&store, &config, &id()).await.unwrap_err();
        match err {
            HibernateError::InconsistentState { reason, .. } => {
                assert!(reason.contains("c1-1-wal"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_partially_annotated_primary_is_inconsistent() {
        let store = MockObjectStore::new();
        let config = HibernationConfig::default();
        let cluster = store.deploy(&id(), 1, true);
        annotate(&store, &cluster, &["c1-1"]).await;
        store.delete("ns1", &ResourceKind::Cluster.named("c1")).await.unwrap();

        let err = discover(&store, &config, &id()).await.unwrap_err();
        assert!(matches!(err, HibernateError::InconsistentState { .. }));
    }
}
