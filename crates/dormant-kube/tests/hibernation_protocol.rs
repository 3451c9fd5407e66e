//! Hibernation protocol tests against the in-memory object store
//!
//! The mock plays the operator: creating a cluster brings up its instances,
//! secrets and claims, and fencing stops the instances. Timeouts run on a
//! paused clock.

use std::collections::BTreeMap;

use dormant_core::annotations::{
    CLUSTER_MANIFEST_ANNOTATION, PG_CONTROL_DATA_ANNOTATION, RESUMING_ANNOTATION,
};
use dormant_core::cluster::HEALTHY_PHASE;
use dormant_core::{
    ClusterRef, ClusterStatus, HibernationState, StatusReport, SummaryStatus, decode, encode,
};
use dormant_kube::resources::DEFAULT_MONITORING_CONFIGMAP;
use dormant_kube::{
    HibernateError, HibernationConfig, Hibernator, MockObjectStore, ObjectStore, ResourceKind,
};
use kube::ResourceExt;

fn id() -> ClusterRef {
    ClusterRef::new("ns1", "c1")
}

fn hibernator(store: &MockObjectStore) -> Hibernator<MockObjectStore> {
    Hibernator::new(store.clone(), HibernationConfig::default())
}

fn claim_names(store: &MockObjectStore) -> Vec<String> {
    store.claims(&id()).into_iter().map(|c| c.name).collect()
}

/// Hibernation annotations of every claim, by claim name
fn stored_annotations(store: &MockObjectStore) -> BTreeMap<String, BTreeMap<String, String>> {
    store
        .claims(&id())
        .into_iter()
        .map(|c| (c.name, c.annotations))
        .collect()
}

async fn assert_dependents_gone(store: &MockObjectStore) {
    let mut lookups = vec![ResourceKind::Cluster.named("c1")];
    for kind in ResourceKind::DEPENDENTS {
        lookups.extend(kind.conventional_names("c1").into_iter().map(|n| kind.named(n)));
    }
    lookups.extend((1..=3).map(|i| ResourceKind::Instance.named(format!("c1-{}", i))));

    for object in lookups {
        assert!(
            !store.exists("ns1", &object).await.unwrap(),
            "{} still exists",
            object
        );
    }
}

// ========== Hibernate On ==========

#[tokio::test(start_paused = true)]
async fn test_on_keeps_only_primary_data_claim() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 3, false);

    let outcome = hibernator(&store).on(&id()).await.unwrap();

    assert_eq!(outcome.initial_state, HibernationState::Active);
    assert_eq!(outcome.state, HibernationState::Hibernated);
    assert_eq!(outcome.preserved, vec!["c1-1"]);
    assert_eq!(claim_names(&store), vec!["c1-1"]);
    assert_dependents_gone(&store).await;

    let claim = &store.claims(&id())[0];
    assert!(claim.is_hibernated());
    assert!(claim.control_data().unwrap().contains("pg_control version number"));
}

#[tokio::test(start_paused = true)]
async fn test_on_keeps_data_and_wal_claims() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 3, true);

    hibernator(&store).on(&id()).await.unwrap();

    assert_eq!(claim_names(&store), vec!["c1-1", "c1-1-wal"]);
    assert!(store.claims(&id()).iter().all(|c| c.is_hibernated()));
    assert_dependents_gone(&store).await;
}

#[tokio::test(start_paused = true)]
async fn test_manifest_describes_running_cluster() {
    let store = MockObjectStore::new();
    let cluster = store.deploy(&id(), 2, true);

    hibernator(&store).on(&id()).await.unwrap();

    let claims = store.claims(&id());
    let manifest = claims[0].manifest().unwrap();
    assert_eq!(manifest, encode(&cluster).unwrap().as_str());
    assert!(!manifest.contains("fencedInstances"));
    // Both claims carry the same bytes
    assert_eq!(claims[0].annotations, claims[1].annotations);
}

#[tokio::test(start_paused = true)]
async fn test_second_on_changes_nothing() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, true);
    let hibernator = hibernator(&store);

    hibernator.on(&id()).await.unwrap();
    let survivors = claim_names(&store);
    let annotations = stored_annotations(&store);
    store.reset_counts();

    let outcome = hibernator.on(&id()).await.unwrap();

    assert!(outcome.is_noop());
    assert_eq!(outcome.state, HibernationState::Hibernated);
    assert_eq!(claim_names(&store), survivors);
    assert_eq!(stored_annotations(&store), annotations);

    let counts = store.operation_counts();
    assert_eq!(counts.patches, 0);
    assert_eq!(counts.deletes, 0);
    assert_eq!(counts.creates, 0);
}

#[tokio::test]
async fn test_on_unknown_cluster() {
    let store = MockObjectStore::new();
    let err = hibernator(&store).on(&id()).await.unwrap_err();
    assert!(matches!(err, HibernateError::ClusterNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_on_keeps_monitoring_shared_with_other_clusters() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 1, false);
    let other = ClusterRef::new("ns1", "c2");
    store.deploy(&other, 1, false);

    hibernator(&store).on(&id()).await.unwrap();

    let monitoring = ResourceKind::MonitoringConfig.named(DEFAULT_MONITORING_CONFIGMAP);
    assert!(store.contains("ns1", &monitoring));
    assert!(store.cluster(&other).is_some());
    assert!(store.contains("ns1", &ResourceKind::Secret.named("c2-app")));
    assert_eq!(store.claims(&other).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, false);
    store.fail_next(3);

    let outcome = hibernator(&store).on(&id()).await.unwrap();
    assert_eq!(outcome.state, HibernationState::Hibernated);
    assert_eq!(claim_names(&store), vec!["c1-1"]);
}

// ========== Failures and Recovery ==========

#[tokio::test(start_paused = true)]
async fn test_fence_timeout_leaves_claims_untouched() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, false);
    store.set_reconcile(false);
    let hibernator = hibernator(&store);

    let err = hibernator.on(&id()).await.unwrap_err();
    match &err {
        HibernateError::FenceTimeout { running, .. } => {
            assert_eq!(running, &vec!["c1-1".to_string(), "c1-2".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.cluster(&id()).is_some());
    assert!(store.claims(&id()).iter().all(|c| !c.is_hibernated()));

    // Once the instances stop, a rerun goes through without fencing again
    store.set_instance_ready("ns1", "c1-1", false);
    store.set_instance_ready("ns1", "c1-2", false);
    store.reset_counts();
    hibernator.on(&id()).await.unwrap();
    assert_eq!(claim_names(&store), vec!["c1-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_control_data_aborts_before_annotating() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 1, false);
    store.set_control_data("  \n");

    let err = hibernator(&store).on(&id()).await.unwrap_err();

    assert!(matches!(err, HibernateError::ControlData { .. }));
    assert!(store.cluster(&id()).is_some());
    assert!(!store.claims(&id())[0].is_hibernated());
    assert_eq!(store.operation_counts().deletes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_incomplete_then_rerun() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, false);
    let stuck = ResourceKind::Secret.named("c1-app");
    store.pin("ns1", stuck.clone());
    let hibernator = hibernator(&store);

    let err = hibernator.on(&id()).await.unwrap_err();
    match &err {
        HibernateError::TeardownIncomplete { remaining, .. } => {
            assert_eq!(remaining, &vec!["Secret/c1-app".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), "teardown_incomplete");

    // Annotations were confirmed before anything was deleted
    let annotations = stored_annotations(&store);
    assert!(store.claims(&id())[0].is_hibernated());

    let report = hibernator.status(&id()).await.unwrap();
    assert_eq!(report.status(), SummaryStatus::Hibernating);
    assert!(report.pg_control_data.is_empty());

    let err = hibernator.off(&id()).await.unwrap_err();
    assert!(matches!(err, HibernateError::InconsistentState { .. }));

    store.unpin("ns1", &stuck);
    let outcome = hibernator.on(&id()).await.unwrap();
    assert_eq!(outcome.initial_state, HibernationState::Hibernating);
    assert_eq!(outcome.deleted, vec![stuck.clone()]);
    assert_eq!(stored_annotations(&store), annotations);
    assert_dependents_gone(&store).await;
}

#[tokio::test(start_paused = true)]
async fn test_unannotated_wal_claim_is_completed_on_rerun() {
    let store = MockObjectStore::new();
    let cluster = store.deploy(&id(), 1, true);
    let hibernator = hibernator(&store);

    // An interrupted run fenced the cluster and annotated the data claim only
    let manifest = encode(&cluster).unwrap();
    let annotations = BTreeMap::from([
        (
            CLUSTER_MANIFEST_ANNOTATION.to_string(),
            manifest.as_str().to_string(),
        ),
        (PG_CONTROL_DATA_ANNOTATION.to_string(), "captured".to_string()),
    ]);
    store.annotate_claim("ns1", "c1-1", &annotations).await.unwrap();
    let fence = BTreeMap::from([(
        "cnpg.io/fencedInstances".to_string(),
        Some("[\"*\"]".to_string()),
    )]);
    store.patch_cluster_annotations(&id(), &fence).await.unwrap();

    let outcome = hibernator.on(&id()).await.unwrap();

    assert_eq!(outcome.initial_state, HibernationState::Hibernating);
    let claims = store.claims(&id());
    assert_eq!(claims.len(), 2);
    for claim in claims {
        assert_eq!(claim.control_data(), Some("captured"));
        assert_eq!(claim.manifest(), Some(manifest.as_str()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_preserved_claims_are_released_from_the_cluster() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, true);
    assert!(store.claims(&id()).iter().all(|c| c.owner.is_some()));

    hibernator(&store).on(&id()).await.unwrap();

    let claims = store.claims(&id());
    assert_eq!(claims.len(), 2);
    assert!(claims.iter().all(|c| c.owner.is_none() && c.is_hibernated()));
}

#[tokio::test(start_paused = true)]
async fn test_claim_still_owned_stops_before_deleting() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, false);
    store.keep_claim_owners(true);
    let hibernator = hibernator(&store);

    let err = hibernator.on(&id()).await.unwrap_err();
    match &err {
        HibernateError::ClaimStillOwned { claim, owner } => {
            assert_eq!(claim, "c1-1");
            assert_eq!(owner, "c1");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), "claim_still_owned");
    assert_eq!(store.operation_counts().deletes, 0);
    assert!(store.cluster(&id()).is_some());
    assert_eq!(claim_names(&store), vec!["c1-1", "c1-2"]);

    // Once ownership can be dropped, the rerun releases the claim and finishes
    store.keep_claim_owners(false);
    let outcome = hibernator.on(&id()).await.unwrap();
    assert_eq!(outcome.initial_state, HibernationState::Hibernating);
    assert_eq!(claim_names(&store), vec!["c1-1"]);
    assert!(store.claims(&id())[0].owner.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_claims_survive_repeated_cycles() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, true);
    let hibernator = hibernator(&store);

    for _ in 0..2 {
        hibernator.on(&id()).await.unwrap();
        assert_eq!(claim_names(&store), vec!["c1-1", "c1-1-wal"]);

        hibernator.off(&id()).await.unwrap();
        // The resumed cluster adopts its claims again
        assert!(store.claims(&id()).iter().all(|c| c.owner.as_deref() == Some("c1")));
    }
}

// ========== Hibernate Off ==========

#[tokio::test(start_paused = true)]
async fn test_off_reattaches_preserved_claims() {
    let store = MockObjectStore::new();
    let original = store.deploy(&id(), 3, true);
    let hibernator = hibernator(&store);

    hibernator.on(&id()).await.unwrap();
    let uids: Vec<_> = store.claims(&id()).into_iter().map(|c| c.uid).collect();
    let annotations = stored_annotations(&store);

    let outcome = hibernator.off(&id()).await.unwrap();

    assert_eq!(outcome.initial_state, HibernationState::Hibernated);
    assert_eq!(outcome.state, HibernationState::Active);
    assert_eq!(
        outcome.created,
        vec![
            ResourceKind::Cluster.named("c1"),
            ResourceKind::Role.named("c1"),
            ResourceKind::RoleBinding.named("c1"),
        ]
    );

    let resumed = store.cluster(&id()).unwrap();
    assert!(resumed.is_ready());
    assert!(!resumed.is_fenced());
    assert!(!resumed.is_resuming());
    assert_eq!(resumed.spec, original.spec);
    assert_eq!(resumed.current_primary(), Some("c1-1"));
    assert_ne!(resumed.metadata.uid, original.metadata.uid);

    // Storage is re-attached, never recreated, and its annotations are left alone
    let claims = store.claims(&id());
    for (claim, uid) in claims.iter().filter(|c| c.is_hibernated()).zip(&uids) {
        assert_eq!(&claim.uid, uid);
    }
    for (name, values) in annotations {
        let claim = claims.iter().find(|c| c.name == name).unwrap();
        assert_eq!(claim.annotations, values);
    }
    assert!(store.contains("ns1", &ResourceKind::Role.named("c1")));
    assert!(store.contains("ns1", &ResourceKind::Instance.named("c1-3")));
}

#[tokio::test]
async fn test_off_without_annotations_creates_nothing() {
    let store = MockObjectStore::new();
    let hibernator = hibernator(&store);

    let err = hibernator.off(&id()).await.unwrap_err();
    assert!(matches!(err, HibernateError::NoHibernatedCluster { .. }));

    store.deploy(&id(), 2, false);
    store.reset_counts();
    let err = hibernator.off(&id()).await.unwrap_err();
    assert!(matches!(err, HibernateError::NoHibernatedCluster { .. }));
    assert_eq!(store.operation_counts().creates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_off_is_a_noop() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 1, false);
    let hibernator = hibernator(&store);

    hibernator.on(&id()).await.unwrap();
    hibernator.off(&id()).await.unwrap();
    store.reset_counts();

    let outcome = hibernator.off(&id()).await.unwrap();
    assert!(outcome.is_noop());
    assert_eq!(store.operation_counts().creates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_keeps_recreated_objects() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 1, false);
    let hibernator = hibernator(&store);
    hibernator.on(&id()).await.unwrap();

    store.set_reconcile(false);
    let err = hibernator.off(&id()).await.unwrap_err();

    match &err {
        HibernateError::ReadinessTimeout { waited, detail, .. } => {
            assert_eq!(waited.as_secs(), 600);
            assert!(detail.contains("0/1 instances ready"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let recreated = store.cluster(&id()).unwrap();
    assert_eq!(
        recreated.annotations().get(RESUMING_ANNOTATION).map(String::as_str),
        Some("c1-1")
    );
    assert!(store.contains("ns1", &ResourceKind::RoleBinding.named("c1")));

    let report = hibernator.status(&id()).await.unwrap();
    assert_eq!(report.status(), SummaryStatus::Resuming);

    let err = hibernator.on(&id()).await.unwrap_err();
    assert!(matches!(err, HibernateError::InconsistentState { .. }));

    // The operator catches up; the rerun waits for it and drops the marker
    let mut caught_up = recreated;
    caught_up.status = Some(ClusterStatus {
        instances: Some(1),
        ready_instances: Some(1),
        current_primary: Some("c1-1".to_string()),
        phase: Some(HEALTHY_PHASE.to_string()),
        ..Default::default()
    });
    store.insert_cluster(caught_up);

    let outcome = hibernator.off(&id()).await.unwrap();
    assert_eq!(outcome.initial_state, HibernationState::Resuming);
    assert_eq!(outcome.state, HibernationState::Active);
    assert!(!store.cluster(&id()).unwrap().is_resuming());
    assert_eq!(
        hibernator.status(&id()).await.unwrap().status(),
        SummaryStatus::Deployed
    );
}

#[tokio::test(start_paused = true)]
async fn test_degraded_cluster_after_resume_is_active() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, false);
    let hibernator = hibernator(&store);
    hibernator.on(&id()).await.unwrap();
    hibernator.off(&id()).await.unwrap();

    // A replica goes down long after the resume finished
    let mut degraded = store.cluster(&id()).unwrap();
    degraded.status.as_mut().unwrap().ready_instances = Some(1);
    store.insert_cluster(degraded);

    let report = hibernator.status(&id()).await.unwrap();
    assert_eq!(report.status(), SummaryStatus::Deployed);

    let outcome = hibernator.on(&id()).await.unwrap();
    assert_eq!(outcome.initial_state, HibernationState::Active);
    assert_eq!(outcome.state, HibernationState::Hibernated);
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_manifest_is_named() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 1, false);
    let hibernator = hibernator(&store);
    hibernator.on(&id()).await.unwrap();

    let corrupt = BTreeMap::from([(
        CLUSTER_MANIFEST_ANNOTATION.to_string(),
        "{\"kind\":\"ConfigMap\"}".to_string(),
    )]);
    store.annotate_claim("ns1", "c1-1", &corrupt).await.unwrap();
    store.reset_counts();

    let err = hibernator.off(&id()).await.unwrap_err();
    match &err {
        HibernateError::ManifestCorrupt { claim, reason } => {
            assert_eq!(claim, "c1-1");
            assert!(reason.contains("ConfigMap"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.operation_counts().creates, 0);

    let err = hibernator.status(&id()).await.unwrap_err();
    assert_eq!(err.kind(), "manifest_corrupt");
}

// ========== Repeated Cycles ==========

#[tokio::test(start_paused = true)]
async fn test_new_cycle_replaces_stale_manifest() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 1, false);
    let hibernator = hibernator(&store);
    hibernator.on(&id()).await.unwrap();
    hibernator.off(&id()).await.unwrap();

    // The resumed cluster is reconfigured before the next hibernation
    let mut upgraded = store.cluster(&id()).unwrap();
    upgraded
        .spec
        .extra
        .insert("imageName".to_string(), serde_json::json!("postgres:17"));
    store.insert_cluster(upgraded);

    // The first attempt stops after fencing, with the old annotations in place
    store.set_reconcile(false);
    let err = hibernator.on(&id()).await.unwrap_err();
    assert!(matches!(err, HibernateError::FenceTimeout { .. }));
    store.set_instance_ready("ns1", "c1-1", false);

    let outcome = hibernator.on(&id()).await.unwrap();
    assert_eq!(outcome.initial_state, HibernationState::Active);

    let claim = &store.claims(&id())[0];
    let stored = decode(claim.manifest().unwrap()).unwrap();
    assert_eq!(stored.spec.extra["imageName"], "postgres:17");

    store.set_reconcile(true);
    hibernator.off(&id()).await.unwrap();
    let resumed = store.cluster(&id()).unwrap();
    assert_eq!(resumed.spec.extra["imageName"], "postgres:17");
}

#[tokio::test(start_paused = true)]
async fn test_failover_between_cycles_resumes_newest_manifest() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, false);
    let hibernator = hibernator(&store);
    hibernator.on(&id()).await.unwrap();
    hibernator.off(&id()).await.unwrap();

    // c1-2 takes over; c1-1 keeps the first cycle's annotations
    let mut failed_over = store.cluster(&id()).unwrap();
    failed_over.status.as_mut().unwrap().current_primary = Some("c1-2".to_string());
    store.insert_cluster(failed_over);
    let old_primary = ResourceKind::StorageClaim.named("c1-1");
    store.pin("ns1", old_primary.clone());

    let err = hibernator.on(&id()).await.unwrap_err();
    assert!(matches!(err, HibernateError::TeardownIncomplete { .. }));

    let report = hibernator.status(&id()).await.unwrap();
    assert_eq!(report.status(), SummaryStatus::Hibernating);
    assert_eq!(report.cluster.current_primary(), Some("c1-2"));

    store.unpin("ns1", &old_primary);
    let outcome = hibernator.on(&id()).await.unwrap();
    assert_eq!(outcome.preserved, vec!["c1-2"]);
    assert_eq!(claim_names(&store), vec!["c1-2"]);

    hibernator.off(&id()).await.unwrap();
    assert_eq!(
        store.cluster(&id()).unwrap().current_primary(),
        Some("c1-2")
    );
}

// ========== Status ==========

#[tokio::test(start_paused = true)]
async fn test_status_through_the_lifecycle() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 2, false);
    store.set_control_data("Database cluster state: shut down\n");
    let hibernator = hibernator(&store);

    let report = hibernator.status(&id()).await.unwrap();
    assert_eq!(report.status(), SummaryStatus::Deployed);
    assert_eq!(report.status().message(), "No Hibernation. Cluster Deployed.");
    assert!(report.pg_control_data.is_empty());

    hibernator.on(&id()).await.unwrap();
    let report = hibernator.status(&id()).await.unwrap();
    assert_eq!(report.status().message(), "Cluster Hibernated");
    assert_eq!(
        report.pg_control_data.as_str(),
        "Database cluster state: shut down\n"
    );
    assert_eq!(report.cluster.identity(), id());

    hibernator.off(&id()).await.unwrap();
    let report = hibernator.status(&id()).await.unwrap();
    assert_eq!(report.status(), SummaryStatus::Deployed);
}

#[tokio::test(start_paused = true)]
async fn test_status_report_parses_back() {
    let store = MockObjectStore::new();
    store.deploy(&id(), 1, true);
    let hibernator = hibernator(&store);
    hibernator.on(&id()).await.unwrap();
    store.reset_counts();

    let report = hibernator.status(&id()).await.unwrap();
    let json = report.to_json_pretty().unwrap();
    let parsed = StatusReport::from_json(&json).unwrap();

    assert_eq!(parsed, report);
    assert!(json.contains("\"pgControlData\""));
    assert!(json.contains("\"status\": \"Cluster Hibernated\""));

    let counts = store.operation_counts();
    assert_eq!(counts.creates + counts.patches + counts.deletes, 0);
}
