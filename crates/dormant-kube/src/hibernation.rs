//! Hibernation state machine
//!
//! [`Hibernator`] runs the three administrative operations against one
//! cluster identity at a time:
//!
//! - **on**: fence, capture the control data, annotate and release the
//!   primary's claims, then sweep everything else away
//! - **off**: recreate the cluster from the manifest stored on its claims,
//!   marked as resuming, and wait until it is ready
//! - **status**: report where the cluster stands, without touching anything
//!
//! Every operation starts from [`discover`]ed state, so rerunning an
//! interrupted operation picks up where the previous run stopped.

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, info};

use dormant_core::annotations::{
    CLUSTER_MANIFEST_ANNOTATION, FENCED_INSTANCES_ANNOTATION, PG_CONTROL_DATA_ANNOTATION,
    RESUMING_ANNOTATION,
};
use dormant_core::cluster::FENCE_ALL;
use dormant_core::{
    Cluster, ClusterRef, ControlSnapshot, HibernationManifest, HibernationState, StatusReport,
    StorageClaim, encode, instance_claims, restorable,
};
use kube::ResourceExt;

use crate::config::HibernationConfig;
use crate::discovery::{Discovery, LiveCluster, StoredCluster, discover};
use crate::error::{HibernateError, Result};
use crate::resources::{ObjectRef, ResourceKind};
use crate::retry::{PollBackoff, retry_transient};
use crate::status::StatusReporter;
use crate::store::ObjectStore;
use crate::sweep::SweepEngine;

/// What an operation did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HibernateOutcome {
    /// `namespace/name` of the cluster
    pub cluster: String,
    /// State the cluster was found in
    pub initial_state: HibernationState,
    /// State the cluster was left in
    pub state: HibernationState,
    /// Claims kept and annotated
    pub preserved: Vec<String>,
    /// Objects deleted and confirmed gone
    pub deleted: Vec<ObjectRef>,
    /// Objects created
    pub created: Vec<ObjectRef>,
}

impl HibernateOutcome {
    fn new(id: &ClusterRef, initial_state: HibernationState) -> Self {
        Self {
            cluster: id.to_string(),
            initial_state,
            state: initial_state,
            preserved: Vec::new(),
            deleted: Vec::new(),
            created: Vec::new(),
        }
    }

    /// Whether the operation found nothing to do
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty() && self.created.is_empty() && self.initial_state == self.state
    }
}

/// Runs hibernate on, off and status against an object store
pub struct Hibernator<S: ObjectStore> {
    store: S,
    config: HibernationConfig,
}

impl<S: ObjectStore> Hibernator<S> {
    pub fn new(store: S, config: HibernationConfig) -> Self {
        Self { store, config }
    }

    /// Get the object store
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &HibernationConfig {
        &self.config
    }

    fn sweep(&self) -> SweepEngine<'_, S> {
        SweepEngine::new(&self.store, &self.config)
    }

    // ========== Hibernate On ==========

    /// Hibernate a cluster, keeping only its primary's claims
    pub async fn on(&self, id: &ClusterRef) -> Result<HibernateOutcome> {
        match discover(&self.store, &self.config, id).await? {
            Discovery::Absent => Err(HibernateError::ClusterNotFound {
                cluster: id.to_string(),
            }),
            Discovery::Stored(stored) => self.finish_stored(id, stored).await,
            Discovery::Live(live) => match live.state {
                HibernationState::Resuming => Err(HibernateError::InconsistentState {
                    cluster: id.to_string(),
                    reason: "resume in progress, run `hibernate off` to finish it first"
                        .to_string(),
                }),
                HibernationState::Hibernating => self.finish_live(id, live).await,
                _ => self.hibernate_live(id, live).await,
            },
        }
    }

    /// Full hibernation of a running cluster
    async fn hibernate_live(&self, id: &ClusterRef, live: LiveCluster) -> Result<HibernateOutcome> {
        let mut outcome = HibernateOutcome::new(id, live.state);
        let cluster = &live.cluster;

        let primary = cluster
            .current_primary()
            .ok_or_else(|| HibernateError::NoPrimary {
                cluster: id.to_string(),
            })?
            .to_string();
        let preserved = primary_claims(&live.claims, &primary, cluster)?;
        info!(
            namespace = %id.namespace,
            cluster = %id.name,
            primary = %primary,
            claims = ?preserved,
            "Hibernating cluster"
        );

        // Encoded before fencing so the manifest describes the running cluster
        let manifest = encode(cluster).map_err(|e| HibernateError::Serialization {
            cluster: id.to_string(),
            message: e.to_string(),
        })?;

        self.fence(id, cluster).await?;
        let snapshot = self.capture(id, &primary).await?;
        self.write_annotations(id, &preserved, &manifest, &snapshot)
            .await?;

        let report = self.sweep().teardown(id, &preserved).await?;
        outcome.deleted = report.deleted;
        outcome.preserved = preserved;
        outcome.state = HibernationState::Hibernated;
        Ok(outcome)
    }

    /// Resume a hibernation that stopped after fencing, cluster still present
    async fn finish_live(&self, id: &ClusterRef, live: LiveCluster) -> Result<HibernateOutcome> {
        let mut outcome = HibernateOutcome::new(id, live.state);
        let primary = live
            .cluster
            .current_primary()
            .ok_or_else(|| HibernateError::NoPrimary {
                cluster: id.to_string(),
            })?
            .to_string();
        let preserved = primary_claims(&live.claims, &primary, &live.cluster)?;

        // Claims annotated by the interrupted run keep their bytes; the others,
        // and any still owned by the cluster, get a copy of them
        let source = live
            .current_claims()
            .into_iter()
            .find(|c| preserved.contains(&c.name))
            .ok_or_else(|| HibernateError::InconsistentState {
                cluster: id.to_string(),
                reason: format!("no claim of primary '{}' is annotated", primary),
            })?;
        let manifest = HibernationManifest::from(source.manifest().unwrap_or_default().to_string());
        let snapshot = ControlSnapshot::new(source.control_data().unwrap_or_default());
        let pending: Vec<String> = live
            .claims
            .iter()
            .filter(|c| preserved.contains(&c.name))
            .filter(|c| !live.is_current(c) || c.owner.is_some())
            .map(|c| c.name.clone())
            .collect();
        if !pending.is_empty() {
            self.write_annotations(id, &pending, &manifest, &snapshot)
                .await?;
        }

        info!(
            namespace = %id.namespace,
            cluster = %id.name,
            "Continuing interrupted hibernation"
        );
        let report = self.sweep().teardown(id, &preserved).await?;
        outcome.deleted = report.deleted;
        outcome.preserved = preserved;
        outcome.state = HibernationState::Hibernated;
        Ok(outcome)
    }

    /// Finish the sweep of a cluster whose object is already gone
    async fn finish_stored(
        &self,
        id: &ClusterRef,
        stored: StoredCluster,
    ) -> Result<HibernateOutcome> {
        let mut outcome = HibernateOutcome::new(id, stored.state);
        outcome.preserved = stored.preserved;

        if stored.state == HibernationState::Hibernated {
            info!(namespace = %id.namespace, cluster = %id.name, "Cluster already hibernated");
            return Ok(outcome);
        }

        info!(
            namespace = %id.namespace,
            cluster = %id.name,
            leftovers = stored.leftovers.len(),
            "Continuing interrupted teardown"
        );
        let report = self.sweep().teardown(id, &outcome.preserved).await?;
        outcome.deleted = report.deleted;
        outcome.state = HibernationState::Hibernated;
        Ok(outcome)
    }

    /// Fence every instance and wait until none reports ready
    async fn fence(&self, id: &ClusterRef, cluster: &Cluster) -> Result<()> {
        if !cluster.is_fenced() {
            let value = serde_json::to_string(&[FENCE_ALL]).map_err(|e| {
                HibernateError::Serialization {
                    cluster: id.to_string(),
                    message: e.to_string(),
                }
            })?;
            let annotations =
                BTreeMap::from([(FENCED_INSTANCES_ANNOTATION.to_string(), Some(value))]);
            retry_transient(&self.config.retry, "fence cluster", || {
                self.store.patch_cluster_annotations(id, &annotations)
            })
            .await?;
            info!(namespace = %id.namespace, cluster = %id.name, "Fenced all instances");
        }

        let deadline = Instant::now() + self.config.fence_timeout;
        let mut backoff = PollBackoff::new(self.config.poll_interval, self.config.max_poll_interval);
        loop {
            let instances = retry_transient(&self.config.retry, "list instances", || {
                self.store.list_instances(id)
            })
            .await?;
            let running: Vec<String> = instances
                .into_iter()
                .filter(|i| i.ready)
                .map(|i| i.name)
                .collect();
            if running.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HibernateError::FenceTimeout {
                    cluster: id.to_string(),
                    waited: self.config.fence_timeout,
                    running,
                });
            }
            debug!(
                namespace = %id.namespace,
                cluster = %id.name,
                running = running.len(),
                "Waiting for instances to stop"
            );
            tokio::time::sleep(backoff.next_interval().min(deadline - now)).await;
        }
    }

    async fn capture(&self, id: &ClusterRef, primary: &str) -> Result<ControlSnapshot> {
        let snapshot = retry_transient(&self.config.retry, "capture control data", || {
            self.store.control_data(&id.namespace, primary)
        })
        .await?;
        if snapshot.is_empty() {
            return Err(HibernateError::ControlData {
                instance: primary.to_string(),
                message: "empty output".to_string(),
            });
        }
        debug!(namespace = %id.namespace, instance = %primary, "Captured control data");
        Ok(snapshot)
    }

    /// Write both annotations on `claims`, then read them back
    ///
    /// The write also releases each claim from its owner; a claim that reads
    /// back still owned would be garbage collected by the teardown.
    async fn write_annotations(
        &self,
        id: &ClusterRef,
        claims: &[String],
        manifest: &HibernationManifest,
        snapshot: &ControlSnapshot,
    ) -> Result<()> {
        let annotations = BTreeMap::from([
            (
                CLUSTER_MANIFEST_ANNOTATION.to_string(),
                manifest.as_str().to_string(),
            ),
            (
                PG_CONTROL_DATA_ANNOTATION.to_string(),
                snapshot.as_str().to_string(),
            ),
        ]);

        for claim in claims {
            retry_transient(&self.config.retry, "annotate claim", || {
                self.store.annotate_claim(&id.namespace, claim, &annotations)
            })
            .await?;
            info!(namespace = %id.namespace, resource = %claim, "Annotated claim");
        }

        let stored = retry_transient(&self.config.retry, "list claims", || {
            self.store.list_claims(id)
        })
        .await?;
        for claim in claims {
            let found = stored.iter().find(|c| c.name == *claim);
            for (key, expected) in &annotations {
                let actual = found.and_then(|c| c.annotations.get(key));
                if actual != Some(expected) {
                    return Err(HibernateError::AnnotationNotPersisted {
                        claim: claim.clone(),
                        annotation: key.clone(),
                    });
                }
            }
            if let Some(owner) = found.and_then(|c| c.owner.clone()) {
                return Err(HibernateError::ClaimStillOwned {
                    claim: claim.clone(),
                    owner,
                });
            }
        }
        Ok(())
    }

    // ========== Hibernate Off ==========

    /// Recreate a hibernated cluster and wait until it is ready
    pub async fn off(&self, id: &ClusterRef) -> Result<HibernateOutcome> {
        match discover(&self.store, &self.config, id).await? {
            Discovery::Absent => Err(HibernateError::NoHibernatedCluster {
                cluster: id.to_string(),
                reason: "no annotated storage claims".to_string(),
            }),
            Discovery::Stored(stored) => match stored.state {
                HibernationState::Hibernated => self.resume(id, stored).await,
                _ => Err(HibernateError::InconsistentState {
                    cluster: id.to_string(),
                    reason: format!(
                        "teardown incomplete ({} object(s) left), rerun `hibernate on` first",
                        stored.leftovers.len()
                    ),
                }),
            },
            Discovery::Live(live) => match live.state {
                HibernationState::Resuming => self.finish_resume(id, live).await,
                HibernationState::Hibernating => Err(HibernateError::InconsistentState {
                    cluster: id.to_string(),
                    reason: "hibernation in progress, rerun `hibernate on` first".to_string(),
                }),
                _ if live.annotated => {
                    info!(namespace = %id.namespace, cluster = %id.name, "Cluster already resumed");
                    Ok(HibernateOutcome::new(id, live.state))
                }
                _ => Err(HibernateError::NoHibernatedCluster {
                    cluster: id.to_string(),
                    reason: "the cluster is running and was never hibernated".to_string(),
                }),
            },
        }
    }

    async fn resume(&self, id: &ClusterRef, stored: StoredCluster) -> Result<HibernateOutcome> {
        let mut outcome = HibernateOutcome::new(id, stored.state);
        outcome.preserved = stored.preserved;
        info!(
            namespace = %id.namespace,
            cluster = %id.name,
            manifest = %stored.source,
            "Resuming cluster"
        );

        let mut cluster = restorable(stored.cluster);
        cluster
            .annotations_mut()
            .insert(RESUMING_ANNOTATION.to_string(), stored.source);
        let live = retry_transient(&self.config.retry, "create cluster", || {
            self.store.create_cluster(&cluster)
        })
        .await?;
        outcome.created.push(ResourceKind::Cluster.named(&id.name));
        outcome.state = HibernationState::Resuming;

        outcome.created.extend(self.sweep().restore(&live).await?);
        self.wait_ready(id).await?;
        self.clear_resume_marker(id).await?;
        outcome.state = HibernationState::Active;
        Ok(outcome)
    }

    async fn finish_resume(&self, id: &ClusterRef, live: LiveCluster) -> Result<HibernateOutcome> {
        let mut outcome = HibernateOutcome::new(id, live.state);
        info!(namespace = %id.namespace, cluster = %id.name, "Continuing interrupted resume");

        outcome.created = self.sweep().restore(&live.cluster).await?;
        self.wait_ready(id).await?;
        self.clear_resume_marker(id).await?;
        outcome.state = HibernationState::Active;
        Ok(outcome)
    }

    /// Drop the resume marker once the cluster has reported ready
    async fn clear_resume_marker(&self, id: &ClusterRef) -> Result<()> {
        let annotations = BTreeMap::from([(RESUMING_ANNOTATION.to_string(), None)]);
        retry_transient(&self.config.retry, "clear resume marker", || {
            self.store.patch_cluster_annotations(id, &annotations)
        })
        .await?;
        debug!(namespace = %id.namespace, cluster = %id.name, "Cleared resume marker");
        Ok(())
    }

    /// Poll the cluster until it reports ready
    async fn wait_ready(&self, id: &ClusterRef) -> Result<()> {
        let deadline = Instant::now() + self.config.readiness_timeout;
        let mut backoff = PollBackoff::new(self.config.poll_interval, self.config.max_poll_interval);

        loop {
            let cluster = retry_transient(&self.config.retry, "get cluster", || {
                self.store.get_cluster(id)
            })
            .await?;
            if cluster.as_ref().is_some_and(Cluster::is_ready) {
                info!(namespace = %id.namespace, cluster = %id.name, "Cluster ready");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HibernateError::ReadinessTimeout {
                    cluster: id.to_string(),
                    waited: self.config.readiness_timeout,
                    detail: readiness_detail(cluster.as_ref()),
                });
            }
            debug!(namespace = %id.namespace, cluster = %id.name, "Waiting for readiness");
            tokio::time::sleep(backoff.next_interval().min(deadline - now)).await;
        }
    }

    // ========== Status ==========

    /// Report the hibernation state of a cluster
    pub async fn status(&self, id: &ClusterRef) -> Result<StatusReport> {
        StatusReporter::new(&self.store, &self.config).report(id).await
    }
}

/// Names of the primary's claims, one per requested role
fn primary_claims(claims: &[StorageClaim], primary: &str, cluster: &Cluster) -> Result<Vec<String>> {
    instance_claims(claims, primary, &cluster.spec.requested_roles())
        .map(|found| found.iter().map(|c| c.name.clone()).collect())
        .map_err(|roles| HibernateError::MissingStorageClaims {
            instance: primary.to_string(),
            roles,
        })
}

fn readiness_detail(cluster: Option<&Cluster>) -> String {
    let Some(cluster) = cluster else {
        return "cluster object is gone".to_string();
    };
    let status = cluster.status.clone().unwrap_or_default();
    format!(
        "{}/{} instances ready, primary {}, phase '{}'",
        status.ready_instances.unwrap_or(0),
        cluster.spec.instances,
        cluster.current_primary().unwrap_or("not elected"),
        status.phase.as_deref().unwrap_or("unknown")
    )
}
