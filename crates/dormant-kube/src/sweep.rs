//! Resource sweep engine
//!
//! Tears down everything a cluster owns except an explicit set of preserved
//! claims, and renders back the objects resume is responsible for.
//!
//! Teardown runs in two phases, once every preserved claim is confirmed to have
//! no owner that would garbage collect it:
//! 1. The cluster object and its dependents are deleted concurrently.
//! 2. Once no instance is left running, the non-preserved claims follow.
//!
//! Nothing counts as deleted until a follow-up lookup says it is gone. All
//! waits share one deadline, `teardownTimeout` from the configuration.

use futures::future::join_all;
use kube::ResourceExt;
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::time::Instant;
use tracing::{debug, info};

use dormant_core::{Cluster, ClusterRef};

use crate::config::HibernationConfig;
use crate::error::{HibernateError, Result};
use crate::resources::{ObjectRef, ResourceKind, RestorePolicy, render};
use crate::retry::{PollBackoff, retry_transient};
use crate::store::ObjectStore;

/// Objects touched by a teardown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Deleted, confirmed gone
    pub deleted: Vec<ObjectRef>,
    /// Gone before the sweep reached them
    pub already_absent: Vec<ObjectRef>,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.deleted.extend(other.deleted);
        self.already_absent.extend(other.already_absent);
    }
}

/// Resource sweep engine for one object store
pub struct SweepEngine<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    config: &'a HibernationConfig,
}

impl<'a, S: ObjectStore + ?Sized> SweepEngine<'a, S> {
    pub fn new(store: &'a S, config: &'a HibernationConfig) -> Self {
        Self { store, config }
    }

    // ========== Enumeration ==========

    /// Dependent objects of `id`, storage claims excluded
    ///
    /// Shared objects are left out while another cluster in the namespace
    /// still uses them.
    pub async fn dependents(&self, id: &ClusterRef) -> Result<Vec<ObjectRef>> {
        let selector = id.label_selector();
        let mut targets = BTreeSet::new();

        for kind in ResourceKind::DEPENDENTS {
            if kind.is_shared() && self.is_shared_with_others(id).await? {
                debug!(namespace = %id.namespace, cluster = %id.name, resource = %kind, "Keeping shared object");
                continue;
            }
            for name in kind.conventional_names(&id.name) {
                targets.insert(kind.named(name));
            }
            if kind.is_labelled() {
                let names = retry_transient(&self.config.retry, "list objects", || {
                    self.store.list_names(&id.namespace, kind, &selector)
                })
                .await?;
                targets.extend(names.into_iter().map(|name| kind.named(name)));
            }
        }

        Ok(targets.into_iter().collect())
    }

    /// Claims of `id` whose names are not in `preserved`
    pub async fn disposable_claims(
        &self,
        id: &ClusterRef,
        preserved: &[String],
    ) -> Result<Vec<ObjectRef>> {
        let claims = retry_transient(&self.config.retry, "list claims", || {
            self.store.list_claims(id)
        })
        .await?;

        Ok(claims
            .into_iter()
            .filter(|claim| !preserved.contains(&claim.name))
            .map(|claim| ResourceKind::StorageClaim.named(claim.name))
            .collect())
    }

    /// Teardown targets of `id` that still exist
    pub async fn leftovers(&self, id: &ClusterRef, preserved: &[String]) -> Result<Vec<ObjectRef>> {
        let mut candidates = self.dependents(id).await?;
        candidates.extend(self.disposable_claims(id, preserved).await?);

        let mut remaining = Vec::new();
        for object in candidates {
            if self.exists(&id.namespace, &object).await? {
                remaining.push(object);
            }
        }
        Ok(remaining)
    }

    async fn is_shared_with_others(&self, id: &ClusterRef) -> Result<bool> {
        let clusters = retry_transient(&self.config.retry, "list clusters", || {
            self.store.list_clusters(&id.namespace)
        })
        .await?;
        Ok(clusters.iter().any(|name| *name != id.name))
    }

    // ========== Teardown ==========

    /// Delete the cluster and everything it owns except the `preserved` claims
    pub async fn teardown(&self, id: &ClusterRef, preserved: &[String]) -> Result<SweepReport> {
        let deadline = Instant::now() + self.config.teardown_timeout;
        self.ensure_released(id, preserved).await?;

        let mut targets = vec![ResourceKind::Cluster.named(&id.name)];
        targets.extend(self.dependents(id).await?);
        info!(
            namespace = %id.namespace,
            cluster = %id.name,
            objects = targets.len(),
            "Deleting cluster and dependents"
        );
        let mut report = self.delete_all(&id.namespace, &targets).await?;

        // Claims are released only once no instance is left to use them
        let instances = retry_transient(&self.config.retry, "list instances", || {
            self.store.list_instances(id)
        })
        .await?;
        let instances: Vec<ObjectRef> = instances
            .into_iter()
            .map(|instance| ResourceKind::Instance.named(instance.name))
            .collect();
        self.await_absent(id, &instances, deadline).await?;

        let claims = self.disposable_claims(id, preserved).await?;
        if !claims.is_empty() {
            info!(
                namespace = %id.namespace,
                cluster = %id.name,
                claims = claims.len(),
                "Deleting non-primary storage claims"
            );
        }
        report.merge(self.delete_all(&id.namespace, &claims).await?);

        targets.extend(claims);
        self.await_absent(id, &targets, deadline).await?;

        info!(
            namespace = %id.namespace,
            cluster = %id.name,
            deleted = report.deleted.len(),
            "Teardown confirmed"
        );
        Ok(report)
    }

    /// Fail if deleting the cluster would take a preserved claim with it
    async fn ensure_released(&self, id: &ClusterRef, preserved: &[String]) -> Result<()> {
        let claims = retry_transient(&self.config.retry, "list claims", || {
            self.store.list_claims(id)
        })
        .await?;

        match claims
            .into_iter()
            .filter(|claim| preserved.contains(&claim.name))
            .find_map(|claim| claim.owner.map(|owner| (claim.name, owner)))
        {
            Some((claim, owner)) => Err(HibernateError::ClaimStillOwned { claim, owner }),
            None => Ok(()),
        }
    }

    /// Issue every deletion concurrently
    async fn delete_all(&self, namespace: &str, objects: &[ObjectRef]) -> Result<SweepReport> {
        let results = join_all(objects.iter().map(|object| async move {
            let deleted = retry_transient(&self.config.retry, "delete object", || {
                self.store.delete(namespace, object)
            })
            .await?;
            Ok::<_, HibernateError>((object.clone(), deleted))
        }))
        .await;

        let mut report = SweepReport::default();
        for result in results {
            let (object, deleted) = result?;
            debug!(namespace = %namespace, resource = %object, deleted, "Deletion issued");
            if deleted {
                report.deleted.push(object);
            } else {
                report.already_absent.push(object);
            }
        }
        Ok(report)
    }

    /// Poll until none of `objects` exists, or fail at `deadline`
    async fn await_absent(
        &self,
        id: &ClusterRef,
        objects: &[ObjectRef],
        deadline: Instant,
    ) -> Result<()> {
        let mut backoff = PollBackoff::new(self.config.poll_interval, self.config.max_poll_interval);
        let mut pending = objects.to_vec();

        loop {
            let mut still_present = Vec::new();
            for object in pending {
                if self.exists(&id.namespace, &object).await? {
                    still_present.push(object);
                }
            }
            pending = still_present;

            if pending.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HibernateError::TeardownIncomplete {
                    cluster: id.to_string(),
                    waited: self.config.teardown_timeout,
                    remaining: pending.iter().map(ToString::to_string).collect(),
                });
            }

            debug!(
                namespace = %id.namespace,
                cluster = %id.name,
                remaining = pending.len(),
                "Waiting for deletion"
            );
            tokio::time::sleep(backoff.next_interval().min(deadline - now)).await;
        }
    }

    async fn exists(&self, namespace: &str, object: &ObjectRef) -> Result<bool> {
        retry_transient(&self.config.retry, "get object", || {
            self.store.exists(namespace, object)
        })
        .await
    }

    // ========== Restore ==========

    /// Create the objects resume renders itself for a live `cluster`
    ///
    /// Objects that already exist are left alone. Returns the ones created.
    pub async fn restore(&self, cluster: &Cluster) -> Result<Vec<ObjectRef>> {
        let namespace = cluster.namespace().unwrap_or_default();
        let mut created = Vec::new();

        for kind in ResourceKind::DEPENDENTS {
            if kind.restore_policy() != RestorePolicy::Render {
                continue;
            }
            for object in render(kind, cluster) {
                let object_ref = object.object_ref();
                let was_created = retry_transient(&self.config.retry, "create object", || {
                    self.store.create(&namespace, &object)
                })
                .await?;

                if was_created {
                    info!(namespace = %namespace, resource = %object_ref, "Created");
                    created.push(object_ref);
                } else {
                    debug!(namespace = %namespace, resource = %object_ref, "Already exists");
                }
            }
        }
        Ok(created)
    }
}
