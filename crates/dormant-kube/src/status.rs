//! Hibernation status reporter

use tracing::debug;

use dormant_core::{ClusterRef, StatusReport};

use crate::config::HibernationConfig;
use crate::discovery::{Discovery, discover};
use crate::error::{HibernateError, Result};
use crate::store::ObjectStore;

/// Builds [`StatusReport`]s without modifying anything
pub struct StatusReporter<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    config: &'a HibernationConfig,
}

impl<'a, S: ObjectStore + ?Sized> StatusReporter<'a, S> {
    pub fn new(store: &'a S, config: &'a HibernationConfig) -> Self {
        Self { store, config }
    }

    /// Report on `id` in whatever state it currently is
    ///
    /// The cluster section comes from the live object when there is one,
    /// otherwise from the manifest on the claims.
    pub async fn report(&self, id: &ClusterRef) -> Result<StatusReport> {
        let report = match discover(self.store, self.config, id).await? {
            Discovery::Absent => {
                return Err(HibernateError::NoHibernatedCluster {
                    cluster: id.to_string(),
                    reason: "no cluster object and no annotated storage claims".to_string(),
                });
            }
            Discovery::Live(live) => StatusReport::active(live.cluster, live.state),
            Discovery::Stored(stored) => {
                StatusReport::hibernated(stored.cluster, stored.state, stored.snapshot)
            }
        };

        debug!(
            namespace = %id.namespace,
            cluster = %id.name,
            status = %report.status(),
            "Built status report"
        );
        Ok(report)
    }
}
