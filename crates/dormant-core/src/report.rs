//! Hibernation status report
//!
//! The report is what `hibernate status -o json` prints and what automation
//! parses. Its shape is fixed: `cluster`, `summary.status` and
//! `pgControlData`. Parsing goes through [`StatusReport::from_json`], which
//! rejects anything else with a named error instead of letting a caller
//! discover a missing field halfway through.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::Cluster;
use crate::error::{CoreError, Result};
use crate::manifest::ControlSnapshot;

/// Where a cluster stands in the hibernation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HibernationState {
    /// A live cluster object exists and is not being torn down
    Active,
    /// Teardown started but has not been confirmed complete
    Hibernating,
    /// Only the annotated primary claims remain
    Hibernated,
    /// The cluster was recreated from its manifest and is not ready yet
    Resuming,
}

impl HibernationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Hibernating => "hibernating",
            Self::Hibernated => "hibernated",
            Self::Resuming => "resuming",
        }
    }

    pub fn summary(&self) -> SummaryStatus {
        match self {
            Self::Active => SummaryStatus::Deployed,
            Self::Hibernating => SummaryStatus::Hibernating,
            Self::Hibernated => SummaryStatus::Hibernated,
            Self::Resuming => SummaryStatus::Resuming,
        }
    }
}

impl fmt::Display for HibernationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of summary messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryStatus {
    #[serde(rename = "No Hibernation. Cluster Deployed.")]
    Deployed,
    #[serde(rename = "Hibernation In Progress")]
    Hibernating,
    #[serde(rename = "Cluster Hibernated")]
    Hibernated,
    #[serde(rename = "Resume In Progress")]
    Resuming,
}

impl SummaryStatus {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Deployed => "No Hibernation. Cluster Deployed.",
            Self::Hibernating => "Hibernation In Progress",
            Self::Hibernated => "Cluster Hibernated",
            Self::Resuming => "Resume In Progress",
        }
    }
}

impl fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Summary {
    pub status: SummaryStatus,
}

/// Structured snapshot of a cluster's hibernation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusReport {
    /// The live cluster, or the one decoded from the manifest
    pub cluster: Cluster,

    pub summary: Summary,

    /// Raw control snapshot; empty unless the cluster is hibernated
    #[serde(default)]
    pub pg_control_data: ControlSnapshot,
}

impl StatusReport {
    /// Report for a live cluster
    pub fn active(cluster: Cluster, state: HibernationState) -> Self {
        Self {
            cluster,
            summary: Summary {
                status: state.summary(),
            },
            pg_control_data: ControlSnapshot::default(),
        }
    }

    /// Report for a cluster that only exists on its claims
    pub fn hibernated(cluster: Cluster, state: HibernationState, snapshot: ControlSnapshot) -> Self {
        let pg_control_data = if state == HibernationState::Hibernated {
            snapshot
        } else {
            ControlSnapshot::default()
        };
        Self {
            cluster,
            summary: Summary {
                status: state.summary(),
            },
            pg_control_data,
        }
    }

    pub fn status(&self) -> SummaryStatus {
        self.summary.status
    }

    /// Parse and validate a report in one step
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CoreError::InvalidReport {
            reason: e.to_string(),
        })
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::Serialization {
            message: e.to_string(),
        })
    }
}
