//! Dormant Core - Types shared by every hibernation operation
//!
//! This crate holds the pieces that need no API server:
//! - `Cluster`: The database cluster custom resource
//! - `StorageClaim` / `ClaimRole`: Durable volumes and what they hold
//! - `manifest`: Encoding a cluster into its hibernation manifest and back
//! - `StatusReport`: The structured hibernation status document

pub mod annotations;
pub mod claim;
pub mod cluster;
pub mod error;
pub mod manifest;
pub mod report;

pub use claim::{ClaimRole, StorageClaim, instance_claims};
pub use cluster::{Cluster, ClusterRef, ClusterSpec, ClusterStatus, StorageConfiguration};
pub use error::{CoreError, Result};
pub use manifest::{ControlSnapshot, HibernationManifest, decode, encode, restorable};
pub use report::{HibernationState, StatusReport, Summary, SummaryStatus};
