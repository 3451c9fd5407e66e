//! Dormant Kube - Kubernetes side of cluster hibernation
//!
//! This crate provides:
//! - **Object Store**: the calls the protocol makes against the API server, with
//!   a `kube`-backed implementation and an in-memory mock for tests
//! - **Resource Sweep**: deletion and confirmed absence of everything a cluster
//!   owns except its preserved claims, and re-creation of what resume renders
//! - **Hibernation**: state discovery and the `on` / `off` protocol
//! - **Status**: the typed hibernation report
//! - **Retry**: exponential backoff for transient store failures

pub mod config;
pub mod discovery;
pub mod error;
pub mod hibernation;
pub mod resources;
pub mod retry;
pub mod status;
pub mod store;
pub mod sweep;

pub use config::HibernationConfig;
pub use discovery::{Discovery, LiveCluster, StoredCluster, discover};
pub use error::{HibernateError, Result};
pub use hibernation::{HibernateOutcome, Hibernator};
pub use resources::{ObjectRef, RenderedObject, ResourceKind, RestorePolicy};
pub use retry::{RetryConfig, retry_transient, retry_with_backoff};
pub use status::StatusReporter;
pub use store::{Instance, KubeStore, MockObjectStore, ObjectStore, OperationCounts};
pub use sweep::{SweepEngine, SweepReport};
