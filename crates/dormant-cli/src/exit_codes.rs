//! Standard exit codes for CLI operations
//!
//! Every hibernation error kind has its own code so scripts can tell a
//! timeout from a missing cluster without parsing stderr. Codes outside the
//! 10-23 range follow sysexits.h.

/// Success - operation completed without errors
pub const SUCCESS: i32 = 0;

/// General error - Kubernetes API failure or unexpected condition
pub const ERROR: i32 = 1;

/// The object store stayed unavailable through every retry
pub const TRANSIENT_STORE: i32 = 10;

/// Swept objects still exist after the teardown timeout
pub const TEARDOWN_INCOMPLETE: i32 = 11;

/// The live cluster could not be serialized
pub const SERIALIZATION: i32 = 12;

/// A stored hibernation manifest does not decode
pub const MANIFEST_CORRUPT: i32 = 13;

/// No hibernated cluster to resume or report on
pub const NO_HIBERNATED_CLUSTER: i32 = 14;

/// The resumed cluster did not become ready in time
pub const READINESS_TIMEOUT: i32 = 15;

/// No live cluster to hibernate
pub const CLUSTER_NOT_FOUND: i32 = 16;

/// The cluster has no elected primary
pub const NO_PRIMARY: i32 = 17;

/// The primary lacks a storage claim for a requested role
pub const MISSING_STORAGE_CLAIMS: i32 = 18;

/// The observed objects match no state the operation can act on
pub const INCONSISTENT_STATE: i32 = 19;

/// A hibernation annotation did not read back identically
pub const ANNOTATION_NOT_PERSISTED: i32 = 20;

/// Instances kept running after fencing
pub const FENCE_TIMEOUT: i32 = 21;

/// The control data could not be captured
pub const CONTROL_DATA: i32 = 22;

/// A preserved claim is still owned by the cluster
pub const CLAIM_STILL_OWNED: i32 = 23;

/// Usage error - invalid arguments or options (following sysexits.h convention)
pub const USAGE_ERROR: i32 = 64;

/// IO error - writing the output failed
pub const IO_ERROR: i32 = 74;

/// Configuration error - unreadable or invalid configuration file
pub const CONFIG_ERROR: i32 = 78;

/// Exit code for a hibernation error kind
pub fn for_kind(kind: &str) -> i32 {
    match kind {
        "transient_store" => TRANSIENT_STORE,
        "teardown_incomplete" => TEARDOWN_INCOMPLETE,
        "serialization" => SERIALIZATION,
        "manifest_corrupt" => MANIFEST_CORRUPT,
        "no_hibernated_cluster" => NO_HIBERNATED_CLUSTER,
        "readiness_timeout" => READINESS_TIMEOUT,
        "cluster_not_found" => CLUSTER_NOT_FOUND,
        "no_primary" => NO_PRIMARY,
        "missing_storage_claims" => MISSING_STORAGE_CLAIMS,
        "inconsistent_state" => INCONSISTENT_STATE,
        "annotation_not_persisted" => ANNOTATION_NOT_PERSISTED,
        "fence_timeout" => FENCE_TIMEOUT,
        "control_data" => CONTROL_DATA,
        "claim_still_owned" => CLAIM_STILL_OWNED,
        "invalid_config" => CONFIG_ERROR,
        _ => ERROR,
    }
}
