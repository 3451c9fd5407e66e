//! Annotation and label keys shared by hibernate on, off and status
//!
//! The two hibernation keys are a persistence contract: a cluster hibernated by
//! one release must be resumable by any later one, so their values never change.

use std::collections::BTreeMap;

/// Serialized cluster definition, written on each preserved claim
pub const CLUSTER_MANIFEST_ANNOTATION: &str = "cnpg.io/hibernateClusterManifest";

/// Raw `pg_controldata` output captured at hibernation time
pub const PG_CONTROL_DATA_ANNOTATION: &str = "cnpg.io/hibernatePgControlData";

/// JSON list of fenced instance names, `["*"]` for all of them
pub const FENCED_INSTANCES_ANNOTATION: &str = "cnpg.io/fencedInstances";

/// Set on a cluster recreated by hibernate off until it first reports ready
///
/// The value names the claim whose manifest the cluster was recreated from.
pub const RESUMING_ANNOTATION: &str = "dormant.io/resuming";

/// Storage role of a claim
pub const PVC_ROLE_LABEL: &str = "cnpg.io/pvcRole";

/// Instance a claim or pod belongs to
pub const INSTANCE_NAME_LABEL: &str = "cnpg.io/instanceName";

/// Both hibernation annotations are present and non-empty
pub fn has_hibernation_annotations(annotations: &BTreeMap<String, String>) -> bool {
    [CLUSTER_MANIFEST_ANNOTATION, PG_CONTROL_DATA_ANNOTATION]
        .iter()
        .all(|key| annotations.get(*key).is_some_and(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_hibernation_annotations() {
        let mut annotations = BTreeMap::new();
        assert!(!has_hibernation_annotations(&annotations));

        annotations.insert(CLUSTER_MANIFEST_ANNOTATION.to_string(), "{}".to_string());
        assert!(!has_hibernation_annotations(&annotations));

        annotations.insert(PG_CONTROL_DATA_ANNOTATION.to_string(), String::new());
        assert!(!has_hibernation_annotations(&annotations));

        annotations.insert(
            PG_CONTROL_DATA_ANNOTATION.to_string(),
            "pg_control version number: 1300".to_string(),
        );
        assert!(has_hibernation_annotations(&annotations));
    }
}
