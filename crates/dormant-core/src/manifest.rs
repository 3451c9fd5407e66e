//! Hibernation manifest codec
//!
//! A hibernated cluster is rebuilt from a single annotation value: the JSON
//! form of its `Cluster` object. Encoding drops server-managed bookkeeping as
//! well as the fencing and resume annotations left behind by earlier cycles, so
//! the manifest written on the claims is exactly what resume needs and nothing
//! that would stop the resumed instances from starting.
//!
//! The control snapshot that travels next to it is opaque: it is stored and
//! shown, never parsed.

use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::annotations::{FENCED_INSTANCES_ANNOTATION, RESUMING_ANNOTATION};
use crate::cluster::Cluster;
use crate::error::{CoreError, Result};

/// Serialized cluster definition, as stored in the manifest annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HibernationManifest(String);

impl HibernationManifest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for HibernationManifest {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HibernationManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw control metadata captured from the database engine
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlSnapshot(String);

impl ControlSnapshot {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ControlSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a cluster into its hibernation manifest
#[must_use = "the encoded manifest should be stored"]
pub fn encode(cluster: &Cluster) -> Result<HibernationManifest> {
    if cluster.metadata.name.as_deref().is_none_or(str::is_empty) {
        return Err(CoreError::Serialization {
            message: "cluster has no name".to_string(),
        });
    }
    if cluster.metadata.namespace.as_deref().is_none_or(str::is_empty) {
        return Err(CoreError::Serialization {
            message: format!("cluster '{}' has no namespace", cluster.name_any()),
        });
    }

    let mut cluster = cluster.clone();
    cluster.metadata.managed_fields = None;
    cluster.metadata.resource_version = None;
    strip_protocol_annotations(&mut cluster);

    serde_json::to_string(&cluster)
        .map(HibernationManifest)
        .map_err(|e| CoreError::Serialization {
            message: e.to_string(),
        })
}

/// Parse a hibernation manifest back into a cluster
#[must_use = "the decoded cluster should be used"]
pub fn decode(raw: &str) -> Result<Cluster> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| CoreError::corrupt(e.to_string()))?;

    let expected_kind = Cluster::kind(&());
    let kind = value.get("kind").and_then(|k| k.as_str());
    if kind != Some(&*expected_kind) {
        return Err(CoreError::corrupt(format!(
            "expected kind '{}', found {:?}",
            expected_kind, kind
        )));
    }
    let expected_api_version = Cluster::api_version(&());
    let api_version = value.get("apiVersion").and_then(|v| v.as_str());
    if api_version != Some(&*expected_api_version) {
        return Err(CoreError::corrupt(format!(
            "expected apiVersion '{}', found {:?}",
            expected_api_version, api_version
        )));
    }

    let cluster: Cluster =
        serde_json::from_value(value).map_err(|e| CoreError::corrupt(e.to_string()))?;

    if cluster.metadata.name.as_deref().is_none_or(str::is_empty) {
        return Err(CoreError::corrupt("manifest has no cluster name"));
    }

    Ok(cluster)
}

/// Turn a decoded cluster into an object the API server will accept as new
///
/// Server-assigned identity, ownership and observed status are dropped; labels,
/// user annotations and the whole spec are kept.
pub fn restorable(mut cluster: Cluster) -> Cluster {
    let meta = &mut cluster.metadata;
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    meta.finalizers = None;
    meta.self_link = None;
    cluster.status = None;
    strip_protocol_annotations(&mut cluster);
    cluster
}

fn strip_protocol_annotations(cluster: &mut Cluster) {
    if let Some(annotations) = cluster.metadata.annotations.as_mut() {
        annotations.remove(FENCED_INSTANCES_ANNOTATION);
        annotations.remove(RESUMING_ANNOTATION);
        if annotations.is_empty() {
            cluster.metadata.annotations = None;
        }
    }
}
