//! Storage claims and their roles

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::annotations::{
    CLUSTER_MANIFEST_ANNOTATION, PG_CONTROL_DATA_ANNOTATION, has_hibernation_annotations,
};

/// What an instance uses a durable volume for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClaimRole {
    /// The data directory
    PgData,
    /// The dedicated write-ahead log volume
    PgWal,
    /// Any deployment-specific role (tablespaces and the like)
    Other(String),
}

impl ClaimRole {
    /// Value of the role label on the claim
    pub fn label_value(&self) -> &str {
        match self {
            Self::PgData => "PG_DATA",
            Self::PgWal => "PG_WAL",
            Self::Other(role) => role,
        }
    }

    pub fn from_label(value: &str) -> Self {
        match value {
            "PG_DATA" => Self::PgData,
            "PG_WAL" => Self::PgWal,
            other => Self::Other(other.to_string()),
        }
    }

    /// Conventional claim name for this role on `instance`
    pub fn claim_name(&self, instance: &str) -> String {
        match self {
            Self::PgData => instance.to_string(),
            Self::PgWal => format!("{}-wal", instance),
            Self::Other(role) => format!("{}-{}", instance, role.to_lowercase().replace('_', "-")),
        }
    }
}

impl fmt::Display for ClaimRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_value())
    }
}

/// A durable volume bound to one instance
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClaim {
    pub name: String,

    /// Server-assigned identity, stable across hibernation
    #[serde(default)]
    pub uid: Option<String>,

    /// Role from the role label, if labelled
    #[serde(default)]
    pub role: Option<ClaimRole>,

    /// Owning instance from the instance label, if labelled
    #[serde(default)]
    pub instance: Option<String>,

    /// Name of the controlling owner reference, if any
    ///
    /// An owned claim is garbage collected together with its owner.
    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl StorageClaim {
    /// Role of this claim when it belongs to `instance`
    ///
    /// Labels win; unlabelled claims are matched by the naming convention.
    pub fn role_for(&self, instance: &str) -> Option<ClaimRole> {
        match (&self.instance, &self.role) {
            (Some(owner), Some(role)) => (owner == instance).then(|| role.clone()),
            (Some(owner), None) if owner != instance => None,
            _ => [ClaimRole::PgData, ClaimRole::PgWal]
                .into_iter()
                .find(|role| role.claim_name(instance) == self.name)
                .or_else(|| self.role.clone().filter(|r| r.claim_name(instance) == self.name)),
        }
    }

    pub fn is_hibernated(&self) -> bool {
        has_hibernation_annotations(&self.annotations)
    }

    pub fn manifest(&self) -> Option<&str> {
        self.annotations
            .get(CLUSTER_MANIFEST_ANNOTATION)
            .map(String::as_str)
    }

    pub fn control_data(&self) -> Option<&str> {
        self.annotations
            .get(PG_CONTROL_DATA_ANNOTATION)
            .map(String::as_str)
    }
}

/// Claims of `instance`, one per requested role
///
/// Returns the roles that have no claim as the error.
pub fn instance_claims<'a>(
    claims: &'a [StorageClaim],
    instance: &str,
    roles: &[ClaimRole],
) -> std::result::Result<Vec<&'a StorageClaim>, Vec<ClaimRole>> {
    let mut found = Vec::with_capacity(roles.len());
    let mut missing = Vec::new();

    for role in roles {
        match claims
            .iter()
            .find(|c| c.role_for(instance).as_ref() == Some(role))
        {
            Some(claim) => found.push(claim),
            None => missing.push(role.clone()),
        }
    }

    if missing.is_empty() {
        Ok(found)
    } else {
        Err(missing)
    }
}
