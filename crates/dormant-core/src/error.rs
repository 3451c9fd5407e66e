//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// The in-memory cluster could not be turned into a manifest
    #[error("cannot serialize cluster manifest: {message}")]
    Serialization { message: String },

    /// A stored manifest does not parse back into a cluster definition
    #[error("hibernation manifest is corrupt: {reason}")]
    ManifestCorrupt { reason: String },

    /// A status report does not match the published shape
    #[error("invalid status report: {reason}")]
    InvalidReport { reason: String },
}

impl CoreError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::ManifestCorrupt {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
