//! CLI error types with exit code handling
//!
//! This module provides a unified error type for CLI operations that
//! maps errors to appropriate exit codes.

use miette::Diagnostic;
use thiserror::Error;

use dormant_kube::HibernateError;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// A hibernation operation failed
    #[error("{kind}: {message}")]
    #[diagnostic(code(dormant::cli::hibernate))]
    Hibernate {
        /// Stable error kind, also printed
        kind: &'static str,
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Configuration file or flag problem
    #[error("Configuration error: {message}")]
    #[diagnostic(code(dormant::cli::config))]
    Config {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// IO error while writing output
    #[error("IO error: {message}")]
    #[diagnostic(code(dormant::cli::io))]
    Io { message: String },

    /// Internal error (runtime, unexpected failure)
    #[error("Internal error: {message}")]
    #[diagnostic(code(dormant::cli::internal))]
    Internal { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Hibernate { kind, .. } => exit_codes::for_kind(kind),
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Internal { .. } => exit_codes::ERROR,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }
}

/// Next step for the user, by error kind
fn help_for(err: &HibernateError) -> Option<String> {
    let help = match err {
        HibernateError::TransientStore { .. } => {
            "the API server is unreachable or overloaded; rerun the same command"
        }
        HibernateError::NoHibernatedCluster { .. } => {
            "check the cluster name and namespace; `dormant hibernate status` shows what exists"
        }
        HibernateError::ClusterNotFound { .. } => {
            "check the cluster name and namespace (-n)"
        }
        HibernateError::FenceTimeout { .. } => {
            "the cluster stays fenced; rerun once its instances have stopped"
        }
        HibernateError::AnnotationNotPersisted { .. } => {
            "nothing was deleted; rerun the same command"
        }
        HibernateError::ClaimStillOwned { .. } => {
            "nothing was deleted; drop the claim's ownerReferences, then rerun the same command"
        }
        HibernateError::ManifestCorrupt { .. } => {
            "the claim annotation was modified outside of dormant; restore it before resuming"
        }
        HibernateError::Api(_) => "check your kubeconfig and access rights",
        _ => return None,
    };
    Some(help.to_string())
}

impl From<HibernateError> for CliError {
    fn from(err: HibernateError) -> Self {
        match err {
            HibernateError::InvalidConfig(message) => CliError::Config {
                help: Some("fix the configuration file or pass --config".to_string()),
                message,
            },
            err => CliError::Hibernate {
                kind: err.kind(),
                help: help_for(&err),
                message: err.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::internal(format!("JSON output: {}", err))
    }
}

impl From<serde_yaml::Error> for CliError {
    fn from(err: serde_yaml::Error) -> Self {
        CliError::internal(format!("YAML output: {}", err))
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
