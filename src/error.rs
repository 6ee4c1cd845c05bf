//! Error types for proxmox-deploy-rs

use crate::storage::BackendKind;
use thiserror::Error;

/// Main error type for deployment operations
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Template render error: {0}")]
    TemplateRender(String),

    #[error("Image packaging failed ({tool}): {message}")]
    ImagePackaging { tool: String, message: String },

    #[error("Storage allocation failed on {kind} pool '{pool}': {message}")]
    StorageAllocation {
        kind: String,
        pool: String,
        message: String,
    },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Disk ordering violation: {0}")]
    Ordering(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Deployment cancelled by user")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Discriminant of [`DeployError`], for matching without inspecting messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    TemplateRender,
    ImagePackaging,
    StorageAllocation,
    Transfer,
    Verification,
    Api,
    Ordering,
    Cleanup,
    Cancelled,
    Config,
    Io,
    Parse,
}

impl DeployError {
    /// Create an image packaging error
    pub fn packaging(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ImagePackaging {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a storage allocation error
    pub fn allocation(kind: BackendKind, pool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageAllocation {
            kind: kind.to_string(),
            pool: pool.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::TemplateRender(_) => ErrorKind::TemplateRender,
            Self::ImagePackaging { .. } => ErrorKind::ImagePackaging,
            Self::StorageAllocation { .. } => ErrorKind::StorageAllocation,
            Self::Transfer(_) => ErrorKind::Transfer,
            Self::Verification(_) => ErrorKind::Verification,
            Self::Api(_) => ErrorKind::Api,
            Self::Ordering(_) => ErrorKind::Ordering,
            Self::Cleanup(_) => ErrorKind::Cleanup,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Yaml(_) | Self::Json(_) => ErrorKind::Parse,
        }
    }

    /// Whether this failure left the outcome of the in-flight remote command unknown
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_error_names_kind_and_pool() {
        let err = DeployError::allocation(BackendKind::LvmThin, "local-lvm", "insufficient space");
        assert_eq!(err.kind(), ErrorKind::StorageAllocation);

        let msg = err.to_string();
        assert!(msg.contains("lvmthin"));
        assert!(msg.contains("local-lvm"));
        assert!(msg.contains("insufficient space"));
    }

    #[test]
    fn test_interruption() {
        assert!(DeployError::Cancelled.is_interruption());
        assert!(DeployError::Connection("timed out".into()).is_interruption());
        assert!(!DeployError::Api("conflict".into()).is_interruption());
    }
}
