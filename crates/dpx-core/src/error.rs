//! Domain-specific error types following panic-free policy.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Advertiser path cannot produce a sibling callback path
    #[error("Invalid advertiser path {path}: {reason}")]
    InvalidAdvertiserPath { path: PathBuf, reason: String },

    /// Invalid file name for a socket artifact
    #[error("Invalid socket file name '{name}': {reason}")]
    InvalidFileName { name: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
