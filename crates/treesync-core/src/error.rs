//! Domain error types
//!
//! Errors raised while validating paths and endpoints before any I/O happens.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Relative path is empty or resolves to the sync root itself
    #[error("Empty path")]
    EmptyPath,

    /// Relative path contains a `..` component or another escape attempt
    #[error("Path escapes sync root: {0}")]
    PathOutsideRoot(String),

    /// Relative path contains a component that is not valid on this platform
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Relative path passes through a symbolic link inside the sync root
    #[error("Path crosses a symlink: {0}")]
    SymlinkInPath(String),

    /// Server address could not be turned into a WebSocket endpoint
    #[error("Invalid server address '{address}': {reason}")]
    InvalidEndpoint {
        /// The address as given by the user
        address: String,
        /// Why it was rejected
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::PathOutsideRoot("../etc/passwd".to_string());
        assert_eq!(err.to_string(), "Path escapes sync root: ../etc/passwd");

        let err = DomainError::SymlinkInPath("link/key".to_string());
        assert_eq!(err.to_string(), "Path crosses a symlink: link/key");

        let err = DomainError::InvalidEndpoint {
            address: "::".to_string(),
            reason: "empty host".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid server address '::': empty host"
        );
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidPath("a:b".to_string());
        let err2 = DomainError::InvalidPath("a:b".to_string());
        let err3 = DomainError::EmptyPath;

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
