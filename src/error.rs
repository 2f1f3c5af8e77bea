//! Error types for the Strata lock manager.
//!
//! This module provides a unified error type [`DlmError`] for all lock manager
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Protocol**: malformed requests (bad mode, bad type, type/policy mismatch).
//!   Rejected before any state is touched.
//! - **Resource exhaustion**: the namespace lock limit was hit. Retryable.
//! - **Stale handles**: a handle no longer resolves to a live lock.
//! - **Peer**: the export was evicted or the connection is gone.
//! - **Configuration**: invalid tunables.
//!
//! Peer unresponsiveness during callbacks is deliberately *not* an error: the
//! callback dispatcher reports it as [`AstOutcome::Restart`](crate::ast::AstOutcome)
//! after scheduling the eviction.
//!
//! # Example
//!
//! ```rust
//! use strata_dlm::error::{DlmError, Result};
//! use strata_dlm::types::LockMode;
//!
//! fn parse_mode(bits: u32) -> Result<LockMode> {
//!     LockMode::from_bits(bits)
//! }
//!
//! let err = parse_mode(0).unwrap_err();
//! assert_eq!(err.to_errno(), libc::EINVAL);
//! assert!(!err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

use crate::rpc::RpcError;

/// Main error type for lock manager operations.
#[derive(Error, Debug)]
pub enum DlmError {
    // Request validation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Lock lookups
    #[error("No such lock: {0}")]
    NoSuchLock(String),

    #[error("Stale lock handle: {0}")]
    Stale(String),

    #[error("Lock has no data for glimpse")]
    NoLockData,

    #[error("Conversion refused: {0}")]
    Deadlock(String),

    #[error("Lock failed: {0}")]
    LockFailed(String),

    // Capacity
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Busy: {0}")]
    Busy(String),

    // Peer and network
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Remote returned status {0}")]
    Remote(i32),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DlmError {
    /// Convert to the POSIX errno carried in rejection replies.
    pub fn to_errno(&self) -> i32 {
        match self {
            DlmError::InvalidArgument(_) | DlmError::NoSuchLock(_) => libc::EINVAL,
            DlmError::Protocol(_) => libc::EPROTO,
            DlmError::Stale(_) => libc::ESTALE,
            DlmError::NoLockData => libc::ENODATA,
            DlmError::Deadlock(_) => libc::EDEADLK,
            DlmError::LockFailed(_) => libc::EIO,
            DlmError::OutOfMemory(_) => libc::ENOMEM,
            DlmError::Busy(_) => libc::EBUSY,
            DlmError::NotConnected(_) => libc::ENOTCONN,
            DlmError::Timeout(_) => libc::ETIMEDOUT,
            DlmError::Interrupted(_) => libc::EINTR,
            DlmError::Remote(status) => *status,
            DlmError::Config(_) | DlmError::InvalidConfig { .. } => libc::EINVAL,
            DlmError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Rebuild an error from a reply status.
    pub fn from_status(status: i32) -> Self {
        match status {
            libc::EINVAL => DlmError::InvalidArgument("rejected by peer".into()),
            libc::EPROTO => DlmError::Protocol("rejected by peer".into()),
            libc::ESTALE => DlmError::Stale("no lock found by peer".into()),
            libc::ENODATA => DlmError::NoLockData,
            libc::EDEADLK => DlmError::Deadlock("conversion refused by peer".into()),
            libc::ENOMEM => DlmError::OutOfMemory("peer out of locks".into()),
            libc::ENOTCONN => DlmError::NotConnected("peer dropped the connection".into()),
            libc::ETIMEDOUT => DlmError::Timeout(0),
            libc::EINTR => DlmError::Interrupted("peer request interrupted".into()),
            libc::EIO => DlmError::LockFailed("peer reported I/O error".into()),
            other => DlmError::Remote(other),
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DlmError::OutOfMemory(_) | DlmError::Timeout(_) | DlmError::NotConnected(_)
        )
    }
}

impl From<RpcError> for DlmError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Timeout => DlmError::Timeout(0),
            RpcError::Interrupted => DlmError::Interrupted("request interrupted".into()),
            RpcError::NotConnected => DlmError::NotConnected("transport disconnected".into()),
            RpcError::NoLockData => DlmError::NoLockData,
            RpcError::Status(status) => DlmError::from_status(status),
        }
    }
}

impl From<serde_json::Error> for DlmError {
    fn from(e: serde_json::Error) -> Self {
        DlmError::Serialization(e.to_string())
    }
}

/// Result type alias for lock manager operations.
pub type Result<T> = std::result::Result<T, DlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(DlmError::Protocol("x".into()).to_errno(), libc::EPROTO);
        assert_eq!(DlmError::Stale("x".into()).to_errno(), libc::ESTALE);
        assert_eq!(DlmError::Deadlock("x".into()).to_errno(), libc::EDEADLK);
        assert_eq!(DlmError::NoSuchLock("x".into()).to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_status_round_trip_keeps_category() {
        let err = DlmError::from_status(DlmError::NotConnected("gone".into()).to_errno());
        assert!(matches!(err, DlmError::NotConnected(_)));
        assert!(err.is_retryable());

        let err = DlmError::from_status(libc::EPERM);
        assert!(matches!(err, DlmError::Remote(s) if s == libc::EPERM));
    }

    #[test]
    fn test_rpc_error_conversion() {
        let err: DlmError = RpcError::NoLockData.into();
        assert!(matches!(err, DlmError::NoLockData));

        let err: DlmError = RpcError::Status(libc::ESTALE).into();
        assert!(matches!(err, DlmError::Stale(_)));
    }
}
