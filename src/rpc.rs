//! Lock manager messages and the transport they travel over.
//!
//! The lock manager does not encode anything itself: it hands these message
//! structs to a [`Transport`] and gets replies back. Servers hold one transport
//! per export (the reverse channel used for callbacks); clients hold one to
//! their server.

use crate::types::{LockDesc, LockFlags, LockHandle, PolicyData, ResourceId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Largest request the transport accepts.
pub const MAX_REQUEST_SIZE: usize = 5 * 1024;
/// Requests must also fit a page minus transport overhead.
const PAGE_BUDGET: usize = 4096 - 512;
/// Fixed size of a lock request before any extra handles.
pub const LOCK_REQUEST_SIZE: usize = 256;
/// Size of one packed handle.
const HANDLE_SIZE: usize = 8;
/// Handles that fit in the fixed part of a lock request.
const INLINE_HANDLES: usize = 2;
/// Handle slots an enqueue reserves for its own lock.
pub const ENQUEUE_CANCEL_OFFSET: usize = 1;

/// How many cancel handles fit in one request of `req_size` bytes, after
/// reserving `offset` slots.
pub fn cancel_handles_avail(req_size: usize, offset: usize) -> usize {
    let budget = MAX_REQUEST_SIZE.min(PAGE_BUDGET);
    (budget.saturating_sub(req_size) / HANDLE_SIZE + INLINE_HANDLES).saturating_sub(offset)
}

/// Transport-level failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,

    #[error("request interrupted")]
    Interrupted,

    #[error("peer not connected")]
    NotConnected,

    #[error("peer has no data for the lock")]
    NoLockData,

    #[error("peer returned status {0}")]
    Status(i32),
}

impl RpcError {
    /// The peer did not answer, as opposed to answering with an error.
    pub fn is_unresponsive(&self) -> bool {
        matches!(self, RpcError::Timeout | RpcError::Interrupted | RpcError::NotConnected)
    }

    /// Map a reply status to a transport error.
    pub fn from_status(status: i32) -> Self {
        match status {
            libc::ETIMEDOUT => RpcError::Timeout,
            libc::EINTR => RpcError::Interrupted,
            libc::ENOTCONN => RpcError::NotConnected,
            libc::ENODATA => RpcError::NoLockData,
            other => RpcError::Status(other),
        }
    }
}

impl From<&crate::error::DlmError> for RpcError {
    fn from(e: &crate::error::DlmError) -> Self {
        RpcError::from_status(e.to_errno())
    }
}

/// Server lock-volume hint piggy-backed on replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolHint {
    pub slv: u64,
    pub limit: u32,
}

/// Request for a lock. Mode and type travel raw so the server validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub resource: ResourceId,
    pub lock_type: u32,
    pub mode: u32,
    pub policy: PolicyData,
    pub flags: LockFlags,
    /// The requester's own handle for the lock.
    pub handle: LockHandle,
    /// Handles the requester cancels along with this enqueue.
    pub cancels: Vec<LockHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReply {
    /// The server's handle for the lock.
    pub handle: LockHandle,
    pub desc: LockDesc,
    pub flags: LockFlags,
    pub lvb: Option<Bytes>,
    pub pool: PoolHint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertRequest {
    pub handle: LockHandle,
    pub mode: u32,
    pub flags: LockFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertReply {
    pub flags: LockFlags,
    pub pool: PoolHint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub handles: Vec<LockHandle>,
}

/// Blocking, completion and glimpse callbacks share one body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstRequest {
    /// Handle of the lock on the receiving side.
    pub handle: LockHandle,
    /// Conflicting request for blocking callbacks, the granted lock otherwise.
    pub desc: LockDesc,
    pub flags: LockFlags,
    pub lvb: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DlmRequest {
    Enqueue(EnqueueRequest),
    Convert(ConvertRequest),
    Cancel(CancelRequest),
    Blocking(AstRequest),
    Completion(AstRequest),
    Glimpse(AstRequest),
}

impl DlmRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DlmRequest::Enqueue(_) => "enqueue",
            DlmRequest::Convert(_) => "convert",
            DlmRequest::Cancel(_) => "cancel",
            DlmRequest::Blocking(_) => "blocking",
            DlmRequest::Completion(_) => "completion",
            DlmRequest::Glimpse(_) => "glimpse",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DlmReply {
    Enqueue(EnqueueReply),
    Convert(ConvertReply),
    Cancel { pool: PoolHint },
    Glimpse { lvb: Option<Bytes> },
    Ack,
}

impl DlmReply {
    pub fn pool(&self) -> Option<PoolHint> {
        match self {
            DlmReply::Enqueue(r) => Some(r.pool),
            DlmReply::Convert(r) => Some(r.pool),
            DlmReply::Cancel { pool } => Some(*pool),
            _ => None,
        }
    }
}

pub type RpcResult = std::result::Result<DlmReply, RpcError>;

/// Send primitives the lock manager consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send and wait for the reply, bounded by `timeout`.
    async fn send_and_wait(&self, request: DlmRequest, timeout: Duration) -> RpcResult;

    /// Send without waiting. The reply, if anyone cares, arrives on the receiver.
    fn send_async(&self, request: DlmRequest, timeout: Duration) -> oneshot::Receiver<RpcResult>;

    /// Connection generation; bumps on every reconnect.
    fn generation(&self) -> u64 {
        0
    }

    /// Whether requests can currently be sent at all.
    fn is_valid(&self) -> bool {
        true
    }

    /// Tear down the connection after an eviction.
    fn disconnect(&self) {}

    /// Ask the connection to reconnect and replay.
    fn start_recovery(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_handles_avail() {
        let plain = cancel_handles_avail(LOCK_REQUEST_SIZE, 0);
        assert_eq!(plain, (3584 - 256) / 8 + 2);
        assert_eq!(
            cancel_handles_avail(LOCK_REQUEST_SIZE, ENQUEUE_CANCEL_OFFSET),
            plain - 1
        );
        assert_eq!(cancel_handles_avail(usize::MAX, 5), 0);
    }

    #[test]
    fn test_rpc_error_from_status() {
        assert_eq!(RpcError::from_status(libc::ETIMEDOUT), RpcError::Timeout);
        assert!(RpcError::from_status(libc::ENOTCONN).is_unresponsive());
        assert!(!RpcError::from_status(libc::EINVAL).is_unresponsive());
    }
}
