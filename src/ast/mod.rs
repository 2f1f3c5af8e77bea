//! Asynchronous callbacks ("ASTs").
//!
//! Every lock names an [`AstTarget`] when it is created, and the owner of the
//! lock (a [`LockServer`](crate::server::LockServer) or a
//! [`LockClient`](crate::client::LockClient)) dispatches the three callback
//! kinds through [`AstHandler`] by that target.

pub mod pool;

use crate::error::Result;
use crate::lock::LockRef;
use crate::types::{LockDesc, LockFlags};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

pub use pool::{BlockingPool, BlockingWork, BlockingWorker};

/// Who receives a lock's callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstTarget {
    /// A client reached through the lock's export.
    Remote,
    /// A lock the server took for itself.
    Local,
    /// A client-side lock; callbacks come from the server.
    Client,
}

/// Result of sending a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstOutcome {
    Done,
    /// The lock set changed under the caller; rescan the resource.
    Restart,
}

/// Why a blocking callback runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockingEvent {
    /// A conflicting request, described if known.
    Blocking(Option<LockDesc>),
    /// The lock itself is being cancelled.
    Canceling,
}

/// Callback kind, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstKind {
    Blocking,
    Completion,
    Glimpse,
}

impl AstKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AstKind::Blocking => "blocking",
            AstKind::Completion => "completion",
            AstKind::Glimpse => "glimpse",
        }
    }
}

impl fmt::Display for AstKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends or runs the callbacks for one side.
#[async_trait]
pub trait AstHandler: Send + Sync {
    /// Tell the holder of `lock` that someone wants a conflicting lock.
    async fn blocking_ast(&self, lock: &LockRef, event: BlockingEvent) -> AstOutcome;

    /// Tell the requester that `lock` was granted or changed.
    async fn completion_ast(&self, lock: &LockRef, flags: LockFlags) -> AstOutcome;

    /// Ask the holder of `lock` for its current value block.
    async fn glimpse_ast(&self, lock: &LockRef) -> Result<Option<Bytes>>;
}
