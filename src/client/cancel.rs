//! Client-side cancellation.
//!
//! Cancelling a client lock has two halves: the local half unlinks and
//! destroys the lock right away, the remote half tells the server, packing
//! as many handles into one cancel request as fit. Locks the server is
//! actively waiting for (BL_AST) may be sent on their own so a large batch
//! never delays them.

use super::lru::{self, LruFlags};
use super::LockClient;
use crate::ast::{AstHandler, BlockingEvent};
use crate::error::{DlmError, Result};
use crate::lock::LockRef;
use crate::resource::Resource;
use crate::rpc::{CancelRequest, DlmRequest, RpcError};
use crate::types::{LockFlags, LockHandle, LockMode, LockType, PolicyData};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error};

/// What a local cancel leaves for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Nothing; the server is not to be told.
    LocalOnly,
    /// Send a cancel, batched with others.
    Canceling,
    /// Send a cancel; the server is blocked on it.
    BlAst,
}

impl LockClient {
    /// Cancel `lock` locally. The caller must already own its CANCELING flag.
    pub(crate) async fn cancel_local(&self, lock: &LockRef) -> CancelKind {
        debug!(lock = %lock.debug(), "client-side cancel");
        let flags = {
            let mut state = lock.state();
            // No new references from here on.
            state.flags.insert(LockFlags::CBPENDING);
            state.flags
        };
        self.blocking_ast(lock, BlockingEvent::Canceling).await;
        let kind = if flags.intersects(LockFlags::LOCAL_ONLY | LockFlags::CANCEL_ON_BLOCK) {
            debug!(handle = %lock.handle(), "not sending cancel, at caller's instruction");
            CancelKind::LocalOnly
        } else if flags.contains(LockFlags::BL_AST) {
            CancelKind::BlAst
        } else {
            CancelKind::Canceling
        };
        self.finish_cancel(lock);
        kind
    }

    /// Unlink and destroy a lock whose CANCELING flag the caller owns.
    pub(crate) fn finish_cancel(&self, lock: &LockRef) {
        lock.with_res_and_lock(|res, state| res.unlink(lock, state));
        self.ns.destroy(lock);
        self.counters.cancels.fetch_add(1, Ordering::Relaxed);
    }

    /// Cancel `locks` locally. Returns the ones the server still has to be
    /// told about. Without BL_AST in `flags`, locks the server waits for are
    /// sent at once in their own request.
    pub(crate) async fn cancel_list_local(
        &self,
        locks: Vec<LockRef>,
        flags: LockFlags,
    ) -> Vec<LockRef> {
        let mut batched = Vec::with_capacity(locks.len());
        let mut separate = Vec::new();
        for lock in locks {
            let kind = if flags.contains(LockFlags::LOCAL_ONLY) {
                self.finish_cancel(&lock);
                CancelKind::LocalOnly
            } else {
                self.cancel_local(&lock).await
            };
            match kind {
                CancelKind::LocalOnly => {}
                CancelKind::BlAst if !flags.contains(LockFlags::BL_AST) => {
                    debug!(handle = %lock.handle(), "cancel lock separately");
                    separate.push(lock);
                }
                _ => batched.push(lock),
            }
        }
        if !separate.is_empty() {
            self.cancel_list(separate, LockFlags::empty()).await;
        }
        batched
    }

    /// Handles per cancel request.
    pub(crate) fn cancel_batch(&self) -> usize {
        if !self.connect.cancelset {
            return 1;
        }
        let avail = crate::rpc::cancel_handles_avail(crate::rpc::LOCK_REQUEST_SIZE, 0);
        match self.config().ast.max_cancel_batch {
            Some(max) => avail.min(max.max(1)),
            None => avail.max(1),
        }
    }

    /// Tell the server about locally cancelled `locks`, in as few requests
    /// as the batch size allows. Failures are logged; the locks are gone
    /// locally either way.
    pub(crate) async fn cancel_list(&self, locks: Vec<LockRef>, flags: LockFlags) {
        let batch = self.cancel_batch();
        for chunk in locks.chunks(batch) {
            let handles: Vec<LockHandle> = chunk.iter().map(|l| l.remote_handle()).collect();
            if let Err(e) = self.cancel_req(handles, flags).await {
                error!(count = chunk.len(), error = %e, "cancel request failed");
            }
        }
    }

    /// Send one cancel request. Returns how many handles it carried.
    ///
    /// A stale reply means client and server were out of sync and is not an
    /// error. A timeout is retried once unless the connection was replaced
    /// meanwhile.
    pub(crate) async fn cancel_req(&self, handles: Vec<LockHandle>, flags: LockFlags) -> Result<usize> {
        let count = handles.len();
        if count == 0 {
            return Ok(0);
        }
        let timeout = self.config().rq_timeout();
        let mut retried = false;
        loop {
            if !self.transport.is_valid() {
                debug!(count, "skipping cancel on invalid connection");
                return Ok(count);
            }
            let generation = self.transport.generation();
            let request = DlmRequest::Cancel(CancelRequest {
                handles: handles.clone(),
            });
            self.counters.cancel_rpcs.fetch_add(1, Ordering::Relaxed);
            if flags.contains(LockFlags::ASYNC) {
                drop(self.transport.send_async(request, timeout));
                return Ok(count);
            }
            match self.transport.send_and_wait(request, timeout).await {
                Ok(reply) => {
                    self.update_pool(reply.pool());
                    return Ok(count);
                }
                Err(RpcError::Status(status)) if status == libc::ESTALE => {
                    debug!(count, "client and server out of sync, not fatal");
                    return Ok(count);
                }
                Err(RpcError::Timeout) if !retried && generation == self.transport.generation() => {
                    debug!(count, "cancel timed out, resending");
                    retried = true;
                }
                Err(e) => {
                    error!(count, error = %e, "cancel request failed, canceling anyway");
                    return Err(DlmError::from(e));
                }
            }
        }
    }

    /// Claim the unused granted locks of `res` that conflict with `mode`
    /// (every unused lock when `mode` is `None`), marking them
    /// CBPENDING|CANCELING plus `lock_flags`.
    pub(crate) fn cancel_resource_local(
        &self,
        res: &Arc<Resource>,
        policy: Option<&PolicyData>,
        mode: Option<LockMode>,
        lock_flags: LockFlags,
    ) -> Vec<LockRef> {
        let state = res.state();
        let mut claimed = Vec::new();
        for lock in &state.granted {
            let mut ls = lock.state();
            if !ls.is_unused() {
                continue;
            }
            if ls.flags.intersects(LockFlags::BL_AST | LockFlags::CANCELING) {
                continue;
            }
            if let (Some(mode), Some(granted)) = (mode, ls.granted_mode) {
                if granted.is_compatible(mode) {
                    continue;
                }
            }
            if let (LockType::Ibits, Some(PolicyData::Ibits { bits }), PolicyData::Ibits { bits: held }) =
                (res.lock_type(), policy, &ls.policy)
            {
                if bits & held == 0 {
                    continue;
                }
            }
            ls.flags
                .insert(LockFlags::CBPENDING | LockFlags::CANCELING | lock_flags);
            claimed.push(lock.clone());
        }
        claimed
    }

    /// Take locks out of the unused cache per `flags` and cancel them
    /// locally. Returns the locks still to be reported to the server.
    pub(crate) async fn cancel_lru_local(
        &self,
        count: usize,
        max: usize,
        flags: LruFlags,
        cancel_flags: LockFlags,
    ) -> Vec<LockRef> {
        let observer = self.observer.as_deref();
        let selected = lru::select(&self.ns, count, max, flags, observer);
        if selected.is_empty() {
            return selected;
        }
        crate::observability::record_lru_cancel(selected.len());
        self.counters
            .lru_cancels
            .fetch_add(selected.len() as u64, Ordering::Relaxed);
        self.cancel_list_local(selected, cancel_flags).await
    }

    /// Scan policy used for cancels piggy-backed on other requests.
    pub(crate) fn elc_policy(&self) -> LruFlags {
        if self.ns.lru_resize() {
            LruFlags::LRUR
        } else {
            LruFlags::AGED
        }
    }
}
