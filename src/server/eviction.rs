//! Eviction of unresponsive clients.
//!
//! The waiting-lock timer only moves expired locks onto a handoff list; this
//! worker drains that list and evicts the clients holding them, since tearing
//! down an export cancels locks and sends callbacks.

use super::waiting::WaitingLocks;
use super::LockServer;
use crate::export::Export;
use crate::observability;
use crate::resource::Resource;
use crate::shutdown::ShutdownCoordinator;
use crate::types::LockFlags;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Eviction task: drain the expired list each time the timer signals.
pub(crate) async fn run(
    server: Weak<LockServer>,
    waiting: Arc<WaitingLocks>,
    shutdown: ShutdownCoordinator,
) {
    loop {
        tokio::select! {
            _ = waiting.expired_notified() => {}
            _ = shutdown.wait_for_shutdown() => break,
        }
        let Some(server) = server.upgrade() else {
            break;
        };
        server.drain_expired().await;
    }
    debug!("eviction worker stopped");
}

impl LockServer {
    /// Evict the client of every expired lock. Returns how many exports
    /// were evicted.
    ///
    /// A lock cancelled between leaving the expired list and being looked
    /// at here was answered in time; its client is left alone.
    pub async fn drain_expired(&self) -> usize {
        if self.waiting.take_dump_request() {
            self.dump.dump("lock callback timeout", &self.ns);
        }
        let mut evicted = 0;
        while let Some(lock) = self.waiting.pop_expired() {
            if lock.has_flags(LockFlags::CANCELING | LockFlags::DESTROYED)
                || !self.ns.handles().is_live(lock.handle(), &lock)
            {
                debug!(handle = %lock.handle(), "expired lock already cancelled");
                continue;
            }
            let Some(export) = lock.export() else {
                warn!(lock = %lock.debug(), "expired lock has no export");
                continue;
            };
            if self.evict_export(&export).await {
                evicted += 1;
            }
        }
        if evicted > 0 && self.config().diagnostics.dump_on_eviction {
            self.dump.dump("eviction", &self.ns);
        }
        evicted
    }

    /// Fail `export`, drop its connection and cancel every lock it holds.
    /// Only the first call for an export does anything.
    pub async fn evict_export(&self, export: &Arc<Export>) -> bool {
        if !export.fail() {
            debug!(export = %export.id(), "export already evicted");
            return false;
        }
        error!(
            export = %export.id(),
            client = export.client(),
            locks = export.lock_count(),
            "evicting client"
        );
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        observability::record_eviction();
        export.transport().disconnect();

        let mut resources: Vec<Arc<Resource>> = Vec::new();
        for lock in export.held_locks() {
            let res = lock.resource();
            if self.cancel_lock(&lock) && !resources.iter().any(|r| Arc::ptr_eq(r, &res)) {
                resources.push(res);
            }
        }
        for res in resources {
            self.reprocess(&res).await;
            self.ns.reclaim(&res);
        }
        self.exports.write().remove(&export.id());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DlmConfig;
    use crate::export::ConnectFlags;
    use crate::rpc::{DlmReply, DlmRequest, EnqueueRequest, RpcResult, Transport};
    use crate::types::{LockHandle, LockMode, LockType, PolicyData, ResourceId};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Acknowledges everything and remembers being disconnected.
    #[derive(Default)]
    struct AckTransport {
        disconnected: AtomicBool,
    }

    #[async_trait]
    impl Transport for AckTransport {
        async fn send_and_wait(&self, _request: DlmRequest, _timeout: Duration) -> RpcResult {
            Ok(DlmReply::Ack)
        }

        fn send_async(&self, _request: DlmRequest, _timeout: Duration) -> oneshot::Receiver<RpcResult> {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(DlmReply::Ack));
            rx
        }

        fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    fn ibits(id: u64, handle: u64) -> EnqueueRequest {
        EnqueueRequest {
            resource: ResourceId::new(id),
            lock_type: LockType::Ibits.wire(),
            mode: LockMode::Pr.bits(),
            policy: PolicyData::Ibits { bits: 1 },
            flags: LockFlags::empty(),
            handle: LockHandle(handle),
            cancels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_evict_export_once() {
        let server = LockServer::start("evict", DlmConfig::testing());
        let transport = Arc::new(AckTransport::default());
        let export = server.connect("c1", transport.clone(), false, ConnectFlags::default());
        for i in 1..=3 {
            server.handle_enqueue(&export, ibits(i, i)).await.unwrap();
        }
        assert_eq!(export.lock_count(), 3);

        assert!(server.evict_export(&export).await);
        assert!(!server.evict_export(&export).await);
        assert!(transport.disconnected.load(Ordering::SeqCst));
        assert_eq!(export.lock_count(), 0);
        assert_eq!(server.namespace().lock_count(), 0);
        assert!(server.export(&export.id()).is_none());
        assert_eq!(server.stats().evictions, 1);
        server.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_evicts_holder() {
        let server = LockServer::start("evict", DlmConfig::testing());
        let export = server.connect("c1", Arc::new(AckTransport::default()), false, ConnectFlags::default());
        let reply = server.handle_enqueue(&export, ibits(1, 10)).await.unwrap();
        let lock = server.namespace().resolve(reply.handle).unwrap();

        // The eviction task picks it up from the handoff list.
        assert!(server.waiting().push_expired(&lock));
        for _ in 0..100 {
            if lock.has_flags(LockFlags::DESTROYED) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(export.is_failed());
        assert_eq!(server.waiting().expired_len(), 0);
        assert!(lock.has_flags(LockFlags::DESTROYED));
        server.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_cancelled_after_expiry_spares_holder() {
        let server = LockServer::start("evict", DlmConfig::testing());
        let export = server.connect("c1", Arc::new(AckTransport::default()), false, ConnectFlags::default());
        let first = server.handle_enqueue(&export, ibits(1, 10)).await.unwrap();
        let second = server.handle_enqueue(&export, ibits(2, 11)).await.unwrap();
        let cancelled = server.namespace().resolve(first.handle).unwrap();
        let expired = server.namespace().resolve(second.handle).unwrap();

        // The cancel lands after the eviction worker took the lock off the
        // expired list: the tracker no longer knows it, the namespace does not
        // either. No await in between, so the worker task has not run yet.
        assert!(server.waiting().push_expired(&cancelled));
        assert!(cancelled.try_set_canceling());
        cancelled.with_res_and_lock(|res, state| res.unlink(&cancelled, state));
        export.remove_lock(cancelled.handle());
        server.namespace().destroy(&cancelled);

        assert_eq!(server.drain_expired().await, 0);
        assert!(!export.is_failed());
        assert_eq!(server.stats().evictions, 0);
        assert_eq!(export.lock_count(), 1);

        // Eviction keeps working afterwards.
        assert!(server.waiting().push_expired(&expired));
        assert_eq!(server.drain_expired().await, 1);
        assert!(export.is_failed());
        assert!(expired.has_flags(LockFlags::DESTROYED));
        server.shutdown(false).await.unwrap();
    }
}
