//! Client side of the lock manager.
//!
//! A [`LockClient`] keeps a client namespace mirroring the locks it holds on
//! one server. It enqueues and converts locks over its [`Transport`], answers
//! the server's callbacks through [`LockClient::handle_callback`], and keeps
//! unused locks in a cache until a policy in [`lru`] gives them back.
//!
//! Lock references work as on the server: [`LockClient::enqueue`] returns a
//! lock holding one reference in the requested mode, and
//! [`LockClient::decref`] drops it. A lock whose last reference goes while a
//! blocking callback is pending is cancelled at once; otherwise it is parked
//! in the unused cache where [`LockClient::match_lock`] can find it again.

pub mod cancel;
pub mod lru;

use crate::ast::{
    AstHandler, AstKind, AstOutcome, AstTarget, BlockingEvent, BlockingPool, BlockingWork,
    BlockingWorker,
};
use crate::config::DlmConfig;
use crate::error::{DlmError, Result};
use crate::export::ConnectFlags;
use crate::lock::{Lock, LockRef, Queue};
use crate::namespace::{Namespace, Side};
use crate::observability;
use crate::rpc::{
    self, AstRequest, ConvertRequest, DlmReply, DlmRequest, EnqueueReply, EnqueueRequest,
    PoolHint, RpcError, RpcResult, Transport,
};
use crate::shutdown::ShutdownCoordinator;
use crate::types::{LockDesc, LockFlags, LockHandle, LockMode, LockType, PolicyData, ResourceId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

pub use cancel::CancelKind;
pub use lru::{LruFlags, LruPolicy};

/// Inode bits covering every bit a server without IBITS support locks.
const INTEROP_BITS: u64 = 0b11;

/// Hooks into the layer using the locks.
///
/// Every method has a default, so an observer only implements what it needs.
pub trait LockObserver: Send + Sync {
    /// A conflicting request wants `lock`; flush whatever it protects.
    /// Called once the lock is unused, right before it is cancelled.
    fn blocking(&self, _lock: &Lock, _conflict: Option<&LockDesc>) {}

    /// `lock` is being cancelled.
    fn canceling(&self, _lock: &Lock) {}

    /// Cached pages covered by an extent lock, if known. Caps the cost the
    /// shrink policy assigns to it.
    fn resident_pages(&self, _lock: &Lock) -> Option<u64> {
        None
    }

    /// Value block to return for a glimpse of `lock`.
    fn glimpse(&self, lock: &Lock) -> Option<Bytes> {
        lock.lvb()
    }
}

/// Whether a cancel of unused-cache locks waits for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Send the cancels before returning.
    Sync,
    /// Hand the cancels to the blocking pool.
    Async,
}

#[derive(Debug, Default)]
struct Counters {
    enqueues: AtomicU64,
    grants: AtomicU64,
    converts: AtomicU64,
    cancels: AtomicU64,
    cancel_rpcs: AtomicU64,
    lru_cancels: AtomicU64,
    blocking_callbacks: AtomicU64,
    completion_callbacks: AtomicU64,
    glimpse_callbacks: AtomicU64,
}

/// Point-in-time client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub enqueues: u64,
    pub grants: u64,
    pub converts: u64,
    pub cancels: u64,
    pub cancel_rpcs: u64,
    pub lru_cancels: u64,
    pub blocking_callbacks: u64,
    pub completion_callbacks: u64,
    pub glimpse_callbacks: u64,
    pub locks: usize,
    pub unused: usize,
}

/// Lock manager client for one server connection.
pub struct LockClient {
    ns: Arc<Namespace>,
    transport: Arc<dyn Transport>,
    connect: ConnectFlags,
    observer: Option<Arc<dyn LockObserver>>,
    pool: BlockingPool,
    shutdown: ShutdownCoordinator,
    counters: Counters,
}

impl LockClient {
    /// Create the client and start its blocking-callback workers. Must be
    /// called inside a tokio runtime.
    pub fn start(
        name: impl Into<String>,
        config: DlmConfig,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::builder(name, config, transport).start()
    }

    pub fn builder(
        name: impl Into<String>,
        config: DlmConfig,
        transport: Arc<dyn Transport>,
    ) -> LockClientBuilder {
        let connect = ConnectFlags {
            lru_resize: config.lru.lru_resize,
            ..ConnectFlags::default()
        };
        LockClientBuilder {
            name: name.into(),
            config,
            transport,
            connect,
            observer: None,
        }
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn config(&self) -> &Arc<DlmConfig> {
        self.ns.config()
    }

    pub fn connect_flags(&self) -> ConnectFlags {
        self.connect
    }

    pub fn stats(&self) -> ClientStats {
        let c = &self.counters;
        ClientStats {
            enqueues: c.enqueues.load(Ordering::Relaxed),
            grants: c.grants.load(Ordering::Relaxed),
            converts: c.converts.load(Ordering::Relaxed),
            cancels: c.cancels.load(Ordering::Relaxed),
            cancel_rpcs: c.cancel_rpcs.load(Ordering::Relaxed),
            lru_cancels: c.lru_cancels.load(Ordering::Relaxed),
            blocking_callbacks: c.blocking_callbacks.load(Ordering::Relaxed),
            completion_callbacks: c.completion_callbacks.load(Ordering::Relaxed),
            glimpse_callbacks: c.glimpse_callbacks.load(Ordering::Relaxed),
            locks: self.ns.lock_count(),
            unused: self.ns.unused_count(),
        }
    }

    /// Whether the server stands in plain locks for our inode-bits locks.
    fn ibits_interop(&self, lock_type: LockType) -> bool {
        lock_type == LockType::Ibits && !self.connect.ibits
    }

    fn obd_timeout(&self) -> std::time::Duration {
        self.config().timeouts.obd_timeout
    }

    // Enqueue

    /// Request a lock from the server and wait until it is granted.
    ///
    /// The returned lock holds one reference in `mode`. Unused locks on the
    /// cache are offered back to the server in the same request.
    pub async fn enqueue(
        &self,
        resource: ResourceId,
        lock_type: LockType,
        mode: LockMode,
        policy: PolicyData,
        flags: LockFlags,
    ) -> Result<LockRef> {
        if self.shutdown.is_shutting_down() {
            return Err(DlmError::NotConnected(format!(
                "client {} is shutting down",
                self.ns.name()
            )));
        }
        if !policy.fits(lock_type) {
            return Err(DlmError::InvalidArgument(format!(
                "policy {:?} does not fit a {} lock",
                policy, lock_type
            )));
        }
        self.counters.enqueues.fetch_add(1, Ordering::Relaxed);
        let interop = self.ibits_interop(lock_type);
        let policy = if interop {
            PolicyData::Ibits { bits: INTEROP_BITS }
        } else {
            policy
        };
        let lock = self
            .ns
            .create_lock(resource, lock_type, mode, policy, AstTarget::Client, None)?;
        lock.add_ref(mode);
        lock.set_flags(flags & (LockFlags::INHERIT_MASK | LockFlags::NO_LRU));
        debug!(lock = %lock.debug(), "client-side enqueue START");

        let cancels = if self.connect.cancelset {
            let avail = rpc::cancel_handles_avail(rpc::LOCK_REQUEST_SIZE, rpc::ENQUEUE_CANCEL_OFFSET);
            let avail = match self.config().ast.max_cancel_batch {
                Some(max) => avail.min(max),
                None => avail,
            };
            if avail > 0 {
                let to_free = if self.ns.lru_resize() { 0 } else { 1 };
                self.cancel_lru_local(to_free, avail, self.elc_policy(), LockFlags::empty())
                    .await
                    .iter()
                    .map(|l| l.remote_handle())
                    .collect()
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };
        if !cancels.is_empty() {
            debug!(count = cancels.len(), "packing unused locks into enqueue");
        }

        let request = self.enqueue_request(&lock, flags & !LockFlags::REPLAY, cancels);
        let reply = match self
            .transport
            .send_and_wait(DlmRequest::Enqueue(request), self.obd_timeout())
            .await
        {
            Ok(DlmReply::Enqueue(reply)) => reply,
            Ok(other) => {
                self.failed_lock_cleanup(&lock, mode).await;
                observability::record_enqueue(self.ns.name(), "failed");
                return Err(DlmError::Protocol(format!(
                    "unexpected reply {:?} to enqueue",
                    other
                )));
            }
            Err(e) => {
                debug!(lock = %lock.debug(), error = %e, "enqueue failed");
                self.failed_lock_cleanup(&lock, mode).await;
                observability::record_enqueue(self.ns.name(), "failed");
                return Err(DlmError::from(e));
            }
        };
        self.update_pool(Some(reply.pool));

        let result = match self.enqueue_fini(&lock, reply, interop) {
            Ok(flags) => self.wait_granted(&lock, flags).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(lock = %lock.debug(), error = %e, "enqueue did not complete");
            self.failed_lock_cleanup(&lock, mode).await;
            observability::record_enqueue(self.ns.name(), "failed");
            return Err(DlmError::LockFailed(format!("{}: {}", lock.handle(), e)));
        }
        self.counters.grants.fetch_add(1, Ordering::Relaxed);
        observability::record_enqueue(self.ns.name(), "granted");
        debug!(lock = %lock.debug(), "client-side enqueue END");
        Ok(lock)
    }

    /// Build the wire request for `lock` as it stands.
    fn enqueue_request(&self, lock: &LockRef, flags: LockFlags, cancels: Vec<LockHandle>) -> EnqueueRequest {
        let desc = lock.desc();
        let (lock_type, policy) = if self.ibits_interop(desc.lock_type) {
            (LockType::Plain, PolicyData::None)
        } else {
            (desc.lock_type, desc.policy)
        };
        EnqueueRequest {
            resource: desc.resource,
            lock_type: lock_type.wire(),
            mode: desc.req_mode.bits(),
            policy,
            flags,
            handle: lock.handle(),
            cancels,
        }
    }

    /// Apply an enqueue reply to `lock` and place it on its resource.
    /// Returns the blocked flags still in effect.
    fn enqueue_fini(&self, lock: &LockRef, reply: EnqueueReply, interop: bool) -> Result<LockFlags> {
        let mut flags = reply.flags;
        {
            let mut state = lock.state();
            state.remote_handle = reply.handle;
            state.flags.insert(flags & LockFlags::INHERIT_MASK);
        }
        debug!(handle = %lock.handle(), remote = %reply.handle, flags = flags.bits(), "enqueue reply");

        if flags.contains(LockFlags::LOCK_CHANGED) {
            let lock_type = lock.lock_type();
            lock.with_res_and_lock(|_, state| {
                if state.is_granted() {
                    return;
                }
                if reply.desc.req_mode != state.req_mode {
                    debug!(handle = %lock.handle(), mode = %reply.desc.req_mode, "server returned different mode");
                    state.req_mode = reply.desc.req_mode;
                }
                if !interop && reply.desc.policy.fits(lock_type) {
                    state.policy = reply.desc.policy;
                }
            });
            if reply.desc.resource != lock.resource().id() {
                self.ns.change_resource(lock, reply.desc.resource)?;
                debug!(lock = %lock.debug(), "client-side enqueue, new resource");
            }
        }
        if flags.contains(LockFlags::AST_SENT) {
            lock.set_flags(LockFlags::CBPENDING | LockFlags::BL_AST);
            debug!(handle = %lock.handle(), "enqueue reply includes blocking callback");
        }

        let granted_now = lock.with_res_and_lock(|res, state| {
            if state.flags.intersects(LockFlags::DESTROYED | LockFlags::FAILED) {
                return Err(DlmError::LockFailed(format!(
                    "lock {} failed during enqueue",
                    lock.handle()
                )));
            }
            if !state.is_granted() {
                if let Some(lvb) = reply.lvb.clone() {
                    state.lvb = Some(lvb);
                }
            }
            if state.is_granted() {
                // The completion callback beat the reply.
                return Ok(false);
            }
            if state.queue == Queue::None {
                if flags.contains(LockFlags::BLOCK_CONV) {
                    res.add(Queue::Converting, lock, state);
                } else if flags.intersects(LockFlags::BLOCK_WAIT | LockFlags::BLOCK_GRANTED) {
                    res.add(Queue::Waiting, lock, state);
                } else {
                    res.grant(lock, state);
                    return Ok(true);
                }
            }
            state.flags.insert(flags & LockFlags::BLOCKED_MASK);
            Ok(false)
        })?;
        if granted_now || lock.is_granted() {
            flags.remove(LockFlags::BLOCKED_MASK);
        }
        Ok(flags)
    }

    /// Wait for a blocked lock to be granted by a completion callback.
    ///
    /// Each timeout asks the connection to recover and waits again, so the
    /// lock is granted after replay or fails when the client is evicted.
    async fn wait_granted(&self, lock: &LockRef, flags: LockFlags) -> Result<()> {
        if !flags.intersects(LockFlags::BLOCKED_MASK) {
            lock.notify();
            return Ok(());
        }
        debug!(lock = %lock.debug(), "client-side enqueue returned a blocked lock, sleeping");
        let timeout = if lock.has_flags(LockFlags::NO_TIMEOUT) {
            None
        } else {
            Some(self.obd_timeout())
        };
        loop {
            let settled = lock
                .wait_for(timeout, |s| {
                    s.is_granted() || s.flags.intersects(LockFlags::FAILED | LockFlags::DESTROYED)
                })
                .await;
            if settled {
                break;
            }
            warn!(lock = %lock.debug(), "lock timed out, entering recovery");
            self.transport.start_recovery();
        }
        if lock.has_flags(LockFlags::FAILED | LockFlags::DESTROYED) {
            return Err(DlmError::LockFailed(format!(
                "lock {} failed while waiting",
                lock.handle()
            )));
        }
        debug!(lock = %lock.debug(), "client-side enqueue granted");
        Ok(())
    }

    /// Drop a lock whose enqueue failed without telling the server.
    async fn failed_lock_cleanup(&self, lock: &LockRef, mode: LockMode) {
        lock.set_flags(LockFlags::LOCAL_ONLY);
        debug!(handle = %lock.handle(), "setting LOCAL_ONLY on failed lock");
        self.decref_and_cancel(lock, mode).await;
    }

    // References

    /// Find a granted lock on `resource` in one of `modes` that covers
    /// `policy`, and take a reference on it in its granted mode.
    pub fn match_lock(
        &self,
        resource: ResourceId,
        lock_type: LockType,
        modes: &[LockMode],
        policy: &PolicyData,
    ) -> Option<LockRef> {
        let res = self.ns.resource(&resource)?;
        if res.lock_type() != lock_type {
            return None;
        }
        let mask = LockMode::mask(modes);
        let found = self.ns.with_unused(|cache| {
            let state = res.state();
            for lock in &state.granted {
                let mut ls = lock.state();
                let Some(granted) = ls.granted_mode else {
                    continue;
                };
                if granted.bits() & mask == 0 {
                    continue;
                }
                if ls.flags.intersects(
                    LockFlags::CBPENDING
                        | LockFlags::CANCELING
                        | LockFlags::FAILED
                        | LockFlags::DESTROYED,
                ) {
                    continue;
                }
                if !covers(&ls.policy, policy) {
                    continue;
                }
                ls.add_ref(granted);
                ls.last_used = tokio::time::Instant::now();
                drop(ls);
                cache.pop(&lock.handle());
                return Some(lock.clone());
            }
            None
        });
        if let Some(lock) = &found {
            debug!(lock = %lock.debug(), "matched existing lock");
        }
        found
    }

    /// Take another reference on `lock` in `mode`.
    pub fn addref(&self, lock: &LockRef, mode: LockMode) {
        self.ns.lru_remove(lock);
        lock.add_ref(mode);
        lock.touch();
    }

    /// Drop a reference in `mode`.
    ///
    /// The last reference either cancels the lock, when a blocking callback
    /// is pending, or parks it in the unused cache.
    pub async fn decref(&self, lock: &LockRef, mode: LockMode) {
        if !lock.drop_ref(mode) {
            return;
        }
        let parked = self.ns.with_unused(|cache| {
            let mut state = lock.state();
            if !state.is_unused() {
                return None;
            }
            if state.flags.contains(LockFlags::CBPENDING) {
                return Some(false);
            }
            if state.flags.intersects(
                LockFlags::NO_LRU | LockFlags::CANCELING | LockFlags::DESTROYED | LockFlags::FAILED,
            ) || !state.is_granted()
            {
                return None;
            }
            state.last_used = tokio::time::Instant::now();
            drop(state);
            cache.put(lock.handle(), lock.clone());
            Some(true)
        });
        match parked {
            Some(false) => {
                debug!(lock = %lock.debug(), "final decref done on cbpending lock");
                self.ns.lru_remove(lock);
                self.handle_blocking(lock, None).await;
            }
            Some(true) => {
                debug!(handle = %lock.handle(), "add lock into the unused cache");
                if !self.ns.lru_resize() && self.ns.unused_count() > self.ns.max_unused() {
                    self.cancel_lru(0, CancelMode::Async, LruFlags::empty()).await;
                }
            }
            None => {}
        }
    }

    /// Drop a reference and cancel the lock once unused.
    pub async fn decref_and_cancel(&self, lock: &LockRef, mode: LockMode) {
        lock.set_flags(LockFlags::CBPENDING);
        self.decref(lock, mode).await;
    }

    // Conversion

    /// Change the mode of a granted lock, waiting if the server queues the
    /// conversion. Returns the flags the server replied with.
    pub async fn convert(&self, lock: &LockRef, mode: LockMode) -> Result<LockFlags> {
        self.counters.converts.fetch_add(1, Ordering::Relaxed);
        debug!(lock = %lock.debug(), new_mode = %mode, "client-side convert");
        let request = DlmRequest::Convert(ConvertRequest {
            handle: lock.remote_handle(),
            mode: mode.bits(),
            flags: LockFlags::empty(),
        });
        let reply = match self
            .transport
            .send_and_wait(request, self.obd_timeout())
            .await?
        {
            DlmReply::Convert(reply) => reply,
            other => {
                return Err(DlmError::Protocol(format!(
                    "unexpected reply {:?} to convert",
                    other
                )))
            }
        };
        self.update_pool(Some(reply.pool));

        let flags = lock.with_res_and_lock(|res, state| {
            if state.granted_mode == Some(mode) && state.req_mode == mode {
                return Ok(LockFlags::empty());
            }
            if state.queue != Queue::Granted || state.flags.contains(LockFlags::CANCELING) {
                return Err(DlmError::Deadlock(format!(
                    "lock {} is not granted",
                    lock.handle()
                )));
            }
            state.req_mode = mode;
            if reply.flags.contains(LockFlags::BLOCK_CONV) {
                res.unlink(lock, state);
                res.add(Queue::Converting, lock, state);
                state.flags.insert(LockFlags::BLOCK_CONV);
                Ok(LockFlags::BLOCK_CONV)
            } else {
                res.regrant_in_place(state);
                Ok(LockFlags::empty())
            }
        })?;
        self.wait_granted(lock, flags).await?;
        Ok(reply.flags)
    }

    // Cancellation

    /// Cancel `lock`, telling the server unless it asked for no reply.
    /// Unused cached locks ride along in the same request.
    pub async fn cancel(&self, lock: &LockRef) -> Result<()> {
        if !lock.try_set_canceling() {
            debug!(handle = %lock.handle(), "lock is already being cancelled");
            return Ok(());
        }
        if self.cancel_local(lock).await == CancelKind::LocalOnly {
            return Ok(());
        }
        let mut cancels = vec![lock.clone()];
        if self.connect.cancelset {
            let avail = self.cancel_batch();
            if avail > 1 {
                let extra = self
                    .cancel_lru_local(0, avail - 1, self.elc_policy(), LockFlags::BL_AST)
                    .await;
                cancels.extend(extra);
            }
        }
        self.cancel_list(cancels, LockFlags::empty()).await;
        Ok(())
    }

    /// Cancel every unused lock on `resource`, or on every resource.
    /// Returns how many locks were cancelled.
    pub async fn cancel_unused(&self, resource: Option<ResourceId>, flags: LockFlags) -> usize {
        let resources = match resource {
            Some(id) => match self.ns.resource(&id) {
                Some(res) => vec![res],
                None => {
                    debug!(resource = %id, "no resource to cancel locks on");
                    return 0;
                }
            },
            None => self.ns.resources(),
        };
        let mut count = 0;
        for res in resources {
            let claimed = self.cancel_resource_local(&res, None, None, LockFlags::empty());
            count += claimed.len();
            let cancels = self.cancel_list_local(claimed, flags).await;
            self.cancel_list(cancels, flags).await;
            self.ns.reclaim(&res);
        }
        count
    }

    /// Give back up to `count` locks from the unused cache, plus whatever
    /// `flags` selects. Returns how many cancels the server is told about.
    pub async fn cancel_lru(&self, count: usize, mode: CancelMode, flags: LruFlags) -> usize {
        let cancels = self
            .cancel_lru_local(count, 0, flags, LockFlags::empty())
            .await;
        let sent = cancels.len();
        if sent == 0 {
            return 0;
        }
        let work = BlockingWork::Cancel {
            ns: self.ns.clone(),
            locks: cancels,
        };
        if mode == CancelMode::Async {
            match self.pool.submit(work) {
                Ok(()) => return sent,
                Err(work) => self.handle_work(work).await,
            }
        } else {
            self.handle_work(work).await;
        }
        sent
    }

    /// How many locks [`cancel_lru`](Self::cancel_lru) would give back now.
    pub fn cancel_lru_estimate(&self, count: usize, max: usize, flags: LruFlags) -> usize {
        lru::estimate(&self.ns, count, max, flags, self.observer.as_deref())
    }

    // Server callbacks

    /// Answer one callback from the server.
    pub async fn handle_callback(&self, request: DlmRequest) -> RpcResult {
        let name = request.name();
        let (kind, ast) = match request {
            DlmRequest::Blocking(ast) => (AstKind::Blocking, ast),
            DlmRequest::Completion(ast) => (AstKind::Completion, ast),
            DlmRequest::Glimpse(ast) => (AstKind::Glimpse, ast),
            _ => {
                let e = DlmError::Protocol(format!("{} request sent to a client", name));
                debug!(request = name, "not a callback");
                return Err(RpcError::from(&e));
            }
        };
        let Some(lock) = self.ns.resolve(ast.handle) else {
            debug!(handle = %ast.handle, %kind, "callback on lock, lock disappeared");
            return Err(RpcError::Status(libc::EINVAL));
        };
        lock.set_flags(ast.flags & LockFlags::AST_MASK);

        match kind {
            AstKind::Blocking => {
                self.counters
                    .blocking_callbacks
                    .fetch_add(1, Ordering::Relaxed);
                if lock.has_flags(LockFlags::CANCEL_ON_BLOCK) {
                    self.handle_blocking(&lock, Some(ast.desc)).await;
                } else {
                    self.queue_blocking(&lock, Some(ast.desc)).await;
                }
                Ok(DlmReply::Ack)
            }
            AstKind::Completion => {
                self.counters
                    .completion_callbacks
                    .fetch_add(1, Ordering::Relaxed);
                self.handle_completion(&lock, ast).await;
                Ok(DlmReply::Ack)
            }
            AstKind::Glimpse => {
                self.counters
                    .glimpse_callbacks
                    .fetch_add(1, Ordering::Relaxed);
                self.handle_glimpse(&lock).await
            }
        }
    }

    /// Run the blocking callback of `lock` on the pool, or inline once the
    /// pool is gone.
    async fn queue_blocking(&self, lock: &LockRef, desc: Option<LockDesc>) {
        let work = BlockingWork::Blocking {
            ns: self.ns.clone(),
            lock: lock.clone(),
            desc,
        };
        if let Err(work) = self.pool.submit(work) {
            self.handle_work(work).await;
        }
    }

    /// Mark `lock` for cancellation and cancel it now if nobody uses it.
    async fn handle_blocking(&self, lock: &LockRef, desc: Option<LockDesc>) {
        debug!(lock = %lock.debug(), "client blocking callback handler");
        let unused = {
            let mut state = lock.state();
            state.flags.insert(LockFlags::CBPENDING);
            if state.flags.contains(LockFlags::CANCEL_ON_BLOCK) {
                state.flags.insert(LockFlags::CANCEL);
            }
            state.is_unused()
        };
        if unused {
            debug!(handle = %lock.handle(), "already unused, calling callback");
            self.blocking_ast(lock, BlockingEvent::Blocking(desc)).await;
        } else {
            debug!(handle = %lock.handle(), "lock still has references, will be cancelled later");
        }
    }

    async fn handle_completion(&self, lock: &LockRef, ast: AstRequest) {
        debug!(lock = %lock.debug(), "client completion callback handler START");
        let lock_type = lock.lock_type();
        let interop = self.ibits_interop(lock_type);
        let live = lock.with_res_and_lock(|res, state| {
            if state.flags.contains(LockFlags::DESTROYED) {
                return false;
            }
            if let Some(granted) = ast.desc.granted_mode {
                if granted != state.req_mode {
                    debug!(handle = %lock.handle(), mode = %granted, "completion changed the lock mode");
                    state.req_mode = granted;
                }
            }
            if lock_type != LockType::Plain && !interop && ast.desc.policy.fits(lock_type) {
                state.policy = ast.desc.policy;
            }
            res.unlink(lock, state);
            true
        });
        if !live {
            debug!(handle = %lock.handle(), "completion for a destroyed lock");
            return;
        }
        if ast.desc.resource != lock.resource().id() {
            warn!(handle = %lock.handle(), to = %ast.desc.resource, "completion callback changed the resource");
            if let Err(e) = self.ns.change_resource(lock, ast.desc.resource) {
                error!(handle = %lock.handle(), error = %e, "failed to move lock to its new resource");
                lock.set_flags(LockFlags::FAILED);
                lock.notify();
                return;
            }
        }
        let ast_sent = ast.flags.contains(LockFlags::AST_SENT);
        let granted = lock.with_res_and_lock(|res, state| {
            if state.flags.contains(LockFlags::DESTROYED) {
                return false;
            }
            if ast_sent {
                state.flags.insert(LockFlags::CBPENDING);
            }
            if let Some(lvb) = ast.lvb {
                state.lvb = Some(lvb);
            }
            res.grant(lock, state);
            true
        });
        if granted {
            if ast_sent {
                debug!(handle = %lock.handle(), "completion includes blocking callback");
            }
            self.completion_ast(lock, LockFlags::empty()).await;
        }
        debug!(lock = %lock.debug(), "client completion callback handler END");
    }

    async fn handle_glimpse(&self, lock: &LockRef) -> RpcResult {
        let reply = match self.glimpse_ast(lock).await {
            Ok(Some(lvb)) => Ok(DlmReply::Glimpse { lvb: Some(lvb) }),
            Ok(None) => Err(RpcError::NoLockData),
            Err(e) => Err(RpcError::from(&e)),
        };
        let idle = self.config().lru.glimpse_idle;
        let give_back = {
            let state = lock.state();
            state.granted_mode == Some(LockMode::Pw)
                && state.is_unused()
                && !state.flags.intersects(LockFlags::CBPENDING | LockFlags::CANCELING)
                && state.last_used.elapsed() > idle
        };
        if give_back {
            debug!(handle = %lock.handle(), "glimpse of an idle write lock, cancelling it");
            self.queue_blocking(lock, None).await;
        }
        reply
    }

    /// Take the server's lock volume hint from a reply.
    pub fn update_pool(&self, hint: Option<PoolHint>) {
        let Some(hint) = hint else {
            return;
        };
        if !self.connect.lru_resize {
            return;
        }
        if hint.slv == 0 || hint.limit == 0 {
            debug!(slv = hint.slv, limit = hint.limit, "zero server lock volume or limit");
            return;
        }
        self.ns.set_slv(hint.slv);
        self.ns.set_limit(hint.limit);
    }

    // Recovery

    /// Re-send every lock to a restarted server. Locks that asked for no
    /// blocking reply are dropped instead. Returns how many were replayed.
    pub async fn replay_locks(&self) -> Result<usize> {
        let locks: Vec<LockRef> = self
            .ns
            .locks()
            .into_iter()
            .filter(|l| !l.has_flags(LockFlags::FAILED))
            .collect();
        info!(namespace = self.ns.name(), count = locks.len(), "replaying locks");
        let mut replayed = 0;
        for lock in locks {
            if lock.has_flags(LockFlags::CANCELING) {
                debug!(handle = %lock.handle(), "not replaying cancelled lock");
                continue;
            }
            if lock.has_flags(LockFlags::CANCEL_ON_BLOCK) {
                debug!(handle = %lock.handle(), "not replaying reply-less lock");
                if lock.try_set_canceling() {
                    lock.set_flags(LockFlags::LOCAL_ONLY);
                    self.cancel_local(&lock).await;
                }
                continue;
            }
            let flags = {
                let state = lock.state();
                if state.is_granted() {
                    LockFlags::REPLAY | LockFlags::BLOCK_GRANTED
                } else if state.granted_mode.is_some() {
                    LockFlags::REPLAY | LockFlags::BLOCK_CONV
                } else if state.queue != Queue::None {
                    LockFlags::REPLAY | LockFlags::BLOCK_WAIT
                } else {
                    LockFlags::REPLAY
                }
            };
            let request = self.enqueue_request(&lock, flags, Vec::new());
            debug!(lock = %lock.debug(), flags = flags.bits(), "replaying lock");
            match self
                .transport
                .send_and_wait(DlmRequest::Enqueue(request), self.obd_timeout())
                .await
            {
                Ok(DlmReply::Enqueue(reply)) => {
                    lock.set_remote_handle(reply.handle);
                    self.update_pool(Some(reply.pool));
                    replayed += 1;
                }
                Ok(other) => {
                    error!(handle = %lock.handle(), reply = ?other, "unexpected replay reply");
                    self.transport.start_recovery();
                    return Err(DlmError::Protocol("unexpected reply to lock replay".into()));
                }
                Err(e) => {
                    error!(handle = %lock.handle(), error = %e, "replay failed, reconnecting");
                    self.transport.start_recovery();
                    return Err(DlmError::from(e));
                }
            }
        }
        Ok(replayed)
    }

    /// Forget every lock after the server evicted us. Waiters fail, unused
    /// locks go at once and locks still in use go with their last reference.
    pub async fn invalidate(&self) -> usize {
        let locks = self.ns.locks();
        warn!(namespace = self.ns.name(), count = locks.len(), "invalidating all locks");
        for lock in &locks {
            lock.set_flags(LockFlags::FAILED | LockFlags::LOCAL_ONLY | LockFlags::CBPENDING);
            lock.notify();
        }
        self.cancel_unused(None, LockFlags::LOCAL_ONLY).await
    }

    // Shutdown

    /// Stop the client. Without `force`, unused locks are given back to the
    /// server and the call refuses while locks are still in use.
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        let flags = if force {
            LockFlags::LOCAL_ONLY
        } else {
            LockFlags::empty()
        };
        self.cancel_unused(None, flags).await;
        let busy = self.ns.lock_count();
        if busy > 0 && !force {
            return Err(DlmError::Busy(format!(
                "namespace {} still has {} locks",
                self.ns.name(),
                busy
            )));
        }
        info!(namespace = self.ns.name(), force, "shutting down lock client");
        for lock in self.ns.locks() {
            lock.set_flags(LockFlags::FAILED);
            if lock.try_set_canceling() {
                self.finish_cancel(&lock);
            }
        }
        self.shutdown.shutdown();
        self.pool.shutdown().await;
        Ok(())
    }
}

/// Whether a held lock's policy data covers a request for `wanted`.
fn covers(held: &PolicyData, wanted: &PolicyData) -> bool {
    match (held, wanted) {
        (PolicyData::None, PolicyData::None) => true,
        (PolicyData::Extent(h), PolicyData::Extent(w)) => {
            h.start <= w.start && h.end >= w.end && h.gid == w.gid
        }
        (PolicyData::Ibits { bits: h }, PolicyData::Ibits { bits: w }) => h & w == *w,
        _ => false,
    }
}

#[async_trait]
impl AstHandler for LockClient {
    async fn blocking_ast(&self, lock: &LockRef, event: BlockingEvent) -> AstOutcome {
        match event {
            BlockingEvent::Canceling => {
                if let Some(observer) = &self.observer {
                    observer.canceling(lock);
                }
            }
            BlockingEvent::Blocking(desc) => {
                if let Some(observer) = &self.observer {
                    observer.blocking(lock, desc.as_ref());
                }
                if let Err(e) = self.cancel(lock).await {
                    error!(handle = %lock.handle(), error = %e, "cancel from blocking callback failed");
                }
            }
        }
        AstOutcome::Done
    }

    async fn completion_ast(&self, lock: &LockRef, flags: LockFlags) -> AstOutcome {
        if let Err(e) = self.wait_granted(lock, flags).await {
            debug!(handle = %lock.handle(), error = %e, "completion wait failed");
        }
        AstOutcome::Done
    }

    async fn glimpse_ast(&self, lock: &LockRef) -> Result<Option<Bytes>> {
        Ok(match &self.observer {
            Some(observer) => observer.glimpse(lock),
            None => lock.lvb(),
        })
    }
}

#[async_trait]
impl BlockingWorker for LockClient {
    async fn handle_work(&self, work: BlockingWork) {
        match work {
            BlockingWork::Blocking { lock, desc, .. } => self.handle_blocking(&lock, desc).await,
            BlockingWork::Cancel { locks, .. } => self.cancel_list(locks, LockFlags::empty()).await,
        }
    }
}

/// Optional collaborators of a [`LockClient`].
pub struct LockClientBuilder {
    name: String,
    config: DlmConfig,
    transport: Arc<dyn Transport>,
    connect: ConnectFlags,
    observer: Option<Arc<dyn LockObserver>>,
}

impl LockClientBuilder {
    /// Features the server agreed to when we connected.
    pub fn connect_flags(mut self, connect: ConnectFlags) -> Self {
        self.connect = connect;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn start(self) -> Arc<LockClient> {
        let config = Arc::new(self.config);
        let ns = Namespace::new(self.name, Side::Client, config.clone());
        ns.set_lru_resize(self.connect.lru_resize);
        let threads = config.ast.bl_threads;
        let client = Arc::new_cyclic(|weak: &Weak<LockClient>| LockClient {
            ns,
            transport: self.transport,
            connect: self.connect,
            observer: self.observer,
            pool: BlockingPool::start(threads, weak.clone()),
            shutdown: ShutdownCoordinator::new(),
            counters: Counters::default(),
        });
        info!(
            namespace = client.ns.name(),
            bl_threads = threads,
            lru_resize = client.connect.lru_resize,
            max_unused = client.ns.max_unused(),
            "lock client started"
        );
        client
    }
}
