//! Server side of the lock manager.
//!
//! A [`LockServer`] owns one server namespace, the exports of its connected
//! clients, the waiting-lock tracker with its timer and eviction tasks, and a
//! small pool for callbacks on its own locks. Requests arrive through
//! [`LockServer::handle_request`]; callbacks leave through each export's
//! transport.

pub mod eviction;
pub mod waiting;

use crate::ast::{
    AstHandler, AstKind, AstOutcome, AstTarget, BlockingEvent, BlockingPool, BlockingWork,
    BlockingWorker,
};
use crate::config::DlmConfig;
use crate::error::{DlmError, Result};
use crate::export::{ConnectFlags, Export};
use crate::lock::{LockRef, LockState, Queue};
use crate::namespace::{Namespace, Side};
use crate::observability::{self, DumpSink, TracingDump};
use crate::policy::{self, AtSelf, EnqueueDecision};
use crate::resource::Resource;
use crate::rpc::{
    AstRequest, CancelRequest, ConvertReply, ConvertRequest, DlmReply, DlmRequest, EnqueueReply,
    EnqueueRequest, PoolHint, RpcError, RpcResult, Transport,
};
use crate::shutdown::{BackgroundTasks, ShutdownCoordinator};
use crate::types::{LockDesc, LockFlags, LockHandle, LockMode, LockType, PolicyData, ResourceId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use waiting::WaitingLocks;

/// Backing store for resource value blocks.
pub trait LvbStore: Send + Sync {
    /// Current value block of `res`; `None` leaves the cached one alone.
    fn refresh(&self, res: &Resource) -> Option<Bytes>;
}

#[derive(Debug, Default)]
struct Counters {
    enqueues: AtomicU64,
    grants: AtomicU64,
    converts: AtomicU64,
    cancels: AtomicU64,
    blocking_asts: AtomicU64,
    completion_asts: AtomicU64,
    glimpse_asts: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub enqueues: u64,
    pub grants: u64,
    pub converts: u64,
    pub cancels: u64,
    pub blocking_asts: u64,
    pub completion_asts: u64,
    pub glimpse_asts: u64,
    pub evictions: u64,
    pub locks: usize,
    pub waiting: usize,
}

/// Lock manager server for one namespace.
pub struct LockServer {
    ns: Arc<Namespace>,
    waiting: Arc<WaitingLocks>,
    pool: BlockingPool,
    exports: RwLock<HashMap<Uuid, Arc<Export>>>,
    dump: Arc<dyn DumpSink>,
    lvb_store: Option<Arc<dyn LvbStore>>,
    shutdown: ShutdownCoordinator,
    tasks: BackgroundTasks,
    counters: Counters,
}

impl LockServer {
    /// Create the server and start its timer, eviction and callback tasks.
    /// Must be called inside a tokio runtime.
    pub fn start(name: impl Into<String>, config: DlmConfig) -> Arc<Self> {
        Self::builder(name, config).start()
    }

    pub fn builder(name: impl Into<String>, config: DlmConfig) -> LockServerBuilder {
        LockServerBuilder {
            name: name.into(),
            config,
            dump: Arc::new(TracingDump),
            lvb_store: None,
        }
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn config(&self) -> &Arc<DlmConfig> {
        self.ns.config()
    }

    pub fn waiting(&self) -> &Arc<WaitingLocks> {
        &self.waiting
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            enqueues: c.enqueues.load(Ordering::Relaxed),
            grants: c.grants.load(Ordering::Relaxed),
            converts: c.converts.load(Ordering::Relaxed),
            cancels: c.cancels.load(Ordering::Relaxed),
            blocking_asts: c.blocking_asts.load(Ordering::Relaxed),
            completion_asts: c.completion_asts.load(Ordering::Relaxed),
            glimpse_asts: c.glimpse_asts.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            locks: self.ns.lock_count(),
            waiting: self.waiting.len(),
        }
    }

    // Exports

    /// Register a connected client. `transport` is the reverse channel used
    /// for its callbacks.
    pub fn connect(
        &self,
        client: impl Into<String>,
        transport: Arc<dyn Transport>,
        libclient: bool,
        flags: ConnectFlags,
    ) -> Arc<Export> {
        let export = Export::new(client, transport, libclient, flags);
        info!(export = %export.id(), client = export.client(), libclient, "client connected");
        self.exports.write().insert(export.id(), export.clone());
        export
    }

    pub fn export(&self, id: &Uuid) -> Option<Arc<Export>> {
        self.exports.read().get(id).cloned()
    }

    pub fn exports(&self) -> Vec<Arc<Export>> {
        self.exports.read().values().cloned().collect()
    }

    /// Stop timing callbacks while the cluster recovers.
    pub fn suspend_timeouts(&self) {
        warn!(namespace = self.ns.name(), "suspending lock callback timeouts");
        self.waiting.suspend();
    }

    pub fn resume_timeouts(&self) {
        info!(namespace = self.ns.name(), "resuming lock callback timeouts");
        self.waiting.resume();
    }

    // Request handling

    /// Dispatch one client request.
    pub async fn handle_request(&self, export: &Arc<Export>, request: DlmRequest) -> RpcResult {
        let name = request.name();
        let result = match request {
            DlmRequest::Enqueue(req) => self.handle_enqueue(export, req).await.map(DlmReply::Enqueue),
            DlmRequest::Convert(req) => self.handle_convert(req).await.map(DlmReply::Convert),
            DlmRequest::Cancel(req) => self
                .handle_cancel(req)
                .await
                .map(|pool| DlmReply::Cancel { pool }),
            DlmRequest::Blocking(_) | DlmRequest::Completion(_) | DlmRequest::Glimpse(_) => Err(
                DlmError::Protocol(format!("{} callback sent to a server", name)),
            ),
        };
        result.map_err(|e| {
            debug!(request = name, error = %e, "request rejected");
            RpcError::from(&e)
        })
    }

    /// Enqueue a lock on behalf of `export`.
    pub async fn handle_enqueue(
        &self,
        export: &Arc<Export>,
        req: EnqueueRequest,
    ) -> Result<EnqueueReply> {
        self.counters.enqueues.fetch_add(1, Ordering::Relaxed);
        if !req.cancels.is_empty() {
            self.cancel_handles(&req.cancels).await;
        }

        let lock_type = LockType::from_wire(req.lock_type)?;
        let mode = LockMode::from_bits(req.mode)?;
        if !req.policy.fits(lock_type) {
            return Err(DlmError::Protocol(format!(
                "policy {:?} does not fit a {} lock",
                req.policy, lock_type
            )));
        }
        let connect = export.connect_flags();
        if connect.ibits && lock_type == LockType::Plain {
            return Err(DlmError::Protocol("PLAIN lock request from IBITS client".into()));
        }
        if !connect.ibits && lock_type == LockType::Ibits {
            return Err(DlmError::Protocol("IBITS lock request from unaware client".into()));
        }

        if req.flags.contains(LockFlags::REPLAY) {
            if let Some(lock) = export.find_by_remote(req.handle) {
                debug!(lock = %lock.debug(), "replay found existing lock");
                return Ok(self.enqueue_reply(&lock, lock.flags() & LockFlags::INHERIT_MASK));
            }
        }

        let lock = self.ns.create_lock(
            req.resource,
            lock_type,
            mode,
            req.policy,
            AstTarget::Remote,
            Some(export),
        )?;
        lock.set_remote_handle(req.handle);
        debug!(lock = %lock.debug(), "server-side enqueue, new lock created");

        if export.is_failed() {
            error!(lock = %lock.debug(), export = %export.id(), "lock on evicted export");
            self.ns.destroy(&lock);
            return Err(DlmError::NotConnected(format!("export {} evicted", export.id())));
        }
        export.add_lock(&lock);

        let mut flags = self.lock_enqueue(&lock, req.flags).await;
        let inherited = req.flags & LockFlags::INHERIT_MASK;
        flags |= inherited;
        lock.set_flags(inherited);

        if export.is_failed() {
            error!(lock = %lock.debug(), export = %export.id(), "lock on evicted export");
            self.cancel_lock(&lock);
            observability::record_enqueue(self.ns.name(), "failed");
            return Err(DlmError::NotConnected(format!("export {} evicted", export.id())));
        }
        if lock.has_flags(LockFlags::AST_SENT) {
            flags |= LockFlags::AST_SENT;
            if lock.is_granted() {
                // Not-yet-granted locks are handled when the completion goes out.
                if flags.contains(LockFlags::CANCEL_ON_BLOCK) {
                    self.cancel_lock(&lock);
                } else {
                    self.start_callback_timer(&lock);
                }
            }
        }
        if matches!(lock_type, LockType::Plain | LockType::Ibits)
            && export.is_libclient()
            && !lock.has_flags(LockFlags::CANCEL_ON_BLOCK)
        {
            error!(lock = %lock.debug(), "granting sync lock to library client");
        }

        observability::record_enqueue(
            self.ns.name(),
            if lock.is_granted() { "granted" } else { "blocked" },
        );
        let reply = self.enqueue_reply(&lock, flags);
        if lock_type != LockType::Flock {
            self.reprocess(&lock.resource()).await;
        }
        Ok(reply)
    }

    fn enqueue_reply(&self, lock: &LockRef, flags: LockFlags) -> EnqueueReply {
        let res = lock.resource();
        if res.lvb().is_none() {
            if let Some(store) = &self.lvb_store {
                res.set_lvb(store.refresh(&res));
            }
        }
        EnqueueReply {
            handle: lock.handle(),
            desc: lock.desc(),
            flags,
            lvb: res.lvb(),
            pool: self.pool_hint(),
        }
    }

    /// Change the mode of a granted lock.
    pub async fn handle_convert(&self, req: ConvertRequest) -> Result<ConvertReply> {
        self.counters.converts.fetch_add(1, Ordering::Relaxed);
        let mode = LockMode::from_bits(req.mode)?;
        let lock = self
            .ns
            .resolve(req.handle)
            .ok_or_else(|| DlmError::NoSuchLock(format!("convert of {}", req.handle)))?;
        lock.state().enqueued_at = tokio::time::Instant::now();
        debug!(lock = %lock.debug(), new_mode = %mode, "server-side convert");

        let flags = self.lock_convert(&lock, mode).await?;
        if self.waiting.remove(&lock) {
            debug!(lock = %lock.debug(), "converted waiting lock");
        }
        self.reprocess(&lock.resource()).await;
        Ok(ConvertReply {
            flags,
            pool: self.pool_hint(),
        })
    }

    /// Cancel a batch of locks. Fails with `Stale` if none of the handles
    /// named a live lock.
    pub async fn handle_cancel(&self, req: CancelRequest) -> Result<PoolHint> {
        let found = self.cancel_handles(&req.handles).await;
        if found == 0 {
            return Err(DlmError::Stale(format!(
                "none of {} handles found",
                req.handles.len()
            )));
        }
        Ok(self.pool_hint())
    }

    /// Cancel every handle that still names a lock, then refresh and
    /// reprocess each touched resource once.
    async fn cancel_handles(&self, handles: &[LockHandle]) -> usize {
        let mut found = 0;
        let mut resources: Vec<Arc<Resource>> = Vec::new();
        for &handle in handles {
            let Some(lock) = self.ns.resolve(handle) else {
                debug!(%handle, "cancel of unknown lock, already gone");
                continue;
            };
            found += 1;
            // A callback still in flight sees the cancel arrived.
            lock.set_flags(LockFlags::CANCEL);
            let res = lock.resource();
            if !resources.iter().any(|r| Arc::ptr_eq(r, &res)) {
                resources.push(res);
            }
            self.cancel_lock(&lock);
        }
        for res in resources {
            if let Some(store) = &self.lvb_store {
                if let Some(lvb) = store.refresh(&res) {
                    res.set_lvb(Some(lvb));
                }
            }
            self.reprocess(&res).await;
            self.ns.reclaim(&res);
        }
        found
    }

    // Server-local locks

    /// Take a lock for the server itself and wait until it is granted.
    /// The caller holds one reference in `mode` and releases it with
    /// [`decref`](Self::decref).
    pub async fn enqueue_local(
        &self,
        resource: ResourceId,
        lock_type: LockType,
        mode: LockMode,
        policy: PolicyData,
        flags: LockFlags,
    ) -> Result<LockRef> {
        if !policy.fits(lock_type) {
            return Err(DlmError::InvalidArgument(format!(
                "policy {:?} does not fit a {} lock",
                policy, lock_type
            )));
        }
        let lock = self
            .ns
            .create_lock(resource, lock_type, mode, policy, AstTarget::Local, None)?;
        lock.set_flags(LockFlags::LOCAL | (flags & LockFlags::INHERIT_MASK));
        lock.add_ref(mode);
        self.lock_enqueue(&lock, flags & !LockFlags::REPLAY).await;

        let obd_timeout = self.config().timeouts.obd_timeout;
        loop {
            let settled = lock
                .wait_for(Some(obd_timeout), |s| {
                    s.is_granted() || s.flags.intersects(LockFlags::FAILED | LockFlags::DESTROYED)
                })
                .await;
            if settled {
                break;
            }
            warn!(lock = %lock.debug(), "local lock still not granted");
        }
        if !lock.is_granted() {
            return Err(DlmError::LockFailed(format!("local lock {}", lock.handle())));
        }
        debug!(lock = %lock.debug(), "local lock granted");
        Ok(lock)
    }

    /// Drop a reference on a server-local lock, running any blocking
    /// callback that was waiting for it.
    pub async fn decref(&self, lock: &LockRef, mode: LockMode) {
        let unused = lock.drop_ref(mode);
        if unused && lock.has_flags(LockFlags::CBPENDING) {
            debug!(lock = %lock.debug(), "final decref, running deferred cancel");
            self.cancel_and_reprocess(lock).await;
        }
    }

    /// Cancel a server-local lock.
    pub async fn cancel_local(&self, lock: &LockRef) {
        self.cancel_and_reprocess(lock).await;
    }

    // Glimpse and revocation

    /// Ask the holder of `lock` for its value block and cache it on the
    /// resource.
    pub async fn glimpse(&self, lock: &LockRef) -> Result<Option<Bytes>> {
        let lvb = self.glimpse_ast(lock).await?;
        if lvb.is_some() {
            lock.resource().set_lvb(lvb.clone());
        }
        Ok(lvb)
    }

    /// Ask a client to give back every granted metadata lock it holds.
    pub async fn revoke_export_locks(&self, export: &Arc<Export>) -> usize {
        let mut revoked = Vec::new();
        for lock in export.held_locks() {
            if !matches!(lock.lock_type(), LockType::Plain | LockType::Ibits) {
                continue;
            }
            let picked = lock.with_res_and_lock(|_, state| {
                if !state.is_granted() || state.flags.contains(LockFlags::AST_SENT) {
                    return false;
                }
                state.flags.insert(LockFlags::AST_SENT);
                true
            });
            if picked {
                revoked.push(lock);
            }
        }
        debug!(export = %export.id(), count = revoked.len(), "revoking export locks");

        let mut restart = Vec::new();
        for lock in &revoked {
            let mut desc = lock.desc();
            desc.req_mode = LockMode::Ex;
            desc.granted_mode = None;
            let outcome = self
                .blocking_ast(lock, BlockingEvent::Blocking(Some(desc)))
                .await;
            if outcome == AstOutcome::Restart {
                restart.push(lock.resource());
            }
        }
        for res in restart {
            self.reprocess(&res).await;
        }
        revoked.len()
    }

    // Core state machine

    /// Place a new lock: replayed locks go straight to the list the client
    /// saw them on, everything else through the grant policy. Blocking
    /// callbacks go out before this returns. Returns the blocked flags for
    /// the reply.
    async fn lock_enqueue(&self, lock: &LockRef, req_flags: LockFlags) -> LockFlags {
        if req_flags.contains(LockFlags::REPLAY) {
            let placed = lock.with_res_and_lock(|res, state| {
                if req_flags.contains(LockFlags::BLOCK_CONV) {
                    res.add(Queue::Converting, lock, state);
                } else if req_flags.contains(LockFlags::BLOCK_WAIT) {
                    res.add(Queue::Waiting, lock, state);
                } else if req_flags.contains(LockFlags::BLOCK_GRANTED) {
                    res.grant(lock, state);
                } else {
                    return None;
                }
                Some(state.flags & LockFlags::BLOCKED_MASK)
            });
            if let Some(flags) = placed {
                debug!(lock = %lock.debug(), "replayed lock placed");
                return flags;
            }
        }

        let lock_type = lock.lock_type();
        loop {
            let mut bl_work = Vec::new();
            let decision = lock.with_res_and_lock(|res, state| {
                policy::process_enqueue(res, lock, lock_type, state, &mut bl_work)
            });
            let flags = match decision {
                EnqueueDecision::Granted => {
                    self.counters.grants.fetch_add(1, Ordering::Relaxed);
                    observability::record_grant(self.ns.name());
                    LockFlags::empty()
                }
                EnqueueDecision::Blocked(flags) => flags,
            };
            if !self.run_bl_work(lock, bl_work).await || decision == EnqueueDecision::Granted {
                return flags;
            }
            debug!(lock = %lock.debug(), "holder cancelled, retrying enqueue");
        }
    }

    /// Send blocking callbacks to `holders` on behalf of `requester`.
    /// Returns true if any of them cancelled its lock.
    async fn run_bl_work(&self, requester: &LockRef, holders: Vec<LockRef>) -> bool {
        if holders.is_empty() {
            return false;
        }
        let desc = requester.desc();
        let mut restart = false;
        for holder in holders {
            let outcome = self
                .blocking_ast(&holder, BlockingEvent::Blocking(Some(desc.clone())))
                .await;
            restart |= outcome == AstOutcome::Restart;
        }
        restart
    }

    /// Convert a granted lock to `mode`: in place when nothing conflicts,
    /// otherwise onto the converting list behind blocking callbacks.
    async fn lock_convert(&self, lock: &LockRef, mode: LockMode) -> Result<LockFlags> {
        let lock_type = lock.lock_type();
        let mut bl_work = Vec::new();
        let flags = lock.with_res_and_lock(|res, state| {
            if !state.is_granted() || state.flags.contains(LockFlags::CANCELING) {
                return Err(DlmError::Deadlock(format!(
                    "lock {} is not granted",
                    lock.handle()
                )));
            }
            if state.granted_mode == Some(mode) {
                return Ok(LockFlags::empty());
            }
            let old = state.req_mode;
            state.req_mode = mode;
            let compatible = policy::compat_queue(
                &res.granted,
                lock,
                lock_type,
                state,
                AtSelf::Skip,
                Some(&mut bl_work),
            ) & policy::compat_queue(
                &res.converting,
                lock,
                lock_type,
                state,
                AtSelf::Skip,
                Some(&mut bl_work),
            );
            if compatible {
                res.regrant_in_place(state);
                debug!(handle = %lock.handle(), from = %old, to = %mode, "converted in place");
                return Ok(LockFlags::empty());
            }
            res.unlink(lock, state);
            res.add(Queue::Converting, lock, state);
            state.flags.insert(LockFlags::BLOCK_CONV);
            Ok(LockFlags::BLOCK_CONV)
        })?;
        self.run_bl_work(lock, bl_work).await;
        Ok(flags)
    }

    /// Grant whatever the resource's lists now allow and send completions,
    /// starting over whenever a callback changed the lock set.
    pub async fn reprocess(&self, res: &Arc<Resource>) {
        loop {
            let granted = {
                let mut state = res.state();
                policy::reprocess_queues(&mut state, res.lock_type())
            };
            if granted.is_empty() {
                return;
            }
            let mut restart = false;
            for lock in &granted {
                self.counters.grants.fetch_add(1, Ordering::Relaxed);
                observability::record_grant(self.ns.name());
                if self.completion_ast(lock, LockFlags::empty()).await == AstOutcome::Restart {
                    restart = true;
                }
            }
            if !restart {
                return;
            }
            debug!(resource = %res.id(), "reprocess restarting");
        }
    }

    /// Cancel `lock` without reprocessing. Returns false if someone else
    /// already cancelled it.
    pub(crate) fn cancel_lock(&self, lock: &LockRef) -> bool {
        if !lock.try_set_canceling() {
            debug!(handle = %lock.handle(), "lock already being cancelled");
            return false;
        }
        self.finish_cancel(lock);
        true
    }

    /// Tear down a lock whose CANCELING flag the caller owns.
    fn finish_cancel(&self, lock: &LockRef) {
        self.waiting.remove(lock);
        lock.with_res_and_lock(|res, state| res.unlink(lock, state));
        if let Some(export) = lock.export() {
            export.remove_lock(lock.handle());
        }
        self.ns.destroy(lock);
        self.counters.cancels.fetch_add(1, Ordering::Relaxed);
        debug!(handle = %lock.handle(), "lock cancelled");
    }

    async fn cancel_and_reprocess(&self, lock: &LockRef) {
        if self.cancel_lock(lock) {
            let res = lock.resource();
            self.reprocess(&res).await;
            self.ns.reclaim(&res);
        }
    }

    /// Start timing a callback on `lock`, unless it is a group lock or has
    /// no export to evict.
    fn start_callback_timer(&self, lock: &LockRef) {
        if !lock.has_export() {
            return;
        }
        if lock.req_mode() == LockMode::Group {
            debug!(handle = %lock.handle(), "not timing a group lock");
            return;
        }
        self.waiting.add(lock);
    }

    fn pool_hint(&self) -> PoolHint {
        self.ns.recalc_server_pool();
        PoolHint {
            slv: self.ns.slv(),
            limit: self.ns.limit(),
        }
    }

    fn rq_timeout(&self) -> std::time::Duration {
        self.config().rq_timeout()
    }

    /// Interpret a failed callback. Unresponsive full clients are handed to
    /// the eviction worker; everything else just loses the lock.
    fn handle_ast_error(&self, lock: &LockRef, err: RpcError, kind: AstKind) -> AstOutcome {
        let status = DlmError::from(err.clone()).to_errno();
        observability::record_ast_failure(kind, status);
        let export = lock.export();

        if err.is_unresponsive() {
            match export {
                Some(export) if !export.is_libclient() && !lock.has_flags(LockFlags::CANCEL) => {
                    self.waiting.remove(lock);
                    error!(
                        lock = %lock.debug(),
                        client = export.client(),
                        %kind,
                        error = %err,
                        "lock callback timed out, evicting client"
                    );
                    self.waiting.push_expired(lock);
                }
                Some(export) if export.is_libclient() => {
                    debug!(lock = %lock.debug(), %kind, "callback to library client timed out, cancelling lock");
                    self.cancel_lock(lock);
                }
                Some(_) => {
                    debug!(lock = %lock.debug(), %kind, "callback timed out but cancel was received");
                    self.cancel_lock(lock);
                }
                None => {
                    debug!(lock = %lock.debug(), %kind, "callback to departed client, cancelling lock");
                    self.cancel_lock(lock);
                }
            }
            return AstOutcome::Restart;
        }

        if status == libc::EINVAL {
            debug!(lock = %lock.debug(), %kind, status, "client returned error from callback, normal race");
        } else {
            error!(lock = %lock.debug(), %kind, status, "client returned error from callback");
        }
        self.cancel_lock(lock);
        AstOutcome::Restart
    }

    fn ast_request(lock: &LockRef, state: &LockState, flags: LockFlags, lvb: Option<Bytes>) -> AstRequest {
        AstRequest {
            handle: state.remote_handle,
            desc: LockDesc {
                resource: lock.resource().id(),
                lock_type: lock.lock_type(),
                req_mode: state.req_mode,
                granted_mode: state.granted_mode,
                policy: state.policy,
            },
            flags,
            lvb,
        }
    }

    async fn remote_blocking(&self, lock: &LockRef, desc: Option<LockDesc>) -> AstOutcome {
        let Some(export) = lock.export() else {
            return self.handle_ast_error(lock, RpcError::NotConnected, AstKind::Blocking);
        };
        let resource = lock.resource().id();
        let prepared = lock.with_res_and_lock(|_, state| {
            if !state.is_granted() {
                debug!(handle = %lock.handle(), "lock not granted, blocking callback goes with the completion");
                return None;
            }
            if state.flags.contains(LockFlags::DESTROYED) {
                return None;
            }
            let desc = desc.clone().unwrap_or(LockDesc {
                resource,
                lock_type: lock.lock_type(),
                req_mode: state.req_mode,
                granted_mode: state.granted_mode,
                policy: state.policy,
            });
            let req = AstRequest {
                handle: state.remote_handle,
                desc,
                flags: state.flags & LockFlags::AST_MASK,
                lvb: None,
            };
            Some((req, state.flags.contains(LockFlags::CANCEL_ON_BLOCK)))
        });
        let Some((req, instant_cancel)) = prepared else {
            return AstOutcome::Done;
        };

        debug!(lock = %lock.debug(), "server sending blocking callback");
        self.counters.blocking_asts.fetch_add(1, Ordering::Relaxed);
        observability::record_ast(AstKind::Blocking);
        let transport = export.transport().clone();
        if instant_cancel {
            self.cancel_lock(lock);
            drop(transport.send_async(DlmRequest::Blocking(req), self.rq_timeout()));
            return AstOutcome::Restart;
        }

        self.start_callback_timer(lock);
        match transport
            .send_and_wait(DlmRequest::Blocking(req), self.rq_timeout())
            .await
        {
            Ok(_) => AstOutcome::Done,
            Err(e) => self.handle_ast_error(lock, e, AstKind::Blocking),
        }
    }

    async fn remote_completion(&self, lock: &LockRef, flags: LockFlags) -> AstOutcome {
        let Some(export) = lock.export() else {
            return self.handle_ast_error(lock, RpcError::NotConnected, AstKind::Completion);
        };
        let obd_timeout = self.config().timeouts.obd_timeout;
        let (mut req, ast_sent, waited) = lock.with_res_and_lock(|res, state| {
            let req = Self::ast_request(lock, state, flags, res.lvb.clone());
            (
                req,
                state.flags.contains(LockFlags::AST_SENT),
                state.enqueued_at.elapsed(),
            )
        });
        if waited > obd_timeout {
            warn!(lock = %lock.debug(), waited_ms = waited.as_millis() as u64, "enqueue wait exceeded the global timeout");
        }
        debug!(lock = %lock.debug(), "server sending completion callback");

        let mut instant_cancel = false;
        if ast_sent {
            req.flags |= LockFlags::AST_SENT;
            if lock.has_flags(LockFlags::CANCEL_ON_BLOCK) {
                self.cancel_lock(lock);
                instant_cancel = true;
            } else {
                self.start_callback_timer(lock);
            }
        }

        self.counters.completion_asts.fetch_add(1, Ordering::Relaxed);
        observability::record_ast(AstKind::Completion);
        match export
            .transport()
            .send_and_wait(DlmRequest::Completion(req), self.rq_timeout())
            .await
        {
            Ok(_) if instant_cancel => AstOutcome::Restart,
            Ok(_) => AstOutcome::Done,
            Err(e) => self.handle_ast_error(lock, e, AstKind::Completion),
        }
    }

    async fn remote_glimpse(&self, lock: &LockRef) -> Result<Option<Bytes>> {
        let export = lock
            .export()
            .ok_or_else(|| DlmError::NotConnected(format!("lock {} has no export", lock.handle())))?;
        let req = {
            let state = lock.state();
            Self::ast_request(lock, &state, LockFlags::empty(), None)
        };
        self.counters.glimpse_asts.fetch_add(1, Ordering::Relaxed);
        observability::record_ast(AstKind::Glimpse);
        match export
            .transport()
            .send_and_wait(DlmRequest::Glimpse(req), self.rq_timeout())
            .await
        {
            Ok(DlmReply::Glimpse { lvb }) => Ok(lvb),
            Ok(other) => Err(DlmError::Protocol(format!(
                "unexpected glimpse reply {:?}",
                other
            ))),
            Err(RpcError::NoLockData) => {
                debug!(lock = %lock.debug(), "lost race, client has a lock but no data");
                Ok(None)
            }
            Err(e) => {
                self.handle_ast_error(lock, e.clone(), AstKind::Glimpse);
                Err(e.into())
            }
        }
    }

    /// Blocking callback on one of the server's own locks: cancel now if
    /// unused, otherwise when the last reference goes.
    fn local_blocking(&self, lock: &LockRef, desc: Option<LockDesc>) -> AstOutcome {
        lock.set_flags(LockFlags::CBPENDING);
        if !lock.is_unused() {
            debug!(lock = %lock.debug(), "local lock in use, cancel deferred");
            return AstOutcome::Done;
        }
        let work = BlockingWork::Blocking {
            ns: self.ns.clone(),
            lock: lock.clone(),
            desc,
        };
        match self.pool.submit(work) {
            Ok(()) => AstOutcome::Done,
            Err(_) => {
                self.cancel_lock(lock);
                AstOutcome::Restart
            }
        }
    }

    // Shutdown

    /// Stop the server. Without `force`, refuses while clients hold locks.
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        let busy: usize = self.exports().iter().map(|e| e.lock_count()).sum();
        if busy > 0 && !force {
            return Err(DlmError::Busy(format!(
                "namespace {} still has {} client locks",
                self.ns.name(),
                busy
            )));
        }
        info!(namespace = self.ns.name(), force, "shutting down lock server");
        for lock in self.ns.locks() {
            self.cancel_lock(&lock);
        }
        self.exports.write().clear();
        self.shutdown.shutdown();
        self.pool.shutdown().await;
        self.tasks.join(self.config().timeouts.obd_timeout).await;
        Ok(())
    }
}

#[async_trait]
impl AstHandler for LockServer {
    async fn blocking_ast(&self, lock: &LockRef, event: BlockingEvent) -> AstOutcome {
        let BlockingEvent::Blocking(desc) = event else {
            return AstOutcome::Done;
        };
        if lock.has_flags(LockFlags::CANCELING) {
            return AstOutcome::Done;
        }
        match lock.target() {
            AstTarget::Remote => self.remote_blocking(lock, desc).await,
            AstTarget::Local => self.local_blocking(lock, desc),
            AstTarget::Client => {
                warn!(lock = %lock.debug(), "client lock in a server namespace");
                AstOutcome::Done
            }
        }
    }

    async fn completion_ast(&self, lock: &LockRef, flags: LockFlags) -> AstOutcome {
        match lock.target() {
            AstTarget::Remote => self.remote_completion(lock, flags).await,
            AstTarget::Local | AstTarget::Client => {
                lock.notify();
                AstOutcome::Done
            }
        }
    }

    async fn glimpse_ast(&self, lock: &LockRef) -> Result<Option<Bytes>> {
        match lock.target() {
            AstTarget::Remote => self.remote_glimpse(lock).await,
            AstTarget::Local | AstTarget::Client => Ok(lock.resource().lvb()),
        }
    }
}

#[async_trait]
impl BlockingWorker for LockServer {
    async fn handle_work(&self, work: BlockingWork) {
        match work {
            BlockingWork::Blocking { lock, .. } => {
                if lock.is_unused() {
                    self.cancel_and_reprocess(&lock).await;
                }
            }
            BlockingWork::Cancel { locks, .. } => {
                let mut resources: Vec<Arc<Resource>> = Vec::new();
                for lock in locks {
                    self.finish_cancel(&lock);
                    let res = lock.resource();
                    if !resources.iter().any(|r| Arc::ptr_eq(r, &res)) {
                        resources.push(res);
                    }
                }
                for res in resources {
                    self.reprocess(&res).await;
                }
            }
        }
    }
}

/// Optional collaborators of a [`LockServer`].
pub struct LockServerBuilder {
    name: String,
    config: DlmConfig,
    dump: Arc<dyn DumpSink>,
    lvb_store: Option<Arc<dyn LvbStore>>,
}

impl LockServerBuilder {
    pub fn dump_sink(mut self, dump: Arc<dyn DumpSink>) -> Self {
        self.dump = dump;
        self
    }

    pub fn lvb_store(mut self, store: Arc<dyn LvbStore>) -> Self {
        self.lvb_store = Some(store);
        self
    }

    pub fn start(self) -> Arc<LockServer> {
        let config = Arc::new(self.config);
        let ns = Namespace::new(self.name, Side::Server, config.clone());
        let waiting = Arc::new(WaitingLocks::new(
            config.callback_window(),
            config.diagnostics.dump_on_timeout,
        ));
        let threads = config.ast.bl_threads;
        let server = Arc::new_cyclic(|weak: &Weak<LockServer>| LockServer {
            ns,
            waiting,
            pool: BlockingPool::start(threads, weak.clone()),
            exports: RwLock::new(HashMap::new()),
            dump: self.dump,
            lvb_store: self.lvb_store,
            shutdown: ShutdownCoordinator::new(),
            tasks: BackgroundTasks::new(),
            counters: Counters::default(),
        });

        let timer = server.waiting.clone().run_timer(server.shutdown.clone());
        server.tasks.push("waiting-lock timer", tokio::spawn(timer));
        let evictor = eviction::run(
            Arc::downgrade(&server),
            server.waiting.clone(),
            server.shutdown.clone(),
        );
        server.tasks.push("eviction", tokio::spawn(evictor));
        info!(
            namespace = server.ns.name(),
            bl_threads = threads,
            callback_window_secs = config.callback_window().as_secs(),
            "lock server started"
        );
        server
    }
}
