//! Lock namespaces.
//!
//! A [`Namespace`] owns its resource table, the handle table resolving lock
//! cookies, the unused-lock cache and the lock-volume pool figures. The
//! resource table and the unused cache each have their own lock; neither is
//! ever taken while a resource or lock state is held, and neither is held
//! across an await.

use crate::ast::AstTarget;
use crate::config::DlmConfig;
use crate::error::{DlmError, Result};
use crate::export::Export;
use crate::handle::HandleTable;
use crate::lock::{Lock, LockRef, Queue};
use crate::resource::Resource;
use crate::types::{LockFlags, LockHandle, LockMode, LockType, PolicyData, ResourceId};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which side of the protocol a namespace serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// Lock-volume figures shared between server and clients.
#[derive(Debug)]
pub struct PoolState {
    slv: AtomicU64,
    limit: AtomicU32,
    lock_volume_factor: AtomicU64,
    client_lock_volume: AtomicU64,
}

/// A lock namespace.
pub struct Namespace {
    name: String,
    side: Side,
    config: Arc<DlmConfig>,
    resources: RwLock<HashMap<ResourceId, Arc<Resource>>>,
    handles: HandleTable,
    unused: Mutex<LruCache<LockHandle, LockRef>>,
    max_unused: AtomicUsize,
    lru_resize: AtomicBool,
    pool: PoolState,
    lock_count: AtomicUsize,
}

impl Namespace {
    pub fn new(name: impl Into<String>, side: Side, config: Arc<DlmConfig>) -> Arc<Self> {
        let name = name.into();
        debug!(namespace = %name, ?side, "creating namespace");
        Arc::new(Self {
            max_unused: AtomicUsize::new(config.lru.max_unused),
            lru_resize: AtomicBool::new(config.lru.lru_resize),
            pool: PoolState {
                // 1 means no volume advertised yet
                slv: AtomicU64::new(1),
                limit: AtomicU32::new(0),
                lock_volume_factor: AtomicU64::new(config.lru.lock_volume_factor),
                client_lock_volume: AtomicU64::new(0),
            },
            name,
            side,
            config,
            resources: RwLock::new(HashMap::new()),
            handles: HandleTable::new(),
            unused: Mutex::new(LruCache::unbounded()),
            lock_count: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_client(&self) -> bool {
        self.side == Side::Client
    }

    pub fn config(&self) -> &Arc<DlmConfig> {
        &self.config
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    // Resources

    pub fn resource(&self, id: &ResourceId) -> Option<Arc<Resource>> {
        self.resources.read().get(id).cloned()
    }

    /// Find or create the resource `id`. An existing resource of another type
    /// is a protocol error.
    pub fn resource_get_or_create(&self, id: ResourceId, lock_type: LockType) -> Result<Arc<Resource>> {
        if let Some(res) = self.resource(&id) {
            return check_type(res, lock_type);
        }
        let mut resources = self.resources.write();
        let res = resources
            .entry(id)
            .or_insert_with(|| Arc::new(Resource::new(id, lock_type)))
            .clone();
        drop(resources);
        check_type(res, lock_type)
    }

    /// Drop `res` from the table if nothing uses it any more.
    pub fn reclaim(&self, res: &Arc<Resource>) {
        // One count for the table, one for the caller.
        self.reclaim_pinned(res, 2);
    }

    fn reclaim_pinned(&self, res: &Arc<Resource>, pins: usize) {
        let mut resources = self.resources.write();
        if Arc::strong_count(res) <= pins && res.is_empty() {
            if let Some(found) = resources.get(&res.id()) {
                if Arc::ptr_eq(found, res) {
                    resources.remove(&res.id());
                }
            }
        }
    }

    pub fn resources(&self) -> Vec<Arc<Resource>> {
        self.resources.read().values().cloned().collect()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.read().len()
    }

    // Locks

    /// Create a lock on `id` and register its handle.
    pub fn create_lock(
        &self,
        id: ResourceId,
        lock_type: LockType,
        mode: LockMode,
        policy: PolicyData,
        target: AstTarget,
        export: Option<&Arc<Export>>,
    ) -> Result<LockRef> {
        let max = self.config.limits.max_locks;
        // Take the slot first so concurrent creators cannot overshoot `max`.
        self.lock_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (max == 0 || count < max).then_some(count + 1)
            })
            .map_err(|_| {
                DlmError::OutOfMemory(format!("namespace {} holds {} locks", self.name, max))
            })?;
        let resource = match self.resource_get_or_create(id, lock_type) {
            Ok(resource) => resource,
            Err(e) => {
                self.lock_count.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        let lock = Arc::new_cyclic(|weak| {
            let handle = self.handles.insert(weak.clone());
            Lock::new(handle, resource, mode, policy, target, export)
        });
        Ok(lock)
    }

    /// Resolve a handle to a live lock.
    pub fn resolve(&self, handle: LockHandle) -> Option<LockRef> {
        self.handles.resolve(handle)
    }

    /// Unregister a lock that has already left its resource lists.
    ///
    /// Returns false if it was already destroyed.
    pub fn destroy(&self, lock: &LockRef) -> bool {
        {
            let mut state = lock.state();
            if state.flags.contains(LockFlags::DESTROYED) {
                return false;
            }
            debug_assert_eq!(state.queue, Queue::None, "destroying a listed lock");
            state.flags.insert(LockFlags::DESTROYED);
        }
        self.lru_remove(lock);
        if self.handles.remove(lock.handle()) {
            self.lock_count.fetch_sub(1, Ordering::AcqRel);
        }
        // The destroyed lock still points at its resource.
        self.reclaim_pinned(&lock.resource(), 3);
        lock.notify();
        true
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count.load(Ordering::Acquire)
    }

    /// Every lock on every resource.
    pub fn locks(&self) -> Vec<LockRef> {
        self.resources().iter().flat_map(|r| r.locks()).collect()
    }

    /// Move `lock` to resource `id`, keeping its list position kind.
    pub fn change_resource(&self, lock: &LockRef, id: ResourceId) -> Result<()> {
        if lock.resource().id() == id {
            return Ok(());
        }
        let target = self.resource_get_or_create(id, lock.lock_type())?;
        let old = lock.resource();
        let queue = lock.with_res_and_lock(|res, state| {
            let queue = state.queue;
            res.unlink(lock, state);
            queue
        });
        {
            // Hold the new resource while switching so no one sees the lock
            // listed nowhere under its new resource.
            let mut res = target.state();
            lock.set_resource(target.clone());
            let mut state = lock.state();
            if queue != Queue::None {
                res.add(queue, lock, &mut state);
            }
        }
        debug!(handle = %lock.handle(), from = %old.id(), to = %id, "lock changed resource");
        self.reclaim(&old);
        Ok(())
    }

    // Unused cache

    /// Park an unused lock at the young end of the cache.
    pub fn lru_add(&self, lock: &LockRef) {
        self.unused.lock().put(lock.handle(), lock.clone());
    }

    /// Take a lock out of the cache; false if it was not there.
    pub fn lru_remove(&self, lock: &LockRef) -> bool {
        self.unused.lock().pop(&lock.handle()).is_some()
    }

    pub fn unused_count(&self) -> usize {
        self.unused.lock().len()
    }

    /// Run `f` on the cache with its lock held. `f` may lock individual lock
    /// states but nothing else.
    pub fn with_unused<R>(&self, f: impl FnOnce(&mut LruCache<LockHandle, LockRef>) -> R) -> R {
        f(&mut self.unused.lock())
    }

    /// Cached locks, oldest first.
    pub fn unused_locks(&self) -> Vec<LockRef> {
        self.unused.lock().iter().rev().map(|(_, l)| l.clone()).collect()
    }

    pub fn max_unused(&self) -> usize {
        self.max_unused.load(Ordering::Relaxed)
    }

    pub fn set_max_unused(&self, max: usize) {
        self.max_unused.store(max, Ordering::Relaxed);
    }

    pub fn max_age(&self) -> Duration {
        self.config.lru.max_age
    }

    /// Whether the cache is sized from the server's lock volume.
    pub fn lru_resize(&self) -> bool {
        self.lru_resize.load(Ordering::Relaxed)
    }

    pub fn set_lru_resize(&self, enabled: bool) {
        self.lru_resize.store(enabled, Ordering::Relaxed);
    }

    // Pool

    pub fn slv(&self) -> u64 {
        self.pool.slv.load(Ordering::Relaxed)
    }

    pub fn set_slv(&self, slv: u64) {
        self.pool.slv.store(slv, Ordering::Relaxed);
    }

    pub fn limit(&self) -> u32 {
        self.pool.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: u32) {
        self.pool.limit.store(limit, Ordering::Relaxed);
    }

    pub fn lock_volume_factor(&self) -> u64 {
        self.pool.lock_volume_factor.load(Ordering::Relaxed)
    }

    pub fn set_lock_volume_factor(&self, factor: u64) {
        self.pool.lock_volume_factor.store(factor.max(1), Ordering::Relaxed);
    }

    /// Last volume computed by the resize policy.
    pub fn client_lock_volume(&self) -> u64 {
        self.pool.client_lock_volume.load(Ordering::Relaxed)
    }

    pub(crate) fn set_client_lock_volume(&self, volume: u64) {
        self.pool.client_lock_volume.store(volume, Ordering::Relaxed);
    }

    /// Recompute the server lock volume from the current lock count.
    ///
    /// The volume is the free lock slots times the maximum lock age in
    /// seconds, so clients holding old unused locks give them back first as
    /// the server fills up.
    pub fn recalc_server_pool(&self) {
        if self.is_client() {
            return;
        }
        let limit = match self.config.limits.max_locks {
            0 => u32::MAX as usize,
            max => max,
        };
        let free = limit.saturating_sub(self.lock_count()) as u64;
        let slv = free.saturating_mul(self.max_age().as_secs().max(1)).max(1);
        self.set_limit(limit.min(u32::MAX as usize) as u32);
        self.set_slv(slv);
    }
}

fn check_type(res: Arc<Resource>, lock_type: LockType) -> Result<Arc<Resource>> {
    if res.lock_type() != lock_type {
        return Err(DlmError::Protocol(format!(
            "resource {} is {}, request is {}",
            res.id(),
            res.lock_type(),
            lock_type
        )));
    }
    Ok(res)
}
