//! Lock objects.
//!
//! A [`Lock`] is shared as a [`LockRef`]; the last reference frees it. Each
//! lock belongs to exactly one [`Resource`] and sits on at most one of the
//! resource's granted, converting or waiting lists. List membership and modes
//! change only while the resource lock is held; flags and reference counts
//! are guarded by the lock's own mutex, always taken after the resource's
//! (see [`Lock::with_res_and_lock`]).

use crate::ast::AstTarget;
use crate::export::Export;
use crate::resource::{Resource, ResourceState};
use crate::types::{LockDesc, LockFlags, LockHandle, LockMode, LockType, PolicyData};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::error;

/// Shared handle to a lock.
pub type LockRef = Arc<Lock>;

/// Which resource list a lock is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    None,
    Granted,
    Converting,
    Waiting,
}

/// Mutable lock state.
#[derive(Debug)]
pub struct LockState {
    pub req_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub policy: PolicyData,
    pub flags: LockFlags,
    pub readers: u32,
    pub writers: u32,
    /// The peer's handle for this lock.
    pub remote_handle: LockHandle,
    pub queue: Queue,
    pub last_used: Instant,
    pub enqueued_at: Instant,
    pub lvb: Option<Bytes>,
}

impl LockState {
    pub fn is_granted(&self) -> bool {
        self.granted_mode == Some(self.req_mode)
    }

    pub fn is_unused(&self) -> bool {
        self.readers == 0 && self.writers == 0
    }

    /// Count one more reader or writer in `mode`.
    pub fn add_ref(&mut self, mode: LockMode) {
        if mode.is_writer() {
            self.writers += 1;
        } else {
            self.readers += 1;
        }
    }
}

/// A granted or requested lock.
pub struct Lock {
    handle: LockHandle,
    lock_type: LockType,
    target: AstTarget,
    export: Option<Weak<Export>>,
    resource: Mutex<Arc<Resource>>,
    state: Mutex<LockState>,
    changed: watch::Sender<u64>,
}

impl Lock {
    pub(crate) fn new(
        handle: LockHandle,
        resource: Arc<Resource>,
        mode: LockMode,
        policy: PolicyData,
        target: AstTarget,
        export: Option<&Arc<Export>>,
    ) -> Self {
        let now = Instant::now();
        let (changed, _) = watch::channel(0);
        Self {
            handle,
            lock_type: resource.lock_type(),
            target,
            export: export.map(Arc::downgrade),
            resource: Mutex::new(resource),
            state: Mutex::new(LockState {
                req_mode: mode,
                granted_mode: None,
                policy,
                flags: LockFlags::empty(),
                readers: 0,
                writers: 0,
                remote_handle: LockHandle::NONE,
                queue: Queue::None,
                last_used: now,
                enqueued_at: now,
                lvb: None,
            }),
            changed,
        }
    }

    pub fn handle(&self) -> LockHandle {
        self.handle
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn target(&self) -> AstTarget {
        self.target
    }

    /// The export holding this lock; `None` for client and server-local locks.
    pub fn export(&self) -> Option<Arc<Export>> {
        self.export.as_ref().and_then(Weak::upgrade)
    }

    /// Whether the lock was created on behalf of an export.
    pub fn has_export(&self) -> bool {
        self.export.is_some()
    }

    pub fn resource(&self) -> Arc<Resource> {
        self.resource.lock().clone()
    }

    pub(crate) fn set_resource(&self, resource: Arc<Resource>) {
        *self.resource.lock() = resource;
    }

    /// Lock the lock state alone. Holding two lock states at once is only
    /// allowed under their resource's lock.
    pub fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock()
    }

    /// Run `f` with the resource lock and then the lock state held.
    pub fn with_res_and_lock<R>(
        &self,
        f: impl FnOnce(&mut ResourceState, &mut LockState) -> R,
    ) -> R {
        loop {
            let resource = self.resource();
            let mut res = resource.state();
            // The resource may have moved while we waited for it.
            if !Arc::ptr_eq(&resource, &*self.resource.lock()) {
                continue;
            }
            let mut state = self.state.lock();
            return f(&mut res, &mut state);
        }
    }

    pub fn flags(&self) -> LockFlags {
        self.state.lock().flags
    }

    pub fn has_flags(&self, flags: LockFlags) -> bool {
        self.state.lock().flags.intersects(flags)
    }

    pub fn set_flags(&self, flags: LockFlags) {
        self.state.lock().flags.insert(flags);
    }

    /// Claim the cancel. Returns false if another caller already did.
    pub fn try_set_canceling(&self) -> bool {
        let mut state = self.state.lock();
        if state.flags.contains(LockFlags::CANCELING) {
            return false;
        }
        state.flags.insert(LockFlags::CANCELING | LockFlags::CBPENDING);
        true
    }

    pub fn is_granted(&self) -> bool {
        self.state.lock().is_granted()
    }

    pub fn req_mode(&self) -> LockMode {
        self.state.lock().req_mode
    }

    pub fn granted_mode(&self) -> Option<LockMode> {
        self.state.lock().granted_mode
    }

    pub fn remote_handle(&self) -> LockHandle {
        self.state.lock().remote_handle
    }

    pub fn set_remote_handle(&self, handle: LockHandle) {
        self.state.lock().remote_handle = handle;
    }

    pub fn lvb(&self) -> Option<Bytes> {
        self.state.lock().lvb.clone()
    }

    /// Current descriptor.
    pub fn desc(&self) -> LockDesc {
        let resource = self.resource().id();
        let state = self.state.lock();
        LockDesc {
            resource,
            lock_type: self.lock_type,
            req_mode: state.req_mode,
            granted_mode: state.granted_mode,
            policy: state.policy,
        }
    }

    /// Take a reader or writer reference.
    pub fn add_ref(&self, mode: LockMode) {
        self.state.lock().add_ref(mode);
    }

    /// Drop a reference; returns true once the lock is unused.
    pub fn drop_ref(&self, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        let count = if mode.is_writer() {
            &mut state.writers
        } else {
            &mut state.readers
        };
        if *count == 0 {
            error!(handle = %self.handle, %mode, "reference count underflow");
        } else {
            *count -= 1;
        }
        state.is_unused()
    }

    pub fn is_unused(&self) -> bool {
        self.state.lock().is_unused()
    }

    /// Record a use now.
    pub fn touch(&self) {
        self.state.lock().last_used = Instant::now();
    }

    /// Wake anyone waiting on this lock's state.
    pub fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Wait until `done` holds, checking after every state change.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for<F>(&self, timeout: Option<Duration>, mut done: F) -> bool
    where
        F: FnMut(&LockState) -> bool,
    {
        let mut rx = self.changed.subscribe();
        let wait = async {
            loop {
                let finished = {
                    let state = self.state.lock();
                    done(&*state)
                };
                if finished {
                    return;
                }
                // The sender lives as long as the lock.
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    /// Loggable summary.
    pub fn debug(&self) -> LockDebug<'_> {
        LockDebug(self)
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.debug())
    }
}

/// Display adapter listing a lock's identity and state.
pub struct LockDebug<'a>(&'a Lock);

impl fmt::Display for LockDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lock = self.0;
        let res = lock.resource().id();
        let state = lock.state.lock();
        let granted = state
            .granted_mode
            .map(|m| m.to_string())
            .unwrap_or_else(|| "--".to_string());
        write!(
            f,
            "lock {} remote {} res {} {} {}/{} rc {}/{} flags {:#x}",
            lock.handle,
            state.remote_handle,
            res,
            lock.lock_type,
            granted,
            state.req_mode,
            state.readers,
            state.writers,
            state.flags.bits()
        )
    }
}
