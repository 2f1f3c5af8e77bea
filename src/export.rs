//! Server-side peer sessions.
//!
//! An [`Export`] is one connected client as the server sees it: the reverse
//! transport used for callbacks and the list of locks the client holds. The
//! held-lock map is locked on its own and may be followed by a lock state,
//! never the other way round.

use crate::lock::LockRef;
use crate::rpc::Transport;
use crate::types::LockHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Features negotiated when the client connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    /// Client understands inode-bits locks.
    pub ibits: bool,
    /// Client batches several handles into one cancel.
    pub cancelset: bool,
    /// Client sizes its unused cache from the server lock volume.
    pub lru_resize: bool,
}

impl Default for ConnectFlags {
    fn default() -> Self {
        Self {
            ibits: true,
            cancelset: true,
            lru_resize: false,
        }
    }
}

/// One client session on the server.
pub struct Export {
    id: Uuid,
    client: String,
    transport: Arc<dyn Transport>,
    libclient: bool,
    connect: ConnectFlags,
    failed: AtomicBool,
    locks: Mutex<HashMap<LockHandle, LockRef>>,
}

impl Export {
    pub fn new(
        client: impl Into<String>,
        transport: Arc<dyn Transport>,
        libclient: bool,
        connect: ConnectFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            client: client.into(),
            transport,
            libclient,
            connect,
            failed: AtomicBool::new(false),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    /// Reverse channel for callbacks to this client.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Library-only clients cannot be evicted usefully; their locks are just
    /// cancelled when they stop answering.
    pub fn is_libclient(&self) -> bool {
        self.libclient
    }

    pub fn connect_flags(&self) -> ConnectFlags {
        self.connect
    }

    /// Mark the export failed. Only the first caller gets true.
    pub fn fail(&self) -> bool {
        self.failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn add_lock(&self, lock: &LockRef) {
        self.locks.lock().insert(lock.handle(), lock.clone());
    }

    pub(crate) fn remove_lock(&self, handle: LockHandle) -> Option<LockRef> {
        self.locks.lock().remove(&handle)
    }

    /// Snapshot of the locks this client holds.
    pub fn held_locks(&self) -> Vec<LockRef> {
        self.locks.lock().values().cloned().collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Find a held lock by the client's handle for it.
    pub fn find_by_remote(&self, remote: LockHandle) -> Option<LockRef> {
        self.locks
            .lock()
            .values()
            .find(|lock| lock.remote_handle() == remote)
            .cloned()
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Export")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("failed", &self.is_failed())
            .field("locks", &self.lock_count())
            .finish()
    }
}
