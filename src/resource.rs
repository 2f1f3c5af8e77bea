//! Lockable resources and their granted, converting and waiting lists.

use crate::lock::{LockRef, LockState, Queue};
use crate::types::{LockFlags, LockType, ResourceId};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A named lockable unit.
pub struct Resource {
    id: ResourceId,
    lock_type: LockType,
    state: Mutex<ResourceState>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("lock_type", &self.lock_type)
            .finish_non_exhaustive()
    }
}

/// Lists and value block of a resource, guarded by the resource lock.
#[derive(Default)]
pub struct ResourceState {
    pub granted: Vec<LockRef>,
    pub converting: Vec<LockRef>,
    pub waiting: Vec<LockRef>,
    pub lvb: Option<Bytes>,
}

impl Resource {
    pub fn new(id: ResourceId, lock_type: LockType) -> Self {
        Self {
            id,
            lock_type,
            state: Mutex::new(ResourceState::default()),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn state(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock()
    }

    pub fn lvb(&self) -> Option<Bytes> {
        self.state.lock().lvb.clone()
    }

    pub fn set_lvb(&self, lvb: Option<Bytes>) {
        self.state.lock().lvb = lvb;
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    /// Locks on every list, granted first.
    pub fn locks(&self) -> Vec<LockRef> {
        let state = self.state.lock();
        state
            .granted
            .iter()
            .chain(state.converting.iter())
            .chain(state.waiting.iter())
            .cloned()
            .collect()
    }
}

impl ResourceState {
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.converting.is_empty() && self.waiting.is_empty()
    }

    pub fn queue(&self, queue: Queue) -> &[LockRef] {
        match queue {
            Queue::Granted => &self.granted,
            Queue::Converting => &self.converting,
            Queue::Waiting => &self.waiting,
            Queue::None => &[],
        }
    }

    fn queue_mut(&mut self, queue: Queue) -> Option<&mut Vec<LockRef>> {
        match queue {
            Queue::Granted => Some(&mut self.granted),
            Queue::Converting => Some(&mut self.converting),
            Queue::Waiting => Some(&mut self.waiting),
            Queue::None => None,
        }
    }

    /// Append `lock` to `queue`. The lock must not be on any list.
    pub fn add(&mut self, queue: Queue, lock: &LockRef, state: &mut LockState) {
        debug_assert_eq!(state.queue, Queue::None, "lock already listed");
        debug_assert!(!state.flags.contains(LockFlags::DESTROYED));
        if let Some(list) = self.queue_mut(queue) {
            list.push(lock.clone());
            state.queue = queue;
        }
    }

    /// Take `lock` off whatever list it is on.
    pub fn unlink(&mut self, lock: &LockRef, state: &mut LockState) {
        let queue = state.queue;
        if let Some(list) = self.queue_mut(queue) {
            list.retain(|l| !Arc::ptr_eq(l, lock));
        }
        state.queue = Queue::None;
    }

    /// Grant `lock` in its requested mode and move it to the granted list.
    pub fn grant(&mut self, lock: &LockRef, state: &mut LockState) {
        if state.queue == Queue::Granted && state.is_granted() {
            return;
        }
        self.unlink(lock, state);
        state.granted_mode = Some(state.req_mode);
        state.flags.remove(LockFlags::BLOCKED_MASK);
        self.add(Queue::Granted, lock, state);
    }

    /// Change the mode of a granted lock in place, keeping its position.
    pub fn regrant_in_place(&mut self, state: &mut LockState) {
        debug_assert_eq!(state.queue, Queue::Granted);
        state.granted_mode = Some(state.req_mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstTarget;
    use crate::lock::Lock;
    use crate::types::{LockHandle, LockMode, PolicyData};

    fn lock_on(res: &Arc<Resource>, cookie: u64, mode: LockMode) -> LockRef {
        Arc::new(Lock::new(
            LockHandle(cookie),
            res.clone(),
            mode,
            PolicyData::None,
            AstTarget::Local,
            None,
        ))
    }

    #[test]
    fn test_membership_is_exclusive() {
        let res = Arc::new(Resource::new(ResourceId::new(9), LockType::Plain));
        let lock = lock_on(&res, 1, LockMode::Ex);

        lock.with_res_and_lock(|r, s| r.add(Queue::Waiting, &lock, s));
        assert_eq!(res.state().waiting.len(), 1);

        lock.with_res_and_lock(|r, s| r.grant(&lock, s));
        {
            let state = res.state();
            assert!(state.waiting.is_empty());
            assert_eq!(state.granted.len(), 1);
        }
        assert_eq!(lock.granted_mode(), Some(LockMode::Ex));

        lock.with_res_and_lock(|r, s| r.unlink(&lock, s));
        assert!(res.is_empty());
        assert_eq!(lock.state().queue, Queue::None);
    }

    #[test]
    fn test_locks_lists_granted_first() {
        let res = Arc::new(Resource::new(ResourceId::new(9), LockType::Plain));
        let waiter = lock_on(&res, 1, LockMode::Pr);
        let holder = lock_on(&res, 2, LockMode::Ex);
        waiter.with_res_and_lock(|r, s| r.add(Queue::Waiting, &waiter, s));
        holder.with_res_and_lock(|r, s| r.grant(&holder, s));

        let handles: Vec<_> = res.locks().iter().map(|l| l.handle()).collect();
        assert_eq!(handles, vec![LockHandle(2), LockHandle(1)]);
    }
}
