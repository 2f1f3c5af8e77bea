//! Waiting-lock tracker.
//!
//! Locks whose holder was sent a blocking callback wait here with a deadline.
//! The list is in deadline order because every deadline is `now + window`.
//! One timer task sleeps until the head's deadline, rounded up to a whole
//! second so neighbouring deadlines fire together. Expired locks move to a
//! second list that the eviction worker drains; the timer itself never
//! blocks on anything but the tracker lock.
//!
//! Lock order: the tracker lock may be followed by a lock state, never the
//! other way round.

use crate::lock::LockRef;
use crate::observability;
use crate::shutdown::ShutdownCoordinator;
use crate::types::{LockFlags, LockHandle};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

struct Entry {
    lock: LockRef,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    waiting: VecDeque<Entry>,
    expired: VecDeque<LockRef>,
    /// Handles on either list.
    members: HashSet<LockHandle>,
    dump_requested: bool,
    suspended: bool,
    /// When the last suspension ended.
    wakeup: Option<Instant>,
}

/// Deadline list, expiry timer state and the expired-lock handoff list.
pub struct WaitingLocks {
    inner: Mutex<Inner>,
    epoch: Instant,
    window: Duration,
    dump_on_timeout: bool,
    timer: watch::Sender<Option<Instant>>,
    expired_signal: Notify,
}

impl WaitingLocks {
    /// A tracker giving each lock `window` to be cancelled.
    pub fn new(window: Duration, dump_on_timeout: bool) -> Self {
        let (timer, _) = watch::channel(None);
        Self {
            inner: Mutex::new(Inner::default()),
            epoch: Instant::now(),
            window,
            dump_on_timeout,
            timer,
            expired_signal: Notify::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Start the callback timer for `lock`.
    ///
    /// Returns false if the lock is already tracked or already being
    /// cancelled.
    pub fn add(&self, lock: &LockRef) -> bool {
        let mut inner = self.inner.lock();
        if lock.has_flags(LockFlags::CANCELING | LockFlags::DESTROYED) {
            debug!(handle = %lock.handle(), "not timing a cancelled lock");
            return false;
        }
        if !inner.members.insert(lock.handle()) {
            return false;
        }
        let deadline = Instant::now() + self.window;
        inner.waiting.push_back(Entry {
            lock: lock.clone(),
            deadline,
        });
        let arm = self.round_up(deadline);
        let current = *self.timer.borrow();
        if current.map_or(true, |at| arm < at) {
            self.timer.send_replace(Some(arm));
        }
        observability::set_waiting_locks(inner.waiting.len());
        debug!(handle = %lock.handle(), ?deadline, "added waiting lock");
        true
    }

    /// Stop timing `lock`, on either list. Returns false if it was not there.
    pub fn remove(&self, lock: &LockRef) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.remove(&lock.handle()) {
            return false;
        }
        if let Some(pos) = inner
            .waiting
            .iter()
            .position(|e| Arc::ptr_eq(&e.lock, lock))
        {
            inner.waiting.remove(pos);
            if pos == 0 {
                self.rearm(&inner);
            }
        } else {
            inner.expired.retain(|l| !Arc::ptr_eq(l, lock));
        }
        observability::set_waiting_locks(inner.waiting.len());
        true
    }

    /// Restart the timer of `lock` with a full window.
    pub fn refresh(&self, lock: &LockRef) -> bool {
        self.remove(lock);
        self.add(lock)
    }

    pub fn is_waiting(&self, lock: &LockRef) -> bool {
        self.inner.lock().members.contains(&lock.handle())
    }

    /// Locks still inside their window.
    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn expired_len(&self) -> usize {
        self.inner.lock().expired.len()
    }

    /// When the timer will next fire.
    pub fn armed_deadline(&self) -> Option<Instant> {
        *self.timer.borrow()
    }

    /// Hold off expiry while the cluster recovers. Expired locks get another
    /// window instead of being evicted.
    pub fn suspend(&self) {
        self.inner.lock().suspended = true;
    }

    /// End a suspension. Locks timed before now get a fresh window when
    /// they come due.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.suspended = false;
        inner.wakeup = Some(Instant::now());
    }

    /// Move every lock due at `now` to the expired list and re-arm the
    /// timer. Returns how many expired.
    pub fn expire(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let mut expired = 0;
        while let Some(head) = inner.waiting.front() {
            if head.deadline > now {
                break;
            }
            let Some(entry) = inner.waiting.pop_front() else {
                break;
            };
            let added = entry.deadline.checked_sub(self.window);
            let recovering = inner.suspended
                || matches!((added, inner.wakeup), (Some(added), Some(wakeup)) if added < wakeup);
            if recovering {
                warn!(lock = %entry.lock.debug(), "recovery in progress, extending callback timeout");
                inner.waiting.push_back(Entry {
                    deadline: now + self.window,
                    lock: entry.lock,
                });
                continue;
            }
            error!(lock = %entry.lock.debug(), "lock callback timer expired, evicting client");
            inner.expired.push_back(entry.lock);
            expired += 1;
        }
        if expired > 0 && self.dump_on_timeout {
            inner.dump_requested = true;
        }
        self.rearm(&inner);
        observability::set_waiting_locks(inner.waiting.len());
        drop(inner);
        if expired > 0 {
            self.expired_signal.notify_one();
        }
        expired
    }

    /// Hand `lock` straight to the eviction worker, skipping its window.
    pub fn push_expired(&self, lock: &LockRef) -> bool {
        let mut inner = self.inner.lock();
        if lock.has_flags(LockFlags::CANCELING | LockFlags::DESTROYED) {
            return false;
        }
        if let Some(pos) = inner
            .waiting
            .iter()
            .position(|e| Arc::ptr_eq(&e.lock, lock))
        {
            inner.waiting.remove(pos);
            if pos == 0 {
                self.rearm(&inner);
            }
        } else if inner.expired.iter().any(|l| Arc::ptr_eq(l, lock)) {
            return false;
        }
        inner.members.insert(lock.handle());
        inner.expired.push_back(lock.clone());
        drop(inner);
        self.expired_signal.notify_one();
        true
    }

    /// Take the oldest expired lock.
    pub fn pop_expired(&self) -> Option<LockRef> {
        let mut inner = self.inner.lock();
        let lock = inner.expired.pop_front()?;
        inner.members.remove(&lock.handle());
        Some(lock)
    }

    /// Whether an expiry asked for a diagnostic dump; clears the request.
    pub fn take_dump_request(&self) -> bool {
        std::mem::take(&mut self.inner.lock().dump_requested)
    }

    /// Wait until something lands on the expired list.
    pub async fn expired_notified(&self) {
        self.expired_signal.notified().await
    }

    /// Timer task: sleep until the armed deadline, expire, repeat.
    pub async fn run_timer(self: Arc<Self>, shutdown: ShutdownCoordinator) {
        let mut armed = self.timer.subscribe();
        loop {
            let at = *armed.borrow_and_update();
            match at {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            self.expire(Instant::now());
                        }
                        changed = armed.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.wait_for_shutdown() => break,
                    }
                }
                None => {
                    tokio::select! {
                        changed = armed.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.wait_for_shutdown() => break,
                    }
                }
            }
        }
        debug!("waiting-lock timer stopped");
    }

    fn rearm(&self, inner: &Inner) {
        let next = inner.waiting.front().map(|e| self.round_up(e.deadline));
        self.timer.send_replace(next);
    }

    /// Next whole second after `deadline`, counted from the tracker's start.
    fn round_up(&self, deadline: Instant) -> Instant {
        let since = deadline.saturating_duration_since(self.epoch);
        self.epoch + Duration::from_secs(since.as_secs() + 1)
    }
}
