//! Grant policy: conflict detection per lock type and the queue scans used by
//! enqueue, conversion and reprocessing.
//!
//! Every function here runs with the resource lock held and the requesting
//! lock's state already locked by the caller; other locks' states are locked
//! one at a time while scanning.

use crate::lock::{LockRef, LockState, Queue};
use crate::resource::ResourceState;
use crate::types::{LockFlags, LockMode, LockType, PolicyData};
use std::sync::Arc;

/// Whether a lock held in `held` conflicts with a request for `req`.
pub fn conflicts(
    lock_type: LockType,
    held: LockMode,
    held_policy: &PolicyData,
    req: LockMode,
    req_policy: &PolicyData,
) -> bool {
    match (lock_type, held_policy, req_policy) {
        (LockType::Extent, PolicyData::Extent(a), PolicyData::Extent(b)) => {
            if !a.overlaps(b) {
                return false;
            }
            if held == LockMode::Group && req == LockMode::Group {
                return a.gid != b.gid;
            }
            !held.is_compatible(req)
        }
        (LockType::Ibits, PolicyData::Ibits { bits: a }, PolicyData::Ibits { bits: b }) => {
            a & b != 0 && !held.is_compatible(req)
        }
        (LockType::Flock, PolicyData::Flock(a), PolicyData::Flock(b)) => {
            a.owner != b.owner
                && a.start <= b.end
                && b.start <= a.end
                && !held.is_compatible(req)
        }
        _ => !held.is_compatible(req),
    }
}

/// Modes a listed lock currently claims: what it holds and what it waits for.
fn claimed_modes(state: &LockState) -> impl Iterator<Item = LockMode> {
    let held = match state.queue {
        Queue::Granted | Queue::Converting => state.granted_mode,
        _ => None,
    };
    let wanted = match state.queue {
        Queue::Converting | Queue::Waiting => Some(state.req_mode),
        Queue::Granted if state.granted_mode.is_none() => Some(state.req_mode),
        _ => None,
    };
    held.into_iter().chain(wanted)
}

/// How a scan treats the requesting lock when it finds it in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AtSelf {
    /// Only locks ahead of the requester count.
    Stop,
    /// Every other lock counts.
    Skip,
}

/// Scan `queue` for locks conflicting with the request described by `req`.
///
/// Without `work` the scan returns at the first conflict. With `work`, every
/// conflicting lock not yet marked AST_SENT is marked and collected for a
/// blocking callback.
pub(crate) fn compat_queue(
    queue: &[LockRef],
    lock: &LockRef,
    lock_type: LockType,
    req: &LockState,
    at_self: AtSelf,
    mut work: Option<&mut Vec<LockRef>>,
) -> bool {
    let mut compat = true;
    for other in queue {
        if Arc::ptr_eq(other, lock) {
            if at_self == AtSelf::Stop {
                break;
            }
            continue;
        }
        let mut state = other.state();
        let conflict = claimed_modes(&state)
            .any(|m| conflicts(lock_type, m, &state.policy, req.req_mode, &req.policy));
        if !conflict {
            continue;
        }
        compat = false;
        match work.as_deref_mut() {
            None => return false,
            Some(work) => {
                if !state.flags.contains(LockFlags::AST_SENT) {
                    state.flags.insert(LockFlags::AST_SENT);
                    work.push(other.clone());
                }
            }
        }
    }
    compat
}

/// Result of running the policy on a first-time enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueDecision {
    Granted,
    /// Blocked; carries which lists blocked it.
    Blocked(LockFlags),
}

/// Policy for a new request: grant now, or queue it and collect holders to notify.
pub(crate) fn process_enqueue(
    res: &mut ResourceState,
    lock: &LockRef,
    lock_type: LockType,
    state: &mut LockState,
    bl_work: &mut Vec<LockRef>,
) -> EnqueueDecision {
    let mut blocked = LockFlags::empty();
    if !compat_queue(&res.granted, lock, lock_type, state, AtSelf::Skip, Some(&mut *bl_work)) {
        blocked |= LockFlags::BLOCK_GRANTED;
    }
    if !compat_queue(&res.converting, lock, lock_type, state, AtSelf::Stop, Some(&mut *bl_work)) {
        blocked |= LockFlags::BLOCK_CONV;
    }
    if !compat_queue(&res.waiting, lock, lock_type, state, AtSelf::Stop, Some(&mut *bl_work)) {
        blocked |= LockFlags::BLOCK_WAIT;
    }

    if blocked.is_empty() {
        res.grant(lock, state);
        return EnqueueDecision::Granted;
    }
    if state.queue == Queue::None {
        res.add(Queue::Waiting, lock, state);
    }
    state.flags.remove(LockFlags::BLOCKED_MASK);
    state.flags.insert(blocked);
    EnqueueDecision::Blocked(blocked)
}

/// Reprocess one queued lock; true if it was granted.
fn try_grant_queued(res: &mut ResourceState, lock: &LockRef, lock_type: LockType) -> bool {
    let mut state = lock.state();
    if state.flags.contains(LockFlags::CANCELING) {
        return false;
    }
    let granted = res.granted.clone();
    let converting = res.converting.clone();
    if !compat_queue(&granted, lock, lock_type, &state, AtSelf::Skip, None) {
        return false;
    }
    if !compat_queue(&converting, lock, lock_type, &state, AtSelf::Stop, None) {
        return false;
    }
    if state.queue == Queue::Waiting {
        let waiting = res.waiting.clone();
        if !compat_queue(&waiting, lock, lock_type, &state, AtSelf::Stop, None) {
            return false;
        }
    }
    res.grant(lock, &mut state);
    true
}

/// Rescan the converting list and then, if it drained, the waiting list.
///
/// Locks are granted strictly in list order: the first lock that still
/// conflicts ends the pass for its list. Returns the locks granted.
pub(crate) fn reprocess_queues(res: &mut ResourceState, lock_type: LockType) -> Vec<LockRef> {
    let mut granted = Vec::new();
    let mut blocked = false;
    for lock in res.converting.clone() {
        if !try_grant_queued(res, &lock, lock_type) {
            blocked = true;
            break;
        }
        granted.push(lock);
    }
    if blocked {
        return granted;
    }
    for lock in res.waiting.clone() {
        if !try_grant_queued(res, &lock, lock_type) {
            break;
        }
        granted.push(lock);
    }
    granted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstTarget;
    use crate::lock::Lock;
    use crate::resource::Resource;
    use crate::types::{Extent, Flock, LockHandle, ResourceId};

    fn make(res: &Arc<Resource>, cookie: u64, mode: LockMode, policy: PolicyData) -> LockRef {
        Arc::new(Lock::new(
            LockHandle(cookie),
            res.clone(),
            mode,
            policy,
            AstTarget::Local,
            None,
        ))
    }

    fn enqueue(res: &Arc<Resource>, lock: &LockRef) -> (EnqueueDecision, Vec<LockRef>) {
        let mut work = Vec::new();
        let decision = lock.with_res_and_lock(|r, s| {
            process_enqueue(r, lock, res.lock_type(), s, &mut work)
        });
        (decision, work)
    }

    #[test]
    fn test_extent_conflicts_need_overlap() {
        let a = PolicyData::Extent(Extent::new(0, 4095));
        let b = PolicyData::Extent(Extent::new(4096, 8191));
        assert!(!conflicts(LockType::Extent, LockMode::Pw, &a, LockMode::Pw, &b));
        assert!(conflicts(LockType::Extent, LockMode::Pw, &a, LockMode::Pw, &a));
    }

    #[test]
    fn test_group_extents_share_by_gid() {
        let g1 = PolicyData::Extent(Extent { start: 0, end: 10, gid: 1 });
        let g2 = PolicyData::Extent(Extent { start: 0, end: 10, gid: 2 });
        assert!(!conflicts(LockType::Extent, LockMode::Group, &g1, LockMode::Group, &g1));
        assert!(conflicts(LockType::Extent, LockMode::Group, &g1, LockMode::Group, &g2));
    }

    #[test]
    fn test_ibits_conflict_on_shared_bits() {
        let lookup = PolicyData::Ibits { bits: 0b01 };
        let update = PolicyData::Ibits { bits: 0b10 };
        assert!(!conflicts(LockType::Ibits, LockMode::Ex, &lookup, LockMode::Ex, &update));
        assert!(conflicts(LockType::Ibits, LockMode::Ex, &lookup, LockMode::Pr, &lookup));
    }

    #[test]
    fn test_flock_same_owner_never_conflicts() {
        let mine = PolicyData::Flock(Flock { start: 0, end: 9, owner: 1, pid: 10 });
        let theirs = PolicyData::Flock(Flock { start: 5, end: 15, owner: 2, pid: 11 });
        assert!(!conflicts(LockType::Flock, LockMode::Pw, &mine, LockMode::Pw, &mine));
        assert!(conflicts(LockType::Flock, LockMode::Pw, &mine, LockMode::Pw, &theirs));
    }

    #[test]
    fn test_grant_matrix_on_plain_resource() {
        for held in LockMode::ALL {
            for wanted in LockMode::ALL {
                let res = Arc::new(Resource::new(ResourceId::new(1), LockType::Plain));
                let holder = make(&res, 1, held, PolicyData::None);
                let requester = make(&res, 2, wanted, PolicyData::None);
                assert_eq!(enqueue(&res, &holder).0, EnqueueDecision::Granted);

                let (decision, work) = enqueue(&res, &requester);
                if held.is_compatible(wanted) {
                    assert_eq!(decision, EnqueueDecision::Granted, "{} then {}", held, wanted);
                    assert!(work.is_empty());
                } else {
                    assert_eq!(
                        decision,
                        EnqueueDecision::Blocked(LockFlags::BLOCK_GRANTED),
                        "{} then {}",
                        held,
                        wanted
                    );
                    assert_eq!(work.len(), 1);
                    assert_eq!(requester.state().queue, Queue::Waiting);
                }
            }
        }
    }

    #[test]
    fn test_earlier_waiter_takes_precedence() {
        let res = Arc::new(Resource::new(ResourceId::new(1), LockType::Plain));
        let holder = make(&res, 1, LockMode::Pr, PolicyData::None);
        let writer = make(&res, 2, LockMode::Ex, PolicyData::None);
        let reader = make(&res, 3, LockMode::Pr, PolicyData::None);

        enqueue(&res, &holder);
        assert!(matches!(enqueue(&res, &writer).0, EnqueueDecision::Blocked(_)));
        // Compatible with the holder but queued behind the writer.
        assert_eq!(
            enqueue(&res, &reader).0,
            EnqueueDecision::Blocked(LockFlags::BLOCK_WAIT)
        );
    }

    #[test]
    fn test_rescan_replaces_stale_block_reasons() {
        let res = Arc::new(Resource::new(ResourceId::new(1), LockType::Plain));
        let holder = make(&res, 1, LockMode::Ex, PolicyData::None);
        let waiter = make(&res, 2, LockMode::Pr, PolicyData::None);
        enqueue(&res, &holder);
        enqueue(&res, &waiter);
        waiter.state().flags.insert(LockFlags::BLOCK_CONV | LockFlags::BLOCK_WAIT);

        assert_eq!(
            enqueue(&res, &waiter).0,
            EnqueueDecision::Blocked(LockFlags::BLOCK_GRANTED)
        );
        assert_eq!(waiter.flags() & LockFlags::BLOCKED_MASK, LockFlags::BLOCK_GRANTED);
        assert_eq!(res.state().waiting.len(), 1);
    }

    #[test]
    fn test_blocking_work_marks_ast_sent_once() {
        let res = Arc::new(Resource::new(ResourceId::new(1), LockType::Plain));
        let holder = make(&res, 1, LockMode::Ex, PolicyData::None);
        enqueue(&res, &holder);

        let (_, first) = enqueue(&res, &make(&res, 2, LockMode::Pr, PolicyData::None));
        let (_, second) = enqueue(&res, &make(&res, 3, LockMode::Pr, PolicyData::None));
        assert_eq!(first.len(), 1);
        assert!(holder.has_flags(LockFlags::AST_SENT));
        // Already marked, so the holder is not queued twice.
        assert!(second.is_empty());
    }

    #[test]
    fn test_reprocess_grants_in_fifo_order() {
        let res = Arc::new(Resource::new(ResourceId::new(1), LockType::Plain));
        let holder = make(&res, 1, LockMode::Ex, PolicyData::None);
        enqueue(&res, &holder);
        let waiters: Vec<_> = (2..6)
            .map(|i| make(&res, i, LockMode::Pr, PolicyData::None))
            .collect();
        for w in &waiters {
            enqueue(&res, w);
        }

        holder.with_res_and_lock(|r, s| r.unlink(&holder, s));
        let granted = reprocess_queues(&mut res.state(), LockType::Plain);
        let order: Vec<_> = granted.iter().map(|l| l.handle().0).collect();
        assert_eq!(order, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_reprocess_stops_at_first_conflict() {
        let res = Arc::new(Resource::new(ResourceId::new(1), LockType::Plain));
        let holder = make(&res, 1, LockMode::Ex, PolicyData::None);
        enqueue(&res, &holder);
        let ex = make(&res, 2, LockMode::Ex, PolicyData::None);
        let pr = make(&res, 3, LockMode::Pr, PolicyData::None);
        enqueue(&res, &ex);
        enqueue(&res, &pr);

        holder.with_res_and_lock(|r, s| r.unlink(&holder, s));
        let granted = reprocess_queues(&mut res.state(), LockType::Plain);
        assert_eq!(granted.len(), 1);
        assert!(ex.is_granted());
        assert!(!pr.is_granted());
    }
}
