//! Unused-lock cache scanning.
//!
//! A client keeps locks nobody references in its namespace's unused cache so
//! they can be matched again without a round trip. Scans walk the cache from
//! the oldest lock and ask the active [`LruPolicy`] whether to keep each one;
//! the first lock kept ends the scan. Selected locks are claimed for
//! cancellation (CBPENDING|CANCELING) and leave the cache.

use super::LockObserver;
use crate::lock::{Lock, LockRef};
use crate::namespace::Namespace;
use crate::types::{LockFlags, LockType};
use bitflags::bitflags;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Bytes per cached page when costing extent locks.
pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Which policy a scan asks for. Only one applies; see
    /// [`LruPolicy::for_namespace`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LruFlags: u32 {
        /// Give back locks older than the maximum age.
        const AGED = 1 << 0;
        /// Give back exactly the requested number of oldest locks.
        const PASSED = 1 << 1;
        /// Memory pressure: give back cheap locks.
        const SHRINK = 1 << 2;
        /// Give back locks whose volume exceeds the server's.
        const LRUR = 1 << 3;
    }
}

/// Decides, lock by lock, where a scan stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LruPolicy {
    /// Stop once `count` locks were taken.
    Default,
    Passed,
    /// Take every lock older than the maximum age, and at least `count`.
    Aged,
    Shrink,
    /// Compare the lock volume against the server lock volume.
    Resize,
}

impl LruPolicy {
    /// Policy for `flags` on `ns`. Resize-capable namespaces understand
    /// SHRINK, LRUR and PASSED; the others only AGED.
    pub fn for_namespace(ns: &Namespace, flags: LruFlags) -> Self {
        if ns.lru_resize() {
            if flags.contains(LruFlags::SHRINK) {
                LruPolicy::Shrink
            } else if flags.contains(LruFlags::LRUR) {
                LruPolicy::Resize
            } else if flags.contains(LruFlags::PASSED) {
                LruPolicy::Passed
            } else {
                LruPolicy::Default
            }
        } else if flags.contains(LruFlags::AGED) {
            LruPolicy::Aged
        } else {
            LruPolicy::Default
        }
    }

    /// Whether `lock` stays cached, ending the scan. `unused` is the number
    /// of cached locks not yet taken, `added` how many this scan took and
    /// `count` how many it aims for; a negative `count` asks for none.
    pub(crate) fn keep(
        &self,
        scan: &Scan<'_>,
        lock: &Lock,
        unused: usize,
        added: usize,
        count: isize,
    ) -> bool {
        let added = added as isize;
        let reached = count != 0 && added >= count;
        match self {
            LruPolicy::Default | LruPolicy::Passed => added >= count,
            LruPolicy::Aged => added >= count && scan.age(lock) < scan.ns.max_age(),
            LruPolicy::Shrink => reached || scan.cost(lock) > scan.ns.config().lru.shrink_thumb,
            LruPolicy::Resize => {
                if reached {
                    return true;
                }
                let slv = scan.ns.slv();
                let lv = scan
                    .ns
                    .lock_volume_factor()
                    .saturating_mul(scan.age(lock).as_secs())
                    .saturating_mul(unused as u64);
                scan.ns.set_client_lock_volume(lv);
                // 1 means the server has not sent a volume yet
                slv <= 1 || lv < slv
            }
        }
    }
}

/// One pass over a namespace's cache.
pub(crate) struct Scan<'a> {
    ns: &'a Namespace,
    now: Instant,
    observer: Option<&'a dyn LockObserver>,
}

impl<'a> Scan<'a> {
    pub(crate) fn new(ns: &'a Namespace, observer: Option<&'a dyn LockObserver>) -> Self {
        Self {
            ns,
            now: Instant::now(),
            observer,
        }
    }

    fn age(&self, lock: &Lock) -> Duration {
        self.now.saturating_duration_since(lock.state().last_used)
    }

    /// 1 for most locks; extent locks add the pages they cover, capped by
    /// what is actually cached under them.
    fn cost(&self, lock: &Lock) -> u64 {
        if lock.lock_type() != LockType::Extent {
            return 1;
        }
        let Some(extent) = lock.state().policy.extent().copied() else {
            return 1;
        };
        let mut pages = extent.end.saturating_sub(extent.start) / PAGE_SIZE;
        if let Some(resident) = self.observer.and_then(|o| o.resident_pages(lock)) {
            pages = pages.min(resident);
        }
        pages.saturating_add(1)
    }
}

/// Take up to `max` locks (0 = no bound) out of the unused cache as the
/// policy chosen by `flags` allows, aiming for `count`. Without lru resize
/// the target also covers whatever the cache holds beyond `max_unused`.
/// Each returned lock is marked CBPENDING|CANCELING and no longer cancels
/// on block.
pub(crate) fn select(
    ns: &Namespace,
    count: usize,
    max: usize,
    flags: LruFlags,
    observer: Option<&dyn LockObserver>,
) -> Vec<LockRef> {
    let policy = LruPolicy::for_namespace(ns, flags);
    let scan = Scan::new(ns, observer);
    let mut selected = Vec::new();

    ns.with_unused(|cache| {
        let mut unused = cache.len();
        let mut count = count as isize;
        if !ns.lru_resize() {
            count += unused as isize - ns.max_unused() as isize;
        }
        let oldest_first: Vec<LockRef> = cache.iter().rev().map(|(_, l)| l.clone()).collect();

        for lock in oldest_first {
            if max > 0 && selected.len() >= max {
                break;
            }
            let flags = lock.flags();
            // Someone is already cancelling; drop it without counting.
            if flags.contains(LockFlags::CANCELING) {
                cache.pop(&lock.handle());
                continue;
            }
            debug_assert!(!flags.contains(LockFlags::BL_AST), "blocked lock in unused cache");

            if policy.keep(&scan, &lock, unused, selected.len(), count) {
                break;
            }

            let claimed = lock.with_res_and_lock(|_, state| {
                if state.flags.contains(LockFlags::CANCELING) || !state.is_unused() {
                    return false;
                }
                // A voluntary cancel always tells the server.
                state.flags.remove(LockFlags::CANCEL_ON_BLOCK);
                state.flags.insert(LockFlags::CBPENDING | LockFlags::CANCELING);
                true
            });
            cache.pop(&lock.handle());
            if !claimed {
                continue;
            }
            selected.push(lock);
            unused -= 1;
        }
    });

    if !selected.is_empty() {
        debug!(namespace = ns.name(), ?policy, count = selected.len(), "unused locks selected");
    }
    selected
}

/// How many locks a scan aiming for `count` would take right now, without
/// taking any. Unlike [`select`], `count` is used as given.
pub fn estimate(
    ns: &Namespace,
    count: usize,
    max: usize,
    flags: LruFlags,
    observer: Option<&dyn LockObserver>,
) -> usize {
    let policy = LruPolicy::for_namespace(ns, flags);
    let scan = Scan::new(ns, observer);
    let candidates = ns.unused_locks();
    let mut unused = candidates.len();
    let mut added = 0;

    for lock in candidates {
        if max > 0 && added >= max {
            break;
        }
        if lock.has_flags(LockFlags::CANCELING | LockFlags::BL_AST) {
            continue;
        }
        if policy.keep(&scan, &lock, unused, added, count as isize) {
            break;
        }
        added += 1;
        unused -= 1;
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstTarget;
    use crate::config::DlmConfig;
    use crate::namespace::Side;
    use crate::types::{Extent, LockMode, PolicyData, ResourceId};
    use std::sync::Arc;

    fn client_ns(config: DlmConfig) -> Arc<Namespace> {
        Namespace::new("lru", Side::Client, Arc::new(config))
    }

    /// Cache one granted unused lock per entry of `ages` (seconds), oldest
    /// first in the cache. Time must be paused.
    async fn cache_aged(ns: &Namespace, lock_type: LockType, policies: &[PolicyData], ages: &[u64]) -> Vec<LockRef> {
        let base = Instant::now();
        let oldest = ages.iter().copied().max().unwrap_or(0);
        tokio::time::advance(Duration::from_secs(oldest)).await;

        let mut by_age: Vec<(u64, PolicyData)> = ages
            .iter()
            .copied()
            .zip(policies.iter().copied().cycle())
            .collect();
        by_age.sort_by(|a, b| b.0.cmp(&a.0));

        let mut locks = Vec::new();
        for (i, (age, policy)) in by_age.into_iter().enumerate() {
            let lock = ns
                .create_lock(
                    ResourceId::new(i as u64 + 1),
                    lock_type,
                    LockMode::Pr,
                    policy,
                    AstTarget::Client,
                    None,
                )
                .unwrap();
            lock.with_res_and_lock(|res, state| {
                res.grant(&lock, state);
                state.last_used = base + Duration::from_secs(oldest - age);
            });
            ns.lru_add(&lock);
            locks.push(lock);
        }
        locks
    }

    fn ages_of(locks: &[LockRef]) -> Vec<u64> {
        let now = Instant::now();
        locks
            .iter()
            .map(|l| now.duration_since(l.state().last_used).as_secs())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_keeps_young_locks() {
        let mut config = DlmConfig::testing();
        config.lru.max_age = Duration::from_secs(300);
        let ns = client_ns(config);
        cache_aged(&ns, LockType::Plain, &[PolicyData::None], &[10, 50, 310, 400, 500]).await;

        assert_eq!(estimate(&ns, 0, 0, LruFlags::AGED, None), 3);
        assert_eq!(ns.unused_count(), 5);

        let taken = select(&ns, 10, 0, LruFlags::AGED, None);
        assert_eq!(ages_of(&taken), vec![500, 400, 310]);
        assert!(taken
            .iter()
            .all(|l| l.flags().contains(LockFlags::CBPENDING | LockFlags::CANCELING)));
        assert_eq!(ns.unused_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_takes_young_locks_over_the_limit() {
        let mut config = DlmConfig::testing();
        config.lru.max_age = Duration::from_secs(300);
        config.lru.max_unused = 1;
        let ns = client_ns(config);
        cache_aged(&ns, LockType::Plain, &[PolicyData::None], &[10, 50, 310, 400, 500]).await;

        // Four over the limit: the 50s lock goes too, the newest stays.
        let taken = select(&ns, 0, 0, LruFlags::AGED, None);
        assert_eq!(ages_of(&taken), vec![500, 400, 310, 50]);
        assert_eq!(ns.unused_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passed_takes_min_of_count_and_available() {
        let ns = client_ns(DlmConfig::testing());
        ns.set_lru_resize(true);
        cache_aged(&ns, LockType::Plain, &[PolicyData::None], &[1, 2, 3, 4]).await;

        assert_eq!(LruPolicy::for_namespace(&ns, LruFlags::PASSED), LruPolicy::Passed);
        let taken = select(&ns, 2, 0, LruFlags::PASSED, None);
        assert_eq!(ages_of(&taken), vec![4, 3]);

        let taken = select(&ns, 10, 0, LruFlags::PASSED, None);
        assert_eq!(taken.len(), 2);
        assert_eq!(ns.unused_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_keeps_expensive_locks() {
        let mut config = DlmConfig::testing();
        config.lru.shrink_thumb = 16;
        let ns = client_ns(config);
        ns.set_lru_resize(true);
        // Oldest first: cheap, cheap, expensive (64 pages), cheap.
        let small = PolicyData::Extent(Extent::new(0, PAGE_SIZE - 1));
        let large = PolicyData::Extent(Extent::new(0, 64 * PAGE_SIZE));
        cache_aged(&ns, LockType::Extent, &[small, small, large, small], &[40, 30, 20, 10]).await;

        let taken = select(&ns, 0, 0, LruFlags::SHRINK, None);
        assert_eq!(ages_of(&taken), vec![40, 30]);
        assert_eq!(ns.unused_count(), 2);
    }

    struct FewPages;

    impl LockObserver for FewPages {
        fn resident_pages(&self, _lock: &Lock) -> Option<u64> {
            Some(2)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_cost_capped_by_resident_pages() {
        let mut config = DlmConfig::testing();
        config.lru.shrink_thumb = 16;
        let ns = client_ns(config);
        ns.set_lru_resize(true);
        cache_aged(&ns, LockType::Extent, &[PolicyData::Extent(Extent::WHOLE)], &[5]).await;

        assert_eq!(estimate(&ns, 0, 0, LruFlags::SHRINK, None), 0);
        assert_eq!(estimate(&ns, 0, 0, LruFlags::SHRINK, Some(&FewPages)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_waits_for_server_volume() {
        let ns = client_ns(DlmConfig::testing());
        ns.set_lru_resize(true);
        cache_aged(&ns, LockType::Plain, &[PolicyData::None], &[100, 5]).await;

        // No volume from the server yet.
        assert_eq!(estimate(&ns, 0, 0, LruFlags::LRUR, None), 0);

        // Oldest: 1 * 100s * 2 unused = 200 >= 150; next: 1 * 5s * 1 = 5 < 150.
        ns.set_slv(150);
        let taken = select(&ns, 0, 0, LruFlags::LRUR, None);
        assert_eq!(ages_of(&taken), vec![100]);
        assert_eq!(ns.client_lock_volume(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_respects_max_and_skips_canceling() {
        let ns = client_ns(DlmConfig::testing());
        ns.set_lru_resize(true);
        let locks = cache_aged(&ns, LockType::Plain, &[PolicyData::None], &[4, 3, 2, 1]).await;
        assert!(locks[0].try_set_canceling());

        let taken = select(&ns, 10, 2, LruFlags::PASSED, None);
        assert_eq!(ages_of(&taken), vec![3, 2]);
        // The canceling lock left the cache without being counted.
        assert_eq!(ns.unused_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_trims_overflow_without_resize() {
        let mut config = DlmConfig::testing();
        config.lru.max_unused = 2;
        let ns = client_ns(config);
        cache_aged(&ns, LockType::Plain, &[PolicyData::None], &[5, 4, 3, 2, 1]).await;

        let taken = select(&ns, 0, 0, LruFlags::empty(), None);
        assert_eq!(ages_of(&taken), vec![5, 4, 3]);
        assert_eq!(ns.unused_count(), 2);
    }
}
