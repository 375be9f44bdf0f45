//! Vnode holds — component B.
//!
//! A [`Vhold`] pins a `(host, vp)` pair alive while the host has a lock,
//! share reservation, or sleeping request outstanding against that vnode.
//! Hosts reference-count their vholds the same way the registry
//! reference-counts hosts (see [`crate::nlm::host::Host`]). Dropping a
//! refcount to zero does not by itself evict anything — [`VholdTable::gc`]
//! is the separate, explicit check (refcnt, local locks, local shares) that
//! decides eviction, and queues evicted vholds for deferred drop rather
//! than dropping them inline, so a caller holding the owning host's lock
//! never pays for the drop of an arbitrary vnode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::nlm::collaborators::{LocalLockManager, ShareManager, SysidMask};
use crate::nlm::sysid::Sysid;
use crate::nlm::Vp;

/// One vnode pinned alive on behalf of a host.
#[derive(Debug)]
pub struct Vhold {
    vp: Vp,
    refcnt: AtomicU32,
}

impl Vhold {
    fn new(vp: Vp) -> Arc<Self> {
        Arc::new(Vhold { vp, refcnt: AtomicU32::new(1) })
    }

    pub fn vp(&self) -> &Vp {
        &self.vp
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }
}

/// Per-host table of [`Vhold`]s, indexed by vnode identity.
///
/// Callers must hold the owning host's mutex while calling any method here
/// (see spec §5's lock order: zone lock < host lock < this table).
#[derive(Debug, Default)]
pub struct VholdTable {
    by_vp: HashMap<Vp, Arc<Vhold>>,
    /// Vholds evicted by [`VholdTable::gc`], pending collection. Drained
    /// by [`VholdTable::collect_garbage`] outside of any lock, matching the
    /// deferred-free pattern used by [`crate::nlm::registry::Registry`]'s
    /// idle-host sweep.
    garbage: SegQueue<Arc<Vhold>>,
}

impl VholdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a hold on `vp`, incrementing its refcount.
    pub fn get(&mut self, vp: &Vp) -> Arc<Vhold> {
        if let Some(existing) = self.by_vp.get(vp) {
            existing.refcnt.fetch_add(1, Ordering::AcqRel);
            return Arc::clone(existing);
        }
        let vhold = Vhold::new(vp.clone());
        self.by_vp.insert(vp.clone(), Arc::clone(&vhold));
        vhold
    }

    /// `vhold_release(host, v)`: decrement `refcnt`. Does not by itself
    /// evict anything from the index — see [`VholdTable::gc`].
    pub fn release(&mut self, vhold: &Arc<Vhold>) {
        vhold.refcnt.fetch_sub(1, Ordering::AcqRel);
    }

    /// `vhold_busy(host, v)`: true iff `refcnt>0` OR the local lock manager
    /// reports an active lock for this sysid OR the local share manager
    /// reports a share on `v`'s vnode for this sysid.
    fn vhold_busy(vhold: &Vhold, sysid: Sysid, lock_manager: &dyn LocalLockManager, share_manager: &dyn ShareManager) -> bool {
        vhold.refcnt() > 0
            || lock_manager.sysid_has_locks(sysid, SysidMask::Server)
            || share_manager.shares_for_sysid(&vhold.vp, sysid)
    }

    /// `vhold_gc(host)`: destroy every non-busy vhold, unpinning its `vp`.
    /// Caller must hold `host.lock`.
    pub fn gc(&mut self, sysid: Sysid, lock_manager: &dyn LocalLockManager, share_manager: &dyn ShareManager) {
        let doomed: Vec<Vp> = self
            .by_vp
            .iter()
            .filter(|(_, vhold)| !Self::vhold_busy(vhold, sysid, lock_manager, share_manager))
            .map(|(vp, _)| vp.clone())
            .collect();
        for vp in doomed {
            if let Some(vhold) = self.by_vp.remove(&vp) {
                self.garbage.push(vhold);
            }
        }
    }

    /// Look up an existing hold on `vp` without incrementing its refcount,
    /// for a caller that already knows a hold exists (taken by some earlier
    /// `get`) and wants to release it.
    pub fn find(&self, vp: &Vp) -> Option<Arc<Vhold>> {
        self.by_vp.get(vp).cloned()
    }

    /// True iff any vhold in this table is still referenced.
    pub fn is_busy(&self) -> bool {
        !self.by_vp.is_empty()
    }

    /// Number of live vholds, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.by_vp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_vp.is_empty()
    }

    /// Iterate live vholds, for the registry's crash-notification fan-out.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Vhold>> {
        self.by_vp.values()
    }

    /// Drain vholds queued by [`VholdTable::gc`]. Safe to call without
    /// holding the host mutex; the returned vholds are unreachable from the
    /// index already.
    pub fn collect_garbage(&self) -> Vec<Arc<Vhold>> {
        let mut drained = Vec::new();
        while let Some(vhold) = self.garbage.pop() {
            drained.push(vhold);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nlm::collaborators::memory::{MemoryLockManager, MemoryShareManager};

    fn fh(byte: u8) -> Vp {
        Arc::new(crate::vfs::FileHandle(vec![byte]))
    }

    #[test]
    fn get_reuses_existing_hold_and_bumps_refcount() {
        let mut table = VholdTable::new();
        let first = table.get(&fh(1));
        let second = table.get(&fh(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.refcnt(), 2);
    }

    #[test]
    fn release_alone_does_not_evict() {
        let mut table = VholdTable::new();
        let vhold = table.get(&fh(1));
        table.release(&vhold);
        assert!(table.is_busy());
        assert!(table.collect_garbage().is_empty());
    }

    #[test]
    fn gc_evicts_idle_vhold_after_release() {
        let mut table = VholdTable::new();
        let lock_manager = MemoryLockManager::new();
        let share_manager = MemoryShareManager::new();
        let vhold = table.get(&fh(1));
        table.release(&vhold);
        table.gc(Sysid(1), &lock_manager, &share_manager);
        assert!(!table.is_busy());
        assert_eq!(table.collect_garbage().len(), 1);
    }

    #[test]
    fn gc_keeps_vhold_with_remaining_refs() {
        let mut table = VholdTable::new();
        let lock_manager = MemoryLockManager::new();
        let share_manager = MemoryShareManager::new();
        let vhold = table.get(&fh(1));
        let _second = table.get(&fh(1));
        table.release(&vhold);
        table.gc(Sysid(1), &lock_manager, &share_manager);
        assert!(table.is_busy());
        assert!(table.collect_garbage().is_empty());
    }

    #[test]
    fn gc_keeps_vhold_still_locked() {
        use crate::nlm::collaborators::{LockDesc, SetLockMode};

        let mut table = VholdTable::new();
        let lock_manager = MemoryLockManager::new();
        let share_manager = MemoryShareManager::new();
        let vp = fh(1);
        let vhold = table.get(&vp);
        let desc = LockDesc { offset: 0, len: 10, exclusive: true, pid: 1 };
        lock_manager.set_lock(&vp, desc, Sysid(1), SetLockMode::NonBlock);
        table.release(&vhold);
        table.gc(Sysid(1), &lock_manager, &share_manager);
        assert!(table.is_busy(), "a vhold backed by a live local lock must survive gc");
    }
}
