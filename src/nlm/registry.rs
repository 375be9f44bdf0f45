//! Host registry — component C.
//!
//! One [`tokio::sync::RwLock`] guards both indexes and the idle-LRU list
//! together, so they are always updated atomically (spec §5: "the two
//! registry indexes ... are always updated atomically"). A sharded or
//! lock-free concurrent map (`whirlwind` is in this crate's dependency
//! stack) was considered for the sysid index and rejected: idle-LRU
//! membership, `refs`, and both indexes must move together as one unit,
//! which a pre-sharded map can't give without an outer lock anyway — see
//! DESIGN.md for the dependency note.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::nlm::error::CoreError;
use crate::nlm::host::{Host, IdentityKey, Netid, PeerAddr};
use crate::nlm::sm_client::SmClient;
use crate::nlm::sysid::{Sysid, SysidAllocator};
use crate::nlm::zone::RunStatus;
use crate::nlm::Vp;

struct RegistryInner {
    by_identity: BTreeMap<IdentityKey, Sysid>,
    by_sysid: HashMap<Sysid, Arc<Host>>,
    /// Ordered by `idle_deadline`; membership <=> `host.refs() == 0`.
    idle_lru: BTreeMap<(Instant, Sysid), ()>,
    sysids: SysidAllocator,
}

/// Per-zone multi-indexed set of remote peers (spec §3/§4.C).
pub struct Registry {
    inner: RwLock<RegistryInner>,
    /// Mirrors [`crate::nlm::zone::Zone`]'s run status, so `find_or_create`
    /// can refuse new hosts once shutdown begins (spec §5: "Shutdown
    /// (STOPPING): new host creation is refused by all lookup-with-create
    /// paths"). `Zone` is the sole writer via [`Registry::set_status`].
    status: AtomicU8,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: RwLock::new(RegistryInner {
                by_identity: BTreeMap::new(),
                by_sysid: HashMap::new(),
                idle_lru: BTreeMap::new(),
                sysids: SysidAllocator::new(),
            }),
            status: AtomicU8::new(RunStatus::Starting as u8),
        }
    }

    pub fn set_status(&self, status: RunStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// `find(netid, addr)` — O(log n) lookup by identity triple.
    pub async fn find(&self, name: &str, netid: Netid, addr: PeerAddr) -> Option<Arc<Host>> {
        let key = IdentityKey::new(name, netid, addr);
        let inner = self.inner.read().await;
        let sysid = *inner.by_identity.get(&key)?;
        inner.by_sysid.get(&sysid).cloned()
    }

    /// `find_by_sysid(sysid)` — O(1) lookup.
    pub async fn find_by_sysid(&self, sysid: Sysid) -> Option<Arc<Host>> {
        self.inner.read().await.by_sysid.get(&sysid).cloned()
    }

    /// All registered hosts with the given name, regardless of transport
    /// identity. Used by `FREE_ALL`, which names only a host, not a full
    /// `(name, netid, address)` triple (a single peer name may have
    /// connected over more than one netid).
    pub async fn find_all_by_name(&self, name: &str) -> Vec<Arc<Host>> {
        self.inner.read().await.by_sysid.values().filter(|host| host.name == name).cloned().collect()
    }

    /// Every host currently registered, for shutdown's crash fan-out and
    /// its idle-drain poll.
    pub async fn snapshot_all(&self) -> Vec<Arc<Host>> {
        self.inner.read().await.by_sysid.values().cloned().collect()
    }

    /// `find_or_create(name, netid, addr)`: find on the fast path; on miss,
    /// build a host outside the registry lock, then re-check and insert or
    /// discard under the writer lock. Refuses to create once the zone has
    /// entered `Stopping`/`Down` (spec §5); an existing host already found
    /// on the fast path is still returned regardless of status.
    pub async fn find_or_create(
        &self,
        name: &str,
        netid: Netid,
        addr: PeerAddr,
    ) -> Result<Arc<Host>, CoreError> {
        if let Some(host) = self.find(name, netid, addr).await {
            return Ok(host);
        }

        if matches!(self.status(), RunStatus::Stopping | RunStatus::Down) {
            return Err(CoreError::ShuttingDown);
        }

        let key = IdentityKey::new(name, netid, addr);
        let mut inner = self.inner.write().await;
        if let Some(sysid) = inner.by_identity.get(&key).copied() {
            return Ok(inner.by_sysid.get(&sysid).cloned().expect("index desync"));
        }

        let sysid = inner.sysids.alloc();
        if sysid == Sysid(crate::nlm::sysid::NO_SYSID) {
            return Err(CoreError::NoSysid);
        }
        let host = Arc::new(Host::new(key.clone(), name.to_string(), netid, addr, sysid));
        inner.by_identity.insert(key, sysid);
        inner.by_sysid.insert(sysid, Arc::clone(&host));
        info!(sysid = sysid.0, name, ?netid, "registered new host");
        Ok(host)
    }

    /// `acquire(host)`: increment `refs`; remove from idle LRU if present.
    pub async fn acquire(&self, host: &Arc<Host>) {
        let mut inner = self.inner.write().await;
        if let Some(deadline) = host.idle_deadline() {
            inner.idle_lru.remove(&(deadline, host.sysid));
        }
        host.inc_refs();
        host.set_idle_deadline(None);
    }

    /// `release(host)`: decrement `refs`; if zero, stamp `idle_deadline`
    /// and append to idle LRU.
    pub async fn release(&self, host: &Arc<Host>, idle_timeout: std::time::Duration) {
        let mut inner = self.inner.write().await;
        let remaining = host.dec_refs();
        if remaining == 0 {
            let deadline = Instant::now() + idle_timeout;
            host.set_idle_deadline(Some(deadline));
            inner.idle_lru.insert((deadline, host.sysid), ());
        }
    }

    /// `unregister(host)`: remove from all indexes and idle LRU. Requires
    /// `refs == 0`.
    pub async fn unregister(&self, host: &Arc<Host>) {
        debug_assert_eq!(host.refs(), 0, "unregister called on a referenced host");
        let mut inner = self.inner.write().await;
        inner.by_identity.remove(&host.identity_key);
        inner.by_sysid.remove(&host.sysid);
        if let Some(deadline) = host.idle_deadline() {
            inner.idle_lru.remove(&(deadline, host.sysid));
        }
    }

    /// `destroy(host)`: free the sysid. Precondition: no vholds remain.
    /// Caller must have already called [`Registry::unregister`].
    pub async fn destroy(&self, host: &Arc<Host>) {
        {
            let guard = host.lock().await;
            debug_assert!(guard.vholds.is_empty(), "destroying host with live vholds");
        }
        let mut inner = self.inner.write().await;
        inner.sysids.free(host.sysid);
    }

    /// First-time observation of a peer's SM state (spec §4.C `monitor`).
    pub async fn monitor(&self, host: &Arc<Host>, state: u32, sm: &SmClient) {
        let mut guard = host.lock().await;
        if guard.state == 0 {
            guard.state = state;
        }
        if guard.flags.monitored {
            return;
        }
        guard.flags.monitored = true;
        drop(guard);
        if sm.mon(&host.name, host.sysid).await.is_err() {
            warn!(sysid = host.sysid.0, "SM mon failed, clearing MONITORED");
            host.lock().await.flags.monitored = false;
        }
    }

    /// `unmonitor(host)`: precondition `refs == 0`.
    pub async fn unmonitor(&self, host: &Arc<Host>, sm: &SmClient) {
        debug_assert_eq!(host.refs(), 0);
        let mut guard = host.lock().await;
        if !guard.flags.monitored {
            return;
        }
        guard.flags.monitored = false;
        drop(guard);
        let _ = sm.unmon(&host.name).await;
    }

    /// Server-side crash-notification fan-out. `state == 0` performs the
    /// cleanup without overwriting the recorded state (shutdown path).
    pub async fn notify_server_side(
        &self,
        host: &Arc<Host>,
        state: u32,
        lock_manager: &dyn crate::nlm::collaborators::LocalLockManager,
        share_manager: &dyn crate::nlm::collaborators::ShareManager,
    ) {
        let mut guard = host.lock().await;
        if state != 0 {
            guard.state = state;
        }
        let vps: Vec<Vp> = guard.vholds.iter().map(|v| Arc::clone(v.vp())).collect();
        drop(guard);

        for vp in &vps {
            lock_manager.unlock_sysid(vp, host.sysid);
            share_manager.share_unset(vp, host.sysid);
        }

        let mut guard = host.lock().await;
        for vp in &vps {
            if let Some(vhold) = guard.vholds.find(vp) {
                guard.vholds.release(&vhold);
            }
        }
        guard.vholds.gc(host.sysid, lock_manager, share_manager);
        let doomed = guard.vholds.collect_garbage();
        drop(guard);
        drop(doomed);
        debug!(sysid = host.sysid.0, vholds = vps.len(), "server-side crash fan-out complete");
    }

    /// Client-side crash notification: flips RECLAIMING and returns `true`
    /// if a reclaimer should be spawned by the caller (it takes the extra
    /// reference itself via [`Registry::acquire`] before spawning).
    pub async fn notify_client_side(&self, host: &Arc<Host>, state: u32) -> bool {
        let mut guard = host.lock().await;
        guard.state = state;
        if guard.flags.reclaiming {
            return false;
        }
        guard.flags.reclaiming = true;
        true
    }

    /// Snapshot of hosts currently on the idle LRU, head first. Used by
    /// [`crate::nlm::gc::Gc`].
    pub(crate) async fn idle_candidates(&self, now: Instant) -> Vec<Sysid> {
        let inner = self.inner.read().await;
        inner
            .idle_lru
            .range(..(now, Sysid(u32::MAX)))
            .map(|((_, sysid), _)| *sysid)
            .collect()
    }

    pub(crate) async fn is_still_idle_and_due(&self, sysid: Sysid, previously_seen: Instant) -> Option<Arc<Host>> {
        let inner = self.inner.read().await;
        let host = inner.by_sysid.get(&sysid)?;
        let deadline = host.idle_deadline()?;
        if deadline != previously_seen {
            return None;
        }
        Some(Arc::clone(host))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
