//! Host identity and per-host state — component C (data side).
//!
//! [`registry`](crate::nlm::registry) owns the indexes and idle-LRU list;
//! this module owns what a single [`Host`] looks like and the comparison
//! rule the identity tree sorts by.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use moka::sync::Cache;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::nlm::sysid::Sysid;
use crate::nlm::vhold::VholdTable;

/// Transport family label carried alongside a peer address.
///
/// A closed enum rather than a free-form string: §4.C's comparison rule is
/// only defined for `AF_INET`/`AF_INET6`, and an open string type would let
/// an un-comparable netid silently reach the identity tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Netid {
    Tcp,
    Udp,
    Tcp6,
    Udp6,
}

impl Netid {
    pub fn is_v6(self) -> bool {
        matches!(self, Netid::Tcp6 | Netid::Udp6)
    }
}

/// A peer transport address. The port is a typed field so comparison can
/// skip it explicitly rather than relying on callers to mask a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
}

/// Sortable projection of a peer's `(name, netid, address)` triple, with
/// the ordering rule from spec §4.C: family first, then address bytes
/// (port excluded), then netid, then name to fully distinguish triples
/// that share everything else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityKey {
    family_rank: u8,
    addr_bytes: Vec<u8>,
    netid: Netid,
    name: String,
}

impl IdentityKey {
    pub fn new(name: &str, netid: Netid, addr: PeerAddr) -> Self {
        let (family_rank, addr_bytes) = match addr {
            PeerAddr::V4(ip, _) => (0u8, ip.octets().to_vec()),
            PeerAddr::V6(ip, _) => (1u8, ip.octets().to_vec()),
        };
        IdentityKey { family_rank, addr_bytes, netid, name: name.to_string() }
    }
}

/// Flags tracked on a [`Host`] (spec §3: `{MONITORED, RECLAIMING}`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostFlags {
    pub monitored: bool,
    pub reclaiming: bool,
}

/// State guarded by the host's own mutex (spec §5's "host mutex", the
/// innermost lock class save for the SM serialization point).
pub struct HostInner {
    /// Last-seen SM state number for this peer.
    pub state: u32,
    pub flags: HostFlags,
    pub vholds: VholdTable,
    /// Opaque cache of whatever the RPC/transport collaborator needs to
    /// reach this peer again without re-resolving a binding. The core
    /// never inspects cached entries; it only stores and evicts them.
    pub rpc_cache: Cache<u64, Vec<u8>>,
}

/// A registered remote peer (spec §3 "Host").
pub struct Host {
    pub identity_key: IdentityKey,
    pub name: String,
    pub netid: Netid,
    pub addr: PeerAddr,
    pub sysid: Sysid,
    /// Count of outstanding external references. Mutated only while the
    /// registry's writer lock is held (see `registry::Registry::acquire`/
    /// `release`), so it does not need its own lock, only atomicity against
    /// concurrent readers taking the same registry lock.
    refs: AtomicU32,
    /// Wall time after which this host is eligible for GC, valid only when
    /// `refs == 0`. Same mutation discipline as `refs`.
    idle_deadline: std::sync::Mutex<Option<Instant>>,
    inner: Mutex<HostInner>,
    /// Broadcast when RECLAIMING clears.
    pub recovery_notify: Notify,
    /// Broadcast when the RPC-handle cache gains a fresh binding.
    pub binding_notify: Notify,
}

impl Host {
    pub fn new(identity_key: IdentityKey, name: String, netid: Netid, addr: PeerAddr, sysid: Sysid) -> Self {
        Host {
            identity_key,
            name,
            netid,
            addr,
            sysid,
            refs: AtomicU32::new(0),
            idle_deadline: std::sync::Mutex::new(None),
            inner: Mutex::new(HostInner {
                state: 0,
                flags: HostFlags::default(),
                vholds: VholdTable::new(),
                rpc_cache: Cache::builder()
                    .time_to_idle(Duration::from_secs(300))
                    .build(),
            }),
            recovery_notify: Notify::new(),
            binding_notify: Notify::new(),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, HostInner> {
        self.inner.lock().await
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Only called by `registry::Registry::acquire`/`release` under the
    /// registry writer lock.
    pub(crate) fn inc_refs(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn dec_refs(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        *self.idle_deadline.lock().unwrap()
    }

    pub(crate) fn set_idle_deadline(&self, deadline: Option<Instant>) {
        *self.idle_deadline.lock().unwrap() = deadline;
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("netid", &self.netid)
            .field("sysid", &self.sysid)
            .field("refs", &self.refs())
            .finish()
    }
}
