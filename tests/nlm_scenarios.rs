//! End-to-end scenarios for the NLM core: basic lock/unlock, blocking +
//! grant, port-stability of host identity, peer reboot via NOTIFY1,
//! grace-period gating, and shutdown draining.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use nlm_core::nlm::collaborators::memory::{MemoryFileHandleResolver, MemoryLockManager, MemoryShareManager};
use nlm_core::nlm::collaborators::{LocalHolder, LocalLockManager, LockDesc, LockOutcome, SetLockMode, SysidMask};
use nlm_core::nlm::config::NlmConfig;
use nlm_core::nlm::error::CoreError;
use nlm_core::nlm::grace::ClientReclaimer;
use nlm_core::nlm::handlers::GrantedCallback;
use nlm_core::nlm::host::{Host, Netid, PeerAddr};
use nlm_core::nlm::sm_client::SmTransport;
use nlm_core::nlm::sysid::Sysid;
use nlm_core::nlm::zone::{RunStatus, Zone, ZoneDeps};
use nlm_core::nlm::{ClientName, LockArgs, LockRequest, Netobj, PeerInfo, Response, TestArgs, UnlockArgs, Vp};
use nlm_core::vfs::FileHandle;

fn peer(ip: [u8; 4], port: u16) -> PeerInfo {
    PeerInfo { netid: Netid::Tcp, addr: PeerAddr::V4(Ipv4Addr::from(ip), port) }
}

fn lock_request(name: &str, fh_byte: u8) -> LockRequest {
    LockRequest {
        client_name: ClientName(name.to_string()),
        nfs_fh: FileHandle(vec![fh_byte]),
        owner: Netobj([0; 8]),
        pid: 1,
        locked_offset: 0,
        locked_len: 10,
    }
}

fn lock_args(name: &str, fh_byte: u8, block: bool, reclaim: bool, state: u32) -> LockArgs {
    LockArgs {
        cookie: Netobj([1; 8]),
        block,
        exclusive: true,
        actual_lock: lock_request(name, fh_byte),
        reclaim,
        state,
    }
}

fn no_grace_config() -> NlmConfig {
    let mut config = NlmConfig::default();
    config.grace_period_secs = 0;
    config
}

struct NoopTransport;

#[async_trait::async_trait]
impl SmTransport for NoopTransport {
    async fn simu_crash(&self) -> Result<(), CoreError> {
        Ok(())
    }
    async fn stat(&self) -> Result<u32, CoreError> {
        Ok(1)
    }
    async fn mon(&self, _: &str, _: [u8; nlm_core::nlm::nsm::PRIVATE_LEN]) -> Result<(), CoreError> {
        Ok(())
    }
    async fn unmon(&self, _: &str) -> Result<(), CoreError> {
        Ok(())
    }
    async fn unmon_all(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Counts `unmon`/`unmon_all` calls, for S1 and S6's "called exactly once"
/// assertions.
#[derive(Default)]
struct CountingTransport {
    unmon_calls: AtomicU32,
    unmon_all_calls: AtomicU32,
}

#[async_trait::async_trait]
impl SmTransport for CountingTransport {
    async fn simu_crash(&self) -> Result<(), CoreError> {
        Ok(())
    }
    async fn stat(&self) -> Result<u32, CoreError> {
        Ok(1)
    }
    async fn mon(&self, _: &str, _: [u8; nlm_core::nlm::nsm::PRIVATE_LEN]) -> Result<(), CoreError> {
        Ok(())
    }
    async fn unmon(&self, _: &str) -> Result<(), CoreError> {
        self.unmon_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn unmon_all(&self) -> Result<(), CoreError> {
        self.unmon_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct NoopReclaimer;

#[async_trait::async_trait]
impl ClientReclaimer for NoopReclaimer {
    async fn reclaim_client(&self, _host: &Arc<Host>) {}
}

/// Records which sysid each reclaim ran for, for S4.
#[derive(Default)]
struct RecordingReclaimer {
    calls: Mutex<Vec<u32>>,
}

#[async_trait::async_trait]
impl ClientReclaimer for RecordingReclaimer {
    async fn reclaim_client(&self, host: &Arc<Host>) {
        self.calls.lock().unwrap().push(host.sysid.0);
    }
}

struct NoopGrantedCallback;

#[async_trait::async_trait]
impl GrantedCallback for NoopGrantedCallback {
    async fn send_granted(&self, _host: &Arc<Host>, _args: &TestArgs) -> bool {
        true
    }
}

/// Records every GRANTED back-call, for S2.
#[derive(Default)]
struct RecordingGrantedCallback {
    granted: Mutex<Vec<u32>>,
}

#[async_trait::async_trait]
impl GrantedCallback for RecordingGrantedCallback {
    async fn send_granted(&self, host: &Arc<Host>, _args: &TestArgs) -> bool {
        self.granted.lock().unwrap().push(host.sysid.0);
        true
    }
}

/// A [`LocalLockManager`] double whose `Block` mode genuinely blocks the
/// calling (blocking-pool) thread until the conflicting lock clears. The
/// component-level test double (`MemoryLockManager`) ignores blocking
/// mode entirely, which isn't enough to exercise `SET_LOCK_WAIT`'s real
/// contract end to end.
#[derive(Default)]
struct BlockingLockManager {
    state: Mutex<HashMap<(Vp, Sysid), LockDesc>>,
    condvar: Condvar,
}

impl BlockingLockManager {
    fn conflicts(held: &LockDesc, requested: &LockDesc) -> bool {
        let overlap = requested.offset < held.offset + held.len && held.offset < requested.offset + requested.len;
        overlap && (held.exclusive || requested.exclusive)
    }

    fn conflicting_holder(state: &HashMap<(Vp, Sysid), LockDesc>, vp: &Vp, sysid: Sysid, desc: &LockDesc) -> bool {
        state
            .iter()
            .any(|((held_vp, held_sysid), held_desc)| held_vp == vp && *held_sysid != sysid && Self::conflicts(held_desc, desc))
    }
}

impl LocalLockManager for BlockingLockManager {
    fn set_lock(&self, vp: &Vp, desc: LockDesc, sysid: Sysid, mode: SetLockMode) -> LockOutcome {
        let mut state = self.state.lock().unwrap();
        loop {
            if !Self::conflicting_holder(&state, vp, sysid, &desc) {
                if desc.len == 0 {
                    state.remove(&(vp.clone(), sysid));
                } else {
                    state.insert((vp.clone(), sysid), desc);
                }
                self.condvar.notify_all();
                return LockOutcome::Ok;
            }
            match mode {
                SetLockMode::NonBlock => return LockOutcome::Conflict,
                SetLockMode::Block => state = self.condvar.wait(state).unwrap(),
            }
        }
    }

    fn get_lock(&self, vp: &Vp, desc: LockDesc, sysid: Sysid) -> Option<LocalHolder> {
        let state = self.state.lock().unwrap();
        state.iter().find_map(|((held_vp, held_sysid), held_desc)| {
            if held_vp == vp && *held_sysid != sysid && Self::conflicts(held_desc, &desc) {
                Some(LocalHolder { exclusive: held_desc.exclusive, pid: held_desc.pid, sysid: *held_sysid, offset: held_desc.offset, len: held_desc.len })
            } else {
                None
            }
        })
    }

    fn unlock_sysid(&self, vp: &Vp, sysid: Sysid) {
        let mut state = self.state.lock().unwrap();
        state.retain(|(held_vp, held_sysid), _| !(held_vp == vp && *held_sysid == sysid));
        self.condvar.notify_all();
    }

    fn sysid_has_locks(&self, sysid: Sysid, _mask: SysidMask) -> bool {
        self.state.lock().unwrap().keys().any(|(_, held_sysid)| *held_sysid == sysid)
    }
}

fn deps(transport: Arc<dyn SmTransport>, lock_manager: Arc<dyn LocalLockManager>, reclaimer: Arc<dyn ClientReclaimer>, granted_callback: Arc<dyn GrantedCallback>) -> ZoneDeps {
    ZoneDeps {
        transport,
        lock_manager,
        share_manager: Arc::new(MemoryShareManager::new()),
        fh_resolver: Arc::new(MemoryFileHandleResolver::new()),
        reclaimer,
        granted_callback,
    }
}

// S1 — basic lock/unlock: GRANTED on LOCK, new nonzero sysid, MONITORED
// set, one vhold on F; GRANTED on UNLOCK; GC destroys the idle host and
// calls `unmon` exactly once.
#[tokio::test]
async fn s1_basic_lock_unlock_then_idle_gc() {
    let transport = Arc::new(CountingTransport::default());
    let mut config = no_grace_config();
    config.idle_timeout_secs = 0;
    let zone = Zone::start(
        config,
        deps(transport.clone(), Arc::new(MemoryLockManager::new()), Arc::new(NoopReclaimer), Arc::new(NoopGrantedCallback)),
    )
    .await
    .unwrap();
    zone.grace.expire_now();

    let result = zone.core.handle_lock(peer([10, 0, 0, 1], 2001), lock_args("alpha", b'F', false, false, 7)).await;
    assert_eq!(result.stat, Response::Granted);

    let host = zone.registry.find("alpha", Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 2001)).await.unwrap();
    assert_ne!(host.sysid.0, 0);
    {
        let guard = host.lock().await;
        assert!(guard.flags.monitored);
        assert_eq!(guard.vholds.len(), 1);
    }

    let unlock = zone.core.handle_unlock(peer([10, 0, 0, 1], 2001), UnlockArgs { cookie: Netobj([2; 8]), actual_lock: lock_request("alpha", b'F') }).await;
    assert_eq!(unlock.stat, Response::Granted);

    let mut destroyed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if zone.registry.find_by_sysid(host.sysid).await.is_none() {
            destroyed = true;
            break;
        }
    }
    assert!(destroyed, "GC never destroyed the idle host");
    assert_eq!(transport.unmon_calls.load(Ordering::SeqCst), 1);

    zone.shutdown().await;
}

// S2 — blocking + grant: P2's blocking LOCK against P1's held range
// returns BLOCKED; once P1 unlocks, P2 gets a GRANTED back-call and P2's
// own next TEST against that range now reports GRANTED (it holds the
// only lock there, and a lock never conflicts with its own holder).
#[tokio::test]
async fn s2_blocking_lock_then_grant() {
    let reclaimer = Arc::new(NoopReclaimer);
    let granted_callback = Arc::new(RecordingGrantedCallback::default());
    let zone = Zone::start(
        no_grace_config(),
        deps(Arc::new(NoopTransport), Arc::new(BlockingLockManager::default()), reclaimer, granted_callback.clone()),
    )
    .await
    .unwrap();
    zone.grace.expire_now();

    let p1 = zone.core.handle_lock(peer([10, 0, 0, 1], 2001), lock_args("alpha", b'F', false, false, 1)).await;
    assert_eq!(p1.stat, Response::Granted);

    let p2 = zone.core.handle_lock(peer([10, 0, 0, 2], 2001), lock_args("beta", b'F', true, false, 1)).await;
    assert_eq!(p2.stat, Response::Blocked);

    let unlock = zone.core.handle_unlock(peer([10, 0, 0, 1], 2001), UnlockArgs { cookie: Netobj([2; 8]), actual_lock: lock_request("alpha", b'F') }).await;
    assert_eq!(unlock.stat, Response::Granted);

    let mut got_granted = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !granted_callback.granted.lock().unwrap().is_empty() {
            got_granted = true;
            break;
        }
    }
    assert!(got_granted, "P2 never received a GRANTED back-call");

    let test = zone
        .core
        .handle_test(peer([10, 0, 0, 2], 2001), TestArgs { cookie: Netobj([3; 8]), exclusive: true, actual_lock: lock_request("beta", b'F') })
        .await;
    assert_eq!(test.test_stat, Response::Granted);
    assert!(test.holder.is_none(), "a lock never conflicts with its own holder");

    zone.shutdown().await;
}

// S3 — port changes do not fork the host: two requests differing only in
// source port resolve to the same host and sysid.
#[tokio::test]
async fn s3_port_change_resolves_to_same_host() {
    let zone = Zone::start(
        no_grace_config(),
        deps(Arc::new(NoopTransport), Arc::new(MemoryLockManager::new()), Arc::new(NoopReclaimer), Arc::new(NoopGrantedCallback)),
    )
    .await
    .unwrap();
    zone.grace.expire_now();

    zone.core.handle_lock(peer([10, 0, 0, 1], 2001), lock_args("alpha", b'F', false, false, 1)).await;

    let host_a = zone.registry.find("alpha", Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 2001)).await.unwrap();
    let host_b = zone.registry.find("alpha", Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 2002)).await.unwrap();
    assert_eq!(host_a.sysid, host_b.sysid);

    zone.shutdown().await;
}

// S4 — peer reboot: NOTIFY1 with an advanced state drops P1's locks and
// sleep requests, advances `host.state`, and spawns a client-side
// reclaim for that sysid.
#[tokio::test]
async fn s4_peer_reboot_drops_locks_and_reclaims() {
    let reclaimer = Arc::new(RecordingReclaimer::default());
    let zone = Zone::start(
        no_grace_config(),
        deps(Arc::new(NoopTransport), Arc::new(MemoryLockManager::new()), reclaimer.clone(), Arc::new(NoopGrantedCallback)),
    )
    .await
    .unwrap();
    zone.grace.expire_now();

    zone.core.handle_lock(peer([10, 0, 0, 1], 2001), lock_args("alpha", b'F', false, false, 1)).await;
    let host = zone.registry.find("alpha", Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 2001)).await.unwrap();
    assert!(zone.core.lock_manager.sysid_has_locks(host.sysid, SysidMask::Server));

    let mut priv_sysid = [0u8; nlm_core::nlm::nsm::PRIVATE_LEN];
    priv_sysid[..8].copy_from_slice(&host.sysid.encode_owner().0);
    zone.core.handle_notify1(priv_sysid, 3).await;

    assert!(!zone.core.lock_manager.sysid_has_locks(host.sysid, SysidMask::Server));
    assert_eq!(host.lock().await.state, 3);

    let mut reclaimed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if reclaimer.calls.lock().unwrap().contains(&host.sysid.0) {
            reclaimed = true;
            break;
        }
    }
    assert!(reclaimed, "no reclaim task observed for the rebooted peer");

    zone.shutdown().await;
}

// S5 — grace rejection: LOCK without `reclaim` is denied during grace;
// LOCK with `reclaim` for the same range proceeds; TEST during grace is
// also denied.
#[tokio::test]
async fn s5_grace_rejects_non_reclaim_requests() {
    let mut config = NlmConfig::default();
    config.grace_period_secs = 60;
    let zone = Zone::start(
        config,
        deps(Arc::new(NoopTransport), Arc::new(MemoryLockManager::new()), Arc::new(NoopReclaimer), Arc::new(NoopGrantedCallback)),
    )
    .await
    .unwrap();

    let denied = zone.core.handle_lock(peer([10, 0, 0, 1], 2001), lock_args("alpha", b'F', false, false, 1)).await;
    assert_eq!(denied.stat, Response::DeniedGracePeriod);

    let reclaimed = zone.core.handle_lock(peer([10, 0, 0, 1], 2001), lock_args("alpha", b'F', false, true, 1)).await;
    assert_eq!(reclaimed.stat, Response::Granted);

    let test = zone
        .core
        .handle_test(peer([10, 0, 0, 2], 2001), TestArgs { cookie: Netobj([3; 8]), exclusive: true, actual_lock: lock_request("beta", b'F') })
        .await;
    assert_eq!(test.test_stat, Response::DeniedGracePeriod);

    zone.shutdown().await;
}

// S6 — shutdown drains: with many hosts, half holding live locks,
// shutdown drops every lock, calls `unmon_all` exactly once, leaves
// `run_status == Down`, and leaves no vholds or sleeping locks behind.
#[tokio::test]
async fn s6_shutdown_drains_every_host() {
    let transport = Arc::new(CountingTransport::default());
    let zone = Zone::start(
        no_grace_config(),
        deps(transport.clone(), Arc::new(MemoryLockManager::new()), Arc::new(NoopReclaimer), Arc::new(NoopGrantedCallback)),
    )
    .await
    .unwrap();
    zone.grace.expire_now();

    const HOST_COUNT: u16 = 100;
    for i in 0..HOST_COUNT {
        let name = format!("host-{i}");
        let args = lock_args(&name, b'F', false, false, 1);
        if i % 2 == 0 {
            let result = zone.core.handle_lock(peer([10, 0, 0, 1], 2000 + i), args).await;
            assert_eq!(result.stat, Response::Granted);
        } else {
            // Odd-numbered hosts register without taking a lock, just to
            // exist in the registry with refs == 0 at shutdown time.
            zone.registry.find_or_create(&name, Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 2000 + i)).await.unwrap();
        }
    }
    assert_eq!(zone.registry.snapshot_all().await.len() as u16, HOST_COUNT);

    zone.shutdown().await;

    assert_eq!(zone.status(), RunStatus::Down);
    assert!(zone.registry.snapshot_all().await.is_empty(), "no new host appears and every host drains during shutdown");
    assert_eq!(transport.unmon_all_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn s6b_find_or_create_refuses_new_hosts_once_stopping() {
    let transport = Arc::new(CountingTransport::default());
    let zone = Zone::start(
        no_grace_config(),
        deps(transport.clone(), Arc::new(MemoryLockManager::new()), Arc::new(NoopReclaimer), Arc::new(NoopGrantedCallback)),
    )
    .await
    .unwrap();

    let existing =
        zone.registry.find_or_create("already-here", Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 3000)).await.unwrap();

    zone.registry.set_status(RunStatus::Stopping);

    // An existing host is still reachable by the fast path regardless of
    // status; only create-on-miss is refused.
    let refound = zone.registry.find_or_create("already-here", Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 3000)).await.unwrap();
    assert_eq!(existing.sysid, refound.sysid);

    let result = zone
        .core
        .handle_lock(peer([10, 0, 0, 1], 3001), lock_args("new-during-shutdown", b'G', false, false, 1))
        .await;
    assert_eq!(result.stat, Response::DeniedNoLocks);
    assert!(zone.registry.find("new-during-shutdown", Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 3001)).await.is_none());
}
