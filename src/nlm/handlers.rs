//! Request handlers — component H.
//!
//! `NlmCore` implements [`crate::nlm::Nlm`] as thin orchestrations over
//! components A–G. `SET_LOCK_WAIT` (the blocking variant spec.md says runs
//! holding no core lock) is dispatched through [`tokio::task::spawn_blocking`]
//! so the blocking local-lock-manager call never runs on a task that is
//! also holding a core lock.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::nlm::collaborators::{FileHandleResolver, LocalLockManager, LockDesc, LockOutcome, SetLockMode, ShareManager, SysidMask};
use crate::nlm::grace::{spawn_reclaimer, ClientReclaimer, GraceClock};
use crate::nlm::host::Host;
use crate::nlm::registry::Registry;
use crate::nlm::slock::SleepingLockTable;
use crate::nlm::sm_client::SmClient;
use crate::nlm::sysid::Sysid;
use crate::nlm::{
    CancelArgs, LockArgs, LockResult, Netobj, Notify as FreeAllArgs, PeerInfo, Response, ShareArgs, ShareResult,
    TestArgs, TestResult, UnlockArgs,
};

/// Issues the GRANTED back-call to a peer after a blocking lock succeeds.
/// The transport/back-call channel is out of scope for this core (spec
/// §6: "RPC/transport ... back-call handles").
#[async_trait::async_trait]
pub trait GrantedCallback: Send + Sync {
    async fn send_granted(&self, host: &Arc<Host>, args: &TestArgs) -> bool;
}

pub struct NlmCore {
    pub registry: Arc<Registry>,
    pub slocks: Arc<SleepingLockTable>,
    pub sm: SmClient,
    pub grace: Arc<GraceClock>,
    pub lock_manager: Arc<dyn LocalLockManager>,
    pub share_manager: Arc<dyn ShareManager>,
    pub fh_resolver: Arc<dyn FileHandleResolver>,
    pub reclaimer: Arc<dyn ClientReclaimer>,
    pub granted_callback: Arc<dyn GrantedCallback>,
    pub idle_timeout: Duration,
}

impl NlmCore {
    async fn resolve_for_read(&self, peer: PeerInfo, name: &str) -> Option<Arc<Host>> {
        self.registry.find(name, peer.netid, peer.addr).await
    }

    pub async fn handle_test(&self, peer: PeerInfo, args: TestArgs) -> TestResult {
        let name = &args.actual_lock.client_name.0;
        let Some(host) = self.resolve_for_read(peer, name).await else {
            return TestResult { cookie: args.cookie, test_stat: Response::StaleFileHandle, holder: None };
        };

        if self.grace.is_active() {
            return TestResult { cookie: args.cookie, test_stat: Response::DeniedGracePeriod, holder: None };
        }

        let Some(vp) = self.fh_resolver.resolve(&args.actual_lock.nfs_fh.0) else {
            return TestResult { cookie: args.cookie, test_stat: Response::StaleFileHandle, holder: None };
        };

        let desc = LockDesc {
            offset: args.actual_lock.locked_offset,
            len: args.actual_lock.locked_len,
            exclusive: args.exclusive,
            pid: args.actual_lock.pid,
        };

        match self.lock_manager.get_lock(&vp, desc, host.sysid) {
            None => TestResult { cookie: args.cookie, test_stat: Response::Granted, holder: None },
            Some(holder) => TestResult {
                cookie: args.cookie,
                test_stat: Response::Denied,
                holder: Some(crate::nlm::Holder {
                    exclusive: holder.exclusive,
                    pid: holder.pid,
                    owner: holder.sysid.encode_owner(),
                    locked_offset: holder.offset,
                    locked_len: holder.len,
                }),
            },
        }
    }

    pub async fn handle_lock(&self, peer: PeerInfo, args: LockArgs) -> LockResult {
        let name = args.actual_lock.client_name.0.clone();
        let host = match self.registry.find_or_create(name.as_str(), peer.netid, peer.addr).await {
            Ok(host) => host,
            Err(_) => return LockResult { cookie: args.cookie, stat: Response::DeniedNoLocks },
        };
        self.registry.acquire(&host).await;

        if self.grace.is_active() && !args.reclaim {
            self.registry.release(&host, self.idle_timeout).await;
            return LockResult { cookie: args.cookie, stat: Response::DeniedGracePeriod };
        }

        if args.state != 0 && host.lock().await.state != args.state {
            self.registry
                .notify_server_side(&host, args.state, self.lock_manager.as_ref(), self.share_manager.as_ref())
                .await;
            self.slocks.cancel_all_for(host.sysid);
        }

        let Some(vp) = self.fh_resolver.resolve(&args.actual_lock.nfs_fh.0) else {
            self.registry.release(&host, self.idle_timeout).await;
            return LockResult { cookie: args.cookie, stat: Response::StaleFileHandle };
        };

        let desc = LockDesc {
            offset: args.actual_lock.locked_offset,
            len: args.actual_lock.locked_len,
            exclusive: args.exclusive,
            pid: args.actual_lock.pid,
        };

        let vhold = {
            let mut guard = host.lock().await;
            guard.vholds.get(&vp)
        };

        match self.lock_manager.set_lock(&vp, desc, host.sysid, SetLockMode::NonBlock) {
            LockOutcome::Ok => {
                self.registry.monitor(&host, args.state, &self.sm).await;
                self.registry.release(&host, self.idle_timeout).await;
                LockResult { cookie: args.cookie, stat: Response::Granted }
            }
            LockOutcome::NoLocks => {
                let mut guard = host.lock().await;
                guard.vholds.release(&vhold);
                guard.vholds.gc(host.sysid, self.lock_manager.as_ref(), self.share_manager.as_ref());
                let _ = guard.vholds.collect_garbage();
                drop(guard);
                self.registry.release(&host, self.idle_timeout).await;
                LockResult { cookie: args.cookie, stat: Response::DeniedNoLocks }
            }
            LockOutcome::Conflict if !args.block => {
                let mut guard = host.lock().await;
                guard.vholds.release(&vhold);
                guard.vholds.gc(host.sysid, self.lock_manager.as_ref(), self.share_manager.as_ref());
                let _ = guard.vholds.collect_garbage();
                drop(guard);
                self.registry.release(&host, self.idle_timeout).await;
                LockResult { cookie: args.cookie, stat: Response::Denied }
            }
            LockOutcome::Conflict => {
                self.registry.monitor(&host, args.state, &self.sm).await;
                // Capture the sysid by value before the blocking closure
                // takes ownership of it: `host.sysid` inside a `move ||`
                // would otherwise force the whole `Arc<Host>` to be moved,
                // and `host` is still needed below.
                let sysid = host.sysid;
                let slock_id = self.slocks.register(
                    sysid,
                    desc.offset,
                    desc.len,
                    desc.exclusive,
                    args.actual_lock.nfs_fh.0.clone(),
                );

                let lock_manager = Arc::clone(&self.lock_manager);
                let vp_for_wait = Arc::clone(&vp);
                let wait_handle = tokio::task::spawn_blocking(move || {
                    lock_manager.set_lock(&vp_for_wait, desc, sysid, SetLockMode::Block)
                });

                let registry = Arc::clone(&self.registry);
                let slocks = Arc::clone(&self.slocks);
                let idle_timeout = self.idle_timeout;
                let granted_callback = Arc::clone(&self.granted_callback);
                let test_args = TestArgs { cookie: args.cookie, exclusive: args.exclusive, actual_lock: args.actual_lock.clone() };
                let host_for_wait = Arc::clone(&host);
                let vhold_for_wait = Arc::clone(&vhold);
                let lock_manager_for_wait = Arc::clone(&self.lock_manager);
                let share_manager_for_wait = Arc::clone(&self.share_manager);
                tokio::spawn(async move {
                    let outcome = wait_handle.await;
                    {
                        let mut guard = host_for_wait.lock().await;
                        // A successful blocking grant leaves a real lock held
                        // for `sysid` on this vp: `gc` sees that via
                        // `sysid_has_locks` and keeps the vhold pinned, so a
                        // crash right after GRANTED still has something for
                        // `notify_server_side` to walk and clear.
                        guard.vholds.release(&vhold_for_wait);
                        guard.vholds.gc(sysid, lock_manager_for_wait.as_ref(), share_manager_for_wait.as_ref());
                        let _ = guard.vholds.collect_garbage();
                    }
                    registry.release(&host_for_wait, idle_timeout).await;
                    slocks.unregister(slock_id);
                    if matches!(outcome, Ok(LockOutcome::Ok)) {
                        granted_callback.send_granted(&host_for_wait, &test_args).await;
                    }
                });

                // The caller leg replies BLOCKED immediately; resolution is
                // driven by the spawned task above, independent of this
                // RPC's own lifetime.
                LockResult { cookie: args.cookie, stat: Response::Blocked }
            }
        }
    }

    pub async fn handle_cancel(&self, peer: PeerInfo, args: CancelArgs) -> LockResult {
        let name = &args.actual_lock.client_name.0;
        let Some(host) = self.resolve_for_read(peer, name).await else {
            return LockResult { cookie: args.cookie, stat: Response::Denied };
        };

        if self.grace.is_active() {
            return LockResult { cookie: args.cookie, stat: Response::DeniedGracePeriod };
        }

        let cancelled = self.slocks.cancel_match(
            host.sysid,
            args.actual_lock.locked_offset,
            args.actual_lock.locked_len,
            &args.actual_lock.nfs_fh.0,
        );

        // The requested sleep may have already succeeded locally between
        // the client's cancel decision and our arrival; poke the local
        // lock manager regardless, so a lock that raced in is cleared too.
        let had_lock = self.lock_manager.sysid_has_locks(host.sysid, SysidMask::Server);
        let vp = self.fh_resolver.resolve(&args.actual_lock.nfs_fh.0);
        if let Some(vp) = &vp {
            let desc = LockDesc { offset: args.actual_lock.locked_offset, len: 0, exclusive: false, pid: args.actual_lock.pid };
            let _ = self.lock_manager.set_lock(vp, desc, host.sysid, SetLockMode::NonBlock);
        }
        let cleared_locally = had_lock && !self.lock_manager.sysid_has_locks(host.sysid, SysidMask::Server);

        if cleared_locally {
            if let Some(vp) = &vp {
                let mut guard = host.lock().await;
                if let Some(vhold) = guard.vholds.find(vp) {
                    guard.vholds.release(&vhold);
                }
                guard.vholds.gc(host.sysid, self.lock_manager.as_ref(), self.share_manager.as_ref());
                let _ = guard.vholds.collect_garbage();
            }
        }

        LockResult { cookie: args.cookie, stat: if cancelled || cleared_locally { Response::Granted } else { Response::Denied } }
    }

    pub async fn handle_unlock(&self, peer: PeerInfo, args: UnlockArgs) -> LockResult {
        let name = &args.actual_lock.client_name.0;
        if let Some(host) = self.resolve_for_read(peer, name).await {
            if self.grace.is_active() {
                return LockResult { cookie: args.cookie, stat: Response::DeniedGracePeriod };
            }
            if let Some(vp) = self.fh_resolver.resolve(&args.actual_lock.nfs_fh.0) {
                let desc = LockDesc { offset: args.actual_lock.locked_offset, len: 0, exclusive: false, pid: args.actual_lock.pid };
                let _ = self.lock_manager.set_lock(&vp, desc, host.sysid, SetLockMode::NonBlock);

                // Release the hold taken by the LOCK this UNLOCK retires,
                // so the vhold can become GC-eligible once nothing else
                // (another lock, a share) keeps it busy.
                let mut guard = host.lock().await;
                if let Some(vhold) = guard.vholds.find(&vp) {
                    guard.vholds.release(&vhold);
                }
                guard.vholds.gc(host.sysid, self.lock_manager.as_ref(), self.share_manager.as_ref());
                let _ = guard.vholds.collect_garbage();
            }
        }
        // Protocol has no failure code for UNLOCK.
        LockResult { cookie: args.cookie, stat: Response::Granted }
    }

    pub async fn handle_granted(&self, args: TestArgs) -> LockResult {
        let sysid = Sysid::decode_owner(args.actual_lock.owner);
        let Some(_host) = self.registry.find_by_sysid(sysid).await else {
            return LockResult { cookie: args.cookie, stat: Response::Denied };
        };
        let matched = self.slocks.grant(
            sysid,
            args.actual_lock.locked_offset,
            args.actual_lock.locked_len,
            &args.actual_lock.nfs_fh.0,
        );
        LockResult { cookie: args.cookie, stat: if matched { Response::Granted } else { Response::Denied } }
    }

    pub async fn handle_share(&self, peer: PeerInfo, args: ShareArgs) -> ShareResult {
        self.do_share(peer, args, true).await
    }

    pub async fn handle_unshare(&self, peer: PeerInfo, args: ShareArgs) -> ShareResult {
        self.do_share(peer, args, false).await
    }

    async fn do_share(&self, peer: PeerInfo, args: ShareArgs, set: bool) -> ShareResult {
        let name = args.share.client_name.0.clone();
        let host = match self.registry.find_or_create(name.as_str(), peer.netid, peer.addr).await {
            Ok(host) => host,
            Err(_) => return ShareResult { cookie: args.cookie, stat: Response::DeniedNoLocks, sequence: 0 },
        };
        self.registry.acquire(&host).await;

        if set && self.grace.is_active() && !args.reclaim {
            self.registry.release(&host, self.idle_timeout).await;
            return ShareResult { cookie: args.cookie, stat: Response::DeniedGracePeriod, sequence: 0 };
        }

        let Some(vp) = self.fh_resolver.resolve(&args.share.nfs_fh.0) else {
            self.registry.release(&host, self.idle_timeout).await;
            return ShareResult { cookie: args.cookie, stat: Response::StaleFileHandle, sequence: 0 };
        };

        let stat = if set {
            let vhold = { host.lock().await.vholds.get(&vp) };
            match self.share_manager.share_set(&vp, host.sysid, args.share.share_mode, args.share.access_mode) {
                Ok(()) => {
                    self.registry.monitor(&host, 0, &self.sm).await;
                    Response::Granted
                }
                Err(()) => {
                    let mut guard = host.lock().await;
                    guard.vholds.release(&vhold);
                    guard.vholds.gc(host.sysid, self.lock_manager.as_ref(), self.share_manager.as_ref());
                    let _ = guard.vholds.collect_garbage();
                    Response::Denied
                }
            }
        } else {
            self.share_manager.share_unset(&vp, host.sysid);
            let mut guard = host.lock().await;
            if let Some(vhold) = guard.vholds.find(&vp) {
                guard.vholds.release(&vhold);
            }
            guard.vholds.gc(host.sysid, self.lock_manager.as_ref(), self.share_manager.as_ref());
            let _ = guard.vholds.collect_garbage();
            Response::Granted
        };

        self.registry.release(&host, self.idle_timeout).await;
        ShareResult { cookie: args.cookie, stat, sequence: 0 }
    }

    pub async fn handle_free_all(&self, args: FreeAllArgs) {
        for host in self.registry.find_all_by_name(&args.name).await {
            self.registry
                .notify_server_side(&host, args.state as u32, self.lock_manager.as_ref(), self.share_manager.as_ref())
                .await;
            self.slocks.cancel_all_for(host.sysid);
        }
    }

    /// `NOTIFY1(priv, state)`: `priv` is the sysid packed by
    /// [`crate::nlm::sysid::Sysid::encode_owner`] when we registered
    /// monitoring for this peer.
    pub async fn handle_notify1(&self, priv_sysid: [u8; crate::nlm::nsm::PRIVATE_LEN], state: u32) {
        let mut owner_bytes = [0u8; crate::nlm::NETOBJ_SIZE];
        owner_bytes.copy_from_slice(&priv_sysid[..crate::nlm::NETOBJ_SIZE]);
        let sysid = Sysid::decode_owner(Netobj(owner_bytes));

        let Some(host) = self.registry.find_by_sysid(sysid).await else {
            warn!(sysid = sysid.0, "NOTIFY1 for unknown sysid");
            return;
        };

        self.registry
            .notify_server_side(&host, state, self.lock_manager.as_ref(), self.share_manager.as_ref())
            .await;
        self.slocks.cancel_all_for(sysid);

        if self.registry.notify_client_side(&host, state).await {
            self.registry.acquire(&host).await;
            spawn_reclaimer(Arc::clone(&self.registry), host, Arc::clone(&self.reclaimer), self.idle_timeout);
        }
        info!(sysid = sysid.0, state, "processed NOTIFY1");
    }
}

#[async_trait::async_trait]
impl crate::nlm::Nlm for NlmCore {
    async fn null(&self, promise: impl crate::nlm::promise::Null) {
        promise.keep();
    }

    async fn test(&self, peer: PeerInfo, args: TestArgs, promise: impl crate::nlm::promise::Test) {
        promise.keep(self.handle_test(peer, args).await);
    }

    async fn lock(&self, peer: PeerInfo, args: LockArgs, promise: impl crate::nlm::promise::Lock) {
        promise.keep(self.handle_lock(peer, args).await);
    }

    async fn cancel(&self, peer: PeerInfo, args: CancelArgs, promise: impl crate::nlm::promise::Cancel) {
        promise.keep(self.handle_cancel(peer, args).await);
    }

    async fn unlock(&self, peer: PeerInfo, args: UnlockArgs, promise: impl crate::nlm::promise::Unlock) {
        promise.keep(self.handle_unlock(peer, args).await);
    }

    async fn granted(&self, args: TestArgs, promise: impl crate::nlm::promise::Granted) {
        promise.keep(self.handle_granted(args).await);
    }

    async fn share(&self, peer: PeerInfo, args: ShareArgs, promise: impl crate::nlm::promise::Share) {
        promise.keep(self.handle_share(peer, args).await);
    }

    async fn unshare(&self, peer: PeerInfo, args: ShareArgs, promise: impl crate::nlm::promise::Share) {
        promise.keep(self.handle_unshare(peer, args).await);
    }

    async fn free_all(&self, args: FreeAllArgs, promise: impl crate::nlm::promise::Void) {
        self.handle_free_all(args).await;
        promise.keep();
    }

    async fn notify1(&self, priv_sysid: [u8; crate::nlm::nsm::PRIVATE_LEN], state: u32, promise: impl crate::nlm::promise::Void) {
        self.handle_notify1(priv_sysid, state).await;
        promise.keep();
    }
}
