//! Garbage collector — component G.
//!
//! One task per zone (spec calls it "one thread per zone"; see
//! [`crate::nlm::grace`] for why a tokio task is this crate's stand-in).
//! The explicit drop-registry-lock/take-host-lock/retake-registry-lock
//! sequence is its own named function, [`Gc::sweep_one`], so the ordering
//! required by spec §4.G/§5 is a single reviewable unit instead of being
//! inlined into the sweep loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::nlm::collaborators::{LocalLockManager, ShareManager, SysidMask};
use crate::nlm::registry::Registry;
use crate::nlm::sm_client::SmClient;

/// Outcome of one idle-host sweep step, for tests and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// `idle_deadline` moved forward since the candidate snapshot was
    /// taken; nothing to do, a user grabbed the host meanwhile.
    Stale,
    /// Host still has locks or a reference; deadline restamped.
    Restamped,
    /// Host was destroyed.
    Destroyed,
}

pub struct Gc {
    registry: Arc<Registry>,
    lock_manager: Arc<dyn LocalLockManager>,
    share_manager: Arc<dyn ShareManager>,
    sm: SmClient,
    idle_timeout: Duration,
    shutting_down: Arc<AtomicBool>,
}

impl Gc {
    pub fn new(
        registry: Arc<Registry>,
        lock_manager: Arc<dyn LocalLockManager>,
        share_manager: Arc<dyn ShareManager>,
        sm: SmClient,
        idle_timeout: Duration,
    ) -> Self {
        Gc { registry, lock_manager, share_manager, sm, idle_timeout, shutting_down: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutting_down)
    }

    /// Process one candidate sysid from the idle-LRU snapshot, performing
    /// the drop-registry/take-host/retake-registry sequence spec §4.G and
    /// §5 require.
    async fn sweep_one(&self, sysid: crate::nlm::sysid::Sysid, seen_deadline: Instant) -> Option<SweepOutcome> {
        // "Drop the registry lock, take the host's lock": the snapshot read
        // that produced `seen_deadline` already released the registry lock,
        // so entering here we hold neither — only the host lock is taken.
        let host = {
            let inner = &self.registry;
            // Re-resolve rather than carry the Arc across the gap, so a
            // host destroyed between snapshot and sweep is simply absent.
            inner.find_by_sysid(sysid).await?
        };

        let has_locks = {
            let mut guard = host.lock().await;
            guard.vholds.gc(host.sysid, self.lock_manager.as_ref(), self.share_manager.as_ref());
            let _ = guard.vholds.collect_garbage();
            !guard.vholds.is_empty() || self.lock_manager.sysid_has_locks(host.sysid, SysidMask::Client)
        };

        // Host lock dropped here; retake the registry lock via
        // `is_still_idle_and_due`, which re-validates `idle_deadline` and
        // `refs` atomically under that lock.
        let revalidated = self.registry.is_still_idle_and_due(sysid, seen_deadline).await;
        let Some(host) = revalidated else {
            return Some(SweepOutcome::Stale);
        };

        if has_locks || host.refs() > 0 {
            self.registry.release(&host, self.idle_timeout).await;
            return Some(SweepOutcome::Restamped);
        }

        self.registry.unregister(&host).await;
        self.registry.unmonitor(&host, &self.sm).await;
        self.registry.destroy(&host).await;
        debug!(sysid = sysid.0, "GC destroyed idle host");
        Some(SweepOutcome::Destroyed)
    }

    /// Run one full sweep of the idle LRU, head-first.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let candidates = self.registry.idle_candidates(now).await;
        for sysid in candidates {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            let Some(host) = self.registry.find_by_sysid(sysid).await else { continue };
            let Some(deadline) = host.idle_deadline() else { continue };
            if deadline > now {
                continue;
            }
            self.sweep_one(sysid, deadline).await;
        }
    }

    /// Spawn the per-zone GC task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("GC task started");
            loop {
                tokio::time::sleep(self.idle_timeout.min(Duration::from_secs(30))).await;
                if self.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                self.sweep().await;
            }
            info!("GC task exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nlm::collaborators::memory::{MemoryLockManager, MemoryShareManager};
    use crate::nlm::host::{Netid, PeerAddr};
    use crate::nlm::sm_client::SmTransport;
    use std::net::Ipv4Addr;

    struct NoopTransport;

    #[async_trait::async_trait]
    impl SmTransport for NoopTransport {
        async fn simu_crash(&self) -> Result<(), crate::nlm::error::CoreError> {
            Ok(())
        }
        async fn stat(&self) -> Result<u32, crate::nlm::error::CoreError> {
            Ok(1)
        }
        async fn mon(&self, _: &str, _: [u8; crate::nlm::nsm::PRIVATE_LEN]) -> Result<(), crate::nlm::error::CoreError> {
            Ok(())
        }
        async fn unmon(&self, _: &str) -> Result<(), crate::nlm::error::CoreError> {
            Ok(())
        }
        async fn unmon_all(&self) -> Result<(), crate::nlm::error::CoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn idle_host_with_no_locks_is_destroyed() {
        let registry = Arc::new(Registry::new());
        let lock_manager: Arc<dyn LocalLockManager> = Arc::new(MemoryLockManager::new());
        let share_manager: Arc<dyn ShareManager> = Arc::new(MemoryShareManager::new());
        let sm = SmClient::connect(Arc::new(NoopTransport), 1, Duration::from_millis(1)).await.unwrap();

        let host = registry
            .find_or_create("alpha", Netid::Tcp, PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 2001))
            .await
            .unwrap();
        registry.acquire(&host).await;
        registry.release(&host, Duration::from_millis(0)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let gc = Gc::new(registry.clone(), lock_manager, share_manager, sm, Duration::from_millis(0));
        gc.sweep().await;

        assert!(registry.find_by_sysid(host.sysid).await.is_none());
    }
}
