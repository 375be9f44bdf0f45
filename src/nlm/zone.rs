//! Zone — top-level NLM instance tying components A–H together.
//!
//! One `Zone` per NFS server instance (spec §3 "Zone-global state"). Owns
//! the registry, the sleeping-lock table, the SM client, the grace clock,
//! and the GC task, and implements the startup and shutdown sequencing
//! from spec §5.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::nlm::collaborators::{FileHandleResolver, LocalLockManager, ShareManager};
use crate::nlm::config::NlmConfig;
use crate::nlm::error::CoreError;
use crate::nlm::gc::Gc;
use crate::nlm::grace::{start_grace, ClientReclaimer, GraceClock};
use crate::nlm::handlers::{GrantedCallback, NlmCore};
use crate::nlm::registry::Registry;
use crate::nlm::slock::SleepingLockTable;
use crate::nlm::sm_client::{SmClient, SmTransport};

/// Zone lifecycle state (spec §5 "Shutdown (STOPPING)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStatus {
    Starting = 0,
    Up = 1,
    Stopping = 2,
    Down = 3,
}

impl RunStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => RunStatus::Starting,
            1 => RunStatus::Up,
            2 => RunStatus::Stopping,
            _ => RunStatus::Down,
        }
    }
}

/// Collaborators a `Zone` needs from the rest of the host, injected rather
/// than constructed here (spec §6: these live outside this core).
pub struct ZoneDeps {
    pub transport: Arc<dyn SmTransport>,
    pub lock_manager: Arc<dyn LocalLockManager>,
    pub share_manager: Arc<dyn ShareManager>,
    pub fh_resolver: Arc<dyn FileHandleResolver>,
    pub reclaimer: Arc<dyn ClientReclaimer>,
    pub granted_callback: Arc<dyn GrantedCallback>,
}

pub struct Zone {
    pub core: NlmCore,
    pub registry: Arc<Registry>,
    pub grace: Arc<GraceClock>,
    pub config: NlmConfig,
    gc: Arc<Gc>,
    gc_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Zone {
    /// Start a zone: resolve the status monitor, run the startup grace
    /// sequence, and spawn the GC task. Returns before the grace window
    /// elapses — callers begin serving RPCs immediately, with LOCK/SHARE
    /// denied `DENIED_GRACE_PERIOD` until it does (handled in
    /// [`crate::nlm::handlers`]).
    pub async fn start(config: NlmConfig, deps: ZoneDeps) -> Result<Arc<Self>, CoreError> {
        let registry = Arc::new(Registry::new());
        let slocks = Arc::new(SleepingLockTable::new());

        let sm = SmClient::connect(deps.transport, config.sm_bind_retries, config.sm_bind_backoff()).await?;
        let (_nsm_state, grace_clock) = start_grace(&sm, config.grace_period()).await?;
        let grace = Arc::new(grace_clock);

        let gc = Arc::new(Gc::new(
            Arc::clone(&registry),
            Arc::clone(&deps.lock_manager),
            Arc::clone(&deps.share_manager),
            sm.clone(),
            config.idle_timeout(),
        ));

        let core = NlmCore {
            registry: Arc::clone(&registry),
            slocks,
            sm,
            grace: Arc::clone(&grace),
            lock_manager: deps.lock_manager,
            share_manager: deps.share_manager,
            fh_resolver: deps.fh_resolver,
            reclaimer: deps.reclaimer,
            granted_callback: deps.granted_callback,
            idle_timeout: config.idle_timeout(),
        };

        let zone = Arc::new(Zone {
            core,
            registry,
            grace,
            config,
            gc: Arc::clone(&gc),
            gc_handle: std::sync::Mutex::new(None),
        });

        *zone.gc_handle.lock().unwrap() = Some(Arc::clone(&gc).spawn());
        zone.registry.set_status(RunStatus::Up);
        info!("zone started");
        Ok(zone)
    }

    /// Current lifecycle state, tracked on [`Registry`] since that is where
    /// `find_or_create` needs to read it from.
    pub fn status(&self) -> RunStatus {
        self.registry.status()
    }

    /// Shutdown sequencing per spec §5: flip to STOPPING (so
    /// `Registry::find_or_create` refuses new hosts with
    /// [`CoreError::ShuttingDown`]), signal and join the GC task, fan out a
    /// `state == 0` crash notification to every live host, drain idle hosts
    /// with bounded exponential backoff, `unmon_all`, then drop the SM
    /// client.
    pub async fn shutdown(&self) {
        self.registry.set_status(RunStatus::Stopping);

        for host in self.registry.snapshot_all().await {
            self.registry
                .notify_server_side(&host, 0, self.core.lock_manager.as_ref(), self.core.share_manager.as_ref())
                .await;
            self.core.slocks.cancel_all_for(host.sysid);
        }

        // Drain every host that has gone idle (no references, no vholds
        // left after the fan-out above); anything still referenced by an
        // in-flight RPC is retried with backoff until it too drains.
        let mut backoff = Duration::from_millis(50);
        let cap = Duration::from_secs(5);
        loop {
            let hosts = self.registry.snapshot_all().await;
            if hosts.is_empty() {
                break;
            }
            let mut drained_any = false;
            for host in &hosts {
                if host.refs() != 0 {
                    continue;
                }
                if !host.lock().await.vholds.is_empty() {
                    continue;
                }
                self.registry.unregister(host).await;
                self.registry.unmonitor(host, &self.core.sm).await;
                self.registry.destroy(host).await;
                drained_any = true;
            }
            if !drained_any {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(cap);
            }
        }

        self.gc.shutdown_flag().store(true, Ordering::Release);
        if let Some(handle) = self.gc_handle.lock().unwrap().take() {
            handle.abort();
        }

        let _ = self.core.sm.unmon_all().await;
        self.registry.set_status(RunStatus::Down);
        info!("zone shut down");
    }
}
