//! Minimal daemon wiring for the NLM core: CLI + TOML config + tracing +
//! `Zone::start`. The RPC/transport layer (portmapper, wire codec, the
//! real status monitor) is out of this crate's scope, so this demo plugs
//! in the in-process collaborator stand-ins from `nlm::collaborators::memory`
//! and a status monitor transport that always reports state 1.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nlm_core::nlm::collaborators::memory::{MemoryFileHandleResolver, MemoryLockManager, MemoryShareManager};
use nlm_core::nlm::config::NlmConfig;
use nlm_core::nlm::error::CoreError;
use nlm_core::nlm::grace::ClientReclaimer;
use nlm_core::nlm::handlers::GrantedCallback;
use nlm_core::nlm::host::Host;
use nlm_core::nlm::sm_client::SmTransport;
use nlm_core::nlm::zone::{Zone, ZoneDeps};
use nlm_core::nlm::TestArgs;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nlmd", about = "Network Lock Manager demo daemon")]
struct Args {
    /// Path to a TOML config file (missing file falls back to defaults).
    #[arg(long, default_value = "nlmd.toml")]
    config: PathBuf,
}

/// Stand-in for the real `rpc.statd` transport: this demo runs with no
/// peers, so every call trivially succeeds.
struct LoopbackSm;

#[async_trait::async_trait]
impl SmTransport for LoopbackSm {
    async fn simu_crash(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn stat(&self) -> Result<u32, CoreError> {
        Ok(1)
    }

    async fn mon(&self, host_name: &str, _priv_sysid: [u8; nlm_core::nlm::nsm::PRIVATE_LEN]) -> Result<(), CoreError> {
        info!(host_name, "mon (loopback, no-op)");
        Ok(())
    }

    async fn unmon(&self, host_name: &str) -> Result<(), CoreError> {
        info!(host_name, "unmon (loopback, no-op)");
        Ok(())
    }

    async fn unmon_all(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

struct LoggingReclaimer;

#[async_trait::async_trait]
impl ClientReclaimer for LoggingReclaimer {
    async fn reclaim_client(&self, host: &Arc<Host>) {
        info!(sysid = host.sysid.0, name = %host.name, "reclaiming client locks (demo: nothing to replay)");
    }
}

struct LoggingGrantedCallback;

#[async_trait::async_trait]
impl GrantedCallback for LoggingGrantedCallback {
    async fn send_granted(&self, host: &Arc<Host>, _args: &TestArgs) -> bool {
        info!(sysid = host.sysid.0, "GRANTED back-call (demo: not actually sent)");
        true
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let config = NlmConfig::load(&args.config).unwrap_or_else(|err| {
        tracing::warn!(?err, path = ?args.config, "failed to load config, using defaults");
        NlmConfig::default()
    });

    let deps = ZoneDeps {
        transport: Arc::new(LoopbackSm),
        lock_manager: Arc::new(MemoryLockManager::new()),
        share_manager: Arc::new(MemoryShareManager::new()),
        fh_resolver: Arc::new(MemoryFileHandleResolver::new()),
        reclaimer: Arc::new(LoggingReclaimer),
        granted_callback: Arc::new(LoggingGrantedCallback),
    };

    let zone = Zone::start(config, deps).await.expect("zone failed to start");
    info!(status = ?zone.status(), "nlmd up, serving nothing (demo wiring only)");

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    info!("shutting down");
    zone.shutdown().await;
}
