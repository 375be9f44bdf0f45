//! Status-monitor client — component E.
//!
//! Spec §4.E describes a single RPC handle guarded by a mutex, serializing
//! every call. This crate never awaits while holding a lock (see
//! `vfs_task`/`read_task`/`stream_writer`, none of which do either), so the
//! serialization is realized as a single-owner actor task reading a
//! channel instead of a literal mutex around an `.await` point: the actor
//! gives the same external guarantee — exactly one in-flight SM call at a
//! time — without the risk of a held lock spanning an await.

use std::time::Duration;

use async_channel::{Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::nlm::error::CoreError;
use crate::nlm::sysid::Sysid;

/// Opaque local state number handed back by the status monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmState(pub u32);

enum SmRequest {
    SimuCrash(oneshot::Sender<Result<(), CoreError>>),
    Stat(oneshot::Sender<Result<SmState, CoreError>>),
    Mon { host_name: String, priv_sysid: Sysid, reply: oneshot::Sender<Result<(), CoreError>> },
    Unmon { host_name: String, reply: oneshot::Sender<Result<(), CoreError>> },
    UnmonAll(oneshot::Sender<Result<(), CoreError>>),
}

/// A trait over the actual SM RPC surface, so the actor body can be tested
/// without a real portmapper/RPC transport. The real transport
/// implementation lives outside this crate's scope (spec §1: "the wire
/// RPC codec ... assumed to deliver").
#[async_trait::async_trait]
pub trait SmTransport: Send + Sync {
    async fn simu_crash(&self) -> Result<(), CoreError>;
    async fn stat(&self) -> Result<u32, CoreError>;
    async fn mon(&self, host_name: &str, priv_sysid: [u8; crate::nlm::nsm::PRIVATE_LEN]) -> Result<(), CoreError>;
    async fn unmon(&self, host_name: &str) -> Result<(), CoreError>;
    async fn unmon_all(&self) -> Result<(), CoreError>;
}

/// Handle to the SM actor task. Cheap to clone; every clone shares the
/// same mailbox, which is where the serialization actually happens.
#[derive(Clone)]
pub struct SmClient {
    requests: Sender<SmRequest>,
}

impl SmClient {
    /// Resolve the local status monitor via the portmapper with bounded
    /// retries, then spawn the serializing actor task.
    pub async fn connect(
        transport: std::sync::Arc<dyn SmTransport>,
        retries: u32,
        backoff: Duration,
    ) -> Result<Self, CoreError> {
        let mut attempt = 0;
        loop {
            match transport.stat().await {
                Ok(_) => break,
                Err(err) if attempt + 1 < retries => {
                    warn!(attempt, ?err, "SM not yet reachable, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(_) => return Err(CoreError::SmUnreachable),
            }
        }

        let (sender, receiver) = async_channel::unbounded();
        tokio::spawn(run_actor(transport, receiver));
        info!("status monitor client connected");
        Ok(SmClient { requests: sender })
    }

    pub async fn simu_crash(&self) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(SmRequest::SimuCrash(reply_tx))
            .await
            .map_err(|_| CoreError::SmUnreachable)?;
        reply_rx.await.map_err(|_| CoreError::SmUnreachable)?
    }

    pub async fn stat(&self) -> Result<SmState, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests.send(SmRequest::Stat(reply_tx)).await.map_err(|_| CoreError::SmUnreachable)?;
        reply_rx.await.map_err(|_| CoreError::SmUnreachable)?
    }

    pub async fn mon(&self, host_name: &str, priv_sysid: Sysid) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(SmRequest::Mon { host_name: host_name.to_string(), priv_sysid, reply: reply_tx })
            .await
            .map_err(|_| CoreError::SmUnreachable)?;
        reply_rx.await.map_err(|_| CoreError::SmUnreachable)?
    }

    pub async fn unmon(&self, host_name: &str) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(SmRequest::Unmon { host_name: host_name.to_string(), reply: reply_tx })
            .await
            .map_err(|_| CoreError::SmUnreachable)?;
        reply_rx.await.map_err(|_| CoreError::SmUnreachable)?
    }

    pub async fn unmon_all(&self) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests.send(SmRequest::UnmonAll(reply_tx)).await.map_err(|_| CoreError::SmUnreachable)?;
        reply_rx.await.map_err(|_| CoreError::SmUnreachable)?
    }
}

async fn run_actor(transport: std::sync::Arc<dyn SmTransport>, receiver: Receiver<SmRequest>) {
    while let Ok(request) = receiver.recv().await {
        match request {
            SmRequest::SimuCrash(reply) => {
                let _ = reply.send(transport.simu_crash().await);
            }
            SmRequest::Stat(reply) => {
                let _ = reply.send(transport.stat().await.map(SmState));
            }
            SmRequest::Mon { host_name, priv_sysid, reply } => {
                let mut priv_bytes = [0u8; crate::nlm::nsm::PRIVATE_LEN];
                priv_bytes[..4].copy_from_slice(&priv_sysid.0.to_be_bytes());
                let _ = reply.send(transport.mon(&host_name, priv_bytes).await);
            }
            SmRequest::Unmon { host_name, reply } => {
                let _ = reply.send(transport.unmon(&host_name).await);
            }
            SmRequest::UnmonAll(reply) => {
                let _ = reply.send(transport.unmon_all().await);
            }
        }
    }
}
