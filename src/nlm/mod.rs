//! Network Lock Manager (NLM) subsystem.
//!
//! Exposes the NLM wire protocol as a Rust trait ([`Nlm`]) and implements
//! the host/lock-state engine behind it: the host registry ([`registry`]),
//! the per-host vhold table ([`vhold`]), the sleeping-lock table
//! ([`slock`]), the status-monitor client ([`sm_client`]), the grace and
//! recovery engine ([`grace`]), and the garbage collector ([`gc`]).
//!
//! The wire codec and RPC dispatcher that decode requests into the types
//! below and deliver them to [`Nlm`] implementations are out of scope —
//! only this trait contract is defined here.

use async_trait::async_trait;

use std::sync::Arc;

use crate::vfs::FileHandle;

pub mod collaborators;
pub mod config;
pub mod error;
pub mod gc;
pub mod grace;
pub mod handlers;
pub mod host;
pub mod nsm;
pub mod registry;
pub mod slock;
pub mod sm_client;
pub mod sysid;
pub mod vhold;
pub mod zone;

/// Pinned vnode reference a [`vhold::Vhold`] holds alive. Shared via `Arc`
/// so a vhold and the local lock manager's own bookkeeping can reference
/// the same file identity without cloning its bytes.
pub type Vp = Arc<FileHandle>;

/// Maximum size of an opaque `netobj` (owner/cookie) per the NLM protocol.
pub const NETOBJ_SIZE: usize = 8;

/// Maximum length of a client host name per the NLM protocol.
pub const MAX_CLIENT_NAME_LEN: usize = 255;

/// Status returned by the NLM procedures (RFC-equivalent `nlm4_stats`).
#[allow(dead_code)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum Response {
    /// Indicates that the procedure call completed successfully.
    Granted = 0,
    /// Indicates that the request failed.
    Denied = 1,
    /// Indicates that the procedure call failed
    /// because the server NLM could not allocate
    /// the resources needed to process the request.
    DeniedNoLocks = 2,
    /// Indicates the blocking request cannot be granted immediately.
    /// The server NLM will make a call-back to the client
    /// with an NLM_GRANTED procedure call when the lock can be granted.
    Blocked = 3,
    /// Indicates that the procedure call failed
    /// because the server has recently been rebooted
    /// and the server NLM is re-establishing existing locks,
    /// and is not yet ready to accept normal service requests.
    DeniedGracePeriod = 4,
    /// The request could not be granted and blocking would cause a deadlock.
    Deadlock = 5,
    /// The call failed because the remote file system is read-only.
    ReadonlyFileSystem = 6,
    /// The call failed because it uses an invalid file handle.
    InvalidFileHandler = 7,
    /// The call failed because it specified a length or offset
    /// that exceeds the range supported by the server.
    ExceededRange = 8,
    /// The call failed for some reason not already listed.
    /// The client should probably retry the request.
    Failed = 9,
    /// The file handle could not be resolved to a local file.
    StaleFileHandle = 10,
}

/// Opaque host name, fixed at the protocol's maximum length.
#[derive(Debug, Clone)]
pub struct ClientName(pub String);

/// Opaque object (owner cookie / lock-request cookie) per the NLM protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Netobj(pub [u8; NETOBJ_SIZE]);

/// Holder of a lock.
#[derive(Debug, Clone)]
pub struct Holder {
    /// Tells whether the holder has an exclusive lock or a shared lock.
    pub exclusive: bool,
    /// Identifies the process that is holding the lock.
    pub pid: u32,
    /// An opaque object that identifies the host,
    /// or a process on the host, that is holding the lock.
    pub owner: Netobj,
    /// Identifies the offset of the region that is locked.
    pub locked_offset: u64,
    /// Identifies the length of the region that is locked.
    pub locked_len: u64,
}

/// Lock request.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Host that is making the request.
    pub client_name: ClientName,
    /// File to lock. NFS Server id, opaque to client.
    pub nfs_fh: FileHandle,
    /// An opaque object that identifies the host,
    /// or a process on the host, that is making the request.
    pub owner: Netobj,
    /// Process that is making the request.
    pub pid: u32,
    /// Offset of the region that is locked.
    pub locked_offset: u64,
    /// Length of the region that is locked.
    /// A l_len of zero means "to end-of-file."
    pub locked_len: u64,
}

/// Information needed to request a lock on a server.
#[derive(Debug, Clone)]
pub struct LockArgs {
    pub cookie: Netobj,
    pub block: bool,
    pub exclusive: bool,
    pub actual_lock: LockRequest,
    pub reclaim: bool,
    pub state: u32,
}

/// The result of the lock requests,
/// returned by all of the main lock routines except for NLM_TEST.
#[derive(Debug, Clone)]
pub struct LockResult {
    /// Cookie echoed back from the request.
    pub cookie: Netobj,
    /// Actual response to the lock request.
    pub stat: Response,
}

/// Information needed to cancel an outstanding lock request.
/// The data in the CancelArgs structure must exactly match
/// the corresponding information in the LockArgs structure
/// of the outstanding lock request to be cancelled.
#[derive(Debug, Clone)]
pub struct CancelArgs {
    pub cookie: Netobj,
    pub block: bool,
    pub exclusive: bool,
    pub actual_lock: LockRequest,
}

/// Information needed to remove a previously established lock.
#[derive(Debug, Clone)]
pub struct UnlockArgs {
    pub cookie: Netobj,
    pub actual_lock: LockRequest,
}

/// DOS file-sharing deny mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum ShareMode {
    /// Deny none.
    DenyNone = 0,
    /// Deny read.
    DenyRead = 1,
    /// Deny write.
    DenyWrite = 2,
    /// Deny read/write.
    DenyReadWrite = 3,
}

/// DOS file-sharing access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum AccessMode {
    /// None.
    None = 0,
    /// Read-only.
    Read = 1,
    /// Write-only.
    Write = 2,
    /// Read/Write.
    ReadWrite = 3,
}

/// DOS file sharing description.
#[derive(Debug, Clone)]
pub struct Share {
    /// Host that is making the request.
    pub client_name: ClientName,
    /// File to be operated on. NFS Server id, opaque to client.
    pub nfs_fh: FileHandle,
    /// An opaque object that identifies the host,
    /// or a process on the host, that is making the request.
    pub owner: Netobj,
    /// File-sharing mode. Identifies what is allowed to other clients.
    pub share_mode: ShareMode,
    /// Access mode, requested by the client.
    pub access_mode: AccessMode,
}

/// Information needed to uniquely specify a share operation.
/// Arguments for an NLM_SHARE or NLM_UNSHARE.
#[derive(Debug, Clone)]
pub struct ShareArgs {
    pub cookie: Netobj,
    /// Actual share data.
    pub share: Share,
    /// Must be true if the client is attempting to
    /// reclaim a previously-granted sharing request.
    pub reclaim: bool,
}

/// Results of an NLM_SHARE or NLM_UNSHARE procedure call.
#[derive(Debug, Clone)]
pub struct ShareResult {
    pub cookie: Netobj,
    /// Actual response to the share request.
    pub stat: Response,
    /// Sequence number.
    pub sequence: i32,
}

/// Arguments for the NLM_FREE_ALL call, made after a server reboot.
#[derive(Debug, Clone)]
pub struct Notify {
    /// Name of the host whose locks should be dropped.
    pub name: String,
    /// New state number of that host.
    pub state: i64,
}

/// Arguments for the TEST procedure.
#[derive(Debug, Clone)]
pub struct TestArgs {
    pub cookie: Netobj,
    pub exclusive: bool,
    pub actual_lock: LockRequest,
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub cookie: Netobj,
    pub test_stat: Response,
    pub holder: Option<Holder>,
}

/// Peer transport identity the dispatcher resolves a request against,
/// delivered alongside the decoded wire arguments (spec §3: a peer is the
/// triple `(name, netid, address)`, but that triple lives at the RPC/
/// transport layer, not in any single procedure's argument struct).
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub netid: host::Netid,
    pub addr: host::PeerAddr,
}

#[async_trait]
pub trait Nlm: Sync + Send {
    async fn null(&self, promise: impl promise::Null);

    async fn test(&self, peer: PeerInfo, args: TestArgs, promise: impl promise::Test);

    async fn lock(&self, peer: PeerInfo, args: LockArgs, promise: impl promise::Lock);

    async fn cancel(&self, peer: PeerInfo, args: CancelArgs, promise: impl promise::Cancel);

    async fn unlock(&self, peer: PeerInfo, args: UnlockArgs, promise: impl promise::Unlock);

    // Server-to-Client callback
    async fn granted(&self, args: TestArgs, promise: impl promise::Granted);

    async fn share(&self, peer: PeerInfo, args: ShareArgs, promise: impl promise::Share);

    async fn unshare(&self, peer: PeerInfo, args: ShareArgs, promise: impl promise::Share);

    async fn free_all(&self, args: Notify, promise: impl promise::Void);

    /// Callback made by the local status monitor when a watched peer's
    /// state changes (`priv` is the sysid we handed it in [`nsm`]'s `mon`).
    async fn notify1(&self, priv_sysid: [u8; nsm::PRIVATE_LEN], state: u32, promise: impl promise::Void);
}

pub mod promise {
    use crate::nlm::{LockResult, TestResult, ShareResult};

    pub trait Null {
        fn keep(self);
    }

    pub trait Test {
        fn keep(self, result: TestResult);
    }

    pub trait Lock {
        fn keep(self, result: LockResult);
    }

    pub trait Cancel {
        fn keep(self, result: LockResult);
    }

    pub trait Unlock {
        fn keep(self, result: LockResult);
    }

    pub trait Granted {
        fn keep(self, result: LockResult);
    }

    pub trait Share {
        fn keep(self, result: ShareResult);
    }

    /// Generic promise for procedures that return void (or just success/fail without data).
    pub trait Void {
        fn keep(self);
    }
}
