//! External collaborator interfaces (spec §6).
//!
//! The NLM core does not implement local byte-range locking, DOS share
//! reservations, or file-handle resolution — those live in the local
//! file-locking manager and the VFS layer. This module defines the small
//! contracts the core calls through, plus an in-process implementation
//! used by tests (analogous to how `demos/shadow_fs`/`demos/in_memory`
//! stand in for `crate::vfs::Vfs`).

use crate::nlm::sysid::Sysid;
use crate::nlm::{AccessMode, ShareMode, Vp};

/// A held or requested byte range, identifying a lock by its extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockDesc {
    pub offset: u64,
    pub len: u64,
    pub exclusive: bool,
    pub pid: u32,
}

/// Whether a `set_lock` attempt should block until it can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetLockMode {
    NonBlock,
    Block,
}

/// Outcome of a local `set_lock` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Ok,
    /// Conflicting lock exists; would need to block to proceed.
    Conflict,
    /// Local lock manager could not allocate the resources to track this lock.
    NoLocks,
}

/// Holder of a conflicting lock, as reported by `get_lock`.
#[derive(Debug, Clone, Copy)]
pub struct LocalHolder {
    pub exclusive: bool,
    pub pid: u32,
    pub sysid: Sysid,
    pub offset: u64,
    pub len: u64,
}

/// Mask passed to `sysid_has_locks` (spec §4.G: `sysid | CLIENT_FLAG`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysidMask {
    /// Locks this sysid holds as a server, on behalf of a remote peer.
    Server,
    /// Locks this sysid holds as a client, on a remote server.
    Client,
}

/// The local file-locking manager: advisory byte-range locks, addressed by
/// `(vp, sysid)`.
pub trait LocalLockManager: Send + Sync {
    /// Attempt to install `desc` for `sysid` on `vp`. `mode == Block` may
    /// take arbitrarily long and must never be called while holding a core
    /// lock (see [`crate::nlm::handlers`]).
    fn set_lock(&self, vp: &Vp, desc: LockDesc, sysid: Sysid, mode: SetLockMode) -> LockOutcome;

    /// Report a conflicting holder for `desc` on `vp`, if any. `sysid` is
    /// the requester's own: a lock it already holds there is never a
    /// conflict with itself (matches `fcntl(F_GETLK)` semantics).
    fn get_lock(&self, vp: &Vp, desc: LockDesc, sysid: Sysid) -> Option<LocalHolder>;

    /// Drop every lock held by `sysid` on `vp`.
    fn unlock_sysid(&self, vp: &Vp, sysid: Sysid);

    /// True iff `sysid` holds any lock matching `mask`, anywhere.
    fn sysid_has_locks(&self, sysid: Sysid, mask: SysidMask) -> bool;
}

/// DOS-style share reservation, addressed by `(vp, sysid)`.
pub trait ShareManager: Send + Sync {
    fn share_set(
        &self,
        vp: &Vp,
        sysid: Sysid,
        deny: ShareMode,
        access: AccessMode,
    ) -> Result<(), ()>;

    fn share_unset(&self, vp: &Vp, sysid: Sysid);

    /// True iff `sysid` holds any share reservation on `vp`.
    fn shares_for_sysid(&self, vp: &Vp, sysid: Sysid) -> bool;
}

/// Resolves protocol file-handle bytes to a local file reference.
pub trait FileHandleResolver: Send + Sync {
    fn resolve(&self, fh: &[u8]) -> Option<Vp>;
}

/// In-process implementations of the three collaborator traits, for tests.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::vfs::FileHandle;

    #[derive(Default)]
    struct LockState {
        // One slot per (vp, sysid): a lock manager this simple only needs
        // to track whether a sysid holds *a* lock and its last-known
        // extent, since tests only assert conflict/no-conflict and
        // per-sysid teardown.
        held: HashMap<(Vp, Sysid), LockDesc>,
    }

    /// A single-process, `Mutex`-guarded stand-in for the real local lock
    /// manager, enough to drive the scenarios in spec §8.
    #[derive(Default)]
    pub struct MemoryLockManager {
        state: Mutex<LockState>,
    }

    impl MemoryLockManager {
        pub fn new() -> Self {
            Self::default()
        }

        fn conflicts(held: &LockDesc, requested: &LockDesc) -> bool {
            let overlap = requested.offset < held.offset + held.len
                && held.offset < requested.offset + requested.len;
            overlap && (held.exclusive || requested.exclusive)
        }
    }

    impl LocalLockManager for MemoryLockManager {
        fn set_lock(&self, vp: &Vp, desc: LockDesc, sysid: Sysid, _mode: SetLockMode) -> LockOutcome {
            let mut state = self.state.lock().unwrap();
            for ((held_vp, held_sysid), held_desc) in state.held.iter() {
                if held_vp == vp && *held_sysid != sysid && Self::conflicts(held_desc, &desc) {
                    return LockOutcome::Conflict;
                }
            }
            if desc.len == 0 {
                // F_UNLCK convention used by handlers: zero-length, non-exclusive
                // descriptors released through `set_lock` mean "clear my lock here".
                state.held.remove(&(vp.clone(), sysid));
            } else {
                state.held.insert((vp.clone(), sysid), desc);
            }
            LockOutcome::Ok
        }

        fn get_lock(&self, vp: &Vp, desc: LockDesc, sysid: Sysid) -> Option<LocalHolder> {
            let state = self.state.lock().unwrap();
            state.held.iter().find_map(|((held_vp, held_sysid), held_desc)| {
                if held_vp == vp && *held_sysid != sysid && Self::conflicts(held_desc, &desc) {
                    Some(LocalHolder {
                        exclusive: held_desc.exclusive,
                        pid: held_desc.pid,
                        sysid: *held_sysid,
                        offset: held_desc.offset,
                        len: held_desc.len,
                    })
                } else {
                    None
                }
            })
        }

        fn unlock_sysid(&self, vp: &Vp, sysid: Sysid) {
            let mut state = self.state.lock().unwrap();
            state.held.remove(&(vp.clone(), sysid));
        }

        fn sysid_has_locks(&self, sysid: Sysid, _mask: SysidMask) -> bool {
            let state = self.state.lock().unwrap();
            state.held.keys().any(|(_, held_sysid)| *held_sysid == sysid)
        }
    }

    /// In-process share-reservation table, keyed the same way as
    /// [`MemoryLockManager`].
    #[derive(Default)]
    pub struct MemoryShareManager {
        shares: Mutex<HashMap<(Vp, Sysid), (ShareMode, AccessMode)>>,
    }

    impl MemoryShareManager {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl ShareManager for MemoryShareManager {
        fn share_set(
            &self,
            vp: &Vp,
            sysid: Sysid,
            deny: ShareMode,
            access: AccessMode,
        ) -> Result<(), ()> {
            let mut shares = self.shares.lock().unwrap();
            for ((held_vp, held_sysid), (held_deny, held_access)) in shares.iter() {
                if held_vp != vp || *held_sysid == sysid {
                    continue;
                }
                let denies_us = matches!(held_deny, ShareMode::DenyWrite | ShareMode::DenyReadWrite)
                    && matches!(access, AccessMode::Write | AccessMode::ReadWrite);
                let we_deny_them = matches!(deny, ShareMode::DenyWrite | ShareMode::DenyReadWrite)
                    && matches!(held_access, AccessMode::Write | AccessMode::ReadWrite);
                if denies_us || we_deny_them {
                    return Err(());
                }
            }
            shares.insert((vp.clone(), sysid), (deny, access));
            Ok(())
        }

        fn share_unset(&self, vp: &Vp, sysid: Sysid) {
            self.shares.lock().unwrap().remove(&(vp.clone(), sysid));
        }

        fn shares_for_sysid(&self, vp: &Vp, sysid: Sysid) -> bool {
            self.shares.lock().unwrap().contains_key(&(vp.clone(), sysid))
        }
    }

    /// Trivial resolver: treats the handle bytes as already being the
    /// canonical [`Vp`] representation.
    #[derive(Default)]
    pub struct MemoryFileHandleResolver;

    impl MemoryFileHandleResolver {
        pub fn new() -> Self {
            Self
        }
    }

    impl FileHandleResolver for MemoryFileHandleResolver {
        fn resolve(&self, fh: &[u8]) -> Option<Vp> {
            if fh.is_empty() {
                None
            } else {
                Some(Arc::new(FileHandle(fh.to_vec())))
            }
        }
    }
}
