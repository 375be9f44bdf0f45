//! Sleeping-lock table — component D.
//!
//! Client-side waiters for a remote GRANT. Lives on a per-zone list,
//! independent of any host's own vhold table. Each entry's condition is a
//! [`tokio::sync::Notify`] — the async analogue of a condvar here;
//! `grant`/`cancel_all_for` broadcast via `notify_waiters()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::nlm::sysid::Sysid;

/// Outcome of [`SleepingLockTable::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ok,
    Timeout,
    /// Woken by cancellation or task cancellation, matching spec's
    /// "wake by signal" for this component's condvar.
    Intr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlockState {
    Blocked,
    Granted,
    Cancelled,
}

/// Opaque handle to a registered sleeping lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlockId(u64);

struct SleepingLockInner {
    id: SlockId,
    sysid: Sysid,
    offset: u64,
    len: u64,
    exclusive: bool,
    fh_bytes: Vec<u8>,
    state: Mutex<SlockState>,
    condition: Notify,
}

/// Per-zone list of client-side waiters (spec §3 "Sleeping lock", §4.D).
#[derive(Default)]
pub struct SleepingLockTable {
    entries: Mutex<Vec<Arc<SleepingLockInner>>>,
    next_id: AtomicU64,
}

impl SleepingLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new BLOCKED entry before issuing the blocking remote
    /// lock call.
    pub fn register(&self, sysid: Sysid, offset: u64, len: u64, exclusive: bool, fh_bytes: Vec<u8>) -> SlockId {
        let id = SlockId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(SleepingLockInner {
            id,
            sysid,
            offset,
            len,
            exclusive,
            fh_bytes,
            state: Mutex::new(SlockState::Blocked),
            condition: Notify::new(),
        });
        self.entries.lock().unwrap().push(entry);
        id
    }

    fn find(&self, id: SlockId) -> Option<Arc<SleepingLockInner>> {
        self.entries.lock().unwrap().iter().find(|e| e.id == id).cloned()
    }

    /// Wait for `id` to leave BLOCKED, up to `timeout`.
    pub async fn wait(&self, id: SlockId, timeout: Duration) -> WaitOutcome {
        let entry = match self.find(id) {
            Some(entry) => entry,
            None => return WaitOutcome::Intr,
        };

        loop {
            // Register interest before checking state: `Notify::notified()`
            // records the waiter at call time, so a `notify_waiters()` that
            // lands between the check and the await is not missed.
            let notified = entry.condition.notified();
            {
                let state = *entry.state.lock().unwrap();
                match state {
                    SlockState::Granted => return WaitOutcome::Ok,
                    SlockState::Cancelled => return WaitOutcome::Intr,
                    SlockState::Blocked => {}
                }
            }
            match tokio::time::timeout(timeout, notified).await {
                Ok(()) => continue,
                Err(_) => {
                    // Timed out; re-check in case GRANTED raced in just
                    // before the timer fired.
                    let state = *entry.state.lock().unwrap();
                    return match state {
                        SlockState::Granted => WaitOutcome::Ok,
                        SlockState::Cancelled => WaitOutcome::Intr,
                        SlockState::Blocked => WaitOutcome::Timeout,
                    };
                }
            }
        }
    }

    /// `grant(host, lock_desc)`: find the BLOCKED entry for `sysid` whose
    /// extent and file-handle bytes match; transition to GRANTED.
    pub fn grant(&self, sysid: Sysid, offset: u64, len: u64, fh_bytes: &[u8]) -> bool {
        let entries = self.entries.lock().unwrap();
        for entry in entries.iter() {
            if entry.sysid != sysid || entry.offset != offset || entry.len != len {
                continue;
            }
            if entry.fh_bytes != fh_bytes {
                continue;
            }
            let mut state = entry.state.lock().unwrap();
            if *state == SlockState::Blocked {
                *state = SlockState::Granted;
                drop(state);
                entry.condition.notify_waiters();
                return true;
            }
        }
        false
    }

    /// Cancel the single BLOCKED entry matching `sysid` and extent/handle,
    /// used by a targeted `CANCEL` request (as opposed to
    /// [`Self::cancel_all_for`], used on crash notification).
    pub fn cancel_match(&self, sysid: Sysid, offset: u64, len: u64, fh_bytes: &[u8]) -> bool {
        let entries = self.entries.lock().unwrap();
        for entry in entries.iter() {
            if entry.sysid != sysid || entry.offset != offset || entry.len != len {
                continue;
            }
            if entry.fh_bytes != fh_bytes {
                continue;
            }
            let mut state = entry.state.lock().unwrap();
            if *state == SlockState::Blocked {
                *state = SlockState::Cancelled;
                drop(state);
                entry.condition.notify_waiters();
                return true;
            }
        }
        false
    }

    /// Transition every BLOCKED entry owned by `sysid` to CANCELLED.
    pub fn cancel_all_for(&self, sysid: Sysid) {
        let entries = self.entries.lock().unwrap();
        for entry in entries.iter().filter(|e| e.sysid == sysid) {
            let mut state = entry.state.lock().unwrap();
            if *state == SlockState::Blocked {
                *state = SlockState::Cancelled;
                drop(state);
                entry.condition.notify_waiters();
            }
        }
    }

    /// Remove `id` from the zone list. Only the waiter should call this,
    /// after `wait` returns a terminal outcome.
    pub fn unregister(&self, id: SlockId) {
        self.entries.lock().unwrap().retain(|e| e.id != id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
