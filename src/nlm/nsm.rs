//! Wire constant shared with the status-monitor client.
//!
//! The core is only ever an SM *client* (spec §4.E: connect/mon/unmon/
//! unmon_all/stat/simu_crash, all outbound); the inbound NSM server
//! vocabulary has no counterpart here and lives in `sm_client.rs`'s
//! `SmTransport` trait instead.

/// Length of the opaque cookie NSM hands back unchanged on `notify`
/// (XDR `priv`), carried end to end as `[u8; PRIVATE_LEN]`.
pub const PRIVATE_LEN: usize = 16;
