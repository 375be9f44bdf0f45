//! Internal (non-protocol-visible) errors.
//!
//! Protocol-visible outcomes are [`crate::nlm::Response`] variants, returned
//! directly from handlers. This module is for failures that never reach the
//! wire: misconfiguration, shutdown races, and the like.

use std::fmt;

/// Errors surfaced by the core engine itself, as opposed to a protocol
/// [`crate::nlm::Response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The sysid pool in [`crate::nlm::sysid::SysidAllocator`] is exhausted.
    NoSysid,
    /// A peer address used an address family outside `AF_INET`/`AF_INET6`.
    UnknownNetid,
    /// The zone is in [`crate::nlm::zone::RunStatus::Stopping`] or
    /// [`crate::nlm::zone::RunStatus::Down`] and refused a create-on-miss
    /// lookup.
    ShuttingDown,
    /// The status monitor could not be reached within the configured
    /// retry budget at startup.
    SmUnreachable,
    /// Configuration file failed to parse.
    InvalidConfig,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NoSysid => write!(f, "sysid pool exhausted"),
            CoreError::UnknownNetid => write!(f, "peer address family is not AF_INET/AF_INET6"),
            CoreError::ShuttingDown => write!(f, "zone is shutting down"),
            CoreError::SmUnreachable => write!(f, "status monitor unreachable"),
            CoreError::InvalidConfig => write!(f, "configuration file failed to parse"),
        }
    }
}

impl std::error::Error for CoreError {}
