//! Sysid allocator — component A.
//!
//! A dense bit-array over `[0, SYSID_MAX]`. Bit 0 is permanently set: sysid
//! `0` is reserved for local locks and must never be handed to a peer.
//! All operations here are expected to run under the registry writer lock
//! (see [`crate::nlm::registry`]); this module does no locking of its own.

use byteorder::{BigEndian, ByteOrder};

use crate::nlm::Netobj;

/// Smallest sysid that may be allocated to a peer.
pub const SYSID_MIN: u32 = 1;

/// Largest sysid that may be allocated to a peer.
pub const SYSID_MAX: u32 = 8192;

/// Sentinel returned by [`SysidAllocator::alloc`] when the pool is exhausted.
pub const NO_SYSID: u32 = 0;

const BITS_PER_WORD: u32 = u64::BITS;

/// A process-global sysid, identifying a remote peer to the local lock
/// manager. Never zero for a live peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sysid(pub u32);

impl Sysid {
    /// Sysid reserved for locks taken by this host itself.
    pub const LOCAL: Sysid = Sysid(NO_SYSID);

    /// Encode this sysid as the NLM owner cookie attached to a held lock,
    /// so [`crate::nlm::handlers`]'s GRANTED handler can recover the owning
    /// host purely from the bytes the peer echoes back.
    pub fn encode_owner(self) -> Netobj {
        let mut bytes = [0u8; crate::nlm::NETOBJ_SIZE];
        BigEndian::write_u32(&mut bytes[..4], self.0);
        Netobj(bytes)
    }

    /// Recover a sysid previously packed by [`Self::encode_owner`].
    pub fn decode_owner(owner: Netobj) -> Sysid {
        Sysid(BigEndian::read_u32(&owner.0[..4]))
    }
}

/// Dense bitmap allocator for [`Sysid`]s, `[SYSID_MIN, SYSID_MAX]`.
#[derive(Debug)]
pub struct SysidAllocator {
    words: Vec<u64>,
    cursor: u32,
}

impl SysidAllocator {
    /// Create an allocator with bit 0 (sysid 0, reserved for local locks)
    /// permanently set.
    pub fn new() -> Self {
        let word_count = (SYSID_MAX as usize / BITS_PER_WORD as usize) + 1;
        let mut words = vec![0u64; word_count];
        set_bit(&mut words, NO_SYSID);
        Self { words, cursor: SYSID_MIN }
    }

    /// Scan from the rotating cursor and claim the first clear bit in
    /// `[SYSID_MIN, SYSID_MAX]`. Returns [`NO_SYSID`] if the pool is full.
    pub fn alloc(&mut self) -> Sysid {
        let span = SYSID_MAX - SYSID_MIN + 1;
        for offset in 0..span {
            let candidate = SYSID_MIN + (self.cursor - SYSID_MIN + offset) % span;
            if !test_bit(&self.words, candidate) {
                set_bit(&mut self.words, candidate);
                self.cursor = if candidate == SYSID_MAX { SYSID_MIN } else { candidate + 1 };
                return Sysid(candidate);
            }
        }
        Sysid(NO_SYSID)
    }

    /// Release a previously allocated sysid. The bit must be set; freeing
    /// an unallocated sysid is a broken invariant (spec §7: fatal assertion).
    pub fn free(&mut self, sysid: Sysid) {
        assert!(sysid.0 != NO_SYSID, "attempted to free the reserved local sysid");
        assert!(test_bit(&self.words, sysid.0), "double free of sysid {}", sysid.0);
        clear_bit(&mut self.words, sysid.0);
    }
}

impl Default for SysidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn set_bit(words: &mut [u64], bit: u32) {
    let (word, offset) = locate(bit);
    words[word] |= 1 << offset;
}

fn clear_bit(words: &mut [u64], bit: u32) {
    let (word, offset) = locate(bit);
    words[word] &= !(1 << offset);
}

fn test_bit(words: &[u64], bit: u32) -> bool {
    let (word, offset) = locate(bit);
    words[word] & (1 << offset) != 0
}

fn locate(bit: u32) -> (usize, u32) {
    ((bit / BITS_PER_WORD) as usize, bit % BITS_PER_WORD)
}
