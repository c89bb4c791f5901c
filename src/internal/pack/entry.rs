//! In-memory record for each object known to the current pack session.
//! Entries are created on first store or first lookup and dropped when the
//! pack is finalized.

use serde::{Deserialize, Serialize};

use crate::hash::GitOid;

/// Offset sentinel for objects that live in an already-finished pack rather
/// than the in-progress one. Real entry offsets are always past the 12-byte
/// pack header, so `1` can never collide.
pub const OLDER_PACK_OFFSET: u64 = 1;

/// Per-session bookkeeping for one stored or looked-up object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedEntry {
    pub oid: GitOid,
    /// Byte offset in the in-progress pack, or [`OLDER_PACK_OFFSET`].
    pub offset: u64,
    /// For in-progress entries, the current pack generation; for older-pack
    /// entries, the index of the finished pack holding the object.
    pub pack_id: u32,
    /// Delta chain depth of the stored representation.
    pub depth: u32,
}

impl PackedEntry {
    /// Whether this entry's bytes live in the in-progress pack and can serve
    /// as a delta base there.
    pub fn in_current_pack(&self, current_pack_id: u32) -> bool {
        self.pack_id == current_pack_id && self.offset > OLDER_PACK_OFFSET
    }
}
