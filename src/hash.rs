//! Identifier types for the two 20-byte hash spaces the bridge deals with:
//! Git object ids and Mercurial node ids. Both are SHA-1 values but they are
//! never interchangeable; every conversion between them is an explicit
//! lookup through the `hg2git` notes tree.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::errors::BridgeError;
use crate::internal::object::types::ObjectType;

/// A Git object id: the SHA-1 of `"<type> <len>\0<data>"`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub struct GitOid([u8; 20]);

/// A Mercurial node id: the SHA-1 of the sorted parent nodes followed by the
/// full revision data (metadata prefix included for file revisions).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub struct HgOid([u8; 20]);

/// Git oid of the empty blob.
pub const EMPTY_BLOB_OID: GitOid = GitOid(*b"\xe6\x9d\xe2\x9b\xb2\xd1\xd6\x43\x4b\x8b\x29\xae\x77\x5a\xd8\xc2\xe4\x8c\x53\x91");

/// Git oid of the empty tree.
pub const EMPTY_TREE_OID: GitOid = GitOid(*b"\x4b\x82\x5d\xc6\x42\xcb\x6e\xb9\xa0\x60\xe5\x4b\xf8\xd6\x92\x88\xfb\xee\x49\x04");

/// Mercurial node of the empty file revision (two null parents, no data).
/// Revisions carrying this node are never stored; see the file store.
pub const EMPTY_HG_FILE: HgOid = HgOid(*b"\xb8\x0d\xe5\xd1\x38\x75\x85\x41\xc5\xf0\x52\x65\xad\x14\x4a\xb9\xfa\x86\xd1\xdb");

fn decode_hex_20(hex: &[u8]) -> Result<[u8; 20], BridgeError> {
    if hex.len() != 40 {
        return Err(BridgeError::InvalidSha(
            String::from_utf8_lossy(hex).into_owned(),
        ));
    }
    let mut raw = [0u8; 20];
    hex::decode_to_slice(hex, &mut raw)
        .map_err(|_| BridgeError::InvalidSha(String::from_utf8_lossy(hex).into_owned()))?;
    Ok(raw)
}

impl GitOid {
    /// The all-zero oid, used as an absent-value marker.
    pub const NULL: GitOid = GitOid([0u8; 20]);

    /// Compute the object id of `data` stored as `object_type`.
    pub fn from_type_and_data(object_type: ObjectType, data: &[u8]) -> GitOid {
        let mut hasher = Sha1::new();
        hasher.update(object_type.to_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update(b"\x00");
        hasher.update(data);
        GitOid(hasher.finalize().into())
    }

    /// Construct from exactly 20 raw bytes.
    pub fn from_raw_bytes(bytes: &[u8]) -> Result<GitOid, BridgeError> {
        let raw: [u8; 20] = bytes
            .try_into()
            .map_err(|_| BridgeError::InvalidSha(hex::encode(bytes)))?;
        Ok(GitOid(raw))
    }

    /// Parse a 40-hex byte string.
    pub fn from_hex(hex: &[u8]) -> Result<GitOid, BridgeError> {
        decode_hex_20(hex).map(GitOid)
    }

    /// Read 20 raw bytes from a stream.
    pub fn from_stream(data: &mut impl io::Read) -> io::Result<GitOid> {
        let mut raw = [0u8; 20];
        data.read_exact(&mut raw)?;
        Ok(GitOid(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl HgOid {
    /// The all-zero node, Mercurial's marker for an absent parent.
    pub const NULL: HgOid = HgOid([0u8; 20]);

    /// Compute the node of a revision from its parents and full data, using
    /// Mercurial's convention: hash the two parent nodes in ascending order,
    /// then the revision data.
    pub fn from_revision(parent1: HgOid, parent2: HgOid, data: &[u8]) -> HgOid {
        let (lo, hi) = if parent1.0 <= parent2.0 {
            (parent1, parent2)
        } else {
            (parent2, parent1)
        };
        let mut hasher = Sha1::new();
        hasher.update(lo.0);
        hasher.update(hi.0);
        hasher.update(data);
        HgOid(hasher.finalize().into())
    }

    /// Construct from exactly 20 raw bytes.
    pub fn from_raw_bytes(bytes: &[u8]) -> Result<HgOid, BridgeError> {
        let raw: [u8; 20] = bytes
            .try_into()
            .map_err(|_| BridgeError::InvalidSha(hex::encode(bytes)))?;
        Ok(HgOid(raw))
    }

    /// Parse a 40-hex byte string.
    pub fn from_hex(hex: &[u8]) -> Result<HgOid, BridgeError> {
        decode_hex_20(hex).map(HgOid)
    }

    /// Read 20 raw bytes from a stream.
    pub fn from_stream(data: &mut impl io::Read) -> io::Result<HgOid> {
        let mut raw = [0u8; 20];
        data.read_exact(&mut raw)?;
        Ok(HgOid(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl Display for GitOid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Display for HgOid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for GitOid {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GitOid::from_hex(s.as_bytes())
    }
}

impl FromStr for HgOid {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HgOid::from_hex(s.as_bytes())
    }
}

impl AsRef<[u8]> for GitOid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for HgOid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// Hashing an empty payload as a blob should yield the canonical empty
    /// blob oid.
    #[test]
    fn test_empty_blob_oid() {
        let oid = GitOid::from_type_and_data(ObjectType::Blob, b"");
        assert_eq!(oid, EMPTY_BLOB_OID);
    }

    /// Hashing an empty payload as a tree should yield the canonical empty
    /// tree oid.
    #[test]
    fn test_empty_tree_oid() {
        let oid = GitOid::from_type_and_data(ObjectType::Tree, b"");
        assert_eq!(oid, EMPTY_TREE_OID);
    }

    /// Known blob vector: `blob 6\0hello\n`.
    #[test]
    fn test_blob_oid_hello() {
        let oid = GitOid::from_type_and_data(ObjectType::Blob, b"hello\n");
        assert_eq!(oid.to_string(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    /// The empty file revision with two null parents hashes to the
    /// well-known Mercurial empty-file node.
    #[test]
    fn test_empty_hg_file_node() {
        let node = HgOid::from_revision(HgOid::NULL, HgOid::NULL, b"");
        assert_eq!(node, EMPTY_HG_FILE);
    }

    /// Parent order must not affect the node: parents are hashed sorted.
    #[test]
    fn test_hg_node_parent_order() {
        let p1 = HgOid::from_hex(b"ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        let p2 = HgOid::from_hex(b"4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
        assert_eq!(
            HgOid::from_revision(p1, p2, b"data"),
            HgOid::from_revision(p2, p1, b"data")
        );
    }

    /// Hex round-trip for both id spaces.
    #[test]
    fn test_hex_round_trip() {
        let hex = "8ab686eafeb1f44702738c8b0f24f2567c36da6d";
        assert_eq!(GitOid::from_str(hex).unwrap().to_string(), hex);
        assert_eq!(HgOid::from_str(hex).unwrap().to_string(), hex);
    }

    /// Truncated or non-hex input is an invalid sha, not a panic.
    #[test]
    fn test_invalid_hex() {
        assert!(matches!(
            GitOid::from_hex(b"8ab686"),
            Err(BridgeError::InvalidSha(_))
        ));
        assert!(matches!(
            HgOid::from_hex(b"zz".repeat(20).as_slice()),
            Err(BridgeError::InvalidSha(_))
        ));
    }

    /// Reading from a stream consumes exactly 20 bytes.
    #[test]
    fn test_from_stream() {
        let raw = [0xabu8; 20];
        let mut cursor = std::io::Cursor::new(raw);
        let oid = GitOid::from_stream(&mut cursor).unwrap();
        assert_eq!(oid.as_bytes(), &raw);
    }
}
