//! Changeset commit storage and mapping-conflict resolution.
//!
//! The `git2hg` mapping must stay injective: two distinct Mercurial
//! changesets may produce byte-identical Git commits (same tree, parents,
//! author and message), which would collapse them onto one oid. When that
//! happens, a NUL byte is appended to the commit body and the commit is
//! re-hashed, repeating until the resulting oid is unused or already bound
//! to this changeset. The trailing NULs are invisible to ordinary Git
//! tooling, and the reverse conversion trims them the same way.

use bstr::ByteSlice;
use tracing::debug;

use crate::errors::BridgeError;
use crate::hash::{GitOid, HgOid};
use crate::internal::object::commit::Commit;
use crate::internal::object::types::ObjectType;
use crate::odb::Odb;
use crate::store::heads::HeadsSet;
use crate::store::notes::NotesTree;

/// Parse the leading `changeset <40-hex>` line of a `git2hg` metadata blob.
pub fn metadata_changeset(metadata: &[u8]) -> Result<HgOid, BridgeError> {
    let line = metadata.lines().next().unwrap_or(b"");
    let hex = line.strip_prefix(b"changeset ").ok_or_else(|| {
        BridgeError::InvalidObject("metadata blob without a changeset line".into())
    })?;
    HgOid::from_hex(hex)
}

/// Store a prepared changeset commit, resolving oid conflicts, and record
/// the mapping both ways. Returns the commit oid actually bound.
pub fn store_changeset(
    odb: &mut Odb,
    hg2git: &mut NotesTree,
    git2hg: &mut NotesTree,
    changeset_heads: &mut HeadsSet,
    heads_tip: Option<GitOid>,
    node: HgOid,
    commit_data: &[u8],
) -> Result<GitOid, BridgeError> {
    // Reject garbage early; the commit parser only needs the tree header.
    Commit::from_bytes(commit_data, GitOid::NULL)?;

    let mut data = commit_data.to_vec();
    let mut appended = 0usize;
    loop {
        let oid = GitOid::from_type_and_data(ObjectType::Commit, &data);
        match git2hg.get(odb, oid.as_bytes())? {
            Some(metadata_oid) => {
                let metadata = odb.read_blob(&metadata_oid)?;
                if metadata_changeset(&metadata)? == node {
                    // Already bound to this changeset; nothing to do.
                    return Ok(oid);
                }
                data.push(0);
                appended += 1;
            }
            None => {
                odb.write_object(ObjectType::Commit, &data)?;
                let metadata = format!("changeset {node}\n");
                let metadata_oid = odb.write_object(ObjectType::Blob, metadata.as_bytes())?;
                git2hg.put(odb, *oid.as_bytes(), metadata_oid)?;
                hg2git.put(odb, *node.as_bytes(), oid)?;
                changeset_heads.add(odb, heads_tip, oid)?;
                if appended > 0 {
                    debug!(node = %node, commit = %oid, nuls = appended, "changeset conflict resolved");
                }
                return Ok(oid);
            }
        }
    }
}
