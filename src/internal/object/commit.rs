//! The Commit object links a tree to its parent commits. Commits emitted by
//! the import path are identity-bearing: their exact bytes (header order,
//! the synthetic ident with its fixed epoch, the body without a trailing
//! newline) feed the object hash, and the hash is what keeps the Git and
//! Mercurial histories convertible in both directions. For that reason the
//! author/committer lines and the body are kept as raw bytes rather than a
//! structured signature.

use std::fmt::Display;

use bstr::{BString, ByteSlice};

use crate::errors::BridgeError;
use crate::hash::GitOid;
use crate::internal::object::types::ObjectType;

/// Ident used for synthetic commits (manifest commits, head tips, metadata).
/// The empty name yields a double space after `author`/`committer`; the
/// fixed `0 +0000` timestamp keeps emission deterministic. These bytes are
/// part of the stable hash contract and must not change.
pub const SYNTHETIC_IDENT: &[u8] = b" <cinnabar@git> 0 +0000";

/// A commit: object id, tree id, parent ids, the raw ident lines (without
/// the `author ` / `committer ` prefixes) and the raw body.
#[derive(Eq, Debug, Clone)]
pub struct Commit {
    pub id: GitOid,
    pub tree_id: GitOid,
    pub parents: Vec<GitOid>,
    pub author: BString,
    pub committer: BString,
    pub body: BString,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in &self.parents {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "author {}", self.author)?;
        writeln!(f, "committer {}", self.committer)?;
        writeln!(f, "{}", self.body)
    }
}

impl Commit {
    /// Build a commit and compute its id from the serialized bytes.
    pub fn new(
        tree_id: GitOid,
        parents: Vec<GitOid>,
        author: impl Into<BString>,
        committer: impl Into<BString>,
        body: impl Into<BString>,
    ) -> Commit {
        let mut commit = Commit {
            id: GitOid::NULL,
            tree_id,
            parents,
            author: author.into(),
            committer: committer.into(),
            body: body.into(),
        };
        commit.id = GitOid::from_type_and_data(ObjectType::Commit, &commit.to_data());
        commit
    }

    /// Build a synthetic commit with the fixed bridge ident on both lines.
    pub fn synthetic(tree_id: GitOid, parents: Vec<GitOid>, body: impl Into<BString>) -> Commit {
        Commit::new(tree_id, parents, SYNTHETIC_IDENT, SYNTHETIC_IDENT, body)
    }

    /// Serialize to commit wire bytes. The body is appended verbatim after
    /// the blank separator line, with no trailing newline added.
    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"tree ");
        data.extend_from_slice(self.tree_id.to_string().as_bytes());
        data.push(b'\n');
        for parent in &self.parents {
            data.extend_from_slice(b"parent ");
            data.extend_from_slice(parent.to_string().as_bytes());
            data.push(b'\n');
        }
        data.extend_from_slice(b"author ");
        data.extend_from_slice(&self.author);
        data.push(b'\n');
        data.extend_from_slice(b"committer ");
        data.extend_from_slice(&self.committer);
        data.push(b'\n');
        data.push(b'\n');
        data.extend_from_slice(&self.body);
        data
    }

    /// Parse commit wire bytes. Header lines other than `tree`, `parent`,
    /// `author` and `committer` (signatures, encodings) are skipped; the
    /// body is everything after the first blank line, kept verbatim.
    pub fn from_bytes(data: &[u8], id: GitOid) -> Result<Commit, BridgeError> {
        let mut tree_id = None;
        let mut parents = Vec::new();
        let mut author = BString::from("");
        let mut committer = BString::from("");
        let mut rest = data;
        loop {
            let line_end = rest
                .find_byte(b'\n')
                .ok_or_else(|| BridgeError::InvalidObject("commit without body".into()))?;
            let line = &rest[..line_end];
            rest = &rest[line_end + 1..];
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix(b"tree ") {
                tree_id = Some(GitOid::from_hex(value)?);
            } else if let Some(value) = line.strip_prefix(b"parent ") {
                parents.push(GitOid::from_hex(value)?);
            } else if let Some(value) = line.strip_prefix(b"author ") {
                author = BString::from(value);
            } else if let Some(value) = line.strip_prefix(b"committer ") {
                committer = BString::from(value);
            }
        }
        Ok(Commit {
            id,
            tree_id: tree_id
                .ok_or_else(|| BridgeError::InvalidObject("commit without tree".into()))?,
            parents,
            author,
            committer,
            body: BString::from(rest),
        })
    }
}
