//! The Tree object represents one directory level: a sorted list of entries,
//! each carrying a mode, a name and a 20-byte value.
//!
//! Besides the regular Git modes, trees here use the three gitlink-flavored
//! modes (`160644`, `160755`, `160000`) that let a tree entry point at an
//! arbitrary 20-byte value. Manifest mirror trees and the `hg2git` notes
//! tree rely on this to embed Mercurial node ids directly, while still
//! producing trees Git itself accepts.

use std::fmt::Display;

use bstr::{BStr, BString, ByteSlice};

use crate::errors::BridgeError;
use crate::hash::GitOid;
use crate::internal::object::types::ObjectType;

/// Tree entry mode. The wire form is the octal string without leading zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeItemMode {
    Tree,
    Blob,
    BlobExecutable,
    Link,
    /// Gitlink: a 20-byte value that need not name a real object.
    Commit,
    /// Gitlink with regular-file permission; points at a Mercurial file node.
    HgFile,
    /// Gitlink with executable permission; points at a Mercurial file node.
    HgFileExecutable,
}

impl TreeItemMode {
    pub fn to_bytes(self) -> &'static [u8] {
        match self {
            TreeItemMode::Tree => b"40000",
            TreeItemMode::Blob => b"100644",
            TreeItemMode::BlobExecutable => b"100755",
            TreeItemMode::Link => b"120000",
            TreeItemMode::Commit => b"160000",
            TreeItemMode::HgFile => b"160644",
            TreeItemMode::HgFileExecutable => b"160755",
        }
    }

    pub fn from_bytes(mode: &[u8]) -> Result<TreeItemMode, BridgeError> {
        match mode {
            b"40000" | b"040000" => Ok(TreeItemMode::Tree),
            b"100644" | b"644" => Ok(TreeItemMode::Blob),
            b"100755" | b"755" => Ok(TreeItemMode::BlobExecutable),
            b"120000" => Ok(TreeItemMode::Link),
            b"160000" => Ok(TreeItemMode::Commit),
            b"160644" => Ok(TreeItemMode::HgFile),
            b"160755" => Ok(TreeItemMode::HgFileExecutable),
            _ => Err(BridgeError::InvalidObject(format!(
                "unsupported tree entry mode `{}`",
                mode.as_bstr()
            ))),
        }
    }

    pub fn is_tree(self) -> bool {
        self == TreeItemMode::Tree
    }

    /// Six-digit form used by `ls` output.
    pub fn to_padded_string(self) -> String {
        format!("{:0>6}", String::from_utf8_lossy(self.to_bytes()))
    }
}

impl Display for TreeItemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.to_bytes()))
    }
}

/// One tree entry: mode, 20-byte value, and name (arbitrary bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeItem {
    pub mode: TreeItemMode,
    pub oid: GitOid,
    pub name: BString,
}

impl TreeItem {
    pub fn new(mode: TreeItemMode, oid: GitOid, name: impl Into<BString>) -> TreeItem {
        TreeItem {
            mode,
            oid,
            name: name.into(),
        }
    }

    /// Git sorts tree entries as if directory names had a trailing `/`.
    fn sort_key(&self) -> BString {
        let mut key = self.name.clone();
        if self.mode.is_tree() {
            key.push(b'/');
        }
        key
    }
}

/// A tree: an object id plus its ordered entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub id: GitOid,
    pub tree_items: Vec<TreeItem>,
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.id)?;
        for item in &self.tree_items {
            writeln!(f, "{} {} {}", item.mode, item.oid, item.name)?;
        }
        Ok(())
    }
}

impl Tree {
    /// Build a tree from entries, sorting them into Git order and computing
    /// the id. An empty entry list produces the canonical empty tree.
    pub fn from_tree_items(mut tree_items: Vec<TreeItem>) -> Tree {
        tree_items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let mut tree = Tree {
            id: GitOid::NULL,
            tree_items,
        };
        tree.id = GitOid::from_type_and_data(ObjectType::Tree, &tree.to_data());
        tree
    }

    /// Serialize to the tree wire format: `<mode> <name>\0<20 raw bytes>`
    /// per entry, no separators.
    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for item in &self.tree_items {
            data.extend_from_slice(item.mode.to_bytes());
            data.push(b' ');
            data.extend_from_slice(&item.name);
            data.push(b'\x00');
            data.extend_from_slice(item.oid.as_bytes());
        }
        data
    }

    /// Parse tree wire bytes.
    pub fn from_bytes(data: &[u8], id: GitOid) -> Result<Tree, BridgeError> {
        let mut tree_items = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = rest
                .find_byte(b' ')
                .ok_or_else(|| BridgeError::InvalidObject("tree entry without mode".into()))?;
            let mode = TreeItemMode::from_bytes(&rest[..space])?;
            rest = &rest[space + 1..];
            let nul = rest
                .find_byte(b'\x00')
                .ok_or_else(|| BridgeError::InvalidObject("tree entry without name".into()))?;
            let name = BString::from(&rest[..nul]);
            rest = &rest[nul + 1..];
            if rest.len() < 20 {
                return Err(BridgeError::InvalidObject("truncated tree entry".into()));
            }
            let oid = GitOid::from_raw_bytes(&rest[..20])?;
            rest = &rest[20..];
            tree_items.push(TreeItem { mode, oid, name });
        }
        Ok(Tree { id, tree_items })
    }

    /// Look up a direct child entry by name.
    pub fn entry(&self, name: &BStr) -> Option<&TreeItem> {
        self.tree_items.iter().find(|item| item.name == name)
    }
}
