//! Persistent key→oid mappings stored as fanned-out Git trees.
//!
//! A notes tree maps a fixed-size 20-byte key (a Mercurial node for
//! `hg2git` and `files-meta`, a Git oid for `git2hg`) to a Git oid. On disk
//! the map is a tree of trees keyed by the hex form of the key, fanned out
//! on the two leading hex digits to keep directories small. `hg2git` leaves
//! use gitlink mode so Git accepts values of any object type; `git2hg` and
//! `files-meta` leaves use regular-file mode and point at metadata blobs.
//!
//! Trees are lazy: a reseed only records the persisted root, and the whole
//! fanout is parsed on first access. A dirty bit tracks whether a write-out
//! is needed.

use std::collections::BTreeMap;

use bstr::BString;
use tracing::debug;

use crate::errors::BridgeError;
use crate::hash::GitOid;
use crate::internal::object::tree::{Tree, TreeItem, TreeItemMode};
use crate::internal::object::types::ObjectType;
use crate::odb::Odb;

/// One fanned-out notes mapping.
pub struct NotesTree {
    value_mode: TreeItemMode,
    base: Option<GitOid>,
    map: BTreeMap<[u8; 20], GitOid>,
    loaded: bool,
    dirty: bool,
}

impl NotesTree {
    /// An empty mapping whose leaf entries use `value_mode`.
    pub fn new(value_mode: TreeItemMode) -> NotesTree {
        NotesTree {
            value_mode,
            base: None,
            map: BTreeMap::new(),
            loaded: true,
            dirty: false,
        }
    }

    /// Drop in-memory state and point at a persisted root tree (or nothing).
    /// The fanout is parsed again on first access.
    pub fn reseed(&mut self, root: Option<GitOid>) {
        self.base = root;
        self.map.clear();
        self.loaded = root.is_none();
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn ensure_loaded(&mut self, odb: &mut Odb) -> Result<(), BridgeError> {
        if self.loaded {
            return Ok(());
        }
        let root = self.base.expect("unloaded notes tree always has a base");
        let tree = odb.read_tree(&root)?;
        let mut prefix = Vec::new();
        self.load_level(odb, &tree, &mut prefix)?;
        self.loaded = true;
        debug!(entries = self.map.len(), "notes tree loaded");
        Ok(())
    }

    fn load_level(
        &mut self,
        odb: &mut Odb,
        tree: &Tree,
        prefix: &mut Vec<u8>,
    ) -> Result<(), BridgeError> {
        for item in &tree.tree_items {
            if item.mode.is_tree() {
                let sub = odb.read_tree(&item.oid)?;
                let kept = prefix.len();
                prefix.extend_from_slice(&item.name);
                self.load_level(odb, &sub, prefix)?;
                prefix.truncate(kept);
            } else {
                let mut hex = prefix.clone();
                hex.extend_from_slice(&item.name);
                if hex.len() != 40 {
                    return Err(BridgeError::InvalidObject(format!(
                        "notes fanout path of {} hex digits",
                        hex.len()
                    )));
                }
                let mut key = [0u8; 20];
                hex::decode_to_slice(&hex, &mut key).map_err(|_| {
                    BridgeError::InvalidSha(String::from_utf8_lossy(&hex).into_owned())
                })?;
                self.map.insert(key, item.oid);
            }
        }
        Ok(())
    }

    pub fn get(&mut self, odb: &mut Odb, key: &[u8; 20]) -> Result<Option<GitOid>, BridgeError> {
        self.ensure_loaded(odb)?;
        Ok(self.map.get(key).copied())
    }

    pub fn put(&mut self, odb: &mut Odb, key: [u8; 20], value: GitOid) -> Result<(), BridgeError> {
        self.ensure_loaded(odb)?;
        self.map.insert(key, value);
        self.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, odb: &mut Odb, key: &[u8; 20]) -> Result<(), BridgeError> {
        self.ensure_loaded(odb)?;
        if self.map.remove(key).is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    /// Write the fanout out as tree objects and return the root oid.
    pub fn flush(&mut self, odb: &mut Odb) -> Result<GitOid, BridgeError> {
        self.ensure_loaded(odb)?;
        let mut buckets: BTreeMap<[u8; 2], Vec<TreeItem>> = BTreeMap::new();
        for (key, value) in &self.map {
            let hex = hex::encode(key);
            let hex = hex.as_bytes();
            let mut bucket = [0u8; 2];
            bucket.copy_from_slice(&hex[..2]);
            buckets.entry(bucket).or_default().push(TreeItem::new(
                self.value_mode,
                *value,
                BString::from(&hex[2..]),
            ));
        }
        let mut root_items = Vec::with_capacity(buckets.len());
        for (bucket, items) in buckets {
            let sub = Tree::from_tree_items(items);
            odb.write_object(ObjectType::Tree, &sub.to_data())?;
            root_items.push(TreeItem::new(
                TreeItemMode::Tree,
                sub.id,
                BString::from(&bucket[..]),
            ));
        }
        let root = Tree::from_tree_items(root_items);
        let root_oid = odb.write_object(ObjectType::Tree, &root.to_data())?;
        self.base = Some(root_oid);
        self.dirty = false;
        debug!(entries = self.map.len(), root = %root_oid, "notes tree flushed");
        Ok(root_oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_odb() -> (tempfile::TempDir, Odb) {
        let dir = tempfile::tempdir().unwrap();
        let odb = Odb::open(dir.path(), 1 << 16, 50).unwrap();
        (dir, odb)
    }

    fn key(byte: u8) -> [u8; 20] {
        [byte; 20]
    }

    fn oid(byte: u8) -> GitOid {
        GitOid::from_raw_bytes(&[byte; 20]).unwrap()
    }

    /// put/get/remove with dirty tracking.
    #[test]
    fn test_basic_map_operations() {
        let (_dir, mut odb) = temp_odb();
        let mut notes = NotesTree::new(TreeItemMode::Commit);
        assert!(!notes.is_dirty());
        assert_eq!(notes.get(&mut odb, &key(1)).unwrap(), None);
        notes.put(&mut odb, key(1), oid(9)).unwrap();
        assert!(notes.is_dirty());
        assert_eq!(notes.get(&mut odb, &key(1)).unwrap(), Some(oid(9)));
        notes.remove(&mut odb, &key(1)).unwrap();
        assert_eq!(notes.get(&mut odb, &key(1)).unwrap(), None);
    }

    /// Flush writes a fanout tree that reloads to the same mapping.
    #[test]
    fn test_flush_and_reload() {
        let (_dir, mut odb) = temp_odb();
        let mut notes = NotesTree::new(TreeItemMode::Commit);
        for byte in [0u8, 1, 0x42, 0xff] {
            notes.put(&mut odb, key(byte), oid(byte ^ 0xaa)).unwrap();
        }
        let root = notes.flush(&mut odb).unwrap();
        assert!(!notes.is_dirty());

        let mut reloaded = NotesTree::new(TreeItemMode::Commit);
        reloaded.reseed(Some(root));
        for byte in [0u8, 1, 0x42, 0xff] {
            assert_eq!(
                reloaded.get(&mut odb, &key(byte)).unwrap(),
                Some(oid(byte ^ 0xaa))
            );
        }
        assert_eq!(reloaded.get(&mut odb, &key(7)).unwrap(), None);
    }

    /// Flushing twice without changes yields the same root.
    #[test]
    fn test_flush_deterministic() {
        let (_dir, mut odb) = temp_odb();
        let mut notes = NotesTree::new(TreeItemMode::Blob);
        notes.put(&mut odb, key(3), oid(4)).unwrap();
        let first = notes.flush(&mut odb).unwrap();
        let second = notes.flush(&mut odb).unwrap();
        assert_eq!(first, second);
    }

    /// Keys sharing a fanout bucket land in one subtree.
    #[test]
    fn test_shared_bucket() {
        let (_dir, mut odb) = temp_odb();
        let mut notes = NotesTree::new(TreeItemMode::Commit);
        let mut a = key(0x11);
        let mut b = key(0x11);
        a[19] = 0;
        b[19] = 1;
        notes.put(&mut odb, a, oid(1)).unwrap();
        notes.put(&mut odb, b, oid(2)).unwrap();
        let root = notes.flush(&mut odb).unwrap();
        let tree = odb.read_tree(&root).unwrap();
        assert_eq!(tree.tree_items.len(), 1);
        assert_eq!(tree.tree_items[0].name, "11");
    }

    /// An empty mapping flushes to the empty tree.
    #[test]
    fn test_empty_flush() {
        let (_dir, mut odb) = temp_odb();
        let mut notes = NotesTree::new(TreeItemMode::Blob);
        let root = notes.flush(&mut odb).unwrap();
        assert_eq!(root.to_string(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }
}
