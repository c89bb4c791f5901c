//! Object-database driver: the thin layer every store component writes
//! through. It owns the in-progress [`PackWriter`], the per-session entry
//! map, and readers for the finished packs found in the store directory.
//! Lookups prefer the in-progress pack, whose on-disk index does not exist
//! yet, over the finished ones.

use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::delta::decode::delta_decode;
use crate::errors::BridgeError;
use crate::hash::{EMPTY_BLOB_OID, EMPTY_TREE_OID, GitOid};
use crate::internal::object::commit::Commit;
use crate::internal::object::tree::Tree;
use crate::internal::object::types::ObjectType;
use crate::internal::pack::entry::{OLDER_PACK_OFFSET, PackedEntry};
use crate::internal::pack::reader::{BaseLocation, PackReader, decode_entry};
use crate::internal::pack::window::WindowReader;
use crate::internal::pack::writer::{DeltaRef, PackWriter};

/// The object database for one import session.
pub struct Odb {
    pack_dir: PathBuf,
    writer: Option<PackWriter>,
    entries: HashMap<GitOid, PackedEntry>,
    older: Vec<PackReader>,
    pack_id: u32,
}

impl Odb {
    /// Open the database under `store_dir`: scan finished packs and create
    /// the in-progress pack for this session.
    pub fn open(
        store_dir: &Path,
        window_size: usize,
        max_delta_depth: u32,
    ) -> Result<Odb, BridgeError> {
        let pack_dir = store_dir.join("pack");
        fs::create_dir_all(&pack_dir)?;

        let mut idx_paths = Vec::new();
        for dir_entry in fs::read_dir(&pack_dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|ext| ext == "idx") {
                idx_paths.push(path);
            }
        }
        idx_paths.sort();
        let mut older = Vec::new();
        for idx_path in idx_paths {
            let pack_path = idx_path.with_extension("pack");
            if pack_path.exists() {
                older.push(PackReader::open(&pack_path, &idx_path)?);
            }
        }
        debug!(finished_packs = older.len(), "object database opened");

        let pack_id = older.len() as u32;
        let writer = PackWriter::create(&pack_dir, window_size, max_delta_depth)?;
        Ok(Odb {
            pack_dir,
            writer: Some(writer),
            entries: HashMap::new(),
            older,
            pack_id,
        })
    }

    pub fn pack_dir(&self) -> &Path {
        &self.pack_dir
    }

    pub fn current_pack_id(&self) -> u32 {
        self.pack_id
    }

    /// Objects written to the in-progress pack so far.
    pub fn object_count(&self) -> u32 {
        self.writer.as_ref().map_or(0, PackWriter::object_count)
    }

    fn writer(&mut self) -> Result<&mut PackWriter, BridgeError> {
        self.writer
            .as_mut()
            .ok_or_else(|| BridgeError::ProtocolViolation("pack already finalized".into()))
    }

    /// Store an object, optionally deltified against `reference` (a prior
    /// entry of the same pack). Storing an object that already exists in
    /// this session or a finished pack writes nothing and returns its oid.
    pub fn store_object(
        &mut self,
        object_type: ObjectType,
        data: &[u8],
        reference: Option<DeltaRef>,
    ) -> Result<GitOid, BridgeError> {
        let oid = GitOid::from_type_and_data(object_type, data);
        if self.entries.contains_key(&oid) {
            return Ok(oid);
        }
        if let Some(pack_index) = self.older.iter().position(|pack| pack.contains(&oid)) {
            self.entries.insert(
                oid,
                PackedEntry {
                    oid,
                    offset: OLDER_PACK_OFFSET,
                    pack_id: pack_index as u32,
                    depth: 0,
                },
            );
            return Ok(oid);
        }
        let pack_id = self.pack_id;
        let stored = self.writer()?.write_object(object_type, data, reference)?;
        self.entries.insert(
            oid,
            PackedEntry {
                oid,
                offset: stored.offset,
                pack_id,
                depth: stored.depth,
            },
        );
        Ok(oid)
    }

    /// Store an object without deltification.
    pub fn write_object(
        &mut self,
        object_type: ObjectType,
        data: &[u8],
    ) -> Result<GitOid, BridgeError> {
        self.store_object(object_type, data, None)
    }

    /// Find the session entry for `oid`, registering finished-pack hits
    /// under the [`OLDER_PACK_OFFSET`] sentinel on first sight.
    pub fn find_object(&mut self, oid: &GitOid) -> Option<PackedEntry> {
        if let Some(entry) = self.entries.get(oid) {
            return Some(*entry);
        }
        let pack_index = self.older.iter().position(|pack| pack.contains(oid))?;
        let entry = PackedEntry {
            oid: *oid,
            offset: OLDER_PACK_OFFSET,
            pack_id: pack_index as u32,
            depth: 0,
        };
        self.entries.insert(*oid, entry);
        Some(entry)
    }

    /// Whether `oid` can serve as a delta base in the in-progress pack.
    pub fn usable_as_delta_base(&self, entry: &PackedEntry) -> bool {
        entry.in_current_pack(self.pack_id)
    }

    /// Read an object back, from the in-progress pack (through the tail
    /// window) or a finished one.
    pub fn unpack_entry(&mut self, oid: &GitOid) -> Result<(ObjectType, Vec<u8>), BridgeError> {
        let entry = self
            .find_object(oid)
            .ok_or_else(|| BridgeError::ObjectNotFound(oid.to_string()))?;
        if entry.offset == OLDER_PACK_OFFSET {
            self.older[entry.pack_id as usize].read_object(oid)
        } else {
            self.unpack_at(entry.offset)
        }
    }

    fn unpack_at(&mut self, offset: u64) -> Result<(ObjectType, Vec<u8>), BridgeError> {
        let window = self.writer()?.window();
        let mut reader = WindowReader::new(window, offset);
        let (object_type, payload, base) = decode_entry(&mut reader, offset)?;
        match base {
            None => Ok((object_type, payload)),
            Some(BaseLocation::Offset(base_offset)) => {
                let (base_type, base_data) = self.unpack_at(base_offset)?;
                let data = delta_decode(&mut Cursor::new(&payload), &base_data)?;
                Ok((base_type, data))
            }
            Some(BaseLocation::Id(base_oid)) => {
                let (base_type, base_data) = self.unpack_entry(&base_oid)?;
                let data = delta_decode(&mut Cursor::new(&payload), &base_data)?;
                Ok((base_type, data))
            }
        }
    }

    /// Read an object expected to be of `expected` type.
    pub fn read_typed(
        &mut self,
        oid: &GitOid,
        expected: ObjectType,
    ) -> Result<Vec<u8>, BridgeError> {
        let (object_type, data) = self.unpack_entry(oid)?;
        if object_type != expected {
            return Err(BridgeError::ObjectTypeMismatch(format!(
                "{oid} is a {object_type}, expected {expected}"
            )));
        }
        Ok(data)
    }

    pub fn read_blob(&mut self, oid: &GitOid) -> Result<Vec<u8>, BridgeError> {
        self.read_typed(oid, ObjectType::Blob)
    }

    pub fn read_commit(&mut self, oid: &GitOid) -> Result<Commit, BridgeError> {
        let data = self.read_typed(oid, ObjectType::Commit)?;
        Commit::from_bytes(&data, *oid)
    }

    /// Read a tree. The canonical empty tree is served without a store
    /// lookup; it exists implicitly.
    pub fn read_tree(&mut self, oid: &GitOid) -> Result<Tree, BridgeError> {
        if *oid == EMPTY_TREE_OID {
            return Ok(Tree {
                id: EMPTY_TREE_OID,
                tree_items: Vec::new(),
            });
        }
        let data = self.read_typed(oid, ObjectType::Tree)?;
        Tree::from_bytes(&data, *oid)
    }

    /// The real type of a stored object.
    pub fn object_type(&mut self, oid: &GitOid) -> Result<ObjectType, BridgeError> {
        Ok(self.unpack_entry(oid)?.0)
    }

    /// Store the empty blob if this session has not seen it yet.
    pub fn ensure_empty_blob(&mut self) -> Result<GitOid, BridgeError> {
        if self.entries.contains_key(&EMPTY_BLOB_OID) {
            return Ok(EMPTY_BLOB_OID);
        }
        self.store_object(ObjectType::Blob, b"", None)
    }

    /// Store the empty tree if this session has not seen it yet.
    pub fn ensure_empty_tree(&mut self) -> Result<GitOid, BridgeError> {
        if self.entries.contains_key(&EMPTY_TREE_OID) {
            return Ok(EMPTY_TREE_OID);
        }
        self.store_object(ObjectType::Tree, b"", None)
    }

    /// Finalize the in-progress pack, dropping all session entries. Returns
    /// the finished pack/idx paths, or `None` when nothing was stored.
    pub fn finalize(&mut self) -> Result<Option<(PathBuf, PathBuf)>, BridgeError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| BridgeError::ProtocolViolation("pack already finalized".into()))?;
        self.entries.clear();
        writer.finalize()
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

    /// Stored objects are immediately readable back through the window.
    #[test]
    fn test_store_then_unpack() {
        let (_dir, mut odb) = temp_odb();
        let oid = odb.write_object(ObjectType::Blob, b"hello\n").unwrap();
        let (ty, data) = odb.unpack_entry(&oid).unwrap();
        assert_eq!(ty, ObjectType::Blob);
        assert_eq!(data, b"hello\n");
    }

    /// Storing the same bytes twice writes one pack entry.
    #[test]
    fn test_store_dedup() {
        let (_dir, mut odb) = temp_odb();
        let a = odb.write_object(ObjectType::Blob, b"same").unwrap();
        let b = odb.write_object(ObjectType::Blob, b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(odb.object_count(), 1);
    }

    /// The empty blob is written at most once per session.
    #[test]
    fn test_empty_blob_once() {
        let (_dir, mut odb) = temp_odb();
        let first = odb.ensure_empty_blob().unwrap();
        let second = odb.ensure_empty_blob().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
        assert_eq!(odb.object_count(), 1);
    }

    /// The empty tree reads back without ever being stored.
    #[test]
    fn test_implicit_empty_tree() {
        let (_dir, mut odb) = temp_odb();
        let tree = odb.read_tree(&EMPTY_TREE_OID).unwrap();
        assert!(tree.tree_items.is_empty());
    }

    /// Objects from a finalized pack are found in the next session, with
    /// the older-pack offset sentinel on their entries.
    #[test]
    fn test_older_pack_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let oid = {
            let mut odb = Odb::open(dir.path(), 1 << 16, 50).unwrap();
            let oid = odb.write_object(ObjectType::Blob, b"persisted").unwrap();
            odb.finalize().unwrap().unwrap();
            oid
        };
        let mut odb = Odb::open(dir.path(), 1 << 16, 50).unwrap();
        let entry = odb.find_object(&oid).unwrap();
        assert_eq!(entry.offset, OLDER_PACK_OFFSET);
        assert!(!odb.usable_as_delta_base(&entry));
        let (ty, data) = odb.unpack_entry(&oid).unwrap();
        assert_eq!(ty, ObjectType::Blob);
        assert_eq!(data, b"persisted");
        // dedup against the finished pack: nothing new is written
        odb.write_object(ObjectType::Blob, b"persisted").unwrap();
        assert_eq!(odb.object_count(), 0);
    }

    /// Type-checked reads reject the wrong kind.
    #[test]
    fn test_typed_read_mismatch() {
        let (_dir, mut odb) = temp_odb();
        let oid = odb.write_object(ObjectType::Blob, b"x").unwrap();
        assert!(matches!(
            odb.read_commit(&oid),
            Err(BridgeError::ObjectTypeMismatch(_))
        ));
    }
}
