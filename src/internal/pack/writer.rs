//! Streaming packfile writer. Objects are appended to a single growing pack
//! through the sliding [`PackWindow`]; at finalization the object count is
//! patched into the header, the SHA-1 trailer is appended, and a v2 `.idx`
//! is written next to the pack so the finished pair is immediately usable.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::delta::encode::DeltaDiff;
use crate::errors::BridgeError;
use crate::hash::GitOid;
use crate::internal::object::types::ObjectType;
use crate::internal::pack::window::PackWindow;
use crate::utils::write_offset_encoding;

const PENDING_PACK_NAME: &str = "pack-pending.pack";

/// Index record for one written object, kept until the `.idx` is emitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexEntry {
    pub oid: GitOid,
    pub crc32: u32,
    pub offset: u64,
}

/// A prior object in the same pack offered as a delta base:
/// its entry offset, its delta depth, and its full content.
pub struct DeltaRef<'a> {
    pub offset: u64,
    pub depth: u32,
    pub data: &'a [u8],
}

/// Placement of a freshly written object.
#[derive(Debug, Clone, Copy)]
pub struct StoredObject {
    pub oid: GitOid,
    pub offset: u64,
    pub depth: u32,
}

/// Writer for the single in-progress pack of a session.
pub struct PackWriter {
    window: PackWindow,
    dir: PathBuf,
    pending_path: PathBuf,
    object_count: u32,
    index_entries: Vec<IndexEntry>,
    max_delta_depth: u32,
}

impl PackWriter {
    /// Create the pending pack file in `dir` and write the pack header.
    /// The object count field is a placeholder patched at finalization.
    pub fn create(
        dir: &Path,
        window_size: usize,
        max_delta_depth: u32,
    ) -> Result<PackWriter, BridgeError> {
        fs::create_dir_all(dir)?;
        let pending_path = dir.join(PENDING_PACK_NAME);
        let mut window = PackWindow::create(&pending_path, window_size)?;
        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(b"PACK");
        header.extend_from_slice(&2u32.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        window.write(&header)?;
        Ok(PackWriter {
            window,
            dir: dir.to_path_buf(),
            pending_path,
            object_count: 0,
            index_entries: Vec::new(),
            max_delta_depth,
        })
    }

    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// The window, for read-back of entries written earlier in this pack.
    pub fn window(&mut self) -> &mut PackWindow {
        &mut self.window
    }

    /// Append one object. If `base` is given, still within the delta depth
    /// limit, and the delta actually saves bytes, the entry is written as an
    /// ofs-delta against it; the returned oid is the object's real id either
    /// way.
    pub fn write_object(
        &mut self,
        object_type: ObjectType,
        data: &[u8],
        base: Option<DeltaRef>,
    ) -> Result<StoredObject, BridgeError> {
        let oid = GitOid::from_type_and_data(object_type, data);
        let offset = self.window.size();
        let mut entry = Vec::new();
        let mut depth = 0;

        let payload = match base {
            Some(base_ref) if base_ref.depth + 1 <= self.max_delta_depth => {
                let delta = DeltaDiff::new(base_ref.data, data).encode();
                if delta.len() < data.len() {
                    depth = base_ref.depth + 1;
                    entry.extend(entry_header(ObjectType::OffsetDelta.to_u8(), delta.len()));
                    entry.extend(write_offset_encoding(offset - base_ref.offset));
                    delta
                } else {
                    entry.extend(entry_header(object_type.to_u8(), data.len()));
                    data.to_vec()
                }
            }
            _ => {
                entry.extend(entry_header(object_type.to_u8(), data.len()));
                data.to_vec()
            }
        };

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        entry.extend(encoder.finish()?);

        let crc32 = crc32fast::hash(&entry);
        self.window.write(&entry)?;
        self.object_count += 1;
        self.index_entries.push(IndexEntry { oid, crc32, offset });
        Ok(StoredObject { oid, offset, depth })
    }

    /// Finish the pack: patch the object count, append the SHA-1 trailer,
    /// write the `.idx`, and rename both to their hash-derived names.
    /// An empty pack is removed instead; nothing references it.
    pub fn finalize(mut self) -> Result<Option<(PathBuf, PathBuf)>, BridgeError> {
        if self.object_count == 0 {
            drop(self.window);
            fs::remove_file(&self.pending_path)?;
            return Ok(None);
        }
        self.window.rewrite_at(8, &self.object_count.to_be_bytes())?;

        let mut file = self.window.into_file();
        file.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let pack_hash: [u8; 20] = hasher.finalize().into();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&pack_hash)?;
        drop(file);

        let hex = hex::encode(pack_hash);
        let pack_path = self.dir.join(format!("pack-{hex}.pack"));
        let idx_path = self.dir.join(format!("pack-{hex}.idx"));
        write_idx(&idx_path, &mut self.index_entries, &pack_hash)?;
        fs::rename(&self.pending_path, &pack_path)?;
        debug!(
            objects = self.object_count,
            pack = %pack_path.display(),
            "pack finalized"
        );
        Ok(Some((pack_path, idx_path)))
    }
}

/// Pack entry header: 3-bit type and the payload size as a varint whose
/// first byte carries 4 size bits next to the type bits.
fn entry_header(type_bits: u8, size: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut size = size;
    let mut byte = (type_bits << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        bytes.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    bytes.push(byte);
    bytes
}

/// Write a v2 pack index: magic, fanout, sorted names, CRCs, offsets (with
/// the large-offset table when needed), the pack checksum, and the idx
/// checksum over everything before it.
fn write_idx(
    path: &Path,
    entries: &mut [IndexEntry],
    pack_hash: &[u8; 20],
) -> Result<(), BridgeError> {
    entries.sort_by(|a, b| a.oid.cmp(&b.oid));

    let mut data = Vec::new();
    data.extend_from_slice(&[0xFF, 0x74, 0x4F, 0x63, 0, 0, 0, 2]);

    let mut fanout = [0u32; 256];
    for entry in entries.iter() {
        fanout[entry.oid.as_bytes()[0] as usize] += 1;
    }
    for i in 1..fanout.len() {
        fanout[i] += fanout[i - 1];
    }
    for count in fanout {
        data.extend_from_slice(&count.to_be_bytes());
    }

    for entry in entries.iter() {
        data.extend_from_slice(entry.oid.as_bytes());
    }
    for entry in entries.iter() {
        data.extend_from_slice(&entry.crc32.to_be_bytes());
    }
    let mut large = Vec::new();
    for entry in entries.iter() {
        if entry.offset <= 0x7FFF_FFFF {
            data.extend_from_slice(&(entry.offset as u32).to_be_bytes());
        } else {
            let marker = 0x8000_0000u32 | large.len() as u32;
            data.extend_from_slice(&marker.to_be_bytes());
            large.push(entry.offset);
        }
    }
    for offset in large {
        data.extend_from_slice(&offset.to_be_bytes());
    }
    data.extend_from_slice(pack_hash);

    let idx_hash: [u8; 20] = Sha1::digest(&data).into();
    data.extend_from_slice(&idx_hash);

    let mut file = File::create(path)?;
    file.write_all(&data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::pack::reader::PackReader;

    fn write_pack(
        objects: &[(ObjectType, Vec<u8>)],
    ) -> (tempfile::TempDir, PathBuf, PathBuf, Vec<GitOid>) {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PackWriter::create(dir.path(), 1 << 20, 50).unwrap();
        let mut oids = Vec::new();
        for (ty, data) in objects {
            oids.push(writer.write_object(*ty, data, None).unwrap().oid);
        }
        let (pack, idx) = writer.finalize().unwrap().unwrap();
        (dir, pack, idx, oids)
    }

    /// Finalizing an empty pack removes the pending file entirely.
    #[test]
    fn test_empty_pack_removed() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PackWriter::create(dir.path(), 1 << 20, 50).unwrap();
        assert!(writer.finalize().unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// A finished pack round-trips through the reader, base objects only.
    #[test]
    fn test_round_trip_base_objects() {
        let objects = vec![
            (ObjectType::Blob, b"hello\n".to_vec()),
            (ObjectType::Blob, vec![0u8; 5000]),
            (ObjectType::Tree, Vec::new()),
        ];
        let (_dir, pack, idx, oids) = write_pack(&objects);
        let reader = PackReader::open(&pack, &idx).unwrap();
        for ((ty, data), oid) in objects.iter().zip(&oids) {
            let (read_ty, read_data) = reader.read_object(oid).unwrap();
            assert_eq!(read_ty, *ty);
            assert_eq!(&read_data, data);
        }
    }

    /// Deltified entries resolve back to the full content and keep the
    /// object's real id.
    #[test]
    fn test_round_trip_delta() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PackWriter::create(dir.path(), 1 << 20, 50).unwrap();
        let base_data = b"line one\nline two\nline three\n".repeat(30);
        let mut next_data = base_data.clone();
        next_data.extend_from_slice(b"line four\n");

        let base = writer
            .write_object(ObjectType::Blob, &base_data, None)
            .unwrap();
        let stored = writer
            .write_object(
                ObjectType::Blob,
                &next_data,
                Some(DeltaRef {
                    offset: base.offset,
                    depth: base.depth,
                    data: &base_data,
                }),
            )
            .unwrap();
        assert_eq!(stored.depth, 1);
        assert_eq!(
            stored.oid,
            GitOid::from_type_and_data(ObjectType::Blob, &next_data)
        );

        let (pack, idx) = writer.finalize().unwrap().unwrap();
        let reader = PackReader::open(&pack, &idx).unwrap();
        let (ty, data) = reader.read_object(&stored.oid).unwrap();
        assert_eq!(ty, ObjectType::Blob);
        assert_eq!(data, next_data);
    }

    /// The depth limit forces full storage past max_delta_depth.
    #[test]
    fn test_delta_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PackWriter::create(dir.path(), 1 << 20, 1).unwrap();
        let a = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(10);
        let base = writer.write_object(ObjectType::Blob, &a, None).unwrap();
        let b = [&a[..], b"b"].concat();
        let second = writer
            .write_object(
                ObjectType::Blob,
                &b,
                Some(DeltaRef {
                    offset: base.offset,
                    depth: base.depth,
                    data: &a,
                }),
            )
            .unwrap();
        assert_eq!(second.depth, 1);
        let c = [&b[..], b"c"].concat();
        let third = writer
            .write_object(
                ObjectType::Blob,
                &c,
                Some(DeltaRef {
                    offset: second.offset,
                    depth: second.depth,
                    data: &b,
                }),
            )
            .unwrap();
        // depth 2 would exceed the limit of 1, so the entry is full
        assert_eq!(third.depth, 0);
    }

    /// Entry headers encode size in the split 4-bit + 7-bit varint form.
    #[test]
    fn test_entry_header() {
        assert_eq!(entry_header(3, 6), vec![0b0011_0110]);
        // size 300 = 0b1_0010_1100: low 4 bits 0b1100, rest 0b1_0010 = 18
        assert_eq!(entry_header(1, 300), vec![0b1001_1100, 18]);
    }
}
