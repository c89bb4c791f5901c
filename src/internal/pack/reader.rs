//! Read-back of pack entries: the header/payload decoder shared by the
//! in-progress pack and finished packs, and [`PackReader`] for a finished
//! `.pack`/`.idx` pair found in the store directory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;

use crate::delta::decode::delta_decode;
use crate::errors::BridgeError;
use crate::hash::GitOid;
use crate::internal::object::types::ObjectType;
use crate::utils::{read_bytes, read_offset_encoding};

/// Where a delta entry's base lives.
pub enum BaseLocation {
    Offset(u64),
    Id(GitOid),
}

/// Decode one pack entry from a reader positioned at `entry_offset`:
/// parse the type/size header, resolve the base reference for delta types,
/// and inflate the payload. Delta payloads are returned raw; the caller
/// resolves the base and applies the delta.
pub fn decode_entry<R: Read>(
    reader: &mut R,
    entry_offset: u64,
) -> Result<(ObjectType, Vec<u8>, Option<BaseLocation>), BridgeError> {
    let [first] = read_bytes(reader)?;
    let type_bits = (first >> 4) & 0x07;
    let mut size = (first & 0x0f) as usize;
    let mut shift = 4;
    let mut more = first & 0x80 != 0;
    while more {
        let [byte] = read_bytes(reader)?;
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        more = byte & 0x80 != 0;
    }
    let object_type = ObjectType::from_u8(type_bits)?;
    let base = match object_type {
        ObjectType::OffsetDelta => {
            let relative = read_offset_encoding(reader)?;
            let base_offset = entry_offset.checked_sub(relative).ok_or_else(|| {
                BridgeError::InvalidPack(format!(
                    "ofs-delta at {entry_offset} points {relative} bytes before the pack start"
                ))
            })?;
            Some(BaseLocation::Offset(base_offset))
        }
        ObjectType::HashDelta => Some(BaseLocation::Id(GitOid::from_stream(reader)?)),
        _ => None,
    };
    let payload = inflate(reader, size)?;
    Ok((object_type, payload, base))
}

fn inflate<R: Read>(reader: &mut R, expected: usize) -> Result<Vec<u8>, BridgeError> {
    let mut decoder = ZlibDecoder::new(reader);
    let mut out = Vec::with_capacity(expected);
    decoder.read_to_end(&mut out)?;
    if out.len() != expected {
        return Err(BridgeError::InvalidPack(format!(
            "entry inflated to {} bytes, header declared {expected}",
            out.len()
        )));
    }
    Ok(out)
}

/// A finished pack plus its parsed index.
#[derive(Debug)]
pub struct PackReader {
    file: File,
    index: HashMap<GitOid, u64>,
}

impl PackReader {
    /// Open a `.pack`/`.idx` pair, parsing the v2 index into memory.
    pub fn open(pack_path: &Path, idx_path: &Path) -> Result<PackReader, BridgeError> {
        let data = fs::read(idx_path)?;
        if data.len() < 8 + 256 * 4 + 40 || data[0..4] != [0xFF, 0x74, 0x4F, 0x63] {
            return Err(BridgeError::InvalidPack(format!(
                "`{}` is not a pack index",
                idx_path.display()
            )));
        }
        if BigEndian::read_u32(&data[4..8]) != 2 {
            return Err(BridgeError::InvalidPack(format!(
                "`{}` has an unsupported index version",
                idx_path.display()
            )));
        }
        let count = BigEndian::read_u32(&data[8 + 255 * 4..8 + 256 * 4]) as usize;
        let names_start = 8 + 256 * 4;
        let crc_start = names_start + count * 20;
        let offsets_start = crc_start + count * 4;
        let large_start = offsets_start + count * 4;
        if data.len() < large_start + 40 {
            return Err(BridgeError::InvalidPack(format!(
                "`{}` is truncated",
                idx_path.display()
            )));
        }

        let mut index = HashMap::with_capacity(count);
        for i in 0..count {
            let oid = GitOid::from_raw_bytes(&data[names_start + i * 20..names_start + i * 20 + 20])?;
            let raw = BigEndian::read_u32(&data[offsets_start + i * 4..offsets_start + i * 4 + 4]);
            let offset = if raw & 0x8000_0000 != 0 {
                let slot = (raw & 0x7FFF_FFFF) as usize;
                let at = large_start + slot * 8;
                if data.len() < at + 8 {
                    return Err(BridgeError::InvalidPack(format!(
                        "`{}` is missing its large offset table",
                        idx_path.display()
                    )));
                }
                BigEndian::read_u64(&data[at..at + 8])
            } else {
                raw as u64
            };
            index.insert(oid, offset);
        }

        Ok(PackReader {
            file: File::open(pack_path)?,
            index,
        })
    }

    pub fn contains(&self, oid: &GitOid) -> bool {
        self.index.contains_key(oid)
    }

    /// Read one object by id, resolving delta chains within this pack.
    pub fn read_object(&self, oid: &GitOid) -> Result<(ObjectType, Vec<u8>), BridgeError> {
        let offset = *self
            .index
            .get(oid)
            .ok_or_else(|| BridgeError::ObjectNotFound(oid.to_string()))?;
        self.read_at_offset(offset)
    }

    fn read_at_offset(&self, offset: u64) -> Result<(ObjectType, Vec<u8>), BridgeError> {
        let mut handle = &self.file;
        handle.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(handle);
        let (object_type, payload, base) = decode_entry(&mut reader, offset)?;
        match base {
            None => Ok((object_type, payload)),
            Some(BaseLocation::Offset(base_offset)) => {
                let (base_type, base_data) = self.read_at_offset(base_offset)?;
                let data = delta_decode(&mut Cursor::new(&payload), &base_data)?;
                Ok((base_type, data))
            }
            Some(BaseLocation::Id(base_oid)) => {
                let (base_type, base_data) = self.read_object(&base_oid)?;
                let data = delta_decode(&mut Cursor::new(&payload), &base_data)?;
                Ok((base_type, data))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::pack::writer::{DeltaRef, PackWriter};

    /// Opening garbage as an index is an invalid-pack error.
    #[test]
    fn test_rejects_bad_index() {
        let dir = tempfile::tempdir().unwrap();
        let idx = dir.path().join("x.idx");
        fs::write(&idx, b"not an index").unwrap();
        let err = PackReader::open(&idx, &idx).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPack(_)));
    }

    /// A delta chain of length two resolves through both hops.
    #[test]
    fn test_delta_chain_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PackWriter::create(dir.path(), 1 << 20, 50).unwrap();
        let v1 = b"alpha beta gamma delta epsilon zeta".repeat(8);
        let v2 = [&v1[..], b" eta"].concat();
        let v3 = [&v2[..], b" theta"].concat();
        let s1 = writer.write_object(ObjectType::Blob, &v1, None).unwrap();
        let s2 = writer
            .write_object(
                ObjectType::Blob,
                &v2,
                Some(DeltaRef {
                    offset: s1.offset,
                    depth: s1.depth,
                    data: &v1,
                }),
            )
            .unwrap();
        let s3 = writer
            .write_object(
                ObjectType::Blob,
                &v3,
                Some(DeltaRef {
                    offset: s2.offset,
                    depth: s2.depth,
                    data: &v2,
                }),
            )
            .unwrap();
        assert_eq!(s3.depth, 2);
        let (pack, idx) = writer.finalize().unwrap().unwrap();
        let reader = PackReader::open(&pack, &idx).unwrap();
        assert_eq!(reader.read_object(&s3.oid).unwrap().1, v3);
        assert_eq!(reader.read_object(&s2.oid).unwrap().1, v2);
        assert!(reader.contains(&s1.oid));
    }
}
