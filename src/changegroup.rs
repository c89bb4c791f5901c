//! Decoding of Mercurial changegroup revision chunks.
//!
//! A chunk carries an 80-byte header of four node ids followed by a sequence
//! of byte-range diff parts against the revision's delta parent. In a v1
//! stream the delta parent is implicit (the preceding chunk's node, or
//! `parent1` for the first chunk of a chain) and the fourth header field is
//! the link node; in v2 the fourth field names the delta parent explicitly.
//! Chunks arrive length-prefixed; a zero length terminates a section.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use bytes::Bytes;

use crate::errors::BridgeError;
use crate::hash::HgOid;

const CHUNK_HEADER_LEN: usize = 80;
const DIFF_HEADER_LEN: usize = 12;

/// Where a chunk's delta parent comes from.
#[derive(Debug, Clone, Copy)]
pub enum DeltaSource {
    /// Supplied out of band (the `store file <sha>` command form).
    Known(HgOid),
    /// v1 chaining: the previous chunk's node, or `parent1` when first.
    Previous(Option<HgOid>),
    /// v2: the fourth header field is the delta parent.
    Embedded,
}

/// One revision: header fields plus the raw diff parts.
#[derive(Debug, Clone)]
pub struct RevChunk {
    pub node: HgOid,
    pub parent1: HgOid,
    pub parent2: HgOid,
    pub delta_node: HgOid,
    data: Bytes,
}

impl RevChunk {
    /// Parse a raw chunk body (without the length prefix).
    pub fn parse(raw: Bytes, source: DeltaSource) -> Result<RevChunk, BridgeError> {
        if raw.len() < CHUNK_HEADER_LEN {
            return Err(BridgeError::MalformedChunk(format!(
                "chunk of {} bytes is shorter than its header",
                raw.len()
            )));
        }
        let node = HgOid::from_raw_bytes(&raw[0..20])?;
        let parent1 = HgOid::from_raw_bytes(&raw[20..40])?;
        let parent2 = HgOid::from_raw_bytes(&raw[40..60])?;
        let fourth = HgOid::from_raw_bytes(&raw[60..80])?;
        let delta_node = match source {
            DeltaSource::Embedded => fourth,
            DeltaSource::Known(node) => node,
            DeltaSource::Previous(previous) => previous.unwrap_or(parent1),
        };
        Ok(RevChunk {
            node,
            parent1,
            parent2,
            delta_node,
            data: raw.slice(CHUNK_HEADER_LEN..),
        })
    }

    /// Iterate the byte-range diffs in encounter order.
    pub fn iter_diffs(&self) -> RevDiffIter<'_> {
        RevDiffIter { rest: &self.data }
    }
}

/// One diff part: replace bytes `[start, end)` of the delta parent's
/// content with `data`.
#[derive(Debug, Clone, Copy)]
pub struct RevDiff<'a> {
    pub start: usize,
    pub end: usize,
    pub data: &'a [u8],
}

/// Iterator over the diff parts of a chunk.
pub struct RevDiffIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for RevDiffIter<'a> {
    type Item = Result<RevDiff<'a>, BridgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < DIFF_HEADER_LEN {
            self.rest = &[];
            return Some(Err(BridgeError::MalformedChunk(
                "truncated diff part header".into(),
            )));
        }
        let start = BigEndian::read_u32(&self.rest[0..4]) as usize;
        let end = BigEndian::read_u32(&self.rest[4..8]) as usize;
        let len = BigEndian::read_u32(&self.rest[8..12]) as usize;
        if self.rest.len() < DIFF_HEADER_LEN + len {
            self.rest = &[];
            return Some(Err(BridgeError::MalformedChunk(
                "diff part data extends past the chunk".into(),
            )));
        }
        if end < start {
            self.rest = &[];
            return Some(Err(BridgeError::MalformedChunk(format!(
                "diff part range [{start}, {end}) is inverted"
            ))));
        }
        let data = &self.rest[DIFF_HEADER_LEN..DIFF_HEADER_LEN + len];
        self.rest = &self.rest[DIFF_HEADER_LEN + len..];
        Some(Ok(RevDiff { start, end, data }))
    }
}

/// Reader for the length-prefixed chunk framing of a changegroup stream.
pub struct ChangegroupReader<'a, R> {
    input: &'a mut R,
    version: u8,
}

impl<'a, R: std::io::BufRead> ChangegroupReader<'a, R> {
    pub fn new(input: &'a mut R, version: u8) -> Result<ChangegroupReader<'a, R>, BridgeError> {
        if version != 1 && version != 2 {
            return Err(BridgeError::ProtocolViolation(format!(
                "unsupported changegroup version {version}"
            )));
        }
        Ok(ChangegroupReader { input, version })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Read the next chunk body; `None` marks the end of a section. The
    /// length prefix counts itself.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>, BridgeError> {
        let len = self.input.read_u32::<BigEndian>()? as usize;
        if len == 0 {
            return Ok(None);
        }
        if len < 4 {
            return Err(BridgeError::MalformedChunk(format!(
                "chunk length prefix {len} is shorter than itself"
            )));
        }
        let mut body = vec![0u8; len - 4];
        self.input.read_exact(&mut body)?;
        Ok(Some(Bytes::from(body)))
    }

    /// How the next revision chunk finds its delta parent, given the node
    /// of the previous chunk in this chain.
    pub fn delta_source(&self, previous: Option<HgOid>) -> DeltaSource {
        if self.version == 2 {
            DeltaSource::Embedded
        } else {
            DeltaSource::Previous(previous)
        }
    }
}

/// Assemble a raw chunk body from header fields and diff parts (tests).
#[cfg(test)]
pub(crate) fn raw_chunk(
    node: HgOid,
    parent1: HgOid,
    parent2: HgOid,
    fourth: HgOid,
    diffs: &[(u32, u32, &[u8])],
) -> Bytes {
    let mut raw = Vec::new();
    raw.extend_from_slice(node.as_bytes());
    raw.extend_from_slice(parent1.as_bytes());
    raw.extend_from_slice(parent2.as_bytes());
    raw.extend_from_slice(fourth.as_bytes());
    for (start, end, data) in diffs {
        raw.extend_from_slice(&start.to_be_bytes());
        raw.extend_from_slice(&end.to_be_bytes());
        raw.extend_from_slice(&(data.len() as u32).to_be_bytes());
        raw.extend_from_slice(data);
    }
    Bytes::from(raw)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn oid(byte: u8) -> HgOid {
        HgOid::from_raw_bytes(&[byte; 20]).unwrap()
    }

    /// v2 chunks carry the delta parent in the fourth header field.
    #[test]
    fn test_embedded_delta_parent() {
        let raw = raw_chunk(oid(1), oid(2), oid(3), oid(4), &[(0, 0, b"x")]);
        let chunk = RevChunk::parse(raw, DeltaSource::Embedded).unwrap();
        assert_eq!(chunk.delta_node, oid(4));
        let diffs: Vec<_> = chunk.iter_diffs().collect::<Result<_, _>>().unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!((diffs[0].start, diffs[0].end, diffs[0].data), (0, 0, &b"x"[..]));
    }

    /// v1 chaining: first chunk deltas against parent1, later chunks
    /// against the preceding node.
    #[test]
    fn test_previous_delta_parent() {
        let raw = raw_chunk(oid(1), oid(2), oid(3), oid(9), &[]);
        let first = RevChunk::parse(raw.clone(), DeltaSource::Previous(None)).unwrap();
        assert_eq!(first.delta_node, oid(2));
        let second = RevChunk::parse(raw, DeltaSource::Previous(Some(oid(7)))).unwrap();
        assert_eq!(second.delta_node, oid(7));
    }

    /// A chunk shorter than the header is malformed.
    #[test]
    fn test_short_chunk() {
        let err = RevChunk::parse(Bytes::from(vec![0u8; 50]), DeltaSource::Embedded).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedChunk(_)));
    }

    /// A diff whose data runs past the chunk is malformed.
    #[test]
    fn test_truncated_diff() {
        let mut raw = raw_chunk(oid(1), oid(2), oid(3), oid(4), &[]).to_vec();
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend_from_slice(&100u32.to_be_bytes());
        raw.extend_from_slice(b"short");
        let chunk = RevChunk::parse(Bytes::from(raw), DeltaSource::Embedded).unwrap();
        let result: Result<Vec<_>, _> = chunk.iter_diffs().collect();
        assert!(matches!(result, Err(BridgeError::MalformedChunk(_))));
    }

    /// An inverted range is malformed.
    #[test]
    fn test_inverted_diff_range() {
        let raw = raw_chunk(oid(1), oid(2), oid(3), oid(4), &[(5, 2, b"")]);
        let chunk = RevChunk::parse(raw, DeltaSource::Embedded).unwrap();
        let result: Result<Vec<_>, _> = chunk.iter_diffs().collect();
        assert!(matches!(result, Err(BridgeError::MalformedChunk(_))));
    }

    /// The framing reader yields chunk bodies until the zero terminator.
    #[test]
    fn test_framing() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&9u32.to_be_bytes());
        stream.extend_from_slice(b"hello");
        stream.extend_from_slice(&4u32.to_be_bytes()); // empty body
        stream.extend_from_slice(&0u32.to_be_bytes()); // section end
        let mut cursor = Cursor::new(stream);
        let mut reader = ChangegroupReader::new(&mut cursor, 2).unwrap();
        assert_eq!(reader.next_chunk().unwrap().unwrap(), Bytes::from("hello"));
        assert_eq!(reader.next_chunk().unwrap().unwrap(), Bytes::new());
        assert!(reader.next_chunk().unwrap().is_none());
    }

    /// Only versions 1 and 2 are accepted.
    #[test]
    fn test_bad_version() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(
            ChangegroupReader::new(&mut cursor, 3),
            Err(BridgeError::ProtocolViolation(_))
        ));
    }
}
