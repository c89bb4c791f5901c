//! Reconstruction and storage of Mercurial file revisions.
//!
//! A file chunk's diffs apply against the full Mercurial form of its delta
//! parent, which includes the optional `\x01\n`-framed metadata prefix
//! (copy/rename information). The stored Git blob carries only the content
//! after the prefix; the prefix itself is stored as a separate blob recorded
//! in the `files-meta` notes tree. The most recently stored file is cached
//! so that linear delta chains avoid reloading their parent and can be
//! deltified against it inside the pack.

use bstr::ByteSlice;
use tracing::debug;

use crate::changegroup::RevChunk;
use crate::errors::BridgeError;
use crate::hash::{EMPTY_HG_FILE, HgOid};
use crate::internal::object::types::ObjectType;
use crate::internal::pack::entry::PackedEntry;
use crate::internal::pack::writer::DeltaRef;
use crate::odb::Odb;
use crate::store::notes::NotesTree;

const METADATA_DELIMITER: &[u8] = b"\x01\n";

struct LastFile {
    node: HgOid,
    /// Full Mercurial form: metadata prefix (if any) plus blob content.
    content: Vec<u8>,
    /// Offset where the Git blob part begins within `content`.
    blob_start: usize,
    /// Pack entry of the stored blob, for deltification of the successor.
    entry: Option<PackedEntry>,
}

/// Store component for file revisions; holds the last-stored cache for the
/// duration of a session.
pub struct FileStore {
    last: Option<LastFile>,
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStore {
    pub fn new() -> FileStore {
        FileStore { last: None }
    }

    /// Reconstruct one file revision and store it as a Git blob, recording
    /// the `hg2git` mapping and any metadata prefix.
    pub fn store(
        &mut self,
        odb: &mut Odb,
        hg2git: &mut NotesTree,
        files_meta: &mut NotesTree,
        chunk: &RevChunk,
    ) -> Result<(), BridgeError> {
        if chunk.node == EMPTY_HG_FILE {
            // The empty file sentinel is never stored; readers special-case
            // it the same way.
            return Ok(());
        }

        let (base_content, base_blob_start, base_entry) =
            self.base_for(odb, hg2git, files_meta, chunk.delta_node)?;

        let content = apply_file_diffs(&base_content, chunk)?;

        // Split out the metadata prefix before storing the blob.
        let blob_start = if content.starts_with(METADATA_DELIMITER) {
            let close = content[2..].find(METADATA_DELIMITER).ok_or_else(|| {
                BridgeError::MalformedChunk(format!(
                    "unterminated metadata prefix in file revision {}",
                    chunk.node
                ))
            })?;
            let metadata_oid = odb.write_object(ObjectType::Blob, &content[2..2 + close])?;
            files_meta.put(odb, *chunk.node.as_bytes(), metadata_oid)?;
            2 + close + 2
        } else {
            0
        };

        let reference = base_entry
            .filter(|entry| odb.usable_as_delta_base(entry))
            .map(|entry| DeltaRef {
                offset: entry.offset,
                depth: entry.depth,
                data: &base_content[base_blob_start..],
            });
        let blob_oid = odb.store_object(ObjectType::Blob, &content[blob_start..], reference)?;
        hg2git.put(odb, *chunk.node.as_bytes(), blob_oid)?;
        debug!(node = %chunk.node, blob = %blob_oid, "file revision stored");

        let entry = odb.find_object(&blob_oid);
        self.last = Some(LastFile {
            node: chunk.node,
            content,
            blob_start,
            entry,
        });
        Ok(())
    }

    /// Full content of the delta parent, reusing the cache when it matches
    /// and reloading through `hg2git` otherwise.
    fn base_for(
        &mut self,
        odb: &mut Odb,
        hg2git: &mut NotesTree,
        files_meta: &mut NotesTree,
        delta_node: HgOid,
    ) -> Result<(Vec<u8>, usize, Option<PackedEntry>), BridgeError> {
        if delta_node.is_null() {
            return Ok((Vec::new(), 0, None));
        }
        if let Some(last) = self.last.take_if(|last| last.node == delta_node) {
            return Ok((last.content, last.blob_start, last.entry));
        }
        self.last = None;
        let blob_oid = hg2git
            .get(odb, delta_node.as_bytes())?
            .ok_or_else(|| BridgeError::UnknownDeltaParent(delta_node.to_string()))?;
        let blob = odb.read_blob(&blob_oid)?;
        let entry = odb.find_object(&blob_oid);
        match files_meta.get(odb, delta_node.as_bytes())? {
            Some(metadata_oid) => {
                let metadata = odb.read_blob(&metadata_oid)?;
                let mut content =
                    Vec::with_capacity(blob.len() + metadata.len() + 2 * METADATA_DELIMITER.len());
                content.extend_from_slice(METADATA_DELIMITER);
                content.extend_from_slice(&metadata);
                content.extend_from_slice(METADATA_DELIMITER);
                let blob_start = content.len();
                content.extend_from_slice(&blob);
                Ok((content, blob_start, entry))
            }
            None => Ok((blob, 0, entry)),
        }
    }

    /// Drop the last-file cache (session end).
    pub fn release(&mut self) {
        self.last = None;
    }
}

/// Apply a chunk's diffs to the base content, in encounter order.
fn apply_file_diffs(base: &[u8], chunk: &RevChunk) -> Result<Vec<u8>, BridgeError> {
    let mut content = Vec::with_capacity(base.len());
    let mut last_end = 0usize;
    for diff in chunk.iter_diffs() {
        let diff = diff?;
        if diff.start < last_end || diff.start > base.len() || diff.end > base.len() {
            return Err(BridgeError::MalformedChunk(format!(
                "file diff [{}, {}) does not fit base of {} bytes",
                diff.start,
                diff.end,
                base.len()
            )));
        }
        content.extend_from_slice(&base[last_end..diff.start]);
        content.extend_from_slice(diff.data);
        last_end = diff.end;
    }
    content.extend_from_slice(&base[last_end..]);
    Ok(content)
}
