//! Manifest delta application and storage.
//!
//! A Mercurial manifest is a sorted byte text of lines
//! `<path>\0<40-hex node><attr?>\n` (attr empty, `x`, or `l`). Incoming
//! chunks patch that text by byte range; for every chunk this store must
//! produce a Git commit whose tree mirrors the manifest structurally and
//! whose parents are the commits already mapped for the manifest's parents.
//!
//! The mirror tree keeps directories as arena-indexed nodes so incremental
//! updates avoid rebuilding from scratch. Every path component is stored
//! with a leading underscore, which sidesteps Git's restrictions on names
//! like `.git` and makes the byte arithmetic of the tree-walk strategy
//! exact: a directory's prefixed name is as long as its path component plus
//! the `/` separator, and a file's prefixed name is as long as its
//! component plus the `\0` terminator.
//!
//! Two application strategies produce identical output: the default rebuilds
//! the full manifest text alongside the tree; the opt-in tree walk never
//! materializes the text and instead advances through the mirror counting
//! the bytes each entry contributes. In both, additions are applied only
//! after every removal, because a later diff may remove what an earlier
//! diff added.

use bstr::BString;
use memchr::memchr;
use tracing::debug;

use crate::changegroup::RevChunk;
use crate::errors::BridgeError;
use crate::hash::{EMPTY_TREE_OID, GitOid, HgOid};
use crate::internal::object::commit::Commit;
use crate::internal::object::tree::{Tree, TreeItem, TreeItemMode};
use crate::internal::object::types::ObjectType;
use crate::odb::Odb;
use crate::store::heads::HeadsSet;
use crate::store::notes::NotesTree;

/// How manifest diffs are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestStrategy {
    /// Keep the full previous manifest text in memory and rebuild it.
    #[default]
    TextRebuild,
    /// Interpret byte offsets by walking the mirror tree; trades CPU for
    /// not holding large manifest texts.
    TreeWalk,
}

/// Manifest line attribute for a mirror entry mode, as emitted in the text.
fn manifest_attr(mode: TreeItemMode) -> Result<&'static [u8], BridgeError> {
    match mode {
        TreeItemMode::HgFile => Ok(b""),
        TreeItemMode::HgFileExecutable => Ok(b"x"),
        TreeItemMode::Commit => Ok(b"l"),
        _ => Err(BridgeError::InvalidObject(format!(
            "mode {mode} has no manifest attribute"
        ))),
    }
}

/// Mode for a manifest attr byte (`0`, `x` or `l`).
fn mode_for_attr(attr: u8) -> Result<TreeItemMode, BridgeError> {
    match attr {
        0 => Ok(TreeItemMode::HgFile),
        b'x' => Ok(TreeItemMode::HgFileExecutable),
        b'l' => Ok(TreeItemMode::Commit),
        other => Err(BridgeError::MalformedChunk(format!(
            "manifest attr byte {other:#04x} is not one of 0, 'x', 'l'"
        ))),
    }
}

/// Iterator over manifest lines in a byte slice.
struct ManifestLines<'a> {
    rest: &'a [u8],
}

fn manifest_lines(data: &[u8]) -> ManifestLines<'_> {
    ManifestLines { rest: data }
}

impl<'a> Iterator for ManifestLines<'a> {
    type Item = Result<(&'a [u8], HgOid, TreeItemMode), BridgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let Some(line_end) = memchr(b'\n', self.rest) else {
            self.rest = &[];
            return Some(Err(BridgeError::MalformedChunk(
                "manifest line without newline".into(),
            )));
        };
        let line = &self.rest[..line_end];
        self.rest = &self.rest[line_end + 1..];
        let Some(nul) = memchr(b'\0', line) else {
            return Some(Err(BridgeError::MalformedChunk(
                "manifest line without path terminator".into(),
            )));
        };
        let path = &line[..nul];
        let tail = &line[nul + 1..];
        let (hex, attr) = match tail.len() {
            40 => (tail, 0u8),
            41 => (&tail[..40], tail[40]),
            _ => {
                return Some(Err(BridgeError::MalformedChunk(format!(
                    "manifest line for `{}` has a {}-byte node field",
                    String::from_utf8_lossy(path),
                    tail.len()
                ))));
            }
        };
        let node = match HgOid::from_hex(hex) {
            Ok(node) => node,
            Err(err) => return Some(Err(err)),
        };
        let mode = match mode_for_attr(attr) {
            Ok(mode) => mode,
            Err(err) => return Some(Err(err)),
        };
        Some(Ok((path, node, mode)))
    }
}

fn prefixed(component: &[u8]) -> BString {
    let mut name = BString::from(&b"_"[..]);
    name.extend_from_slice(component);
    name
}

fn git_order(a_name: &[u8], a_tree: bool, b_name: &[u8], b_tree: bool) -> std::cmp::Ordering {
    let a_suffix: &[u8] = if a_tree { b"/" } else { b"" };
    let b_suffix: &[u8] = if b_tree { b"/" } else { b"" };
    a_name
        .iter()
        .chain(a_suffix.iter())
        .cmp(b_name.iter().chain(b_suffix.iter()))
}

#[derive(Clone)]
struct MirrorEntry {
    /// Underscore-prefixed path component.
    name: BString,
    mode: TreeItemMode,
    /// Embedded Mercurial node for files; Git tree oid for directories.
    oid: GitOid,
    /// Arena index of the loaded subtree, directories only.
    child: Option<usize>,
    /// Tree-walk deletion mark, swept after the chunk's additions.
    deleted: bool,
}

struct DirNode {
    entries: Vec<MirrorEntry>,
    dirty: bool,
}

/// In-memory Git-tree-shaped mirror of the latest manifest.
pub struct MirrorTree {
    nodes: Vec<DirNode>,
    root_oid: GitOid,
}

/// Cursor state for the tree-walk strategy.
pub struct ManifestWalk {
    stack: Vec<WalkFrame>,
}

#[derive(Clone, Copy)]
struct WalkFrame {
    dir: usize,
    idx: usize,
    /// Bytes contributed to a contained file's line by the directory names
    /// above this frame.
    prefix: usize,
}

impl MirrorTree {
    pub fn new() -> MirrorTree {
        MirrorTree {
            nodes: vec![DirNode {
                entries: Vec::new(),
                dirty: false,
            }],
            root_oid: EMPTY_TREE_OID,
        }
    }

    /// Mirror an existing manifest tree, loading subtrees on demand.
    pub fn from_tree(odb: &mut Odb, tree_oid: GitOid) -> Result<MirrorTree, BridgeError> {
        let tree = odb.read_tree(&tree_oid)?;
        Ok(MirrorTree {
            nodes: vec![DirNode {
                entries: entries_from_tree(&tree),
                dirty: false,
            }],
            root_oid: tree_oid,
        })
    }

    fn find_entry(&self, dir: usize, name: &[u8], is_tree: bool) -> Result<usize, usize> {
        self.nodes[dir]
            .entries
            .binary_search_by(|entry| git_order(&entry.name, entry.mode.is_tree(), name, is_tree))
    }

    fn load_child(&mut self, odb: &mut Odb, dir: usize, idx: usize) -> Result<usize, BridgeError> {
        if let Some(child) = self.nodes[dir].entries[idx].child {
            return Ok(child);
        }
        let oid = self.nodes[dir].entries[idx].oid;
        let tree = odb.read_tree(&oid)?;
        let child = self.nodes.len();
        self.nodes.push(DirNode {
            entries: entries_from_tree(&tree),
            dirty: false,
        });
        self.nodes[dir].entries[idx].child = Some(child);
        Ok(child)
    }

    /// Insert or replace a file entry, creating directories as needed.
    /// The embedded value is the file's Mercurial node.
    pub fn insert(
        &mut self,
        odb: &mut Odb,
        path: &[u8],
        mode: TreeItemMode,
        value: GitOid,
    ) -> Result<(), BridgeError> {
        let mut dir = 0usize;
        let mut rest = path;
        loop {
            match memchr(b'/', rest) {
                Some(slash) => {
                    let component = &rest[..slash];
                    rest = &rest[slash + 1..];
                    if component.is_empty() {
                        return Err(BridgeError::MalformedChunk(format!(
                            "manifest path `{}` has an empty component",
                            String::from_utf8_lossy(path)
                        )));
                    }
                    let name = prefixed(component);
                    self.nodes[dir].dirty = true;
                    dir = match self.find_entry(dir, &name, true) {
                        Ok(idx) => self.load_child(odb, dir, idx)?,
                        Err(pos) => {
                            let child = self.nodes.len();
                            self.nodes.push(DirNode {
                                entries: Vec::new(),
                                dirty: true,
                            });
                            self.nodes[dir].entries.insert(
                                pos,
                                MirrorEntry {
                                    name,
                                    mode: TreeItemMode::Tree,
                                    oid: GitOid::NULL,
                                    child: Some(child),
                                    deleted: false,
                                },
                            );
                            child
                        }
                    };
                }
                None => {
                    if rest.is_empty() {
                        return Err(BridgeError::MalformedChunk(format!(
                            "manifest path `{}` ends with a separator",
                            String::from_utf8_lossy(path)
                        )));
                    }
                    let name = prefixed(rest);
                    match self.find_entry(dir, &name, false) {
                        Ok(idx) => {
                            let entry = &mut self.nodes[dir].entries[idx];
                            entry.mode = mode;
                            entry.oid = value;
                            entry.deleted = false;
                        }
                        Err(pos) => self.nodes[dir].entries.insert(
                            pos,
                            MirrorEntry {
                                name,
                                mode,
                                oid: value,
                                child: None,
                                deleted: false,
                            },
                        ),
                    }
                    self.nodes[dir].dirty = true;
                    return Ok(());
                }
            }
        }
    }

    /// Remove a file entry if present, pruning directories emptied by the
    /// removal. Removals of absent paths are tolerated: a chunk may remove
    /// the same line through more than one diff.
    pub fn remove_if_present(&mut self, odb: &mut Odb, path: &[u8]) -> Result<(), BridgeError> {
        self.remove_in(odb, 0, path)?;
        Ok(())
    }

    fn remove_in(&mut self, odb: &mut Odb, dir: usize, path: &[u8]) -> Result<(), BridgeError> {
        match memchr(b'/', path) {
            None => {
                let name = prefixed(path);
                if let Ok(idx) = self.find_entry(dir, &name, false) {
                    self.nodes[dir].entries.remove(idx);
                    self.nodes[dir].dirty = true;
                }
            }
            Some(slash) => {
                let name = prefixed(&path[..slash]);
                let Ok(idx) = self.find_entry(dir, &name, true) else {
                    return Ok(());
                };
                let child = self.load_child(odb, dir, idx)?;
                self.remove_in(odb, child, &path[slash + 1..])?;
                self.nodes[dir].dirty = true;
                if self.nodes[child].entries.is_empty() {
                    self.nodes[dir].entries.remove(idx);
                }
            }
        }
        Ok(())
    }

    /// Start a byte-counting walk at the beginning of the manifest.
    pub fn walk_start(&self) -> ManifestWalk {
        ManifestWalk {
            stack: vec![WalkFrame {
                dir: 0,
                idx: 0,
                prefix: 0,
            }],
        }
    }

    fn walk_next_file(
        &mut self,
        odb: &mut Odb,
        walk: &mut ManifestWalk,
    ) -> Result<Option<(usize, usize, usize)>, BridgeError> {
        loop {
            let Some(frame) = walk.stack.last().copied() else {
                return Ok(None);
            };
            if frame.idx >= self.nodes[frame.dir].entries.len() {
                walk.stack.pop();
                if let Some(parent) = walk.stack.last_mut() {
                    parent.idx += 1;
                }
                continue;
            }
            let (is_tree, name_len) = {
                let entry = &self.nodes[frame.dir].entries[frame.idx];
                (entry.mode.is_tree(), entry.name.len())
            };
            if is_tree {
                let child = self.load_child(odb, frame.dir, frame.idx)?;
                walk.stack.push(WalkFrame {
                    dir: child,
                    idx: 0,
                    // the prefixed dir name is exactly component + '/'
                    prefix: frame.prefix + name_len,
                });
                continue;
            }
            return Ok(Some((frame.dir, frame.idx, frame.prefix)));
        }
    }

    /// Advance the walk by exactly `bytes` of manifest text. With `delete`,
    /// every visited file entry is marked deleted and its directory chain
    /// dirty. Stopping mid-line means the diff was not aligned.
    pub fn walk_advance(
        &mut self,
        odb: &mut Odb,
        walk: &mut ManifestWalk,
        mut bytes: usize,
        delete: bool,
    ) -> Result<(), BridgeError> {
        while bytes > 0 {
            let (dir, idx, prefix) = self.walk_next_file(odb, walk)?.ok_or_else(|| {
                BridgeError::MalformedChunk("manifest diff extends past the manifest".into())
            })?;
            let line_len = {
                let entry = &self.nodes[dir].entries[idx];
                // prefixed file name is exactly component + '\0'
                prefix + entry.name.len() + 40 + manifest_attr(entry.mode)?.len() + 1
            };
            if bytes < line_len {
                return Err(BridgeError::MalformedChunk(
                    "manifest diff not aligned on a line boundary".into(),
                ));
            }
            bytes -= line_len;
            if delete {
                self.nodes[dir].entries[idx].deleted = true;
                for frame in &walk.stack {
                    self.nodes[frame.dir].dirty = true;
                }
            }
            walk.stack
                .last_mut()
                .expect("walk stack holds the frame that produced the file")
                .idx += 1;
        }
        Ok(())
    }

    /// Drop entries marked deleted by a walk and prune emptied directories.
    pub fn sweep(&mut self) {
        self.sweep_dir(0);
    }

    fn sweep_dir(&mut self, dir: usize) {
        let mut idx = 0;
        while idx < self.nodes[dir].entries.len() {
            let (deleted, is_tree, child) = {
                let entry = &self.nodes[dir].entries[idx];
                (entry.deleted, entry.mode.is_tree(), entry.child)
            };
            if deleted {
                self.nodes[dir].entries.remove(idx);
                continue;
            }
            if is_tree && let Some(child) = child {
                self.sweep_dir(child);
                if self.nodes[child].entries.is_empty() {
                    self.nodes[dir].entries.remove(idx);
                    continue;
                }
            }
            idx += 1;
        }
    }

    /// Write out dirty directories bottom-up; returns the root tree oid.
    pub fn flush(&mut self, odb: &mut Odb) -> Result<GitOid, BridgeError> {
        if !self.nodes[0].dirty {
            if self.root_oid == EMPTY_TREE_OID {
                odb.ensure_empty_tree()?;
            }
            return Ok(self.root_oid);
        }
        let root_oid = self.flush_dir(odb, 0)?;
        self.root_oid = root_oid;
        Ok(root_oid)
    }

    fn flush_dir(&mut self, odb: &mut Odb, dir: usize) -> Result<GitOid, BridgeError> {
        for idx in 0..self.nodes[dir].entries.len() {
            let (is_tree, child) = {
                let entry = &self.nodes[dir].entries[idx];
                (entry.mode.is_tree(), entry.child)
            };
            if is_tree
                && let Some(child) = child
                && self.nodes[child].dirty
            {
                let oid = self.flush_dir(odb, child)?;
                self.nodes[dir].entries[idx].oid = oid;
            }
        }
        let items: Vec<TreeItem> = self.nodes[dir]
            .entries
            .iter()
            .map(|entry| TreeItem::new(entry.mode, entry.oid, entry.name.clone()))
            .collect();
        let tree = Tree::from_tree_items(items);
        let oid = odb.write_object(ObjectType::Tree, &tree.to_data())?;
        self.nodes[dir].dirty = false;
        Ok(oid)
    }

    /// Regenerate the manifest text from the mirror, in tree order.
    pub fn generate_text(&mut self, odb: &mut Odb) -> Result<Vec<u8>, BridgeError> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.generate_dir(odb, 0, &mut prefix, &mut out)?;
        Ok(out)
    }

    fn generate_dir(
        &mut self,
        odb: &mut Odb,
        dir: usize,
        prefix: &mut Vec<u8>,
        out: &mut Vec<u8>,
    ) -> Result<(), BridgeError> {
        for idx in 0..self.nodes[dir].entries.len() {
            let (is_tree, name, mode, oid) = {
                let entry = &self.nodes[dir].entries[idx];
                (
                    entry.mode.is_tree(),
                    entry.name.clone(),
                    entry.mode,
                    entry.oid,
                )
            };
            if is_tree {
                let child = self.load_child(odb, dir, idx)?;
                let kept = prefix.len();
                prefix.extend_from_slice(&name[1..]);
                prefix.push(b'/');
                self.generate_dir(odb, child, prefix, out)?;
                prefix.truncate(kept);
            } else {
                out.extend_from_slice(prefix);
                out.extend_from_slice(&name[1..]);
                out.push(b'\0');
                out.extend_from_slice(hex::encode(oid.as_bytes()).as_bytes());
                out.extend_from_slice(manifest_attr(mode)?);
                out.push(b'\n');
            }
        }
        Ok(())
    }
}

fn entries_from_tree(tree: &Tree) -> Vec<MirrorEntry> {
    tree.tree_items
        .iter()
        .map(|item| MirrorEntry {
            name: item.name.clone(),
            mode: item.mode,
            oid: item.oid,
            child: None,
            deleted: false,
        })
        .collect()
}

struct LastManifest {
    node: HgOid,
    /// Full manifest text; empty and unused under the tree-walk strategy.
    text: Vec<u8>,
    tree: MirrorTree,
}

/// Store component for manifests; holds the mirror of the latest manifest
/// for the duration of a session.
pub struct ManifestStore {
    strategy: ManifestStrategy,
    last: Option<LastManifest>,
}

impl ManifestStore {
    pub fn new(strategy: ManifestStrategy) -> ManifestStore {
        ManifestStore {
            strategy,
            last: None,
        }
    }

    /// Apply one manifest chunk: patch the mirror (and text, per strategy),
    /// emit the tree and its commit, record `hg2git`, update the heads.
    /// With `check`, the stored manifest is re-encoded and its node
    /// recomputed against the chunk's parents.
    pub fn store(
        &mut self,
        odb: &mut Odb,
        hg2git: &mut NotesTree,
        manifest_heads: &mut HeadsSet,
        heads_tip: Option<GitOid>,
        chunk: &RevChunk,
        check: bool,
    ) -> Result<GitOid, BridgeError> {
        let mut state = match self.last.take() {
            Some(last) if last.node == chunk.delta_node => last,
            _ => self.reload(odb, hg2git, chunk.delta_node)?,
        };

        match self.strategy {
            ManifestStrategy::TextRebuild => apply_text_rebuild(odb, &mut state, chunk)?,
            ManifestStrategy::TreeWalk => apply_tree_walk(odb, &mut state, chunk)?,
        }

        let tree_oid = state.tree.flush(odb)?;
        let mut parents = Vec::new();
        for parent in [chunk.parent1, chunk.parent2] {
            if !parent.is_null() {
                let commit_oid = hg2git
                    .get(odb, parent.as_bytes())?
                    .ok_or_else(|| BridgeError::UnknownDeltaParent(parent.to_string()))?;
                parents.push(commit_oid);
            }
        }
        let commit = Commit::synthetic(tree_oid, parents, chunk.node.to_string());
        let commit_oid = odb.write_object(ObjectType::Commit, &commit.to_data())?;
        hg2git.put(odb, *chunk.node.as_bytes(), commit_oid)?;
        manifest_heads.add(odb, heads_tip, commit_oid)?;
        debug!(node = %chunk.node, commit = %commit_oid, tree = %tree_oid, "manifest stored");

        if check {
            let text = match self.strategy {
                ManifestStrategy::TextRebuild => std::mem::take(&mut state.text),
                ManifestStrategy::TreeWalk => state.tree.generate_text(odb)?,
            };
            let expected = HgOid::from_revision(chunk.parent1, chunk.parent2, &text);
            if expected != chunk.node {
                return Err(BridgeError::CheckFailed(format!(
                    "manifest {} re-encodes to node {expected}",
                    chunk.node
                )));
            }
            if self.strategy == ManifestStrategy::TextRebuild {
                state.text = text;
            }
        }

        state.node = chunk.node;
        self.last = Some(state);
        Ok(commit_oid)
    }

    /// Mirror state for a delta parent that is not the cached manifest.
    fn reload(
        &self,
        odb: &mut Odb,
        hg2git: &mut NotesTree,
        delta_node: HgOid,
    ) -> Result<LastManifest, BridgeError> {
        if delta_node.is_null() {
            return Ok(LastManifest {
                node: HgOid::NULL,
                text: Vec::new(),
                tree: MirrorTree::new(),
            });
        }
        let commit_oid = hg2git
            .get(odb, delta_node.as_bytes())?
            .ok_or_else(|| BridgeError::UnknownDeltaParent(delta_node.to_string()))?;
        let commit = odb.read_commit(&commit_oid)?;
        let mut tree = MirrorTree::from_tree(odb, commit.tree_id)?;
        let text = match self.strategy {
            ManifestStrategy::TextRebuild => tree.generate_text(odb)?,
            ManifestStrategy::TreeWalk => Vec::new(),
        };
        Ok(LastManifest {
            node: delta_node,
            text,
            tree,
        })
    }

    /// Drop the cached manifest state (session end).
    pub fn release(&mut self) {
        self.last = None;
    }
}

fn is_line_boundary(text: &[u8], pos: usize) -> bool {
    pos == 0 || text[pos - 1] == b'\n'
}

/// Default strategy: rebuild the manifest text while removing the patched
/// lines from the mirror, then apply every addition.
fn apply_text_rebuild(
    odb: &mut Odb,
    state: &mut LastManifest,
    chunk: &RevChunk,
) -> Result<(), BridgeError> {
    let prev = std::mem::take(&mut state.text);
    let mut text = Vec::with_capacity(prev.len());
    let mut last_end = 0usize;
    for diff in chunk.iter_diffs() {
        let diff = diff?;
        if diff.start > prev.len() || diff.end > prev.len() {
            return Err(BridgeError::MalformedChunk(format!(
                "manifest diff [{}, {}) does not fit manifest of {} bytes",
                diff.start,
                diff.end,
                prev.len()
            )));
        }
        if !is_line_boundary(&prev, diff.start) || !is_line_boundary(&prev, diff.end) {
            return Err(BridgeError::MalformedChunk(
                "manifest diff not aligned on a line boundary".into(),
            ));
        }
        if diff.start > last_end {
            text.extend_from_slice(&prev[last_end..diff.start]);
        }
        text.extend_from_slice(diff.data);
        for line in manifest_lines(&prev[diff.start..diff.end]) {
            let (path, _, _) = line?;
            state.tree.remove_if_present(odb, path)?;
        }
        last_end = last_end.max(diff.end);
    }
    text.extend_from_slice(&prev[last_end..]);

    // Additions go in after every removal.
    for diff in chunk.iter_diffs() {
        let diff = diff?;
        for line in manifest_lines(diff.data) {
            let (path, node, mode) = line?;
            state
                .tree
                .insert(odb, path, mode, GitOid::from_raw_bytes(node.as_bytes())?)?;
        }
    }
    state.text = text;
    Ok(())
}

/// Opt-in strategy: interpret diff offsets by walking the mirror and
/// counting line lengths, marking deleted stretches; additions and the
/// deletion sweep follow.
fn apply_tree_walk(
    odb: &mut Odb,
    state: &mut LastManifest,
    chunk: &RevChunk,
) -> Result<(), BridgeError> {
    let mut walk = state.tree.walk_start();
    let mut cursor = 0usize;
    for diff in chunk.iter_diffs() {
        let diff = diff?;
        let skip_to = diff.start.max(cursor);
        state
            .tree
            .walk_advance(odb, &mut walk, skip_to - cursor, false)?;
        if diff.end > skip_to {
            state
                .tree
                .walk_advance(odb, &mut walk, diff.end - skip_to, true)?;
        }
        cursor = cursor.max(diff.end);
    }
    for diff in chunk.iter_diffs() {
        let diff = diff?;
        for line in manifest_lines(diff.data) {
            let (path, node, mode) = line?;
            state
                .tree
                .insert(odb, path, mode, GitOid::from_raw_bytes(node.as_bytes())?)?;
        }
    }
    state.tree.sweep();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changegroup::DeltaSource;

    fn setup() -> (tempfile::TempDir, Odb, NotesTree, HeadsSet) {
        let dir = tempfile::tempdir().unwrap();
        let odb = Odb::open(dir.path(), 1 << 16, 50).unwrap();
        (
            dir,
            odb,
            NotesTree::new(TreeItemMode::Commit),
            HeadsSet::new(true),
        )
    }

    fn node(byte: u8) -> HgOid {
        HgOid::from_raw_bytes(&[byte; 20]).unwrap()
    }

    fn chunk(
        node_id: HgOid,
        parent1: HgOid,
        delta: HgOid,
        diffs: &[(u32, u32, &[u8])],
    ) -> RevChunk {
        let raw = crate::changegroup::raw_chunk(node_id, parent1, HgOid::NULL, delta, diffs);
        RevChunk::parse(raw, DeltaSource::Embedded).unwrap()
    }

    fn line(path: &str, node_hex: &str, attr: &str) -> Vec<u8> {
        let mut line = Vec::new();
        line.extend_from_slice(path.as_bytes());
        line.push(b'\0');
        line.extend_from_slice(node_hex.as_bytes());
        line.extend_from_slice(attr.as_bytes());
        line.push(b'\n');
        line
    }

    const NODE_A: &str = "1234567890123456789012345678901234567890";

    /// A single-file manifest produces a one-entry gitlink tree and a
    /// commit whose body is the manifest node's hex.
    #[test]
    fn test_single_file_manifest() {
        let (_dir, mut odb, mut hg2git, mut heads) = setup();
        let mut store = ManifestStore::new(ManifestStrategy::TextRebuild);
        let data = line("a", NODE_A, "");
        let c = chunk(node(1), HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
        let commit_oid = store
            .store(&mut odb, &mut hg2git, &mut heads, None, &c, false)
            .unwrap();

        let commit = odb.read_commit(&commit_oid).unwrap();
        assert_eq!(commit.body.to_string(), node(1).to_string());
        let tree = odb.read_tree(&commit.tree_id).unwrap();
        assert_eq!(tree.tree_items.len(), 1);
        assert_eq!(tree.tree_items[0].name, "_a");
        assert_eq!(tree.tree_items[0].mode, TreeItemMode::HgFile);
        assert_eq!(tree.tree_items[0].oid.to_string(), NODE_A);

        assert_eq!(heads.heads(), &[commit_oid]);
        assert_eq!(
            hg2git.get(&mut odb, node(1).as_bytes()).unwrap(),
            Some(commit_oid)
        );
    }

    /// Nested paths become underscore-prefixed directory chains; attrs map
    /// to the executable and link modes.
    #[test]
    fn test_nested_paths_and_attrs() {
        let (_dir, mut odb, mut hg2git, mut heads) = setup();
        let mut store = ManifestStore::new(ManifestStrategy::TextRebuild);
        let mut data = line("a/b/c.txt", NODE_A, "");
        data.extend(line("a/x", NODE_A, "x"));
        data.extend(line("link", NODE_A, "l"));
        let c = chunk(node(1), HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
        let commit_oid = store
            .store(&mut odb, &mut hg2git, &mut heads, None, &c, false)
            .unwrap();

        let commit = odb.read_commit(&commit_oid).unwrap();
        let root = odb.read_tree(&commit.tree_id).unwrap();
        let names: Vec<_> = root.tree_items.iter().map(|i| i.name.to_string()).collect();
        assert_eq!(names, ["_a", "_link"]);
        assert_eq!(root.tree_items[1].mode, TreeItemMode::Commit);

        let a = odb.read_tree(&root.tree_items[0].oid).unwrap();
        let a_names: Vec<_> = a.tree_items.iter().map(|i| i.name.to_string()).collect();
        assert_eq!(a_names, ["_b", "_x"]);
        assert_eq!(a.tree_items[1].mode, TreeItemMode::HgFileExecutable);
    }

    /// Both strategies give identical commits across a chain of chunks.
    #[test]
    fn test_strategies_agree() {
        let base = line("a", NODE_A, "");
        // chunk 1: create; chunk 2: append a nested line; chunk 3: drop `a`
        let mut results = Vec::new();
        for strategy in [ManifestStrategy::TextRebuild, ManifestStrategy::TreeWalk] {
            let (_dir, mut odb, mut hg2git, mut heads) = setup();
            let mut store = ManifestStore::new(strategy);
            let c1 = chunk(node(1), HgOid::NULL, HgOid::NULL, &[(0, 0, &base)]);
            let o1 = store
                .store(&mut odb, &mut hg2git, &mut heads, None, &c1, false)
                .unwrap();
            let append = line("b/deep/file", NODE_A, "x");
            let c2 = chunk(node(2), node(1), node(1), &[(43, 43, &append)]);
            let o2 = store
                .store(&mut odb, &mut hg2git, &mut heads, None, &c2, false)
                .unwrap();
            let c3 = chunk(node(3), node(2), node(2), &[(0, 43, b"")]);
            let o3 = store
                .store(&mut odb, &mut hg2git, &mut heads, None, &c3, false)
                .unwrap();
            results.push((o1, o2, o3));
        }
        assert_eq!(results[0], results[1]);
    }

    /// Removal and re-addition at the same offset: the addition must win.
    #[test]
    fn test_remove_then_add_same_offset() {
        for strategy in [ManifestStrategy::TextRebuild, ManifestStrategy::TreeWalk] {
            let (_dir, mut odb, mut hg2git, mut heads) = setup();
            let mut store = ManifestStore::new(strategy);
            let data = line("a", NODE_A, "");
            let c1 = chunk(node(1), HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
            store
                .store(&mut odb, &mut hg2git, &mut heads, None, &c1, false)
                .unwrap();
            let c2 = chunk(
                node(2),
                node(1),
                node(1),
                &[(0, 43, &data), (0, 43, b"")],
            );
            let commit_oid = store
                .store(&mut odb, &mut hg2git, &mut heads, None, &c2, false)
                .unwrap();
            let commit = odb.read_commit(&commit_oid).unwrap();
            let tree = odb.read_tree(&commit.tree_id).unwrap();
            assert_eq!(tree.tree_items.len(), 1, "strategy {strategy:?}");
            assert_eq!(tree.tree_items[0].name, "_a");
            assert_eq!(tree.tree_items[0].oid.to_string(), NODE_A);
        }
    }

    /// An empty diff whose node deltas against itself reuses the tree oid.
    #[test]
    fn test_empty_diff_keeps_tree() {
        let (_dir, mut odb, mut hg2git, mut heads) = setup();
        let mut store = ManifestStore::new(ManifestStrategy::TextRebuild);
        let data = line("a", NODE_A, "");
        let c1 = chunk(node(1), HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
        let first = store
            .store(&mut odb, &mut hg2git, &mut heads, None, &c1, false)
            .unwrap();
        let c2 = chunk(node(2), node(1), node(1), &[]);
        let second = store
            .store(&mut odb, &mut hg2git, &mut heads, None, &c2, false)
            .unwrap();
        let t1 = odb.read_commit(&first).unwrap().tree_id;
        let t2 = odb.read_commit(&second).unwrap().tree_id;
        assert_eq!(t1, t2);
        assert_ne!(first, second);
    }

    /// A delta whose parent is not the cached manifest reloads the mirror
    /// from the stored tree.
    #[test]
    fn test_reload_from_stored_tree() {
        let (_dir, mut odb, mut hg2git, mut heads) = setup();
        let data = line("dir/file", NODE_A, "");
        {
            let mut store = ManifestStore::new(ManifestStrategy::TextRebuild);
            let c1 = chunk(node(1), HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
            store
                .store(&mut odb, &mut hg2git, &mut heads, None, &c1, false)
                .unwrap();
            // cache dropped with the store
        }
        let mut store = ManifestStore::new(ManifestStrategy::TextRebuild);
        let append = line("zz", NODE_A, "");
        let c2 = chunk(
            node(2),
            node(1),
            node(1),
            &[(data.len() as u32, data.len() as u32, &append)],
        );
        let commit_oid = store
            .store(&mut odb, &mut hg2git, &mut heads, None, &c2, false)
            .unwrap();
        let commit = odb.read_commit(&commit_oid).unwrap();
        let tree = odb.read_tree(&commit.tree_id).unwrap();
        let names: Vec<_> = tree.tree_items.iter().map(|i| i.name.to_string()).collect();
        assert_eq!(names, ["_dir", "_zz"]);
    }

    /// Diffs not aligned on line boundaries are malformed, as are bad attr
    /// bytes.
    #[test]
    fn test_malformed_manifest_chunks() {
        let (_dir, mut odb, mut hg2git, mut heads) = setup();
        let mut store = ManifestStore::new(ManifestStrategy::TextRebuild);
        let data = line("a", NODE_A, "");
        let c1 = chunk(node(1), HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
        store
            .store(&mut odb, &mut hg2git, &mut heads, None, &c1, false)
            .unwrap();

        let misaligned = chunk(node(2), node(1), node(1), &[(1, 48, b"")]);
        let err = store
            .store(&mut odb, &mut hg2git, &mut heads, None, &misaligned, false)
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedChunk(_)));

        let bad_attr = line("b", NODE_A, "q");
        let c = chunk(node(3), HgOid::NULL, HgOid::NULL, &[(0, 0, &bad_attr)]);
        let mut fresh = ManifestStore::new(ManifestStrategy::TextRebuild);
        let err = fresh
            .store(&mut odb, &mut hg2git, &mut heads, None, &c, false)
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedChunk(_)));
    }

    /// The consistency check accepts a correctly named manifest and rejects
    /// a mangled node.
    #[test]
    fn test_round_trip_check() {
        let (_dir, mut odb, mut hg2git, mut heads) = setup();
        let mut store = ManifestStore::new(ManifestStrategy::TextRebuild);
        let data = line("a", NODE_A, "");
        let good_node = HgOid::from_revision(HgOid::NULL, HgOid::NULL, &data);
        let c = chunk(good_node, HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
        store
            .store(&mut odb, &mut hg2git, &mut heads, None, &c, true)
            .unwrap();

        let bad = chunk(node(9), HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
        let mut fresh = ManifestStore::new(ManifestStrategy::TextRebuild);
        let err = fresh
            .store(&mut odb, &mut hg2git, &mut heads, None, &bad, true)
            .unwrap_err();
        assert!(matches!(err, BridgeError::CheckFailed(_)));
    }

    /// Text regeneration matches the text the rebuild strategy maintains.
    #[test]
    fn test_generate_text_matches() {
        let (_dir, mut odb, mut hg2git, mut heads) = setup();
        let mut store = ManifestStore::new(ManifestStrategy::TextRebuild);
        let mut data = line("a/b", NODE_A, "");
        data.extend(line("a/c", NODE_A, "x"));
        data.extend(line("d", NODE_A, "l"));
        let c = chunk(node(1), HgOid::NULL, HgOid::NULL, &[(0, 0, &data)]);
        let commit_oid = store
            .store(&mut odb, &mut hg2git, &mut heads, None, &c, false)
            .unwrap();
        let commit = odb.read_commit(&commit_oid).unwrap();
        let mut mirror = MirrorTree::from_tree(&mut odb, commit.tree_id).unwrap();
        assert_eq!(mirror.generate_text(&mut odb).unwrap(), data);
    }
}
