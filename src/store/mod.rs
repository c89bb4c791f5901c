//! The engine: one owned value holding every piece of session state the
//! import mutates — the object database with its in-progress pack, the
//! three notes trees, the two head sets, the last-file and last-manifest
//! caches, marks, refs and the shallow set. All entry points take the
//! engine explicitly; the single-threaded contract of the command stream is
//! what makes the unguarded mutation safe.

pub mod changeset;
pub mod file;
pub mod heads;
pub mod manifest;
pub mod notes;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use bstr::ByteSlice;
use tracing::debug;

use crate::changegroup::RevChunk;
use crate::errors::BridgeError;
use crate::hash::{GitOid, HgOid};
use crate::internal::object::commit::Commit;
use crate::internal::object::tree::TreeItemMode;
use crate::internal::object::types::ObjectType;
use crate::odb::Odb;
use crate::store::changeset::store_changeset;
use crate::store::file::FileStore;
use crate::store::heads::HeadsSet;
use crate::store::manifest::{ManifestStore, ManifestStrategy};
use crate::store::notes::NotesTree;

pub const REFS_PREFIX: &str = "refs/cinnabar/";
/// Metadata commit ref; managed by the outer driver, never written here.
pub const METADATA_REF: &str = "refs/cinnabar/metadata";
pub const NOTES_REF: &str = "refs/notes/cinnabar";
pub const HG2GIT_REF: &str = "refs/cinnabar/hg2git";
pub const FILES_META_REF: &str = "refs/cinnabar/files-meta";
pub const CHANGESETS_REF: &str = "refs/cinnabar/changesets";
pub const MANIFESTS_REF: &str = "refs/cinnabar/manifests";

const REFS_FILE: &str = "refs";
const SHALLOW_FILE: &str = "shallow";

/// Session configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_dir: PathBuf,
    /// Pack window size `W`; the tail window holds `W + 20` bytes.
    pub window_size: usize,
    pub max_delta_depth: u32,
    /// Re-encode stored manifests and verify their node round-trips.
    pub check_manifests: bool,
    pub manifest_strategy: ManifestStrategy,
}

impl Config {
    pub fn new(store_dir: impl Into<PathBuf>) -> Config {
        Config {
            store_dir: store_dir.into(),
            window_size: 1 << 20,
            max_delta_depth: 50,
            check_manifests: false,
            manifest_strategy: ManifestStrategy::default(),
        }
    }
}

/// Name → oid table persisted as a plain text file in the store directory.
pub struct RefTable {
    path: PathBuf,
    map: BTreeMap<String, GitOid>,
    dirty: bool,
}

impl RefTable {
    fn load(store_dir: &Path) -> Result<RefTable, BridgeError> {
        let path = store_dir.join(REFS_FILE);
        let mut map = BTreeMap::new();
        if path.exists() {
            for line in fs::read(&path)?.lines() {
                let mut fields = line.splitn(2, |&b| b == b' ');
                let (Some(hex), Some(name)) = (fields.next(), fields.next()) else {
                    return Err(BridgeError::InvalidObject(format!(
                        "ref line `{}`",
                        line.as_bstr()
                    )));
                };
                map.insert(
                    String::from_utf8_lossy(name).into_owned(),
                    GitOid::from_hex(hex)?,
                );
            }
        }
        Ok(RefTable {
            path,
            map,
            dirty: false,
        })
    }

    pub fn get(&self, name: &str) -> Option<GitOid> {
        self.map.get(name).copied()
    }

    pub fn set(&mut self, name: &str, oid: GitOid) {
        self.map.insert(name.to_string(), oid);
        self.dirty = true;
    }

    pub fn remove(&mut self, name: &str) {
        if self.map.remove(name).is_some() {
            self.dirty = true;
        }
    }

    fn save(&mut self) -> Result<(), BridgeError> {
        if !self.dirty {
            return Ok(());
        }
        let mut out = Vec::new();
        for (name, oid) in &self.map {
            writeln!(out, "{oid} {name}")?;
        }
        fs::write(&self.path, out)?;
        self.dirty = false;
        Ok(())
    }
}

/// The owned session context.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) odb: Odb,
    pub(crate) hg2git: NotesTree,
    pub(crate) git2hg: NotesTree,
    pub(crate) files_meta: NotesTree,
    pub(crate) changeset_heads: HeadsSet,
    pub(crate) manifest_heads: HeadsSet,
    pub(crate) files: FileStore,
    pub(crate) manifests: ManifestStore,
    pub(crate) refs: RefTable,
    pub(crate) marks: HashMap<u64, GitOid>,
    shallow: BTreeSet<GitOid>,
    shallow_converted: BTreeSet<GitOid>,
    pub(crate) update_shallow: bool,
    pub(crate) done_required: bool,
}

impl Engine {
    /// Open the store: scan finished packs, create the session pack, load
    /// refs and the shallow set, and seed the notes trees from their refs.
    pub fn open(config: Config) -> Result<Engine, BridgeError> {
        fs::create_dir_all(&config.store_dir)?;
        let mut odb = Odb::open(&config.store_dir, config.window_size, config.max_delta_depth)?;
        let refs = RefTable::load(&config.store_dir)?;

        let mut hg2git = NotesTree::new(TreeItemMode::Commit);
        let mut git2hg = NotesTree::new(TreeItemMode::Blob);
        let mut files_meta = NotesTree::new(TreeItemMode::Blob);
        for (ref_name, notes) in [
            (HG2GIT_REF, &mut hg2git),
            (NOTES_REF, &mut git2hg),
            (FILES_META_REF, &mut files_meta),
        ] {
            if let Some(tip) = refs.get(ref_name) {
                let commit = odb.read_commit(&tip)?;
                notes.reseed(Some(commit.tree_id));
            }
        }

        let shallow = load_shallow(&config.store_dir)?;
        let manifests = ManifestStore::new(config.manifest_strategy);
        debug!(store = %config.store_dir.display(), "engine opened");
        Ok(Engine {
            odb,
            hg2git,
            git2hg,
            files_meta,
            changeset_heads: HeadsSet::new(false),
            manifest_heads: HeadsSet::new(true),
            files: FileStore::new(),
            manifests,
            refs,
            marks: HashMap::new(),
            shallow,
            shallow_converted: BTreeSet::new(),
            update_shallow: false,
            done_required: false,
            config,
        })
    }

    /// Store one file revision chunk.
    pub fn store_file(&mut self, chunk: &RevChunk) -> Result<(), BridgeError> {
        self.files
            .store(&mut self.odb, &mut self.hg2git, &mut self.files_meta, chunk)
    }

    /// Store one manifest chunk, returning the emitted commit oid.
    pub fn store_manifest(&mut self, chunk: &RevChunk) -> Result<GitOid, BridgeError> {
        let tip = self.refs.get(MANIFESTS_REF);
        self.manifests.store(
            &mut self.odb,
            &mut self.hg2git,
            &mut self.manifest_heads,
            tip,
            chunk,
            self.config.check_manifests,
        )
    }

    /// Store a prepared changeset commit, resolving mapping conflicts.
    pub fn store_changeset(
        &mut self,
        node: HgOid,
        commit_data: &[u8],
    ) -> Result<GitOid, BridgeError> {
        let tip = self.refs.get(CHANGESETS_REF);
        let oid = store_changeset(
            &mut self.odb,
            &mut self.hg2git,
            &mut self.git2hg,
            &mut self.changeset_heads,
            tip,
            node,
            commit_data,
        )?;
        if self.shallow.contains(&oid) {
            self.shallow_converted.insert(oid);
        }
        Ok(oid)
    }

    /// Upsert (or remove, with `None`) one mapping for the `set` command.
    pub fn set_mapping(
        &mut self,
        kind: &str,
        node: HgOid,
        value: Option<GitOid>,
    ) -> Result<(), BridgeError> {
        let expected = match kind {
            "changeset" | "manifest" => ObjectType::Commit,
            "file" | "file-meta" | "changeset-metadata" => ObjectType::Blob,
            other => return Err(BridgeError::UnknownObjectKind(other.to_string())),
        };
        if let Some(oid) = value
            // Objects living outside this store (in the surrounding
            // repository) cannot be typed here and are accepted as-is.
            && self.odb.find_object(&oid).is_some()
        {
            let actual = self.odb.object_type(&oid)?;
            if actual != expected {
                return Err(BridgeError::ObjectTypeMismatch(format!(
                    "cannot bind {kind} {node} to {oid}, a {actual}"
                )));
            }
        }
        match kind {
            "changeset" | "manifest" | "file" => match value {
                Some(oid) => self.hg2git.put(&mut self.odb, *node.as_bytes(), oid),
                None => self.hg2git.remove(&mut self.odb, node.as_bytes()),
            },
            "file-meta" => match value {
                Some(oid) => self.files_meta.put(&mut self.odb, *node.as_bytes(), oid),
                None => self.files_meta.remove(&mut self.odb, node.as_bytes()),
            },
            "changeset-metadata" => {
                let commit_oid = self
                    .hg2git
                    .get(&mut self.odb, node.as_bytes())?
                    .ok_or_else(|| BridgeError::ObjectNotFound(node.to_string()))?;
                match value {
                    Some(oid) => self.git2hg.put(&mut self.odb, *commit_oid.as_bytes(), oid),
                    None => self.git2hg.remove(&mut self.odb, commit_oid.as_bytes()),
                }
            }
            _ => unreachable!("kind validated above"),
        }
    }

    /// Flush one notes tree by command name, returning its root tree oid.
    pub fn flush_notes(&mut self, kind: &str) -> Result<GitOid, BridgeError> {
        match kind {
            "hg2git" => self.hg2git.flush(&mut self.odb),
            "git2hg" => self.git2hg.flush(&mut self.odb),
            "files-meta" => self.files_meta.flush(&mut self.odb),
            other => Err(BridgeError::UnknownObjectKind(other.to_string())),
        }
    }

    /// Resolve the `:h<40-hex>[:<path>]` reference syntax: look the node up
    /// in `hg2git` and optionally descend to the tree at `path` within the
    /// mapped object, falling back to the empty tree when absent. The
    /// result also lands in the fixed mark slot 2.
    pub fn resolve_hg_ref(
        &mut self,
        node: HgOid,
        path: Option<&[u8]>,
    ) -> Result<GitOid, BridgeError> {
        let mapped = self
            .hg2git
            .get(&mut self.odb, node.as_bytes())?
            .ok_or_else(|| BridgeError::ObjectNotFound(node.to_string()))?;
        let resolved = match path {
            None => mapped,
            Some(path) => {
                let mut current = match self.odb.object_type(&mapped)? {
                    ObjectType::Commit => self.odb.read_commit(&mapped)?.tree_id,
                    ObjectType::Tree => mapped,
                    other => {
                        return Err(BridgeError::ObjectTypeMismatch(format!(
                            "cannot resolve a path within {mapped}, a {other}"
                        )));
                    }
                };
                let mut found = true;
                for component in path.split(|&b| b == b'/') {
                    let tree = self.odb.read_tree(&current)?;
                    let mut prefixed = Vec::with_capacity(component.len() + 1);
                    prefixed.push(b'_');
                    prefixed.extend_from_slice(component);
                    let entry = tree
                        .entry(component.as_bstr())
                        .or_else(|| tree.entry(prefixed.as_bstr()));
                    match entry {
                        Some(item) => current = item.oid,
                        None => {
                            found = false;
                            break;
                        }
                    }
                }
                if found {
                    current
                } else {
                    self.odb.ensure_empty_tree()?
                }
            }
        };
        self.marks.insert(2, resolved);
        Ok(resolved)
    }

    /// Set a ref; the sentinel notes refs additionally reseed their tree
    /// from the newly pointed-at commit.
    pub fn set_ref(&mut self, name: &str, value: Option<GitOid>) -> Result<(), BridgeError> {
        match value {
            Some(oid) => self.refs.set(name, oid),
            None => self.refs.remove(name),
        }
        let notes = match name {
            HG2GIT_REF => Some(&mut self.hg2git),
            NOTES_REF => Some(&mut self.git2hg),
            FILES_META_REF => Some(&mut self.files_meta),
            _ => None,
        };
        if let Some(notes) = notes {
            let root = match value {
                Some(oid) => Some(self.odb.read_commit(&oid)?.tree_id),
                None => None,
            };
            notes.reseed(root);
            debug!(ref_name = name, "notes tree reseeded");
        }
        Ok(())
    }

    /// Finish the session: flush dirty notes trees behind their refs, write
    /// the head tips, drop caches, finalize the pack, and persist refs and
    /// the shallow file.
    pub fn finish(&mut self) -> Result<(), BridgeError> {
        for (ref_name, notes) in [
            (HG2GIT_REF, &mut self.hg2git),
            (NOTES_REF, &mut self.git2hg),
            (FILES_META_REF, &mut self.files_meta),
        ] {
            if notes.is_dirty() {
                let root = notes.flush(&mut self.odb)?;
                let commit = Commit::synthetic(root, vec![], "");
                let oid = self
                    .odb
                    .write_object(ObjectType::Commit, &commit.to_data())?;
                self.refs.set(ref_name, oid);
            }
        }
        if let Some(tip) = self.changeset_heads.write_tip(&mut self.odb)? {
            self.refs.set(CHANGESETS_REF, tip);
        }
        if let Some(tip) = self.manifest_heads.write_tip(&mut self.odb)? {
            self.refs.set(MANIFESTS_REF, tip);
        }
        self.files.release();
        self.manifests.release();
        self.odb.finalize()?;
        self.refs.save()?;
        if self.update_shallow && !self.shallow_converted.is_empty() {
            let mut out = Vec::new();
            for oid in self.shallow.difference(&self.shallow_converted) {
                writeln!(out, "{oid}")?;
            }
            fs::write(self.config.store_dir.join(SHALLOW_FILE), out)?;
        }
        Ok(())
    }

    // Inspection surface, mostly for embedders and tests.

    pub fn hg_to_git(&mut self, node: HgOid) -> Result<Option<GitOid>, BridgeError> {
        self.hg2git.get(&mut self.odb, node.as_bytes())
    }

    pub fn git_to_hg(&mut self, oid: GitOid) -> Result<Option<HgOid>, BridgeError> {
        match self.git2hg.get(&mut self.odb, oid.as_bytes())? {
            Some(metadata_oid) => {
                let metadata = self.odb.read_blob(&metadata_oid)?;
                Ok(Some(changeset::metadata_changeset(&metadata)?))
            }
            None => Ok(None),
        }
    }

    pub fn read_object(&mut self, oid: GitOid) -> Result<(ObjectType, Vec<u8>), BridgeError> {
        self.odb.unpack_entry(&oid)
    }

    pub fn ref_value(&self, name: &str) -> Option<GitOid> {
        self.refs.get(name)
    }

    pub fn object_count(&self) -> u32 {
        self.odb.object_count()
    }

    pub fn manifest_heads_snapshot(&mut self) -> Result<Vec<GitOid>, BridgeError> {
        let tip = self.refs.get(MANIFESTS_REF);
        self.manifest_heads
            .ensure_initialized(&mut self.odb, tip)?;
        Ok(self.manifest_heads.heads().to_vec())
    }

    pub fn changeset_heads_snapshot(&mut self) -> Result<Vec<GitOid>, BridgeError> {
        let tip = self.refs.get(CHANGESETS_REF);
        self.changeset_heads
            .ensure_initialized(&mut self.odb, tip)?;
        Ok(self.changeset_heads.heads().to_vec())
    }
}

fn load_shallow(store_dir: &Path) -> Result<BTreeSet<GitOid>, BridgeError> {
    let path = store_dir.join(SHALLOW_FILE);
    let mut set = BTreeSet::new();
    if path.exists() {
        for line in fs::read(&path)?.lines() {
            if !line.is_empty() {
                set.insert(GitOid::from_hex(line)?);
            }
        }
    }
    Ok(set)
}
