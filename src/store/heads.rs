//! Sorted set of current head commits for one ref.
//!
//! Heads are kept strictly ascending by oid; adding a commit removes its
//! parents from the set, which keeps the set free of transitive ancestors
//! for the linear and merge shapes changegroups deliver. The set is seeded
//! lazily from the ref tip: every parent of the tip commit is a head, and
//! the serialized head list stays stable because of the sorted order.

use tracing::debug;

use crate::errors::BridgeError;
use crate::hash::GitOid;
use crate::internal::object::commit::Commit;
use crate::internal::object::types::ObjectType;
use crate::odb::Odb;

/// Sentinel first line of a manifest-heads tip whose first parent is a
/// flat-manifest marker rather than a real head.
pub const FLAT_MANIFEST_SENTINEL: &[u8] = b"has-flat-manifest-tree";

/// Head set for one ref (`changeset_heads` or `manifest_heads`).
pub struct HeadsSet {
    skip_sentinel_parent: bool,
    heads: Vec<GitOid>,
    initialized: bool,
}

impl HeadsSet {
    /// `skip_sentinel_parent` enables the flat-manifest-tree handling used
    /// by the manifest heads.
    pub fn new(skip_sentinel_parent: bool) -> HeadsSet {
        HeadsSet {
            skip_sentinel_parent,
            heads: Vec::new(),
            initialized: false,
        }
    }

    /// Whether the set has been seeded (by a lookup or an add) this session.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Seed the set from the ref tip commit: each of its parents is a head.
    pub fn ensure_initialized(
        &mut self,
        odb: &mut Odb,
        tip: Option<GitOid>,
    ) -> Result<(), BridgeError> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        let Some(tip) = tip else {
            return Ok(());
        };
        let commit = odb.read_commit(&tip)?;
        let mut parents = commit.parents;
        if self.skip_sentinel_parent
            && commit.body.starts_with(FLAT_MANIFEST_SENTINEL)
            && !parents.is_empty()
        {
            parents.remove(0);
        }
        for parent in parents {
            self.insert(parent);
        }
        debug!(heads = self.heads.len(), "heads set initialized");
        Ok(())
    }

    /// Add a commit as a head, removing any of its parents from the set.
    pub fn add(
        &mut self,
        odb: &mut Odb,
        tip: Option<GitOid>,
        oid: GitOid,
    ) -> Result<(), BridgeError> {
        self.ensure_initialized(odb, tip)?;
        let commit = odb.read_commit(&oid)?;
        for parent in &commit.parents {
            if let Ok(pos) = self.heads.binary_search(parent) {
                self.heads.remove(pos);
            }
        }
        self.insert(oid);
        Ok(())
    }

    fn insert(&mut self, oid: GitOid) {
        if let Err(pos) = self.heads.binary_search(&oid) {
            self.heads.insert(pos, oid);
        }
    }

    pub fn contains(&self, oid: &GitOid) -> bool {
        self.heads.binary_search(oid).is_ok()
    }

    /// The heads, strictly ascending.
    pub fn heads(&self) -> &[GitOid] {
        &self.heads
    }

    /// Write the head list out as a synthetic tip commit whose parents are
    /// the heads and whose body lists them one per line. Returns `None`
    /// when the set was never touched this session.
    pub fn write_tip(&mut self, odb: &mut Odb) -> Result<Option<GitOid>, BridgeError> {
        if !self.initialized {
            return Ok(None);
        }
        let tree = odb.ensure_empty_tree()?;
        let mut body = Vec::new();
        for (n, head) in self.heads.iter().enumerate() {
            if n > 0 {
                body.push(b'\n');
            }
            body.extend_from_slice(head.to_string().as_bytes());
        }
        let commit = Commit::synthetic(tree, self.heads.clone(), body);
        let oid = odb.write_object(ObjectType::Commit, &commit.to_data())?;
        Ok(Some(oid))
    }
}
