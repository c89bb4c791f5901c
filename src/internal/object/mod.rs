//! Object model definitions for the Git blobs, trees and commits the bridge
//! emits, plus the type enumeration shared with the pack layer.
//!
//! Only the object kinds the import path produces are modeled here. Trees
//! carry the three gitlink-with-permission modes used to embed Mercurial
//! node ids into Git trees; commits are kept as raw header/body bytes
//! because the emitted byte sequences are identity-bearing.

pub mod blob;
pub mod commit;
pub mod tree;
pub mod types;

pub use types::ObjectType;
