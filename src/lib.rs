//! hg-bridge is the object-storage core of a Mercurial→Git bridge: it
//! ingests changegroup revision chunks, reconstructs full file and manifest
//! contents from their delta chains, writes the equivalent Git objects into
//! one growing packfile, and maintains the bidirectional `hg2git`/`git2hg`
//! identity mappings that let a Git repository proxy a Mercurial one.
//!
//! The entry point is [`store::Engine`], which owns every piece of session
//! state, driven by [`commands::run`] over a fast-import-style command
//! stream.

pub mod changegroup;
pub mod commands;
pub mod errors;
pub mod hash;
pub mod internal;
pub mod odb;
pub mod store;
pub mod utils;

mod delta;

pub use errors::BridgeError;
pub use hash::{GitOid, HgOid};
pub use store::{Config, Engine};
