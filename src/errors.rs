//! Error types for the hg-bridge crate.
//!
//! This module defines the unified error enumeration used across chunk
//! decoding, delta application, pack encoding/decoding, notes handling, and
//! the command loop. It integrates with `thiserror` to provide rich
//! `Display` implementations and error source chaining where applicable.
//!
//! Every error is fatal to the session: the caller is expected to print a
//! single `fatal: <message>` line on stderr and discard the partial pack.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the hg-bridge library.
///
/// - Used across revision-chunk decoding, manifest/file reconstruction,
///   pack encode/decode, notes trees and the command surface.
/// - Implements `std::error::Error` via `thiserror`.
pub enum BridgeError {
    /// Revision chunk with out-of-order or out-of-bounds diffs, manifest
    /// diffs not aligned on line boundaries, or a bad manifest attr byte.
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// A chunk references a Mercurial node with no `hg2git` mapping.
    #[error("unknown delta parent {0}")]
    UnknownDeltaParent(String),

    /// `set` or `store` received a kind string it does not recognize.
    #[error("unknown object kind `{0}`")]
    UnknownObjectKind(String),

    /// An expected-hex field failed to decode.
    #[error("invalid sha1 `{0}`")]
    InvalidSha(String),

    /// A mapping would bind a Mercurial id to a Git object of the wrong type.
    #[error("object type mismatch: {0}")]
    ObjectTypeMismatch(String),

    /// Wrong argument arity, missing required command, bad framing.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Object missing from the in-progress pack and every finished pack.
    #[error("cannot find object {0}")]
    ObjectNotFound(String),

    /// Malformed tree, commit or blob encountered while parsing stored data.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Malformed or unsupported pack or pack index file.
    #[error("invalid pack: {0}")]
    InvalidPack(String),

    /// Delta stream reconstruction error.
    #[error("delta error: {0}")]
    DeltaError(String),

    /// A stored object failed its Mercurial round-trip consistency check.
    #[error("consistency check failed: {0}")]
    CheckFailed(String),

    /// I/O error from the underlying reader, writer or pack file.
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}
