//! Object type enumeration shared by the object model and the pack
//! encoder/decoder.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::BridgeError;

/// In Git, each object type is assigned a unique integer value which
/// identifies it inside pack entry headers.
///
/// * `Commit` (1), `Tree` (2), `Blob` (3), `Tag` (4): base objects.
/// * `OffsetDelta` (6): delta stored against a base addressed by pack offset.
/// * `HashDelta` (7): delta stored against a base addressed by object id.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
    OffsetDelta = 6,
    HashDelta = 7,
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectType::Commit => write!(f, "commit"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Blob => write!(f, "blob"),
            ObjectType::Tag => write!(f, "tag"),
            ObjectType::OffsetDelta => write!(f, "OffsetDelta"),
            ObjectType::HashDelta => write!(f, "HashDelta"),
        }
    }
}

impl ObjectType {
    /// Header bytes used when hashing a base object (`commit`, `tree`, ...).
    /// Delta types never appear in an object header.
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Commit => b"commit",
            ObjectType::Tree => b"tree",
            ObjectType::Blob => b"blob",
            ObjectType::Tag => b"tag",
            ObjectType::OffsetDelta | ObjectType::HashDelta => {
                unreachable!("delta types have no object header")
            }
        }
    }

    /// Parse a type name as used by command arguments.
    pub fn from_string(s: &str) -> Result<ObjectType, BridgeError> {
        match s {
            "commit" => Ok(ObjectType::Commit),
            "tree" => Ok(ObjectType::Tree),
            "blob" => Ok(ObjectType::Blob),
            "tag" => Ok(ObjectType::Tag),
            _ => Err(BridgeError::UnknownObjectKind(s.to_string())),
        }
    }

    /// Convert to the 3-bit pack header type id.
    pub fn to_u8(&self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
            ObjectType::OffsetDelta => 6,
            ObjectType::HashDelta => 7,
        }
    }

    /// Decode a 3-bit pack header type id.
    pub fn from_u8(number: u8) -> Result<ObjectType, BridgeError> {
        match number {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::Tag),
            6 => Ok(ObjectType::OffsetDelta),
            7 => Ok(ObjectType::HashDelta),
            _ => Err(BridgeError::InvalidPack(format!(
                "invalid pack object type number: {number}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pack type ids round-trip for all encodable types.
    #[test]
    fn test_pack_type_round_trip() {
        for ty in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::Tag,
            ObjectType::OffsetDelta,
            ObjectType::HashDelta,
        ] {
            assert_eq!(ObjectType::from_u8(ty.to_u8()).unwrap(), ty);
        }
    }

    /// Type number 5 is reserved and must be rejected.
    #[test]
    fn test_reserved_type_number() {
        assert!(ObjectType::from_u8(5).is_err());
        assert!(ObjectType::from_u8(0).is_err());
    }

    /// Parsing a type name only accepts the base object names.
    #[test]
    fn test_from_string() {
        assert_eq!(ObjectType::from_string("blob").unwrap(), ObjectType::Blob);
        assert_eq!(
            ObjectType::from_string("commit").unwrap(),
            ObjectType::Commit
        );
        assert!(ObjectType::from_string("delta").is_err());
    }
}
