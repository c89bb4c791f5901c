//! The Blob object stores raw file content. In this crate blobs carry the
//! reconstructed contents of Mercurial file revisions (metadata prefix
//! stripped) and the small metadata payloads recorded next to them.

use std::fmt::Display;

use crate::hash::GitOid;
use crate::internal::object::types::ObjectType;

/// A blob: an object id plus its raw content bytes.
#[derive(Debug, Clone)]
pub struct Blob {
    pub id: GitOid,
    pub data: Vec<u8>,
}

/// Summary line in the `cat-blob` shape: `<id> blob <size>`.
impl Display for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} blob {}", self.id, self.data.len())
    }
}

impl Blob {
    /// Build a blob from content, computing its id.
    pub fn from_content(data: &[u8]) -> Blob {
        Blob {
            id: GitOid::from_type_and_data(ObjectType::Blob, data),
            data: data.to_vec(),
        }
    }
}
