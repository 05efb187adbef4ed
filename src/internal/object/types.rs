//! Object type enumeration shared by the pack and store layers.

use std::fmt::{self, Display};

use crate::errors::GitError;

/// In Git, each object type is assigned a unique integer value, which is used to identify the
/// type of the object inside a pack entry header.
///
/// * `Commit` (1), `Tree` (2), `Blob` (3), `Tag` (4) are whole objects.
/// * Values 6 (offset delta) and 7 (reference delta) only appear in pack entries and are
///   resolved to one of the four kinds above while decoding, so they are not variants here.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, PartialOrd, Ord)]
pub enum ObjectKind {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
}

const COMMIT_OBJECT_TYPE: &[u8] = b"commit";
const TREE_OBJECT_TYPE: &[u8] = b"tree";
const BLOB_OBJECT_TYPE: &[u8] = b"blob";
const TAG_OBJECT_TYPE: &[u8] = b"tag";

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectKind::Blob => write!(f, "blob"),
            ObjectKind::Tree => write!(f, "tree"),
            ObjectKind::Commit => write!(f, "commit"),
            ObjectKind::Tag => write!(f, "tag"),
        }
    }
}

impl ObjectKind {
    /// 3-bit type id used in pack entry headers.
    pub fn to_pack_type_u8(&self) -> u8 {
        *self as u8
    }

    /// Decode a pack entry type id. Delta ids are handled by the pack reader before this.
    pub fn from_pack_type_u8(number: u8) -> Result<ObjectKind, GitError> {
        match number {
            1 => Ok(ObjectKind::Commit),
            2 => Ok(ObjectKind::Tree),
            3 => Ok(ObjectKind::Blob),
            4 => Ok(ObjectKind::Tag),
            _ => Err(GitError::InvalidObjectType(format!(
                "Invalid pack object type number: {number}"
            ))),
        }
    }

    /// Name used in loose object headers and object id computation.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            ObjectKind::Commit => COMMIT_OBJECT_TYPE,
            ObjectKind::Tree => TREE_OBJECT_TYPE,
            ObjectKind::Blob => BLOB_OBJECT_TYPE,
            ObjectKind::Tag => TAG_OBJECT_TYPE,
        }
    }

    /// Parses a string representation of a Git object type.
    pub fn from_string(s: &str) -> Result<ObjectKind, GitError> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            "tag" => Ok(ObjectKind::Tag),
            _ => Err(GitError::InvalidObjectType(s.to_string())),
        }
    }
}
