//! Tree entries: `<octal mode> SP <name> NUL <raw id>` repeated.

use bstr::ByteSlice;

use crate::{
    errors::GitError,
    hash::{HashKind, ObjectId},
    internal::object::ObjectKind,
};

const MODE_TREE: &[u8] = b"40000";
const MODE_GITLINK: &[u8] = b"160000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: Vec<u8>,
    pub name: Vec<u8>,
    pub id: ObjectId,
}

impl TreeEntry {
    /// Kind of object the entry names, `None` for submodule commits.
    pub fn kind(&self) -> Option<ObjectKind> {
        match self.mode.as_slice() {
            MODE_GITLINK => None,
            MODE_TREE => Some(ObjectKind::Tree),
            _ => Some(ObjectKind::Blob),
        }
    }
}

pub fn parse_entries(hash: HashKind, mut data: &[u8]) -> Result<Vec<TreeEntry>, GitError> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let space = data
            .find_byte(b' ')
            .ok_or_else(|| GitError::InvalidTreeObject("entry without mode".to_string()))?;
        let mode = data[..space].to_vec();
        data = &data[space + 1..];

        let nul = data
            .find_byte(0)
            .ok_or_else(|| GitError::InvalidTreeObject("entry without name".to_string()))?;
        let name = data[..nul].to_vec();
        data = &data[nul + 1..];

        if data.len() < hash.size() {
            return Err(GitError::InvalidTreeObject(format!(
                "truncated id for `{}`",
                name.as_bstr()
            )));
        }
        let id = ObjectId::from_bytes(hash, &data[..hash.size()])
            .map_err(GitError::InvalidTreeObject)?;
        data = &data[hash.size()..];

        entries.push(TreeEntry { mode, name, id });
    }
    Ok(entries)
}

/// Serialize entries in the order given. Callers are responsible for git's name ordering.
pub fn encode_entries(entries: &[TreeEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(&entry.mode);
        out.push(b' ');
        out.extend_from_slice(&entry.name);
        out.push(0);
        out.extend_from_slice(entry.id.as_ref());
    }
    out
}
