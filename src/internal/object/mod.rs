//! Git object kinds and the link structure the negotiation engine walks.
//!
//! The gateway never rewrites objects, it only needs to know which other objects a commit, tree
//! or tag points at. Each submodule parses exactly that much of its object's payload.

pub mod commit;
pub mod tag;
pub mod tree;
pub mod types;

pub use types::ObjectKind;

use crate::{errors::GitError, hash::ObjectId};

/// A fully materialised object: kind, payload and its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub data: Vec<u8>,
}

impl RawObject {
    /// Name `data` as an object of `kind` in the given hash format.
    pub fn new(hash: crate::hash::HashKind, kind: ObjectKind, data: Vec<u8>) -> Self {
        let id = ObjectId::from_type_and_data(hash, kind, &data);
        Self { id, kind, data }
    }

    /// Objects this one references directly, tagged with the kind they are expected to have.
    ///
    /// Blobs reference nothing. Tree entries for submodules (gitlinks) are skipped since they
    /// name commits in another repository.
    pub fn links(&self) -> Result<Vec<(ObjectId, ObjectKind)>, GitError> {
        let hash = self.id.kind();
        match self.kind {
            ObjectKind::Blob => Ok(Vec::new()),
            ObjectKind::Commit => {
                let commit = commit::CommitLinks::parse(hash, &self.data)?;
                let mut out = Vec::with_capacity(commit.parents.len() + 1);
                out.push((commit.tree, ObjectKind::Tree));
                out.extend(commit.parents.into_iter().map(|p| (p, ObjectKind::Commit)));
                Ok(out)
            }
            ObjectKind::Tree => Ok(tree::parse_entries(hash, &self.data)?
                .into_iter()
                .filter_map(|entry| entry.kind().map(|kind| (entry.id, kind)))
                .collect()),
            ObjectKind::Tag => {
                let tag = tag::TagTarget::parse(hash, &self.data)?;
                Ok(vec![(tag.object, tag.kind)])
            }
        }
    }
}
