//! Backing repository store.
//!
//! The protocol engine only talks to a repository through [`RepositoryStore`]: ref enumeration,
//! object lookup and storage, and a compare-and-swap ref update. Two implementations ship with
//! the crate: [`memory::MemoryStore`] for tests and embedders, and [`fs::FsStore`] for ordinary
//! git directories on disk. Reachability walks built on top of the trait live in [`walk`].

pub mod fs;
pub mod memory;
pub mod walk;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    errors::GitError,
    hash::{HashKind, ObjectId},
    internal::object::RawObject,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// The ref's current value did not match the caller's expectation.
    #[error("stale info for `{0}`")]
    StaleRef(String),

    #[error("invalid ref name `{0}`")]
    InvalidRefName(String),

    #[error("corrupt repository: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Object(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where `HEAD` points.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Head {
    /// Target ref when `HEAD` is symbolic.
    pub symref: Option<String>,
    /// Resolved id, `None` for an unborn branch.
    pub id: Option<ObjectId>,
}

/// Storage operations the protocol engine depends on.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    /// Object format of the repository.
    fn hash_kind(&self) -> HashKind;

    /// All refs except `HEAD`, in a stable order.
    async fn refs(&self) -> Result<Vec<(String, ObjectId)>, StoreError>;

    async fn head(&self) -> Result<Head, StoreError>;

    async fn has_object(&self, id: &ObjectId) -> Result<bool, StoreError>;

    /// Read an object, failing with [`StoreError::ObjectNotFound`] if it is absent.
    async fn read_object(&self, id: &ObjectId) -> Result<RawObject, StoreError>;

    /// Persist objects. Already present objects are skipped.
    async fn write_objects(&self, objects: Vec<RawObject>) -> Result<(), StoreError>;

    /// Atomically move `name` from `expected` to `new`.
    ///
    /// `expected == None` requires the ref to be absent, `new == None` deletes it. Fails with
    /// [`StoreError::StaleRef`] when the current value differs from `expected`.
    async fn update_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<(), StoreError>;

    /// [`Self::read_object`] that maps absence to `None`.
    async fn try_read_object(&self, id: &ObjectId) -> Result<Option<RawObject>, StoreError> {
        match self.read_object(id).await {
            Ok(object) => Ok(Some(object)),
            Err(StoreError::ObjectNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Subset of `git check-ref-format` rules that matter for pushed ref names.
pub fn is_valid_ref_name(name: &str) -> bool {
    if !name.starts_with("refs/") || name.ends_with('/') || name.ends_with('.') {
        return false;
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return false;
    }
    if name
        .bytes()
        .any(|b| b < 0x20 || b == 0x7f || b" ~^:?*[\\".contains(&b))
    {
        return false;
    }
    name.split('/')
        .all(|part| !part.is_empty() && !part.starts_with('.') && !part.ends_with(".lock"))
}

#[cfg(test)]
mod tests {
    use super::is_valid_ref_name;

    #[test]
    fn ref_name_rules() {
        assert!(is_valid_ref_name("refs/heads/main"));
        assert!(is_valid_ref_name("refs/tags/v1.0"));
        assert!(is_valid_ref_name("refs/heads/feature/x-1"));
        assert!(!is_valid_ref_name("HEAD"));
        assert!(!is_valid_ref_name("refs/heads/../config"));
        assert!(!is_valid_ref_name("refs/heads/a b"));
        assert!(!is_valid_ref_name("refs/heads/x.lock"));
        assert!(!is_valid_ref_name("refs/heads/.hidden"));
        assert!(!is_valid_ref_name("refs/heads/"));
        assert!(!is_valid_ref_name("refs/heads/a@{1}"));
    }
}
