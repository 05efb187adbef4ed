//! Commit headers: the root tree and the parent commits.
//!
//! A commit payload starts with `tree <id>` followed by zero or more `parent <id>` lines, then
//! author/committer and free-form headers, a blank line, and the message. Only the first two
//! header groups matter for reachability.

use bstr::ByteSlice;

use crate::{
    errors::GitError,
    hash::{HashKind, ObjectId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLinks {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    /// Committer timestamp in seconds, used to order history walks.
    pub committer_time: i64,
}

impl CommitLinks {
    pub fn parse(hash: HashKind, data: &[u8]) -> Result<CommitLinks, GitError> {
        let mut tree = None;
        let mut parents = Vec::new();
        let mut committer_time = 0;

        for line in data.lines() {
            if line.is_empty() {
                break;
            }
            if let Some(rest) = line.strip_prefix(b"tree ") {
                tree = Some(parse_id(hash, rest)?);
            } else if let Some(rest) = line.strip_prefix(b"parent ") {
                parents.push(parse_id(hash, rest)?);
            } else if let Some(rest) = line.strip_prefix(b"committer ") {
                committer_time = parse_signature_time(rest);
            }
        }

        let tree = tree
            .ok_or_else(|| GitError::InvalidCommitObject("missing tree header".to_string()))?;
        Ok(CommitLinks {
            tree,
            parents,
            committer_time,
        })
    }
}

fn parse_id(hash: HashKind, raw: &[u8]) -> Result<ObjectId, GitError> {
    let text = raw
        .to_str()
        .map_err(|_| GitError::InvalidCommitObject("non-utf8 object id".to_string()))?;
    ObjectId::from_hex(hash, text.trim()).map_err(GitError::InvalidCommitObject)
}

/// `Name <email> 1700000000 +0800` -> 1700000000
fn parse_signature_time(sig: &[u8]) -> i64 {
    let Some(end) = sig.rfind_byte(b'>') else {
        return 0;
    };
    sig[end + 1..]
        .fields()
        .next()
        .and_then(|t| t.to_str().ok())
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}
