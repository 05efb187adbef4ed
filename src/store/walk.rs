//! Object-graph walks over a [`RepositoryStore`].
//!
//! - [`shallow_boundary`] finds where a `deepen N` request cuts history.
//! - [`collect_objects`] gathers everything reachable from the wants that the client does not
//!   already have, bounded by the common commits and any shallow boundary.
//! - [`is_ancestor`] answers fast-forward questions for ref updates.

use std::collections::{HashSet, VecDeque};

use super::{RepositoryStore, StoreError};
use crate::{
    hash::ObjectId,
    internal::object::{ObjectKind, RawObject, commit::CommitLinks, tag::TagTarget},
};

/// Result of applying a depth limit to the wants.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShallowUpdate {
    /// Commits whose parents will be missing on the client after this fetch.
    pub shallow: Vec<ObjectId>,
    /// Previously shallow client commits that now get their parents.
    pub unshallow: Vec<ObjectId>,
}

async fn read_commit<S: RepositoryStore + ?Sized>(
    store: &S,
    id: &ObjectId,
) -> Result<Option<CommitLinks>, StoreError> {
    let Some(object) = store.try_read_object(id).await? else {
        return Ok(None);
    };
    if object.kind != ObjectKind::Commit {
        return Ok(None);
    }
    Ok(Some(CommitLinks::parse(store.hash_kind(), &object.data)?))
}

/// Peel annotated tags until a non-tag object is reached.
async fn peel<S: RepositoryStore + ?Sized>(
    store: &S,
    id: &ObjectId,
) -> Result<Option<(ObjectId, ObjectKind)>, StoreError> {
    let mut current = *id;
    for _ in 0..32 {
        let Some(object) = store.try_read_object(&current).await? else {
            return Ok(None);
        };
        if object.kind != ObjectKind::Tag {
            return Ok(Some((current, object.kind)));
        }
        current = TagTarget::parse(store.hash_kind(), &object.data)?.object;
    }
    Ok(None)
}

/// Walk `depth` commits down from each want.
///
/// A commit reached at the last allowed level that has parents becomes a shallow boundary.
/// Client-side shallow commits that end up strictly inside the new window are reported as
/// unshallow; those that stay on the boundary are not repeated.
pub async fn shallow_boundary<S: RepositoryStore + ?Sized>(
    store: &S,
    wants: &[ObjectId],
    depth: u32,
    client_shallow: &HashSet<ObjectId>,
) -> Result<ShallowUpdate, StoreError> {
    let mut update = ShallowUpdate::default();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    for want in wants {
        if let Some((commit, ObjectKind::Commit)) = peel(store, want).await? {
            if seen.insert(commit) {
                queue.push_back((commit, 1u32));
            }
        }
    }

    while let Some((id, level)) = queue.pop_front() {
        let Some(commit) = read_commit(store, &id).await? else {
            continue;
        };
        if level >= depth {
            if !commit.parents.is_empty() && !client_shallow.contains(&id) {
                update.shallow.push(id);
            }
            continue;
        }
        if client_shallow.contains(&id) {
            update.unshallow.push(id);
        }
        for parent in commit.parents {
            if seen.insert(parent) {
                queue.push_back((parent, level + 1));
            }
        }
    }
    Ok(update)
}

/// Inputs for [`collect_objects`].
#[derive(Debug, Default, Clone)]
pub struct WalkRequest {
    pub wants: Vec<ObjectId>,
    /// Objects the client has, already filtered to ones the store knows.
    pub haves: Vec<ObjectId>,
    /// Commits whose parents must not be followed (client shallow commits and new boundaries).
    pub shallow: HashSet<ObjectId>,
    /// Every shallow commit the client announced, including those now being deepened. The
    /// client has none of their ancestors.
    pub client_shallow: HashSet<ObjectId>,
    /// Client shallow commits being deepened: not sent, but their parents are.
    pub unshallow: HashSet<ObjectId>,
    /// Also send annotated tags that point at sent objects.
    pub include_tags: bool,
    /// Candidate tag refs for `include_tags`.
    pub tag_refs: Vec<ObjectId>,
}

/// Every object reachable from the wants minus what is reachable from the haves.
///
/// Commits come first in walk order, then trees and blobs; each object appears at most once.
pub async fn collect_objects<S: RepositoryStore + ?Sized>(
    store: &S,
    request: &WalkRequest,
) -> Result<Vec<RawObject>, StoreError> {
    // Commits the client has: ancestors of the haves, stopping at its shallow commits.
    let mut common: HashSet<ObjectId> = HashSet::new();
    let mut queue: VecDeque<ObjectId> = VecDeque::new();
    for have in &request.haves {
        if let Some((commit, ObjectKind::Commit)) = peel(store, have).await? {
            if common.insert(commit) {
                queue.push_back(commit);
            }
        }
    }
    while let Some(id) = queue.pop_front() {
        if request.shallow.contains(&id) || request.client_shallow.contains(&id) {
            continue;
        }
        let Some(commit) = read_commit(store, &id).await? else {
            continue;
        };
        for parent in commit.parents {
            if common.insert(parent) {
                queue.push_back(parent);
            }
        }
    }

    let mut sent: HashSet<ObjectId> = HashSet::new();
    let mut commits = Vec::new();
    let mut others = Vec::new();
    let mut roots: Vec<(ObjectId, ObjectKind)> = Vec::new();
    let mut edges: HashSet<ObjectId> = HashSet::new();

    // Tags and non-commit wants first, then the commit walk.
    let mut commit_queue: VecDeque<ObjectId> = VecDeque::new();
    for want in &request.wants {
        let mut current = *want;
        loop {
            let Some(object) = store.try_read_object(&current).await? else {
                return Err(StoreError::ObjectNotFound(current));
            };
            match object.kind {
                ObjectKind::Tag => {
                    let target = TagTarget::parse(store.hash_kind(), &object.data)?.object;
                    if sent.insert(object.id) {
                        others.push(object);
                    }
                    current = target;
                }
                ObjectKind::Commit => {
                    if !common.contains(&current) || request.unshallow.contains(&current) {
                        commit_queue.push_back(current);
                    }
                    break;
                }
                ObjectKind::Tree | ObjectKind::Blob => {
                    roots.push((current, object.kind));
                    break;
                }
            }
        }
    }

    let mut walked: HashSet<ObjectId> = HashSet::new();
    while let Some(id) = commit_queue.pop_front() {
        if !walked.insert(id) {
            continue;
        }
        let object = store.read_object(&id).await?;
        let links = CommitLinks::parse(store.hash_kind(), &object.data)?;
        let deepening = request.unshallow.contains(&id);
        if deepening {
            // already on the client, only its history is new
            edges.insert(id);
        } else {
            roots.push((links.tree, ObjectKind::Tree));
            if sent.insert(id) {
                commits.push(object);
            }
        }
        if request.shallow.contains(&id) && !deepening {
            continue;
        }
        for parent in links.parents {
            if common.contains(&parent) && !request.unshallow.contains(&parent) {
                edges.insert(parent);
            } else {
                commit_queue.push_back(parent);
            }
        }
    }

    // Trees and blobs of the edge commits are on the client already.
    let mut excluded: HashSet<ObjectId> = HashSet::new();
    let mut edge_trees = Vec::new();
    for edge in &edges {
        if let Some(commit) = read_commit(store, edge).await? {
            edge_trees.push(commit.tree);
        }
    }
    while let Some(tree_id) = edge_trees.pop() {
        if !excluded.insert(tree_id) {
            continue;
        }
        let Some(object) = store.try_read_object(&tree_id).await? else {
            continue;
        };
        for (child, kind) in object.links()? {
            if kind == ObjectKind::Tree {
                edge_trees.push(child);
            } else {
                excluded.insert(child);
            }
        }
    }

    let mut pending: Vec<(ObjectId, ObjectKind)> = roots;
    pending.reverse();
    while let Some((id, kind)) = pending.pop() {
        if excluded.contains(&id) || sent.contains(&id) {
            continue;
        }
        let object = store.read_object(&id).await?;
        if object.kind != kind {
            return Err(StoreError::Corrupt(format!(
                "object {id} is a {} but was referenced as a {kind}",
                object.kind
            )));
        }
        if kind == ObjectKind::Tree {
            let mut children = object.links()?;
            children.reverse();
            pending.extend(children);
        }
        sent.insert(id);
        others.push(object);
    }

    if request.include_tags {
        for tag_id in &request.tag_refs {
            if sent.contains(tag_id) {
                continue;
            }
            let Some(object) = store.try_read_object(tag_id).await? else {
                continue;
            };
            if object.kind != ObjectKind::Tag {
                continue;
            }
            let target = TagTarget::parse(store.hash_kind(), &object.data)?.object;
            if sent.contains(&target) {
                sent.insert(*tag_id);
                others.push(object);
            }
        }
    }

    commits.extend(others);
    Ok(commits)
}

/// Whether `ancestor` is reachable from `descendant` through parent links.
pub async fn is_ancestor<S: RepositoryStore + ?Sized>(
    store: &S,
    ancestor: &ObjectId,
    descendant: &ObjectId,
) -> Result<bool, StoreError> {
    let Some((target, ObjectKind::Commit)) = peel(store, ancestor).await? else {
        return Ok(false);
    };
    let Some((start, ObjectKind::Commit)) = peel(store, descendant).await? else {
        return Ok(false);
    };
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        if id == target {
            return Ok(true);
        }
        let Some(commit) = read_commit(store, &id).await? else {
            continue;
        };
        for parent in commit.parents {
            if seen.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(false)
}
