//! Maps client-supplied repository names onto git directories under the scan root.
//!
//! A name is accepted only if every component is a plain path segment: no `..`, no `.`, no
//! absolute prefix, no backslashes or NUL bytes. The candidate directories are then
//! canonicalised and must still sit under the canonical root, so symlinks cannot leak out
//! either. Resolution tries, in order, `<name>/.git` (work tree), `<name>` (bare) and
//! `<name>.git` (bare, suffix omitted by the client).

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid repository name `{0}`")]
    Invalid(String),

    #[error("repository `{0}` is outside the scan root")]
    Escape(String),

    #[error("repository `{0}` not found")]
    NotFound(String),
}

/// A validated repository location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    /// Name as requested, with leading and trailing slashes removed.
    pub name: String,
    /// Canonical git directory, always a descendant of the scan root.
    pub git_dir: PathBuf,
}

/// Validate `name` and turn it into a relative path. Pure, no filesystem access.
pub fn sanitize(name: &str) -> Result<PathBuf, PathError> {
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() || trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(PathError::Invalid(name.to_string()));
    }
    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => return Err(PathError::Escape(name.to_string())),
            _ => return Err(PathError::Invalid(name.to_string())),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
}

impl Resolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn resolve(&self, name: &str) -> Result<RepositoryRef, PathError> {
        let relative = sanitize(name)?;
        let root = fs::canonicalize(&self.root)
            .await
            .map_err(|_| PathError::NotFound(name.to_string()))?;

        let base = root.join(&relative);
        let mut bare_suffixed = base.clone().into_os_string();
        bare_suffixed.push(".git");
        let candidates = [base.join(".git"), base, PathBuf::from(bare_suffixed)];

        for candidate in candidates {
            let Ok(canonical) = fs::canonicalize(&candidate).await else {
                continue;
            };
            if !canonical.starts_with(&root) || canonical == root {
                tracing::warn!(repo = name, "repository path escapes scan root");
                return Err(PathError::Escape(name.to_string()));
            }
            if is_git_dir(&canonical).await {
                return Ok(RepositoryRef {
                    name: name.trim_matches('/').to_string(),
                    git_dir: canonical,
                });
            }
        }
        Err(PathError::NotFound(name.to_string()))
    }
}

async fn is_git_dir(path: &Path) -> bool {
    let objects = fs::metadata(path.join("objects")).await;
    let head = fs::metadata(path.join("HEAD")).await;
    matches!((objects, head), (Ok(o), Ok(h)) if o.is_dir() && h.is_file())
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::{PathError, Resolver, sanitize};
    use crate::store::fs::tests::init_bare;

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize("repo").is_ok());
        assert!(sanitize("/group/repo.git/").is_ok());
        assert_eq!(
            sanitize("../etc"),
            Err(PathError::Escape("../etc".to_string()))
        );
        assert!(sanitize("a/../../b").is_err());
        assert!(sanitize("a/./b").is_ok());
        assert!(sanitize("./a").is_err());
        assert!(sanitize("").is_err());
        assert!(sanitize("a\\b").is_err());
    }

    quickcheck! {
        fn sanitized_paths_never_climb(name: String) -> bool {
            match sanitize(&name) {
                Ok(path) => path
                    .components()
                    .all(|c| matches!(c, std::path::Component::Normal(_))),
                Err(_) => true,
            }
        }

        fn parent_segments_always_fail(prefix: String, suffix: String) -> bool {
            let name = format!("{prefix}/../{suffix}");
            sanitize(&name).is_err()
        }
    }

    #[tokio::test]
    async fn resolves_work_tree_bare_and_suffixed_layouts() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare(&tmp.path().join("work/.git"), None);
        init_bare(&tmp.path().join("bare"), None);
        init_bare(&tmp.path().join("plain.git"), None);
        let resolver = Resolver::new(tmp.path());
        let root = tmp.path().canonicalize().unwrap();

        let work = resolver.resolve("/work").await.unwrap();
        assert_eq!(work.git_dir, root.join("work/.git"));
        assert_eq!(work.name, "work");
        assert_eq!(
            resolver.resolve("bare").await.unwrap().git_dir,
            root.join("bare")
        );
        assert_eq!(
            resolver.resolve("plain").await.unwrap().git_dir,
            root.join("plain.git")
        );
        assert!(matches!(
            resolver.resolve("missing").await,
            Err(PathError::NotFound(_))
        ));
        assert!(matches!(
            resolver.resolve("../outside").await,
            Err(PathError::Escape(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_root_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        init_bare(&outside.path().join("secret"), None);
        let tmp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), tmp.path().join("link"))
            .unwrap();
        let resolver = Resolver::new(tmp.path());
        assert!(matches!(
            resolver.resolve("link").await,
            Err(PathError::Escape(_))
        ));
    }
}
