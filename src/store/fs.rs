//! Repository store over an ordinary git directory.
//!
//! Reads loose objects, `objects/pack/*.idx` + `.pack` pairs, loose refs, `packed-refs` and
//! `HEAD`. Pushed objects are written loose. Ref updates take `<ref>.lock` exclusively, check the
//! current value while holding it and rename the lock into place, which is how git itself makes
//! ref updates atomic per ref.

use std::{
    collections::BTreeMap,
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};

use super::{Head, RepositoryStore, StoreError};
use crate::{
    errors::GitError,
    hash::{HashKind, ObjectId},
    internal::{
        object::{ObjectKind, RawObject},
        pack::{
            decode::{EntryKind, inflate_at, read_entry_header},
            delta::apply_delta,
            index::PackIndex,
        },
    },
};

const LOCK_RETRIES: usize = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);
const MAX_DELTA_CHAIN: usize = 4096;
const MAX_SYMREF_DEPTH: usize = 5;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

struct LoadedPack {
    name: String,
    index: PackIndex,
    data: Vec<u8>,
}

impl LoadedPack {
    /// Materialise the object at `offset`, following delta chains inside this pack.
    fn read_at(&self, hash: HashKind, offset: usize) -> Result<(ObjectKind, Vec<u8>), GitError> {
        let mut deltas = Vec::new();
        let mut current = offset;
        let (kind, mut data) = loop {
            if deltas.len() > MAX_DELTA_CHAIN {
                return Err(GitError::InvalidPackFile(format!(
                    "delta chain too long at offset {offset}"
                )));
            }
            let header = read_entry_header(hash, &self.data, current)?;
            let (payload, _) = inflate_at(&self.data, header.data_offset, header.size)?;
            match header.kind {
                EntryKind::Base(kind) => break (kind, payload),
                EntryKind::OfsDelta(base) => {
                    deltas.push(payload);
                    current = base;
                }
                EntryKind::RefDelta(id) => {
                    deltas.push(payload);
                    current = self.index.find(&id).ok_or_else(|| {
                        GitError::InvalidPackFile(format!(
                            "ref-delta base {id} missing from {}",
                            self.name
                        ))
                    })? as usize;
                }
            }
        };
        while let Some(delta) = deltas.pop() {
            data = apply_delta(&data, &delta)?;
        }
        Ok((kind, data))
    }
}

/// A git directory (bare repository or the `.git` of a work tree).
pub struct FsStore {
    git_dir: PathBuf,
    hash: HashKind,
    packs: RwLock<Vec<Arc<LoadedPack>>>,
}

impl FsStore {
    /// Open `git_dir`, detecting the object format from its `config`.
    pub async fn open(git_dir: impl Into<PathBuf>) -> Result<FsStore, StoreError> {
        let git_dir = git_dir.into();
        if !fs::metadata(git_dir.join("objects")).await?.is_dir() {
            return Err(StoreError::Corrupt(format!(
                "{} has no objects directory",
                git_dir.display()
            )));
        }
        let hash = detect_object_format(&git_dir).await?;
        let store = FsStore {
            git_dir,
            hash,
            packs: RwLock::new(Vec::new()),
        };
        store.reload_packs().await?;
        tracing::debug!(path = %store.git_dir.display(), format = %hash, "opened repository");
        Ok(store)
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    async fn in_packs(&self, id: &ObjectId) -> bool {
        self.packs.read().await.iter().any(|p| p.index.find(id).is_some())
    }

    fn loose_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_string();
        self.git_dir.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    async fn pack_names(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.git_dir.join("objects").join("pack");
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".idx") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load any pack not yet in memory. Returns whether anything changed.
    async fn reload_packs(&self) -> Result<bool, StoreError> {
        let names = self.pack_names().await?;
        let known: Vec<String> = self
            .packs
            .read()
            .await
            .iter()
            .map(|p| p.name.clone())
            .collect();
        if names == known {
            return Ok(false);
        }
        let dir = self.git_dir.join("objects").join("pack");
        let mut loaded = Vec::with_capacity(names.len());
        for name in names {
            let idx = fs::read(dir.join(format!("{name}.idx"))).await?;
            let data = fs::read(dir.join(format!("{name}.pack"))).await?;
            let index = PackIndex::parse(self.hash, &idx)?;
            tracing::debug!(pack = %name, objects = index.len(), "loaded pack");
            loaded.push(Arc::new(LoadedPack { name, index, data }));
        }
        *self.packs.write().await = loaded;
        Ok(true)
    }

    async fn read_loose(&self, id: &ObjectId) -> Result<Option<RawObject>, StoreError> {
        let raw = match fs::read(self.loose_path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut inflated = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| StoreError::Corrupt(format!("loose object {id}: {e}")))?;

        let nul = inflated
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| StoreError::Corrupt(format!("loose object {id} has no header")))?;
        let header = String::from_utf8_lossy(&inflated[..nul]).to_string();
        let (kind, size) = header
            .split_once(' ')
            .ok_or_else(|| StoreError::Corrupt(format!("loose object {id}: bad header")))?;
        let kind = ObjectKind::from_string(kind)?;
        let size: usize = size
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("loose object {id}: bad size")))?;
        let data = inflated.split_off(nul + 1);
        if data.len() != size {
            return Err(StoreError::Corrupt(format!(
                "loose object {id}: size {} but header says {size}",
                data.len()
            )));
        }
        Ok(Some(RawObject { id: *id, kind, data }))
    }

    async fn read_packed(&self, id: &ObjectId) -> Result<Option<RawObject>, StoreError> {
        let packs = self.packs.read().await.clone();
        for pack in packs {
            if let Some(offset) = pack.index.find(id) {
                let hash = self.hash;
                let pack = pack.clone();
                let (kind, data) =
                    tokio::task::spawn_blocking(move || pack.read_at(hash, offset as usize))
                        .await
                        .map_err(|e| StoreError::Corrupt(format!("pack reader failed: {e}")))??;
                return Ok(Some(RawObject { id: *id, kind, data }));
            }
        }
        Ok(None)
    }

    async fn write_loose(&self, object: &RawObject) -> Result<(), StoreError> {
        let path = self.loose_path(&object.id);
        if fs::try_exists(&path).await? {
            return Ok(());
        }
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Corrupt("loose object path has no parent".to_string()))?;
        fs::create_dir_all(dir).await?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(object.kind.as_bytes())?;
        encoder.write_all(format!(" {}\0", object.data.len()).as_bytes())?;
        encoder.write_all(&object.data)?;
        let compressed = encoder.finish()?;

        let tmp = dir.join(format!(
            "tmp_obj_{}_{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&compressed).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_packed_refs(&self) -> Result<BTreeMap<String, ObjectId>, StoreError> {
        let text = match fs::read_to_string(self.git_dir.join("packed-refs")).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut refs = BTreeMap::new();
        for line in text.lines() {
            if line.starts_with('#') || line.starts_with('^') || line.is_empty() {
                continue;
            }
            let Some((id, name)) = line.split_once(' ') else {
                continue;
            };
            let id = ObjectId::from_hex(self.hash, id).map_err(StoreError::Corrupt)?;
            refs.insert(name.to_string(), id);
        }
        Ok(refs)
    }

    /// Value of a loose ref file, following symbolic refs.
    async fn read_loose_ref(&self, name: &str) -> Result<Option<ObjectId>, StoreError> {
        let mut name = name.to_string();
        for _ in 0..MAX_SYMREF_DEPTH {
            let text = match fs::read_to_string(self.git_dir.join(&name)).await {
                Ok(text) => text,
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                    return Ok(self.read_packed_refs().await?.get(&name).copied());
                }
                Err(e) => return Err(e.into()),
            };
            let text = text.trim();
            match text.strip_prefix("ref: ") {
                Some(target) => name = target.trim().to_string(),
                None => {
                    return ObjectId::from_hex(self.hash, text)
                        .map(Some)
                        .map_err(StoreError::Corrupt);
                }
            }
        }
        Err(StoreError::Corrupt(format!("symbolic ref loop at `{name}`")))
    }

    async fn collect_loose_refs(
        &self,
        dir: PathBuf,
        prefix: String,
        out: &mut BTreeMap<String, ObjectId>,
    ) -> Result<(), StoreError> {
        let mut stack = vec![(dir, prefix)];
        while let Some((dir, prefix)) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let name = format!("{prefix}/{file_name}");
                if entry.file_type().await?.is_dir() {
                    stack.push((entry.path(), name));
                } else if !file_name.ends_with(".lock") {
                    if let Some(id) = self.read_loose_ref(&name).await? {
                        out.insert(name, id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Take `<path>.lock`, retrying while another writer holds it.
    async fn acquire_lock(&self, path: &Path) -> Result<(PathBuf, fs::File), StoreError> {
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        let lock_path = PathBuf::from(lock_name);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        for _ in 0..LOCK_RETRIES {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(file) => return Ok((lock_path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Corrupt(format!(
            "unable to lock {}",
            lock_path.display()
        )))
    }

    /// Drop `name` from `packed-refs`, holding `packed-refs.lock`.
    async fn remove_packed_ref(&self, name: &str) -> Result<(), StoreError> {
        let path = self.git_dir.join("packed-refs");
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let (lock_path, mut lock) = self.acquire_lock(&path).await?;
        let mut kept = String::new();
        let mut skipping = false;
        for line in text.lines() {
            if line.starts_with('^') {
                if !skipping {
                    kept.push_str(line);
                    kept.push('\n');
                }
                continue;
            }
            skipping = line.split_once(' ').map(|(_, n)| n) == Some(name);
            if !skipping {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        let result = async {
            lock.write_all(kept.as_bytes()).await?;
            lock.sync_all().await?;
            fs::rename(&lock_path, &path).await
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&lock_path).await;
        }
        Ok(result?)
    }

    async fn update_ref_locked(
        &self,
        name: &str,
        ref_path: &Path,
        lock_path: &Path,
        lock: &mut fs::File,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        let current = self.read_loose_ref(name).await?;
        if current != expected {
            return Err(StoreError::StaleRef(name.to_string()));
        }
        match new {
            Some(id) => {
                lock.write_all(format!("{id}\n").as_bytes()).await?;
                lock.sync_all().await?;
                fs::rename(lock_path, ref_path).await?;
            }
            None => {
                match fs::remove_file(ref_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.remove_packed_ref(name).await?;
                fs::remove_file(lock_path).await?;
            }
        }
        Ok(())
    }
}

/// `extensions.objectformat` from the repository config, SHA-1 when absent.
async fn detect_object_format(git_dir: &Path) -> Result<HashKind, StoreError> {
    let config = match fs::read_to_string(git_dir.join("config")).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashKind::Sha1),
        Err(e) => return Err(e.into()),
    };
    let mut in_extensions = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_extensions = line.eq_ignore_ascii_case("[extensions]");
            continue;
        }
        if !in_extensions {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim().eq_ignore_ascii_case("objectformat") {
                return value.trim().parse().map_err(StoreError::Corrupt);
            }
        }
    }
    Ok(HashKind::Sha1)
}

#[async_trait]
impl RepositoryStore for FsStore {
    fn hash_kind(&self) -> HashKind {
        self.hash
    }

    async fn refs(&self) -> Result<Vec<(String, ObjectId)>, StoreError> {
        let mut refs = self.read_packed_refs().await?;
        self.collect_loose_refs(self.git_dir.join("refs"), "refs".to_string(), &mut refs)
            .await?;
        Ok(refs.into_iter().collect())
    }

    async fn head(&self) -> Result<Head, StoreError> {
        let text = match fs::read_to_string(self.git_dir.join("HEAD")).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Head::default()),
            Err(e) => return Err(e.into()),
        };
        let text = text.trim();
        match text.strip_prefix("ref: ") {
            Some(target) => {
                let target = target.trim().to_string();
                let id = self.read_loose_ref(&target).await?;
                Ok(Head {
                    symref: Some(target),
                    id,
                })
            }
            None => Ok(Head {
                symref: None,
                id: Some(ObjectId::from_hex(self.hash, text).map_err(StoreError::Corrupt)?),
            }),
        }
    }

    async fn has_object(&self, id: &ObjectId) -> Result<bool, StoreError> {
        if fs::try_exists(self.loose_path(id)).await? {
            return Ok(true);
        }
        if self.in_packs(id).await {
            return Ok(true);
        }
        if self.reload_packs().await? {
            return Ok(self.in_packs(id).await);
        }
        Ok(false)
    }

    async fn read_object(&self, id: &ObjectId) -> Result<RawObject, StoreError> {
        if let Some(object) = self.read_loose(id).await? {
            return Ok(object);
        }
        if let Some(object) = self.read_packed(id).await? {
            return Ok(object);
        }
        if self.reload_packs().await? {
            if let Some(object) = self.read_packed(id).await? {
                return Ok(object);
            }
        }
        Err(StoreError::ObjectNotFound(*id))
    }

    async fn write_objects(&self, objects: Vec<RawObject>) -> Result<(), StoreError> {
        for object in &objects {
            if object.id.kind() != self.hash {
                return Err(StoreError::Corrupt(format!(
                    "refusing {} object in a {} repository",
                    object.id.kind(),
                    self.hash
                )));
            }
            if self.in_packs(&object.id).await {
                continue;
            }
            self.write_loose(object).await?;
        }
        tracing::debug!(count = objects.len(), "stored objects");
        Ok(())
    }

    async fn update_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        if !super::is_valid_ref_name(name) {
            return Err(StoreError::InvalidRefName(name.to_string()));
        }
        let ref_path = self.git_dir.join(name);
        let (lock_path, mut lock) = self.acquire_lock(&ref_path).await?;
        let result = self
            .update_ref_locked(name, &ref_path, &lock_path, &mut lock, expected, new)
            .await;
        if result.is_err() {
            let _ = fs::remove_file(&lock_path).await;
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use super::FsStore;
    use crate::{
        hash::HashKind,
        internal::object::{ObjectKind, RawObject},
        store::{RepositoryStore, StoreError},
    };

    /// Minimal bare repository layout.
    pub(crate) fn init_bare(dir: &Path, format: Option<&str>) {
        std::fs::create_dir_all(dir.join("objects/pack")).unwrap();
        std::fs::create_dir_all(dir.join("refs/heads")).unwrap();
        std::fs::create_dir_all(dir.join("refs/tags")).unwrap();
        std::fs::write(dir.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        let mut config = String::from("[core]\n\trepositoryformatversion = 1\n\tbare = true\n");
        if let Some(format) = format {
            config.push_str(&format!("[extensions]\n\tobjectformat = {format}\n"));
        }
        std::fs::write(dir.join("config"), config).unwrap();
    }

    #[tokio::test]
    async fn objects_and_refs_round_trip_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare(tmp.path(), None);
        let store = FsStore::open(tmp.path()).await.unwrap();
        assert_eq!(store.hash_kind(), HashKind::Sha1);

        let blob = RawObject::new(HashKind::Sha1, ObjectKind::Blob, b"hello\n".to_vec());
        store.write_objects(vec![blob.clone()]).await.unwrap();
        assert!(store.has_object(&blob.id).await.unwrap());
        assert_eq!(store.read_object(&blob.id).await.unwrap(), blob);

        store
            .update_ref("refs/heads/main", None, Some(blob.id))
            .await
            .unwrap();
        let head = store.head().await.unwrap();
        assert_eq!(head.symref.as_deref(), Some("refs/heads/main"));
        assert_eq!(head.id, Some(blob.id));
        assert_eq!(
            store.refs().await.unwrap(),
            vec![("refs/heads/main".to_string(), blob.id)]
        );

        let err = store
            .update_ref("refs/heads/main", None, Some(blob.id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleRef(_)));
        assert!(!tmp.path().join("refs/heads/main.lock").exists());
    }

    #[tokio::test]
    async fn packed_refs_are_read_and_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare(tmp.path(), None);
        let id = HashKind::Sha1.digest(b"tag");
        std::fs::write(
            tmp.path().join("packed-refs"),
            format!("# pack-refs with: peeled fully-peeled sorted \n{id} refs/tags/v1\n^{id}\n"),
        )
        .unwrap();
        let store = FsStore::open(tmp.path()).await.unwrap();
        assert_eq!(
            store.refs().await.unwrap(),
            vec![("refs/tags/v1".to_string(), id)]
        );
        store
            .update_ref("refs/tags/v1", Some(id), None)
            .await
            .unwrap();
        assert!(store.refs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn detects_sha256_repositories() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare(tmp.path(), Some("sha256"));
        let store = FsStore::open(tmp.path()).await.unwrap();
        assert_eq!(store.hash_kind(), HashKind::Sha256);
        let foreign = RawObject::new(HashKind::Sha1, ObjectKind::Blob, b"x".to_vec());
        assert!(store.write_objects(vec![foreign]).await.is_err());
    }
}
