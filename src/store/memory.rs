//! In-memory repository store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Head, RepositoryStore, StoreError};
use crate::{
    hash::{HashKind, ObjectId},
    internal::object::{ObjectKind, RawObject},
};

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectId, RawObject>,
    refs: BTreeMap<String, ObjectId>,
    head: String,
}

/// Objects and refs held in process memory.
///
/// Every operation takes one short-lived lock, so [`RepositoryStore::update_ref`] is a true
/// compare-and-swap even with many sessions racing on the same ref.
pub struct MemoryStore {
    hash: HashKind,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(hash: HashKind) -> Self {
        Self {
            hash,
            inner: Mutex::new(Inner {
                head: "refs/heads/main".to_string(),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
    }

    /// Add an object and return its id.
    pub fn insert(&self, kind: ObjectKind, data: impl Into<Vec<u8>>) -> ObjectId {
        let object = RawObject::new(self.hash, kind, data.into());
        let id = object.id;
        if let Ok(mut inner) = self.inner.lock() {
            inner.objects.insert(id, object);
        }
        id
    }

    /// Point `name` at `id` without any checks.
    pub fn set_ref(&self, name: &str, id: ObjectId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.refs.insert(name.to_string(), id);
        }
    }

    pub fn set_head(&self, target: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.head = target.to_string();
        }
    }

    pub fn get_ref(&self, name: &str) -> Option<ObjectId> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.refs.get(name).copied())
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.objects.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RepositoryStore for MemoryStore {
    fn hash_kind(&self) -> HashKind {
        self.hash
    }

    async fn refs(&self) -> Result<Vec<(String, ObjectId)>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .refs
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect())
    }

    async fn head(&self) -> Result<Head, StoreError> {
        let inner = self.lock()?;
        Ok(Head {
            symref: Some(inner.head.clone()),
            id: inner.refs.get(&inner.head).copied(),
        })
    }

    async fn has_object(&self, id: &ObjectId) -> Result<bool, StoreError> {
        Ok(self.lock()?.objects.contains_key(id))
    }

    async fn read_object(&self, id: &ObjectId) -> Result<RawObject, StoreError> {
        self.lock()?
            .objects
            .get(id)
            .cloned()
            .ok_or(StoreError::ObjectNotFound(*id))
    }

    async fn write_objects(&self, objects: Vec<RawObject>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for object in objects {
            inner.objects.entry(object.id).or_insert(object);
        }
        Ok(())
    }

    async fn update_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.refs.get(name).copied() != expected {
            return Err(StoreError::StaleRef(name.to_string()));
        }
        match new {
            Some(id) => {
                inner.refs.insert(name.to_string(), id);
            }
            None => {
                inner.refs.remove(name);
            }
        }
        Ok(())
    }
}
