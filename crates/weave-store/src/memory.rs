use crate::{ObjectStore, StoreError, content_digest};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// In-process object store. Each key lives in its own map slot, so writers to
/// different keys never block each other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<(Bytes, String), StoreError> {
        let body = self
            .objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let etag = content_digest(&body);
        Ok((body, etag))
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<String, StoreError> {
        let etag = content_digest(&body);
        self.objects.insert(key.to_string(), body);
        Ok(etag)
    }

    async fn put_if_match(&self, key: &str, body: Bytes, etag: &str) -> Result<String, StoreError> {
        match self.objects.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if content_digest(occupied.get()) != etag {
                    return Err(StoreError::PreconditionFailed(key.to_string()));
                }
                let next = content_digest(&body);
                occupied.insert(body);
                Ok(next)
            }
            Entry::Vacant(_) => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn put_if_none_match(&self, key: &str, body: Bytes) -> Result<String, StoreError> {
        match self.objects.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(key.to_string())),
            Entry::Vacant(vacant) => {
                let etag = content_digest(&body);
                vacant.insert(body);
                Ok(etag)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.contains_key(key))
    }
}
