mod artifact;
mod local;
mod memory;
mod snapshot;

pub use artifact::{
    ArchiveStrategy, ArtifactError, ArtifactRef, ArtifactStore, EXTERNAL_PRODUCER, artifact_key,
};
pub use local::LocalFsStore;
pub use memory::MemoryStore;
pub use snapshot::{Versioned, create_snapshot, list_runs, read_snapshot, snapshot_key, write_snapshot};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("precondition failed for key: {0}")]
    PreconditionFailed(String),
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("store error: {0}")]
    Other(String),
}

/// Flat key/value blob storage with etag-based conditional writes.
///
/// Etags are the hex SHA-256 of the stored body, so equal payloads share an etag
/// regardless of backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<(Bytes, String), StoreError>;
    async fn put(&self, key: &str, body: Bytes) -> Result<String, StoreError>;
    /// Replaces `key` only if its current etag equals `etag`.
    async fn put_if_match(&self, key: &str, body: Bytes, etag: &str) -> Result<String, StoreError>;
    /// Creates `key` only if nothing is stored there yet.
    async fn put_if_none_match(&self, key: &str, body: Bytes) -> Result<String, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

pub fn content_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}
