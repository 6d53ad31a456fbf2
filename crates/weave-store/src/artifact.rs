use crate::{ObjectStore, StoreError, content_digest};
use bytes::Bytes;
use dashmap::DashMap;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;

/// Producer id under which external workflow inputs are stored.
pub const EXTERNAL_PRODUCER: &str = "_input";

/// How an artifact payload is kept at rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStrategy {
    #[default]
    None,
    Gzip,
}

/// A committed artifact. `digest` and `size` describe the logical payload, not
/// the archived bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub task_id: String,
    pub slot: String,
    pub key: String,
    pub digest: String,
    pub size: u64,
    pub archive: ArchiveStrategy,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("artifact {task_id}/{slot} has not been committed")]
    NotFound { task_id: String, slot: String },
    #[error("artifact {task_id}/{slot} was already written")]
    Integrity { task_id: String, slot: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("archive error: {0}")]
    Archive(String),
}

pub fn artifact_key(run_id: &str, task_id: &str, slot: &str) -> String {
    format!("artifacts/{run_id}/{task_id}/{slot}")
}

/// Write-once artifact table for a single run, keyed by `(task_id, slot)`.
///
/// An artifact becomes readable the moment `put` returns. Clones share the same
/// table.
#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
    run_id: String,
    committed: Arc<DashMap<(String, String), ArtifactRef>>,
}

impl ArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            committed: Arc::new(DashMap::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn put(
        &self,
        task_id: &str,
        slot: &str,
        payload: Bytes,
    ) -> Result<ArtifactRef, ArtifactError> {
        self.put_with(task_id, slot, payload, ArchiveStrategy::None)
            .await
    }

    pub async fn put_with(
        &self,
        task_id: &str,
        slot: &str,
        payload: Bytes,
        archive: ArchiveStrategy,
    ) -> Result<ArtifactRef, ArtifactError> {
        if self.contains(task_id, slot) {
            return Err(integrity(task_id, slot));
        }

        let key = artifact_key(&self.run_id, task_id, slot);
        let reference = ArtifactRef {
            task_id: task_id.to_string(),
            slot: slot.to_string(),
            key: key.clone(),
            digest: content_digest(&payload),
            size: payload.len() as u64,
            archive,
        };
        let body = match archive {
            ArchiveStrategy::None => payload,
            ArchiveStrategy::Gzip => compress(&payload)?,
        };

        match self.store.put_if_none_match(&key, body).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists(_)) => return Err(integrity(task_id, slot)),
            Err(other) => return Err(other.into()),
        }

        self.committed.insert(
            (task_id.to_string(), slot.to_string()),
            reference.clone(),
        );
        tracing::debug!(
            run_id = %self.run_id,
            task_id,
            slot,
            size = reference.size,
            "artifact committed"
        );
        Ok(reference)
    }

    pub async fn get(&self, task_id: &str, slot: &str) -> Result<Bytes, ArtifactError> {
        let reference = self
            .reference(task_id, slot)
            .ok_or_else(|| not_found(task_id, slot))?;
        let (body, _) = self.store.get(&reference.key).await.map_err(|e| match e {
            StoreError::NotFound(_) => not_found(task_id, slot),
            other => other.into(),
        })?;
        match reference.archive {
            ArchiveStrategy::None => Ok(body),
            ArchiveStrategy::Gzip => decompress(&body),
        }
    }

    pub fn reference(&self, task_id: &str, slot: &str) -> Option<ArtifactRef> {
        self.committed
            .get(&(task_id.to_string(), slot.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, task_id: &str, slot: &str) -> bool {
        self.committed
            .contains_key(&(task_id.to_string(), slot.to_string()))
    }

    /// Re-registers an artifact committed by an earlier process, e.g. when a
    /// persisted run is resumed. The payload must still exist in the backing store.
    pub async fn restore(&self, reference: ArtifactRef) -> Result<(), ArtifactError> {
        if let Some(existing) = self.reference(&reference.task_id, &reference.slot) {
            if existing == reference {
                return Ok(());
            }
            return Err(integrity(&reference.task_id, &reference.slot));
        }
        if !self.store.exists(&reference.key).await? {
            return Err(not_found(&reference.task_id, &reference.slot));
        }
        self.committed.insert(
            (reference.task_id.clone(), reference.slot.clone()),
            reference,
        );
        Ok(())
    }

    pub fn references(&self) -> Vec<ArtifactRef> {
        let mut refs: Vec<ArtifactRef> = self
            .committed
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        refs.sort_by(|a, b| (&a.task_id, &a.slot).cmp(&(&b.task_id, &b.slot)));
        refs
    }
}

fn compress(payload: &[u8]) -> Result<Bytes, ArtifactError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| ArtifactError::Archive(e.to_string()))?;
    encoder
        .finish()
        .map(Bytes::from)
        .map_err(|e| ArtifactError::Archive(e.to_string()))
}

fn decompress(body: &[u8]) -> Result<Bytes, ArtifactError> {
    let mut decoded = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut decoded)
        .map_err(|e| ArtifactError::Archive(e.to_string()))?;
    Ok(Bytes::from(decoded))
}

fn not_found(task_id: &str, slot: &str) -> ArtifactError {
    ArtifactError::NotFound {
        task_id: task_id.to_string(),
        slot: slot.to_string(),
    }
}

fn integrity(task_id: &str, slot: &str) -> ArtifactError {
    ArtifactError::Integrity {
        task_id: task_id.to_string(),
        slot: slot.to_string(),
    }
}
