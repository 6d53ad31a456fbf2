use crate::{ObjectStore, StoreError};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// A decoded snapshot together with the etag it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub etag: String,
}

pub fn snapshot_key(run_id: &str) -> String {
    format!("runs/{run_id}/state.json")
}

pub async fn read_snapshot<T>(store: &dyn ObjectStore, run_id: &str) -> Result<Versioned<T>, StoreError>
where
    T: DeserializeOwned,
{
    let (body, etag) = store.get(&snapshot_key(run_id)).await?;
    let value = serde_json::from_slice::<T>(&body)
        .map_err(|e| StoreError::Other(format!("failed to decode snapshot for {run_id}: {e}")))?;
    Ok(Versioned { value, etag })
}

/// Writes the first snapshot of a run. Fails with `AlreadyExists` if the run id is taken.
pub async fn create_snapshot<T>(store: &dyn ObjectStore, run_id: &str, value: &T) -> Result<String, StoreError>
where
    T: Serialize,
{
    store
        .put_if_none_match(&snapshot_key(run_id), encode(run_id, value)?)
        .await
}

/// Replaces the snapshot if nobody else wrote it since `etag` was observed.
pub async fn write_snapshot<T>(
    store: &dyn ObjectStore,
    run_id: &str,
    value: &T,
    etag: &str,
) -> Result<String, StoreError>
where
    T: Serialize,
{
    store
        .put_if_match(&snapshot_key(run_id), encode(run_id, value)?, etag)
        .await
}

/// Run ids with a persisted snapshot, sorted.
pub async fn list_runs(store: &dyn ObjectStore) -> Result<Vec<String>, StoreError> {
    let keys = store.list("runs/").await?;
    Ok(keys
        .iter()
        .filter_map(|key| key.strip_prefix("runs/")?.strip_suffix("/state.json"))
        .map(str::to_string)
        .collect())
}

fn encode<T: Serialize>(run_id: &str, value: &T) -> Result<Bytes, StoreError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| StoreError::Other(format!("failed to encode snapshot for {run_id}: {e}")))
}
