use crate::{ObjectStore, StoreError, content_digest};
use async_trait::async_trait;
use bytes::Bytes;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::path::{Component, Path, PathBuf};
use tokio::task::spawn_blocking;
use uuid::Uuid;
use walkdir::WalkDir;

const LOCK_SUFFIX: &str = "lock";

/// Object store rooted at a directory; keys map to relative file paths.
#[derive(Debug, Clone)]
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blocking<T, F>(&self, key: &str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf, String) -> Result<T, StoreError> + Send + 'static,
    {
        let path = resolve(&self.root, key)?;
        let key = key.to_string();
        spawn_blocking(move || f(path, key))
            .await
            .map_err(|e| StoreError::Other(format!("blocking task join error: {e}")))?
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn get(&self, key: &str) -> Result<(Bytes, String), StoreError> {
        self.blocking(key, |path, key| {
            let body = read_existing(&path, &key)?;
            let etag = content_digest(&body);
            Ok((Bytes::from(body), etag))
        })
        .await
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<String, StoreError> {
        self.blocking(key, move |path, _| {
            write_atomic(&path, &body)?;
            Ok(content_digest(&body))
        })
        .await
    }

    async fn put_if_match(&self, key: &str, body: Bytes, etag: &str) -> Result<String, StoreError> {
        let expected = etag.to_string();
        self.blocking(key, move |path, key| {
            locked(&path, || {
                let current = read_existing(&path, &key)?;
                if content_digest(&current) != expected {
                    return Err(StoreError::PreconditionFailed(key.clone()));
                }
                write_atomic(&path, &body)?;
                Ok(content_digest(&body))
            })
        })
        .await
    }

    async fn put_if_none_match(&self, key: &str, body: Bytes) -> Result<String, StoreError> {
        self.blocking(key, move |path, key| {
            locked(&path, || {
                if path.exists() {
                    return Err(StoreError::AlreadyExists(key.clone()));
                }
                write_atomic(&path, &body)?;
                Ok(content_digest(&body))
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.blocking(key, |path, _| match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        spawn_blocking(move || list_keys(&root, &prefix))
            .await
            .map_err(|e| StoreError::Other(format!("blocking task join error: {e}")))?
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.blocking(key, |path, _| Ok(path.is_file())).await
    }
}

fn resolve(root: &Path, key: &str) -> Result<PathBuf, StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    let relative = Path::new(key);
    let escapes = relative.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(root.join(relative))
}

fn read_existing(path: &Path, key: &str) -> Result<Vec<u8>, StoreError> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
        _ => io_err(e),
    })
}

/// Runs `f` while holding an exclusive advisory lock on `<path>.lock`.
fn locked<T>(path: &Path, f: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
    let lock_path = sibling(path, LOCK_SUFFIX);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(io_err)?;
    lock.lock_exclusive().map_err(io_err)?;
    let result = f();
    FileExt::unlock(&lock).map_err(io_err)?;
    result
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let staging = sibling(path, &format!("tmp-{}", Uuid::new_v4()));
    fs::write(&staging, body).map_err(io_err)?;
    fs::rename(&staging, path).map_err(io_err)
}

fn list_keys(root: &Path, prefix: &str) -> Result<Vec<String>, StoreError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut keys = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_bookkeeping = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == LOCK_SUFFIX || ext.starts_with("tmp-"));
        if is_bookkeeping {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let key = relative
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.starts_with(prefix) {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn io_err(error: std::io::Error) -> StoreError {
    StoreError::Io(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_get_list_delete() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsStore::new(temp.path());
        let key = "artifacts/run-1/extract/raw-data";

        let body = Bytes::from_static(b"id,name,value\n1,alice,100\n");
        let etag = store.put(key, body.clone()).await.expect("put");
        assert_eq!(etag, content_digest(&body));

        let (fetched, fetched_etag) = store.get(key).await.expect("get");
        assert_eq!(fetched, body);
        assert_eq!(fetched_etag, etag);
        assert!(store.exists(key).await.expect("exists"));
        assert_eq!(
            store.list("artifacts/run-1").await.expect("list"),
            vec![key.to_string()]
        );

        store.delete(key).await.expect("delete");
        assert!(!store.exists(key).await.expect("exists"));
        store.delete(key).await.expect("deleting twice is fine");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsStore::new(temp.path());
        let err = store.get("runs/nope/state.json").await.expect_err("missing");
        assert_eq!(err, StoreError::NotFound("runs/nope/state.json".to_string()));
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsStore::new(temp.path());
        let err = store
            .put("../outside", Bytes::from_static(b"x"))
            .await
            .expect_err("parent dir rejected");
        assert_eq!(err, StoreError::InvalidKey("../outside".to_string()));
    }

    #[tokio::test]
    async fn conditional_writes() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsStore::new(temp.path());
        let key = "runs/r/state.json";

        let first = store
            .put_if_none_match(key, Bytes::from_static(br#"{"v":1}"#))
            .await
            .expect("create");
        let err = store
            .put_if_none_match(key, Bytes::from_static(br#"{"v":2}"#))
            .await
            .expect_err("second create");
        assert_eq!(err, StoreError::AlreadyExists(key.to_string()));

        let second = store
            .put_if_match(key, Bytes::from_static(br#"{"v":2}"#), &first)
            .await
            .expect("cas with fresh etag");
        assert_ne!(first, second);
        let err = store
            .put_if_match(key, Bytes::from_static(br#"{"v":3}"#), &first)
            .await
            .expect_err("stale etag");
        assert_eq!(err, StoreError::PreconditionFailed(key.to_string()));
        assert!(
            store.list("").await.expect("list").iter().all(|k| !k.ends_with(".lock")),
            "lock files stay hidden"
        );
    }

    #[tokio::test]
    async fn concurrent_creates_have_one_winner() {
        let temp = tempdir().expect("create temp dir");
        let store = Arc::new(LocalFsStore::new(temp.path()));
        let key = "artifacts/run/task/out";

        let mut handles = Vec::new();
        for idx in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .put_if_none_match(key, Bytes::from(format!("writer-{idx}")))
                    .await
            }));
        }

        let mut created = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => created += 1,
                Err(StoreError::AlreadyExists(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((created, rejected), (1, 7));
    }
}
