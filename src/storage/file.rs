use super::{ETag, StateStore, StoredState, check_etag};
use crate::core::{IndexError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

/// JSON-file backed state store. Each key maps to one file below `root`;
/// `/` in a key becomes a directory level.
#[derive(Clone)]
pub struct FileStateStore {
    root: PathBuf,
    // serializes read-compare-write within this process
    write_lock: Arc<Mutex<()>>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(IndexError::Storage(format!("invalid state key '{}'", key)));
            }
            path.push(segment);
        }
        path.set_extension("json");
        Ok(path)
    }

    async fn read_path(path: &Path) -> Result<Option<StoredState>> {
        if !fs::try_exists(path)
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(path).await.map_err(|err| {
            IndexError::Storage(format!("Failed to read '{}': {}", path.display(), err))
        })?;
        let stored = serde_json::from_slice::<StoredState>(&bytes)?;
        Ok(Some(stored))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self, key: &str) -> Result<Option<StoredState>> {
        let path = self.path_for(key)?;
        Self::read_path(&path).await
    }

    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<ETag>,
    ) -> Result<ETag> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;

        let actual = Self::read_path(&path).await?.map(|stored| stored.etag);
        check_etag(key, expected, actual)?;

        let etag = actual.map(ETag::next).unwrap_or_else(ETag::initial);
        let bytes = serde_json::to_vec_pretty(&StoredState { etag, value })?;
        atomic_write(&path, &bytes).await?;
        Ok(etag)
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            IndexError::Storage(format!(
                "Failed to create parent directory '{}': {}",
                parent.display(),
                err
            ))
        })?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await.map_err(|err| {
        IndexError::Storage(format!(
            "Failed to write temp file '{}': {}",
            tmp.display(),
            err
        ))
    })?;

    fs::rename(&tmp, path).await.map_err(|err| {
        IndexError::Storage(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}
