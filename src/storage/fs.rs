// ABOUTME: Filesystem blob store - one directory per bucket, keys map to relative paths
// ABOUTME: Writes go through a temp file and rename so readers never see partial objects

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{BlobStore, StorageError, StorageResult};

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid || bucket.is_empty() || bucket.contains(['/', '\\']) {
            return Err(StorageError::InvalidKey(format!("{}/{}", bucket, key)));
        }
        Ok(self.root.join(bucket).join(rel))
    }

    async fn ensure_parent(&self, path: &Path, bucket: &str, key: &str) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(bucket, key, e))?;
        }
        Ok(())
    }
}

fn io_error(bucket: &str, key: &str, source: std::io::Error) -> StorageError {
    if source.kind() == ErrorKind::NotFound {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        StorageError::Io {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.path(bucket, key)?;
        self.ensure_parent(&path, bucket, key).await?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(bucket, key, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(bucket, key, e))
    }

    async fn put_if_absent(&self, bucket: &str, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.path(bucket, key)?;
        self.ensure_parent(&path, bucket, key).await?;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(io_error(bucket, key, e)),
        };
        file.write_all(bytes)
            .await
            .map_err(|e| io_error(bucket, key, e))?;
        file.flush().await.map_err(|e| io_error(bucket, key, e))
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path(bucket, key)?;
        fs::read(&path).await.map_err(|e| io_error(bucket, key, e))
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StorageResult<()> {
        let bytes = self.get(src_bucket, src_key).await?;
        self.put(dst_bucket, dst_key, &bytes).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = self.path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(bucket, key, e)),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.root.join(bucket);
        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(bucket, prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(bucket, prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error(bucket, prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&base) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.contains(".tmp-") {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
