//! On-disk page store.
//!
//! Each entry lives in the directory named by its [`StorageKey`] below the
//! cache root, as `.sitecache-page` plus an optional `.sitecache-page.gz`.
//! Keys may not contain segments with that prefix, so entry files never
//! collide with the directory of another key. Writes go to a temp file in
//! the same directory and are renamed into place, so a reader sees either
//! the previous bytes or the new bytes. Writers of one key are serialized,
//! which keeps the raw and compressed variants from the same write.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::keys::StorageKey;

pub const PAGE_FILE: &str = ".sitecache-page";
pub const GZIP_FILE: &str = ".sitecache-page.gz";
pub(crate) const TEMP_PREFIX: &str = ".sitecache-tmp-";

const WRITE_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage key `{key}` escapes the cache root")]
    InvalidKey { key: String },
    #[error("cache I/O failed at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which representation of a page was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub body: Bytes,
    pub encoding: Encoding,
    pub created_at: SystemTime,
}

/// Result of walking a subtree.
#[derive(Debug, Default)]
pub struct Scan {
    pub entries: Vec<ScannedEntry>,
    pub temp_files: Vec<ScannedFile>,
    /// Directories in discovery order, parents before children.
    pub dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub key: StorageKey,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
    write_locks: Arc<[Mutex<()>]>,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, key: &StorageKey) -> Result<PathBuf, StoreError> {
        if !key.is_safe() {
            return Err(StoreError::InvalidKey {
                key: key.as_str().to_string(),
            });
        }
        let mut dir = self.root.clone();
        dir.extend(key.segments());
        Ok(dir)
    }

    async fn lock_key(&self, key: &StorageKey) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % self.write_locks.len() as u64) as usize;
        self.write_locks[stripe].lock().await
    }

    /// Raw bytes of the entry, or `None` on a miss.
    pub async fn read(&self, key: &StorageKey) -> Option<Bytes> {
        let dir = self.dir_for(key).ok()?;
        read_optional(&dir.join(PAGE_FILE)).await
    }

    pub async fn read_gzip(&self, key: &StorageKey) -> Option<Bytes> {
        let dir = self.dir_for(key).ok()?;
        read_optional(&dir.join(GZIP_FILE)).await
    }

    /// Serves the entry only while `age < ttl`. When `prefer_gzip` is set
    /// and a compressed variant exists it is returned instead.
    pub async fn lookup(
        &self,
        key: &StorageKey,
        ttl: Duration,
        prefer_gzip: bool,
        now: SystemTime,
    ) -> Option<StoredPage> {
        let dir = self.dir_for(key).ok()?;
        let created_at = modified(&dir.join(PAGE_FILE)).await?;
        if age_between(created_at, now) >= ttl {
            return None;
        }
        if prefer_gzip
            && let Some(body) = read_optional(&dir.join(GZIP_FILE)).await
        {
            return Some(StoredPage {
                body,
                encoding: Encoding::Gzip,
                created_at,
            });
        }
        let body = read_optional(&dir.join(PAGE_FILE)).await?;
        Some(StoredPage {
            body,
            encoding: Encoding::Identity,
            created_at,
        })
    }

    /// Replaces the entry atomically. Without `gzip` any stale compressed
    /// variant is removed.
    pub async fn write(
        &self,
        key: &StorageKey,
        body: &[u8],
        gzip: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        let dir = self.dir_for(key)?;
        let _guard = self.lock_key(key).await;
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io(&dir, err))?;

        match gzip {
            Some(compressed) => write_atomic(&dir, GZIP_FILE, compressed).await?,
            None => {
                remove_if_exists(&dir.join(GZIP_FILE)).await?;
            }
        }
        write_atomic(&dir, PAGE_FILE, body).await
    }

    /// Removes one entry. Missing entries are not an error.
    pub async fn delete(&self, key: &StorageKey) -> Result<bool, StoreError> {
        let dir = self.dir_for(key)?;
        let _guard = self.lock_key(key).await;
        let removed = remove_if_exists(&dir.join(PAGE_FILE)).await?;
        remove_if_exists(&dir.join(GZIP_FILE)).await?;
        Ok(removed)
    }

    /// Removes every entry under `prefix`, then the directories themselves.
    /// Returns the number of page entries deleted.
    ///
    /// Directories still holding files written concurrently are left behind.
    pub async fn delete_subtree(&self, prefix: &StorageKey) -> Result<usize, StoreError> {
        let top = self.dir_for(prefix)?;
        let mut removed = 0;
        let mut stack = vec![top];
        let mut visited = Vec::new();

        while let Some(dir) = stack.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::io(&dir, err)),
            };
            while let Some(item) = reader
                .next_entry()
                .await
                .map_err(|err| StoreError::io(&dir, err))?
            {
                let path = item.path();
                let file_type = match item.file_type().await {
                    Ok(file_type) => file_type,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(StoreError::io(&path, err)),
                };
                if file_type.is_dir() {
                    stack.push(path);
                } else if remove_if_exists(&path).await? && item.file_name() == PAGE_FILE {
                    removed += 1;
                }
            }
            visited.push(dir);
        }

        for dir in visited.iter().rev() {
            if let Err(err) = fs::remove_dir(dir).await {
                debug!(
                    target = "sitecache::cache::store",
                    path = %dir.display(),
                    error = %err,
                    "Left cache directory in place"
                );
            }
        }
        Ok(removed)
    }

    /// Time since the entry was written, or `None` if it does not exist.
    pub async fn age(&self, key: &StorageKey) -> Option<Duration> {
        self.age_at(key, SystemTime::now()).await
    }

    pub async fn age_at(&self, key: &StorageKey, now: SystemTime) -> Option<Duration> {
        let dir = self.dir_for(key).ok()?;
        let created_at = modified(&dir.join(PAGE_FILE)).await?;
        Some(age_between(created_at, now))
    }

    /// Walks the subtree under `prefix`, collecting entries, leftover temp
    /// files, and directories.
    pub async fn scan(&self, prefix: &StorageKey) -> Result<Scan, StoreError> {
        let top = self.dir_for(prefix)?;
        let mut scan = Scan::default();
        let mut stack = vec![top];

        while let Some(dir) = stack.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::io(&dir, err)),
            };
            while let Some(item) = reader
                .next_entry()
                .await
                .map_err(|err| StoreError::io(&dir, err))?
            {
                let path = item.path();
                let Ok(metadata) = item.metadata().await else {
                    continue;
                };
                if metadata.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                let name = item.file_name();
                if name == PAGE_FILE {
                    if let Some(key) = self.key_for_dir(&dir) {
                        scan.entries.push(ScannedEntry {
                            key,
                            created_at: modified,
                        });
                    }
                } else if name.to_string_lossy().starts_with(TEMP_PREFIX) {
                    scan.temp_files.push(ScannedFile { path, modified });
                }
            }
            scan.dirs.push(dir);
        }
        Ok(scan)
    }

    /// Deletes a leftover temp file found by [`PageStore::scan`].
    pub async fn remove_temp(&self, path: &Path) -> Result<bool, StoreError> {
        let is_temp = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(TEMP_PREFIX));
        if !is_temp || !path.starts_with(&self.root) {
            return Ok(false);
        }
        remove_if_exists(path).await
    }

    /// Removes the given directories when empty, deepest first. Returns how
    /// many were removed.
    pub async fn prune_empty_dirs(&self, dirs: &[PathBuf]) -> usize {
        let mut pruned = 0;
        for dir in dirs.iter().rev() {
            if dir == &self.root || !dir.starts_with(&self.root) {
                continue;
            }
            if fs::remove_dir(dir).await.is_ok() {
                pruned += 1;
            }
        }
        pruned
    }

    fn key_for_dir(&self, dir: &Path) -> Option<StorageKey> {
        let relative = dir.strip_prefix(&self.root).ok()?;
        let segments = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        if segments.is_empty() {
            return None;
        }
        Some(StorageKey::new(format!("{}/", segments.join("/"))))
    }
}

pub(crate) fn age_between(created_at: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(created_at).unwrap_or(Duration::ZERO)
}

async fn read_optional(path: &Path) -> Option<Bytes> {
    match fs::read(path).await {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(
                    target = "sitecache::cache::store",
                    path = %path.display(),
                    error = %err,
                    "Treating unreadable cache entry as a miss"
                );
            }
            None
        }
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).await.ok()?.modified().ok()
}

async fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let temp = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4().simple()));
    let target = dir.join(name);

    let result = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&temp, &target).await
    }
    .await;

    if let Err(err) = result {
        let _ = fs::remove_file(&temp).await;
        return Err(StoreError::io(&target, err));
    }
    Ok(())
}
