// File-backed phonebook: one file per record name under a root directory.
//
// Operations on the same name are serialized in-process; the root directory
// is guarded by an advisory lock so only one server process owns it.
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::error::{Error, ErrorKind, map_io_error_kind};
use crate::core::protocol::LINE_DELIMITER;

pub const DEFAULT_STORE_DIR: &str = "rksok_phonebook";
const LOCK_FILE: &str = ".rksok.lock";

#[derive(Debug)]
pub struct RecordStore {
    root: PathBuf,
    names: NameLocks,
    _lock: File,
}

impl RecordStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|err| io_error("failed to create store directory", &root, err))?;

        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| io_error("failed to open store lock", &lock_path, err))?;
        lock.try_lock_exclusive().map_err(|err| {
            let kind = lock_error_kind(&err);
            let message = match kind {
                ErrorKind::Busy => "store directory is locked by another process",
                _ => "failed to lock store directory",
            };
            Error::new(kind)
                .with_message(message)
                .with_path(&root)
                .with_source(err)
        })?;

        Ok(Self {
            root,
            names: NameLocks::default(),
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(record_file_name(name))
    }

    /// Writes `phones` as the whole record, replacing any previous content.
    pub async fn put(&self, name: &str, phones: &[String]) -> Result<(), Error> {
        let _guard = self.names.acquire(name).await;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| io_error("failed to create store directory", &self.root, err))?;
        let path = self.record_path(name);
        tracing::debug!(path = %path.display(), lines = phones.len(), "writing record");
        tokio::fs::write(&path, phones.join(LINE_DELIMITER))
            .await
            .map_err(|err| io_error("failed to write record", &path, err))
    }

    pub async fn get(&self, name: &str) -> Result<Option<Vec<String>>, Error> {
        let _guard = self.names.acquire(name).await;
        let path = self.record_path(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "record does not exist");
                return Ok(None);
            }
            Err(err) => return Err(io_error("failed to read record", &path, err)),
        };
        tracing::debug!(path = %path.display(), "read record");
        let phones = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Some(phones))
    }

    /// Returns `false` when there was nothing to delete.
    pub async fn delete(&self, name: &str) -> Result<bool, Error> {
        let _guard = self.names.acquire(name).await;
        let path = self.record_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed record");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error("failed to remove record", &path, err)),
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, Error> {
        let path = self.record_path(name);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|err| io_error("failed to stat record", &path, err))
    }
}

/// Maps a record name to a file name that stays inside the store root.
///
/// `%`, `/`, `\`, NUL and a leading `.` are percent-escaped; everything else
/// is kept, so ordinary names are stored under their own name.
pub fn record_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (idx, ch) in name.chars().enumerate() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            '\0' => out.push_str("%00"),
            '.' if idx == 0 => out.push_str("%2E"),
            _ => out.push(ch),
        }
    }
    out
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let contended = fs2::lock_contended_error();
    if err.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error() {
        return ErrorKind::Busy;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn io_error(message: &str, path: &Path, err: io::Error) -> Error {
    Error::new(map_io_error_kind(&err))
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

#[derive(Debug, Default)]
struct NameLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NameLocks {
    async fn acquire(&self, name: &str) -> NameGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
            map.entry(name.to_string()).or_default().clone()
        };
        NameGuard {
            locks: self,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn prune(&self, name: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        if map.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(name);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner()).len()
    }
}

struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(&self.name);
    }
}
