//! Durable local-filesystem storage backend.
//!
//! Objects are stored as plain files under a root directory, one file per
//! key (`tasks/01H.../record.json` maps to `<root>/tasks/01H.../record.json`).
//!
//! Writes are crash-safe:
//! 1. The payload is written to `<root>/.tmp/<ulid>` and fsynced
//! 2. Unconditional and version-matched writes `rename` the temp file over
//!    the target, which is atomic on POSIX filesystems
//! 3. Put-if-absent writes `hard_link` the temp file to the target, which
//!    fails if the target exists
//! 4. The parent directory is fsynced so the new entry survives power loss
//!
//! Readers therefore only ever see complete objects.
//!
//! The version token is the SHA-256 of the object content. Writes and deletes
//! hold an exclusive advisory lock on `<root>/.lock` for the whole
//! check-then-rename, so several processes (or several backends in one
//! process) may share a data directory without breaking compare-and-swap.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

const TMP_DIR: &str = ".tmp";
const LOCK_FILE: &str = ".lock";

/// Temp files younger than this may belong to a live writer and survive `open`.
pub const TMP_GRACE: Duration = Duration::from_secs(600);

/// Storage backend persisting objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
    writer: Arc<WriterLock>,
}

/// Serializes mutations: a mutex between threads of this backend, `flock`
/// between backends and processes.
#[derive(Debug)]
struct WriterLock {
    threads: Mutex<()>,
    file: File,
}

impl WriterLock {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_error("open", path, e))?;
        Ok(Self {
            threads: Mutex::new(()),
            file,
        })
    }

    fn with<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _thread = self
            .threads
            .lock()
            .map_err(|_| Error::storage("write lock poisoned"))?;
        FileExt::lock_exclusive(&self.file)
            .map_err(|e| Error::storage_with_source("lock data directory", e))?;
        let result = f();
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to unlock data directory");
        }
        result
    }
}

impl LocalFsBackend {
    /// Opens (creating if necessary) a backend rooted at `root`.
    ///
    /// Temp files older than [`TMP_GRACE`] are leftovers of a crashed writer
    /// and are removed; younger ones may belong to another live process.
    ///
    /// # Errors
    ///
    /// Returns an error if the root, temp directory or lock file cannot be
    /// created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let tmp = root.join(TMP_DIR);
        fs::create_dir_all(&tmp).map_err(|e| io_error("create", &tmp, e))?;
        let writer = WriterLock::open(&root.join(LOCK_FILE))?;

        let removed = remove_stale_tmp(&tmp, TMP_GRACE, SystemTime::now())?;
        tracing::debug!(root = %root.display(), removed, "opened local storage");
        Ok(Self {
            root,
            writer: Arc::new(writer),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn remove_stale_tmp(tmp: &Path, grace: Duration, now: SystemTime) -> Result<usize> {
    let entries = fs::read_dir(tmp).map_err(|e| io_error("read dir", tmp, e))?;
    let mut removed = 0;
    for entry in entries.flatten() {
        let modified = entry.metadata().and_then(|m| m.modified());
        let stale = modified.is_ok_and(|at| now.duration_since(at).is_ok_and(|age| age >= grace));
        if stale && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let target = resolve(&self.root, path)?;
        let key = path.to_string();
        blocking(move || {
            read_optional(&target)?
                .map(Bytes::from)
                .ok_or_else(|| Error::NotFound(format!("object not found: {key}")))
        })
        .await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let target = resolve(&self.root, path)?;
        let tmp_dir = self.root.join(TMP_DIR);
        let writer = Arc::clone(&self.writer);
        blocking(move || writer.with(|| put_blocking(&tmp_dir, &target, &data, &precondition)))
            .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = resolve(&self.root, path)?;
        let writer = Arc::clone(&self.writer);
        blocking(move || {
            writer.with(|| match fs::remove_file(&target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error("delete", &target, e)),
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        blocking(move || list_blocking(&root, &prefix)).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let target = resolve(&self.root, path)?;
        let key = path.to_string();
        blocking(move || {
            let Some(data) = read_optional(&target)? else {
                return Ok(None);
            };
            Ok(Some(meta_for(key, &target, &data)))
        })
        .await
    }
}

fn put_blocking(
    tmp_dir: &Path,
    target: &Path,
    data: &[u8],
    precondition: &WritePrecondition,
) -> Result<WriteResult> {
    if let WritePrecondition::MatchesVersion(expected) = precondition {
        let current = read_optional(target)?.map(|d| version_of(&d));
        match current {
            Some(version) if &version == expected => {}
            other => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: other.unwrap_or_default(),
                });
            }
        }
    }

    let parent = target
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("no parent for {}", target.display())))?;
    fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;

    let tmp = tmp_dir.join(Ulid::new().to_string());
    write_synced(&tmp, data)?;
    let version = version_of(data);

    if matches!(precondition, WritePrecondition::DoesNotExist) {
        let linked = fs::hard_link(&tmp, target);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let current_version = read_optional(target)?
                    .map(|d| version_of(&d))
                    .unwrap_or_default();
                return Ok(WriteResult::PreconditionFailed { current_version });
            }
            Err(e) => return Err(io_error("link", target, e)),
        }
    } else if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(io_error("rename", target, e));
    }

    sync_dir(parent)?;
    Ok(WriteResult::Success { version })
}

fn list_blocking(root: &Path, prefix: &str) -> Result<Vec<ObjectMeta>> {
    let base = match prefix.rfind('/') {
        Some(idx) => resolve(root, &prefix[..idx])?,
        None => root.to_path_buf(),
    };
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut stack = vec![base];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(io_error("read dir", &dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_error("read dir", &dir, e))?;
            let path = entry.path();
            let Some(key) = key_for(root, &path) else {
                continue;
            };
            if key.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| io_error("stat", &path, e))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if key.starts_with(prefix) {
                // Deleted between readdir and read: skip.
                if let Some(data) = read_optional(&path)? {
                    out.push(meta_for(key, &path, &data));
                }
            }
        }
    }
    Ok(out)
}

fn resolve(root: &Path, key: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    if key.is_empty() {
        return Err(Error::InvalidInput("empty storage key".into()));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment.starts_with('.') || segment.contains('\\') {
            return Err(Error::InvalidInput(format!("invalid storage key: {key:?}")));
        }
        path.push(segment);
    }
    Ok(path)
}

fn key_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn meta_for(key: String, path: &Path, data: &[u8]) -> ObjectMeta {
    let last_modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    ObjectMeta {
        path: key,
        size: data.len() as u64,
        version: version_of(data),
        last_modified,
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", path, e)),
    }
}

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| io_error("create", path, e))?;
    file.write_all(data).map_err(|e| io_error("write", path, e))?;
    file.sync_all().map_err(|e| io_error("fsync", path, e))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_error("fsync dir", dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn version_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn io_error(op: &str, path: &Path, source: std::io::Error) -> Error {
    Error::storage_with_source(format!("{op} {}", path.display()), source)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal {
            message: format!("storage task failed: {e}"),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalFsBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalFsBackend::open(dir.path()).expect("open");
        (dir, backend)
    }

    #[tokio::test]
    async fn objects_survive_reopen() {
        let (dir, backend) = backend();
        backend
            .put("tasks/a/record.json", Bytes::from("{}"), WritePrecondition::None)
            .await
            .expect("put");
        drop(backend);

        let reopened = LocalFsBackend::open(dir.path()).expect("reopen");
        let data = reopened.get("tasks/a/record.json").await.expect("get");
        assert_eq!(data, Bytes::from("{}"));
    }

    #[tokio::test]
    async fn does_not_exist_rejects_second_writer() {
        let (_dir, backend) = backend();
        let first = backend
            .put("k/v", Bytes::from("one"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(first.is_success());

        let second = backend
            .put("k/v", Bytes::from("two"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        let WriteResult::PreconditionFailed { current_version } = second else {
            panic!("expected precondition failure");
        };
        assert_eq!(current_version, version_of(b"one"));
        assert_eq!(backend.get("k/v").await.expect("get"), Bytes::from("one"));
    }

    #[tokio::test]
    async fn concurrent_put_if_absent_has_one_winner() {
        let (_dir, backend) = backend();
        let mut handles = Vec::new();
        for i in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .put(
                        "race/key",
                        Bytes::from(format!("writer-{i}")),
                        WritePrecondition::DoesNotExist,
                    )
                    .await
                    .expect("put")
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join").is_success() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn matches_version_uses_content_digest() {
        let (_dir, backend) = backend();
        let WriteResult::Success { version } = backend
            .put("cas/obj", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };

        let ok = backend
            .put(
                "cas/obj",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(version.clone()),
            )
            .await
            .expect("put");
        assert!(ok.is_success());

        let stale = backend
            .put(
                "cas/obj",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(version),
            )
            .await
            .expect("put");
        assert!(!stale.is_success());

        let missing = backend
            .put(
                "cas/none",
                Bytes::from("v1"),
                WritePrecondition::MatchesVersion("abc".into()),
            )
            .await
            .expect("put");
        assert!(!missing.is_success());
    }

    #[tokio::test]
    async fn list_walks_nested_keys_by_prefix() {
        let (_dir, backend) = backend();
        for key in [
            "tasks/a/chunks/0000000000.json",
            "tasks/a/chunks/0000000001.json",
            "tasks/a/record.json",
            "tasks/b/record.json",
        ] {
            backend
                .put(key, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }

        let mut chunks: Vec<_> = backend
            .list("tasks/a/chunks/")
            .await
            .expect("list")
            .into_iter()
            .map(|m| m.path)
            .collect();
        chunks.sort();
        assert_eq!(
            chunks,
            vec![
                "tasks/a/chunks/0000000000.json".to_string(),
                "tasks/a/chunks/0000000001.json".to_string(),
            ]
        );
        assert_eq!(backend.list("tasks/").await.expect("list").len(), 4);
        assert!(backend.list("nothing/").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn delete_and_head() {
        let (_dir, backend) = backend();
        backend
            .put("d/x", Bytes::from("data"), WritePrecondition::None)
            .await
            .expect("put");
        let meta = backend.head("d/x").await.expect("head").expect("exists");
        assert_eq!(meta.size, 4);
        assert!(meta.last_modified.is_some());

        backend.delete("d/x").await.expect("delete");
        backend.delete("d/x").await.expect("idempotent");
        assert!(backend.head("d/x").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let (_dir, backend) = backend();
        for key in ["../evil", "a//b", "/abs", ".tmp/x", ""] {
            let err = backend
                .put(key, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect_err("should reject");
            assert!(matches!(err, Error::InvalidInput(_)), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn fresh_temp_files_survive_reopen() {
        let (dir, backend) = backend();
        let in_flight = dir.path().join(TMP_DIR).join("in-flight");
        std::fs::write(&in_flight, b"partial").expect("write");

        let _second = LocalFsBackend::open(dir.path()).expect("reopen");
        assert!(in_flight.exists(), "another writer's temp file was removed");
        assert!(backend.list("").await.expect("list").is_empty());

        let later = SystemTime::now() + TMP_GRACE + Duration::from_secs(1);
        let removed = remove_stale_tmp(&dir.path().join(TMP_DIR), TMP_GRACE, later).expect("sweep");
        assert_eq!(removed, 1);
        assert!(!in_flight.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cas_is_exclusive_across_backends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = LocalFsBackend::open(dir.path()).expect("open");
        let b = LocalFsBackend::open(dir.path()).expect("open");
        a.put("counter", Bytes::from("0"), WritePrecondition::None)
            .await
            .expect("seed");

        let mut handles = Vec::new();
        for i in 0..8 {
            let backend = if i % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(tokio::spawn(async move {
                let mut applied = 0_u64;
                for _ in 0..10 {
                    loop {
                        let meta = backend.head("counter").await.expect("head").expect("exists");
                        let data = backend.get("counter").await.expect("get");
                        if version_of(&data) != meta.version {
                            continue;
                        }
                        let value: u64 = std::str::from_utf8(&data)
                            .expect("utf8")
                            .parse()
                            .expect("number");
                        let next = Bytes::from((value + 1).to_string());
                        let result = backend
                            .put("counter", next, WritePrecondition::MatchesVersion(meta.version))
                            .await
                            .expect("put");
                        if result.is_success() {
                            applied += 1;
                            break;
                        }
                    }
                }
                applied
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.expect("join");
        }
        let data = a.get("counter").await.expect("get");
        assert_eq!(total, 80);
        assert_eq!(std::str::from_utf8(&data).expect("utf8"), "80");
    }
}
