//! Snapshot file storage.

use serde::Serialize;
use walkdir::WalkDir;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::{ProfilerError, ProfilerResult};

pub const SNAPSHOT_EXTENSION: &str = "cpu";

/// Writer for one snapshot file. `close` flushes and syncs it.
pub trait SnapshotWriter: Write {
    fn close(self: Box<Self>) -> io::Result<()>;
}

pub trait FileStore: Send + Sync {
    /// Creates a new file. Fails with `AlreadyExists` instead of replacing
    /// an existing one.
    fn create(&self, path: &Path) -> io::Result<Box<dyn SnapshotWriter>>;
    fn delete(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileStore;

struct LocalWriter {
    inner: BufWriter<File>,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl SnapshotWriter for LocalWriter {
    fn close(self: Box<Self>) -> io::Result<()> {
        let file = self.inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

impl FileStore for LocalFileStore {
    fn create(&self, path: &Path) -> io::Result<Box<dyn SnapshotWriter>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(LocalWriter {
            inner: BufWriter::new(OpenOptions::new().write(true).create_new(true).open(path)?),
        }))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

pub fn snapshot_path(base: &Path, session: &str, captured_at_ms: i64) -> PathBuf {
    base.join(session)
        .join(format!("{captured_at_ms}.{SNAPSHOT_EXTENSION}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub session: String,
    pub path: PathBuf,
    pub captured_at_ms: i64,
}

/// Snapshot files under `base`, oldest first. Files whose stem is not a
/// timestamp are skipped.
pub fn list_snapshot_files(base: &Path, session: Option<&str>) -> ProfilerResult<Vec<SnapshotFile>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(base).min_depth(2).max_depth(2).follow_links(false) {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            ProfilerError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other(msg)))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
            continue;
        }
        let Some(dir) = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
        else {
            continue;
        };
        if session.is_some_and(|s| s != dir) {
            continue;
        }
        let Some(captured_at_ms) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        else {
            continue;
        };
        out.push(SnapshotFile {
            session: dir.to_string(),
            path: path.to_path_buf(),
            captured_at_ms,
        });
    }
    out.sort_by(|a, b| {
        a.captured_at_ms
            .cmp(&b.captured_at_ms)
            .then_with(|| a.session.cmp(&b.session))
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_base() -> PathBuf {
        std::env::temp_dir().join(format!("jprof-snapshots-{}", Uuid::new_v4()))
    }

    #[test]
    fn local_store_writes_and_deletes() {
        let base = temp_base();
        let path = snapshot_path(&base, "1@localhost", 10);
        let mut writer = LocalFileStore.create(&path).expect("create");
        writer.write_all(b"hello").expect("write");
        writer.close().expect("close");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "hello");

        LocalFileStore.delete(&path).expect("delete");
        assert!(!path.exists());
        LocalFileStore.delete(&path).expect("delete twice");
    }

    #[test]
    fn local_store_never_replaces_an_existing_snapshot() {
        let base = temp_base();
        let path = snapshot_path(&base, "1@localhost", 10);
        let mut writer = LocalFileStore.create(&path).expect("create");
        writer.write_all(b"first").expect("write");
        writer.close().expect("close");

        let err = LocalFileStore.create(&path).err().expect("already exists");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "first");
    }

    #[test]
    fn listing_filters_by_session_and_sorts_by_time() {
        let base = temp_base();
        for (session, ms) in [("1@a", 30), ("1@a", 10), ("2@b", 20)] {
            let path = snapshot_path(&base, session, ms);
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            std::fs::write(&path, "").expect("write");
        }
        std::fs::write(base.join("1@a").join("notes.txt"), "").expect("write");

        let all = list_snapshot_files(&base, None).expect("list");
        let times: Vec<i64> = all.iter().map(|f| f.captured_at_ms).collect();
        assert_eq!(times, vec![10, 20, 30]);

        let only = list_snapshot_files(&base, Some("2@b")).expect("list");
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].session, "2@b");
    }

    #[test]
    fn missing_base_lists_nothing() {
        assert!(list_snapshot_files(&temp_base(), None).expect("list").is_empty());
    }
}
