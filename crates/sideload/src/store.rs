//! Sandboxed file store.
//!
//! All synchronized files live under a single root directory. Client paths
//! are always resolved through [`RelativePath`], which normalizes the path
//! lexically and refuses anything that would leave the root.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use serde::Serialize;
use thiserror::Error;

/// Suffix of in-flight upload files. Never listed, and reserved: clients
/// cannot name a file with it.
const PARTIAL_SUFFIX: &str = ".sideload-partial";

/// Format used when rendering whole-second modification times to clients.
const MTIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Same, for times with a sub-second part.
const MTIME_FORMAT_MICROS: &str = "%Y-%m-%dT%H:%M:%S%.6f";

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors that can occur during file store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Path is empty or contains forbidden characters
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// Path would resolve outside the sandbox root
    #[error("path escapes sandbox root: {0}")]
    OutsideRoot(String),
    /// Modification time could not be parsed
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A normalized path relative to the sandbox root.
///
/// Segments are joined with `/` regardless of host conventions. Leading
/// separators are ignored, `\` is accepted as a separator, `.` segments are
/// dropped and `..` removes the previous segment. A `..` with nothing left
/// to remove is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativePath(String);

impl RelativePath {
    /// Parse and normalize a client-supplied path.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        if raw.contains('\0') {
            return Err(StoreError::InvalidPath(raw.escape_debug().to_string()));
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(StoreError::OutsideRoot(raw.to_string()));
                    }
                }
                s => segments.push(s),
            }
        }

        match segments.last() {
            None => return Err(StoreError::InvalidPath(raw.to_string())),
            Some(name) if name.ends_with(PARTIAL_SUFFIX) => {
                return Err(StoreError::InvalidPath(format!(
                    "{raw} (the {PARTIAL_SUFFIX} suffix is reserved)"
                )));
            }
            Some(_) => {}
        }

        Ok(Self(segments.join("/")))
    }

    /// The normalized, `/`-separated form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(self.0.split('/'));
        path
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file in the sandbox, as reported to the operator tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Path relative to the sandbox root, `/`-separated
    pub filepath: String,
    /// Last modification time
    #[serde(serialize_with = "serialize_mtime")]
    pub mtime: DateTime<Local>,
    /// Size in bytes
    pub size: u64,
}

fn serialize_mtime<S>(mtime: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_str(&format_timestamp(mtime))
}

/// Render a timestamp the way listings report it: naive local ISO-8601,
/// with six fractional digits, or none when the microseconds are zero.
pub fn format_timestamp(mtime: &DateTime<Local>) -> String {
    let naive = mtime.naive_local();
    let format = if naive.nanosecond() / 1_000 == 0 {
        MTIME_FORMAT
    } else {
        MTIME_FORMAT_MICROS
    };
    naive.format(format).to_string()
}

/// Parse a client-supplied modification time.
///
/// RFC 3339 values carry their own offset. Naive ISO-8601 values (with `T`
/// or a space between date and time, or a bare date) are taken as local
/// time.
pub fn parse_timestamp(raw: &str) -> Result<SystemTime, StoreError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.into());
    }

    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN)))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(SystemTime::from)
        .ok_or_else(|| StoreError::InvalidTimestamp(raw.to_string()))
}

/// Sandboxed directory tree holding synchronized files.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to its location on disk.
    pub fn resolve(&self, path: &RelativePath) -> PathBuf {
        path.to_path(&self.root)
    }

    /// Walk the whole tree and return every regular file, sorted by path.
    ///
    /// Symbolic links are not followed. A missing root is an empty store.
    pub async fn list(&self) -> Result<Vec<FileRecord>, StoreError> {
        let mut records = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // Missing root, or a directory deleted mid-walk.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    tracing::warn!("Skipping non UTF-8 file name in {:?}", dir);
                    continue;
                };
                let filepath = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", prefix, name)
                };

                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), filepath));
                } else if file_type.is_file() && !name.ends_with(PARTIAL_SUFFIX) {
                    let meta = entry.metadata().await?;
                    records.push(FileRecord {
                        filepath,
                        mtime: DateTime::from(meta.modified()?),
                        size: meta.len(),
                    });
                }
            }
        }

        records.sort_by(|a, b| a.filepath.cmp(&b.filepath));
        Ok(records)
    }

    /// Read a file's full contents.
    pub async fn read(&self, path: &RelativePath) -> Result<Vec<u8>, StoreError> {
        Ok(tokio::fs::read(self.resolve(path)).await?)
    }

    /// Write `data` to `path` and set its modification time to `modified`.
    ///
    /// The body lands in a sibling partial file first, then is renamed over
    /// the target. Parent directories are created as needed; the access time
    /// is left alone.
    pub async fn write(
        &self,
        path: &RelativePath,
        data: Vec<u8>,
        modified: SystemTime,
    ) -> Result<FileRecord, StoreError> {
        let target = self.resolve(path);
        let filepath = path.as_str().to_string();

        let size = tokio::task::spawn_blocking(move || write_file(&target, &data, modified))
            .await
            .map_err(std::io::Error::other)??;

        Ok(FileRecord {
            filepath,
            mtime: DateTime::from(modified),
            size,
        })
    }

    /// Delete a file. Returns `false` if it did not exist.
    pub async fn delete(&self, path: &RelativePath) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_file(target: &Path, data: &[u8], modified: SystemTime) -> std::io::Result<u64> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::other("target has no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::other("target has no file name"))?;
    let partial = parent.join(format!(
        ".{}.{}.{}{}",
        name,
        std::process::id(),
        PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed),
        PARTIAL_SUFFIX
    ));

    let written =
        write_partial(&partial, data, modified).and_then(|()| std::fs::rename(&partial, target));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }

    Ok(data.len() as u64)
}

fn write_partial(partial: &Path, data: &[u8], modified: SystemTime) -> std::io::Result<()> {
    let mut file = std::fs::File::create(partial)?;
    file.write_all(data)?;
    file.set_times(std::fs::FileTimes::new().set_modified(modified))?;
    file.sync_all()
}
