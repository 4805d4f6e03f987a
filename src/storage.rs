//! Durable storage primitives for the event pipeline.
//!
//! Everything here is deliberately boring: append-only JSONL logs, plain-text
//! cursor files, atomic replace-on-write for shared JSON documents, and a
//! cooperative lock file. All coordination between components goes through
//! these files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Storage failures split by how a caller should react: `Io` is retryable
/// (disk full, locked file, transient), `Schema` is permanent (the bytes on
/// disk do not parse as what we expect).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema: {0}")]
    Schema(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

/// Append one value as a single JSON line. Creates the file (and parent
/// directories) on first write.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(value).map_err(|e| StoreError::Schema(e.to_string()))?;
    line.push(b'\n');

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut w = BufWriter::new(file);
    w.write_all(&line)?;
    w.flush()?;
    Ok(())
}

/// Write a JSON document atomically: serialize to `<path>.tmp`, then rename
/// over the target. Readers never observe a half-written file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| StoreError::Schema(e.to_string()))?;

    let tmp = tmp_path(path);
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Read a whole-file JSON document. A missing file is `Ok(None)`; unparseable
/// bytes are a schema error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Schema(format!("{}: {}", path.display(), e)))
}

/// Persisted byte offset into a log file. One writer per cursor, so no
/// locking; just best-effort plain-text writes.
pub struct Cursor {
    path: PathBuf,
}

impl Cursor {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> u64 {
        match fs::read_to_string(&self.path) {
            Ok(s) => s.trim().parse::<u64>().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Best-effort save; a failed flush costs a re-read on restart, which the
    /// dedupe layer absorbs.
    pub fn save(&self, pos: u64) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(&self.path, pos.to_string()) {
            warn!(path = %self.path.display(), pos, "failed to save cursor: {e}");
        }
    }
}

/// How long a lock file may sit on disk before we assume its owner died and
/// break it.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(20);

/// Cooperative lock file guarding multi-writer JSON documents.
///
/// Acquisition is bounded: after `timeout` we fail open and proceed unlocked,
/// trading strict mutual exclusion for liveness. Callers can check `held()`
/// but are expected to continue either way.
pub struct FileLock {
    path: PathBuf,
    held: bool,
}

impl FileLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Self {
        let start = Instant::now();
        loop {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Self { path: path.to_path_buf(), held: true };
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(path) {
                        debug!(path = %path.display(), "breaking stale lock file");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    if start.elapsed() >= timeout {
                        warn!(
                            path = %path.display(),
                            timeout_ms = timeout.as_millis() as u64,
                            "lock acquisition timed out; proceeding unlocked"
                        );
                        return Self { path: path.to_path_buf(), held: false };
                    }
                    std::thread::sleep(LOCK_RETRY_SLEEP);
                }
                Err(e) => {
                    warn!(path = %path.display(), "lock file error: {e}; proceeding unlocked");
                    return Self { path: path.to_path_buf(), held: false };
                }
            }
        }
    }

    pub fn held(&self) -> bool {
        self.held
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > LOCK_STALE_AFTER)
        .unwrap_or(false)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Read every complete line past `offset`, returning the new offset.
///
/// Detects truncation (file shrank below the cursor) and restarts from zero.
/// Each line is handed to `on_line`; I/O errors abort the batch but keep the
/// offset consistent with what was actually consumed.
pub fn read_new_lines(
    path: &Path,
    offset: u64,
    mut on_line: impl FnMut(&str, u64),
) -> Result<u64, StoreError> {
    use std::io::{BufRead, BufReader, Seek, SeekFrom};

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(offset),
        Err(e) => return Err(e.into()),
    };

    let size = file.metadata()?.len();
    let mut pos = offset;
    if pos > size {
        warn!(
            path = %path.display(),
            size,
            cursor = pos,
            "log truncated below cursor; resetting to 0"
        );
        pos = 0;
    }

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(pos))?;

    let mut buf = String::new();
    loop {
        buf.clear();
        let n = reader.read_line(&mut buf)?;
        if n == 0 {
            break;
        }
        // Hold back a partial trailing line (no newline yet): the writer is
        // mid-append and we'll pick it up complete next poll.
        if !buf.ends_with('\n') {
            break;
        }
        pos += n as u64;
        on_line(buf.trim_end(), pos);
    }

    Ok(pos)
}
