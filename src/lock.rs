//! Cross-process write locks on block files
//!
//! A lock on `file.bin` is the existence of `file.bin.lock`, created with
//! `create_new`. Inside one process a reference count per filename makes
//! the lock re-entrant: only the first acquirer creates the marker and only
//! the last releaser removes it.

use crate::error::{IdxError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// OS-level advisory lock held through a sibling `.lock` file. Dropping it
/// removes the marker.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    pub fn lock_path(path: impl AsRef<Path>) -> PathBuf {
        let mut s = path.as_ref().as_os_str().to_os_string();
        s.push(".lock");
        PathBuf::from(s)
    }

    /// Block until the marker can be created
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let lock_path = Self::lock_path(&path);
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let pid = std::process::id();
        let mut last_info = Instant::now();
        let mut waited = false;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    if waited {
                        info!(pid, lock = %lock_path.display(), "got file lock");
                    }
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(IdxError::Io(e)),
            }

            if last_info.elapsed() > Duration::from_secs(1) {
                info!(pid, lock = %lock_path.display(), "waiting for lock");
                last_info = Instant::now();
                waited = true;
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn release(mut self) -> Result<()> {
        let lock_path = std::mem::take(&mut self.lock_path);
        std::fs::remove_file(&lock_path).map_err(|e| {
            IdxError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot remove lock file {}", lock_path.display()),
            ))
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.lock_path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!(lock = %self.lock_path.display(), error = %e, "cannot remove lock file");
        }
    }
}

/// Pause between two attempts on a contended marker
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// The marker of one file, filled by the first acquirer that gets it
type Slot = Arc<Mutex<Option<FileLock>>>;

#[derive(Debug, Default)]
struct Entry {
    count: usize,
    slot: Slot,
}

/// Re-entrant write locks keyed by filename.
///
/// The table mutex only guards the reference counts. Waiting for a marker
/// held by another process happens on a blocking thread, under the slot of
/// that one file.
#[derive(Debug, Default)]
pub struct WriteLockTable {
    entries: Mutex<HashMap<String, Entry>>,
    verbose: bool,
}

impl WriteLockTable {
    pub fn new(verbose: bool) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            verbose,
        })
    }

    /// Count one more holder. The guard exists before any waiting and gives
    /// the reference back if the acquire fails or is dropped.
    fn reserve(self: &Arc<Self>, filename: &str) -> (WriteLockGuard, Slot) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(filename.to_string()).or_default();
        entry.count += 1;
        let slot = Arc::clone(&entry.slot);
        let guard = WriteLockGuard {
            table: Arc::clone(self),
            filename: filename.to_string(),
        };
        (guard, slot)
    }

    fn fill(slot: &Slot, filename: &str, verbose: bool) -> Result<()> {
        let mut held = slot.lock();
        if held.is_none() {
            *held = Some(FileLock::acquire(filename)?);
            if verbose {
                info!(filename, "locked file");
            }
        }
        Ok(())
    }

    pub async fn acquire(self: &Arc<Self>, filename: &str) -> Result<WriteLockGuard> {
        let (guard, slot) = self.reserve(filename);
        let already_held = slot.try_lock().map_or(false, |held| held.is_some());
        if already_held {
            return Ok(guard);
        }
        let path = filename.to_string();
        let verbose = self.verbose;
        tokio::task::spawn_blocking(move || Self::fill(&slot, &path, verbose))
            .await
            .map_err(|e| IdxError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??;
        Ok(guard)
    }

    fn release(&self, filename: &str) {
        let entry = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(filename) else {
                return;
            };
            entry.count -= 1;
            if entry.count > 0 {
                return;
            }
            entries.remove(filename)
        };
        let Some(entry) = entry else {
            return;
        };
        // a cancelled acquire may still be waiting on the slot; its marker
        // goes away with the slot
        let lock = entry.slot.try_lock().and_then(|mut held| held.take());
        if let Some(lock) = lock {
            match lock.release() {
                Ok(()) if self.verbose => info!(filename, "unlocked file"),
                Ok(()) => {}
                Err(e) => warn!(filename, error = %e, "failed to release write lock"),
            }
        }
    }

    pub fn refcount(&self, filename: &str) -> usize {
        self.entries.lock().get(filename).map(|e| e.count).unwrap_or(0)
    }

    pub fn is_locked(&self, filename: &str) -> bool {
        self.refcount(filename) > 0
    }
}

/// Releases one reference on drop
#[derive(Debug)]
pub struct WriteLockGuard {
    table: Arc<WriteLockTable>,
    filename: String,
}

impl WriteLockGuard {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        self.table.release(&self.filename);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_refcount() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("data/0000.bin");
        let filename = filename.to_str().unwrap();
        let marker = FileLock::lock_path(filename);

        let table = WriteLockTable::new(false);
        let mut guards = Vec::new();
        for _ in 0..4 {
            guards.push(table.acquire(filename).await.unwrap());
        }
        assert_eq!(table.refcount(filename), 4);
        assert!(marker.exists());

        let extra = table.acquire(filename).await.unwrap();
        assert_eq!(table.refcount(filename), 5);
        drop(guards);
        assert!(marker.exists());
        assert!(table.is_locked(filename));

        drop(extra);
        assert!(!table.is_locked(filename));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_release_on_error_path() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("f.bin");
        let filename = filename.to_str().unwrap().to_string();
        let table = WriteLockTable::new(false);

        let result: Result<()> = async {
            let _guard = table.acquire(&filename).await?;
            Err(IdxError::Encode("boom".to_string()))
        }
        .await;
        assert!(result.is_err());
        assert_eq!(table.refcount(&filename), 0);
        assert!(!FileLock::lock_path(&filename).exists());
    }

    #[test]
    fn test_contended_lock_waits() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shared.bin");
        let first = FileLock::acquire(&path).unwrap();

        let p = path.clone();
        let waiter = std::thread::spawn(move || FileLock::acquire(p).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        first.release().unwrap();
        let second = waiter.join().unwrap();
        second.release().unwrap();
        assert!(!FileLock::lock_path(&path).exists());
    }

    /// A file held by another process does not stall the rest of the table
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiting_acquire_leaves_table_free() {
        let temp_dir = TempDir::new().unwrap();
        let busy = temp_dir.path().join("busy.bin").to_string_lossy().into_owned();
        let free = temp_dir.path().join("free.bin").to_string_lossy().into_owned();
        let foreign = FileLock::acquire(&busy).unwrap();

        let table = WriteLockTable::new(false);
        let waiting = tokio::spawn({
            let table = Arc::clone(&table);
            let busy = busy.clone();
            async move { table.acquire(&busy).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert_eq!(table.refcount(&busy), 1);

        let other = tokio::time::timeout(Duration::from_secs(1), table.acquire(&free))
            .await
            .expect("acquire of another file is not blocked")
            .unwrap();
        assert_eq!(table.refcount(&free), 1);
        drop(other);
        assert!(!table.is_locked(&free));

        foreign.release().unwrap();
        let guard = waiting.await.unwrap().unwrap();
        assert_eq!(guard.filename(), busy);
        assert!(FileLock::lock_path(&busy).exists());
        drop(guard);
        assert!(!FileLock::lock_path(&busy).exists());
    }
}
