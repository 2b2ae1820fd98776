//! On-disk backend: one JSON file per key under a cache directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendStats, CacheBackend};

const ENTRY_EXTENSION: &str = "json";

/// Stores each entry as `<sha256(key)>.json`. Writes are atomic (temp file +
/// rename), so a crash never leaves a torn entry behind.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
    max_entries: Option<usize>,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_entries: None,
        }
    }

    /// Evict the oldest entries once more than `max_entries` are stored.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{digest}.{ENTRY_EXTENSION}"))
    }

    fn entry_files(&self) -> Result<Vec<(PathBuf, SystemTime, u64)>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read cache dir {}", self.dir.display()));
            }
        };
        let mut files = Vec::new();
        for entry in read_dir {
            let entry = entry.with_context(|| format!("read cache dir {}", self.dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let meta = entry
                .metadata()
                .with_context(|| format!("stat {}", path.display()))?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((path, modified, meta.len()));
        }
        Ok(files)
    }

    /// Remove the oldest entries beyond `max_entries`, never touching `keep`.
    fn evict_oldest(&self, max_entries: usize, keep: &Path) -> Result<()> {
        let mut files = self.entry_files()?;
        if files.len() <= max_entries {
            return Ok(());
        }
        files.retain(|(path, _, _)| path != keep);
        files.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let excess = (files.len() + 1).saturating_sub(max_entries);
        for (path, _, _) in files.into_iter().take(excess) {
            if let Err(err) = remove_if_exists(&path) {
                warn!(path = %path.display(), err = %err, "failed to evict cache entry");
            }
        }
        debug!(evicted = excess, "evicted oldest cache entries");
        Ok(())
    }
}

impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read cache entry {}", path.display())),
        }
    }

    fn set(&self, key: &str, bytes: &[u8], _ttl: Option<Duration>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create cache dir {}", self.dir.display()))?;
        let path = self.entry_path(key);
        let tmp_path = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp_path, bytes)
            .with_context(|| format!("write temp cache entry {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replace cache entry {}", path.display()))?;

        if let Some(max_entries) = self.max_entries {
            self.evict_oldest(max_entries, &path)?;
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        remove_if_exists(&self.entry_path(key))
    }

    fn clear(&self) -> Result<()> {
        for (path, _, _) in self.entry_files()? {
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    fn stats(&self) -> Result<BackendStats> {
        let files = self.entry_files()?;
        Ok(BackendStats {
            entries: Some(files.len()),
            bytes: Some(files.iter().map(|(_, _, len)| len).sum()),
        })
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove cache entry {}", path.display())),
    }
}
