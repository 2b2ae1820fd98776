use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;

use super::{BackendStats, CacheBackend};

/// In-process backend. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8], _ttl: Option<Duration>) -> Result<()> {
        self.entries().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries().clear();
        Ok(())
    }

    fn stats(&self) -> Result<BackendStats> {
        let entries = self.entries();
        Ok(BackendStats {
            entries: Some(entries.len()),
            bytes: Some(entries.values().map(|v| v.len() as u64).sum()),
        })
    }
}
