//! Fingerprint-keyed cache with TTL over pluggable backends.
//!
//! Values are wrapped in a versioned JSON [`CacheEntry`] envelope before they
//! reach a backend. Expiry is decided here, against an injectable [`Clock`],
//! so every backend treats an expired entry as a miss and drops it lazily.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub mod clock;
pub mod file;
pub mod memory;
pub mod remote;

pub use clock::{Clock, ManualClock, SystemClock};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use remote::RemoteBackend;

/// Envelope version written by this build. Other versions read as misses.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Storage behind a [`Cache`]. Keys are fingerprints, values are envelope bytes.
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// `ttl` is advisory; backends that can expire entries natively may use it.
    fn set(&self, key: &str, bytes: &[u8], ttl: Option<Duration>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn stats(&self) -> Result<BackendStats>;
}

/// Size information a backend can report. `None` when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub entries: Option<usize>,
    pub bytes: Option<u64>,
}

/// Persisted form of a cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub schema_version: u32,
    pub fingerprint: String,
    pub created_at_ms: i64,
    /// `None` means the entry never expires.
    pub expires_at_ms: Option<i64>,
    pub value: Value,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|expires| now_ms >= expires)
    }
}

/// Hit/miss counters plus backend size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub expired: u64,
    pub entries: Option<usize>,
    pub bytes: Option<u64>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    expired: AtomicU64,
}

/// Shared handle to a cache. Cloning is cheap; clones share backend and counters.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    default_ttl: Option<Duration>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("backend", &self.backend.name())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            default_ttl: None,
            counters: Arc::default(),
        }
    }

    /// In-process cache with no expiry, for tests and one-shot runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// TTL applied by [`Cache::set`] when the caller passes `None`.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Build the backend described by `config`. Relative paths resolve against `base_dir`.
    pub fn from_config(config: &CacheConfig, base_dir: &Path) -> Result<Self> {
        let backend: Arc<dyn CacheBackend> = match &config.backend {
            BackendConfig::Memory => Arc::new(MemoryBackend::new()),
            BackendConfig::File { dir, max_entries } => {
                let dir = if dir.is_absolute() {
                    dir.clone()
                } else {
                    base_dir.join(dir)
                };
                let mut backend = FileBackend::new(dir);
                if let Some(max) = max_entries {
                    backend = backend.with_max_entries(*max);
                }
                Arc::new(backend)
            }
            BackendConfig::Remote {
                base_url,
                prefix,
                timeout_secs,
            } => Arc::new(RemoteBackend::new(
                base_url,
                prefix,
                Duration::from_secs(*timeout_secs),
            )?),
        };
        Ok(Self::new(backend).with_default_ttl(config.default_ttl_secs.map(Duration::from_secs)))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Fetch a live value. Expired, foreign-version and undecodable entries are misses.
    pub fn get(&self, fingerprint: &str) -> Result<Option<Value>> {
        let Some(bytes) = self.backend.get(fingerprint)? else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry)
                if entry.schema_version == CACHE_SCHEMA_VERSION
                    && entry.fingerprint == fingerprint =>
            {
                entry
            }
            Ok(_) | Err(_) => {
                debug!(fingerprint, "discarding unreadable cache entry");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if entry.is_expired(self.now_ms()) {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.backend.delete(fingerprint) {
                warn!(fingerprint, err = %err, "failed to drop expired cache entry");
            }
            return Ok(None);
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry.value))
    }

    /// Store `value` under `fingerprint`. `ttl = None` uses the default TTL.
    pub fn set(&self, fingerprint: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.or(self.default_ttl);
        let created_at_ms = self.now_ms();
        let expires_at_ms = ttl.map(|ttl| {
            created_at_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        });
        let entry = CacheEntry {
            schema_version: CACHE_SCHEMA_VERSION,
            fingerprint: fingerprint.to_string(),
            created_at_ms,
            expires_at_ms,
            value,
        };
        let bytes = serde_json::to_vec(&entry).context("serialize cache entry")?;
        self.backend
            .set(fingerprint, &bytes, ttl)
            .with_context(|| format!("write cache entry {fingerprint}"))?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete(&self, fingerprint: &str) -> Result<()> {
        self.backend.delete(fingerprint)
    }

    pub fn clear(&self) -> Result<()> {
        self.backend.clear()
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let backend = self.backend.stats()?;
        Ok(CacheStats {
            backend: self.backend.name(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            entries: backend.entries,
            bytes: backend.bytes,
        })
    }

    /// Best-effort typed read: backend errors and shape mismatches are logged misses.
    pub fn lookup<T: DeserializeOwned>(&self, fingerprint: &str) -> Option<T> {
        let value = match self.get(fingerprint) {
            Ok(value) => value?,
            Err(err) => {
                warn!(fingerprint, err = %format!("{err:#}"), "cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                warn!(fingerprint, err = %err, "cached value has unexpected shape");
                None
            }
        }
    }

    /// Best-effort typed write: failures are logged and swallowed.
    pub fn store<T: Serialize>(&self, fingerprint: &str, value: &T, ttl: Option<Duration>) {
        let result = serde_json::to_value(value)
            .map_err(|err| anyhow!("serialize cached value: {err}"))
            .and_then(|value| self.set(fingerprint, value, ttl));
        if let Err(err) = result {
            warn!(fingerprint, err = %format!("{err:#}"), "cache write failed");
        }
    }
}

/// `[cache]` section of the orchestrator config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default TTL for entries written without an explicit one. Absent means no expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_ttl_secs: Option<u64>,
    pub backend: BackendConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: Some(7 * 24 * 60 * 60),
            backend: BackendConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_secs == Some(0) {
            return Err(anyhow!("cache.default_ttl_secs must be > 0 when set"));
        }
        match &self.backend {
            BackendConfig::Memory => {}
            BackendConfig::File { dir, max_entries } => {
                if dir.as_os_str().is_empty() {
                    return Err(anyhow!("cache.backend.dir must not be empty"));
                }
                if *max_entries == Some(0) {
                    return Err(anyhow!("cache.backend.max_entries must be > 0 when set"));
                }
            }
            BackendConfig::Remote {
                base_url,
                timeout_secs,
                ..
            } => {
                if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                    return Err(anyhow!("cache.backend.base_url must be an http(s) URL"));
                }
                if *timeout_secs == 0 {
                    return Err(anyhow!("cache.backend.timeout_secs must be > 0"));
                }
            }
        }
        Ok(())
    }
}

/// Which backend stores cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory,
    File {
        dir: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_entries: Option<usize>,
    },
    Remote {
        base_url: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_remote_timeout_secs")]
        timeout_secs: u64,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::File {
            dir: PathBuf::from("cache"),
            max_entries: Some(10_000),
        }
    }
}

fn default_remote_timeout_secs() -> u64 {
    10
}
