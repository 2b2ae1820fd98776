//! Retrieval over completed work.
//!
//! Every history entry is embedded once when it is added. Queries return the
//! most similar entries first; equal scores prefer the more recent entry.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::Cache;
use crate::core::fingerprint::Fingerprint;
use crate::core::similarity::cosine_similarity;
use crate::core::types::HistoryEntry;

pub mod embedding;
pub mod remote;

pub use embedding::{Embedder, HashingEmbedder};
pub use remote::{OllamaEmbedder, OpenAiEmbedder};

/// Lifetime of a cached query embedding.
pub const EMBEDDING_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// `[context]` section of the orchestrator config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Entries scoring below this cosine similarity are never returned.
    pub min_score: f32,
    pub embedder: EmbedderConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            min_score: 0.0,
            embedder: EmbedderConfig::default(),
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.min_score) {
            return Err(anyhow!("context.min_score must be within [-1, 1]"));
        }
        if self.embedder.dimension() == 0 {
            return Err(anyhow!("context.embedder.dimension must be > 0"));
        }
        Ok(())
    }
}

/// Which model embeds history entries and queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbedderConfig {
    /// Offline feature hashing; no model needed.
    Hashing {
        #[serde(default = "default_hashing_dimension")]
        dimension: usize,
    },
    Ollama {
        #[serde(default = "default_ollama_url")]
        base_url: String,
        #[serde(default = "default_ollama_model")]
        model: String,
        #[serde(default = "default_ollama_dimension")]
        dimension: usize,
        #[serde(default = "default_embedder_timeout_secs")]
        timeout_secs: u64,
    },
    #[serde(rename = "openai")]
    OpenAi {
        #[serde(default = "default_openai_url")]
        base_url: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default = "default_openai_dimension")]
        dimension: usize,
        /// Environment variable holding the API key.
        #[serde(default = "default_openai_key_env")]
        api_key_env: String,
        #[serde(default = "default_embedder_timeout_secs")]
        timeout_secs: u64,
    },
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        EmbedderConfig::Hashing {
            dimension: default_hashing_dimension(),
        }
    }
}

impl EmbedderConfig {
    pub fn dimension(&self) -> usize {
        match self {
            EmbedderConfig::Hashing { dimension }
            | EmbedderConfig::Ollama { dimension, .. }
            | EmbedderConfig::OpenAi { dimension, .. } => *dimension,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn Embedder>> {
        Ok(match self {
            EmbedderConfig::Hashing { dimension } => Arc::new(HashingEmbedder::new(*dimension)),
            EmbedderConfig::Ollama {
                base_url,
                model,
                dimension,
                timeout_secs,
            } => Arc::new(OllamaEmbedder::new(
                base_url,
                model,
                *dimension,
                Duration::from_secs(*timeout_secs),
            )?),
            EmbedderConfig::OpenAi {
                base_url,
                model,
                dimension,
                api_key_env,
                timeout_secs,
            } => {
                let api_key = std::env::var(api_key_env)
                    .with_context(|| format!("read embedding API key from ${api_key_env}"))?;
                Arc::new(OpenAiEmbedder::new(
                    base_url,
                    &api_key,
                    model,
                    *dimension,
                    Duration::from_secs(*timeout_secs),
                )?)
            }
        })
    }
}

fn default_hashing_dimension() -> usize {
    256
}

fn default_ollama_url() -> String {
    remote::DEFAULT_OLLAMA_URL.to_string()
}

fn default_ollama_model() -> String {
    remote::DEFAULT_OLLAMA_MODEL.to_string()
}

fn default_ollama_dimension() -> usize {
    768
}

fn default_openai_url() -> String {
    remote::DEFAULT_OPENAI_URL.to_string()
}

fn default_openai_model() -> String {
    remote::DEFAULT_OPENAI_MODEL.to_string()
}

fn default_openai_dimension() -> usize {
    1536
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_embedder_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone)]
struct IndexedEntry {
    seq: u64,
    entry: HistoryEntry,
    embedding: Vec<f32>,
}

/// A retrieved entry and its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: HistoryEntry,
    pub score: f32,
}

pub struct ContextManager {
    embedder: Arc<dyn Embedder>,
    cache: Option<Cache>,
    min_score: f32,
    entries: RwLock<Vec<IndexedEntry>>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("model", &self.embedder.model_id())
            .field("min_score", &self.min_score)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl ContextManager {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            cache: None,
            min_score: 0.0,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &ContextConfig, cache: Option<Cache>) -> Result<Self> {
        let mut manager = Self::new(config.embedder.build()?).with_min_score(config.min_score);
        manager.cache = cache;
        Ok(manager)
    }

    /// Cache query embeddings in `cache`.
    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index one completed task.
    pub fn add(&self, entry: HistoryEntry) -> Result<()> {
        let embedding = self
            .embedder
            .embed(&entry.document_text())
            .with_context(|| format!("embed history entry {}", entry.task.id))?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let seq = entries.len() as u64;
        entries.push(IndexedEntry {
            seq,
            entry,
            embedding,
        });
        Ok(())
    }

    /// Drop the corpus and index `history` from scratch.
    pub fn rebuild(&self, history: &[HistoryEntry]) -> Result<()> {
        let mut indexed = Vec::with_capacity(history.len());
        for (seq, entry) in history.iter().enumerate() {
            let embedding = self
                .embedder
                .embed(&entry.document_text())
                .with_context(|| format!("embed history entry {}", entry.task.id))?;
            indexed.push(IndexedEntry {
                seq: seq as u64,
                entry: entry.clone(),
                embedding,
            });
        }
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = indexed;
        Ok(())
    }

    /// Up to `k` entries most similar to `text`.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .query_scored(text, k)?
            .into_iter()
            .map(|scored| scored.entry)
            .collect())
    }

    #[instrument(skip_all, fields(k = k, corpus = self.len()))]
    pub fn query_scored(&self, text: &str, k: usize) -> Result<Vec<ScoredEntry>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.query_embedding(text)?;

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(f32, u64, &HistoryEntry)> = entries
            .iter()
            .map(|indexed| {
                (
                    cosine_similarity(&query, &indexed.embedding),
                    indexed.seq,
                    &indexed.entry,
                )
            })
            .filter(|(score, _, _)| *score >= self.min_score)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        scored.truncate(k);
        debug!(returned = scored.len(), "context query");

        Ok(scored
            .into_iter()
            .map(|(score, _, entry)| ScoredEntry {
                entry: entry.clone(),
                score,
            })
            .collect())
    }

    fn query_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let Some(cache) = &self.cache else {
            return self.embedder.embed(text);
        };
        let fingerprint = Fingerprint::new("embedding")
            .field("model", &self.embedder.model_id())
            .field("text", text)
            .finish();
        if let Some(cached) = cache.lookup::<Vec<f32>>(&fingerprint)
            && cached.len() == self.embedder.dimension()
        {
            return Ok(cached);
        }
        let embedding = self.embedder.embed(text)?;
        cache.store(&fingerprint, &embedding, Some(EMBEDDING_CACHE_TTL));
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskResult;
    use crate::test_support::task;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(id: &str, name: &str, output: &str) -> HistoryEntry {
        HistoryEntry::new(task(id, name), TaskResult::success(output), "execution")
    }

    fn manager() -> ContextManager {
        ContextManager::new(Arc::new(HashingEmbedder::new(128)))
    }

    #[test]
    fn empty_corpus_returns_nothing() {
        assert!(manager().query("anything", 3).expect("query").is_empty());
    }

    #[test]
    fn most_similar_first() {
        let ctx = manager();
        ctx.add(entry("t1", "write marketing copy", "tagline drafted")).expect("add");
        ctx.add(entry("t2", "design login schema", "users table with password hash"))
            .expect("add");
        let hits = ctx.query("login schema", 1).expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].task.id, "t2");
    }

    #[test]
    fn ties_prefer_recent_entries() {
        let ctx = manager();
        ctx.add(entry("old", "deploy service", "done")).expect("add");
        ctx.add(entry("new", "deploy service", "done")).expect("add");
        let hits = ctx.query("deploy service", 2).expect("query");
        let ids: Vec<&str> = hits.iter().map(|h| h.task.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn min_score_filters_weak_matches() {
        let ctx = manager().with_min_score(0.5);
        ctx.add(entry("t1", "quarterly budget", "spreadsheet")).expect("add");
        assert!(ctx.query("login schema", 5).expect("query").is_empty());
    }

    #[test]
    fn rebuild_replaces_corpus() {
        let ctx = manager();
        ctx.add(entry("t1", "a", "x")).expect("add");
        ctx.rebuild(&[entry("t2", "b", "y"), entry("t3", "c", "z")])
            .expect("rebuild");
        assert_eq!(ctx.len(), 2);
    }

    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    impl Embedder for CountingEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text)
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_id(&self) -> String {
            self.inner.model_id()
        }
    }

    #[test]
    fn query_embeddings_are_cached() {
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(32),
            calls: AtomicUsize::new(0),
        });
        let ctx = ContextManager::new(embedder.clone()).with_cache(Cache::in_memory());
        ctx.add(entry("t1", "design schema", "ok")).expect("add");
        ctx.query("schema", 1).expect("query");
        ctx.query("schema", 1).expect("query");
        // one for the entry, one for the first query
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn embedder_config_parses_from_toml() {
        let cfg: ContextConfig = toml::from_str(
            "min_score = 0.1\n\n[embedder]\nkind = \"ollama\"\nmodel = \"mxbai-embed-large\"\ndimension = 1024\n",
        )
        .expect("parse");
        assert_eq!(
            cfg.embedder,
            EmbedderConfig::Ollama {
                base_url: remote::DEFAULT_OLLAMA_URL.to_string(),
                model: "mxbai-embed-large".to_string(),
                dimension: 1024,
                timeout_secs: 30,
            }
        );

        let cfg: ContextConfig =
            toml::from_str("[embedder]\nkind = \"openai\"\n").expect("parse");
        assert_eq!(cfg.embedder.dimension(), 1536);
        assert_eq!(ContextConfig::default().embedder.dimension(), 256);
    }

    #[test]
    fn openai_embedder_needs_its_key() {
        let config = EmbedderConfig::OpenAi {
            base_url: remote::DEFAULT_OPENAI_URL.to_string(),
            model: remote::DEFAULT_OPENAI_MODEL.to_string(),
            dimension: 8,
            api_key_env: "ORCHESTRATOR_TEST_UNSET_EMBEDDING_KEY".to_string(),
            timeout_secs: 1,
        };
        let err = config.build().err().expect("build should fail without the key");
        assert!(format!("{err:#}").contains("ORCHESTRATOR_TEST_UNSET_EMBEDDING_KEY"));
    }

    #[test]
    fn ollama_backed_manager_retrieves_by_model_vectors() {
        let mut server = mockito::Server::new();
        let _login = server
            .mock("POST", "/api/embeddings")
            .match_body(mockito::Matcher::Regex("login".to_string()))
            .with_status(200)
            .with_body(r#"{"embedding": [1.0, 0.0]}"#)
            .create();
        let _other = server
            .mock("POST", "/api/embeddings")
            .match_body(mockito::Matcher::Regex("budget".to_string()))
            .with_status(200)
            .with_body(r#"{"embedding": [0.0, 1.0]}"#)
            .create();

        let config = ContextConfig {
            min_score: 0.0,
            embedder: EmbedderConfig::Ollama {
                base_url: server.url(),
                model: "nomic-embed-text".to_string(),
                dimension: 2,
                timeout_secs: 5,
            },
        };
        let ctx = ContextManager::from_config(&config, None).expect("manager");
        ctx.add(entry("t1", "quarterly budget", "spreadsheet")).expect("add");
        ctx.add(entry("t2", "design login schema", "users table")).expect("add");

        let hits = ctx.query("login page", 1).expect("query");
        assert_eq!(hits[0].task.id, "t2");
    }
}
