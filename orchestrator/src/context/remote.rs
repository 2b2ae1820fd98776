//! Embedding models reached over HTTP.
//!
//! [`OllamaEmbedder`] talks to a local Ollama server (`POST /api/embeddings`),
//! [`OpenAiEmbedder`] to any OpenAI-compatible `POST /embeddings` endpoint.
//! Both are blocking; the loop embeds one entry at a time.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::embedding::Embedder;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";

fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("build embedding http client")
}

fn check_dimension(vector: Vec<f32>, expected: usize, model: &str) -> Result<Vec<f32>> {
    if vector.len() != expected {
        return Err(anyhow!(
            "{model} returned {} dimensions, context.embedder.dimension is {expected}",
            vector.len()
        ));
    }
    Ok(vector)
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
        })
    }
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        debug!(url = %url, model = %self.model, text_len = text.len(), "ollama embedding request");
        let response: OllamaResponse = self
            .client
            .post(&url)
            .json(&OllamaRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .with_context(|| format!("POST {url} (is Ollama running?)"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?
            .json()
            .context("parse ollama embedding response")?;
        check_dimension(response.embedding, self.dimension, &self.model)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> String {
        format!("ollama:{}:{}", self.model, self.dimension)
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension,
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        debug!(url = %url, model = %self.model, text_len = text.len(), "openai embedding request");
        let response: OpenAiResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&OpenAiRequest {
                model: &self.model,
                input: text,
                dimensions: self.dimension,
                encoding_format: "float",
            })
            .send()
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?
            .json()
            .context("parse openai embedding response")?;
        let embedding = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} returned no embedding", self.model))?
            .embedding;
        check_dimension(embedding, self.dimension, &self.model)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> String {
        format!("openai:{}:{}", self.model, self.dimension)
    }
}
