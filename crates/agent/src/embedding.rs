use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use kopi_core::config::EmbeddingConfig;
use kopi_core::{ConfigError, ToolError};

/// Dense-vector capability behind the product index. The output dimension is
/// fixed at construction; swapping embedders requires a full index rebuild.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ToolError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ToolError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| {
                ConfigError::Validation(format!("could not build embedding http client: {error}"))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ToolError> {
        let body = json!({"model": self.model, "input": texts});
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ToolError::DeadlineExceeded { tool: "embedding", deadline_ms: 10_000 }
                } else {
                    ToolError::Embedding(error.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(ToolError::Embedding(format!("upstream returned {}", response.status())));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| ToolError::Embedding(format!("malformed payload: {error}")))?;

        if parsed.data.len() != texts.len() {
            return Err(ToolError::Embedding(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let vectors: Vec<Vec<f32>> =
            parsed.data.into_iter().map(|datum| datum.embedding).collect();
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(ToolError::Embedding(format!(
                    "expected dimension {}, received {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ToolError> {
        let mut vectors = self.request(std::slice::from_ref(&text.to_string())).await?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ToolError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

/// Deterministic bag-of-tokens embedder for tests and offline runs: each
/// token hashes into one bucket, so texts sharing vocabulary land near each
/// other under cosine similarity. Not a real semantic model.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1) }
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ToolError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split(|ch: char| !ch.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            // Singular/plural variants should share a bucket.
            let stem = token.strip_suffix('s').filter(|s| !s.is_empty()).unwrap_or(token);
            let bucket = (fnv1a(stem) % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }
}
