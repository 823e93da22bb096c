//! Embedding provider capability.
//!
//! The pipeline never constructs a model: it receives an [`Embedder`] and
//! calls it. The HTTP implementation targets OpenAI-compatible `/embeddings`
//! endpoints; tests substitute a deterministic fake. All vectors handed out
//! are L2-normalized, so dot product equals cosine similarity.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::env as env_util;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; one vector per input, input order preserved.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let out = self.embed_batch(&[text.to_string()]).await?;
        out.into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedding provider returned no vector"))
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: Option<u32>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl EmbeddingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_base: env_util::env_opt("EMBEDDINGS_API_BASE")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: env_util::env_req("EMBEDDINGS_API_KEY")?,
            model: env_util::env_opt("EMBEDDINGS_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            dimensions: env_util::env_parse_opt("EMBEDDINGS_DIMENSIONS"),
            timeout_ms: env_util::env_parse("EMBEDDINGS_TIMEOUT_MS", 10_000),
            max_retries: env_util::env_parse("EMBEDDINGS_RETRY_ATTEMPTS", 2),
            backoff_ms: env_util::env_parse("EMBEDDINGS_BACKOFF_MS", 500),
        })
    }
}

/// OpenAI-style embeddings client. Rate limits and server errors are retried
/// with linear backoff; the request timeout doubles as the pipeline's guard
/// against a stalled provider. Whatever survives the retries surfaces as an
/// error the callers downgrade to an intervention, never a batch abort.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    cfg: EmbeddingConfig,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(cfg: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("building embeddings http client")?;
        let endpoint = format!("{}/embeddings", cfg.api_base.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            cfg,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let req = EmbeddingRequest {
            model: &self.cfg.model,
            input: texts,
            dimensions: self.cfg.dimensions,
        };
        let mut attempt: u32 = 0;
        loop {
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.cfg.api_key)
                .json(&req)
                .send()
                .await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = resp
                            .json()
                            .await
                            .context("decoding embeddings response body")?;
                        return collect_vectors(parsed.data, texts.len());
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        if attempt >= self.cfg.max_retries {
                            let body = resp.text().await.unwrap_or_default();
                            bail!(
                                "embeddings endpoint failed after retries (status={status}): {body}"
                            );
                        }
                        let wait = self.cfg.backoff_ms * u64::from(attempt + 1);
                        tokio::time::sleep(Duration::from_millis(wait)).await;
                        attempt += 1;
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    bail!("embeddings endpoint returned {status}: {body}");
                }
                Err(err) => {
                    if attempt >= self.cfg.max_retries {
                        return Err(anyhow::Error::new(err).context("embeddings request failed"));
                    }
                    let wait = self.cfg.backoff_ms * u64::from(attempt + 1);
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Stand-in used when no provider is configured; every call fails, which the
/// callers treat as "degrade to lexical matching and queue an intervention".
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding provider not configured (set EMBEDDINGS_API_KEY)")
    }
}

/// Build the best available provider from the environment. Missing
/// configuration is not an error at construction time: the pipeline is
/// expected to run lexical-only when semantics are unavailable.
pub fn from_env() -> Box<dyn Embedder> {
    match EmbeddingConfig::from_env() {
        Ok(cfg) => match HttpEmbedder::new(cfg) {
            Ok(e) => Box::new(e),
            Err(err) => {
                tracing::warn!(error = %err, "embeddings client unavailable; running lexical-only");
                Box::new(DisabledEmbedder)
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "embeddings not configured; running lexical-only");
            Box::new(DisabledEmbedder)
        }
    }
}

/// Providers may return items out of order; reassemble by index and enforce
/// the one-vector-per-input contract.
fn collect_vectors(mut items: Vec<EmbeddingItem>, expected: usize) -> Result<Vec<Vec<f32>>> {
    items.sort_by_key(|it| it.index);
    if items.len() != expected {
        bail!(
            "embedding provider returned {} vectors for {} inputs",
            items.len(),
            expected
        );
    }
    Ok(items
        .into_iter()
        .map(|mut it| {
            normalize_l2(&mut it.embedding);
            it.embedding
        })
        .collect())
}

/// Scale to unit length; zero vectors are left untouched.
pub fn normalize_l2(v: &mut [f32]) {
    let norm = v
        .iter()
        .map(|x| (*x as f64) * (*x as f64))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = ((*x as f64) / norm) as f32;
        }
    }
}

/// Dot product in f64. Inputs are unit-normalized by construction, so this
/// is the cosine similarity.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum()
}

/// Deterministic in-memory embedder for tests: returns pre-registered
/// vectors keyed by exact text and errors on anything unknown, so tests can
/// also exercise the degraded (provider-failed) paths.
#[cfg(test)]
#[derive(Default, Clone)]
pub struct FakeEmbedder {
    vectors: std::collections::HashMap<String, Vec<f32>>,
}

#[cfg(test)]
impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

#[cfg(test)]
#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|t| {
                self.vectors
                    .get(t)
                    .cloned()
                    .ok_or_else(|| anyhow!("no fake vector registered for {t:?}"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_vectors_in_index_order() {
        let items = vec![
            EmbeddingItem {
                index: 1,
                embedding: vec![0.0, 1.0],
            },
            EmbeddingItem {
                index: 0,
                embedding: vec![1.0, 0.0],
            },
        ];
        let out = collect_vectors(items, 2).unwrap();
        assert_eq!(out[0], vec![1.0, 0.0]);
        assert_eq!(out[1], vec![0.0, 1.0]);
    }

    #[test]
    fn rejects_vector_count_mismatch() {
        let items = vec![EmbeddingItem {
            index: 0,
            embedding: vec![1.0],
        }];
        assert!(collect_vectors(items, 2).is_err());
    }

    #[test]
    fn normalizes_to_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize_l2(&mut v);
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize_l2(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn embed_one_unwraps_single_vector() {
        let fake = FakeEmbedder::new().with("pan lactal", vec![1.0, 0.0]);
        let v = fake.embed_one("pan lactal").await.unwrap();
        assert_eq!(v, vec![1.0, 0.0]);
        assert!(fake.embed_one("unknown").await.is_err());
    }
}
