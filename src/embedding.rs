//! Embedding backend abstraction and implementations.
//!
//! Defines the [`EmbeddingBackend`] trait and concrete implementations:
//! - **[`DisabledBackend`]**: returns errors; used when embeddings are not configured.
//! - **[`GeminiBackend`]**: calls `embedContent` / `batchEmbedContents`.
//! - **[`OpenAiBackend`]**: calls the OpenAI-compatible `/embeddings` endpoint.
//! - **[`HashingBackend`]**: offline feature hashing, deterministic and network-free.
//!
//! [`Embedder`] wraps a backend and owns the batching policy: a batch call
//! is tried first and, on error or a shape mismatch, the batch is re-embedded
//! one text at a time. No retries happen at this layer.
//!
//! # Backend Selection
//!
//! | Config Value | Backend | Credentials |
//! |-------------|---------|-------------|
//! | `"disabled"` | [`DisabledBackend`] | none |
//! | `"gemini"` | [`GeminiBackend`] | `GEMINI_API_KEY` |
//! | `"openai"` | [`OpenAiBackend`] | `OPENAI_API_KEY` |
//! | `"hashing"` | [`HashingBackend`] | none |

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{DocError, Result};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GEMINI_DEFAULT_MODEL: &str = "text-embedding-004";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "text-embedding-3-small";

/// A text-to-vector service.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-004"`.
    fn model_name(&self) -> &str;

    /// Vector dimensionality when known ahead of time.
    fn dims(&self) -> Option<usize>;

    /// Whether [`embed_batch`](EmbeddingBackend::embed_batch) is a real
    /// multi-input call rather than a loop.
    fn supports_batch(&self) -> bool {
        true
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts; must return one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Batching front-end over an [`EmbeddingBackend`].
#[derive(Clone)]
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    max_batch_size: usize,
}

impl Embedder {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, max_batch_size: usize) -> Self {
        Self {
            backend,
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Ok(Self::new(create_backend(config)?, config.max_batch_size))
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.backend.embed_one(text).await?;
        if vector.is_empty() {
            return Err(DocError::EmbeddingFormat(
                "backend returned an empty vector".to_string(),
            ));
        }
        if let Some(dims) = self.backend.dims() {
            if vector.len() != dims {
                return Err(DocError::EmbeddingFormat(format!(
                    "expected {} dimensions, got {}",
                    dims,
                    vector.len()
                )));
            }
        }
        Ok(vector)
    }

    /// Embed `texts` in input order, falling back to per-item calls for
    /// any batch the backend fails to embed as a whole.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch_size) {
            if self.backend.supports_batch() && batch.len() > 1 {
                match self.backend.embed_batch(batch).await {
                    Ok(vectors) if is_well_formed(&vectors, batch.len(), self.backend.dims()) => {
                        out.extend(vectors);
                        continue;
                    }
                    Ok(vectors) => {
                        tracing::warn!(
                            model = self.backend.model_name(),
                            expected = batch.len(),
                            got = vectors.len(),
                            "batch embedding returned the wrong shape, embedding individually"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            model = self.backend.model_name(),
                            batch = batch.len(),
                            error = %e,
                            "batch embedding failed, embedding individually"
                        );
                    }
                }
            }
            for text in batch {
                out.push(self.embed_one(text).await?);
            }
        }
        Ok(out)
    }
}

/// One non-empty vector per input, all of the same length (and of the
/// backend's declared size when it has one).
fn is_well_formed(vectors: &[Vec<f32>], expected: usize, dims: Option<usize>) -> bool {
    let Some(first) = vectors.first() else {
        return expected == 0;
    };
    let width = dims.unwrap_or(first.len());
    vectors.len() == expected && width > 0 && vectors.iter().all(|v| v.len() == width)
}

/// Instantiate the backend named by `config.provider`.
pub fn create_backend(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledBackend)),
        "gemini" => Ok(Arc::new(GeminiBackend::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiBackend::new(config)?)),
        "hashing" => {
            let dims = config
                .dims
                .filter(|d| *d > 0)
                .context("embedding.dims required for hashing provider")?;
            Ok(Arc::new(HashingBackend::new(dims)))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Backend ============

pub struct DisabledBackend;

#[async_trait]
impl EmbeddingBackend for DisabledBackend {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> Option<usize> {
        None
    }
    async fn embed_one(&self, _text: &str) -> Result<Vec<f32>> {
        Err(DocError::EmbeddingService(
            "embedding provider is disabled".to_string(),
        ))
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(DocError::EmbeddingService(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ HTTP helpers ============

pub(crate) fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

pub(crate) fn api_key(var: &str) -> anyhow::Result<String> {
    match std::env::var(var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => bail!("{} environment variable not set", var),
    }
}

/// Send a JSON request and return the parsed body, mapping transport and
/// HTTP failures to [`DocError::EmbeddingService`].
async fn post_json(request: reqwest::RequestBuilder, body: &Value) -> Result<Value> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| DocError::EmbeddingService(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(DocError::EmbeddingService(format!(
            "HTTP {}: {}",
            status, text
        )));
    }
    response
        .json()
        .await
        .map_err(|e| DocError::EmbeddingFormat(e.to_string()))
}

fn parse_vector(value: Option<&Value>, what: &str) -> Result<Vec<f32>> {
    let values = value
        .and_then(Value::as_array)
        .ok_or_else(|| DocError::EmbeddingFormat(format!("missing {}", what)))?;
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| DocError::EmbeddingFormat(format!("non-numeric value in {}", what)))
        })
        .collect()
}

// ============ Gemini Backend ============

/// Gemini `embedContent` backend. Requires `GEMINI_API_KEY`.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: Option<usize>,
}

impl GeminiBackend {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: api_key("GEMINI_API_KEY")?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| GEMINI_DEFAULT_MODEL.to_string()),
            dims: config.dims,
        })
    }

    fn content(&self, text: &str) -> Value {
        serde_json::json!({
            "model": format!("models/{}", self.model),
            "content": { "parts": [{ "text": text }] },
        })
    }
}

#[async_trait]
impl EmbeddingBackend for GeminiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/{}:embedContent", self.base_url, self.model);
        let request = self.client.post(url).header("x-goog-api-key", &self.api_key);
        let json = post_json(request, &self.content(text)).await?;
        parse_gemini_single(&json)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/{}:batchEmbedContents", self.base_url, self.model);
        let requests: Vec<Value> = texts.iter().map(|t| self.content(t)).collect();
        let request = self.client.post(url).header("x-goog-api-key", &self.api_key);
        let json = post_json(request, &serde_json::json!({ "requests": requests })).await?;
        parse_gemini_batch(&json)
    }
}

/// `{"embedding": {"values": [...]}}`
fn parse_gemini_single(json: &Value) -> Result<Vec<f32>> {
    parse_vector(
        json.get("embedding").and_then(|e| e.get("values")),
        "embedding.values",
    )
}

/// `{"embeddings": [{"values": [...]}, ...]}`
fn parse_gemini_batch(json: &Value) -> Result<Vec<Vec<f32>>> {
    let items = json
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| DocError::EmbeddingFormat("missing embeddings array".to_string()))?;
    items
        .iter()
        .map(|item| parse_vector(item.get("values"), "embeddings[].values"))
        .collect()
}

// ============ OpenAI Backend ============

/// OpenAI-compatible `/embeddings` backend. Requires `OPENAI_API_KEY`.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: Option<usize>,
}

impl OpenAiBackend {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: api_key("OPENAI_API_KEY")?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            dims: config.dims,
        })
    }

    async fn call(&self, input: Value) -> Result<Vec<Vec<f32>>> {
        let request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key);
        let body = serde_json::json!({ "model": self.model, "input": input });
        let json = post_json(request, &body).await?;
        parse_openai_response(&json)
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.call(Value::from(text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DocError::EmbeddingFormat("empty data array".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.call(serde_json::json!(texts)).await
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| DocError::EmbeddingFormat("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, parse_vector(item.get("embedding"), "data[].embedding")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Hashing Backend ============

/// Network-free embeddings from signed feature hashing of lowercase words
/// and character trigrams, L2-normalised.
///
/// Texts that share vocabulary land close together, which is enough for
/// local runs and tests; it has no semantic understanding.
pub struct HashingBackend {
    dims: usize,
}

impl HashingBackend {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut v, "w", word, 1.0);
            let padded: Vec<char> = format!(" {} ", word).chars().collect();
            for tri in padded.windows(3) {
                let tri: String = tri.iter().collect();
                self.add_feature(&mut v, "t", &tri, 0.5);
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    fn add_feature(&self, v: &mut [f32], kind: &str, feature: &str, weight: f32) {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(feature.as_bytes());
        let digest = hasher.finalize();
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[slot] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingBackend for HashingBackend {
    fn model_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> Option<usize> {
        Some(self.dims)
    }
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-norm operand.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend whose batch call misbehaves in a configurable way.
    struct FlakyBatch {
        mode: &'static str,
        batch_calls: AtomicUsize,
        single_calls: AtomicUsize,
    }

    impl FlakyBatch {
        fn new(mode: &'static str) -> Self {
            Self {
                mode,
                batch_calls: AtomicUsize::new(0),
                single_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for FlakyBatch {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> Option<usize> {
            Some(2)
        }
        async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0])
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                "error" => Err(DocError::EmbeddingService("503".into())),
                "short" => Ok(vec![vec![1.0, 1.0]]),
                "ragged" => Ok(texts
                    .iter()
                    .enumerate()
                    .map(|(i, t)| {
                        if i == 1 {
                            vec![t.len() as f32]
                        } else {
                            vec![t.len() as f32, 1.0]
                        }
                    })
                    .collect()),
                "wide" => Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect()),
                _ => Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect()),
            }
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn batch_path_used_when_healthy() {
        let backend = Arc::new(FlakyBatch::new("ok"));
        let embedder = Embedder::new(backend.clone(), 4);
        let out = embedder.embed_many(&texts(10)).await.unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(backend.batch_calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.single_calls.load(Ordering::SeqCst), 0);
        assert_eq!(out[9][0], 10.0);
    }

    #[tokio::test]
    async fn falls_back_to_single_calls_on_batch_error() {
        let backend = Arc::new(FlakyBatch::new("error"));
        let embedder = Embedder::new(backend.clone(), 100);
        let out = embedder.embed_many(&texts(5)).await.unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(backend.single_calls.load(Ordering::SeqCst), 5);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
    }

    #[tokio::test]
    async fn falls_back_on_shape_mismatch() {
        let backend = Arc::new(FlakyBatch::new("short"));
        let embedder = Embedder::new(backend.clone(), 100);
        let out = embedder.embed_many(&texts(3)).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(backend.single_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn falls_back_on_ragged_batch() {
        let backend = Arc::new(FlakyBatch::new("ragged"));
        let embedder = Embedder::new(backend.clone(), 100);
        let out = embedder.embed_many(&texts(3)).await.unwrap();
        let lens: Vec<usize> = out.iter().map(|v| v.len()).collect();
        assert_eq!(lens, vec![2, 2, 2]);
        assert_eq!(backend.single_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn falls_back_when_batch_ignores_declared_dims() {
        let backend = Arc::new(FlakyBatch::new("wide"));
        let embedder = Embedder::new(backend.clone(), 100);
        let out = embedder.embed_many(&texts(4)).await.unwrap();
        assert!(out.iter().all(|v| v.len() == 2));
        assert_eq!(backend.single_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn well_formed_requires_uniform_width() {
        assert!(is_well_formed(&[vec![1.0, 2.0], vec![3.0, 4.0]], 2, None));
        assert!(!is_well_formed(&[vec![1.0, 2.0], vec![3.0]], 2, None));
        assert!(!is_well_formed(&[vec![1.0, 2.0], vec![3.0, 4.0]], 2, Some(3)));
        assert!(!is_well_formed(&[vec![], vec![]], 2, None));
        assert!(!is_well_formed(&[vec![1.0]], 2, None));
    }

    #[tokio::test]
    async fn disabled_backend_errors() {
        let embedder = Embedder::new(Arc::new(DisabledBackend), 10);
        let err = embedder.embed_one("hello").await.unwrap_err();
        assert!(matches!(err, DocError::EmbeddingService(_)));
    }

    #[test]
    fn hashing_is_deterministic_and_normalised() {
        let backend = HashingBackend::new(64);
        let a = backend.embed("Vacation policy allows twenty days");
        let b = backend.embed("Vacation policy allows twenty days");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_ranks_shared_vocabulary_higher() {
        let backend = HashingBackend::new(256);
        let query = backend.embed("how many vacation days");
        let related = backend.embed("Employees receive 20 vacation days per year.");
        let unrelated = backend.embed("The quarterly revenue grew in Europe.");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn parses_gemini_shapes() {
        let single = serde_json::json!({"embedding": {"values": [0.1, 0.2]}});
        assert_eq!(parse_gemini_single(&single).unwrap().len(), 2);
        let batch = serde_json::json!({"embeddings": [{"values": [1.0]}, {"values": [2.0]}]});
        assert_eq!(parse_gemini_batch(&batch).unwrap(), vec![vec![1.0], vec![2.0]]);
        let bad = serde_json::json!({"embedding": {"values": ["x"]}});
        assert!(matches!(
            parse_gemini_single(&bad),
            Err(DocError::EmbeddingFormat(_))
        ));
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0]},
                {"index": 0, "embedding": [1.0]},
            ]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), vec![vec![1.0], vec![2.0]]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn create_backend_rejects_unknown() {
        let config = EmbeddingConfig {
            provider: "mystery".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_backend(&config).is_err());
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_degenerate() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
