//! Text embedding.
//!
//! Every downstream component relies on [`Embedder::embed`] never failing, so
//! backend selection happens once, at construction time, in
//! [`select_embedder`]. When no model backend is available the deterministic
//! [`HashEmbedder`] stands in; it keeps exact-text lookups working but carries
//! no real semantics, which callers can detect through [`Embedder::is_degraded`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{EmbeddingBackend, EmbeddingConfig};

/// Turns text into fixed-dimension, L2-normalized vectors.
pub trait Embedder: Send + Sync {
    /// Output dimension, constant for the lifetime of the embedder.
    fn dimension(&self) -> usize;

    /// Embed one text. Deterministic for a fixed text and model.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Embed many texts. Output order matches input order.
    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Embed text used as a search query.
    fn embed_query(&self, text: &str) -> Vec<f32> {
        self.embed(text)
    }

    /// Embed documents stored for later retrieval.
    fn embed_documents(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        self.embed_batch(texts)
    }

    /// True when vectors come from a fallback rather than a real model.
    fn is_degraded(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

/// Cosine similarity. Zero if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Pick an embedding backend according to `config`. Never fails.
pub fn select_embedder(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    match config.backend {
        EmbeddingBackend::Hash => {
            info!(dimension = config.dimension, "Using hash embedder");
            Arc::new(HashEmbedder::new(config.dimension))
        }
        EmbeddingBackend::Auto | EmbeddingBackend::Fastembed => {
            #[cfg(feature = "fastembed")]
            {
                match model::FastEmbedder::from_config(config) {
                    Ok(embedder) => return Arc::new(embedder),
                    Err(reason) => warn!(
                        model = %config.model,
                        reason = %reason,
                        "Embedding model unavailable, falling back to hash embedder"
                    ),
                }
            }
            #[cfg(not(feature = "fastembed"))]
            {
                if config.backend == EmbeddingBackend::Fastembed {
                    warn!("Built without the fastembed feature, falling back to hash embedder");
                } else {
                    info!(
                        dimension = config.dimension,
                        "No model backend compiled in, using hash embedder"
                    );
                }
            }
            Arc::new(HashEmbedder::new(config.dimension))
        }
    }
}

/// Deterministic feature-hashing embedder.
///
/// Lowercased alphanumeric word tokens are hashed (FNV-1a) into signed
/// buckets and the result is normalized. Identical token bags produce
/// identical vectors; texts with no tokens embed to the zero vector.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            // Top bit picks the sign so unrelated tokens tend to cancel
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }

    fn is_degraded(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "hash"
    }
}

#[cfg(feature = "fastembed")]
mod model {
    use std::sync::Mutex;

    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use tracing::{debug, info, warn};

    use super::{normalize, Embedder, HashEmbedder};
    use crate::config::EmbeddingConfig;

    /// Local ONNX embedding model via fastembed.
    ///
    /// A failed model call degrades that call to the hash embedder.
    pub struct FastEmbedder {
        model_name: String,
        model: Mutex<TextEmbedding>,
        dimension: usize,
        /// nomic models expect task prefixes on queries and documents
        prefixed: bool,
        fallback: HashEmbedder,
    }

    fn resolve_model(name: &str) -> Option<(EmbeddingModel, usize, bool)> {
        let resolved = match name {
            "nomic-embed-text-v1.5" | "NomicEmbedTextV15" => {
                (EmbeddingModel::NomicEmbedTextV15, 768, true)
            }
            "nomic-embed-text-v1" | "NomicEmbedTextV1" => {
                (EmbeddingModel::NomicEmbedTextV1, 768, true)
            }
            "all-MiniLM-L6-v2" | "AllMiniLML6V2" => (EmbeddingModel::AllMiniLML6V2, 384, false),
            "bge-small-en-v1.5" | "BGESmallENV15" => (EmbeddingModel::BGESmallENV15, 384, false),
            "bge-base-en-v1.5" | "BGEBaseENV15" => (EmbeddingModel::BGEBaseENV15, 768, false),
            "bge-large-en-v1.5" | "BGELargeENV15" => (EmbeddingModel::BGELargeENV15, 1024, false),
            _ => return None,
        };
        Some(resolved)
    }

    impl FastEmbedder {
        pub fn from_config(config: &EmbeddingConfig) -> Result<Self, String> {
            let (model, dimension, prefixed) = resolve_model(&config.model)
                .ok_or_else(|| format!("Unknown embedding model: '{}'", config.model))?;
            if dimension != config.dimension {
                return Err(format!(
                    "Dimension mismatch: model '{}' produces {}-dim vectors, config says {}",
                    config.model, dimension, config.dimension
                ));
            }

            info!(model = %config.model, "Initializing embedding model");
            let embedding = TextEmbedding::try_new(
                InitOptions::new(model).with_show_download_progress(false),
            )
            .map_err(|e| e.to_string())?;
            info!(model = %config.model, dimension, "Embedding model initialized");

            Ok(Self {
                model_name: config.model.clone(),
                model: Mutex::new(embedding),
                dimension,
                prefixed,
                fallback: HashEmbedder::new(dimension),
            })
        }

        fn run(&self, texts: Vec<String>) -> Vec<Vec<f32>> {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            let result = match self.model.lock() {
                Ok(model) => model.embed(texts.clone(), None).map_err(|e| e.to_string()),
                Err(_) => Err("embedding model lock poisoned".to_string()),
            };
            match result {
                Ok(mut vectors) if vectors.len() == texts.len() => {
                    for v in vectors.iter_mut() {
                        normalize(v);
                    }
                    debug!(batch_size = vectors.len(), "Generated embeddings");
                    vectors
                }
                Ok(vectors) => {
                    warn!(
                        expected = texts.len(),
                        got = vectors.len(),
                        "Embedding model returned wrong batch size, using hash embedder"
                    );
                    self.fallback.embed_batch(&refs)
                }
                Err(reason) => {
                    warn!(reason = %reason, "Embedding model failed, using hash embedder");
                    self.fallback.embed_batch(&refs)
                }
            }
        }

        fn with_prefix(&self, prefix: &str, text: &str) -> String {
            if self.prefixed {
                format!("{}{}", prefix, text)
            } else {
                text.to_string()
            }
        }
    }

    impl Embedder for FastEmbedder {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn embed(&self, text: &str) -> Vec<f32> {
            self.run(vec![text.to_string()])
                .pop()
                .unwrap_or_else(|| self.fallback.embed(text))
        }

        fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
            if texts.is_empty() {
                return Vec::new();
            }
            self.run(texts.iter().map(|t| t.to_string()).collect())
        }

        fn embed_query(&self, text: &str) -> Vec<f32> {
            self.embed(&self.with_prefix("search_query: ", text))
        }

        fn embed_documents(&self, texts: &[&str]) -> Vec<Vec<f32>> {
            if texts.is_empty() {
                return Vec::new();
            }
            self.run(
                texts
                    .iter()
                    .map(|t| self.with_prefix("search_document: ", t))
                    .collect(),
            )
        }

        fn name(&self) -> &str {
            &self.model_name
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_resolve_model() {
            assert_eq!(resolve_model("nomic-embed-text-v1.5").map(|m| m.1), Some(768));
            assert!(resolve_model("unknown-model").is_none());
        }

        #[test]
        fn test_dimension_mismatch_rejected() {
            let config = EmbeddingConfig {
                model: "all-MiniLM-L6-v2".into(),
                dimension: 768,
                ..Default::default()
            };
            assert!(FastEmbedder::from_config(&config).is_err());
        }

        // Downloads the model, run with: cargo test --features fastembed -- --ignored
        #[test]
        #[ignore = "Downloads model from network, slow"]
        fn test_similar_texts_closer() {
            let embedder = FastEmbedder::from_config(&EmbeddingConfig::default()).unwrap();
            let a = embedder.embed("The cat sat on the mat");
            let b = embedder.embed("A cat is sitting on a mat");
            let c = embedder.embed("Quantum physics is complex");
            assert_eq!(a.len(), 768);
            let close = super::super::cosine_similarity(&a, &b);
            let far = super::super::cosine_similarity(&a, &c);
            assert!(close > far);
        }
    }
}

#[cfg(feature = "fastembed")]
pub use model::FastEmbedder;
