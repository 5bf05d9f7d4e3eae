//! Embedding generation and token counting

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};

/// Which side of the retrieval asymmetry a text sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedKind {
    /// A search query
    Query,
    /// Stored text that queries are matched against
    Passage,
}

impl EmbedKind {
    fn prefix(&self) -> &'static str {
        match self {
            EmbedKind::Query => "query: ",
            EmbedKind::Passage => "passage: ",
        }
    }
}

/// Source of unit-length embeddings.
///
/// Returns `Ok(None)` for blank text rather than embedding nothing.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str, kind: EmbedKind) -> Result<Option<Vec<f32>>>;

    /// Length of every vector this provider returns
    fn dimensions(&self) -> usize;
}

/// Local embedding model via fastembed (no API keys)
pub struct FastEmbedProvider {
    model: Arc<Mutex<TextEmbedding>>,
    dimensions: usize,
}

impl FastEmbedProvider {
    /// Load the model named in the config, downloading it on first use
    pub fn new(config: &Config) -> Result<Self> {
        let (model_kind, dimensions) = match config.embedding_model.as_str() {
            "intfloat/multilingual-e5-large" => (EmbeddingModel::MultilingualE5Large, 1024),
            "intfloat/multilingual-e5-base" => (EmbeddingModel::MultilingualE5Base, 768),
            "intfloat/multilingual-e5-small" => (EmbeddingModel::MultilingualE5Small, 384),
            "sentence-transformers/all-MiniLM-L6-v2" => (EmbeddingModel::AllMiniLML6V2, 384),
            other => {
                return Err(Error::config(format!("Unsupported embedding model: {}", other)))
            }
        };

        if dimensions != config.embedding_dimensions {
            return Err(Error::config(format!(
                "{} produces {} dimensions, config expects {}",
                config.embedding_model, dimensions, config.embedding_dimensions
            )));
        }

        info!(model = %config.embedding_model, "Loading embedding model");
        let model = TextEmbedding::try_new(
            InitOptions::new(model_kind).with_show_download_progress(true),
        )
        .map_err(|e| Error::embedding(format!("Failed to load embedding model: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, text: &str, kind: EmbedKind) -> Result<Option<Vec<f32>>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let input = format!("{}{}", kind.prefix(), text);
        let mut guard = self.model.lock().await;
        let embeddings = guard
            .embed(vec![input], None)
            .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))?;
        drop(guard);

        let mut embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("No embedding returned"))?;
        normalize(&mut embedding);
        Ok(Some(embedding))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic bag-of-words embedder that needs no model download.
///
/// Each lowercase word is hashed into one signed bucket. Texts sharing
/// words score high against each other; useful offline and in tests.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    /// A zero `dimensions` is raised to one
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_sync(&self, text: &str) -> Option<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        let mut any = false;
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = fnv1a(&word.to_lowercase());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
            any = true;
        }
        if !any {
            return None;
        }
        normalize(&mut vector);
        Some(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str, _kind: EmbedKind) -> Result<Option<Vec<f32>>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn fnv1a(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Scale a vector to unit length in place; zero vectors are left alone
pub fn normalize(vector: &mut [f32]) {
    let norm = l2_norm(vector);
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Token counter using tiktoken
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a new token counter for a specific model
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .map_err(|e| Error::config(format!("Failed to load tokenizer for {}: {}", model, e)))?;

        Ok(Self { bpe })
    }

    /// Create a token counter with the GPT-3.5/GPT-4 vocabulary
    pub fn for_gpt() -> Result<Self> {
        Self::new("gpt-3.5-turbo")
    }

    /// Count tokens in a text
    pub fn count(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }

    /// Estimate tokens without using the tokenizer (faster, less accurate)
    pub fn estimate(text: &str) -> u32 {
        (text.len() / 4) as u32
    }
}
