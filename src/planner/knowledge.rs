//! Knowledge lookup
//!
//! Vector search over a small document store. The planner and the
//! `knowledge_base_tool` both go through [`KnowledgeSource`].

use crate::models::KnowledgeHit;
use crate::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Turns text into a fixed-width vector
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Nearest-neighbour search, results sorted by similarity descending
#[async_trait::async_trait]
pub trait KnowledgeLookup: Send + Sync {
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<KnowledgeHit>>;
}

// ================= Embedder =================

/// Signed feature hashing over word tokens and CJK character bigrams.
///
/// Deterministic and offline; good enough to route requests to documents
/// that share vocabulary.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn tokens(text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut tokens = Vec::new();
        let mut word = String::new();
        let mut cjk_run: Vec<char> = Vec::new();

        let flush_cjk = |run: &mut Vec<char>, tokens: &mut Vec<String>| {
            match run.len() {
                0 => {}
                1 => tokens.push(run[0].to_string()),
                _ => {
                    for pair in run.windows(2) {
                        tokens.push(pair.iter().collect());
                    }
                }
            }
            run.clear();
        };

        for c in lowered.chars() {
            if is_cjk(c) {
                if !word.is_empty() {
                    tokens.push(std::mem::take(&mut word));
                }
                cjk_run.push(c);
            } else if c.is_alphanumeric() {
                flush_cjk(&mut cjk_run, &mut tokens);
                word.push(c);
            } else {
                flush_cjk(&mut cjk_run, &mut tokens);
                if !word.is_empty() {
                    tokens.push(std::mem::take(&mut word));
                }
            }
        }
        flush_cjk(&mut cjk_run, &mut tokens);
        if !word.is_empty() {
            tokens.push(word);
        }

        tokens
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in Self::tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF | 0x20000..=0x2A6DF)
}

#[async_trait::async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}

// ================= Index =================

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

struct Document {
    text: String,
    metadata: Value,
    vector: Vec<f32>,
}

/// Brute-force cosine index held in memory
#[derive(Default)]
pub struct InMemoryKnowledgeIndex {
    documents: RwLock<Vec<Document>>,
}

impl InMemoryKnowledgeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, text: impl Into<String>, metadata: Value, vector: Vec<f32>) {
        self.documents.write().await.push(Document {
            text: text.into(),
            metadata,
            vector,
        });
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl KnowledgeLookup for InMemoryKnowledgeIndex {
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<KnowledgeHit>> {
        let documents = self.documents.read().await;

        let mut hits: Vec<KnowledgeHit> = documents
            .iter()
            .map(|doc| KnowledgeHit {
                text: doc.text.clone(),
                similarity: cosine_similarity(vector, &doc.vector).clamp(0.0, 1.0),
                metadata: doc.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

// ================= Source =================

/// An embedder paired with the index it was used to build
#[derive(Clone)]
pub struct KnowledgeSource {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn KnowledgeLookup>,
}

impl KnowledgeSource {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn KnowledgeLookup>) -> Self {
        Self { embedder, index }
    }

    /// Build an in-memory source from `(text, metadata)` pairs
    pub async fn from_documents(
        embedder: Arc<dyn Embedder>,
        documents: Vec<(String, Value)>,
    ) -> Result<Self> {
        let index = InMemoryKnowledgeIndex::new();
        for (text, metadata) in documents {
            let vector = embedder.embed(&text).await?;
            index.insert(text, metadata, vector).await;
        }
        Ok(Self {
            embedder,
            index: Arc::new(index),
        })
    }

    /// Embed `query`, search, and keep hits at or above `floor`
    pub async fn retrieve(&self, query: &str, top_k: usize, floor: f32) -> Result<Vec<KnowledgeHit>> {
        let vector = self.embedder.embed(query).await?;
        let hits = self.index.search(&vector, top_k).await?;
        Ok(hits.into_iter().filter(|h| h.similarity >= floor).collect())
    }
}
