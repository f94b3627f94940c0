//! Embedding abstraction and vector utilities.
//!
//! [`Embedder`] is the seam between retrieval and whatever produces vectors.
//! The core ships one implementation, [`HashEmbedder`], a deterministic
//! bag-of-words hashing embedder that needs no model or network. Network-backed
//! providers live in the application crate.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Produces embedding vectors for passages and queries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded next to stored vectors.
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query string.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Feature-hashing embedder: each lowercased token increments one bucket,
/// and the vector is L2-normalized.
///
/// Buckets come from SHA-256, so vectors stored by one build match query
/// vectors computed by any other.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
    seed: u64,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            seed: 1337,
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket_for(token)] += 1.0;
        }
        normalize(&mut vector);
        vector
    }

    fn bucket_for(&self, token: &str) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(token.to_lowercase().as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(head) % self.dims as u64) as usize
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}

/// Encode a vector as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
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

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_hash_embedder_similarity_tracks_overlap() {
        let e = HashEmbedder::new(256);
        let q = e.embed_text("termination notice period");
        let close = e.embed_text("The termination notice period is thirty days.");
        let far = e.embed_text("Payment is due upon receipt of invoice.");
        assert!(cosine_similarity(&q, &close) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_hash_embedder_is_case_insensitive_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed_text("Acme Corp");
        let b = e.embed_text("acme corp");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_buckets_are_fixed_across_builds() {
        // Pinned values: stored vectors must keep matching new queries.
        let small = HashEmbedder::new(256);
        assert_eq!(small.bucket_for("acme"), 240);
        assert_eq!(small.bucket_for("Termination"), 5);
        assert_eq!(small.bucket_for("notice"), 126);
        let wide = HashEmbedder::new(1536);
        assert_eq!(wide.bucket_for("acme"), 1520);
        assert_eq!(wide.bucket_for("notice"), 1406);
    }

    #[tokio::test]
    async fn test_embed_query_returns_single_vector() {
        let e = HashEmbedder::new(32);
        let v = embed_query(&e, "hello").await.unwrap();
        assert_eq!(v.len(), 32);
    }
}
