//! Storage abstraction for indexed documents and their passages.
//!
//! The [`PassageStore`] trait holds every storage operation the retrieval
//! pipeline needs, so the hybrid engine can run against SQLite in production
//! and the in-memory store in tests.
//!
//! Documents are addressed by their backend **handle** (the id returned from
//! upload); the upstream document id is kept alongside for existence checks.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::Passage;

/// A document that has been indexed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedDocument {
    /// Backend-assigned handle (`ragId`).
    pub handle: String,
    /// Upstream document id.
    pub document_id: String,
    pub display_name: Option<String>,
    pub page_count: i64,
    pub passage_count: i64,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds of the last pre-activation, if any.
    pub activated_at: Option<i64>,
}

/// A passage returned by one ranker, with that ranker's raw score.
#[derive(Debug, Clone)]
pub struct PassageCandidate {
    pub passage: Passage,
    /// Higher is better. Scales differ between rankers.
    pub raw_score: f64,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](PassageStore::upsert_document) | Insert or replace a document record |
/// | [`find_by_document_id`](PassageStore::find_by_document_id) | Existence check by upstream id |
/// | [`get_document`](PassageStore::get_document) | Look up a document by handle |
/// | [`mark_activated`](PassageStore::mark_activated) | Record a pre-activation |
/// | [`replace_passages`](PassageStore::replace_passages) | Replace passages and vectors |
/// | [`get_passages`](PassageStore::get_passages) | All passages of a document |
/// | [`keyword_search`](PassageStore::keyword_search) | Lexical ranker |
/// | [`vector_search`](PassageStore::vector_search) | Semantic ranker |
/// | [`phrase_search`](PassageStore::phrase_search) | Entity ranker |
/// | [`index_document`](PassageStore::index_document) | Document record plus passages |
#[async_trait]
pub trait PassageStore: Send + Sync {
    async fn upsert_document(&self, doc: &IndexedDocument) -> Result<()>;

    async fn find_by_document_id(&self, document_id: &str) -> Result<Option<IndexedDocument>>;

    async fn get_document(&self, handle: &str) -> Result<Option<IndexedDocument>>;

    /// Returns `false` if no document has this handle.
    async fn mark_activated(&self, handle: &str, at: i64) -> Result<bool>;

    /// Replace every passage of a document. `vectors`, when given, is
    /// parallel to `passages`.
    async fn replace_passages(
        &self,
        handle: &str,
        passages: &[Passage],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()>;

    /// Passages in document order.
    async fn get_passages(&self, handle: &str) -> Result<Vec<Passage>>;

    async fn keyword_search(
        &self,
        handle: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>>;

    async fn vector_search(
        &self,
        handle: &str,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>>;

    /// Passages containing at least one of `phrases` (case-insensitive).
    async fn phrase_search(
        &self,
        handle: &str,
        phrases: &[String],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>>;

    /// Write a freshly indexed document and its passages. Stores that can
    /// should do this atomically.
    async fn index_document(
        &self,
        doc: &IndexedDocument,
        passages: &[Passage],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        self.upsert_document(doc).await?;
        self.replace_passages(&doc.handle, passages, vectors).await
    }
}

/// Entity-ranker score of `text`: one point per distinct phrase present,
/// plus a small bonus per extra occurrence. `0.0` means no match.
pub fn phrase_score(text: &str, phrases: &[String]) -> f64 {
    let haystack = text.to_lowercase();
    let mut score = 0.0;
    for phrase in phrases {
        let needle = phrase.to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let hits = haystack.matches(needle.as_str()).count();
        if hits > 0 {
            score += 1.0 + 0.1 * (hits - 1) as f64;
        }
    }
    score
}

/// Sort candidates best-first, breaking ties by document order, and keep
/// the first `limit`.
pub fn rank_candidates(candidates: &mut Vec<PassageCandidate>, limit: usize) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.passage.source_page.cmp(&b.passage.source_page))
            .then(a.passage.position.cmp(&b.passage.position))
    });
    candidates.truncate(limit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phrase_score() {
        let phrases = vec!["Acme Corp".to_string(), "NDA".to_string()];
        assert_eq!(phrase_score("nothing here", &phrases), 0.0);
        assert!((phrase_score("ACME CORP signs", &phrases) - 1.0).abs() < 1e-9);
        assert!((phrase_score("Acme Corp and acme corp under the NDA", &phrases) - 2.1).abs() < 1e-9);
    }
}
