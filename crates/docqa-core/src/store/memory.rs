//! In-memory [`PassageStore`] for tests and embedding in other tools.
//!
//! Keyword search counts query-term hits; vector search is brute-force
//! cosine similarity.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::Passage;

use super::{phrase_score, rank_candidates, IndexedDocument, PassageCandidate, PassageStore};

struct StoredPassage {
    passage: Passage,
    vector: Option<Vec<f32>>,
}

/// In-memory store keyed by document handle.
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, IndexedDocument>>,
    passages: RwLock<HashMap<String, Vec<StoredPassage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            passages: RwLock::new(HashMap::new()),
        }
    }

    fn scan<F>(&self, handle: &str, limit: usize, score: F) -> Result<Vec<PassageCandidate>>
    where
        F: Fn(&StoredPassage) -> f64,
    {
        let guard = self
            .passages
            .read()
            .map_err(|_| anyhow!("passage store lock poisoned"))?;
        let mut candidates: Vec<PassageCandidate> = guard
            .get(handle)
            .map(|stored| {
                stored
                    .iter()
                    .filter_map(|sp| {
                        let s = score(sp);
                        (s > 0.0).then(|| PassageCandidate {
                            passage: sp.passage.clone(),
                            raw_score: s,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        rank_candidates(&mut candidates, limit);
        Ok(candidates)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PassageStore for InMemoryStore {
    async fn upsert_document(&self, doc: &IndexedDocument) -> Result<()> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| anyhow!("document store lock poisoned"))?;
        docs.insert(doc.handle.clone(), doc.clone());
        Ok(())
    }

    async fn find_by_document_id(&self, document_id: &str) -> Result<Option<IndexedDocument>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow!("document store lock poisoned"))?;
        Ok(docs
            .values()
            .filter(|d| d.document_id == document_id)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn get_document(&self, handle: &str) -> Result<Option<IndexedDocument>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow!("document store lock poisoned"))?;
        Ok(docs.get(handle).cloned())
    }

    async fn mark_activated(&self, handle: &str, at: i64) -> Result<bool> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| anyhow!("document store lock poisoned"))?;
        Ok(match docs.get_mut(handle) {
            Some(doc) => {
                doc.activated_at = Some(at);
                true
            }
            None => false,
        })
    }

    async fn replace_passages(
        &self,
        handle: &str,
        passages: &[Passage],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        let stored = passages
            .iter()
            .enumerate()
            .map(|(i, p)| StoredPassage {
                passage: p.clone(),
                vector: vectors.and_then(|v| v.get(i).cloned()),
            })
            .collect();
        let mut guard = self
            .passages
            .write()
            .map_err(|_| anyhow!("passage store lock poisoned"))?;
        guard.insert(handle.to_string(), stored);
        Ok(())
    }

    async fn get_passages(&self, handle: &str) -> Result<Vec<Passage>> {
        let guard = self
            .passages
            .read()
            .map_err(|_| anyhow!("passage store lock poisoned"))?;
        let mut out: Vec<Passage> = guard
            .get(handle)
            .map(|s| s.iter().map(|sp| sp.passage.clone()).collect())
            .unwrap_or_default();
        out.sort_by_key(|p| p.position);
        Ok(out)
    }

    async fn keyword_search(
        &self,
        handle: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        self.scan(handle, limit, |sp| {
            let text = sp.passage.text.to_lowercase();
            terms.iter().filter(|t| text.contains(t.as_str())).count() as f64
        })
    }

    async fn vector_search(
        &self,
        handle: &str,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>> {
        self.scan(handle, limit, |sp| {
            sp.vector
                .as_deref()
                .map(|v| cosine_similarity(query_vec, v) as f64)
                .unwrap_or(0.0)
        })
    }

    async fn phrase_search(
        &self,
        handle: &str,
        phrases: &[String],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>> {
        if phrases.is_empty() {
            return Ok(Vec::new());
        }
        self.scan(handle, limit, |sp| phrase_score(&sp.passage.text, phrases))
    }
}
