//! Backend indexing pipeline.
//!
//! Upload bytes → per-page text → fine/medium/large passages → embeddings →
//! one atomic store write. Every upload gets a fresh UUID handle, so
//! re-uploading a document never disturbs passages a running query is
//! reading.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use docqa_core::chunk::{chunk_pages, ChunkParams};
use docqa_core::embedding::Embedder;
use docqa_core::store::{IndexedDocument, PassageStore};

use crate::embedding::embed_batched;
use crate::extract::extract_pages;

/// Summary returned to the uploader.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    /// New backend handle (`ragId`).
    pub id: String,
    pub document_id: String,
    pub pages: usize,
    pub passages: usize,
}

pub struct Indexer {
    store: Arc<dyn PassageStore>,
    embedder: Option<Arc<dyn Embedder>>,
    chunk_params: ChunkParams,
    batch_size: usize,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn PassageStore>,
        embedder: Option<Arc<dyn Embedder>>,
        chunk_params: ChunkParams,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            chunk_params,
            batch_size,
        }
    }

    /// Index one uploaded document.
    pub async fn index(
        &self,
        document_id: &str,
        display_name: Option<&str>,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<IndexReport> {
        let pages = extract_pages(bytes, content_type)?;
        let handle = Uuid::new_v4().to_string();
        let passages = chunk_pages(&handle, &pages, &self.chunk_params);

        // Embedding failure degrades to lexical + entity retrieval.
        let vectors = match &self.embedder {
            Some(embedder) => {
                let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
                match embed_batched(embedder.as_ref(), &texts, self.batch_size).await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!(document_id, error = %e, "embedding failed, indexing without vectors");
                        None
                    }
                }
            }
            None => None,
        };

        let doc = IndexedDocument {
            handle: handle.clone(),
            document_id: document_id.to_string(),
            display_name: display_name.map(str::to_string),
            page_count: pages.len() as i64,
            passage_count: passages.len() as i64,
            created_at: chrono::Utc::now().timestamp(),
            activated_at: None,
        };
        self.store
            .index_document(&doc, &passages, vectors.as_deref())
            .await
            .with_context(|| format!("Failed to store passages for {}", document_id))?;

        info!(
            document_id,
            handle = %handle,
            pages = pages.len(),
            passages = passages.len(),
            embedded = vectors.is_some(),
            "document indexed"
        );

        Ok(IndexReport {
            id: handle,
            document_id: document_id.to_string(),
            pages: pages.len(),
            passages: passages.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docqa_core::embedding::HashEmbedder;
    use docqa_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn test_index_text_upload() {
        let store = Arc::new(InMemoryStore::new());
        let indexer = Indexer::new(
            store.clone(),
            Some(Arc::new(HashEmbedder::new(32))),
            ChunkParams::default(),
            8,
        );
        let report = indexer
            .index(
                "doc-7",
                Some("Lease"),
                b"The parties are Acme and Globex.\x0cNotice period is 30 days.",
                "text/plain",
            )
            .await
            .unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(report.document_id, "doc-7");
        assert!(report.passages >= 2);

        let doc = store.find_by_document_id("doc-7").await.unwrap().unwrap();
        assert_eq!(doc.handle, report.id);
        let passages = store.get_passages(&report.id).await.unwrap();
        assert_eq!(passages.last().unwrap().source_page, 2);
    }

    #[tokio::test]
    async fn test_each_upload_gets_new_handle() {
        let store = Arc::new(InMemoryStore::new());
        let indexer = Indexer::new(store, None, ChunkParams::default(), 8);
        let a = indexer.index("d", None, b"text", "text/plain").await.unwrap();
        let b = indexer.index("d", None, b"text", "text/plain").await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_empty_upload_fails() {
        let store = Arc::new(InMemoryStore::new());
        let indexer = Indexer::new(store, None, ChunkParams::default(), 8);
        assert!(indexer.index("d", None, b"   ", "text/plain").await.is_err());
    }
}
