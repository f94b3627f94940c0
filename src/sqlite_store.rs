//! SQLite implementation of [`PassageStore`].
//!
//! Lexical search runs through the FTS5 `passages_fts` table with BM25
//! ranking (negated so higher is better). Semantic search loads the
//! document's vectors and computes cosine similarity in Rust. The entity
//! ranker prefilters with FTS5 phrase queries and scores matches with
//! [`phrase_score`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use docqa_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docqa_core::models::{Passage, PassageClass};
use docqa_core::store::{
    phrase_score, rank_candidates, IndexedDocument, PassageCandidate, PassageStore,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// All indexed documents, newest first.
    pub async fn list_documents(&self) -> Result<Vec<IndexedDocument>> {
        let rows = sqlx::query(
            "SELECT handle, document_id, display_name, page_count, passage_count, created_at, activated_at
             FROM documents ORDER BY created_at DESC, handle",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn upsert_document_tx(tx: &mut Transaction<'_, Sqlite>, doc: &IndexedDocument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (handle, document_id, display_name, page_count, passage_count, created_at, activated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(handle) DO UPDATE SET
                document_id = excluded.document_id,
                display_name = excluded.display_name,
                page_count = excluded.page_count,
                passage_count = excluded.passage_count,
                activated_at = excluded.activated_at
            "#,
        )
        .bind(&doc.handle)
        .bind(&doc.document_id)
        .bind(&doc.display_name)
        .bind(doc.page_count)
        .bind(doc.passage_count)
        .bind(doc.created_at)
        .bind(doc.activated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn replace_passages_tx(
        tx: &mut Transaction<'_, Sqlite>,
        handle: &str,
        passages: &[Passage],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        sqlx::query("DELETE FROM passages_fts WHERE handle = ?")
            .bind(handle)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM passage_vectors WHERE handle = ?")
            .bind(handle)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM passages WHERE handle = ?")
            .bind(handle)
            .execute(&mut **tx)
            .await?;

        for (i, p) in passages.iter().enumerate() {
            sqlx::query(
                "INSERT INTO passages (handle, id, text, source_page, passage_class, position, hash)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(handle)
            .bind(&p.id)
            .bind(&p.text)
            .bind(p.source_page)
            .bind(p.passage_class.as_str())
            .bind(p.position)
            .bind(&p.hash)
            .execute(&mut **tx)
            .await?;

            sqlx::query("INSERT INTO passages_fts (passage_id, handle, text) VALUES (?, ?, ?)")
                .bind(&p.id)
                .bind(handle)
                .bind(&p.text)
                .execute(&mut **tx)
                .await?;

            if let Some(vec) = vectors.and_then(|v| v.get(i)) {
                sqlx::query(
                    "INSERT INTO passage_vectors (handle, passage_id, dims, content_hash, embedding)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(handle)
                .bind(&p.id)
                .bind(vec.len() as i64)
                .bind(&p.hash)
                .bind(vec_to_blob(vec))
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn fts_candidates(
        &self,
        handle: &str,
        match_expr: &str,
        limit: i64,
    ) -> Result<Vec<PassageCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.handle, p.text, p.source_page, p.passage_class, p.position, p.hash,
                   bm25(passages_fts) AS score
            FROM passages_fts
            JOIN passages p ON p.handle = passages_fts.handle AND p.id = passages_fts.passage_id
            WHERE passages_fts MATCH ? AND passages_fts.handle = ?
            ORDER BY score
            LIMIT ?
            "#,
        )
        .bind(match_expr)
        .bind(handle)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("FTS query failed")?;

        rows.iter()
            .map(|row| {
                let score: f64 = row.get("score");
                Ok(PassageCandidate {
                    passage: row_to_passage(row)?,
                    raw_score: -score, // negate so higher = better
                })
            })
            .collect()
    }
}

fn row_to_document(row: &SqliteRow) -> IndexedDocument {
    IndexedDocument {
        handle: row.get("handle"),
        document_id: row.get("document_id"),
        display_name: row.get("display_name"),
        page_count: row.get("page_count"),
        passage_count: row.get("passage_count"),
        created_at: row.get("created_at"),
        activated_at: row.get("activated_at"),
    }
}

fn row_to_passage(row: &SqliteRow) -> Result<Passage> {
    let class: String = row.get("passage_class");
    Ok(Passage {
        id: row.get("id"),
        document_id: row.get("handle"),
        text: row.get("text"),
        source_page: row.get("source_page"),
        passage_class: class.parse::<PassageClass>()?,
        position: row.get("position"),
        hash: row.get("hash"),
    })
}

/// Quote a term or phrase for an FTS5 MATCH expression.
fn fts_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn fts_any(items: &[String]) -> Option<String> {
    let quoted: Vec<String> = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| s.chars().any(|c| c.is_alphanumeric()))
        .map(fts_quote)
        .collect();
    (!quoted.is_empty()).then(|| quoted.join(" OR "))
}

#[async_trait]
impl PassageStore for SqliteStore {
    async fn upsert_document(&self, doc: &IndexedDocument) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_document_tx(&mut tx, doc).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_document_id(&self, document_id: &str) -> Result<Option<IndexedDocument>> {
        let row = sqlx::query(
            "SELECT handle, document_id, display_name, page_count, passage_count, created_at, activated_at
             FROM documents WHERE document_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn get_document(&self, handle: &str) -> Result<Option<IndexedDocument>> {
        let row = sqlx::query(
            "SELECT handle, document_id, display_name, page_count, passage_count, created_at, activated_at
             FROM documents WHERE handle = ?",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn mark_activated(&self, handle: &str, at: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE documents SET activated_at = ? WHERE handle = ?")
            .bind(at)
            .bind(handle)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_passages(
        &self,
        handle: &str,
        passages: &[Passage],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::replace_passages_tx(&mut tx, handle, passages, vectors).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_passages(&self, handle: &str) -> Result<Vec<Passage>> {
        let rows = sqlx::query(
            "SELECT id, handle, text, source_page, passage_class, position, hash
             FROM passages WHERE handle = ? ORDER BY position",
        )
        .bind(handle)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_passage).collect()
    }

    async fn keyword_search(
        &self,
        handle: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>> {
        let Some(expr) = fts_any(terms) else {
            return Ok(Vec::new());
        };
        let mut candidates = self.fts_candidates(handle, &expr, limit as i64).await?;
        rank_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        handle: &str,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.handle, p.text, p.source_page, p.passage_class, p.position, p.hash,
                   v.embedding
            FROM passage_vectors v
            JOIN passages p ON p.handle = v.handle AND p.id = v.passage_id
            WHERE v.handle = ?
            "#,
        )
        .bind(handle)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
            if similarity > 0.0 {
                candidates.push(PassageCandidate {
                    passage: row_to_passage(row)?,
                    raw_score: similarity,
                });
            }
        }
        rank_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn phrase_search(
        &self,
        handle: &str,
        phrases: &[String],
        limit: usize,
    ) -> Result<Vec<PassageCandidate>> {
        let Some(expr) = fts_any(phrases) else {
            return Ok(Vec::new());
        };
        // FTS5 tokenizes phrases; rescore on raw text so every store agrees.
        let mut candidates: Vec<PassageCandidate> = self
            .fts_candidates(handle, &expr, -1)
            .await?
            .into_iter()
            .filter_map(|mut c| {
                let score = phrase_score(&c.passage.text, phrases);
                (score > 0.0).then(|| {
                    c.raw_score = score;
                    c
                })
            })
            .collect();
        rank_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn index_document(
        &self,
        doc: &IndexedDocument,
        passages: &[Passage],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_document_tx(&mut tx, doc).await?;
        Self::replace_passages_tx(&mut tx, &doc.handle, passages, vectors).await?;
        tx.commit().await?;
        Ok(())
    }
}
