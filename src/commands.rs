//! CLI command implementations.
//!
//! Each `run_*` function backs one `docqa` subcommand and prints its result
//! to stdout. Logging goes to stderr so the output stays pipeable.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use docqa_core::models::StreamEvent;
use docqa_core::store::PassageStore;

use crate::cache::{BlobSource, DocumentLoadCache, FileBlob, SqliteCacheStore, SystemClock};
use crate::client::BackendClient;
use crate::config::Config;
use crate::db;
use crate::migrate::{migrate_backend, migrate_cache};
use crate::pipeline::QueryEngine;
use crate::sqlite_store::SqliteStore;

/// Open the load cache against the configured backend and cache database.
pub async fn open_cache(config: &Config, client: &BackendClient) -> Result<DocumentLoadCache> {
    let pool = db::connect(&config.cache.path).await?;
    migrate_cache(&pool).await?;
    DocumentLoadCache::open(
        Arc::new(client.clone()),
        Arc::new(SqliteCacheStore::new(pool)),
        Arc::new(SystemClock),
        config.cache.ttl(),
    )
    .await
}

fn file_blob(path: &Path) -> Result<Arc<dyn BlobSource>> {
    if !path.is_file() {
        bail!("not a file: {}", path.display());
    }
    Ok(Arc::new(FileBlob::new(path)))
}

fn default_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub async fn run_load(config: &Config, document_id: &str, path: &Path, name: Option<String>) -> Result<()> {
    let client = BackendClient::from_config(config);
    let cache = open_cache(config, &client).await?;
    let name = name.unwrap_or_else(|| default_name(path));

    cache
        .ensure_loaded(document_id, &name, file_blob(path)?)
        .await
        .with_context(|| format!("failed to load {}", document_id))?;

    let handle = cache.handle(document_id).unwrap_or_default();
    println!("Loaded {} ({}) as {}", document_id, name, handle);
    Ok(())
}

/// Load (optionally), activate, and stream an answer. Ctrl-C stops the
/// stream and closes the connection.
pub async fn run_ask(config: &Config, document_id: &str, query: &str, file: Option<&Path>) -> Result<()> {
    let client = BackendClient::from_config(config);

    let key = match file {
        Some(path) => {
            let cache = open_cache(config, &client).await?;
            cache
                .ensure_loaded(document_id, &default_name(path), file_blob(path)?)
                .await
                .with_context(|| format!("failed to load {}", document_id))?;
            cache
                .handle(document_id)
                .unwrap_or_else(|| document_id.to_string())
        }
        None => document_id.to_string(),
    };

    client.activate(&key).await;

    let cancel = CancellationToken::new();
    let mut events = client.query_stream(&key, query, cancel.clone()).await?;
    let mut printed = 0usize;
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                println!();
                eprintln!("Cancelled.");
                return Ok(());
            }
            e = events.next() => e,
        };
        let Some(event) = event else {
            bail!("answer stream closed without a result");
        };
        match event? {
            StreamEvent::ContentChunk { partial_text } => {
                // Chunks are cumulative; print only what is new.
                if let Some(new) = partial_text.get(printed..) {
                    print!("{}", new);
                    stdout.flush()?;
                }
                printed = partial_text.len();
            }
            StreamEvent::Complete {
                final_text,
                citations,
            } => {
                if let Some(rest) = final_text.get(printed..) {
                    print!("{}", rest);
                }
                println!();
                if !citations.is_empty() {
                    println!();
                    println!("Sources:");
                    for c in &citations {
                        let pages: Vec<String> = c.pages.iter().map(|p| p.to_string()).collect();
                        println!("  {}  page {}", c.marker, pages.join(", "));
                    }
                }
                return Ok(());
            }
            StreamEvent::Error {
                message,
                partial_text,
            } => {
                if let Some(rest) = partial_text.get(printed..) {
                    print!("{}", rest);
                }
                println!();
                bail!("answer failed: {}", message);
            }
        }
    }
}

/// Retrieval and allocation diagnostics against the local backend database.
pub async fn run_search(config: &Config, key: &str, query: &str) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate_backend(&pool).await?;
    let store: Arc<dyn PassageStore> = Arc::new(SqliteStore::new(pool));

    let doc = match store.get_document(key).await? {
        Some(doc) => doc,
        None => store
            .find_by_document_id(key)
            .await?
            .with_context(|| format!("document not found: {}", key))?,
    };

    let engine = QueryEngine::from_config(config, store)?;
    let prepared = engine.prepare(&doc.handle, query).await?;
    let plan = &prepared.plan;

    println!(
        "Query: {:?}  verbosity={:?}  top_k={}",
        plan.text, plan.verbosity, plan.top_k
    );
    if plan.is_multi_part() {
        for (i, q) in plan.sub_questions.iter().enumerate() {
            println!("  {}. {}", i + 1, q);
        }
    }
    if !prepared.retrieval.entities.is_empty() {
        println!("Entities: {}", prepared.retrieval.entities.join(", "));
    }
    println!();

    let selected = prepared.allocation.passages.len();
    for (i, sp) in prepared.retrieval.passages.iter().enumerate() {
        let mark = if i < selected { '*' } else { ' ' };
        let fmt = |s: Option<f64>| s.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".into());
        println!(
            "{}{:>3}. {:.3}  sem={} lex={} ent={}  p{} {}",
            mark,
            i + 1,
            sp.score,
            fmt(sp.rankers.semantic),
            fmt(sp.rankers.lexical),
            fmt(sp.rankers.entity),
            sp.passage.source_page,
            sp.passage.id
        );
        let snippet: String = sp.passage.text.chars().take(100).collect();
        println!("       {}", snippet.replace('\n', " "));
    }

    println!();
    println!(
        "Selected {} of {} passages, {} tokens{}",
        selected,
        prepared.retrieval.passages.len(),
        prepared.allocation.used_tokens,
        if prepared.allocation.truncated {
            " (truncated)"
        } else {
            ""
        }
    );
    Ok(())
}

pub async fn run_cache_list(config: &Config) -> Result<()> {
    let client = BackendClient::from_config(config);
    let cache = open_cache(config, &client).await?;
    let entries = cache.entries();
    if entries.is_empty() {
        println!("No cache entries.");
        return Ok(());
    }
    for e in entries {
        println!(
            "{:<8} {}  {}  {}{}",
            e.status.as_str(),
            e.document_id,
            e.last_updated.format("%Y-%m-%d %H:%M:%S"),
            e.display_name,
            match (&e.backend_handle, &e.last_error) {
                (Some(h), _) => format!("  -> {}", h),
                (None, Some(err)) => format!("  ({})", err),
                _ => String::new(),
            }
        );
    }
    Ok(())
}

pub async fn run_cache_reset(config: &Config, document_id: &str) -> Result<()> {
    let client = BackendClient::from_config(config);
    let cache = open_cache(config, &client).await?;
    cache.reset_status(document_id).await?;
    println!("Reset {}", document_id);
    Ok(())
}

pub async fn run_cache_sweep(config: &Config) -> Result<()> {
    let client = BackendClient::from_config(config);
    let cache = open_cache(config, &client).await?;
    let evicted = cache.sweep_expired().await;
    println!("Evicted {} expired entries.", evicted);
    Ok(())
}
