//! Client-side document load cache.
//!
//! [`DocumentLoadCache::ensure_loaded`] makes a document queryable on the
//! backend at most once per TTL window:
//!
//! ```text
//! ensure_loaded(id)
//!   ├─ fresh LOADED entry ──────────────▶ Ok (no backend call)
//!   ├─ fresh ERROR entry ───────────────▶ Err(PreviousFailure)
//!   ├─ load in flight ──────────────────▶ await the same load
//!   └─ otherwise: spawn load
//!        health ─▶ check-document ─┬─ exists ─▶ LOADED (handle = ragId)
//!                                  └─ fetch blob ─▶ upload ─▶ LOADED
//! ```
//!
//! Each load runs as its own task behind a [`Shared`] future, so any number
//! of callers for one id share one backend round-trip and one result. The
//! state lock is a plain `Mutex` that is never held across an `.await`.
//!
//! Every committed entry is written through a [`CacheStore`]. Loads are not
//! resumable: a `LOADING` record found at startup is discarded. Entries
//! older than the TTL count as absent and are evicted by the sweeper.
//!
//! Loads carry an operation id. A load that was reset or cancelled may still
//! reach its commit step; the id no longer matches and its result is
//! dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::client::{Backend, Upload};
use crate::error::LoadError;
use crate::extract::{MIME_PDF, MIME_TEXT};

// ============ Entries ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStatus {
    Loading,
    Loaded,
    Error,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Loading => "LOADING",
            LoadStatus::Loaded => "LOADED",
            LoadStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOADING" => Some(LoadStatus::Loading),
            "LOADED" => Some(LoadStatus::Loaded),
            "ERROR" => Some(LoadStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub document_id: String,
    pub display_name: String,
    pub status: LoadStatus,
    pub last_updated: DateTime<Utc>,
    pub backend_handle: Option<String>,
    pub last_error: Option<String>,
}

// ============ Clock ============

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============ Persistence ============

/// Durable home of cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<CacheEntry>>;
    async fn put(&self, entry: &CacheEntry) -> Result<()>;
    async fn remove(&self, document_id: &str) -> Result<()>;
}

/// `cache_entries` table in the cache database.
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn load_all(&self) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query(
            "SELECT document_id, display_name, status, last_updated, backend_handle, last_error
             FROM cache_entries ORDER BY document_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let document_id: String = row.get("document_id");
            let status: String = row.get("status");
            let Some(status) = LoadStatus::parse(&status) else {
                warn!(document_id = %document_id, status = %status, "skipping cache entry with unknown status");
                continue;
            };
            let last_updated: String = row.get("last_updated");
            let last_updated = DateTime::parse_from_rfc3339(&last_updated)
                .with_context(|| format!("bad last_updated for {}", document_id))?
                .with_timezone(&Utc);
            entries.push(CacheEntry {
                document_id,
                display_name: row.get("display_name"),
                status,
                last_updated,
                backend_handle: row.get("backend_handle"),
                last_error: row.get("last_error"),
            });
        }
        Ok(entries)
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (document_id, display_name, status, last_updated, backend_handle, last_error)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                display_name = excluded.display_name,
                status = excluded.status,
                last_updated = excluded.last_updated,
                backend_handle = excluded.backend_handle,
                last_error = excluded.last_error
            "#,
        )
        .bind(&entry.document_id)
        .bind(&entry.display_name)
        .bind(entry.status.as_str())
        .bind(entry.last_updated.to_rfc3339_opts(SecondsFormat::Millis, true))
        .bind(&entry.backend_handle)
        .bind(&entry.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, document_id: &str) -> Option<CacheEntry> {
        self.lock().get(document_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load_all(&self) -> Result<Vec<CacheEntry>> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(all)
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        self.lock()
            .insert(entry.document_id.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        self.lock().remove(document_id);
        Ok(())
    }
}

// ============ Blob sources ============

/// Where a document's bytes come from when it has to be uploaded.
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Short description for error messages.
    fn describe(&self) -> String;

    fn content_type(&self) -> Option<String> {
        None
    }

    /// Fetch the bytes. An unavailable source is an [`LoadError::EmptySourceBlob`].
    async fn fetch(&self) -> Result<Vec<u8>, LoadError>;
}

pub struct FileBlob {
    path: PathBuf,
}

impl FileBlob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BlobSource for FileBlob {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn content_type(&self) -> Option<String> {
        let ext = self.path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(MIME_PDF.to_string()),
            "txt" | "text" | "md" => Some(MIME_TEXT.to_string()),
            _ => None,
        }
    }

    async fn fetch(&self) -> Result<Vec<u8>, LoadError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| LoadError::EmptySourceBlob(format!("{}: {}", self.path.display(), e)))
    }
}

pub struct StaticBlob {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

impl StaticBlob {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.map(str::to_string),
        }
    }
}

#[async_trait]
impl BlobSource for StaticBlob {
    fn describe(&self) -> String {
        format!("in-memory blob ({} bytes)", self.bytes.len())
    }

    fn content_type(&self) -> Option<String> {
        self.content_type.clone()
    }

    async fn fetch(&self) -> Result<Vec<u8>, LoadError> {
        Ok(self.bytes.clone())
    }
}

// ============ Cache ============

type SharedLoad = Shared<BoxFuture<'static, Result<String, LoadError>>>;

struct InFlight {
    op: u64,
    load: SharedLoad,
    abort: AbortHandle,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, CacheEntry>,
    inflight: HashMap<String, InFlight>,
    next_op: u64,
}

struct Inner {
    backend: Arc<dyn Backend>,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: Mutex<State>,
    /// Orders store writes the same way as the state changes they mirror.
    writes: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct DocumentLoadCache {
    inner: Arc<Inner>,
}

impl DocumentLoadCache {
    /// Restore entries from `store`. `LOADING` records are dropped from both
    /// memory and the store.
    pub async fn open(
        backend: Arc<dyn Backend>,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Result<Self> {
        let mut entries = HashMap::new();
        let mut discarded = 0usize;
        for entry in store.load_all().await.context("failed to read cache entries")? {
            if entry.status == LoadStatus::Loading {
                store.remove(&entry.document_id).await?;
                discarded += 1;
                continue;
            }
            entries.insert(entry.document_id.clone(), entry);
        }
        info!(restored = entries.len(), discarded, "document cache opened");

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                store,
                clock,
                ttl,
                state: Mutex::new(State {
                    entries,
                    ..State::default()
                }),
                writes: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Make `document_id` queryable on the backend, uploading it from `blob`
    /// only when the backend does not already have it.
    pub async fn ensure_loaded(
        &self,
        document_id: &str,
        display_name: &str,
        blob: Arc<dyn BlobSource>,
    ) -> Result<(), LoadError> {
        let load = {
            let mut state = self.inner.lock();
            if let Some(flight) = state.inflight.get(document_id) {
                debug!(document_id, "joining in-flight load");
                flight.load.clone()
            } else {
                match self.inner.fresh(state.entries.get(document_id)) {
                    Some(entry) if entry.status == LoadStatus::Loaded => return Ok(()),
                    Some(entry) if entry.status == LoadStatus::Error => {
                        return Err(LoadError::PreviousFailure(
                            entry.last_error.clone().unwrap_or_default(),
                        ));
                    }
                    _ => {}
                }
                self.start(&mut state, document_id, display_name, blob)
            }
        };
        load.await.map(|_| ())
    }

    /// Called with the state lock held; registers the load before any other
    /// caller can look.
    fn start(
        &self,
        state: &mut State,
        document_id: &str,
        display_name: &str,
        blob: Arc<dyn BlobSource>,
    ) -> SharedLoad {
        state.next_op += 1;
        let op = state.next_op;
        state.entries.insert(
            document_id.to_string(),
            CacheEntry {
                document_id: document_id.to_string(),
                display_name: display_name.to_string(),
                status: LoadStatus::Loading,
                last_updated: self.inner.clock.now(),
                backend_handle: None,
                last_error: None,
            },
        );

        let inner = self.inner.clone();
        let id = document_id.to_string();
        let name = display_name.to_string();
        let handle: JoinHandle<Result<String, LoadError>> =
            tokio::spawn(async move { inner.run(op, id, name, blob).await });
        let abort = handle.abort_handle();
        let load = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(LoadError::Cancelled),
                Err(e) => Err(LoadError::Transport(format!("load task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        state.inflight.insert(
            document_id.to_string(),
            InFlight {
                op,
                load: load.clone(),
                abort,
            },
        );
        load
    }

    /// Forget `document_id`, aborting any in-flight load, so the next
    /// `ensure_loaded` starts over.
    pub async fn reset_status(&self, document_id: &str) -> Result<(), LoadError> {
        let _w = self.inner.writes.lock().await;
        {
            let mut state = self.inner.lock();
            if let Some(flight) = state.inflight.remove(document_id) {
                flight.abort.abort();
            }
            state.entries.remove(document_id);
        }
        info!(document_id, "cache entry reset");
        self.inner
            .store
            .remove(document_id)
            .await
            .map_err(|e| LoadError::Persistence(e.to_string()))
    }

    /// Abort an in-flight load. Its waiters get [`LoadError::Cancelled`] and
    /// the entry becomes `ERROR`. Returns whether a load was running.
    pub async fn cancel(&self, document_id: &str) -> bool {
        let _w = self.inner.writes.lock().await;
        let entry = {
            let mut state = self.inner.lock();
            let Some(flight) = state.inflight.remove(document_id) else {
                return false;
            };
            flight.abort.abort();
            let display_name = state
                .entries
                .get(document_id)
                .map(|e| e.display_name.clone())
                .unwrap_or_default();
            let entry = CacheEntry {
                document_id: document_id.to_string(),
                display_name,
                status: LoadStatus::Error,
                last_updated: self.inner.clock.now(),
                backend_handle: None,
                last_error: Some(LoadError::Cancelled.to_string()),
            };
            state.entries.insert(document_id.to_string(), entry.clone());
            entry
        };
        info!(document_id, "load cancelled");
        self.inner.persist(&entry).await;
        true
    }

    /// Snapshot of one entry; expired entries are absent.
    pub fn status(&self, document_id: &str) -> Option<CacheEntry> {
        let state = self.inner.lock();
        self.inner.fresh(state.entries.get(document_id)).cloned()
    }

    /// Backend handle of a loaded document.
    pub fn handle(&self, document_id: &str) -> Option<String> {
        self.status(document_id)
            .filter(|e| e.status == LoadStatus::Loaded)
            .and_then(|e| e.backend_handle)
    }

    /// All unexpired entries, by document id.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let state = self.inner.lock();
        let mut out: Vec<_> = state
            .entries
            .values()
            .filter(|e| self.inner.fresh(Some(*e)).is_some())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        out
    }

    /// Evict expired entries from memory and the store. Entries with a load
    /// still in flight are left alone. Returns how many were evicted.
    pub async fn sweep_expired(&self) -> usize {
        let _w = self.inner.writes.lock().await;
        let expired: Vec<String> = {
            let mut state = self.inner.lock();
            let ids: Vec<String> = state
                .entries
                .values()
                .filter(|e| {
                    self.inner.fresh(Some(*e)).is_none() && !state.inflight.contains_key(&e.document_id)
                })
                .map(|e| e.document_id.clone())
                .collect();
            for id in &ids {
                state.entries.remove(id);
            }
            ids
        };
        for id in &expired {
            if let Err(e) = self.inner.store.remove(id).await {
                warn!(document_id = %id, error = %e, "failed to evict cache entry");
            }
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), "swept expired cache entries");
        }
        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until the
    /// returned task is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep_expired().await;
            }
        })
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh<'a>(&self, entry: Option<&'a CacheEntry>) -> Option<&'a CacheEntry> {
        let entry = entry?;
        match (self.clock.now() - entry.last_updated).to_std() {
            Ok(age) if age >= self.ttl => None,
            // A clock that moved backwards leaves the entry fresh.
            _ => Some(entry),
        }
    }

    async fn persist(&self, entry: &CacheEntry) {
        if let Err(e) = self.store.put(entry).await {
            warn!(document_id = %entry.document_id, error = %e, "failed to persist cache entry");
        }
    }

    /// Body of a load task.
    async fn run(
        self: Arc<Self>,
        op: u64,
        document_id: String,
        display_name: String,
        blob: Arc<dyn BlobSource>,
    ) -> Result<String, LoadError> {
        let loading = {
            let _w = self.writes.lock().await;
            let entry = self.lock().entries.get(&document_id).cloned();
            match entry {
                Some(entry) => self
                    .store
                    .put(&entry)
                    .await
                    .map_err(|e| LoadError::Persistence(e.to_string())),
                None => Ok(()),
            }
        };
        let result = match loading {
            Ok(()) => self.load(&document_id, &display_name, blob.as_ref()).await,
            Err(e) => Err(e),
        };
        self.commit(op, &document_id, &display_name, &result).await;
        result
    }

    async fn load(
        &self,
        document_id: &str,
        display_name: &str,
        blob: &dyn BlobSource,
    ) -> Result<String, LoadError> {
        self.backend.health().await?;

        let existence = self.backend.check_document(document_id).await?;
        if existence.exists {
            info!(document_id, "document already indexed, skipping upload");
            return Ok(existence.rag_id.unwrap_or_else(|| document_id.to_string()));
        }

        let bytes = blob.fetch().await?;
        if bytes.is_empty() {
            return Err(LoadError::EmptySourceBlob(blob.describe()));
        }
        info!(document_id, bytes = bytes.len(), "uploading document");
        self.backend
            .upload(Upload {
                document_id: document_id.to_string(),
                display_name: display_name.to_string(),
                bytes,
                content_type: blob.content_type(),
            })
            .await
    }

    async fn commit(
        &self,
        op: u64,
        document_id: &str,
        display_name: &str,
        result: &Result<String, LoadError>,
    ) {
        let _w = self.writes.lock().await;
        let entry = {
            let mut state = self.lock();
            match state.inflight.get(document_id) {
                Some(flight) if flight.op == op => {}
                _ => {
                    debug!(document_id, op, "discarding result of superseded load");
                    return;
                }
            }
            state.inflight.remove(document_id);
            let (status, backend_handle, last_error) = match result {
                Ok(handle) => (LoadStatus::Loaded, Some(handle.clone()), None),
                Err(e) => (LoadStatus::Error, None, Some(e.to_string())),
            };
            let entry = CacheEntry {
                document_id: document_id.to_string(),
                display_name: display_name.to_string(),
                status,
                last_updated: self.clock.now(),
                backend_handle,
                last_error,
            };
            state.entries.insert(document_id.to_string(), entry.clone());
            entry
        };
        match result {
            Ok(handle) => info!(document_id, handle = %handle, "document loaded"),
            Err(e) => warn!(document_id, kind = e.kind(), error = %e, "document load failed"),
        }
        self.persist(&entry).await;
    }
}
