//! # docqa
//!
//! Question answering over long documents with cited, streamed answers.
//!
//! A client makes a document queryable through the [`cache`], which uploads
//! it to the backend at most once and coalesces concurrent requests. The
//! backend ([`server`]) indexes uploads into passages and answers queries
//! with a hybrid retrieval pass, a token budget, and a streaming synthesizer
//! whose citations always point at retrieved passages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  upload   ┌──────────────┐   ┌──────────────┐
//! │ Load cache   │──────────▶│  Indexer     │──▶│   SQLite     │
//! │ (client)     │           │ extract+chunk│   │ FTS5 + vecs  │
//! └──────┬───────┘           └──────────────┘   └──────┬───────┘
//!        │ query (SSE)                                 │
//!        ▼                                             ▼
//! ┌──────────────┐           ┌──────────────┐   ┌──────────────┐
//! │ BackendClient│◀──────────│ Synthesizer  │◀──│ Retrieval +  │
//! │              │  events   │ + citations  │   │ budget       │
//! └──────────────┘           └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docqa init                                   # create databases
//! docqa serve                                  # start the backend
//! docqa load contract-7 ./contract.pdf         # upload through the cache
//! docqa ask contract-7 "Who are the parties?"  # stream an answer
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`cache`] | Document load cache (single flight, TTL, persistence) |
//! | [`client`] | Backend HTTP client and probes |
//! | [`commands`] | CLI command implementations |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`embedding`] | Embedding provider selection |
//! | [`error`] | Load and stream error taxonomies |
//! | [`extract`] | Per-page text extraction |
//! | [`generation`] | Answer generators |
//! | [`ingest`] | Upload indexing |
//! | [`migrate`] | Schema migrations |
//! | [`pipeline`] | Query engine |
//! | [`server`] | Backend HTTP server |
//! | [`sqlite_store`] | SQLite passage store |
//! | [`synth`] | Streaming answer synthesis |
//!
//! Retrieval, budgeting, citation handling, and the wire protocol live in
//! the `docqa-core` crate.

pub mod cache;
pub mod client;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod server;
pub mod sqlite_store;
pub mod synth;
