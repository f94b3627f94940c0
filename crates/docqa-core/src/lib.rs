//! # docqa core
//!
//! Pure logic shared by the docqa backend and client: the passage data model,
//! page chunking, query analysis, entity detection, hybrid rank fusion, token
//! budget allocation, citation markers, and the streaming wire protocol.
//!
//! This crate contains no tokio, sqlx, network, or filesystem dependencies.
//! Storage is reached only through the [`store::PassageStore`] trait.
//!
//! ## Pipeline
//!
//! ```text
//! query ──▶ query::plan ──▶ search::retrieve ──▶ budget::allocate ──▶ generation
//!                              │  semantic                              │
//!                              │  lexical      (max fusion)             ▼
//!                              │  entity                        citation::resolve
//! ```

pub mod budget;
pub mod chunk;
pub mod citation;
pub mod embedding;
pub mod entity;
pub mod models;
pub mod protocol;
pub mod query;
pub mod search;
pub mod store;
