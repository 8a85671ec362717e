//! # Annotation Harness
//!
//! The record-management core of a data-annotation platform.
//!
//! Annotation Harness ingests batches of annotated/predicted records into
//! named datasets backed by a search index, answers structured
//! search/aggregation queries, streams arbitrarily large result sets as
//! NDJSON without buffering, and computes weak-supervision quality metrics
//! for user-defined labeling rules.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────────────────┐   ┌───────────┐
//! │ HTTP (anno)│──▶│  core: ingest / search /  │──▶│  SQLite    │
//! │   Axum     │   │  export scan / rules      │   │ FTS5 index │
//! └────────────┘   └───────────────────────────┘   └───────────┘
//! ```
//!
//! All domain logic lives in the `annotation-harness-core` crate and talks
//! to storage through its `RecordIndex` trait; this crate provides the TOML
//! configuration, the SQLite index backend, the Axum HTTP surface, and the
//! `anno` CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! anno init                     # create the SQLite index
//! anno serve                    # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`sqlite_index`] | SQLite implementation of the index contract |
//! | [`server`] | HTTP API server (Axum) |

pub mod config;
pub mod db;
pub mod migrate;
pub mod server;
pub mod sqlite_index;

pub use annotation_harness_core::{export, index, ingest, models, query, rules, search, validate};
