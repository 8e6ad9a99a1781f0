//! NNTP article ingest engine: connection pooling and fetch planning,
//! per-group sharded article storage, phased batch commits, and the
//! two-tier thread cache that serves paginated listings.
//!
//! The crate is consumed two ways: the `pugleaf-fetch` binary drives
//! the ingest pipeline, and rendering/posting layers link against the
//! read API on [`storage::Database`].

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod nntp;
pub mod storage;

pub use error::{Error, Result};
