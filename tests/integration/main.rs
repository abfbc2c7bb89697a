//! Integration tests for the verdict ingestion pipeline.
//!
//! Run with: `cargo test --test integration`

mod buffer_eviction;
mod changepoint_analysis;
mod export_rows;
mod ingest_driver;
