//! # Storage Rollup Core
//!
//! Incremental, resumable storage-usage rollups over a deduplicated file
//! inventory: data models, entity resolution, content mapping, aggregation,
//! the pipeline state machine, and the published result store.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Persistence and
//! the file inventory are reached through the [`store::CheckpointStore`]
//! and [`store::FactSource`] traits; [`store::memory`] provides in-memory
//! implementations of both.
//!
//! ## Data flow
//!
//! ```text
//! FactSource ──▶ ContentMappingBuilder ──▶ Mapping region
//!                                               │
//!                                               ▼
//!        ResultStore ◀── Pipeline ◀── AggregationAccumulator
//! ```

pub mod aggregate;
pub mod mapping;
pub mod models;
pub mod pipeline;
pub mod resolver;
pub mod results;
pub mod store;
