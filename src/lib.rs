//! # adtrack - ad event ingestion and aggregation
//!
//! Accepts impression/click events over HTTP, validates and deduplicates them,
//! commits them to a partitioned, gapless SQLite log, and folds the log into
//! per-campaign, per-minute counters that are served back as queries and as
//! Prometheus metrics.
//!
//! ## Architecture
//!
//! ```text
//! POST /events
//!     ↓
//! IngestionService
//!     ├─ validator::validate      (pure, per event)
//!     ├─ Deduplicator::admit      (sharded check-and-insert)
//!     └─ WriteAheadBuffer         (bounded queue → batched txn → Ack)
//!             ↓
//! EventStore (SQLite: events / aggregate_buckets / aggregation_checkpoints)
//!             ↓
//! AggregationEngine (one task per partition, fenced checkpoints)
//!             ↓ watch::Receiver<Arc<PartitionSnapshot>>
//! QueryService → GET /campaigns/:id/aggregates
//! ```
//!
//! ## Module Organization
//!
//! - `config` - environment-driven configuration
//! - `pipeline` - validator, deduplicator, buffer, store, aggregation, query
//! - `api` - axum routers for the ingestion and metrics listeners
//! - `observability` - Prometheus recorder and metric helpers
//! - `runtime` - component wiring and shutdown

pub mod api;
pub mod config;
pub mod observability;
pub mod pipeline;
pub mod runtime;
pub mod sqlite_pragma;

pub use config::Config;
pub use runtime::Runtime;
