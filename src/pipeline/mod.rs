//! # Event Pipeline
//!
//! Ingestion path (per request):
//! 1. `validator` - raw JSON → `Event`, pure
//! 2. `dedup` - bounded-window first-delivery check
//! 3. `buffer` - per-partition write-ahead queue, batched durable commits
//!
//! Aggregation path (per partition, background):
//! 4. `aggregation` - folds the committed log into buckets behind a fenced checkpoint
//! 5. `query` - reads published snapshots only
//!
//! ## Schema Reference
//!
//! All persisted types match the SQL schema in `/sql/`:
//! - `events` → `PersistedEvent`
//! - `aggregate_buckets` → `AggregateBucket`
//! - `aggregation_checkpoints` → `Checkpoint`

pub mod aggregation;
pub mod backoff;
pub mod buffer;
pub mod dedup;
pub mod ingestion;
pub mod query;
pub mod store;
pub mod types;
pub mod validator;

pub use aggregation::{AggregationConfig, AggregationEngine, AggregationError, PartitionSnapshot};
pub use buffer::{Ack, BufferConfig, BufferError, CommitResult, WriteAheadBuffer};
pub use dedup::{Admission, DedupConfig, Deduplicator, InFlight};
pub use ingestion::{BatchOutcome, BatchStatus, EventOutcome, EventStatus, IngestionService};
pub use query::{QueryError, QueryResult, QueryService};
pub use store::{Appended, EventStore, SqliteEventStore, StorageError};
pub use types::{BucketKey, Event, EventType, PersistedEvent};
pub use validator::{RawEvent, ValidationError, ValidationPolicy};
