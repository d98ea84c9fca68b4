//! Shared fixtures for integration tests
#![allow(dead_code)]

use adtrack::pipeline::store::{AggregationCommit, Appended, FenceOutcome};
use adtrack::pipeline::types::{AggregateBucket, Checkpoint};
use adtrack::pipeline::{Event, EventStore, PersistedEvent, SqliteEventStore, StorageError};
use adtrack::Config;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::Semaphore;

pub const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

pub fn temp_store() -> (TempDir, Arc<SqliteEventStore>) {
    let dir = tempdir().unwrap();
    let store = SqliteEventStore::open_with_schema(dir.path().join("adtrack.db"), SCHEMA_DIR)
        .unwrap();
    (dir, Arc::new(store))
}

/// Fast timers so tests settle in milliseconds
pub fn test_config(partitions: u32) -> Config {
    Config {
        partitions,
        batch_max_delay_ms: 2,
        retry_initial_ms: 1,
        retry_max_ms: 5,
        retry_max_retries: 3,
        agg_poll_ms: 10,
        ..Config::default()
    }
}

pub fn event_json(id: &str, campaign: &str, event_type: &str, ts: DateTime<Utc>) -> Value {
    json!({
        "event_id": id,
        "campaign_id": campaign,
        "event_type": event_type,
        "timestamp": ts.to_rfc3339(),
    })
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// SQLite store whose appends can fail a set number of times or block
/// until a permit is granted
pub struct FlakyStore {
    inner: Arc<SqliteEventStore>,
    fail_first: u32,
    calls: AtomicU32,
    gate: Option<Arc<Semaphore>>,
}

impl FlakyStore {
    pub fn failing(inner: Arc<SqliteEventStore>, fail_first: u32) -> Self {
        Self {
            inner,
            fail_first,
            calls: AtomicU32::new(0),
            gate: None,
        }
    }

    pub fn gated(inner: Arc<SqliteEventStore>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::failing(inner, 0)
        }
    }

    pub fn append_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn append_batch(
        &self,
        partition: u32,
        events: Vec<Event>,
    ) -> Result<Vec<Appended>, StorageError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?
                .forget();
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(StorageError::Unavailable(format!("injected failure #{}", call + 1)));
        }
        self.inner.append_batch(partition, events).await
    }

    async fn read_after(
        &self,
        partition: u32,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>, StorageError> {
        self.inner.read_after(partition, after_seq, limit).await
    }

    async fn head_sequence(&self, partition: u32) -> Result<u64, StorageError> {
        self.inner.head_sequence(partition).await
    }

    async fn event_id_at(&self, partition: u32, seq: u64) -> Result<Option<String>, StorageError> {
        self.inner.event_id_at(partition, seq).await
    }

    async fn load_checkpoint(&self, partition: u32) -> Result<Checkpoint, StorageError> {
        self.inner.load_checkpoint(partition).await
    }

    async fn apply_aggregation(
        &self,
        commit: AggregationCommit,
    ) -> Result<FenceOutcome, StorageError> {
        self.inner.apply_aggregation(commit).await
    }

    async fn load_buckets(&self, partition: u32) -> Result<Vec<AggregateBucket>, StorageError> {
        self.inner.load_buckets(partition).await
    }

    async fn reset_partition(&self, partition: u32) -> Result<(), StorageError> {
        self.inner.reset_partition(partition).await
    }

    async fn recent_event_ids(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StorageError> {
        self.inner.recent_event_ids(since).await
    }
}
