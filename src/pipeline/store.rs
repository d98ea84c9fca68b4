//! Durable event log and aggregate tables
//!
//! Tables (see `/sql/` directory):
//! - `events` - append-only, gapless `seq` per partition, unique `event_id`
//! - `aggregate_buckets` - UPSERT-increment counters per (partition, campaign, bucket)
//! - `aggregation_checkpoints` - last folded sequence per partition
//!
//! The core assumes the schema exists; `run_schema_migrations` establishes it.

use super::types::{AggregateBucket, BucketKey, Checkpoint, Event, EventType, PersistedEvent};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("schema directory not found: {0}")]
    SchemaMissing(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Aggregation deltas plus the checkpoint they advance to, applied as one
/// transaction only if the stored checkpoint still equals `expected_seq`.
#[derive(Debug, Clone)]
pub struct AggregationCommit {
    pub partition: u32,
    pub expected_seq: u64,
    pub checkpoint: Checkpoint,
    pub deltas: Vec<AggregateBucket>,
}

/// Result of appending one event
#[derive(Debug, Clone, PartialEq)]
pub enum Appended {
    /// Written now at the next sequence of the requested partition
    Inserted(PersistedEvent),
    /// The id was already in the log; this is the stored row, under the
    /// partition it was originally written to
    AlreadyStored(PersistedEvent),
}

impl Appended {
    pub fn persisted(&self) -> &PersistedEvent {
        match self {
            Appended::Inserted(event) | Appended::AlreadyStored(event) => event,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Appended::Inserted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    Applied,
    /// Another writer (or an earlier run) already moved the checkpoint
    Stale { current_seq: u64 },
}

/// Storage contract: ordered transactional append + queryable aggregates
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Commit `events` atomically, assigning the next sequence numbers of
    /// `partition` in order. Events whose id is already stored (in any
    /// partition) come back as `AlreadyStored` and are not written again, so
    /// a retried batch never duplicates or leaves gaps.
    async fn append_batch(
        &self,
        partition: u32,
        events: Vec<Event>,
    ) -> Result<Vec<Appended>, StorageError>;

    /// Up to `limit` events with `seq > after_seq`, ascending
    async fn read_after(
        &self,
        partition: u32,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>, StorageError>;

    /// Highest committed sequence, 0 when empty
    async fn head_sequence(&self, partition: u32) -> Result<u64, StorageError>;

    async fn event_id_at(&self, partition: u32, seq: u64) -> Result<Option<String>, StorageError>;

    async fn load_checkpoint(&self, partition: u32) -> Result<Checkpoint, StorageError>;

    async fn apply_aggregation(&self, commit: AggregationCommit)
        -> Result<FenceOutcome, StorageError>;

    async fn load_buckets(&self, partition: u32) -> Result<Vec<AggregateBucket>, StorageError>;

    /// Drop a partition's buckets and checkpoint in one transaction
    async fn reset_partition(&self, partition: u32) -> Result<(), StorageError>;

    /// (event_id, committed_at) for events committed at or after `since`
    async fn recent_event_ids(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StorageError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in name order (00_, 01_, ...) and
/// executes them. Every file must use IF NOT EXISTS clauses so re-running is
/// a no-op.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StorageError> {
    apply_optimized_pragmas(conn)?;
    log::info!("🔧 Running schema migrations from: {}", schema_dir);
    let applied = execute_sql_dir(conn, schema_dir)?;
    log::info!("✅ {} schema migrations completed successfully", applied);
    Ok(())
}

/// Apply fixture scripts (`INSERT OR IGNORE`) from `seed_dir`
pub fn run_seed_scripts(conn: &mut Connection, seed_dir: &str) -> Result<(), StorageError> {
    log::info!("🌱 Applying seed scripts from: {}", seed_dir);
    let applied = execute_sql_dir(conn, seed_dir)?;
    log::info!("✅ {} seed scripts applied", applied);
    Ok(())
}

fn execute_sql_dir(conn: &mut Connection, dir: &str) -> Result<usize, StorageError> {
    let path = Path::new(dir);
    if !path.is_dir() {
        return Err(StorageError::SchemaMissing(dir.to_string()));
    }

    let mut sql_files: Vec<_> = fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();
    sql_files.sort();

    for file in &sql_files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        log::info!("   ├─ Executing: {}", name);

        let sql = fs::read_to_string(file)?;
        let tx = conn.transaction()?;
        tx.execute_batch(&sql)?;
        tx.commit()?;
    }

    Ok(sql_files.len())
}

/// SQLite implementation of `EventStore`
///
/// One connection behind a mutex; every call runs on the blocking pool so
/// the async executor never waits on fsync.
#[derive(Clone)]
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open an existing database (schema must already be migrated)
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        apply_optimized_pragmas(&conn)?;

        log::info!("✅ SQLite event store opened: {}", db_path.as_ref().display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open and migrate in one step
    pub fn open_with_schema(
        db_path: impl AsRef<Path>,
        schema_dir: &str,
    ) -> Result<Self, StorageError> {
        let store = Self::open(db_path)?;
        {
            let mut conn = store.conn.lock().unwrap_or_else(PoisonError::into_inner);
            run_schema_migrations(&mut conn, schema_dir)?;
        }
        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("storage task failed: {}", e)))?
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", us)))
}

fn to_u64(value: i64, what: &str) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Corrupt(format!("negative {}: {}", what, value)))
}

struct EventRow {
    partition: i64,
    seq: i64,
    event_id: String,
    campaign_id: String,
    event_type: String,
    event_ts_us: i64,
    committed_at_us: i64,
    metadata: String,
}

impl EventRow {
    const COLUMNS: &'static str = "partition, seq, event_id, campaign_id, event_type, \
                                   event_ts_us, committed_at_us, metadata";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            partition: row.get(0)?,
            seq: row.get(1)?,
            event_id: row.get(2)?,
            campaign_id: row.get(3)?,
            event_type: row.get(4)?,
            event_ts_us: row.get(5)?,
            committed_at_us: row.get(6)?,
            metadata: row.get(7)?,
        })
    }

    fn into_persisted(self) -> Result<PersistedEvent, StorageError> {
        let event_type = EventType::parse(&self.event_type)
            .ok_or_else(|| StorageError::Corrupt(format!("event_type '{}'", self.event_type)))?;

        Ok(PersistedEvent {
            partition: u32::try_from(self.partition)
                .map_err(|_| StorageError::Corrupt(format!("partition {}", self.partition)))?,
            sequence: to_u64(self.seq, "seq")?,
            committed_at: from_micros(self.committed_at_us)?,
            event: Event {
                event_id: self.event_id,
                campaign_id: self.campaign_id,
                event_type,
                timestamp: from_micros(self.event_ts_us)?,
                metadata: serde_json::from_str(&self.metadata)?,
            },
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append_batch(
        &self,
        partition: u32,
        events: Vec<Event>,
    ) -> Result<Vec<Appended>, StorageError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let committed_at = Utc::now();

            let mut next_seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE partition = ?1",
                params![partition],
                |row| row.get(0),
            )?;

            let mut persisted = Vec::with_capacity(events.len());
            let mut inserted = 0usize;

            for event in events {
                let existing = tx
                    .query_row(
                        &format!("SELECT {} FROM events WHERE event_id = ?1", EventRow::COLUMNS),
                        params![event.event_id],
                        EventRow::from_row,
                    )
                    .optional()?;

                if let Some(row) = existing {
                    persisted.push(Appended::AlreadyStored(row.into_persisted()?));
                    continue;
                }

                next_seq += 1;
                tx.execute(
                    "INSERT INTO events
                     (partition, seq, event_id, campaign_id, event_type,
                      event_ts_us, committed_at_us, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        partition,
                        next_seq,
                        event.event_id,
                        event.campaign_id,
                        event.event_type.as_str(),
                        to_micros(event.timestamp),
                        to_micros(committed_at),
                        serde_json::to_string(&event.metadata)?,
                    ],
                )?;
                inserted += 1;

                persisted.push(Appended::Inserted(PersistedEvent {
                    partition,
                    sequence: next_seq as u64,
                    committed_at,
                    event,
                }));
            }

            tx.commit()?;

            log::debug!(
                "✅ Committed {} events to partition {} (head seq={})",
                inserted,
                partition,
                next_seq
            );

            Ok(persisted)
        })
        .await
    }

    async fn read_after(
        &self,
        partition: u32,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM events
                 WHERE partition = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3",
                EventRow::COLUMNS
            ))?;

            let rows = stmt.query_map(
                params![partition, after_seq as i64, limit as i64],
                EventRow::from_row,
            )?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row?.into_persisted()?);
            }
            Ok(events)
        })
        .await
    }

    async fn head_sequence(&self, partition: u32) -> Result<u64, StorageError> {
        self.with_conn(move |conn| {
            let head: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE partition = ?1",
                params![partition],
                |row| row.get(0),
            )?;
            to_u64(head, "seq")
        })
        .await
    }

    async fn event_id_at(&self, partition: u32, seq: u64) -> Result<Option<String>, StorageError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT event_id FROM events WHERE partition = ?1 AND seq = ?2",
                    params![partition, seq as i64],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn load_checkpoint(&self, partition: u32) -> Result<Checkpoint, StorageError> {
        self.with_conn(move |conn| {
            let row: Option<(i64, Option<String>)> = conn
                .query_row(
                    "SELECT last_seq, last_event_id FROM aggregation_checkpoints WHERE partition = ?1",
                    params![partition],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                None => Ok(Checkpoint::genesis(partition)),
                Some((last_seq, last_event_id)) => Ok(Checkpoint {
                    partition,
                    last_seq: to_u64(last_seq, "checkpoint")?,
                    last_event_id,
                }),
            }
        })
        .await
    }

    async fn apply_aggregation(
        &self,
        commit: AggregationCommit,
    ) -> Result<FenceOutcome, StorageError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().timestamp();

            let current: i64 = tx
                .query_row(
                    "SELECT last_seq FROM aggregation_checkpoints WHERE partition = ?1",
                    params![commit.partition],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let current = to_u64(current, "checkpoint")?;

            if current != commit.expected_seq {
                return Ok(FenceOutcome::Stale { current_seq: current });
            }

            for delta in &commit.deltas {
                tx.execute(
                    "INSERT INTO aggregate_buckets
                     (partition, campaign_id, bucket_start, impression_count, click_count, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(partition, campaign_id, bucket_start) DO UPDATE SET
                        impression_count = impression_count + excluded.impression_count,
                        click_count = click_count + excluded.click_count,
                        updated_at = excluded.updated_at",
                    params![
                        commit.partition,
                        delta.campaign_id,
                        delta.time_bucket.to_column(),
                        delta.impression_count as i64,
                        delta.click_count as i64,
                        now,
                    ],
                )?;
            }

            tx.execute(
                "INSERT INTO aggregation_checkpoints (partition, last_seq, last_event_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(partition) DO UPDATE SET
                    last_seq = excluded.last_seq,
                    last_event_id = excluded.last_event_id,
                    updated_at = excluded.updated_at",
                params![
                    commit.partition,
                    commit.checkpoint.last_seq as i64,
                    commit.checkpoint.last_event_id,
                    now,
                ],
            )?;

            tx.commit()?;
            Ok(FenceOutcome::Applied)
        })
        .await
    }

    async fn load_buckets(&self, partition: u32) -> Result<Vec<AggregateBucket>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT campaign_id, bucket_start, impression_count, click_count
                 FROM aggregate_buckets WHERE partition = ?1",
            )?;

            let rows = stmt.query_map(params![partition], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut buckets = Vec::new();
            for row in rows {
                let (campaign_id, bucket_start, impressions, clicks) = row?;
                buckets.push(AggregateBucket {
                    campaign_id,
                    time_bucket: BucketKey::from_column(bucket_start),
                    impression_count: to_u64(impressions, "impression_count")?,
                    click_count: to_u64(clicks, "click_count")?,
                });
            }
            Ok(buckets)
        })
        .await
    }

    async fn reset_partition(&self, partition: u32) -> Result<(), StorageError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM aggregate_buckets WHERE partition = ?1",
                params![partition],
            )?;
            tx.execute(
                "DELETE FROM aggregation_checkpoints WHERE partition = ?1",
                params![partition],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn recent_event_ids(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, committed_at_us FROM events
                 WHERE committed_at_us >= ?1
                 ORDER BY committed_at_us ASC",
            )?;

            let rows = stmt.query_map(params![to_micros(since)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut ids = Vec::new();
            for row in rows {
                let (event_id, committed_at_us) = row?;
                ids.push((event_id, from_micros(committed_at_us)?));
            }
            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::BucketCounts;
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    pub(crate) const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    fn create_test_store() -> (TempDir, SqliteEventStore) {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open_with_schema(dir.path().join("test.db"), SCHEMA_DIR)
            .unwrap();
        (dir, store)
    }

    fn make_event(id: &str, campaign: &str, event_type: EventType) -> Event {
        Event {
            event_id: id.to_string(),
            campaign_id: campaign.to_string(),
            event_type,
            timestamp: Utc::now(),
            metadata: BTreeMap::from([("source".to_string(), "test".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_sequences_are_contiguous_across_batches() {
        let (_dir, store) = create_test_store();

        let first = store
            .append_batch(0, (0..3).map(|i| make_event(&format!("a{}", i), "C1", EventType::Impression)).collect())
            .await
            .unwrap();
        let second = store
            .append_batch(0, (0..2).map(|i| make_event(&format!("b{}", i), "C1", EventType::Click)).collect())
            .await
            .unwrap();

        assert!(first.iter().chain(second.iter()).all(Appended::is_inserted));
        let seqs: Vec<u64> = first
            .iter()
            .chain(second.iter())
            .map(|e| e.persisted().sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.head_sequence(0).await.unwrap(), 5);

        // Partitions have independent sequence spaces
        let other = store
            .append_batch(1, vec![make_event("c0", "C2", EventType::Click)])
            .await
            .unwrap();
        assert_eq!(other[0].persisted().sequence, 1);
    }

    #[tokio::test]
    async fn test_retried_batch_is_not_persisted_twice() {
        let (_dir, store) = create_test_store();
        let batch: Vec<Event> = (0..3)
            .map(|i| make_event(&format!("r{}", i), "C1", EventType::Impression))
            .collect();

        let first = store.append_batch(0, batch.clone()).await.unwrap();
        let retry = store.append_batch(0, batch).await.unwrap();

        assert!(retry.iter().all(|e| !e.is_inserted()));
        assert_eq!(
            first.iter().map(|e| e.persisted().sequence).collect::<Vec<_>>(),
            retry.iter().map(|e| e.persisted().sequence).collect::<Vec<_>>()
        );
        assert_eq!(store.head_sequence(0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_known_id_keeps_its_original_partition() {
        let (_dir, store) = create_test_store();
        store
            .append_batch(1, vec![make_event("moved", "C1", EventType::Click)])
            .await
            .unwrap();

        let appended = store
            .append_batch(
                0,
                vec![
                    make_event("moved", "K0", EventType::Click),
                    make_event("fresh", "K0", EventType::Click),
                ],
            )
            .await
            .unwrap();

        match &appended[0] {
            Appended::AlreadyStored(row) => {
                assert_eq!(row.partition, 1);
                assert_eq!(row.sequence, 1);
                assert_eq!(row.event.campaign_id, "C1");
            }
            other => panic!("expected stored row, got {:?}", other),
        }
        // Skipped ids do not consume a sequence in the target partition
        assert!(appended[1].is_inserted());
        assert_eq!(appended[1].persisted().sequence, 1);
        assert_eq!(store.head_sequence(0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_after_round_trips_metadata() {
        let (_dir, store) = create_test_store();
        store
            .append_batch(0, (0..5).map(|i| make_event(&format!("e{}", i), "C1", EventType::Click)).collect())
            .await
            .unwrap();

        let events = store.read_after(0, 2, 10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sequence, 3);
        assert_eq!(events[0].event.event_id, "e2");
        assert_eq!(events[0].event.metadata.get("source").map(String::as_str), Some("test"));

        let limited = store.read_after(0, 0, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_aggregation_commit_is_fenced() {
        let (_dir, store) = create_test_store();
        let mut counts = BucketCounts::default();
        counts.record(EventType::Impression);
        counts.record(EventType::Impression);

        let commit = AggregationCommit {
            partition: 0,
            expected_seq: 0,
            checkpoint: Checkpoint {
                partition: 0,
                last_seq: 2,
                last_event_id: Some("x".to_string()),
            },
            deltas: vec![AggregateBucket::new("C1".to_string(), BucketKey::At(60), counts)],
        };

        assert_eq!(store.apply_aggregation(commit.clone()).await.unwrap(), FenceOutcome::Applied);
        // Replaying the same range is rejected and changes nothing
        assert_eq!(
            store.apply_aggregation(commit).await.unwrap(),
            FenceOutcome::Stale { current_seq: 2 }
        );

        let buckets = store.load_buckets(0).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].impression_count, 2);

        let checkpoint = store.load_checkpoint(0).await.unwrap();
        assert_eq!(checkpoint.last_seq, 2);
        assert_eq!(checkpoint.last_event_id.as_deref(), Some("x"));

        store.reset_partition(0).await.unwrap();
        assert!(store.load_buckets(0).await.unwrap().is_empty());
        assert_eq!(store.load_checkpoint(0).await.unwrap(), Checkpoint::genesis(0));
    }

    #[tokio::test]
    async fn test_recent_event_ids() {
        let (_dir, store) = create_test_store();
        let before = Utc::now() - chrono::Duration::seconds(1);
        store
            .append_batch(0, vec![make_event("recent-1", "C1", EventType::Click)])
            .await
            .unwrap();

        let ids = store.recent_event_ids(before).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].0, "recent-1");

        let none = store
            .recent_event_ids(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("migrate.db")).unwrap();

        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('events', 'aggregate_buckets', 'aggregation_checkpoints')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_seed_scripts_apply() {
        let dir = tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("seed.db")).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();
        run_seed_scripts(&mut conn, &format!("{}/seed", SCHEMA_DIR)).unwrap();
        run_seed_scripts(&mut conn, &format!("{}/seed", SCHEMA_DIR)).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events WHERE partition = 0", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_missing_schema_dir() {
        let dir = tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("missing.db")).unwrap();
        let err = run_schema_migrations(&mut conn, "/definitely/not/here").unwrap_err();
        assert!(matches!(err, StorageError::SchemaMissing(_)));
    }
}
