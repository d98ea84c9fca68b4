//! Aggregation engine - folds the durable log into per-campaign buckets
//!
//! One engine task per partition is the only writer of that partition's
//! buckets. Each step:
//! 1. read up to `batch_limit` events after the checkpoint
//! 2. fold them into bucket deltas
//! 3. commit deltas + new checkpoint in one transaction, fenced on the
//!    previous checkpoint
//! 4. publish an immutable snapshot for readers
//!
//! Replaying a range after a crash is a no-op: the fence rejects it.

use super::store::{AggregationCommit, EventStore, FenceOutcome, StorageError};
use super::types::{AggregateBucket, BucketCounts, BucketKey, Checkpoint, PersistedEvent};
use crate::observability;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Bucket width in seconds
    pub bucket_secs: i64,
    /// Events committed later than this after their timestamp go to the late bucket
    pub lateness: chrono::Duration,
    pub poll_interval: Duration,
    pub batch_limit: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 60,
            lateness: chrono::Duration::minutes(10),
            poll_interval: Duration::from_millis(200),
            batch_limit: 5000,
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("checkpoint corruption on partition {partition}: {reason}")]
    CheckpointCorruption { partition: u32, reason: String },

    #[error("sequence gap on partition {partition}: expected {expected}, found {found}")]
    SequenceGap {
        partition: u32,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type CampaignBuckets = BTreeMap<BucketKey, BucketCounts>;

/// Committed aggregate state of one partition
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    pub partition: u32,
    pub checkpoint: Checkpoint,
    /// Highest committed sequence when the snapshot was taken
    pub head: u64,
    pub buckets: HashMap<String, CampaignBuckets>,
}

impl PartitionSnapshot {
    pub fn lag(&self) -> u64 {
        self.head.saturating_sub(self.checkpoint.last_seq)
    }

    pub fn campaign(&self, campaign_id: &str) -> Option<&CampaignBuckets> {
        self.buckets.get(campaign_id)
    }
}

pub struct AggregationEngine {
    partition: u32,
    store: Arc<dyn EventStore>,
    config: AggregationConfig,
    checkpoint: Checkpoint,
    head: u64,
    buckets: HashMap<String, CampaignBuckets>,
    verified: bool,
    tx: watch::Sender<Arc<PartitionSnapshot>>,
}

impl AggregationEngine {
    /// Load the persisted checkpoint and buckets so readers see committed
    /// state immediately.
    pub async fn open(
        partition: u32,
        store: Arc<dyn EventStore>,
        config: AggregationConfig,
    ) -> Result<(Self, watch::Receiver<Arc<PartitionSnapshot>>), AggregationError> {
        let checkpoint = store.load_checkpoint(partition).await?;
        let head = store.head_sequence(partition).await?;
        let buckets = index_buckets(store.load_buckets(partition).await?);

        log::info!(
            "📊 Aggregation partition {} opened (checkpoint {}, head {}, {} campaigns)",
            partition,
            checkpoint.last_seq,
            head,
            buckets.len()
        );

        let snapshot = Arc::new(PartitionSnapshot {
            partition,
            checkpoint: checkpoint.clone(),
            head,
            buckets: buckets.clone(),
        });
        let (tx, rx) = watch::channel(snapshot);

        let engine = Self {
            partition,
            store,
            config,
            checkpoint,
            head,
            buckets,
            verified: false,
            tx,
        };
        engine.report_progress();

        Ok((engine, rx))
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PartitionSnapshot>> {
        self.tx.subscribe()
    }

    /// Bucket an event falls into: its truncated timestamp, or `Late` when it
    /// was committed beyond the lateness window
    pub fn bucket_for(config: &AggregationConfig, event: &PersistedEvent) -> BucketKey {
        if event.committed_at - event.event.timestamp > config.lateness {
            BucketKey::Late
        } else {
            BucketKey::truncate(event.event.timestamp, config.bucket_secs)
        }
    }

    /// Sum events into per-(campaign, bucket) deltas
    pub fn fold_events(config: &AggregationConfig, events: &[PersistedEvent]) -> Vec<AggregateBucket> {
        let mut deltas: HashMap<(String, BucketKey), BucketCounts> = HashMap::new();

        for event in events {
            let key = Self::bucket_for(config, event);
            deltas
                .entry((event.event.campaign_id.clone(), key))
                .or_default()
                .record(event.event.event_type);
        }

        deltas
            .into_iter()
            .map(|((campaign_id, key), counts)| AggregateBucket::new(campaign_id, key, counts))
            .collect()
    }

    /// Fold the next range of the log; returns the number of events applied
    pub async fn step(&mut self) -> Result<usize, AggregationError> {
        if !self.verified {
            self.verify_checkpoint().await?;
            self.verified = true;
        }

        let events = self
            .store
            .read_after(self.partition, self.checkpoint.last_seq, self.config.batch_limit.max(1))
            .await?;

        if events.is_empty() {
            let head = self.store.head_sequence(self.partition).await?;
            if head != self.head {
                self.head = head;
                self.publish();
            }
            return Ok(0);
        }

        let mut expected = self.checkpoint.last_seq + 1;
        for event in &events {
            if event.sequence != expected {
                return Err(AggregationError::SequenceGap {
                    partition: self.partition,
                    expected,
                    found: event.sequence,
                });
            }
            expected += 1;
        }

        let deltas = Self::fold_events(&self.config, &events);
        let last = &events[events.len() - 1];
        let next = Checkpoint {
            partition: self.partition,
            last_seq: last.sequence,
            last_event_id: Some(last.event.event_id.clone()),
        };

        let outcome = self
            .store
            .apply_aggregation(AggregationCommit {
                partition: self.partition,
                expected_seq: self.checkpoint.last_seq,
                checkpoint: next.clone(),
                deltas: deltas.clone(),
            })
            .await?;

        match outcome {
            FenceOutcome::Applied => {
                for delta in deltas {
                    self.buckets
                        .entry(delta.campaign_id.clone())
                        .or_default()
                        .entry(delta.time_bucket)
                        .or_default()
                        .merge(delta.counts());
                }
                self.checkpoint = next;
            }
            FenceOutcome::Stale { current_seq } => {
                log::warn!(
                    "⚠️  Aggregation partition {} fence is stale (expected {}, stored {}), reloading",
                    self.partition,
                    self.checkpoint.last_seq,
                    current_seq
                );
                self.reload().await?;
                return Ok(0);
            }
        }

        self.head = self.store.head_sequence(self.partition).await?.max(self.checkpoint.last_seq);
        self.publish();

        log::debug!(
            "📊 Aggregation partition {} folded {} events (checkpoint {}, lag {})",
            self.partition,
            events.len(),
            self.checkpoint.last_seq,
            self.head - self.checkpoint.last_seq
        );

        Ok(events.len())
    }

    /// Step until the checkpoint reaches the current head
    pub async fn catch_up(&mut self) -> Result<usize, AggregationError> {
        let mut total = 0;
        loop {
            let applied = self.step().await?;
            if applied == 0 {
                return Ok(total);
            }
            total += applied;
        }
    }

    /// Check that the checkpoint points at an event that exists and is the
    /// one recorded when the checkpoint was written
    pub async fn verify_checkpoint(&self) -> Result<(), AggregationError> {
        let corruption = |reason: String| AggregationError::CheckpointCorruption {
            partition: self.partition,
            reason,
        };

        if self.checkpoint.last_seq == 0 {
            return match &self.checkpoint.last_event_id {
                None => Ok(()),
                Some(id) => Err(corruption(format!("genesis checkpoint names event '{}'", id))),
            };
        }

        let head = self.store.head_sequence(self.partition).await?;
        if self.checkpoint.last_seq > head {
            return Err(corruption(format!(
                "checkpoint {} is beyond head {}",
                self.checkpoint.last_seq, head
            )));
        }

        let stored = self
            .store
            .event_id_at(self.partition, self.checkpoint.last_seq)
            .await?;
        if stored != self.checkpoint.last_event_id {
            return Err(corruption(format!(
                "event at seq {} is {:?}, checkpoint recorded {:?}",
                self.checkpoint.last_seq, stored, self.checkpoint.last_event_id
            )));
        }

        Ok(())
    }

    /// Rebuild the partition from genesis: clear buckets and checkpoint in
    /// one transaction, then let subsequent steps replay the log
    pub async fn recover(&mut self) -> Result<(), AggregationError> {
        log::warn!(
            "🔄 Rebuilding aggregation partition {} from genesis",
            self.partition
        );

        self.store.reset_partition(self.partition).await?;
        self.checkpoint = Checkpoint::genesis(self.partition);
        self.buckets.clear();
        self.head = self.store.head_sequence(self.partition).await?;
        self.verified = true;
        self.publish();
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), AggregationError> {
        self.checkpoint = self.store.load_checkpoint(self.partition).await?;
        self.buckets = index_buckets(self.store.load_buckets(self.partition).await?);
        self.head = self.store.head_sequence(self.partition).await?;
        self.verified = false;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        let snapshot = Arc::new(PartitionSnapshot {
            partition: self.partition,
            checkpoint: self.checkpoint.clone(),
            head: self.head,
            buckets: self.buckets.clone(),
        });
        self.tx.send_replace(snapshot);
        self.report_progress();
    }

    fn report_progress(&self) {
        observability::set_aggregation_progress(
            self.partition,
            self.checkpoint.last_seq,
            self.head.saturating_sub(self.checkpoint.last_seq),
        );
    }

    /// Background loop until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "🚀 Aggregation engine started (partition {}, bucket {}s, lateness {}s)",
            self.partition,
            self.config.bucket_secs,
            self.config.lateness.num_seconds()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.step().await {
                // Full batch: more is probably waiting
                Ok(applied) => applied < self.config.batch_limit,
                Err(AggregationError::CheckpointCorruption { partition, reason }) => {
                    log::error!(
                        "❌ Checkpoint corruption on partition {}: {}",
                        partition,
                        reason
                    );
                    if let Err(e) = self.recover().await {
                        log::error!("❌ Partition {} recovery failed: {}", partition, e);
                    }
                    true
                }
                Err(e) => {
                    log::warn!("⚠️  Aggregation partition {} step failed: {}", self.partition, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        log::info!(
            "✅ Aggregation engine stopped (partition {}, checkpoint {})",
            self.partition,
            self.checkpoint.last_seq
        );
    }
}

fn index_buckets(rows: Vec<AggregateBucket>) -> HashMap<String, CampaignBuckets> {
    let mut buckets: HashMap<String, CampaignBuckets> = HashMap::new();
    for row in rows {
        let counts = row.counts();
        buckets
            .entry(row.campaign_id)
            .or_default()
            .entry(row.time_bucket)
            .or_default()
            .merge(counts);
    }
    buckets
}
