//! Component wiring and lifecycle
//!
//! Startup order:
//! 1. warm the deduplicator from recently committed events
//! 2. spawn one write-ahead buffer per partition
//! 3. open and spawn one aggregation engine per partition
//! 4. spawn the dedup sweeper
//!
//! Shutdown closes the buffers first (queued events are committed), then
//! stops the engines and the sweeper.

use crate::config::Config;
use crate::observability;
use crate::pipeline::{
    AggregationEngine, AggregationError, Deduplicator, EventStore, IngestionService,
    QueryService, StorageError, WriteAheadBuffer,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

pub struct Runtime {
    config: Config,
    dedup: Arc<Deduplicator>,
    buffers: Vec<WriteAheadBuffer>,
    ingestion: Arc<IngestionService>,
    query: QueryService,
    shutdown_tx: watch::Sender<bool>,
    flushers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub async fn start(config: Config, store: Arc<dyn EventStore>) -> Result<Self, StartupError> {
        log::info!("🚀 Starting adtrack runtime");
        log::info!("   ├─ Partitions: {}", config.partitions);
        log::info!(
            "   ├─ Batch: {} events / {}ms, queue {} per partition",
            config.batch_max_events,
            config.batch_max_delay_ms,
            config.buffer_capacity
        );
        log::info!(
            "   ├─ Dedup window: {}s in {} slots",
            config.dedup_retention_secs,
            config.dedup_slots
        );
        log::info!(
            "   └─ Buckets: {}s, lateness {}s",
            config.bucket_secs,
            config.lateness_secs
        );

        let dedup = Arc::new(Deduplicator::new(config.dedup_config()));
        let now = Utc::now();
        let since = now - chrono::Duration::seconds(config.dedup_retention_secs as i64);
        let recent = store.recent_event_ids(since).await?;
        let warmed = dedup.warm(recent, now);
        observability::set_dedup_records(dedup.len());
        log::info!("✅ Deduplicator warmed with {} recent event ids", warmed);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut buffers = Vec::with_capacity(config.partitions as usize);
        let mut flushers = Vec::with_capacity(config.partitions as usize);
        for partition in 0..config.partitions {
            let (buffer, handle) = WriteAheadBuffer::spawn(
                partition,
                store.clone(),
                config.buffer_config(),
                Some(dedup.clone()),
            );
            buffers.push(buffer);
            flushers.push(handle);
        }

        let mut receivers = Vec::with_capacity(config.partitions as usize);
        let mut background = Vec::with_capacity(config.partitions as usize + 1);
        for partition in 0..config.partitions {
            let (engine, rx) =
                AggregationEngine::open(partition, store.clone(), config.aggregation_config())
                    .await?;
            receivers.push(rx);
            background.push(tokio::spawn(engine.run(shutdown_rx.clone())));
        }

        background.push(tokio::spawn(run_dedup_sweeper(
            dedup.clone(),
            shutdown_rx,
        )));

        let ingestion = Arc::new(IngestionService::new(
            config.validation_policy(),
            dedup.clone(),
            buffers.clone(),
            config.ack_timeout(),
        ));
        let query = QueryService::new(receivers);

        log::info!("✅ Runtime started");

        Ok(Self {
            config,
            dedup,
            buffers,
            ingestion,
            query,
            shutdown_tx,
            flushers,
            background,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ingestion(&self) -> Arc<IngestionService> {
        self.ingestion.clone()
    }

    pub fn query(&self) -> QueryService {
        self.query.clone()
    }

    pub fn dedup(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    /// Commit whatever every buffer has queued
    pub async fn flush_all(&self) {
        for buffer in &self.buffers {
            if let Err(e) = buffer.flush().await {
                log::warn!("⚠️  Flush of partition {} failed: {}", buffer.partition(), e);
            }
        }
    }

    pub async fn shutdown(self) {
        log::info!("🛑 Shutting down runtime...");

        for buffer in &self.buffers {
            if let Err(e) = buffer.close().await {
                log::warn!("⚠️  Closing partition {} buffer: {}", buffer.partition(), e);
            }
        }
        for handle in self.flushers {
            if let Err(e) = handle.await {
                log::error!("❌ Flusher task failed: {}", e);
            }
        }

        let _ = self.shutdown_tx.send(true);
        for handle in self.background {
            if let Err(e) = handle.await {
                log::error!("❌ Background task failed: {}", e);
            }
        }

        log::info!("✅ Runtime stopped");
    }
}

/// Evict expired dedup slots once per slot width
async fn run_dedup_sweeper(dedup: Arc<Deduplicator>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(dedup.slot_width());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = dedup.sweep(Utc::now());
                let live = dedup.len();
                observability::set_dedup_records(live);
                if evicted > 0 {
                    log::debug!("🧹 Dedup sweep evicted {} records ({} live)", evicted, live);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
