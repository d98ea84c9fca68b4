//! Write-ahead buffer - bounded queue in front of the durable log
//!
//! One buffer (and one flusher task) per partition. Appends are queued with
//! `try_send` so a full queue is reported immediately as `Overloaded`. The
//! flusher owns the in-flight batch; new appends keep queuing while a commit
//! is running.
//!
//! Flush triggers, whichever comes first:
//! 1. batch reaches `max_batch_events`
//! 2. `max_batch_delay` elapsed since the first event of the batch
//! 3. explicit `flush()` / `close()`

use super::backoff::ExponentialBackoff;
use super::dedup::Deduplicator;
use super::store::{Appended, EventStore};
use super::types::Event;
use crate::observability;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub max_batch_events: usize,
    pub max_batch_delay: Duration,
    /// Queue slots before appends are rejected as overloaded
    pub capacity: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub max_retries: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_batch_events: 500,
            max_batch_delay: Duration::from_millis(50),
            capacity: 10_000,
            retry_initial: Duration::from_millis(25),
            retry_max: Duration::from_millis(1000),
            max_retries: 5,
        }
    }
}

/// Durable acknowledgement: the event id is in the log at
/// (`partition`, `sequence`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Written by this batch
    Committed { partition: u32, sequence: u64 },
    /// An earlier delivery already stored this id; nothing was written
    AlreadyStored { partition: u32, sequence: u64 },
}

impl Ack {
    pub fn partition(&self) -> u32 {
        match *self {
            Ack::Committed { partition, .. } | Ack::AlreadyStored { partition, .. } => partition,
        }
    }

    pub fn sequence(&self) -> u64 {
        match *self {
            Ack::Committed { sequence, .. } | Ack::AlreadyStored { sequence, .. } => sequence,
        }
    }
}

impl From<&Appended> for Ack {
    fn from(appended: &Appended) -> Self {
        let row = appended.persisted();
        match appended {
            Appended::Inserted(_) => Ack::Committed {
                partition: row.partition,
                sequence: row.sequence,
            },
            Appended::AlreadyStored(_) => Ack::AlreadyStored {
                partition: row.partition,
                sequence: row.sequence,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    /// Events written by this batch; ids already in the log are not counted
    pub committed: usize,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl CommitResult {
    fn empty() -> Self {
        Self {
            committed: 0,
            first_seq: None,
            last_seq: None,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("write-ahead buffer is full")]
    Overloaded,

    #[error("storage unavailable after {attempts} attempts: {reason}")]
    StorageUnavailable { attempts: u32, reason: String },

    #[error("write-ahead buffer is closed")]
    Closed,
}

impl BufferError {
    /// Client may resend the same event later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BufferError::Overloaded | BufferError::StorageUnavailable { .. }
        )
    }
}

type AckSender = oneshot::Sender<Result<Ack, BufferError>>;

enum Command {
    Append { event: Event, ack: AckSender },
    Flush { done: oneshot::Sender<CommitResult> },
    Close { done: oneshot::Sender<()> },
}

struct Pending {
    event: Event,
    ack: AckSender,
}

/// Resolves once the event is durably committed (or the batch failed)
pub struct PendingAck {
    rx: oneshot::Receiver<Result<Ack, BufferError>>,
}

impl PendingAck {
    pub async fn wait(self) -> Result<Ack, BufferError> {
        self.rx.await.map_err(|_| BufferError::Closed)?
    }
}

/// Handle to a partition's buffer; cheap to clone
#[derive(Clone)]
pub struct WriteAheadBuffer {
    partition: u32,
    tx: mpsc::Sender<Command>,
    capacity: usize,
}

impl WriteAheadBuffer {
    /// Spawn the flusher task for `partition`.
    ///
    /// When `dedup` is set, reservations are confirmed once their batch is
    /// durable, and released if the batch permanently fails so the client
    /// can re-ingest them.
    pub fn spawn(
        partition: u32,
        store: Arc<dyn EventStore>,
        config: BufferConfig,
        dedup: Option<Arc<Deduplicator>>,
    ) -> (Self, JoinHandle<()>) {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let flusher = Flusher {
            partition,
            store,
            config,
            dedup,
        };
        let handle = tokio::spawn(flusher.run(rx));

        (
            Self {
                partition,
                tx,
                capacity,
            },
            handle,
        )
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Queue an event without waiting; `Overloaded` when the queue is full
    pub fn try_append(&self, event: Event) -> Result<PendingAck, BufferError> {
        let (ack, rx) = oneshot::channel();

        self.tx
            .try_send(Command::Append { event, ack })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => BufferError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => BufferError::Closed,
            })?;

        observability::set_queue_depth(self.partition, self.queue_depth());
        Ok(PendingAck { rx })
    }

    /// Queue and wait for the durable ack
    pub async fn append(&self, event: Event) -> Result<Ack, BufferError> {
        self.try_append(event)?.wait().await
    }

    /// Commit everything queued before this call now
    pub async fn flush(&self) -> Result<CommitResult, BufferError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { done })
            .await
            .map_err(|_| BufferError::Closed)?;
        rx.await.map_err(|_| BufferError::Closed)
    }

    /// Stop accepting appends, commit what is queued, then stop the flusher
    pub async fn close(&self) -> Result<(), BufferError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Close { done })
            .await
            .map_err(|_| BufferError::Closed)?;
        rx.await.map_err(|_| BufferError::Closed)
    }

    pub fn queue_depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

struct Flusher {
    partition: u32,
    store: Arc<dyn EventStore>,
    config: BufferConfig,
    dedup: Option<Arc<Deduplicator>>,
}

impl Flusher {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        log::info!(
            "🚀 Write-ahead buffer started (partition {}, batch {} events / {}ms, capacity {})",
            self.partition,
            self.config.max_batch_events,
            self.config.max_batch_delay.as_millis(),
            self.config.capacity
        );

        let max_batch = self.config.max_batch_events.max(1);
        let mut batch: Vec<Pending> = Vec::with_capacity(max_batch);
        let mut deadline: Option<Instant> = None;
        let mut closers: Vec<oneshot::Sender<()>> = Vec::new();

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Append { event, ack }) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + self.config.max_batch_delay);
                        }
                        batch.push(Pending { event, ack });

                        if batch.len() >= max_batch {
                            self.commit_batch(std::mem::take(&mut batch)).await;
                            deadline = None;
                        }
                    }
                    Some(Command::Flush { done }) => {
                        let result = self.commit_batch(std::mem::take(&mut batch)).await;
                        deadline = None;
                        let _ = done.send(result);
                    }
                    Some(Command::Close { done }) => {
                        // Refuse new appends; queued commands are still delivered
                        rx.close();
                        closers.push(done);
                    }
                    None => {
                        if !batch.is_empty() {
                            log::info!("🔄 Final flush of {} events (partition {})", batch.len(), self.partition);
                            self.commit_batch(std::mem::take(&mut batch)).await;
                        }
                        break;
                    }
                },

                _ = timer => {
                    self.commit_batch(std::mem::take(&mut batch)).await;
                    deadline = None;
                }
            }
        }

        for done in closers {
            let _ = done.send(());
        }

        log::info!("✅ Write-ahead buffer stopped (partition {})", self.partition);
    }

    /// Commit `batch` as one transaction, retrying the whole batch with
    /// backoff. Acks are resolved only after the outcome is final.
    async fn commit_batch(&self, batch: Vec<Pending>) -> CommitResult {
        if batch.is_empty() {
            return CommitResult::empty();
        }

        let started = std::time::Instant::now();
        let events: Vec<Event> = batch.iter().map(|p| p.event.clone()).collect();
        let mut backoff = ExponentialBackoff::new(
            self.config.retry_initial,
            self.config.retry_max,
            self.config.max_retries,
        );
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match self.store.append_batch(self.partition, events.clone()).await {
                Ok(appended) => {
                    let elapsed = started.elapsed();
                    let inserted = || {
                        appended
                            .iter()
                            .filter(|a| a.is_inserted())
                            .map(|a| a.persisted().sequence)
                    };
                    let first_seq = inserted().min();
                    let last_seq = inserted().max();
                    let committed = inserted().count();
                    let already_stored = appended.len() - committed;

                    for (pending, row) in batch.into_iter().zip(&appended) {
                        if let Some(dedup) = &self.dedup {
                            dedup.confirm(&pending.event.event_id);
                        }
                        let _ = pending.ack.send(Ok(Ack::from(row)));
                    }

                    observability::record_flush(self.partition, committed, elapsed);
                    log::debug!(
                        "📦 Partition {} committed {} events (seq {:?}..={:?}, {} already stored, attempts {}, {}ms)",
                        self.partition,
                        committed,
                        first_seq,
                        last_seq,
                        already_stored,
                        attempts,
                        elapsed.as_millis()
                    );

                    return CommitResult {
                        committed,
                        first_seq,
                        last_seq,
                        attempts,
                        elapsed,
                    };
                }
                Err(e) => {
                    observability::record_commit_failure(self.partition);
                    log::warn!(
                        "⚠️  Partition {} batch commit failed (attempt {}): {}",
                        self.partition,
                        attempts,
                        e
                    );

                    if backoff.sleep().await.is_err() {
                        log::error!(
                            "❌ Partition {} dropping batch of {} events after {} attempts: {}",
                            self.partition,
                            batch.len(),
                            attempts,
                            e
                        );

                        let reason = e.to_string();
                        for pending in batch {
                            if let Some(dedup) = &self.dedup {
                                dedup.release(&pending.event.event_id);
                            }
                            let _ = pending.ack.send(Err(BufferError::StorageUnavailable {
                                attempts,
                                reason: reason.clone(),
                            }));
                        }

                        return CommitResult {
                            committed: 0,
                            first_seq: None,
                            last_seq: None,
                            attempts,
                            elapsed: started.elapsed(),
                        };
                    }
                }
            }
        }
    }
}
