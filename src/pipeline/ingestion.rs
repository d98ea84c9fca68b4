//! Ingestion - validate, deduplicate and buffer a request's events
//!
//! Validation and duplicate outcomes never abort the request; each event gets
//! its own status. Admitted events are routed to their partition's buffer and
//! reported only once their commit is durable. A repeat of an event whose
//! first delivery is still in flight is reported as duplicate only after
//! that delivery commits.

use super::buffer::{Ack, BufferError, PendingAck, WriteAheadBuffer};
use super::dedup::{Admission, Deduplicator, InFlight};
use super::types::partition_for;
use super::validator::{validate, RawEvent, ValidationPolicy};
use crate::observability;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventStatus {
    Admitted { partition: u32, sequence: u64 },
    Duplicate,
    Rejected { error: String, message: String },
    /// Retryable: not confirmed durable, resend later
    Overloaded { reason: String },
}

impl EventStatus {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStatus::Overloaded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventOutcome {
    /// Position in the request
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(flatten)]
    pub status: EventStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every event admitted or duplicate
    Accepted,
    /// Some events rejected, nothing retryable
    Partial,
    /// At least one event should be resent
    Retry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub admitted: usize,
    pub duplicate: usize,
    pub rejected: usize,
    pub overloaded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub counts: BatchCounts,
    pub events: Vec<EventOutcome>,
}

impl BatchOutcome {
    pub fn from_events(events: Vec<EventOutcome>) -> Self {
        let mut counts = BatchCounts::default();
        for outcome in &events {
            match outcome.status {
                EventStatus::Admitted { .. } => counts.admitted += 1,
                EventStatus::Duplicate => counts.duplicate += 1,
                EventStatus::Rejected { .. } => counts.rejected += 1,
                EventStatus::Overloaded { .. } => counts.overloaded += 1,
            }
        }

        let status = if counts.overloaded > 0 {
            BatchStatus::Retry
        } else if counts.rejected > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Accepted
        };

        Self {
            status,
            counts,
            events,
        }
    }
}

enum Waiting {
    /// Our own commit
    Commit(PendingAck),
    /// Another delivery of the same id
    FirstDelivery(InFlight),
}

pub struct IngestionService {
    policy: ValidationPolicy,
    dedup: Arc<Deduplicator>,
    buffers: Vec<WriteAheadBuffer>,
    ack_timeout: Duration,
}

impl IngestionService {
    /// `buffers[p]` must be the buffer of partition `p`, spawned with the
    /// same deduplicator so commits confirm their reservations
    pub fn new(
        policy: ValidationPolicy,
        dedup: Arc<Deduplicator>,
        buffers: Vec<WriteAheadBuffer>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            dedup,
            buffers,
            ack_timeout,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.buffers.len() as u32
    }

    pub fn dedup(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    pub async fn ingest(&self, raw_events: Vec<RawEvent>) -> BatchOutcome {
        let now = Utc::now();
        observability::record_received(raw_events.len());

        let mut statuses: Vec<Option<EventStatus>> = vec![None; raw_events.len()];
        let mut event_ids: Vec<Option<String>> = Vec::with_capacity(raw_events.len());
        let mut waiting = Vec::new();

        for (index, raw) in raw_events.iter().enumerate() {
            let event = match validate(raw, &self.policy, now) {
                Ok(event) => event,
                Err(e) => {
                    observability::record_validation_error(e.kind());
                    log::debug!("⚠️  Rejected event #{}: {}", index, e);
                    event_ids.push(raw.event_id_hint());
                    statuses[index] = Some(EventStatus::Rejected {
                        error: e.kind().to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            event_ids.push(Some(event.event_id.clone()));

            match self.dedup.admit(&event.event_id, now) {
                Admission::Admitted => {}
                Admission::Duplicate => {
                    observability::record_duplicate();
                    statuses[index] = Some(EventStatus::Duplicate);
                    continue;
                }
                Admission::InFlight(first) => {
                    waiting.push((index, event.event_id, Waiting::FirstDelivery(first)));
                    continue;
                }
            }

            if self.buffers.is_empty() {
                self.dedup.release(&event.event_id);
                statuses[index] = Some(overloaded(&BufferError::Closed));
                continue;
            }

            let partition = partition_for(&event.campaign_id, self.partitions());
            let event_id = event.event_id.clone();

            match self.buffers[partition as usize].try_append(event) {
                Ok(pending) => waiting.push((index, event_id, Waiting::Commit(pending))),
                Err(e) => {
                    self.dedup.release(&event_id);
                    statuses[index] = Some(overloaded(&e));
                }
            }
        }

        // Every ack is already in flight; they share one deadline
        let deadline = Instant::now() + self.ack_timeout;
        for (index, event_id, waiting) in waiting {
            let status = match waiting {
                Waiting::Commit(pending) => self.await_commit(deadline, &event_id, pending).await,
                Waiting::FirstDelivery(first) => match timeout_at(deadline, first.committed()).await {
                    Ok(true) => {
                        observability::record_duplicate();
                        EventStatus::Duplicate
                    }
                    Ok(false) => {
                        observability::record_overloaded();
                        EventStatus::Overloaded {
                            reason: "an earlier delivery of this event was not stored".to_string(),
                        }
                    }
                    Err(_) => self.ack_timed_out(&event_id),
                },
            };
            statuses[index] = Some(status);
        }

        let events = statuses
            .into_iter()
            .zip(event_ids)
            .enumerate()
            .map(|(index, (status, event_id))| EventOutcome {
                index,
                event_id,
                status: status.unwrap_or_else(|| overloaded(&BufferError::Closed)),
            })
            .collect();

        let outcome = BatchOutcome::from_events(events);
        log::debug!(
            "📥 Ingested {} events: {:?} ({} admitted, {} duplicate, {} rejected, {} overloaded)",
            raw_events.len(),
            outcome.status,
            outcome.counts.admitted,
            outcome.counts.duplicate,
            outcome.counts.rejected,
            outcome.counts.overloaded
        );
        outcome
    }

    async fn await_commit(&self, deadline: Instant, event_id: &str, pending: PendingAck) -> EventStatus {
        match timeout_at(deadline, pending.wait()).await {
            Ok(Ok(Ack::Committed { partition, sequence })) => {
                EventStatus::Admitted { partition, sequence }
            }
            Ok(Ok(Ack::AlreadyStored { partition, sequence })) => {
                log::debug!(
                    "🔁 Event {} already stored at partition {} seq {}",
                    event_id,
                    partition,
                    sequence
                );
                observability::record_duplicate();
                EventStatus::Duplicate
            }
            Ok(Err(e)) => {
                // StorageUnavailable reservations were released by the buffer
                if e == BufferError::Closed {
                    self.dedup.release(event_id);
                }
                overloaded(&e)
            }
            Err(_) => self.ack_timed_out(event_id),
        }
    }

    /// The batch may still commit; the reservation stays pending so a resend
    /// waits for it instead of being acknowledged early
    fn ack_timed_out(&self, event_id: &str) -> EventStatus {
        log::warn!("⏳ Ack timeout for event {}", event_id);
        observability::record_overloaded();
        EventStatus::Overloaded {
            reason: format!("commit not acknowledged within {}ms", self.ack_timeout.as_millis()),
        }
    }
}

fn overloaded(err: &BufferError) -> EventStatus {
    observability::record_overloaded();
    EventStatus::Overloaded {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::buffer::BufferConfig;
    use crate::pipeline::dedup::DedupConfig;
    use crate::pipeline::store::{EventStore, SqliteEventStore};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    fn setup(partitions: u32) -> (TempDir, Arc<SqliteEventStore>, IngestionService) {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            SqliteEventStore::open_with_schema(dir.path().join("ingest.db"), SCHEMA_DIR).unwrap(),
        );
        let dedup = Arc::new(Deduplicator::new(DedupConfig::default()));
        let config = BufferConfig {
            max_batch_delay: Duration::from_millis(2),
            ..BufferConfig::default()
        };
        let buffers = (0..partitions)
            .map(|p| {
                WriteAheadBuffer::spawn(p, store.clone(), config.clone(), Some(dedup.clone())).0
            })
            .collect();
        let service = IngestionService::new(
            ValidationPolicy::default(),
            dedup,
            buffers,
            Duration::from_secs(5),
        );
        (dir, store, service)
    }

    fn raw(id: &str, campaign: &str, event_type: &str) -> RawEvent {
        RawEvent(json!({
            "event_id": id,
            "campaign_id": campaign,
            "event_type": event_type,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    #[tokio::test]
    async fn test_mixed_request_reports_each_event() {
        let (_dir, store, service) = setup(2);

        let outcome = service
            .ingest(vec![
                raw("e1", "C1", "impression"),
                RawEvent(json!({ "event_id": "bad", "campaign_id": "C1" })),
                raw("e1", "C1", "impression"),
                raw("e2", "C1", "click"),
            ])
            .await;

        assert_eq!(outcome.status, BatchStatus::Partial);
        assert_eq!(
            outcome.counts,
            BatchCounts { admitted: 2, duplicate: 1, rejected: 1, overloaded: 0 }
        );

        let partition = partition_for("C1", 2);
        assert_eq!(
            outcome.events[0].status,
            EventStatus::Admitted { partition, sequence: 1 }
        );
        assert_eq!(outcome.events[1].event_id.as_deref(), Some("bad"));
        assert!(matches!(
            &outcome.events[1].status,
            EventStatus::Rejected { error, .. } if error == "missing_field"
        ));
        assert_eq!(outcome.events[2].status, EventStatus::Duplicate);
        assert_eq!(
            outcome.events[3].status,
            EventStatus::Admitted { partition, sequence: 2 }
        );

        assert_eq!(store.head_sequence(partition).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resend_is_duplicate() {
        let (_dir, store, service) = setup(1);

        let first = service.ingest(vec![raw("once", "C1", "click")]).await;
        assert_eq!(first.status, BatchStatus::Accepted);

        let second = service.ingest(vec![raw("once", "C1", "click")]).await;
        assert_eq!(second.status, BatchStatus::Accepted);
        assert_eq!(second.events[0].status, EventStatus::Duplicate);
        assert_eq!(store.head_sequence(0).await.unwrap(), 1);
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = BatchOutcome::from_events(vec![
            EventOutcome {
                index: 0,
                event_id: Some("a".into()),
                status: EventStatus::Admitted { partition: 1, sequence: 7 },
            },
            EventOutcome {
                index: 1,
                event_id: None,
                status: EventStatus::Overloaded { reason: "full".into() },
            },
        ]);
        assert_eq!(outcome.status, BatchStatus::Retry);

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "retry");
        assert_eq!(value["events"][0]["status"], "admitted");
        assert_eq!(value["events"][0]["sequence"], 7);
        assert_eq!(value["events"][1]["status"], "overloaded");
        assert!(value["events"][1].get("event_id").is_none());
    }
}
