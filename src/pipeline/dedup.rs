//! Bounded-window event deduplication
//!
//! Seen event ids live in a sharded map. Each shard also keeps a ring of
//! time slots (oldest at front) recording which ids were first seen in
//! which slot, so expiry pops whole slots instead of scanning the map.
//!
//! Check-and-insert happens under the shard mutex, so for any event id
//! exactly one concurrent `admit` wins. The winner's record stays pending
//! until its batch is durable (`confirm`) or dropped (`release`); a later
//! delivery of a pending id gets an `InFlight` handle that resolves with
//! the first delivery's outcome.

use chrono::{DateTime, Utc};
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
pub enum Admission {
    /// First delivery; the caller owns the reservation
    Admitted,
    /// Already durably committed within the window
    Duplicate,
    /// First delivery is still being committed
    InFlight(InFlight),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Pending,
    Committed,
    Released,
}

/// Outcome of another delivery of the same event id
#[derive(Debug)]
pub struct InFlight {
    rx: watch::Receiver<Resolution>,
}

impl InFlight {
    /// Wait for the first delivery's batch; `true` once it is durable,
    /// `false` if it was dropped (the id is free to be ingested again)
    pub async fn committed(mut self) -> bool {
        let resolution = match self.rx.wait_for(|r| *r != Resolution::Pending).await {
            Ok(resolved) => *resolved,
            Err(_) => Resolution::Released,
        };
        resolution == Resolution::Committed
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long an event id suppresses later deliveries
    pub retention: Duration,
    /// Number of slots the retention window is divided into
    pub slots: usize,
    /// Number of independently locked shards
    pub shards: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            slots: 60,
            shards: 16,
        }
    }
}

struct Slot {
    start_ms: i64,
    ids: Vec<String>,
}

struct Record {
    /// Unix ms
    first_seen: i64,
    /// Set while the first delivery is not yet durable
    pending: Option<watch::Sender<Resolution>>,
}

impl Record {
    fn resolve(&mut self, resolution: Resolution) {
        if let Some(tx) = self.pending.take() {
            tx.send_replace(resolution);
        }
    }
}

#[derive(Default)]
struct Shard {
    seen: HashMap<String, Record>,
    ring: VecDeque<Slot>,
}

impl Shard {
    /// Pop every slot that ended before `cutoff_ms`
    fn evict(&mut self, cutoff_ms: i64, slot_ms: i64) -> usize {
        let mut evicted = 0;

        while let Some(front) = self.ring.front() {
            let slot_end = front.start_ms + slot_ms;
            if slot_end > cutoff_ms {
                break;
            }

            if let Some(slot) = self.ring.pop_front() {
                for id in slot.ids {
                    // Only drop the record if it still belongs to this slot;
                    // a released-then-readmitted id lives in a newer slot.
                    let owned = self
                        .seen
                        .get(&id)
                        .map_or(false, |record| record.first_seen < slot_end);
                    if owned {
                        if let Some(mut record) = self.seen.remove(&id) {
                            record.resolve(Resolution::Released);
                        }
                        evicted += 1;
                    }
                }
            }
        }

        evicted
    }

    fn insert(&mut self, event_id: &str, now_ms: i64, slot_ms: i64, pending: bool) {
        let record = Record {
            first_seen: now_ms,
            pending: pending.then(|| watch::channel(Resolution::Pending).0),
        };
        self.seen.insert(event_id.to_string(), record);

        let slot_start = now_ms - now_ms.rem_euclid(slot_ms);
        match self.ring.back_mut() {
            // Clock went backwards: file under the newest slot
            Some(back) if back.start_ms >= slot_start => back.ids.push(event_id.to_string()),
            _ => self.ring.push_back(Slot {
                start_ms: slot_start,
                ids: vec![event_id.to_string()],
            }),
        }
    }
}

pub struct Deduplicator {
    shards: Vec<Mutex<Shard>>,
    hasher: RandomState,
    retention_ms: i64,
    slot_ms: i64,
    duplicates: AtomicU64,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let retention_ms = (config.retention.as_millis() as i64).max(1);
        let slot_ms = (retention_ms / config.slots.max(1) as i64).max(1);
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();

        Self {
            shards,
            hasher: RandomState::new(),
            retention_ms,
            slot_ms,
            duplicates: AtomicU64::new(0),
        }
    }

    fn shard(&self, event_id: &str) -> MutexGuard<'_, Shard> {
        let index = (self.hasher.hash_one(event_id) % self.shards.len() as u64) as usize;
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically check and record `event_id`.
    ///
    /// First delivery within the retention window wins and holds a pending
    /// reservation. Later deliveries are counted and get `Duplicate` once the
    /// first is committed, `InFlight` while it is not.
    pub fn admit(&self, event_id: &str, now: DateTime<Utc>) -> Admission {
        let now_ms = now.timestamp_millis();
        let cutoff_ms = now_ms - self.retention_ms;
        let mut shard = self.shard(event_id);

        shard.evict(cutoff_ms, self.slot_ms);

        if let Some(record) = shard.seen.get(event_id) {
            if record.first_seen > cutoff_ms {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                return match &record.pending {
                    Some(tx) => Admission::InFlight(InFlight { rx: tx.subscribe() }),
                    None => Admission::Duplicate,
                };
            }
        }

        shard.insert(event_id, now_ms, self.slot_ms, true);
        Admission::Admitted
    }

    /// Mark the reservation durable; waiting deliveries resolve as duplicates
    pub fn confirm(&self, event_id: &str) {
        if let Some(record) = self.shard(event_id).seen.get_mut(event_id) {
            record.resolve(Resolution::Committed);
        }
    }

    /// Forget a reservation for an event that never reached durable storage
    pub fn release(&self, event_id: &str) {
        let mut shard = self.shard(event_id);
        if let Some(mut record) = shard.seen.remove(event_id) {
            record.resolve(Resolution::Released);
            log::debug!("🔓 Released dedup reservation for {}", event_id);
        }
    }

    /// Seed records from already persisted events (startup)
    pub fn warm<I>(&self, records: I, now: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = (String, DateTime<Utc>)>,
    {
        let cutoff_ms = now.timestamp_millis() - self.retention_ms;
        let mut warmed = 0;

        for (event_id, first_seen) in records {
            let first_seen_ms = first_seen.timestamp_millis();
            if first_seen_ms <= cutoff_ms {
                continue;
            }
            let mut shard = self.shard(&event_id);
            if !shard.seen.contains_key(&event_id) {
                shard.insert(&event_id, first_seen_ms, self.slot_ms, false);
                warmed += 1;
            }
        }

        warmed
    }

    /// Evict expired slots in every shard; returns records dropped
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff_ms = now.timestamp_millis() - self.retention_ms;
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .evict(cutoff_ms, self.slot_ms)
            })
            .sum()
    }

    /// Live records across all shards
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).seen.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duplicates_rejected(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Width of one ring slot; also the background sweep period
    pub fn slot_width(&self) -> Duration {
        Duration::from_millis(self.slot_ms as u64)
    }
}
