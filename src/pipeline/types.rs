//! Core data structures shared across the pipeline
//!
//! Column mapping (see `/sql/`):
//! - `events` → `PersistedEvent`
//! - `aggregate_buckets` → `AggregateBucket`
//! - `aggregation_checkpoints` → `Checkpoint`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of ad interaction reported by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Impression,
    Click,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Impression => "impression",
            EventType::Click => "click",
        }
    }

    /// Case-insensitive parse of the wire/column representation
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("impression") {
            Some(EventType::Impression)
        } else if s.eq_ignore_ascii_case("click") {
            Some(EventType::Click)
        } else {
            None
        }
    }
}

/// A validated event. `event_id` is the deduplication key and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub campaign_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// An event as committed to the durable log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedEvent {
    pub partition: u32,
    pub sequence: u64,
    pub committed_at: DateTime<Utc>,
    pub event: Event,
}

/// Time bucket of an aggregate counter.
///
/// `Late` orders after every `At`, so range scans over `At` never include it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKey {
    /// Bucket start, Unix seconds
    At(i64),
    /// Overflow bucket for events beyond the lateness window
    Late,
}

/// Column value used for `BucketKey::Late` in `aggregate_buckets.bucket_start`
pub const LATE_BUCKET_START: i64 = -1;

impl BucketKey {
    pub fn to_column(self) -> i64 {
        match self {
            BucketKey::At(start) => start,
            BucketKey::Late => LATE_BUCKET_START,
        }
    }

    pub fn from_column(value: i64) -> Self {
        if value == LATE_BUCKET_START {
            BucketKey::Late
        } else {
            BucketKey::At(value)
        }
    }

    /// Truncate a timestamp to the start of its bucket
    pub fn truncate(timestamp: DateTime<Utc>, bucket_secs: i64) -> Self {
        let secs = timestamp.timestamp();
        BucketKey::At(secs - secs.rem_euclid(bucket_secs))
    }
}

/// Impression/click counter pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketCounts {
    pub impressions: u64,
    pub clicks: u64,
}

impl BucketCounts {
    pub fn record(&mut self, event_type: EventType) {
        match event_type {
            EventType::Impression => self.impressions += 1,
            EventType::Click => self.clicks += 1,
        }
    }

    pub fn merge(&mut self, other: BucketCounts) {
        self.impressions += other.impressions;
        self.clicks += other.clicks;
    }

    pub fn is_zero(&self) -> bool {
        self.impressions == 0 && self.clicks == 0
    }
}

/// Counter row for one campaign and time bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateBucket {
    pub campaign_id: String,
    pub time_bucket: BucketKey,
    pub impression_count: u64,
    pub click_count: u64,
}

impl AggregateBucket {
    pub fn new(campaign_id: String, time_bucket: BucketKey, counts: BucketCounts) -> Self {
        Self {
            campaign_id,
            time_bucket,
            impression_count: counts.impressions,
            click_count: counts.clicks,
        }
    }

    pub fn counts(&self) -> BucketCounts {
        BucketCounts {
            impressions: self.impression_count,
            clicks: self.click_count,
        }
    }
}

/// Last sequence folded into aggregates for a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub partition: u32,
    pub last_seq: u64,
    /// Event id stored at `last_seq`; `None` only at genesis
    pub last_event_id: Option<String>,
}

impl Checkpoint {
    pub fn genesis(partition: u32) -> Self {
        Self {
            partition,
            last_seq: 0,
            last_event_id: None,
        }
    }
}

/// Route a campaign to its storage partition.
///
/// FNV-1a, so routing is stable across processes and restarts.
pub fn partition_for(campaign_id: &str, partitions: u32) -> u32 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    let hash = campaign_id
        .bytes()
        .fold(OFFSET, |acc, byte| (acc ^ byte as u64).wrapping_mul(PRIME));

    (hash % partitions.max(1) as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_truncation() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 56).unwrap();
        let key = BucketKey::truncate(ts, 60);
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 0).unwrap().timestamp();
        assert_eq!(key, BucketKey::At(expected));
    }

    #[test]
    fn test_late_bucket_orders_last() {
        assert!(BucketKey::At(i64::MAX) < BucketKey::Late);
        assert_eq!(BucketKey::from_column(LATE_BUCKET_START), BucketKey::Late);
        assert_eq!(BucketKey::Late.to_column(), LATE_BUCKET_START);
    }

    #[test]
    fn test_event_type_parse_is_case_insensitive() {
        assert_eq!(EventType::parse("Impression"), Some(EventType::Impression));
        assert_eq!(EventType::parse("CLICK"), Some(EventType::Click));
        assert_eq!(EventType::parse("conversion"), None);
    }

    #[test]
    fn test_partition_routing_is_stable() {
        let first = partition_for("campaign-42", 8);
        for _ in 0..10 {
            assert_eq!(partition_for("campaign-42", 8), first);
        }
        assert!(first < 8);
        assert_eq!(partition_for("anything", 1), 0);
    }
}
