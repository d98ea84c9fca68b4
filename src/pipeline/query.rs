//! Read side over committed aggregate snapshots
//!
//! Never touches the store or the buffer: it reads the latest snapshot each
//! partition engine published, so queries cannot block on ingestion.

use super::aggregation::PartitionSnapshot;
use super::types::{BucketCounts, BucketKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid range: `from` ({from}) must be before `to` ({to})")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSummary {
    pub bucket_start: DateTime<Utc>,
    pub impression_count: u64,
    pub click_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub campaign_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub impression_count: u64,
    pub click_count: u64,
    /// Events committed beyond the lateness window, not attributable to a bucket
    pub late_impression_count: u64,
    pub late_click_count: u64,
    pub buckets: Vec<BucketSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionLag {
    pub partition: u32,
    pub checkpoint: u64,
    pub head: u64,
    pub lag: u64,
}

#[derive(Clone)]
pub struct QueryService {
    partitions: Vec<watch::Receiver<Arc<PartitionSnapshot>>>,
}

impl QueryService {
    pub fn new(partitions: Vec<watch::Receiver<Arc<PartitionSnapshot>>>) -> Self {
        Self { partitions }
    }

    /// Counts for `campaign_id` over buckets starting in `[from, to)`.
    /// No data is a zero result, not an error.
    pub fn query(
        &self,
        campaign_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<QueryResult, QueryError> {
        if from >= to {
            return Err(QueryError::InvalidRange { from, to });
        }

        let range = BucketKey::At(ceil_secs(from))..BucketKey::At(ceil_secs(to));
        let mut per_bucket: BTreeMap<i64, BucketCounts> = BTreeMap::new();
        let mut late = BucketCounts::default();

        for rx in &self.partitions {
            let snapshot = rx.borrow().clone();
            let Some(campaign) = snapshot.campaign(campaign_id) else {
                continue;
            };

            for (key, counts) in campaign.range(range.clone()) {
                if let BucketKey::At(start) = key {
                    per_bucket.entry(*start).or_default().merge(*counts);
                }
            }
            if let Some(counts) = campaign.get(&BucketKey::Late) {
                late.merge(*counts);
            }
        }

        let mut total = BucketCounts::default();
        let buckets = per_bucket
            .into_iter()
            .filter_map(|(start, counts)| {
                total.merge(counts);
                DateTime::from_timestamp(start, 0).map(|bucket_start| BucketSummary {
                    bucket_start,
                    impression_count: counts.impressions,
                    click_count: counts.clicks,
                })
            })
            .collect();

        Ok(QueryResult {
            campaign_id: campaign_id.to_string(),
            from,
            to,
            impression_count: total.impressions,
            click_count: total.clicks,
            late_impression_count: late.impressions,
            late_click_count: late.clicks,
            buckets,
        })
    }

    pub fn lag(&self) -> Vec<PartitionLag> {
        self.partitions
            .iter()
            .map(|rx| {
                let snapshot = rx.borrow();
                PartitionLag {
                    partition: snapshot.partition,
                    checkpoint: snapshot.checkpoint.last_seq,
                    head: snapshot.head,
                    lag: snapshot.lag(),
                }
            })
            .collect()
    }
}

/// Bucket starts are whole seconds, so compare against the bound's ceiling
/// to keep `[from, to)` exact for sub-second bounds.
fn ceil_secs(ts: DateTime<Utc>) -> i64 {
    if ts.timestamp_subsec_nanos() > 0 {
        ts.timestamp() + 1
    } else {
        ts.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::aggregation::CampaignBuckets;
    use crate::pipeline::types::Checkpoint;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn minute(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, m, 0).unwrap()
    }

    fn snapshot(partition: u32, campaign: &str, rows: &[(BucketKey, u64, u64)]) -> Arc<PartitionSnapshot> {
        let mut buckets: CampaignBuckets = BTreeMap::new();
        for (key, impressions, clicks) in rows {
            buckets.insert(*key, BucketCounts { impressions: *impressions, clicks: *clicks });
        }
        Arc::new(PartitionSnapshot {
            partition,
            checkpoint: Checkpoint { partition, last_seq: 10, last_event_id: Some("x".into()) },
            head: 12,
            buckets: HashMap::from([(campaign.to_string(), buckets)]),
        })
    }

    fn service(snapshots: Vec<Arc<PartitionSnapshot>>) -> (Vec<watch::Sender<Arc<PartitionSnapshot>>>, QueryService) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            snapshots.into_iter().map(watch::channel).unzip();
        (senders, QueryService::new(receivers))
    }

    #[test]
    fn test_empty_range_returns_zero() {
        let (_tx, svc) = service(vec![snapshot(0, "C1", &[])]);
        let result = svc.query("nobody", minute(0), minute(5)).unwrap();
        assert_eq!(result.impression_count, 0);
        assert_eq!(result.click_count, 0);
        assert!(result.buckets.is_empty());
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let (_tx, svc) = service(vec![]);
        let err = svc.query("C1", minute(5), minute(5)).unwrap_err();
        assert!(matches!(err, QueryError::InvalidRange { .. }));
    }

    #[test]
    fn test_range_is_half_open_and_sums_partitions() {
        let at = |m| BucketKey::At(minute(m).timestamp());
        let (_tx, svc) = service(vec![
            snapshot(0, "C1", &[(at(0), 3, 1), (at(1), 2, 0), (at(2), 100, 100), (BucketKey::Late, 4, 2)]),
            snapshot(1, "C1", &[(at(1), 5, 5)]),
        ]);

        let result = svc.query("C1", minute(0), minute(2)).unwrap();
        assert_eq!(result.impression_count, 10);
        assert_eq!(result.click_count, 6);
        assert_eq!(result.late_impression_count, 4);
        assert_eq!(result.late_click_count, 2);
        assert_eq!(result.buckets.len(), 2);
        assert_eq!(result.buckets[1].bucket_start, minute(1));
        assert_eq!(result.buckets[1].impression_count, 7);
    }

    #[test]
    fn test_readers_see_new_snapshots() {
        let (senders, svc) = service(vec![snapshot(0, "C1", &[])]);
        assert_eq!(svc.query("C1", minute(0), minute(1)).unwrap().impression_count, 0);

        senders[0].send_replace(snapshot(0, "C1", &[(BucketKey::At(minute(0).timestamp()), 1, 0)]));
        assert_eq!(svc.query("C1", minute(0), minute(1)).unwrap().impression_count, 1);

        let lag = svc.lag();
        assert_eq!(lag, vec![PartitionLag { partition: 0, checkpoint: 10, head: 12, lag: 2 }]);
    }
}
