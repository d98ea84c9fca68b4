//! adtrack-loadgen - synthetic load driver for `POST /events`
//!
//! Sends batches of random impressions/clicks from a pool of concurrent
//! workers, re-delivering a fraction of earlier events to exercise deduplication,
//! then prints throughput and the per-event status distribution.
//!
//! Usage:
//!   adtrack-loadgen --url http://127.0.0.1:8080 --requests 1000 --batch 50 --duplicate-ratio 0.1

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Clone)]
#[command(author, version, about = "Synthetic load generator for the adtrack ingestion API")]
struct Cli {
    /// Base URL of the ingestion API
    #[arg(long, env = "ADTRACK_LOADGEN_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Total number of requests to send
    #[arg(long, default_value_t = 1000)]
    requests: u64,

    /// Events per request
    #[arg(long, default_value_t = 50)]
    batch: usize,

    /// Concurrent workers
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Distinct campaign ids to spread events over
    #[arg(long, default_value_t = 20)]
    campaigns: usize,

    /// Fraction of events that re-deliver an earlier event unchanged (0.0 - 1.0)
    #[arg(long, default_value_t = 0.05)]
    duplicate_ratio: f64,

    /// Fraction of events that are clicks (0.0 - 1.0)
    #[arg(long, default_value_t = 0.1)]
    click_ratio: f64,
}

#[derive(Default)]
struct Tally {
    events: AtomicU64,
    admitted: AtomicU64,
    duplicate: AtomicU64,
    rejected: AtomicU64,
    overloaded: AtomicU64,
    http_errors: AtomicU64,
}

impl Tally {
    fn record(&self, body: &Value) {
        let Some(events) = body.get("events").and_then(Value::as_array) else {
            return;
        };
        for event in events {
            let counter = match event.get("status").and_then(Value::as_str) {
                Some("admitted") => &self.admitted,
                Some("duplicate") => &self.duplicate,
                Some("rejected") => &self.rejected,
                Some("overloaded") => &self.overloaded,
                _ => continue,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let endpoint = format!("{}/events", cli.url.trim_end_matches('/'));

    info!("🚀 Load generator");
    info!("   ├─ Target: {}", endpoint);
    info!("   ├─ Requests: {} x {} events", cli.requests, cli.batch);
    info!("   ├─ Concurrency: {}", cli.concurrency);
    info!("   └─ Duplicate ratio: {:.2}", cli.duplicate_ratio);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let tally = Arc::new(Tally::default());
    let next_request = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let workers: Vec<_> = (0..cli.concurrency.max(1))
        .map(|worker| {
            let client = client.clone();
            let endpoint = endpoint.clone();
            let tally = tally.clone();
            let next_request = next_request.clone();
            let cli = cli.clone();

            tokio::spawn(async move {
                let mut sent: Vec<Value> = Vec::new();
                let mut sequence = 0u64;

                while next_request.fetch_add(1, Ordering::Relaxed) < cli.requests {
                    let batch = build_batch(&cli, worker, &mut sequence, &mut sent);
                    tally.events.fetch_add(batch.len() as u64, Ordering::Relaxed);

                    match client.post(&endpoint).json(&batch).send().await {
                        Ok(response) => {
                            let status = response.status();
                            match response.json::<Value>().await {
                                Ok(body) => tally.record(&body),
                                Err(e) => {
                                    warn!("⚠️  Unreadable response ({}): {}", status, e);
                                    tally.http_errors.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Err(e) => {
                            warn!("⚠️  Request failed: {}", e);
                            tally.http_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.await.context("worker task panicked")?;
    }

    let elapsed = started.elapsed().as_secs_f64();
    let events = tally.events.load(Ordering::Relaxed);

    let mut distribution = BTreeMap::new();
    distribution.insert("admitted", tally.admitted.load(Ordering::Relaxed));
    distribution.insert("duplicate", tally.duplicate.load(Ordering::Relaxed));
    distribution.insert("rejected", tally.rejected.load(Ordering::Relaxed));
    distribution.insert("overloaded", tally.overloaded.load(Ordering::Relaxed));

    info!("📊 Sent {} events in {:.2}s ({:.1} events/sec)", events, elapsed, events as f64 / elapsed.max(f64::EPSILON));
    for (status, count) in &distribution {
        info!("   ├─ {}: {}", status, count);
    }
    info!("   └─ http errors: {}", tally.http_errors.load(Ordering::Relaxed));

    Ok(())
}

/// A re-delivery resends an earlier event unchanged
fn build_batch(cli: &Cli, worker: usize, sequence: &mut u64, sent: &mut Vec<Value>) -> Vec<Value> {
    let mut rng = rand::thread_rng();
    let now = Utc::now().to_rfc3339();

    (0..cli.batch)
        .map(|_| {
            let reuse = !sent.is_empty() && rng.gen_bool(cli.duplicate_ratio.clamp(0.0, 1.0));
            if let Some(event) = sent.choose(&mut rng).filter(|_| reuse) {
                return event.clone();
            }

            *sequence += 1;
            let event_type = if rng.gen_bool(cli.click_ratio.clamp(0.0, 1.0)) {
                "click"
            } else {
                "impression"
            };
            let event = json!({
                "event_id": format!("lg-{}-{}-{}", worker, *sequence, rng.gen::<u32>()),
                "campaign_id": format!("campaign-{}", rng.gen_range(0..cli.campaigns.max(1))),
                "event_type": event_type,
                "timestamp": now,
                "metadata": { "source": "loadgen" },
            });
            sent.push(event.clone());
            event
        })
        .collect()
}
