//! HTTP surface
//!
//! API listener:
//! - `POST /events` - single object, array, or `{"events": [...]}`
//! - `GET /campaigns/:campaign_id/aggregates?from=&to=`
//! - `GET /partitions` - aggregation checkpoint and lag per partition
//! - `GET /health`
//!
//! Metrics listener:
//! - `GET /metrics` - Prometheus text exposition

mod error;

pub use error::{ApiError, Result};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::observability::{metrics_handler, track_http_metrics};
use crate::pipeline::query::PartitionLag;
use crate::pipeline::{BatchStatus, IngestionService, QueryResult, QueryService, RawEvent};

/// Seconds a client should wait before resending retryable events
const RETRY_AFTER_SECS: &str = "1";

#[derive(Clone)]
pub struct AppState {
    ingestion: Arc<IngestionService>,
    query: QueryService,
    max_request_events: usize,
}

impl AppState {
    pub fn new(ingestion: Arc<IngestionService>, query: QueryService, max_request_events: usize) -> Self {
        Self {
            ingestion,
            query,
            max_request_events,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(post_events))
        .route("/campaigns/:campaign_id/aggregates", get(get_aggregates))
        .route("/partitions", get(get_partitions))
        .with_state(state)
        .route_layer(middleware::from_fn(track_http_metrics))
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

async fn post_events(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let events = parse_events(&body)?;
    if events.len() > state.max_request_events {
        return Err(ApiError::BatchTooLarge {
            got: events.len(),
            limit: state.max_request_events,
        });
    }

    let outcome = state.ingestion.ingest(events).await;

    let response = if outcome.status == BatchStatus::Retry {
        let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(outcome)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        response
    } else {
        (StatusCode::OK, Json(outcome)).into_response()
    };
    Ok(response)
}

/// Accept a single event object, an array, or an `{"events": [...]}` envelope
fn parse_events(body: &[u8]) -> Result<Vec<RawEvent>> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))?;

    let events = match value {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("events") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ApiError::InvalidBody(
                    "`events` must be an array".to_string(),
                ))
            }
            None => vec![Value::Object(object)],
        },
        _ => {
            return Err(ApiError::InvalidBody(
                "expected an event object or an array of events".to_string(),
            ))
        }
    };

    if events.is_empty() {
        return Err(ApiError::InvalidBody("request contains no events".to_string()));
    }

    Ok(events.into_iter().map(RawEvent::from).collect())
}

#[derive(Deserialize, Default)]
struct AggregatesQuery {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

async fn get_aggregates(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
    Query(params): Query<AggregatesQuery>,
) -> Result<Json<QueryResult>> {
    let from = parse_time("from", params.from.as_deref())?;
    let to = parse_time("to", params.to.as_deref())?;
    Ok(Json(state.query.query(&campaign_id, from, to)?))
}

async fn get_partitions(State(state): State<AppState>) -> Json<Vec<PartitionLag>> {
    Json(state.query.lag())
}

/// RFC 3339 or integer Unix seconds
fn parse_time(param: &'static str, raw: Option<&str>) -> Result<DateTime<Utc>> {
    let raw = raw.ok_or_else(|| ApiError::InvalidParam {
        param,
        reason: "missing".to_string(),
    })?;

    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0).ok_or_else(|| ApiError::InvalidParam {
            param,
            reason: format!("{} is out of range", secs),
        });
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ApiError::InvalidParam {
            param,
            reason: e.to_string(),
        })
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("❌ Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("❌ Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events_accepts_all_shapes() {
        let single = parse_events(br#"{"event_id":"a"}"#).unwrap();
        assert_eq!(single.len(), 1);

        let array = parse_events(br#"[{"event_id":"a"},{"event_id":"b"}]"#).unwrap();
        assert_eq!(array.len(), 2);

        let envelope = parse_events(br#"{"events":[{"event_id":"a"}]}"#).unwrap();
        assert_eq!(envelope[0].event_id_hint().as_deref(), Some("a"));
    }

    #[test]
    fn test_parse_events_rejects_bad_bodies() {
        assert!(matches!(parse_events(b"not json"), Err(ApiError::InvalidBody(_))));
        assert!(matches!(parse_events(b"42"), Err(ApiError::InvalidBody(_))));
        assert!(matches!(parse_events(b"[]"), Err(ApiError::InvalidBody(_))));
        assert!(matches!(parse_events(br#"{"events":{}}"#), Err(ApiError::InvalidBody(_))));
    }

    #[test]
    fn test_parse_time_formats() {
        let rfc = parse_time("from", Some("2024-06-01T12:00:00Z")).unwrap();
        let unix = parse_time("from", Some("1717243200")).unwrap();
        assert_eq!(rfc, unix);

        assert!(parse_time("to", None).is_err());
        assert!(parse_time("to", Some("yesterday")).is_err());
    }
}
