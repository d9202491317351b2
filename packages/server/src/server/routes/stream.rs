//! SSE streaming endpoint.
//!
//! GET /events/stream?executionId=&batchId=&jobId=&since=
//!
//! Each log entry is forwarded as an SSE event named after its type, with the
//! sequence number as the SSE id. Quiet periods produce `heartbeat` events.

use std::convert::Infallible;

use axum::{
    extract::{Extension, Query},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::common::{BatchId, ExecutionId, JobId};
use crate::domains::events::models::{Event, EventFilter};
use crate::domains::events::StreamItem;
use crate::server::app::AppState;
use crate::server::error::ApiResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    execution_id: Option<ExecutionId>,
    batch_id: Option<BatchId>,
    job_id: Option<JobId>,
    /// Replay logged events from this instant before going live.
    since: Option<DateTime<Utc>>,
}

fn to_sse(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default()
        .event(event.event_type.as_str())
        .id(event.sequence.to_string())
        .data(data)
}

fn heartbeat() -> SseEvent {
    SseEvent::default()
        .event("heartbeat")
        .data(json!({ "timestamp": Utc::now() }).to_string())
}

/// SSE stream handler.
pub async fn stream_events(
    Extension(state): Extension<AppState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let filter = EventFilter {
        execution_id: query.execution_id,
        batch_id: query.batch_id,
        job_id: query.job_id,
    };
    let subscription = state.deps.events.subscribe(filter, query.since).await?;

    let connected =
        stream::once(async { Ok::<_, Infallible>(SseEvent::default().event("connected").data("ok")) });

    let events = subscription.into_stream().map(|item| {
        Ok(match item {
            StreamItem::Event(event) => to_sse(&event),
            StreamItem::Heartbeat => heartbeat(),
        })
    });

    Ok(Sse::new(connected.chain(events)).keep_alive(KeepAlive::default()))
}
