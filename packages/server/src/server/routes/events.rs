//! Event log polling and retention.

use axum::{
    extract::{Extension, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BatchId, ExecutionId, JobId, PageRequest};
use crate::domains::events::models::{EventFilter, EventPage, EventQuery, EventType};
use crate::server::app::AppState;
use crate::server::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEventsQuery {
    execution_id: Option<ExecutionId>,
    batch_id: Option<BatchId>,
    job_id: Option<JobId>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
    cursor: Option<String>,
}

impl ListEventsQuery {
    fn into_query(self) -> Result<EventQuery, ApiError> {
        let event_type = self
            .event_type
            .as_deref()
            .map(str::parse::<EventType>)
            .transpose()
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        let page = PageRequest::new(self.limit, self.offset, self.cursor)
            .validate()
            .map_err(ApiError::bad_request)?;

        Ok(EventQuery {
            filter: EventFilter {
                execution_id: self.execution_id,
                batch_id: self.batch_id,
                job_id: self.job_id,
            },
            event_type,
            since: self.since,
            until: self.until,
            page,
        })
    }
}

/// GET /events
pub async fn list_events(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<EventPage>> {
    let query = query.into_query()?;
    let page = state.deps.events.query(&query).await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEventsQuery {
    older_than: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEventsResponse {
    deleted: u64,
}

/// DELETE /events?olderThan=
pub async fn delete_events(
    Extension(state): Extension<AppState>,
    Query(query): Query<DeleteEventsQuery>,
) -> ApiResult<Json<DeleteEventsResponse>> {
    let deleted = state.deps.events.cleanup(query.older_than).await?;
    Ok(Json(DeleteEventsResponse { deleted }))
}
