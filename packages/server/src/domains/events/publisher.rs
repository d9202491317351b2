//! Append-only event log with live fan-out.
//!
//! Every event is appended to the store first and then published on the
//! in-process hub, both under one lock, so live subscribers observe events in
//! log order. Subscribing takes the same lock, which lets a subscriber replay
//! the log up to "now" and continue live without gaps or duplicates.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::models::{Event, EventFilter, EventPage, EventQuery, NewEvent};
use crate::common::pagination::{trim_results, Cursor, ValidatedPage, MAX_PAGE_SIZE};
use crate::kernel::StreamHub;
use crate::storage::{Result, Store};

/// Topic carrying every event.
const ALL_EVENTS_TOPIC: &str = "events";

fn topics_for(event: &Event) -> Vec<String> {
    let mut topics = vec![
        ALL_EVENTS_TOPIC.to_string(),
        format!("batch:{}", event.batch_id),
    ];
    if let Some(execution_id) = event.execution_id {
        topics.push(format!("execution:{execution_id}"));
    }
    if let Some(job_id) = event.job_id {
        topics.push(format!("job:{job_id}"));
    }
    topics
}

/// The narrowest topic that still carries every event `filter` accepts.
fn topic_for_filter(filter: &EventFilter) -> String {
    if let Some(job_id) = filter.job_id {
        format!("job:{job_id}")
    } else if let Some(execution_id) = filter.execution_id {
        format!("execution:{execution_id}")
    } else if let Some(batch_id) = filter.batch_id {
        format!("batch:{batch_id}")
    } else {
        ALL_EVENTS_TOPIC.to_string()
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    store: Arc<dyn Store>,
    hub: StreamHub<Event>,
    append_lock: Arc<Mutex<()>>,
    heartbeat_interval: Duration,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn Store>, heartbeat_interval: Duration) -> Self {
        Self {
            store,
            hub: StreamHub::new(),
            append_lock: Arc::new(Mutex::new(())),
            heartbeat_interval,
        }
    }

    /// Append to the log and push to live subscribers.
    pub async fn publish(&self, event: NewEvent) -> Result<Event> {
        let _guard = self.append_lock.lock().await;
        let event = self.store.append_event(&event).await?;
        for topic in topics_for(&event) {
            self.hub.publish(&topic, event.clone()).await;
        }
        debug!(
            sequence = event.sequence,
            event_type = %event.event_type,
            batch_id = %event.batch_id,
            "Event published"
        );
        Ok(event)
    }

    /// Publish, logging instead of failing. Event delivery never aborts the
    /// work that produced the event.
    pub async fn emit(&self, event: NewEvent) -> Option<Event> {
        let event_type = event.event_type;
        match self.publish(event).await {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "Failed to record event");
                None
            }
        }
    }

    /// Filtered, paginated read of the log.
    pub async fn query(&self, query: &EventQuery) -> Result<EventPage> {
        let (events, total) = self.store.query_events(query).await?;
        let (events, has_more) = trim_results(events, query.page.limit);
        let next_cursor = if has_more {
            events.last().map(|e| Cursor::new(e.sequence).encode())
        } else {
            None
        };
        Ok(EventPage {
            events,
            total,
            has_more,
            next_cursor,
        })
    }

    /// Retention cleanup: drop events older than `cutoff` and idle channels.
    pub async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_events_before(cutoff).await?;
        let channels = self.hub.cleanup().await;
        debug!(deleted, channels, "Event retention cleanup");
        Ok(deleted)
    }

    /// Open a live subscription.
    ///
    /// With `since`, matching events logged at or after that instant are
    /// delivered first, then live events continue in log order.
    pub async fn subscribe(
        &self,
        filter: EventFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<EventSubscription> {
        let _guard = self.append_lock.lock().await;
        let rx = self.hub.subscribe(&topic_for_filter(&filter)).await;

        let backlog = match since {
            Some(since) => {
                let query = EventQuery {
                    filter,
                    since: Some(since),
                    ..Default::default()
                };
                load_all(self.store.as_ref(), query).await?
            }
            None => VecDeque::new(),
        };

        Ok(EventSubscription {
            rx,
            filter,
            backlog,
            last_sequence: 0,
            heartbeat_interval: self.heartbeat_interval,
            store: self.store.clone(),
        })
    }
}

/// Page through every event matching `query`, starting after its cursor.
async fn load_all(store: &dyn Store, mut query: EventQuery) -> Result<VecDeque<Event>> {
    let mut loaded = VecDeque::new();
    loop {
        query.page = ValidatedPage {
            limit: MAX_PAGE_SIZE,
            offset: 0,
            after: query.page.after,
        };
        let (events, _) = store.query_events(&query).await?;
        let (events, has_more) = trim_results(events, MAX_PAGE_SIZE);
        query.page.after = events.last().map(|e| e.sequence).or(query.page.after);
        loaded.extend(events);
        if !has_more {
            return Ok(loaded);
        }
    }
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(Event),
    /// Nothing happened for a heartbeat interval.
    Heartbeat,
}

pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    filter: EventFilter,
    backlog: VecDeque<Event>,
    /// Highest sequence delivered so far.
    last_sequence: i64,
    heartbeat_interval: Duration,
    store: Arc<dyn Store>,
}

impl EventSubscription {
    /// Next event in log order, or a heartbeat after an idle interval.
    ///
    /// Returns `None` only if the hub channel closes.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if let Some(event) = self.pop_backlog() {
            return Some(StreamItem::Event(event));
        }

        let deadline = tokio::time::Instant::now() + self.heartbeat_interval;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Some(StreamItem::Heartbeat),
                Ok(Ok(event)) => {
                    if event.sequence <= self.last_sequence || !self.filter.matches(&event) {
                        continue;
                    }
                    self.last_sequence = event.sequence;
                    return Some(StreamItem::Event(event));
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Subscriber lagged, reloading from the event log");
                    self.reload_from_log().await;
                    if let Some(event) = self.pop_backlog() {
                        return Some(StreamItem::Event(event));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            }
        }
    }

    /// Turn the subscription into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|item| (item, subscription))
        })
    }

    fn pop_backlog(&mut self) -> Option<Event> {
        while let Some(event) = self.backlog.pop_front() {
            if event.sequence > self.last_sequence {
                self.last_sequence = event.sequence;
                return Some(event);
            }
        }
        None
    }

    async fn reload_from_log(&mut self) {
        let query = EventQuery {
            filter: self.filter,
            page: ValidatedPage {
                after: Some(self.last_sequence),
                ..Default::default()
            },
            ..Default::default()
        };
        match load_all(self.store.as_ref(), query).await {
            Ok(events) => self.backlog.extend(events),
            Err(e) => warn!(error = %e, "Could not reload events after lag"),
        }
    }
}
