// TestDependencies - mock implementations for testing
//
// Provides a scripted agent and a builder that wires it, an in-memory store
// and fast retry settings into ServerDeps.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{AgentError, AgentProgress, AgentRequest, AgentResponse, BaseAgent, RuntimeSettings, ServerDeps};
use crate::common::FieldMap;
use crate::domains::jobs::RetryPolicy;
use crate::storage::{MemoryStore, Store};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Mock Agent
// =============================================================================

/// One scripted answer for a URL.
#[derive(Debug, Clone)]
pub enum MockReply {
    Extract(FieldMap),
    Fail(AgentError),
}

/// Decrements the active-call counter when a call ends, however it ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct MockAgent {
    scripts: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    default_fields: Arc<Mutex<FieldMap>>,
    calls: Arc<Mutex<Vec<AgentRequest>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
    honor_cancel: bool,
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            default_fields: Arc::new(Mutex::new(FieldMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            gate: None,
            delay: Duration::ZERO,
            honor_cancel: true,
        }
    }

    /// Fields returned for any URL without a scripted reply
    pub fn with_fields(self, fields: FieldMap) -> Self {
        *lock(&self.default_fields) = fields;
        self
    }

    /// Queue a reply for the next call against `url`
    pub fn with_reply(self, url: &str, reply: MockReply) -> Self {
        lock(&self.scripts)
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Fail the first `times` calls against `url`, then fall back to the default fields
    pub fn failing_times(self, url: &str, times: usize, error: AgentError) -> Self {
        (0..times).fold(self, |agent, _| agent.with_reply(url, MockReply::Fail(error.clone())))
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Hold every call until released with [`MockAgent::release`]
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Keep working after cancellation, to simulate results arriving late
    pub fn ignoring_cancellation(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    /// Let `n` held calls proceed
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Get every request the agent received
    pub fn calls(&self) -> Vec<AgentRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Number of calls that targeted `url`
    pub fn calls_for(&self, url: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.url == url).count()
    }

    /// Calls in progress right now
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` calls are in progress. Returns false on timeout.
    pub async fn wait_for_active(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn next_reply(&self, url: &str) -> Result<AgentResponse, AgentError> {
        let scripted = lock(&self.scripts).get_mut(url).and_then(VecDeque::pop_front);
        match scripted {
            Some(MockReply::Fail(error)) => Err(error),
            Some(MockReply::Extract(fields)) => Ok(Self::response(url, fields)),
            None => Ok(Self::response(url, lock(&self.default_fields).clone())),
        }
    }

    fn response(url: &str, fields: FieldMap) -> AgentResponse {
        AgentResponse {
            extracted_fields: fields,
            raw_log: Some(format!("mock agent visited {url}")),
            error: None,
        }
    }
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseAgent for MockAgent {
    async fn run(
        &self,
        request: AgentRequest,
        progress: mpsc::Sender<AgentProgress>,
        cancel: CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        lock(&self.calls).push(request.clone());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(self.active.clone());

        let _ = progress.try_send(AgentProgress::new("Navigating to page", 30));

        let work = async {
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let _ = progress.try_send(AgentProgress::new("Extracting fields", 80));
            self.next_reply(&request.url)
        };

        if self.honor_cancel {
            tokio::select! {
                _ = cancel.cancelled() => Err(AgentError::CancelledByStop),
                result = work => result,
            }
        } else {
            work.await
        }
    }
}

// =============================================================================
// TestDependencies - Builder for test dependencies
// =============================================================================

#[derive(Clone)]
pub struct TestDependencies {
    pub agent: Arc<MockAgent>,
    pub store: Arc<dyn Store>,
    pub settings: RuntimeSettings,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            agent: Arc::new(MockAgent::new()),
            store: Arc::new(MemoryStore::new()),
            settings: RuntimeSettings {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(20),
                },
                dispatch_poll_interval: Duration::from_millis(50),
                ..RuntimeSettings::default()
            },
        }
    }

    /// Set a mock agent
    pub fn mock_agent(mut self, agent: MockAgent) -> Self {
        self.agent = Arc::new(agent);
        self
    }

    /// Use a different store (e.g. Postgres in container tests)
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Convert into ServerDeps for testing
    pub fn into_deps(self) -> ServerDeps {
        ServerDeps::new(self.store, self.agent, self.settings)
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(url: &str) -> AgentRequest {
        AgentRequest {
            job_id: crate::common::JobId::new(),
            url: url.to_string(),
            goal: "find the price".to_string(),
            column_schema: vec![],
        }
    }

    #[tokio::test]
    async fn scripted_failures_then_default_fields() {
        let agent = MockAgent::new()
            .with_fields(FieldMap::from([("price".to_string(), json!("$20"))]))
            .failing_times("https://a.example", 1, AgentError::Timeout(Duration::from_secs(1)));
        let (tx, _rx) = mpsc::channel(8);

        let first = agent.run(request("https://a.example"), tx.clone(), CancellationToken::new()).await;
        assert!(matches!(first, Err(AgentError::Timeout(_))));

        let second = agent
            .run(request("https://a.example"), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.extracted_fields["price"], json!("$20"));
        assert_eq!(agent.calls_for("https://a.example"), 2);
    }

    #[tokio::test]
    async fn gated_call_returns_cancelled_on_cancel() {
        let agent = MockAgent::new().gated();
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(request("https://b.example"), tx, cancel).await })
        };
        assert!(agent.wait_for_active(1, Duration::from_secs(1)).await);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Err(AgentError::CancelledByStop));
        assert_eq!(agent.active(), 0);
    }
}
