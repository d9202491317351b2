//! Test harness over the in-memory store and a scripted agent.
//!
//! Every test gets a fresh store, event log and execution manager, so tests
//! never observe each other's state. HTTP tests drive the real router with
//! `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, BodyDataStream};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use orchestrator_core::common::ExecutionId;
use orchestrator_core::domains::executions::models::{Execution, ExecutionStatus};
use orchestrator_core::domains::executions::ExecutionManager;
use orchestrator_core::kernel::{MockAgent, ServerDeps, TestDependencies};
use orchestrator_core::server::{build_app, AppState};
use serde_json::Value;
use test_context::AsyncTestContext;
use tower::ServiceExt;

/// Upper bound on any single wait in a test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Test harness that wires the real server around test doubles.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &mut TestHarness) {
///     let (status, body) = ctx.get("/health").await;
/// }
/// ```
pub struct TestHarness {
    pub deps: ServerDeps,
    pub agent: Arc<MockAgent>,
    pub state: AppState,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::with_agent(MockAgent::new())
    }

    async fn teardown(self) {
        // Dispatchers stop with the runtime
    }
}

impl TestHarness {
    /// Build a harness whose agent follows the given script.
    pub fn with_agent(agent: MockAgent) -> Self {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let test_deps = TestDependencies::new().mock_agent(agent);
        let agent = test_deps.agent.clone();
        let deps = test_deps.into_deps();
        let state = AppState::new(deps.clone());
        Self { deps, agent, state }
    }

    pub fn executions(&self) -> &ExecutionManager {
        &self.state.executions
    }

    pub fn app(&self) -> Router {
        build_app(self.state.clone(), &[])
    }

    /// Send one request through the router and decode the JSON response.
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        let response = self
            .app()
            .oneshot(request)
            .await
            .expect("Router failed to respond");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read response body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("Response body is not JSON")
        };
        (status, json)
    }

    /// Open a streaming GET and hand back the undrained body.
    pub async fn open_stream(&self, uri: &str) -> (StatusCode, Option<String>, BodyDataStream) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = self
            .app()
            .oneshot(request)
            .await
            .expect("Router failed to respond");
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        (response.status(), content_type, response.into_body().into_data_stream())
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn patch(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PATCH, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, body).await
    }

    /// Poll until the execution reaches `status`.
    pub async fn wait_for_status(&self, id: ExecutionId, status: ExecutionStatus) -> Execution {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let execution = self
                .executions()
                .get(id)
                .await
                .expect("Execution should exist");
            if execution.status == status {
                return execution;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "execution {} stuck in {:?}, expected {:?}",
                id,
                execution.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait for effects to settle after a control command.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
