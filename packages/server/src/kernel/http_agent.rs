//! HTTP client for the browser-automation agent.
//!
//! POSTs the extraction request as JSON to `{base_url}/run`. The agent answers
//! either with a single `AgentResponse` JSON body, or with an
//! `application/x-ndjson` stream of tagged lines:
//!
//! ```text
//! {"type":"progress","currentStep":"Opening page","progressPercentage":20}
//! {"type":"result","extractedFields":{"price":"$20"}}
//! ```
//!
//! Progress lines are forwarded as they arrive. A plain JSON agent only ever
//! reports the initial "Sent to agent" step, so long calls against it show as
//! stalled once the staleness window passes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::traits::{AgentError, AgentProgress, AgentRequest, AgentResponse, BaseAgent};

const NDJSON: &str = "application/x-ndjson";

/// One line of a streamed agent response.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentFrame {
    Progress(AgentProgress),
    Result(AgentResponse),
}

/// Forward a progress line; hand back the result line.
fn read_line(
    line: &[u8],
    progress: &mpsc::Sender<AgentProgress>,
) -> Result<Option<AgentResponse>, AgentError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(line) {
        Ok(AgentFrame::Progress(update)) => {
            // Advisory; a full channel drops the update
            let _ = progress.try_send(update);
            Ok(None)
        }
        Ok(AgentFrame::Result(response)) => Ok(Some(response)),
        Err(e) => Err(AgentError::Rejected(format!("malformed agent stream line: {e}"))),
    }
}

pub struct HttpAgent {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpAgent {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = Url::parse(base_url)?.join("run")?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout(self.timeout)
        } else if err.is_connect() {
            AgentError::Unreachable(err.to_string())
        } else if err.is_decode() {
            AgentError::Rejected(format!("malformed agent response: {err}"))
        } else {
            AgentError::Unreachable(err.to_string())
        }
    }

    async fn call(
        &self,
        request: &AgentRequest,
        progress: &mpsc::Sender<AgentProgress>,
    ) -> Result<AgentResponse, AgentError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, format!("{NDJSON}, application/json"))
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AgentError::Rejected("429 Too Many Requests".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Rejected(format!("{status}: {body}")));
        }

        let streamed = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(NDJSON));
        let body = if streamed {
            self.read_stream(response, progress).await?
        } else {
            response.json().await.map_err(|e| self.map_error(e))?
        };
        match body.error {
            Some(error) => Err(AgentError::Rejected(error)),
            None => Ok(body),
        }
    }

    /// Forward progress lines until the result line arrives.
    async fn read_stream(
        &self,
        mut response: Response,
        progress: &mpsc::Sender<AgentProgress>,
    ) -> Result<AgentResponse, AgentError> {
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_error(e))? {
            buffer.extend_from_slice(&chunk);
            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                if let Some(result) = read_line(&line, progress)? {
                    return Ok(result);
                }
            }
        }
        // The last line may lack its newline
        match read_line(&buffer, progress)? {
            Some(result) => Ok(result),
            None => Err(AgentError::Rejected(
                "agent stream ended without a result".to_string(),
            )),
        }
    }
}

#[async_trait]
impl BaseAgent for HttpAgent {
    async fn run(
        &self,
        request: AgentRequest,
        progress: mpsc::Sender<AgentProgress>,
        cancel: CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        debug!(job_id = %request.job_id, url = %request.url, "Sending job to agent");
        let _ = progress.try_send(AgentProgress::new("Sent to agent", 5));

        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::CancelledByStop),
            result = self.call(&request, &progress) => result,
        }
    }
}
