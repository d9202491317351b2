// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Retry policy, scoring and classification live in the domains and use these traits.
//
// Naming convention: Base* for trait names (e.g., BaseAgent)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::{FieldMap, JobId};
use crate::domains::batches::models::ColumnDef;

// =============================================================================
// Agent Trait (Infrastructure - browser automation)
// =============================================================================

/// One extraction task handed to the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub job_id: JobId,
    pub url: String,
    pub goal: String,
    pub column_schema: Vec<ColumnDef>,
}

/// Advisory progress reported while the agent works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProgress {
    pub current_step: String,
    pub progress_percentage: i32,
}

impl AgentProgress {
    pub fn new(current_step: impl Into<String>, progress_percentage: i32) -> Self {
        Self {
            current_step: current_step.into(),
            progress_percentage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    #[serde(default)]
    pub extracted_fields: FieldMap,
    #[serde(default)]
    pub raw_log: Option<String>,
    /// Set when the agent ran but could not complete the goal.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("agent timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{0}")]
    Rejected(String),

    #[error("cancelled by stop")]
    CancelledByStop,
}

#[async_trait]
pub trait BaseAgent: Send + Sync {
    /// Run one extraction.
    ///
    /// Progress updates are best-effort; implementations drop them rather than
    /// block when the receiver is slow. When `cancel` fires the call should
    /// return `AgentError::CancelledByStop` promptly.
    async fn run(
        &self,
        request: AgentRequest,
        progress: mpsc::Sender<AgentProgress>,
        cancel: CancellationToken,
    ) -> Result<AgentResponse, AgentError>;
}
