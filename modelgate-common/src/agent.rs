//! Agent task and job schema.
//!
//! Tasks are reusable prompt templates bound to a model; jobs are single
//! executions of a task with bound parameters. Both persist as JSON files
//! under the configs directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A reusable agent task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Model name the task runs against; must resolve to a config with a
    /// non-empty MCP section.
    pub model: String,
    /// Prompt template; `{{.key}}` placeholders are filled from job
    /// parameters.
    pub prompt: String,
    /// Cron expression (second precision). Empty means not scheduled.
    #[serde(default)]
    pub cron: String,
    /// Default parameters for cron-triggered runs.
    #[serde(default)]
    pub cron_parameters: HashMap<String, String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    /// Value for the Authorization header of webhook deliveries.
    #[serde(default)]
    pub webhook_auth: String,
    /// Optional payload template for the webhook body; the default payload
    /// is used when empty.
    #[serde(default)]
    pub webhook_template: String,
    /// Deliveries fired when a job completes successfully.
    #[serde(default)]
    pub result_push: Vec<ResultPush>,
    /// Deliveries fired when a job fails.
    #[serde(default)]
    pub result_push_failure: Vec<ResultPush>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One result-push destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultPush {
    pub url: String,
    /// HTTP method; POST when empty.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub payload_template: String,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub task_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// "api" or "cron".
    #[serde(default)]
    pub triggered_by: String,
    #[serde(default)]
    pub traces: Vec<JobTrace>,
    #[serde(default)]
    pub webhook_sent: bool,
    #[serde(default)]
    pub webhook_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub webhook_error: String,
    #[serde(default)]
    pub result_pushed: bool,
    #[serde(default)]
    pub result_pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result_push_error: String,
}

/// One entry of a job's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTrace {
    /// "status", "reasoning", "tool_call" or "tool_result".
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
}

/// On-disk shape of `agent_tasks.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksFile {
    pub tasks: Vec<Task>,
}

/// On-disk shape of `agent_jobs.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsFile {
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub last_cleanup: Option<DateTime<Utc>>,
}
