//! Run queue service: wire types, the [`QueueApi`] seam and its GraphQL client.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use client::GraphQlQueueClient;

/// Launch spec URI used for sweep scheduler jobs.
pub const SCHEDULER_URI: &str = "placeholder-uri-scheduler";

const REDACTED: &str = "<redacted>";

/// Errors returned by the queue service.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Queue service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("Queue service does not support {0}")]
    NotSupported(&'static str),

    #[error("Failed to decode queue service response: {0}")]
    Decode(String),

    /// The service answered but refused the operation
    #[error("{0}")]
    Rejected(String),
}

/// Job definition carried by a run queue item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Backend that should run the job (`kubernetes`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Backend-specific arguments keyed by backend name
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub resource_args: Map<String, Value>,
    #[serde(default)]
    pub docker: DockerSpec,
    #[serde(default)]
    pub overrides: Overrides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_id: Option<String>,
    /// Number of times this spec has been requeued after preemption
    #[serde(rename = "_resume_count", default)]
    pub resume_count: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LaunchSpec {
    /// Sweep scheduler jobs count against `max_schedulers` instead of `max_jobs`.
    #[must_use]
    pub fn is_scheduler(&self) -> bool {
        self.uri.as_deref() == Some(SCHEDULER_URI)
    }

    #[must_use]
    pub fn image(&self) -> Option<&str> {
        self.docker.docker_image.as_deref()
    }

    /// Backend arguments for `resource`, if any.
    #[must_use]
    pub fn resource_args_for(&self, resource: &str) -> Option<&Value> {
        self.resource_args.get(resource)
    }

    /// Copy of this spec to put back on the queue after a preemption.
    #[must_use]
    pub fn resumed(&self) -> Self {
        let mut spec = self.clone();
        spec.resume_count = self.resume_count.saturating_add(1);
        spec
    }

    /// JSON rendering with every `*api_key*` field masked, for logging.
    #[must_use]
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        redact(&mut value);
        value
    }
}

fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if key.to_ascii_lowercase().contains("api_key") {
                    *nested = Value::String(REDACTED.to_string());
                } else {
                    redact(nested);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

/// One unit of work popped from a run queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQueueItem {
    #[serde(rename = "runQueueItemId")]
    pub id: String,
    #[serde(rename = "runSpec")]
    pub run_spec: LaunchSpec,
    /// Queue the item was popped from (filled in by the client)
    #[serde(default)]
    pub queue_name: String,
    #[serde(default)]
    pub priority: Option<i64>,
}

/// Outcome of asking the queue service whether a run has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunInfo {
    Found { state: Option<String> },
    NotFound,
    /// Lookup failed for a reason that may go away on retry
    TransientError(String),
}

/// Server-side features the agent adapts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub fail_run_queue_items: bool,
    pub launch_agents: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            fail_run_queue_items: true,
            launch_agents: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub stop_polling: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Polling,
    Running,
    Killed,
}

impl AgentStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "POLLING",
            Self::Running => "RUNNING",
            Self::Killed => "KILLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Running,
    Paused,
    Canceled,
    Finished,
}

impl SweepState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Canceled => "CANCELED",
            Self::Finished => "FINISHED",
        }
    }
}

/// Where a job failed, reported with the failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// The agent could not launch or supervise the job
    Agent,
    /// The job launched but its run never started or crashed
    Run,
}

impl FailureStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Run => "run",
        }
    }
}

/// Queue service operations used by the agent. Implementations are scoped to
/// one entity and one queue project.
#[async_trait]
pub trait QueueApi: Send + Sync {
    /// Probe which optional mutations the server supports.
    async fn capabilities(&self) -> Result<Capabilities, QueueError>;

    /// Register this agent. `None` when the server has no agent API.
    async fn create_launch_agent(
        &self,
        queues: &[String],
        agent_config: &Value,
    ) -> Result<Option<String>, QueueError>;

    async fn get_launch_agent(&self, agent_id: &str) -> Result<AgentInfo, QueueError>;

    async fn update_launch_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), QueueError>;

    async fn pop_from_run_queue(&self, queue_name: &str)
        -> Result<Option<RunQueueItem>, QueueError>;

    async fn ack_run_queue_item(&self, item_id: &str, run_id: &str) -> Result<(), QueueError>;

    /// Hand a popped item back to its queue without counting it as failed.
    async fn release_run_queue_item(&self, item_id: &str) -> Result<(), QueueError>;

    async fn fail_run_queue_item(
        &self,
        item_id: &str,
        message: &str,
        stage: FailureStage,
        file_paths: &[String],
    ) -> Result<(), QueueError>;

    async fn add_to_queue(
        &self,
        spec: &LaunchSpec,
        project_queue: &str,
        queue_name: &str,
    ) -> Result<(), QueueError>;

    async fn update_run_queue_item_warning(
        &self,
        item_id: &str,
        message: &str,
        backend: &str,
        file_paths: &[String],
    ) -> Result<(), QueueError>;

    async fn set_sweep_state(
        &self,
        sweep_id: &str,
        entity: &str,
        project: &str,
        state: SweepState,
    ) -> Result<(), QueueError>;

    async fn get_run_info(&self, entity: &str, project: &str, run_id: &str) -> RunInfo;

    /// Whether a user asked to stop the run from the UI.
    async fn check_stop_requested(
        &self,
        entity: &str,
        project: &str,
        run_id: &str,
    ) -> Result<bool, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn launch_spec_keeps_unknown_fields() {
        let spec: LaunchSpec = serde_json::from_value(json!({
            "uri": "https://example.com/job",
            "entity": "team",
            "project": "vision",
            "resource": "kubernetes",
            "resource_args": {"kubernetes": {"namespace": "ml"}},
            "docker": {"docker_image": "registry/train:1"},
            "overrides": {"args": ["--epochs", "3"], "run_config": {"lr": 0.1}},
            "_resume_count": 2,
            "author": "someone"
        }))
        .unwrap();

        assert_eq!(spec.image(), Some("registry/train:1"));
        assert_eq!(spec.resume_count, 2);
        assert_eq!(spec.extra["author"], "someone");
        assert_eq!(spec.overrides.extra["run_config"]["lr"], 0.1);
        assert_eq!(
            spec.resource_args_for("kubernetes").unwrap()["namespace"],
            "ml"
        );

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["_resume_count"], 2);
        assert_eq!(back["author"], "someone");
    }

    #[test]
    fn resumed_spec_increments_resume_count_only() {
        let spec = LaunchSpec {
            project: Some("vision".into()),
            resume_count: 4,
            ..Default::default()
        };
        let resumed = spec.resumed();
        assert_eq!(resumed.resume_count, 5);
        assert_eq!(resumed.project, spec.project);
    }

    #[test]
    fn redaction_masks_nested_api_keys() {
        let mut spec = LaunchSpec::default();
        spec.extra
            .insert("_wandb_api_key".into(), json!("secret-one"));
        spec.overrides
            .extra
            .insert("run_config".into(), json!({"OPENAI_API_KEY": "secret-two"}));

        let redacted = spec.redacted();
        assert_eq!(redacted["_wandb_api_key"], REDACTED);
        assert_eq!(redacted["overrides"]["run_config"]["OPENAI_API_KEY"], REDACTED);
        assert!(!redacted.to_string().contains("secret"));
    }

    #[test]
    fn scheduler_specs_are_detected_by_uri() {
        let spec = LaunchSpec {
            uri: Some(SCHEDULER_URI.into()),
            ..Default::default()
        };
        assert!(spec.is_scheduler());
        assert!(!LaunchSpec::default().is_scheduler());
    }
}
