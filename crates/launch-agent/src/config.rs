//! Agent configuration
//!
//! Loaded from a YAML file, then overridden by environment variables and
//! command-line flags. Concurrency limits are kept in their raw form here and
//! validated when the agent is constructed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::limits::{Limit, LimitValue};
use crate::cluster::cleanup::ResourceCleanupConfig;
use crate::error::ConfigError;
use crate::queue::client::DEFAULT_BASE_URL;

pub const ENV_API_KEY: &str = "LAUNCH_API_KEY";
pub const ENV_BASE_URL: &str = "LAUNCH_BASE_URL";

/// Launch agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Entity (account) whose queues this agent serves
    #[serde(default)]
    pub entity: Option<String>,

    /// Default project for runs that do not name one
    #[serde(default = "default_project")]
    pub project: String,

    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    #[serde(default)]
    pub max_jobs: Option<LimitValue>,

    #[serde(default)]
    pub max_schedulers: Option<LimitValue>,

    /// Reject launch specs that override entrypoints or pod security fields
    #[serde(default)]
    pub secure_mode: bool,

    /// How long a run may take to stop after a stop request
    #[serde(default = "default_stopped_run_timeout")]
    pub stopped_run_timeout_seconds: u64,

    /// Pause between agent loop ticks
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u64,

    /// Pause between status checks of one running job
    #[serde(default = "default_job_polling_interval")]
    pub job_polling_interval_seconds: u64,

    /// Project holding the run queues (used when requeueing)
    #[serde(default = "default_queue_project")]
    pub queue_project: String,

    /// Namespace for Kubernetes jobs that do not set one
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub cleanup: ResourceCleanupConfig,

    /// Where error logs for failed queue items are written
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_base_url", alias = "baseUrl")]
    pub base_url: String,

    /// Queue service API key; prefer `LAUNCH_API_KEY`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

fn default_project() -> String {
    "launch".to_string()
}

fn default_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_stopped_run_timeout() -> u64 {
    60
}

fn default_polling_interval() -> u64 {
    10
}

fn default_job_polling_interval() -> u64 {
    1
}

fn default_queue_project() -> String {
    "model-registry".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_log_dir() -> PathBuf {
    std::env::temp_dir().join("launch-agent")
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            entity: None,
            project: default_project(),
            queues: default_queues(),
            max_jobs: None,
            max_schedulers: None,
            secure_mode: false,
            stopped_run_timeout_seconds: default_stopped_run_timeout(),
            polling_interval_seconds: default_polling_interval(),
            job_polling_interval_seconds: default_job_polling_interval(),
            queue_project: default_queue_project(),
            namespace: default_namespace(),
            cleanup: ResourceCleanupConfig::default(),
            log_dir: default_log_dir(),
            base_url: default_base_url(),
            api_key: None,
        }
    }
}

impl AgentConfig {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from a YAML file, e.g. one mounted from a `ConfigMap`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Apply `LAUNCH_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            if !key.trim().is_empty() {
                self.api_key = Some(key.trim().to_string());
            }
        }
        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            if !url.trim().is_empty() {
                self.base_url = url.trim().to_string();
            }
        }
        self.cleanup.apply_env()
    }

    /// Check everything the agent needs before it starts polling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entity.as_deref().map_or(true, |e| e.trim().is_empty()) {
            return Err(ConfigError::Missing("entity"));
        }
        if self.queues.iter().all(|q| q.trim().is_empty()) {
            return Err(ConfigError::Missing("queues"));
        }
        self.max_jobs_limit()?;
        self.max_schedulers_limit()?;
        Ok(())
    }

    pub fn max_jobs_limit(&self) -> Result<Limit, ConfigError> {
        Limit::parse("max_jobs", self.max_jobs.as_ref())
    }

    pub fn max_schedulers_limit(&self) -> Result<Limit, ConfigError> {
        Limit::parse("max_schedulers", self.max_schedulers.as_ref())
    }

    /// Configuration reported to the queue service on registration.
    #[must_use]
    pub fn agent_config_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
entity: team
queues: [gpu, cpu]
max_jobs: "8"
max_schedulers: -1
secure_mode: true
stopped_run_timeout_seconds: 120
cleanup:
  minimum_resource_age_seconds: 600
  monitored_namespaces: "ml, research"
"#;

        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.entity.as_deref(), Some("team"));
        assert_eq!(config.queues, vec!["gpu", "cpu"]);
        assert_eq!(config.max_jobs_limit().unwrap(), Limit::Bounded(8));
        assert_eq!(config.max_schedulers_limit().unwrap(), Limit::Unbounded);
        assert!(config.secure_mode);
        assert_eq!(config.stopped_run_timeout_seconds, 120);
        assert_eq!(config.cleanup.minimum_resource_age_seconds, 600);
        assert_eq!(config.cleanup.monitored_namespaces, vec!["ml", "research"]);
        assert_eq!(config.project, "launch");
        assert_eq!(config.queue_project, "model-registry");
        config.validate().unwrap();
    }

    #[test]
    fn defaults_are_sensible() {
        let config = AgentConfig::default();
        assert_eq!(config.queues, vec!["default"]);
        assert_eq!(config.max_jobs_limit().unwrap(), Limit::Bounded(1));
        assert_eq!(config.max_schedulers_limit().unwrap(), Limit::Bounded(1));
        assert_eq!(config.stopped_run_timeout_seconds, 60);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn validate_requires_entity_and_valid_limits() {
        let config = AgentConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("entity"))));

        let config = AgentConfig {
            entity: Some("team".into()),
            max_jobs: Some(LimitValue::Number(-29)),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLimit { field: "max_jobs", .. })
        ));

        let config = AgentConfig {
            entity: Some("team".into()),
            max_schedulers: Some(LimitValue::from("weird")),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLimit {
                field: "max_schedulers",
                ..
            })
        ));
    }

    #[test]
    fn from_file_reports_missing_files() {
        let err = AgentConfig::from_file(Path::new("/nonexistent/launch-config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn from_file_reads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "entity: team\nqueues: [nightly]").unwrap();
        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.queues, vec!["nightly"]);
    }

    #[test]
    #[serial]
    fn env_overrides_api_key_and_url() {
        std::env::set_var(ENV_API_KEY, " secret ");
        std::env::set_var(ENV_BASE_URL, "http://localhost:8080");
        let mut config = AgentConfig::default();
        let result = config.apply_env();
        std::env::remove_var(ENV_API_KEY);
        std::env::remove_var(ENV_BASE_URL);

        result.unwrap();
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.base_url, "http://localhost:8080");
    }

    #[test]
    fn api_key_is_never_reported() {
        let config = AgentConfig {
            api_key: Some("secret".into()),
            ..Default::default()
        };
        assert!(!config.agent_config_json().to_string().contains("secret"));
    }
}
