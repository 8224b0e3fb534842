//! Backend seams: a [`Runner`] turns a launch spec into a [`SubmittedRun`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{LaunchError, Result};
use crate::queue::LaunchSpec;
use crate::status::Status;

/// Resource used when a launch spec does not name one.
pub const DEFAULT_RESOURCE: &str = "kubernetes";

/// Handle to a job running on some backend.
#[async_trait]
pub trait SubmittedRun: Send + Sync + fmt::Debug {
    /// Backend-specific identifier (Job name, container id, ...).
    fn id(&self) -> &str;

    async fn get_status(&self) -> Result<Status>;

    /// Job output, if the backend still has it.
    async fn get_logs(&self) -> Result<Option<String>>;

    async fn cancel(&self) -> Result<()>;

    /// Block until the run reaches a terminal state. Returns whether it
    /// finished successfully.
    async fn wait(&self) -> Result<bool>;
}

/// Launches jobs on one backend.
#[async_trait]
pub trait Runner: Send + Sync {
    fn backend_name(&self) -> &str;

    /// Submit the job. `None` means the backend accepted the spec but has no
    /// handle to track.
    async fn run(&self, spec: &LaunchSpec) -> Result<Option<Arc<dyn SubmittedRun>>>;
}

/// Runners keyed by the `resource` name used in launch specs.
#[derive(Default, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_runner(mut self, resource: &str, runner: Arc<dyn Runner>) -> Self {
        self.runners.insert(resource.to_string(), runner);
        self
    }

    /// Resolve the runner for a spec, falling back to [`DEFAULT_RESOURCE`].
    pub fn for_spec(&self, spec: &LaunchSpec) -> Result<Arc<dyn Runner>> {
        let resource = spec.resource.as_deref().unwrap_or(DEFAULT_RESOURCE);
        self.runners
            .get(resource)
            .cloned()
            .ok_or_else(|| LaunchError::UnsupportedResource(resource.to_string()))
    }

    #[must_use]
    pub fn resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("resources", &self.resources())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedRunner(&'static str);

    #[async_trait]
    impl Runner for NamedRunner {
        fn backend_name(&self) -> &str {
            self.0
        }

        async fn run(&self, _spec: &LaunchSpec) -> Result<Option<Arc<dyn SubmittedRun>>> {
            Ok(None)
        }
    }

    #[test]
    fn specs_without_resource_use_kubernetes() {
        let registry = RunnerRegistry::new()
            .with_runner("kubernetes", Arc::new(NamedRunner("kubernetes")))
            .with_runner("local-container", Arc::new(NamedRunner("local-container")));

        let runner = registry.for_spec(&LaunchSpec::default()).unwrap();
        assert_eq!(runner.backend_name(), "kubernetes");
        assert_eq!(registry.resources(), vec!["kubernetes", "local-container"]);
    }

    #[test]
    fn unknown_resources_are_rejected() {
        let registry = RunnerRegistry::new();
        let spec = LaunchSpec {
            resource: Some("sagemaker".into()),
            ..Default::default()
        };
        let err = registry.for_spec(&spec).err().unwrap();
        assert!(matches!(err, LaunchError::UnsupportedResource(ref r) if r == "sagemaker"));
    }
}
