//! Per-job bookkeeping between a run queue item and its submitted run.

use std::fmt;
use std::sync::Arc;

use crate::agent::saver::FileSaver;
use crate::queue::{FailureStage, LaunchSpec};
use crate::runner::SubmittedRun;
use crate::status::State;

/// Agent-side record of one in-flight job.
#[derive(Clone)]
pub struct JobAndRunStatusTracker {
    pub run_queue_item_id: String,
    pub queue_name: String,
    pub entity: Option<String>,
    pub project: Option<String>,
    pub run_id: Option<String>,
    pub is_scheduler: bool,
    /// Backend the job was handed to
    pub backend: Option<String>,
    /// Stage to blame if the job fails
    pub err_stage: FailureStage,
    completed_status: Option<State>,
    run: Option<Arc<dyn SubmittedRun>>,
    saver: Arc<dyn FileSaver>,
}

impl JobAndRunStatusTracker {
    pub fn new(
        run_queue_item_id: impl Into<String>,
        queue_name: impl Into<String>,
        saver: Arc<dyn FileSaver>,
    ) -> Self {
        Self {
            run_queue_item_id: run_queue_item_id.into(),
            queue_name: queue_name.into(),
            entity: None,
            project: None,
            run_id: None,
            is_scheduler: false,
            backend: None,
            err_stage: FailureStage::Agent,
            completed_status: None,
            run: None,
            saver,
        }
    }

    /// Copy identity fields from the launch spec.
    pub fn update_run_info(&mut self, spec: &LaunchSpec) {
        self.entity.clone_from(&spec.entity);
        self.project.clone_from(&spec.project);
        self.run_id.clone_from(&spec.run_id);
        self.is_scheduler = spec.is_scheduler();
    }

    /// Attach the backend handle. From here on failures are the run's.
    pub fn set_run(&mut self, run: Arc<dyn SubmittedRun>) {
        self.run = Some(run);
        self.err_stage = FailureStage::Run;
    }

    #[must_use]
    pub fn run(&self) -> Option<&Arc<dyn SubmittedRun>> {
        self.run.as_ref()
    }

    #[must_use]
    pub fn saver(&self) -> &Arc<dyn FileSaver> {
        &self.saver
    }

    /// Record the terminal state. Only the first call has any effect.
    pub fn complete(&mut self, state: State) -> bool {
        if self.completed_status.is_some() {
            return false;
        }
        self.completed_status = Some(state);
        true
    }

    #[must_use]
    pub const fn completed_status(&self) -> Option<State> {
        self.completed_status
    }
}

impl fmt::Debug for JobAndRunStatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobAndRunStatusTracker")
            .field("run_queue_item_id", &self.run_queue_item_id)
            .field("queue_name", &self.queue_name)
            .field("entity", &self.entity)
            .field("project", &self.project)
            .field("run_id", &self.run_id)
            .field("is_scheduler", &self.is_scheduler)
            .field("backend", &self.backend)
            .field("err_stage", &self.err_stage)
            .field("completed_status", &self.completed_status)
            .field("run", &self.run)
            .finish_non_exhaustive()
    }
}
