//! Launch agent control loop
//!
//! Pops run queue items round-robin across the configured queues, hands each
//! one to a backend runner in its own task, follows the run until it reaches a
//! terminal state and reports the outcome back to the queue service. Every
//! task ends in [`LaunchAgent::finish_thread_id`], whatever happened inside it,
//! so a job can never hold on to a concurrency slot.

pub mod limits;
pub mod saver;
pub mod secure;
pub mod tracker;

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::cleanup::ActiveRunSource;
use crate::config::AgentConfig;
use crate::error::{ConfigError, LaunchError, Result};
use crate::queue::{
    AgentStatus, Capabilities, FailureStage, LaunchSpec, QueueApi, RunInfo, RunQueueItem,
    SweepState,
};
use crate::runner::{RunnerRegistry, SubmittedRun, DEFAULT_RESOURCE};
use crate::status::{State, Status};

pub use limits::{Limit, LimitValue};
pub use saver::{FileSaver, LocalFileSaver};
pub use tracker::JobAndRunStatusTracker;

/// Upper bound on a single wait while confirming that a run started.
const RUN_INFO_GRACE_PERIOD: Duration = Duration::from_secs(60);
/// Agent status is refreshed every this many loop ticks.
const HEARTBEAT_TICKS: u64 = 2;
const ERROR_LOG_FILE: &str = "error.log";
const RUN_ID_LEN: usize = 8;

pub const MISSING_RUN_INFO_MESSAGE: &str =
    "The submitted job was finished without assigned project or run id";
pub const NO_INIT_MESSAGE: &str = "The submitted job exited successfully but failed to call init";
pub const NOT_STARTED_MESSAGE: &str = "The submitted run was not successfully started";

/// Validated agent settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub entity: String,
    pub project: String,
    pub queues: Vec<String>,
    pub max_jobs: Limit,
    pub max_schedulers: Limit,
    pub secure_mode: bool,
    pub stopped_run_timeout: Duration,
    pub polling_interval: Duration,
    pub job_polling_interval: Duration,
    pub queue_project: String,
    /// Configuration reported when registering with the queue service
    pub agent_config: Value,
}

impl AgentSettings {
    /// Validate `config`. Bad concurrency limits or a missing entity are fatal.
    pub fn from_config(config: &AgentConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let entity = config
            .entity
            .as_deref()
            .map(str::trim)
            .ok_or(ConfigError::Missing("entity"))?
            .to_string();
        let queues = config
            .queues
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            entity,
            project: config.project.clone(),
            queues,
            max_jobs: config.max_jobs_limit()?,
            max_schedulers: config.max_schedulers_limit()?,
            secure_mode: config.secure_mode,
            stopped_run_timeout: Duration::from_secs(config.stopped_run_timeout_seconds),
            polling_interval: Duration::from_secs(config.polling_interval_seconds),
            job_polling_interval: Duration::from_secs(config.job_polling_interval_seconds),
            queue_project: config.queue_project.clone(),
            agent_config: config.agent_config_json(),
        })
    }
}

/// Run ids the agent has dispatched, readable by the garbage collector
/// without touching the job table.
#[derive(Debug, Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl ActiveRuns {
    pub async fn insert(&self, run_id: &str) {
        self.inner.write().await.insert(run_id.to_string());
    }

    pub async fn remove(&self, run_id: &str) {
        self.inner.write().await.remove(run_id);
    }

    pub async fn snapshot(&self) -> HashSet<String> {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl ActiveRunSource for ActiveRuns {
    async fn active_run_ids(&self) -> HashSet<String> {
        self.snapshot().await
    }
}

pub struct LaunchAgent {
    api: Arc<dyn QueueApi>,
    runners: RunnerRegistry,
    saver: Arc<dyn FileSaver>,
    settings: AgentSettings,
    queues: Mutex<VecDeque<String>>,
    jobs: Mutex<HashMap<String, JobAndRunStatusTracker>>,
    known_warnings: Mutex<HashMap<String, HashSet<String>>>,
    active_runs: ActiveRuns,
    capabilities: OnceLock<Capabilities>,
    agent_id: OnceLock<String>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for LaunchAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchAgent")
            .field("settings", &self.settings)
            .field("runners", &self.runners)
            .field("agent_id", &self.agent_id.get())
            .finish_non_exhaustive()
    }
}

impl LaunchAgent {
    #[must_use]
    pub fn new(
        api: Arc<dyn QueueApi>,
        runners: RunnerRegistry,
        saver: Arc<dyn FileSaver>,
        settings: AgentSettings,
    ) -> Self {
        let queues = settings.queues.iter().cloned().collect();
        Self {
            api,
            runners,
            saver,
            settings,
            queues: Mutex::new(queues),
            jobs: Mutex::new(HashMap::new()),
            known_warnings: Mutex::new(HashMap::new()),
            active_runs: ActiveRuns::default(),
            capabilities: OnceLock::new(),
            agent_id: OnceLock::new(),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build an agent from raw configuration, rejecting invalid limits.
    pub fn from_config(
        api: Arc<dyn QueueApi>,
        runners: RunnerRegistry,
        saver: Arc<dyn FileSaver>,
        config: &AgentConfig,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(Self::new(api, runners, saver, AgentSettings::from_config(config)?))
    }

    #[must_use]
    pub const fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Handle for the garbage collector.
    #[must_use]
    pub fn active_runs(&self) -> ActiveRuns {
        self.active_runs.clone()
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.get().map(String::as_str)
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.get().copied().unwrap_or_default()
    }

    /// Probe server capabilities and register the agent.
    pub async fn initialize(&self) -> Result<()> {
        let capabilities = match self.api.capabilities().await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                warn!(error = %e, "Failed to probe queue service capabilities, assuming defaults");
                Capabilities::default()
            }
        };
        let _ = self.capabilities.set(capabilities);

        if !capabilities.launch_agents {
            info!("Queue service has no launch agent API, running unregistered");
            return Ok(());
        }

        let queues: Vec<String> = self.settings.queues.clone();
        if let Some(id) = self
            .api
            .create_launch_agent(&queues, &self.settings.agent_config)
            .await?
        {
            info!(agent_id = %id, entity = %self.settings.entity, "Registered launch agent");
            let _ = self.agent_id.set(id);
        }
        Ok(())
    }

    /// Current queue order.
    pub async fn queue_order(&self) -> Vec<String> {
        self.queues.lock().await.iter().cloned().collect()
    }

    /// Regular (non-scheduler) jobs in flight.
    pub async fn num_running_jobs(&self) -> usize {
        self.jobs.lock().await.values().filter(|t| !t.is_scheduler).count()
    }

    pub async fn num_running_schedulers(&self) -> usize {
        self.jobs.lock().await.values().filter(|t| t.is_scheduler).count()
    }

    /// Snapshot of the tracker for `item_id`.
    pub async fn tracker(&self, item_id: &str) -> Option<JobAndRunStatusTracker> {
        self.jobs.lock().await.get(item_id).cloned()
    }

    /// Add a tracker to the job table.
    pub async fn register_job(&self, tracker: JobAndRunStatusTracker) {
        if let Some(run_id) = tracker.run_id.as_deref() {
            self.active_runs.insert(run_id).await;
        }
        self.jobs
            .lock()
            .await
            .insert(tracker.run_queue_item_id.clone(), tracker);
    }

    async fn update_tracker<R>(
        &self,
        item_id: &str,
        update: impl FnOnce(&mut JobAndRunStatusTracker) -> R,
    ) -> Option<R> {
        self.jobs.lock().await.get_mut(item_id).map(update)
    }

    /// Pop from the first queue that has work. Every queue tried moves to the
    /// back of the order.
    pub async fn get_job_and_queue(&self) -> Option<RunQueueItem> {
        let candidates = self.queue_order().await;
        for queue in candidates {
            let popped = self.api.pop_from_run_queue(&queue).await;
            {
                let mut order = self.queues.lock().await;
                if let Some(pos) = order.iter().position(|q| q == &queue) {
                    if let Some(q) = order.remove(pos) {
                        order.push_back(q);
                    }
                }
            }
            match popped {
                Ok(Some(mut item)) => {
                    if item.queue_name.is_empty() {
                        item.queue_name = queue;
                    }
                    return Some(item);
                }
                Ok(None) => {}
                Err(e) => warn!(queue = %queue, error = %e, "Failed to pop from run queue"),
            }
        }
        None
    }

    /// Validate, acknowledge and spawn a popped item.
    #[instrument(skip(self, item), fields(run_queue_item_id = %item.id, queue = %item.queue_name))]
    pub async fn run_job(self: &Arc<Self>, item: RunQueueItem) -> Result<()> {
        let RunQueueItem {
            id: item_id,
            run_spec: mut spec,
            queue_name,
            ..
        } = item;

        info!(spec = %spec.redacted(), "Launching job");
        self.update_status(AgentStatus::Running).await;

        if self.settings.secure_mode {
            secure::check_launch_spec(&spec)?;
        }

        if spec.is_scheduler() {
            let running = self.num_running_schedulers().await;
            if !self.settings.max_schedulers.allows(running) {
                info!(
                    running,
                    max_schedulers = %self.settings.max_schedulers,
                    "Scheduler limit reached, returning item to its queue"
                );
                self.api.release_run_queue_item(&item_id).await?;
                return Ok(());
            }
        }

        if spec.entity.is_none() {
            spec.entity = Some(self.settings.entity.clone());
        }
        if spec.project.is_none() {
            spec.project = Some(self.settings.project.clone());
        }
        let run_id = spec.run_id.get_or_insert_with(generate_run_id).clone();

        self.api.ack_run_queue_item(&item_id, &run_id).await?;

        let mut tracker = JobAndRunStatusTracker::new(&item_id, queue_name, Arc::clone(&self.saver));
        tracker.update_run_info(&spec);
        self.register_job(tracker).await;

        let agent = Arc::clone(self);
        self.tasks
            .lock()
            .await
            .spawn(async move { agent.task_run_job(spec, item_id).await });
        Ok(())
    }

    /// Drive one job and always finish it, including when it errors or panics.
    pub async fn task_run_job(self: Arc<Self>, spec: LaunchSpec, item_id: String) {
        let outcome = AssertUnwindSafe(self.supervise(&item_id, &spec))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(LaunchError::Panicked(panic_message(payload.as_ref()))),
        };
        self.finish_thread_id(&item_id, error).await;
    }

    async fn supervise(&self, item_id: &str, spec: &LaunchSpec) -> Result<()> {
        let runner = self.runners.for_spec(spec)?;
        let backend = runner.backend_name().to_string();
        self.update_tracker(item_id, |t| t.backend = Some(backend))
            .await;

        let Some(run) = runner.run(spec).await? else {
            info!(run_queue_item_id = %item_id, "Backend returned no run handle");
            return Ok(());
        };
        self.update_tracker(item_id, |t| t.set_run(Arc::clone(&run)))
            .await;
        debug!(run_queue_item_id = %item_id, run = %run.id(), "Run submitted");

        let mut stop_deadline = None;
        loop {
            if self
                .check_run_finished(item_id, spec, &run, &mut stop_deadline)
                .await?
            {
                return Ok(());
            }
            tokio::time::sleep(self.settings.job_polling_interval).await;
        }
    }

    /// Poll the run once. `Ok(true)` once the job reached a terminal state.
    async fn check_run_finished(
        &self,
        item_id: &str,
        spec: &LaunchSpec,
        run: &Arc<dyn SubmittedRun>,
        stop_deadline: &mut Option<Instant>,
    ) -> Result<bool> {
        let Some(tracker) = self.tracker(item_id).await else {
            return Ok(true);
        };
        if tracker.completed_status().is_some() {
            return Ok(true);
        }

        if stop_deadline.is_none() && self.stop_requested(&tracker).await {
            info!(run_queue_item_id = %item_id, run_id = ?tracker.run_id, "Stop requested, cancelling run");
            run.cancel().await?;
            *stop_deadline = Some(Instant::now() + self.settings.stopped_run_timeout);
        }

        let status = run.get_status().await?;
        self.forward_warnings(&tracker, &status).await;

        match status.state {
            State::Preempted => {
                self.handle_preemption(&tracker, spec, run).await?;
                return Ok(true);
            }
            State::Finished | State::Failed => {
                self.update_tracker(item_id, |t| t.complete(status.state))
                    .await;
                if status.state == State::Failed && tracker.is_scheduler {
                    self.cancel_sweep(&tracker).await;
                }
                return Ok(true);
            }
            _ => {}
        }

        if let Some(deadline) = *stop_deadline {
            if Instant::now() >= deadline {
                return Err(LaunchError::StopTimeout {
                    run_id: tracker.run_id.clone().unwrap_or_default(),
                    timeout_secs: self.settings.stopped_run_timeout.as_secs(),
                });
            }
        }
        Ok(false)
    }

    async fn handle_preemption(
        &self,
        tracker: &JobAndRunStatusTracker,
        spec: &LaunchSpec,
        run: &Arc<dyn SubmittedRun>,
    ) -> Result<()> {
        let first = self
            .update_tracker(&tracker.run_queue_item_id, |t| t.complete(State::Preempted))
            .await
            .unwrap_or(false);
        if !first {
            return Ok(());
        }

        if !self.owns(tracker) {
            warn!(
                entity = ?tracker.entity,
                agent_entity = %self.settings.entity,
                "Preempted run belongs to another entity, leaving it alone"
            );
            return Ok(());
        }
        warn!(
            run_queue_item_id = %tracker.run_queue_item_id,
            run_id = ?tracker.run_id,
            "Run was preempted, requeueing"
        );
        run.cancel().await?;

        let resumed = spec.resumed();
        self.api
            .add_to_queue(&resumed, &self.settings.queue_project, &tracker.queue_name)
            .await?;
        info!(
            queue = %tracker.queue_name,
            resume_count = resumed.resume_count,
            "Requeued preempted run"
        );
        Ok(())
    }

    async fn stop_requested(&self, tracker: &JobAndRunStatusTracker) -> bool {
        let (Some(project), Some(run_id)) = (tracker.project.as_deref(), tracker.run_id.as_deref())
        else {
            return false;
        };
        let entity = tracker.entity.as_deref().unwrap_or(&self.settings.entity);
        match self.api.check_stop_requested(entity, project, run_id).await {
            Ok(requested) => requested,
            Err(e) => {
                debug!(run_id, error = %e, "Failed to check for stop request");
                false
            }
        }
    }

    async fn forward_warnings(&self, tracker: &JobAndRunStatusTracker, status: &Status) {
        if status.messages.is_empty() {
            return;
        }
        let fresh: Vec<String> = {
            let mut known = self.known_warnings.lock().await;
            let seen = known
                .entry(tracker.run_queue_item_id.clone())
                .or_default();
            status
                .messages
                .iter()
                .filter(|message| seen.insert((*message).clone()))
                .cloned()
                .collect()
        };

        let backend = tracker.backend.as_deref().unwrap_or(DEFAULT_RESOURCE);
        for message in fresh {
            warn!(run_queue_item_id = %tracker.run_queue_item_id, warning = %message, "Run warning");
            if let Err(e) = self
                .api
                .update_run_queue_item_warning(&tracker.run_queue_item_id, &message, backend, &[])
                .await
            {
                warn!(error = %e, "Failed to forward run queue item warning");
            }
        }
    }

    async fn cancel_sweep(&self, tracker: &JobAndRunStatusTracker) {
        if !self.owns(tracker) {
            warn!(
                entity = ?tracker.entity,
                agent_entity = %self.settings.entity,
                "Sweep belongs to another entity, not cancelling it"
            );
            return;
        }
        let (Some(sweep_id), Some(project)) = (tracker.run_id.as_deref(), tracker.project.as_deref())
        else {
            return;
        };
        let entity = tracker.entity.as_deref().unwrap_or(&self.settings.entity);
        match self
            .api
            .set_sweep_state(sweep_id, entity, project, SweepState::Canceled)
            .await
        {
            Ok(()) => info!(sweep_id, "Cancelled sweep after scheduler failure"),
            Err(e) => warn!(sweep_id, error = %e, "Failed to cancel sweep"),
        }
    }

    /// Whether the tracker belongs to this agent's entity.
    fn owns(&self, tracker: &JobAndRunStatusTracker) -> bool {
        tracker
            .entity
            .as_deref()
            .map_or(true, |entity| entity == self.settings.entity)
    }

    /// Report the outcome of a job task and release its slot.
    #[instrument(skip(self, error), fields(run_queue_item_id = %item_id))]
    pub async fn finish_thread_id(&self, item_id: &str, error: Option<LaunchError>) {
        let Some(tracker) = self.tracker(item_id).await else {
            warn!("No tracker for finished job");
            return;
        };

        if self.owns(&tracker) {
            self.report_finished(&tracker, error).await;
        } else {
            warn!(
                entity = ?tracker.entity,
                agent_entity = %self.settings.entity,
                "Job belongs to another entity, not reporting"
            );
        }

        self.forget(&tracker).await;
    }

    async fn report_finished(&self, tracker: &JobAndRunStatusTracker, error: Option<LaunchError>) {
        let item_id = tracker.run_queue_item_id.as_str();

        if let Some(error) = error {
            let trace = error_chain(&error);
            error!(error = %trace, stage = tracker.err_stage.as_str(), "Job failed");
            if tracker.is_scheduler {
                self.cancel_sweep(tracker).await;
            }
            let files = self.save_file(tracker.saver(), item_id, &trace).await;
            self.fail_item(item_id, &error.to_string(), tracker.err_stage, &files)
                .await;
            return;
        }

        let (Some(project), Some(run_id)) = (tracker.project.as_deref(), tracker.run_id.as_deref())
        else {
            self.fail_item(item_id, MISSING_RUN_INFO_MESSAGE, tracker.err_stage, &[])
                .await;
            return;
        };

        let Some(run) = tracker.run() else {
            info!(run_id, "Finished job");
            return;
        };

        if tracker.completed_status() == Some(State::Preempted) {
            info!(run_id, "Preempted job finished");
            return;
        }

        // Fetch logs now, the backend may garbage collect them while we wait.
        let logs = match run.get_logs().await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(run_id, error = %e, "Failed to fetch run logs");
                None
            }
        };

        let entity = tracker.entity.as_deref().unwrap_or(&self.settings.entity);
        if self.wait_for_run_start(entity, project, run_id).await {
            info!(run_id, status = ?tracker.completed_status(), "Finished job");
            return;
        }

        let message = if tracker.completed_status() == Some(State::Finished) {
            NO_INIT_MESSAGE
        } else {
            NOT_STARTED_MESSAGE
        };
        let files = match logs {
            Some(logs) => self.save_file(tracker.saver(), item_id, &logs).await,
            None => Vec::new(),
        };
        self.fail_item(item_id, message, FailureStage::Run, &files).await;
    }

    /// Poll the queue service for the run, sleeping 1, 2, 4, ... seconds
    /// between attempts until a single wait would exceed the grace period.
    async fn wait_for_run_start(&self, entity: &str, project: &str, run_id: &str) -> bool {
        let mut wait = Duration::from_secs(1);
        loop {
            match self.api.get_run_info(entity, project, run_id).await {
                RunInfo::Found { state } if state.as_deref() != Some("pending") => return true,
                RunInfo::Found { .. } => debug!(run_id, "Run is still pending"),
                RunInfo::NotFound => debug!(run_id, "Run not found yet"),
                RunInfo::TransientError(e) => debug!(run_id, error = %e, "Run info lookup failed"),
            }
            if wait > RUN_INFO_GRACE_PERIOD {
                return false;
            }
            tokio::time::sleep(wait).await;
            wait *= 2;
        }
    }

    async fn save_file(&self, saver: &Arc<dyn FileSaver>, item_id: &str, contents: &str) -> Vec<String> {
        match saver.save(item_id, ERROR_LOG_FILE, contents).await {
            Ok(paths) => paths,
            Err(e) => {
                warn!(run_queue_item_id = %item_id, error = %e, "Failed to save error log");
                Vec::new()
            }
        }
    }

    async fn fail_item(&self, item_id: &str, message: &str, stage: FailureStage, files: &[String]) {
        if !self.capabilities().fail_run_queue_items {
            info!(run_queue_item_id = %item_id, reason = message, "Queue service cannot fail items, skipping report");
            return;
        }
        if let Err(e) = self
            .api
            .fail_run_queue_item(item_id, message, stage, files)
            .await
        {
            error!(run_queue_item_id = %item_id, error = %e, "Failed to fail run queue item");
        }
    }

    async fn forget(&self, tracker: &JobAndRunStatusTracker) {
        let empty = {
            let mut jobs = self.jobs.lock().await;
            jobs.remove(&tracker.run_queue_item_id);
            jobs.is_empty()
        };
        self.known_warnings
            .lock()
            .await
            .remove(&tracker.run_queue_item_id);
        if let Some(run_id) = tracker.run_id.as_deref() {
            self.active_runs.remove(run_id).await;
        }
        if empty {
            self.update_status(AgentStatus::Polling).await;
        }
    }

    async fn update_status(&self, status: AgentStatus) {
        let Some(agent_id) = self.agent_id() else {
            return;
        };
        if let Err(e) = self.api.update_launch_agent_status(agent_id, status).await {
            warn!(agent_id, status = status.as_str(), error = %e, "Failed to update agent status");
        }
    }

    async fn stop_polling_requested(&self) -> bool {
        let Some(agent_id) = self.agent_id() else {
            return false;
        };
        match self.api.get_launch_agent(agent_id).await {
            Ok(info) => info.stop_polling,
            Err(e) => {
                warn!(agent_id, error = %e, "Failed to fetch launch agent info");
                false
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, item: RunQueueItem) {
        let item_id = item.id.clone();
        if let Err(error) = self.run_job(item).await {
            let trace = error_chain(&error);
            error!(run_queue_item_id = %item_id, error = %trace, "Failed to launch job");
            let files = self.save_file(&self.saver, &item_id, &trace).await;
            self.fail_item(&item_id, &error.to_string(), FailureStage::Agent, &files)
                .await;
        }
    }

    async fn reap_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Job task panicked outside supervision");
                }
            }
        }
    }

    /// Main loop. Returns when the agent is shut down or the queue service
    /// asks it to stop polling.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            entity = %self.settings.entity,
            queues = ?self.settings.queues,
            max_jobs = %self.settings.max_jobs,
            max_schedulers = %self.settings.max_schedulers,
            "Launch agent polling"
        );

        let mut ticks: u64 = 0;
        while !self.shutdown.is_cancelled() {
            ticks += 1;
            if self.stop_polling_requested().await {
                info!("Queue service asked the agent to stop polling");
                break;
            }

            self.reap_tasks().await;

            let running = self.num_running_jobs().await;
            if self.settings.max_jobs.allows(running) {
                if let Some(item) = self.get_job_and_queue().await {
                    self.dispatch(item).await;
                }
            }

            if ticks % HEARTBEAT_TICKS == 0 {
                let status = if self.jobs.lock().await.is_empty() {
                    AgentStatus::Polling
                } else {
                    AgentStatus::Running
                };
                self.update_status(status).await;
            }

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.settings.polling_interval) => {}
            }
        }

        info!("Launch agent shutting down");
        self.shutdown.cancel();
        self.tasks.lock().await.shutdown().await;
        self.update_status(AgentStatus::Killed).await;
        Ok(())
    }
}

fn generate_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..RUN_ID_LEN].to_string()
}

/// Debug rendering of an error and every source below it.
fn error_chain(error: &LaunchError) -> String {
    let mut out = format!("{error:?}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        out.push_str(&format!("\nCaused by: {cause}"));
        source = cause.source();
    }
    out
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_reject_bad_limits() {
        let config = AgentConfig {
            entity: Some("team".into()),
            max_jobs: Some("weird".into()),
            ..Default::default()
        };
        assert!(matches!(
            AgentSettings::from_config(&config),
            Err(ConfigError::InvalidLimit { field: "max_jobs", .. })
        ));
    }

    #[test]
    fn settings_trim_queues_and_parse_limits() {
        let config = AgentConfig {
            entity: Some(" team ".into()),
            queues: vec![" a ".into(), String::new(), "b".into()],
            max_jobs: Some(LimitValue::Number(-1)),
            max_schedulers: Some("3".into()),
            ..Default::default()
        };
        let settings = AgentSettings::from_config(&config).unwrap();
        assert_eq!(settings.entity, "team");
        assert_eq!(settings.queues, vec!["a", "b"]);
        assert_eq!(settings.max_jobs, Limit::Unbounded);
        assert_eq!(settings.max_schedulers, Limit::Bounded(3));
        assert_eq!(settings.stopped_run_timeout, Duration::from_secs(60));
    }

    #[test]
    fn run_ids_are_short_and_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_eq!(a.len(), RUN_ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn error_chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let chain = error_chain(&LaunchError::Io(io));
        assert!(chain.contains("Io("));
        assert!(chain.contains("Caused by: disk full"));
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn active_runs_track_inserts_and_removals() {
        let runs = ActiveRuns::default();
        runs.insert("r1").await;
        runs.insert("r2").await;
        runs.remove("r1").await;
        let ids = runs.active_run_ids().await;
        assert_eq!(ids, HashSet::from(["r2".to_string()]));
    }
}
