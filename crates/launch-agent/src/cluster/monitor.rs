//! Cluster job monitor.
//!
//! One [`ClusterJobMonitor`] serves every Kubernetes run in the process. It
//! keeps a single watch loop per (namespace, resource kind) and folds the
//! events into a job-name → [`Status`] map that submitted runs read from,
//! instead of each run polling the API server on its own.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, WatchEvent, WatchParams};
use kube::Client;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::watch::{SafeWatch, WatchError, WatchStream, WATCH_TIMEOUT_SECS};
use crate::error::Result;
use crate::labels;
use crate::status::{CrdPhase, State, Status};

/// Pod disruption reasons that mean the cluster took the node away from us.
const PREEMPTION_REASONS: [&str; 3] = [
    "EvictionByEvictionAPI",
    "PreemptionByScheduler",
    "TerminationByKubelet",
];

/// Custom resource kind used as a job's primary object (Kubeflow, Volcano,
/// JobSet, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustomResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl CustomResource {
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&self.group, &self.version, &self.kind),
            &self.plural,
        )
    }
}

impl fmt::Display for CustomResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.plural)
    }
}

/// Raw watch calls the monitor needs from the cluster.
#[async_trait]
pub trait ClusterWatcher: Send + Sync + 'static {
    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, WatchError>;

    async fn watch_jobs(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Job>, WatchError>;

    async fn watch_custom(
        &self,
        namespace: &str,
        resource: &CustomResource,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<DynamicObject>, WatchError>;
}

/// [`ClusterWatcher`] backed by the API server.
#[derive(Clone)]
pub struct KubeWatcher {
    client: Client,
}

impl KubeWatcher {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

fn watch_params(selector: &str) -> WatchParams {
    WatchParams::default()
        .labels(selector)
        .timeout(WATCH_TIMEOUT_SECS)
}

#[async_trait]
impl ClusterWatcher for KubeWatcher {
    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, WatchError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let version = resource_version.unwrap_or_else(|| "0".to_string());
        let events = api.watch(&watch_params(selector), &version).await?;
        Ok(events.map_err(WatchError::from).boxed())
    }

    async fn watch_jobs(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Job>, WatchError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let version = resource_version.unwrap_or_else(|| "0".to_string());
        let events = api.watch(&watch_params(selector), &version).await?;
        Ok(events.map_err(WatchError::from).boxed())
    }

    async fn watch_custom(
        &self,
        namespace: &str,
        resource: &CustomResource,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<DynamicObject>, WatchError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource.api_resource());
        let version = resource_version.unwrap_or_else(|| "0".to_string());
        let events = api.watch(&watch_params(selector), &version).await?;
        Ok(events.map_err(WatchError::from).boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum WatchedKind {
    Pods,
    Jobs,
    Custom(CustomResource),
}

impl fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pods => f.write_str("pods"),
            Self::Jobs => f.write_str("jobs"),
            Self::Custom(resource) => write!(f, "{resource}"),
        }
    }
}

/// How long a deleted job's last status stays readable.
const DELETED_RETENTION: Duration = Duration::from_secs(300);
/// Replaced object uids remembered so their late events can be dropped.
const RETIRED_UID_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Tracked {
    uid: Option<String>,
    status: Status,
    deleted_at: Option<Instant>,
}

impl Tracked {
    fn fresh(uid: &str) -> Self {
        Self {
            uid: Some(uid.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Board {
    jobs: HashMap<String, Tracked>,
    retired: VecDeque<String>,
}

impl Board {
    /// Entry for `job_name` as seen by an event from the object with `uid`.
    ///
    /// Jobs are resubmitted under the same name, so a new uid (or any uid
    /// after the previous object was deleted) starts the entry over. Events
    /// from an object that was already replaced get `None`.
    fn entry(&mut self, job_name: &str, uid: Option<&str>) -> Option<&mut Tracked> {
        if let Some(uid) = uid {
            if self.retired.iter().any(|retired| retired == uid) {
                debug!(job_name, uid, "Ignoring event from a replaced object");
                return None;
            }
            let replaces = self.jobs.get(job_name).is_some_and(|tracked| {
                tracked
                    .uid
                    .as_deref()
                    .map_or(tracked.deleted_at.is_some(), |current| current != uid)
            });
            if replaces {
                debug!(job_name, uid, "Job object replaced, starting its status over");
                if let Some(previous) = self.jobs.insert(job_name.to_string(), Tracked::fresh(uid)) {
                    self.retire(previous.uid);
                }
            }
        }
        let tracked = self.jobs.entry(job_name.to_string()).or_default();
        if tracked.uid.is_none() {
            tracked.uid = uid.map(str::to_string);
        }
        Some(tracked)
    }

    fn retire(&mut self, uid: Option<String>) {
        let Some(uid) = uid else {
            return;
        };
        if self.retired.len() == RETIRED_UID_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(uid);
    }

    fn prune_deleted(&mut self) {
        self.jobs.retain(|_, tracked| {
            tracked
                .deleted_at
                .map_or(true, |at| at.elapsed() < DELETED_RETENTION)
        });
    }
}

/// Job name → status map shared by the watch loops and readers.
#[derive(Debug, Clone, Default)]
struct StatusBoard {
    inner: Arc<Mutex<Board>>,
}

impl StatusBoard {
    async fn get(&self, job_name: &str) -> Status {
        self.inner
            .lock()
            .await
            .jobs
            .get(job_name)
            .map(|tracked| tracked.status.clone())
            .unwrap_or_default()
    }

    /// Fold one event from object `uid` into the job's entry: record the
    /// message, then apply `next` if the current status allows it.
    async fn observe(
        &self,
        job_name: &str,
        uid: Option<&str>,
        next: Option<State>,
        message: Option<&str>,
    ) {
        let mut board = self.inner.lock().await;
        let Some(tracked) = board.entry(job_name, uid) else {
            return;
        };
        if let Some(message) = message {
            tracked.status.push_message(message);
        }
        if let Some(next) = next {
            apply(job_name, &mut tracked.status, next);
        }
    }

    /// The job's object is gone. A job that had not completed yet counts as
    /// failed; the entry is dropped once the retention period has passed.
    async fn deleted(&self, job_name: &str, uid: Option<&str>) {
        let mut board = self.inner.lock().await;
        board.prune_deleted();
        let Some(tracked) = board.entry(job_name, uid) else {
            return;
        };
        apply(job_name, &mut tracked.status, State::Failed);
        tracked.deleted_at.get_or_insert_with(Instant::now);
    }

    async fn counts(&self) -> HashMap<State, usize> {
        let board = self.inner.lock().await;
        let mut counts = HashMap::new();
        for tracked in board.jobs.values() {
            *counts.entry(tracked.status.state).or_insert(0) += 1;
        }
        counts
    }
}

fn apply(job_name: &str, status: &mut Status, next: State) {
    if status.state != next && status.accepts(next) {
        debug!(job_name, from = %status.state, to = %next, "Job state changed");
        status.state = next;
    }
}

/// Shared cache of job states for every monitored namespace.
pub struct ClusterJobMonitor {
    watcher: Arc<dyn ClusterWatcher>,
    selector: String,
    board: StatusBoard,
    tasks: std::sync::Mutex<HashMap<(String, WatchedKind), JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ClusterJobMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterJobMonitor")
            .field("selector", &self.selector)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ClusterJobMonitor {
    /// Monitor for resources labelled for monitoring, narrowed to those
    /// created by `agent_id` when given.
    #[must_use]
    pub fn new(watcher: Arc<dyn ClusterWatcher>, agent_id: Option<&str>) -> Self {
        Self {
            watcher,
            selector: labels::monitor_selector(agent_id),
            board: StatusBoard::default(),
            tasks: std::sync::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Return the monitor stored in `slot`, creating it with `init` the first
    /// time. Concurrent callers share a single initialization.
    pub async fn ensure_initialized<F, Fut>(
        slot: &OnceCell<Arc<Self>>,
        init: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Self>>,
    {
        slot.get_or_try_init(|| async { init().await.map(Arc::new) })
            .await
            .map(Arc::clone)
    }

    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Start the watch loops for `namespace` unless they are already running.
    /// Pods are always watched; a custom resource replaces the Job watch.
    pub fn monitor_namespace(&self, namespace: &str, custom_resource: Option<&CustomResource>) {
        if self.shutdown.is_cancelled() {
            warn!(namespace, "Monitor is shut down, not watching namespace");
            return;
        }

        let primary = custom_resource.map_or(WatchedKind::Jobs, |r| WatchedKind::Custom(r.clone()));
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for kind in [WatchedKind::Pods, primary] {
            let key = (namespace.to_string(), kind);
            if tasks.get(&key).is_some_and(|handle| !handle.is_finished()) {
                continue;
            }
            info!(namespace, kind = %key.1, "Starting watch loop");
            let handle = self.spawn_watch(namespace, &key.1);
            tasks.insert(key, handle);
        }
    }

    /// Current status of `job_name`; `unknown` if nothing has been observed.
    pub async fn get_status(&self, job_name: &str) -> Status {
        self.board.get(job_name).await
    }

    /// Number of monitored jobs in each state.
    pub async fn status_count(&self) -> HashMap<State, usize> {
        self.board.counts().await
    }

    /// Namespaces with at least one live watch loop.
    #[must_use]
    pub fn monitored_namespaces(&self) -> Vec<String> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut namespaces: Vec<String> = tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|((namespace, _), _)| namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    /// Stop every watch loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain().collect()
        };
        for ((namespace, kind), handle) in handles {
            if let Err(e) = handle.await {
                warn!(namespace = %namespace, kind = %kind, error = %e, "Watch task did not exit cleanly");
            }
        }
    }

    fn spawn_watch(&self, namespace: &str, kind: &WatchedKind) -> JoinHandle<()> {
        let watch = SafeWatch::with_parent(&self.shutdown);
        let watcher = Arc::clone(&self.watcher);
        let board = self.board.clone();
        let selector = self.selector.clone();
        let namespace = namespace.to_string();
        let kind = kind.clone();

        tokio::spawn(async move {
            let result = match &kind {
                WatchedKind::Pods => watch_pods(watch, watcher, board, &namespace, selector).await,
                WatchedKind::Jobs => watch_jobs(watch, watcher, board, &namespace, selector).await,
                WatchedKind::Custom(resource) => {
                    watch_custom(watch, watcher, board, &namespace, selector, resource.clone())
                        .await
                }
            };
            match result {
                Ok(()) => info!(namespace = %namespace, kind = %kind, "Watch loop stopped"),
                Err(e) => error!(namespace = %namespace, kind = %kind, error = %e, "Watch loop failed"),
            }
        })
    }
}

#[instrument(skip(watch, watcher, board, selector))]
async fn watch_pods(
    watch: SafeWatch,
    watcher: Arc<dyn ClusterWatcher>,
    board: StatusBoard,
    namespace: &str,
    selector: String,
) -> Result<(), WatchError> {
    let ns = namespace.to_string();
    let events = watch.stream(move |version| {
        let watcher = Arc::clone(&watcher);
        let ns = ns.clone();
        let selector = selector.clone();
        async move { watcher.watch_pods(&ns, &selector, version).await }
    });
    let mut events = std::pin::pin!(events);

    while let Some(event) = events.next().await {
        if let WatchEvent::Added(pod) | WatchEvent::Modified(pod) = event? {
            let Some(update) = pod_update(&pod) else {
                continue;
            };
            board
                .observe(
                    &update.job_name,
                    update.controller_uid.as_deref(),
                    update.state,
                    update.message.as_deref(),
                )
                .await;
        }
    }
    Ok(())
}

#[instrument(skip(watch, watcher, board, selector))]
async fn watch_jobs(
    watch: SafeWatch,
    watcher: Arc<dyn ClusterWatcher>,
    board: StatusBoard,
    namespace: &str,
    selector: String,
) -> Result<(), WatchError> {
    let ns = namespace.to_string();
    let events = watch.stream(move |version| {
        let watcher = Arc::clone(&watcher);
        let ns = ns.clone();
        let selector = selector.clone();
        async move { watcher.watch_jobs(&ns, &selector, version).await }
    });
    let mut events = std::pin::pin!(events);

    while let Some(event) = events.next().await {
        let (job, deleted) = match event? {
            WatchEvent::Added(job) | WatchEvent::Modified(job) => (job, false),
            WatchEvent::Deleted(job) => (job, true),
            _ => continue,
        };
        let Some(name) = job.metadata.name.as_deref() else {
            continue;
        };
        let uid = job.metadata.uid.as_deref();
        if deleted {
            board.deleted(name, uid).await;
        } else {
            board.observe(name, uid, job_state(&job), None).await;
        }
    }
    Ok(())
}

#[instrument(skip(watch, watcher, board, selector, resource), fields(resource = %resource))]
async fn watch_custom(
    watch: SafeWatch,
    watcher: Arc<dyn ClusterWatcher>,
    board: StatusBoard,
    namespace: &str,
    selector: String,
    resource: CustomResource,
) -> Result<(), WatchError> {
    let ns = namespace.to_string();
    let events = watch.stream(move |version| {
        let watcher = Arc::clone(&watcher);
        let ns = ns.clone();
        let selector = selector.clone();
        let resource = resource.clone();
        async move { watcher.watch_custom(&ns, &resource, &selector, version).await }
    });
    let mut events = std::pin::pin!(events);

    while let Some(event) = events.next().await {
        let (object, deleted) = match event? {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => (object, false),
            WatchEvent::Deleted(object) => (object, true),
            _ => continue,
        };
        let Some(name) = object.metadata.name.as_deref() else {
            continue;
        };
        let uid = object.metadata.uid.as_deref();
        if deleted {
            board.deleted(name, uid).await;
        } else {
            let state = object.data.get("status").and_then(crd_state);
            board.observe(name, uid, state, None).await;
        }
    }
    Ok(())
}

/// What one pod event says about its job.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PodUpdate {
    job_name: String,
    controller_uid: Option<String>,
    state: Option<State>,
    message: Option<String>,
}

fn pod_update(pod: &Pod) -> Option<PodUpdate> {
    let job_name = labels::label_value(&pod.metadata, labels::LABEL_JOB_NAME)?.to_string();
    let controller_uid = labels::CONTROLLER_UID_LABELS
        .iter()
        .find_map(|key| labels::label_value(&pod.metadata, key))
        .map(str::to_string);
    let status = pod.status.as_ref()?;
    let conditions = status.conditions.as_deref().unwrap_or_default();

    // A pod being evicted can still report phase Running, so this goes first.
    let preempted = conditions.iter().any(|c| {
        c.type_ == "DisruptionTarget"
            && c.reason
                .as_deref()
                .is_some_and(|reason| PREEMPTION_REASONS.contains(&reason))
    });
    let container_creating = status
        .container_statuses
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .any(|reason| reason == "ContainerCreating");

    let state = if preempted {
        Some(State::Preempted)
    } else if status.phase.as_deref() == Some("Running") {
        Some(State::Running)
    } else if container_creating {
        Some(State::Starting)
    } else {
        None
    };

    let message = conditions
        .iter()
        .find(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        })
        .and_then(|c| c.message.clone())
        .filter(|m| !m.is_empty());

    Some(PodUpdate {
        job_name,
        controller_uid,
        state,
        message,
    })
}

fn job_state(job: &Job) -> Option<State> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) >= 1 {
        Some(State::Finished)
    } else if status.failed.unwrap_or(0) >= 1 {
        Some(State::Failed)
    } else {
        None
    }
}

/// State of a custom-resource job from its `status` block. `None` means the
/// object says nothing we recognize and no transition should happen.
fn crd_state(status: &Value) -> Option<State> {
    let decided = match status.get("state") {
        Some(Value::Object(state)) => state
            .get("phase")
            .and_then(Value::as_str)
            .and_then(|phase| CrdPhase::parse(phase).state()),
        _ => match status.get("conditions") {
            Some(Value::Array(conditions)) => state_from_conditions(conditions),
            Some(other) => {
                warn!(conditions = %other, "Unexpected conditions shape on custom resource");
                None
            }
            None => None,
        },
    };
    decided.or_else(|| status.get("ReplicatedJobsStatus").and_then(replicated_state))
}

/// Most recent condition with status "True". Equal timestamps are resolved
/// in favor of the more final state.
fn state_from_conditions(conditions: &[Value]) -> Option<State> {
    conditions
        .iter()
        .filter(|c| c.get("status").and_then(Value::as_str) == Some("True"))
        .filter_map(|c| {
            let phase = CrdPhase::parse(c.get("type")?.as_str()?);
            Some((transition_time(c), phase))
        })
        .max_by(|(time_a, phase_a), (time_b, phase_b)| {
            time_a
                .cmp(time_b)
                .then_with(|| precedence(phase_a.state()).cmp(&precedence(phase_b.state())))
        })
        .and_then(|(_, phase)| phase.state())
}

fn transition_time(condition: &Value) -> Option<DateTime<Utc>> {
    condition
        .get("lastTransitionTime")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|time| time.with_timezone(&Utc))
}

const fn precedence(state: Option<State>) -> u8 {
    match state {
        Some(State::Finished) => 6,
        Some(State::Failed) => 5,
        Some(State::Stopping) => 4,
        Some(State::Running) => 3,
        Some(State::Starting) => 2,
        Some(State::Preempted | State::Unknown) => 1,
        None => 0,
    }
}

/// JobSet reports per-replicated-job pod counts instead of a phase.
fn replicated_state(replicated: &Value) -> Option<State> {
    let count = |field: &str| -> i64 {
        match replicated {
            Value::Object(map) => map.get(field).and_then(Value::as_i64).unwrap_or(0),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_i64))
                .sum(),
            _ => 0,
        }
    };
    if count("ready") >= 1 {
        Some(State::Running)
    } else if count("active") >= 1 {
        Some(State::Starting)
    } else {
        None
    }
}
