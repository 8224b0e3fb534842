//! Kubernetes runner: turns a launch spec into a labelled `batch/v1` Job plus
//! optional auxiliary resources, and tracks it through the job monitor.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, Secret, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::cluster::cleanup::{AuxiliaryKind, ClusterResources, KubeClusterResources};
use crate::cluster::monitor::{ClusterJobMonitor, KubeWatcher};
use crate::error::{LaunchError, Result};
use crate::labels;
use crate::queue::LaunchSpec;
use crate::runner::{Runner, SubmittedRun};
use crate::status::{State, Status};

pub const BACKEND_NAME: &str = "kubernetes";

/// Key in `resource_args.kubernetes` listing auxiliary manifests.
const AUXILIARY_KEY: &str = "auxiliary";
/// Key in `resource_args.kubernetes` overriding the target namespace.
const NAMESPACE_KEY: &str = "namespace";

const DEFAULT_CONTAINER_NAME: &str = "launch";
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_NAME_LEN: usize = 63;

/// Lazily created monitor shared by every run this process submits.
pub type MonitorSlot = Arc<OnceCell<Arc<ClusterJobMonitor>>>;

pub struct KubernetesRunner {
    client: Client,
    resources: KubeClusterResources,
    monitor: MonitorSlot,
    agent_id: String,
    default_namespace: String,
}

impl Debug for KubernetesRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubernetesRunner")
            .field("agent_id", &self.agent_id)
            .field("default_namespace", &self.default_namespace)
            .finish_non_exhaustive()
    }
}

impl KubernetesRunner {
    #[must_use]
    pub fn new(client: Client, monitor: MonitorSlot, agent_id: &str, default_namespace: &str) -> Self {
        Self {
            resources: KubeClusterResources::new(client.clone()),
            client,
            monitor,
            agent_id: agent_id.to_string(),
            default_namespace: default_namespace.to_string(),
        }
    }

    async fn monitor(&self) -> Result<Arc<ClusterJobMonitor>> {
        let client = self.client.clone();
        let agent_id = self.agent_id.clone();
        ClusterJobMonitor::ensure_initialized(&self.monitor, || async move {
            Ok(ClusterJobMonitor::new(
                Arc::new(KubeWatcher::new(client)),
                Some(agent_id.as_str()),
            ))
        })
        .await
    }

    async fn create<K>(&self, namespace: &str, manifest: Value) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let object: K = serde_json::from_value(manifest)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &object).await?;
        Ok(())
    }

    async fn create_auxiliary(&self, namespace: &str, kind: AuxiliaryKind, manifest: Value) -> Result<()> {
        match kind {
            AuxiliaryKind::Service => self.create::<Service>(namespace, manifest).await,
            AuxiliaryKind::Deployment => self.create::<Deployment>(namespace, manifest).await,
            AuxiliaryKind::NetworkPolicy => self.create::<NetworkPolicy>(namespace, manifest).await,
            AuxiliaryKind::Secret => self.create::<Secret>(namespace, manifest).await,
        }
    }
}

#[async_trait]
impl Runner for KubernetesRunner {
    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    #[instrument(skip(self, spec), fields(run_id = ?spec.run_id))]
    async fn run(&self, spec: &LaunchSpec) -> Result<Option<Arc<dyn SubmittedRun>>> {
        let run_id = spec
            .run_id
            .clone()
            .ok_or_else(|| LaunchError::Runner("launch spec has no run id".to_string()))?;
        let args = match spec.resource_args_for(BACKEND_NAME) {
            Some(Value::Object(args)) => args.clone(),
            Some(other) => {
                return Err(LaunchError::Runner(format!(
                    "resource_args.{BACKEND_NAME} must be an object, got {other}"
                )))
            }
            None => Map::new(),
        };

        let namespace = target_namespace(&args).unwrap_or_else(|| self.default_namespace.clone());
        let aux_uuid = uuid::Uuid::new_v4().to_string();
        let job = build_job(spec, &args, &run_id, &aux_uuid, &self.agent_id)?;
        let job_name = job.metadata.name.clone().unwrap_or_default();
        let auxiliary = build_auxiliary(&args, &job_name, &run_id, &aux_uuid, &self.agent_id)?;

        // Auxiliary resources go first so a crash in between leaves only
        // labelled leftovers for the cleanup cycle.
        for (kind, manifest) in auxiliary {
            self.create_auxiliary(&namespace, kind, manifest).await?;
        }

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = jobs.create(&PostParams::default(), &job).await {
            warn!(namespace = %namespace, job_name = %job_name, error = %e, "Job creation failed, removing auxiliary resources");
            let (_, errors) = delete_auxiliary(&self.resources, &namespace, &aux_uuid).await;
            for err in errors {
                warn!(namespace = %namespace, error = %err, "Failed to remove auxiliary resource");
            }
            return Err(e.into());
        }
        info!(namespace = %namespace, job_name = %job_name, "Created Kubernetes job");

        let monitor = self.monitor().await?;
        monitor.monitor_namespace(&namespace, None);

        Ok(Some(Arc::new(KubernetesSubmittedRun {
            name: job_name,
            namespace,
            aux_uuid,
            client: self.client.clone(),
            resources: self.resources.clone(),
            monitor,
        })))
    }
}

/// A Job submitted by [`KubernetesRunner`].
pub struct KubernetesSubmittedRun {
    name: String,
    namespace: String,
    aux_uuid: String,
    client: Client,
    resources: KubeClusterResources,
    monitor: Arc<ClusterJobMonitor>,
}

impl Debug for KubernetesSubmittedRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubernetesSubmittedRun")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("aux_uuid", &self.aux_uuid)
            .finish_non_exhaustive()
    }
}

impl KubernetesSubmittedRun {
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl SubmittedRun for KubernetesSubmittedRun {
    fn id(&self) -> &str {
        &self.name
    }

    async fn get_status(&self) -> Result<Status> {
        Ok(self.monitor.get_status(&self.name).await)
    }

    async fn get_logs(&self) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("{}={}", labels::LABEL_JOB_NAME, self.name);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        let Some(pod_name) = list.items.first().and_then(|pod| pod.metadata.name.clone()) else {
            return Ok(None);
        };

        match pods.logs(&pod_name, &LogParams::default()).await {
            Ok(logs) => Ok(Some(logs)),
            // 400 while the container is still being created
            Err(kube::Error::Api(e)) if e.code == 404 || e.code == 400 => {
                debug!(pod = %pod_name, reason = %e.message, "Logs unavailable");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(job_name = %self.name, namespace = %self.namespace))]
    async fn cancel(&self) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        match jobs.delete(&self.name, &DeleteParams::background()).await {
            Ok(_) => info!("Deleted job"),
            Err(kube::Error::Api(e)) if e.code == 404 => debug!("Job already deleted"),
            Err(e) => return Err(e.into()),
        }

        let (deleted, errors) = delete_auxiliary(&self.resources, &self.namespace, &self.aux_uuid).await;
        debug!(deleted, "Deleted auxiliary resources");
        if let Some(first) = errors.into_iter().next() {
            return Err(LaunchError::Runner(first));
        }
        Ok(())
    }

    async fn wait(&self) -> Result<bool> {
        loop {
            let status = self.get_status().await?;
            if status.state.is_terminal() {
                return Ok(status.state == State::Finished);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

async fn delete_auxiliary(
    resources: &KubeClusterResources,
    namespace: &str,
    aux_uuid: &str,
) -> (usize, Vec<String>) {
    let selector = labels::auxiliary_selector(aux_uuid);
    let mut deleted = 0;
    let mut errors = Vec::new();
    for kind in AuxiliaryKind::ALL {
        match resources.list_auxiliary(namespace, kind, &selector).await {
            Ok(members) => {
                for member in members {
                    match resources.delete(namespace, kind, &member.name).await {
                        Ok(()) => deleted += 1,
                        Err(e) => errors.push(format!("delete {kind} {}: {e}", member.name)),
                    }
                }
            }
            Err(e) => errors.push(format!("list {kind}: {e}")),
        }
    }
    (deleted, errors)
}

fn target_namespace(args: &Map<String, Value>) -> Option<String> {
    args.get(NAMESPACE_KEY)
        .or_else(|| args.get("metadata").and_then(|m| m.get("namespace")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
}

/// DNS-1123 label derived from a run id.
fn job_name_for(run_id: &str) -> String {
    let mut name: String = format!("launch-{run_id}")
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

fn primary_labels(run_id: &str, aux_uuid: &str, agent_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::LABEL_RUN_ID.to_string(), run_id.to_string()),
        (labels::LABEL_AGENT.to_string(), agent_id.to_string()),
        (labels::LABEL_MONITOR.to_string(), "true".to_string()),
        (labels::LABEL_RESOURCE_ROLE.to_string(), labels::ROLE_PRIMARY.to_string()),
        (labels::LABEL_AUXILIARY_RESOURCE.to_string(), aux_uuid.to_string()),
    ])
}

/// Build the Job for `spec` from the `resource_args.kubernetes` manifest.
pub fn build_job(
    spec: &LaunchSpec,
    args: &Map<String, Value>,
    run_id: &str,
    aux_uuid: &str,
    agent_id: &str,
) -> Result<Job> {
    let mut manifest = args.clone();
    manifest.remove(AUXILIARY_KEY);
    manifest.remove(NAMESPACE_KEY);
    manifest.insert("apiVersion".to_string(), json!("batch/v1"));
    manifest.insert("kind".to_string(), json!("Job"));
    let mut job: Job = serde_json::from_value(Value::Object(manifest))?;

    let name = job
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| job_name_for(run_id));
    job.metadata.name = Some(name);
    job.metadata.generate_name = None;
    job.metadata.namespace = None;
    job.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(primary_labels(run_id, aux_uuid, agent_id));

    let job_spec = job.spec.get_or_insert_with(JobSpec::default);
    job_spec.backoff_limit.get_or_insert(0);

    // Pods must carry the monitor labels so the pod watch sees them.
    job_spec
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend([
            (labels::LABEL_RUN_ID.to_string(), run_id.to_string()),
            (labels::LABEL_AGENT.to_string(), agent_id.to_string()),
            (labels::LABEL_MONITOR.to_string(), "true".to_string()),
        ]);

    let pod_spec = job_spec.template.spec.get_or_insert_with(PodSpec::default);
    pod_spec.restart_policy.get_or_insert_with(|| "Never".to_string());
    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(Container {
            name: DEFAULT_CONTAINER_NAME.to_string(),
            ..Default::default()
        });
    }

    let Some(container) = pod_spec.containers.first_mut() else {
        return Err(LaunchError::Runner("job has no containers".to_string()));
    };
    if let Some(image) = spec.image() {
        container.image = Some(image.to_string());
    }
    if container.image.is_none() {
        return Err(LaunchError::Runner(
            "no image given for the kubernetes job".to_string(),
        ));
    }
    if let Some(entry_point) = &spec.overrides.entry_point {
        container.command = Some(entry_point.clone());
    }
    if !spec.overrides.args.is_empty() {
        container.args = Some(spec.overrides.args.clone());
    }

    let env = container.env.get_or_insert_with(Vec::new);
    let run_env = [
        ("WANDB_RUN_ID", Some(run_id)),
        ("WANDB_PROJECT", spec.project.as_deref()),
        ("WANDB_ENTITY", spec.entity.as_deref()),
    ];
    for (key, value) in run_env {
        let Some(value) = value else { continue };
        if env.iter().any(|var| var.name == key) {
            continue;
        }
        env.push(EnvVar {
            name: key.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        });
    }

    Ok(job)
}

/// Labelled auxiliary manifests from `resource_args.kubernetes.auxiliary`.
pub fn build_auxiliary(
    args: &Map<String, Value>,
    job_name: &str,
    run_id: &str,
    aux_uuid: &str,
    agent_id: &str,
) -> Result<Vec<(AuxiliaryKind, Value)>> {
    let Some(items) = args.get(AUXILIARY_KEY) else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = items else {
        return Err(LaunchError::Runner(format!(
            "{AUXILIARY_KEY} must be a list of manifests"
        )));
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut manifest = item.clone();
            let kind_name = manifest
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let kind = AuxiliaryKind::from_kind(&kind_name).ok_or_else(|| {
                LaunchError::Runner(format!("unsupported auxiliary resource kind {kind_name:?}"))
            })?;
            let Some(object) = manifest.as_object_mut() else {
                return Err(LaunchError::Runner("auxiliary manifest must be an object".to_string()));
            };

            let metadata = object
                .entry("metadata")
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .ok_or_else(|| LaunchError::Runner("metadata must be an object".to_string()))?;
            metadata.remove("namespace");
            if metadata.get("name").and_then(Value::as_str).is_none() {
                let name = format!("{job_name}-{}-{index}", kind_name.to_ascii_lowercase());
                metadata.insert("name".to_string(), json!(name));
            }
            let label_map = metadata
                .entry("labels")
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .ok_or_else(|| LaunchError::Runner("labels must be an object".to_string()))?;
            for (key, value) in [
                (labels::LABEL_RUN_ID, run_id),
                (labels::LABEL_AGENT, agent_id),
                (labels::LABEL_RESOURCE_ROLE, labels::ROLE_AUXILIARY),
                (labels::LABEL_AUXILIARY_RESOURCE, aux_uuid),
            ] {
                label_map.insert(key.to_string(), json!(value));
            }
            Ok((kind, manifest))
        })
        .collect()
}
