//! Orphaned auxiliary resource cleanup.
//!
//! Jobs can leave Services, Deployments, NetworkPolicies and Secrets behind
//! when the agent dies between creating them and creating (or deleting) the
//! primary Job. A periodic cycle finds auxiliary-resource groups whose run is
//! no longer active anywhere and that are old enough to rule out a launch in
//! progress, and deletes them.
//!
//! The only ownership link used is the label pair run-id + auxiliary-resource
//! UUID; names are never interpreted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ConfigError, Result};
use crate::labels;

pub const DEFAULT_MINIMUM_RESOURCE_AGE_SECONDS: u64 = 900;
pub const DEFAULT_MONITORED_NAMESPACES: &str = "default,wandb";
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 300;

pub const ENV_MONITORED_NAMESPACES: &str = "LAUNCH_MONITORED_NAMESPACES";
pub const ENV_MINIMUM_RESOURCE_AGE_SECONDS: &str = "LAUNCH_MINIMUM_RESOURCE_AGE_SECONDS";

/// Kinds that may be created as a job's auxiliary resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuxiliaryKind {
    Service,
    Deployment,
    NetworkPolicy,
    Secret,
}

impl AuxiliaryKind {
    pub const ALL: [Self; 4] = [
        Self::Service,
        Self::Deployment,
        Self::NetworkPolicy,
        Self::Secret,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "Service",
            Self::Deployment => "Deployment",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::Secret => "Secret",
        }
    }

    /// Kind named by a manifest's `kind` field.
    #[must_use]
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for AuxiliaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one listed auxiliary resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledResource {
    pub kind: AuxiliaryKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl LabeledResource {
    #[must_use]
    pub fn from_meta(kind: AuxiliaryKind, meta: &ObjectMeta) -> Self {
        Self {
            kind,
            name: meta.name.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            created_at: labels::creation_time(meta),
        }
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Cluster calls used by the cleanup cycle.
#[async_trait]
pub trait ClusterResources: Send + Sync {
    /// Run ids carried by primary Jobs in `namespace`.
    async fn primary_run_ids(&self, namespace: &str) -> Result<HashSet<String>>;

    async fn list_auxiliary(
        &self,
        namespace: &str,
        kind: AuxiliaryKind,
        selector: &str,
    ) -> Result<Vec<LabeledResource>>;

    /// Delete with background propagation. Already-gone resources are not an error.
    async fn delete(&self, namespace: &str, kind: AuxiliaryKind, name: &str) -> Result<()>;
}

/// Run ids the agent has decided to launch but that may not exist in the
/// cluster yet.
#[async_trait]
pub trait ActiveRunSource: Send + Sync {
    async fn active_run_ids(&self) -> HashSet<String>;
}

/// [`ClusterResources`] backed by the API server.
#[derive(Clone)]
pub struct KubeClusterResources {
    client: Client,
}

impl KubeClusterResources {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_labeled<K>(
        &self,
        namespace: &str,
        kind: AuxiliaryKind,
        selector: &str,
    ) -> Result<Vec<LabeledResource>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list_metadata(&ListParams::default().labels(selector))
            .await?;
        Ok(list
            .items
            .iter()
            .map(|item| LabeledResource::from_meta(kind, &item.metadata))
            .collect())
    }

    async fn delete_named<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace, name, "Resource already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterResources for KubeClusterResources {
    async fn primary_run_ids(&self, namespace: &str) -> Result<HashSet<String>> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let list = jobs
            .list_metadata(&ListParams::default().labels(&labels::primary_selector()))
            .await?;
        Ok(list
            .items
            .iter()
            .filter_map(|job| labels::label_value(&job.metadata, labels::LABEL_RUN_ID))
            .map(str::to_string)
            .collect())
    }

    async fn list_auxiliary(
        &self,
        namespace: &str,
        kind: AuxiliaryKind,
        selector: &str,
    ) -> Result<Vec<LabeledResource>> {
        match kind {
            AuxiliaryKind::Service => self.list_labeled::<Service>(namespace, kind, selector).await,
            AuxiliaryKind::Deployment => {
                self.list_labeled::<Deployment>(namespace, kind, selector)
                    .await
            }
            AuxiliaryKind::NetworkPolicy => {
                self.list_labeled::<NetworkPolicy>(namespace, kind, selector)
                    .await
            }
            AuxiliaryKind::Secret => self.list_labeled::<Secret>(namespace, kind, selector).await,
        }
    }

    async fn delete(&self, namespace: &str, kind: AuxiliaryKind, name: &str) -> Result<()> {
        match kind {
            AuxiliaryKind::Service => self.delete_named::<Service>(namespace, name).await,
            AuxiliaryKind::Deployment => self.delete_named::<Deployment>(namespace, name).await,
            AuxiliaryKind::NetworkPolicy => {
                self.delete_named::<NetworkPolicy>(namespace, name).await
            }
            AuxiliaryKind::Secret => self.delete_named::<Secret>(namespace, name).await,
        }
    }
}

/// Live run ids for a namespace, or `Unknown` when the cluster could not
/// be asked. `Unknown` must never be read as "nothing is active".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveRunIds {
    Known(HashSet<String>),
    Unknown,
}

impl ActiveRunIds {
    #[must_use]
    pub fn contains(&self, run_id: &str) -> bool {
        match self {
            Self::Known(ids) => ids.contains(run_id),
            Self::Unknown => true,
        }
    }
}

/// Cleanup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCleanupConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(
        default = "default_minimum_resource_age_seconds",
        alias = "minimumResourceAgeSeconds"
    )]
    pub minimum_resource_age_seconds: u64,

    /// Accepts a comma-separated string or a list.
    #[serde(
        default = "default_monitored_namespaces",
        alias = "monitoredNamespaces",
        deserialize_with = "deserialize_namespaces"
    )]
    pub monitored_namespaces: Vec<String>,

    #[serde(default = "default_interval_seconds", alias = "intervalSeconds")]
    pub interval_seconds: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_minimum_resource_age_seconds() -> u64 {
    DEFAULT_MINIMUM_RESOURCE_AGE_SECONDS
}

fn default_monitored_namespaces() -> Vec<String> {
    parse_namespaces(DEFAULT_MONITORED_NAMESPACES)
}

fn default_interval_seconds() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECONDS
}

fn deserialize_namespaces<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Namespaces {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Namespaces::deserialize(deserializer)? {
        Namespaces::Joined(raw) => parse_namespaces(&raw),
        Namespaces::List(items) => parse_namespaces(&items.join(",")),
    })
}

/// Split a comma-separated namespace list, dropping blanks.
#[must_use]
pub fn parse_namespaces(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for ResourceCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            minimum_resource_age_seconds: default_minimum_resource_age_seconds(),
            monitored_namespaces: default_monitored_namespaces(),
            interval_seconds: default_interval_seconds(),
        }
    }
}

impl ResourceCleanupConfig {
    /// Apply `LAUNCH_MONITORED_NAMESPACES` and
    /// `LAUNCH_MINIMUM_RESOURCE_AGE_SECONDS` when set.
    pub fn apply_env(&mut self) -> std::result::Result<(), ConfigError> {
        if let Ok(raw) = std::env::var(ENV_MONITORED_NAMESPACES) {
            self.monitored_namespaces = parse_namespaces(&raw);
        }
        if let Ok(raw) = std::env::var(ENV_MINIMUM_RESOURCE_AGE_SECONDS) {
            self.minimum_resource_age_seconds =
                raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: ENV_MINIMUM_RESOURCE_AGE_SECONDS,
                    value: raw.clone(),
                })?;
        }
        Ok(())
    }

    #[must_use]
    pub fn minimum_resource_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.minimum_resource_age_seconds).unwrap_or(i64::MAX))
    }
}

/// Outcome of one cleanup cycle in one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceReport {
    pub namespace: String,
    /// Active runs could not be determined, so nothing was considered
    pub skipped: bool,
    pub orphaned: Vec<String>,
    pub deleted: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub namespaces: Vec<NamespaceReport>,
}

impl CleanupReport {
    #[must_use]
    pub fn total_deleted(&self) -> usize {
        self.namespaces.iter().map(|ns| ns.deleted).sum()
    }
}

/// Auxiliary UUIDs that are safe to delete.
///
/// A UUID qualifies only if every resource carrying it has a run-id, none of
/// those run ids is active, and every one of them is at least `min_age` old.
/// Resources without a creation timestamp count as brand new.
#[must_use]
pub fn orphaned_uuids(
    resources: &[LabeledResource],
    active: &ActiveRunIds,
    now: DateTime<Utc>,
    min_age: chrono::Duration,
) -> Vec<String> {
    if matches!(active, ActiveRunIds::Unknown) {
        return Vec::new();
    }

    let mut groups: HashMap<&str, Vec<&LabeledResource>> = HashMap::new();
    for resource in resources {
        if let Some(uuid) = resource.label(labels::LABEL_AUXILIARY_RESOURCE) {
            groups.entry(uuid).or_default().push(resource);
        }
    }

    let mut orphaned: Vec<String> = groups
        .into_iter()
        .filter(|(_, members)| {
            members.iter().all(|member| {
                let Some(run_id) = member.label(labels::LABEL_RUN_ID) else {
                    return false;
                };
                let old_enough = member
                    .created_at
                    .is_some_and(|created| now - created >= min_age);
                !active.contains(run_id) && old_enough
            })
        })
        .map(|(uuid, _)| uuid.to_string())
        .collect();
    orphaned.sort();
    orphaned
}

/// Periodic garbage collector for auxiliary resources.
pub struct ResourceCleanup {
    resources: Arc<dyn ClusterResources>,
    active_runs: Arc<dyn ActiveRunSource>,
    config: ResourceCleanupConfig,
}

impl Debug for ResourceCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCleanup")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResourceCleanup {
    #[must_use]
    pub fn new(
        resources: Arc<dyn ClusterResources>,
        active_runs: Arc<dyn ActiveRunSource>,
        config: ResourceCleanupConfig,
    ) -> Self {
        Self {
            resources,
            active_runs,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ResourceCleanupConfig {
        &self.config
    }

    /// Primary Job run ids in `namespace` plus the runs the agent is
    /// dispatching right now.
    pub async fn active_run_ids(&self, namespace: &str) -> ActiveRunIds {
        match self.resources.primary_run_ids(namespace).await {
            Ok(mut ids) => {
                ids.extend(self.active_runs.active_run_ids().await);
                ActiveRunIds::Known(ids)
            }
            Err(e) => {
                warn!(namespace, error = %e, "Failed to list primary jobs, skipping cleanup");
                ActiveRunIds::Unknown
            }
        }
    }

    /// Orphaned UUIDs in `namespace`. Empty when `active` is unknown.
    pub async fn find_orphaned_uuids(
        &self,
        namespace: &str,
        active: &ActiveRunIds,
    ) -> Result<Vec<String>> {
        if matches!(active, ActiveRunIds::Unknown) {
            return Ok(Vec::new());
        }

        let mut resources = Vec::new();
        for kind in AuxiliaryKind::ALL {
            resources.extend(
                self.resources
                    .list_auxiliary(namespace, kind, labels::auxiliary_presence_selector())
                    .await?,
            );
        }
        Ok(orphaned_uuids(
            &resources,
            active,
            Utc::now(),
            self.config.minimum_resource_age(),
        ))
    }

    /// Delete every resource of every auxiliary kind carrying `uuid`.
    /// Returns the number deleted and the failures encountered.
    pub async fn delete_auxiliary_group(&self, namespace: &str, uuid: &str) -> (usize, Vec<String>) {
        let selector = labels::auxiliary_selector(uuid);
        let mut deleted = 0;
        let mut errors = Vec::new();

        for kind in AuxiliaryKind::ALL {
            let members = match self.resources.list_auxiliary(namespace, kind, &selector).await {
                Ok(members) => members,
                Err(e) => {
                    errors.push(format!("list {kind} for {uuid}: {e}"));
                    continue;
                }
            };
            for member in members {
                match self.resources.delete(namespace, kind, &member.name).await {
                    Ok(()) => {
                        info!(namespace, kind = %kind, name = %member.name, uuid, "Deleted orphaned resource");
                        deleted += 1;
                    }
                    Err(e) => errors.push(format!("delete {kind} {}: {e}", member.name)),
                }
            }
        }
        (deleted, errors)
    }

    async fn clean_namespace(&self, namespace: &str) -> NamespaceReport {
        let mut report = NamespaceReport {
            namespace: namespace.to_string(),
            ..Default::default()
        };

        let active = self.active_run_ids(namespace).await;
        if matches!(active, ActiveRunIds::Unknown) {
            report.skipped = true;
            return report;
        }

        report.orphaned = match self.find_orphaned_uuids(namespace, &active).await {
            Ok(orphaned) => orphaned,
            Err(e) => {
                warn!(namespace, error = %e, "Failed to list auxiliary resources");
                report.skipped = true;
                report.errors.push(e.to_string());
                return report;
            }
        };

        for uuid in &report.orphaned {
            let (deleted, errors) = self.delete_auxiliary_group(namespace, uuid).await;
            report.deleted += deleted;
            report.errors.extend(errors);
        }
        report
    }

    /// One pass over every monitored namespace. Namespaces are handled
    /// independently; a failure in one never stops the others.
    #[instrument(skip(self))]
    pub async fn run_cleanup_cycle(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for namespace in &self.config.monitored_namespaces {
            let ns_report = self.clean_namespace(namespace).await;
            for err in &ns_report.errors {
                error!(namespace = %namespace, error = %err, "Cleanup error");
            }
            report.namespaces.push(ns_report);
        }
        debug!(deleted = report.total_deleted(), "Cleanup cycle complete");
        report
    }

    /// Run cleanup cycles on the configured interval until `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Resource cleanup disabled");
            return;
        }

        info!(
            namespaces = ?self.config.monitored_namespaces,
            interval_secs = self.config.interval_seconds,
            "Starting resource cleanup"
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_seconds.max(1)));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.run_cleanup_cycle().await;
                }
            }
        }
        info!("Resource cleanup stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchError;
    use serial_test::serial;
    use std::sync::Mutex;

    const MIN_AGE: i64 = 900;

    #[derive(Default)]
    struct FakeResources {
        primary: Mutex<HashMap<String, Option<HashSet<String>>>>,
        auxiliary: Mutex<HashMap<String, Vec<LabeledResource>>>,
        deleted: Mutex<Vec<(String, AuxiliaryKind, String)>>,
    }

    impl FakeResources {
        fn with_primary(self, namespace: &str, run_ids: Option<&[&str]>) -> Self {
            self.primary.lock().unwrap().insert(
                namespace.to_string(),
                run_ids.map(|ids| ids.iter().map(|id| (*id).to_string()).collect()),
            );
            self
        }

        fn with_resource(self, namespace: &str, resource: LabeledResource) -> Self {
            self.auxiliary
                .lock()
                .unwrap()
                .entry(namespace.to_string())
                .or_default()
                .push(resource);
            self
        }

        fn deleted_names(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .deleted
                .lock()
                .unwrap()
                .iter()
                .map(|(ns, kind, name)| format!("{ns}/{kind}/{name}"))
                .collect();
            names.sort();
            names
        }
    }

    fn matches_selector(resource: &LabeledResource, selector: &str) -> bool {
        match selector.split_once('=') {
            Some((key, value)) => resource.labels.get(key).map(String::as_str) == Some(value),
            None => resource.labels.contains_key(selector),
        }
    }

    #[async_trait]
    impl ClusterResources for FakeResources {
        async fn primary_run_ids(&self, namespace: &str) -> Result<HashSet<String>> {
            match self.primary.lock().unwrap().get(namespace) {
                Some(Some(ids)) => Ok(ids.clone()),
                Some(None) => Err(LaunchError::Runner("jobs list timed out".into())),
                None => Ok(HashSet::new()),
            }
        }

        async fn list_auxiliary(
            &self,
            namespace: &str,
            kind: AuxiliaryKind,
            selector: &str,
        ) -> Result<Vec<LabeledResource>> {
            let deleted = self.deleted.lock().unwrap().clone();
            Ok(self
                .auxiliary
                .lock()
                .unwrap()
                .get(namespace)
                .into_iter()
                .flatten()
                .filter(|r| r.kind == kind && matches_selector(r, selector))
                .filter(|r| {
                    !deleted
                        .iter()
                        .any(|(ns, k, name)| ns == namespace && *k == r.kind && *name == r.name)
                })
                .cloned()
                .collect())
        }

        async fn delete(&self, namespace: &str, kind: AuxiliaryKind, name: &str) -> Result<()> {
            self.deleted
                .lock()
                .unwrap()
                .push((namespace.to_string(), kind, name.to_string()));
            Ok(())
        }
    }

    struct FakeActiveRuns(HashSet<String>);

    #[async_trait]
    impl ActiveRunSource for FakeActiveRuns {
        async fn active_run_ids(&self) -> HashSet<String> {
            self.0.clone()
        }
    }

    fn aux(
        kind: AuxiliaryKind,
        name: &str,
        run_id: Option<&str>,
        uuid: &str,
        age_secs: i64,
    ) -> LabeledResource {
        let mut labels = BTreeMap::from([
            (labels::LABEL_AUXILIARY_RESOURCE.to_string(), uuid.to_string()),
            (
                labels::LABEL_RESOURCE_ROLE.to_string(),
                labels::ROLE_AUXILIARY.to_string(),
            ),
        ]);
        if let Some(run_id) = run_id {
            labels.insert(labels::LABEL_RUN_ID.to_string(), run_id.to_string());
        }
        LabeledResource {
            kind,
            name: name.to_string(),
            labels,
            created_at: Some(Utc::now() - chrono::Duration::seconds(age_secs)),
        }
    }

    fn config(namespaces: &str) -> ResourceCleanupConfig {
        ResourceCleanupConfig {
            monitored_namespaces: parse_namespaces(namespaces),
            ..Default::default()
        }
    }

    fn cleanup(resources: &Arc<FakeResources>, active: &[&str], namespaces: &str) -> ResourceCleanup {
        ResourceCleanup::new(
            resources.clone(),
            Arc::new(FakeActiveRuns(
                active.iter().map(|id| (*id).to_string()).collect(),
            )),
            config(namespaces),
        )
    }

    #[test]
    fn young_resources_are_never_orphaned() {
        let now = Utc::now();
        let resources = vec![aux(AuxiliaryKind::Service, "svc", Some("run-1"), "u1", MIN_AGE - 1)];
        let active = ActiveRunIds::Known(HashSet::new());
        assert!(orphaned_uuids(&resources, &active, now, chrono::Duration::seconds(MIN_AGE)).is_empty());
    }

    #[test]
    fn every_member_of_a_group_must_qualify() {
        let now = Utc::now();
        let min_age = chrono::Duration::seconds(MIN_AGE);
        let active = ActiveRunIds::Known(HashSet::from(["run-live".to_string()]));

        let resources = vec![
            aux(AuxiliaryKind::Service, "a-svc", Some("run-1"), "a", 2 * MIN_AGE),
            aux(AuxiliaryKind::Secret, "a-secret", Some("run-1"), "a", 2 * MIN_AGE),
            // second member is still young
            aux(AuxiliaryKind::Service, "b-svc", Some("run-2"), "b", 2 * MIN_AGE),
            aux(AuxiliaryKind::Secret, "b-secret", Some("run-2"), "b", 10),
            // run still active
            aux(AuxiliaryKind::Service, "c-svc", Some("run-live"), "c", 2 * MIN_AGE),
            // missing run id
            aux(AuxiliaryKind::Service, "d-svc", None, "d", 2 * MIN_AGE),
        ];
        assert_eq!(orphaned_uuids(&resources, &active, now, min_age), vec!["a"]);
        assert!(orphaned_uuids(&resources, &ActiveRunIds::Unknown, now, min_age).is_empty());
    }

    #[test]
    fn missing_creation_time_counts_as_new() {
        let mut resource = aux(AuxiliaryKind::Service, "svc", Some("run-1"), "u1", 2 * MIN_AGE);
        resource.created_at = None;
        let active = ActiveRunIds::Known(HashSet::new());
        assert!(orphaned_uuids(
            &[resource],
            &active,
            Utc::now(),
            chrono::Duration::seconds(MIN_AGE)
        )
        .is_empty());
    }

    #[tokio::test]
    async fn cycle_deletes_every_kind_in_an_orphaned_group() {
        let resources = Arc::new(
            FakeResources::default()
                .with_primary("default", Some(&["run-job"]))
                .with_resource("default", aux(AuxiliaryKind::Service, "old-svc", Some("run-gone"), "u-old", 3600))
                .with_resource("default", aux(AuxiliaryKind::Deployment, "old-deploy", Some("run-gone"), "u-old", 3600))
                .with_resource("default", aux(AuxiliaryKind::NetworkPolicy, "old-np", Some("run-gone"), "u-old", 3600))
                .with_resource("default", aux(AuxiliaryKind::Secret, "job-secret", Some("run-job"), "u-job", 3600))
                .with_resource("default", aux(AuxiliaryKind::Secret, "agent-secret", Some("run-dispatching"), "u-agent", 3600))
                .with_resource("default", aux(AuxiliaryKind::Service, "new-svc", Some("run-new"), "u-new", 30)),
        );
        let gc = cleanup(&resources, &["run-dispatching"], "default");

        let report = gc.run_cleanup_cycle().await;

        assert_eq!(report.namespaces.len(), 1);
        assert_eq!(report.namespaces[0].orphaned, vec!["u-old"]);
        assert_eq!(report.total_deleted(), 3);
        assert_eq!(
            resources.deleted_names(),
            vec![
                "default/Deployment/old-deploy",
                "default/NetworkPolicy/old-np",
                "default/Service/old-svc",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_active_runs_skip_only_that_namespace() {
        let resources = Arc::new(
            FakeResources::default()
                .with_primary("default", None)
                .with_resource("default", aux(AuxiliaryKind::Service, "svc-a", Some("run-a"), "ua", 3600))
                .with_resource("wandb", aux(AuxiliaryKind::Service, "svc-b", Some("run-b"), "ub", 3600)),
        );
        let gc = cleanup(&resources, &[], " default, ,wandb ");

        let report = gc.run_cleanup_cycle().await;

        assert!(report.namespaces[0].skipped);
        assert_eq!(report.namespaces[0].deleted, 0);
        assert!(!report.namespaces[1].skipped);
        assert_eq!(resources.deleted_names(), vec!["wandb/Service/svc-b"]);
    }

    #[tokio::test]
    async fn active_ids_union_cluster_and_agent() {
        let resources = Arc::new(FakeResources::default().with_primary("ml", Some(&["run-1"])));
        let gc = cleanup(&resources, &["run-2"], "ml");

        let ActiveRunIds::Known(ids) = gc.active_run_ids("ml").await else {
            panic!("expected known run ids");
        };
        assert_eq!(ids, HashSet::from(["run-1".to_string(), "run-2".to_string()]));
    }

    #[test]
    fn config_defaults_and_namespace_parsing() {
        let config = ResourceCleanupConfig::default();
        assert_eq!(config.minimum_resource_age_seconds, 900);
        assert_eq!(config.monitored_namespaces, vec!["default", "wandb"]);
        assert!(config.enabled);

        let yaml = "monitored_namespaces: ' ml , ,research,'\nminimum_resource_age_seconds: 60\n";
        let parsed: ResourceCleanupConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.monitored_namespaces, vec!["ml", "research"]);
        assert_eq!(parsed.minimum_resource_age_seconds, 60);

        let listed: ResourceCleanupConfig =
            serde_yaml::from_str("monitoredNamespaces: [ml, ' ']\n").unwrap();
        assert_eq!(listed.monitored_namespaces, vec!["ml"]);
    }

    #[test]
    #[serial]
    fn env_overrides_cleanup_settings() {
        std::env::set_var(ENV_MONITORED_NAMESPACES, "team-a,team-b");
        std::env::set_var(ENV_MINIMUM_RESOURCE_AGE_SECONDS, "1200");
        let mut config = ResourceCleanupConfig::default();
        let result = config.apply_env();
        std::env::remove_var(ENV_MONITORED_NAMESPACES);
        std::env::remove_var(ENV_MINIMUM_RESOURCE_AGE_SECONDS);

        result.unwrap();
        assert_eq!(config.monitored_namespaces, vec!["team-a", "team-b"]);
        assert_eq!(config.minimum_resource_age_seconds, 1200);
    }

    #[test]
    #[serial]
    fn invalid_age_env_is_rejected() {
        std::env::set_var(ENV_MINIMUM_RESOURCE_AGE_SECONDS, "fifteen minutes");
        let result = ResourceCleanupConfig::default().apply_env();
        std::env::remove_var(ENV_MINIMUM_RESOURCE_AGE_SECONDS);

        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv {
                var: ENV_MINIMUM_RESOURCE_AGE_SECONDS,
                ..
            })
        ));
    }
}
