//! Shared label keys and selector helpers (run linkage, monitoring, GC)

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Label that stores the run id of the job a resource belongs to
pub const LABEL_RUN_ID: &str = "launch.5dlabs.com/run-id";
/// Label that identifies the agent instance that created a resource
pub const LABEL_AGENT: &str = "launch.5dlabs.com/agent";
/// Label that opts a resource into the job monitor's watch streams
pub const LABEL_MONITOR: &str = "launch.5dlabs.com/monitor";
/// Label that classifies a resource as primary (the job) or auxiliary
pub const LABEL_RESOURCE_ROLE: &str = "launch.5dlabs.com/resource-role";
/// Label shared by every auxiliary resource created for one job
pub const LABEL_AUXILIARY_RESOURCE: &str = "launch.5dlabs.com/auxiliary-resource";
/// Label set by the Job controller on the pods it creates
pub const LABEL_JOB_NAME: &str = "job-name";
/// Labels the Job controller uses to link its pods to the Job's uid
pub const CONTROLLER_UID_LABELS: [&str; 2] = ["batch.kubernetes.io/controller-uid", "controller-uid"];

/// Resource role values
pub const ROLE_PRIMARY: &str = "primary";
pub const ROLE_AUXILIARY: &str = "auxiliary";

/// Selector for everything the monitor should watch, optionally narrowed to
/// resources created by one agent instance.
#[must_use]
pub fn monitor_selector(agent: Option<&str>) -> String {
    match agent {
        Some(agent) => format!("{LABEL_MONITOR}=true,{LABEL_AGENT}={agent}"),
        None => format!("{LABEL_MONITOR}=true"),
    }
}

#[must_use]
pub fn primary_selector() -> String {
    format!("{LABEL_RESOURCE_ROLE}={ROLE_PRIMARY}")
}

/// Label-presence selector matching every auxiliary resource.
#[must_use]
pub const fn auxiliary_presence_selector() -> &'static str {
    LABEL_AUXILIARY_RESOURCE
}

#[must_use]
pub fn auxiliary_selector(uuid: &str) -> String {
    format!("{LABEL_AUXILIARY_RESOURCE}={uuid}")
}

/// Returns the value of `key` on the object, if set and non-empty.
#[must_use]
pub fn label_value<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
}

#[must_use]
pub fn creation_time(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    meta.creation_timestamp.as_ref().map(|time| time.0)
}
