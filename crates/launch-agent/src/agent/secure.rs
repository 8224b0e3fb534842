//! Secure mode: refuse launch specs that override what the operator locked.

use serde_json::Value;

use crate::error::{LaunchError, Result};
use crate::queue::LaunchSpec;
use crate::runner::DEFAULT_RESOURCE;

const LOCKED_POD_FIELDS: [&str; 3] = ["hostPID", "hostIPC", "hostNetwork"];

fn locked(field: &str, location: &str) -> LaunchError {
    LaunchError::SecureMode(format!(
        "This agent is configured to lock \"{field}\" in {location} but the job specification attempts to override it."
    ))
}

/// Reject `spec` if it touches a locked field.
pub fn check_launch_spec(spec: &LaunchSpec) -> Result<()> {
    if spec.overrides.entry_point.is_some() {
        return Err(LaunchError::SecureMode(
            "This agent is configured to lock the \"entrypoint\" override but the job specification attempts to override it.".to_string(),
        ));
    }

    let resource = spec.resource.as_deref().unwrap_or(DEFAULT_RESOURCE);
    if resource != DEFAULT_RESOURCE {
        return Ok(());
    }
    let Some(pod_spec) = spec
        .resource_args_for(resource)
        .and_then(|args| args.pointer("/spec/template/spec"))
    else {
        return Ok(());
    };

    for field in LOCKED_POD_FIELDS {
        if pod_spec.get(field).is_some_and(is_truthy) {
            return Err(locked(field, "pod spec"));
        }
    }

    let containers = pod_spec
        .get("containers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if containers
        .iter()
        .any(|container| container.get("command").is_some_and(|c| !c.is_null()))
    {
        return Err(locked("command", "container spec"));
    }

    Ok(())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_with_pod(pod_spec: Value) -> LaunchSpec {
        serde_json::from_value(json!({
            "resource": "kubernetes",
            "resource_args": {"kubernetes": {"spec": {"template": {"spec": pod_spec}}}},
        }))
        .unwrap()
    }

    #[test]
    fn plain_spec_passes() {
        let spec = spec_with_pod(json!({"containers": [{"image": "trainer:1"}], "hostPID": false}));
        check_launch_spec(&spec).unwrap();
        check_launch_spec(&LaunchSpec::default()).unwrap();
    }

    #[test]
    fn host_namespaces_are_locked() {
        for field in LOCKED_POD_FIELDS {
            let spec = spec_with_pod(json!({ field: true }));
            let err = check_launch_spec(&spec).unwrap_err().to_string();
            assert!(err.contains(&format!("lock \"{field}\" in pod spec")), "{err}");
        }
    }

    #[test]
    fn container_command_is_locked() {
        let spec = spec_with_pod(json!({"containers": [{"command": ["sh", "-c", "id"]}]}));
        let err = check_launch_spec(&spec).unwrap_err().to_string();
        assert!(err.contains("lock \"command\" in container spec"));
    }

    #[test]
    fn entrypoint_override_is_locked() {
        let mut spec = LaunchSpec::default();
        spec.overrides.entry_point = Some(vec!["python".into(), "evil.py".into()]);
        let err = check_launch_spec(&spec).unwrap_err().to_string();
        assert!(err.contains("\"entrypoint\" override"));
    }

    #[test]
    fn other_backends_only_check_entrypoint() {
        let spec: LaunchSpec = serde_json::from_value(json!({
            "resource": "local-container",
            "resource_args": {"local-container": {"spec": {"template": {"spec": {"hostPID": true}}}}},
        }))
        .unwrap();
        check_launch_spec(&spec).unwrap();
    }
}
