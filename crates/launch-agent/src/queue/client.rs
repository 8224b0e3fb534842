//! GraphQL client for the run queue service.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{
    AgentInfo, AgentStatus, Capabilities, FailureStage, LaunchSpec, QueueApi, QueueError,
    RunInfo, RunQueueItem, SweepState,
};

/// Default queue service endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.wandb.ai";

/// Queue service client bound to one entity and its queue project.
#[derive(Debug, Clone)]
pub struct GraphQlQueueClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    entity: String,
    project: String,
}

#[derive(Debug, Serialize)]
struct GraphQLRequest<V: Serialize> {
    query: &'static str,
    variables: V,
}

#[derive(Debug, Deserialize)]
struct GraphQLResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQLError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Success {
    success: bool,
}

impl GraphQlQueueClient {
    /// Create a client for `entity`, popping from queues in `project`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        base_url: &str,
        api_key: &str,
        entity: &str,
        project: &str,
    ) -> Result<Self, QueueError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("launch-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: format!("{}/graphql", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            entity: entity.to_string(),
            project: project.to_string(),
        })
    }

    async fn execute<V: Serialize + Send, R: DeserializeOwned>(
        &self,
        query: &'static str,
        variables: V,
    ) -> Result<R, QueueError> {
        let request = GraphQLRequest { query, variables };

        let response = self
            .client
            .post(&self.api_url)
            .basic_auth("api", Some(&self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let gql_response: GraphQLResponse<R> = response
            .json()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))?;

        if let Some(errors) = gql_response.errors.filter(|errors| !errors.is_empty()) {
            let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
            return Err(QueueError::GraphQl(messages.join(", ")));
        }

        gql_response
            .data
            .ok_or_else(|| QueueError::Decode("no data in GraphQL response".to_string()))
    }

    async fn run_record(
        &self,
        entity: &str,
        project: &str,
        run_id: &str,
    ) -> Result<Option<RunRecord>, QueueError> {
        #[derive(Serialize)]
        struct Variables<'a> {
            entity: &'a str,
            project: &'a str,
            name: &'a str,
        }

        #[derive(Deserialize)]
        struct Response {
            project: Option<ProjectRuns>,
        }

        #[derive(Deserialize)]
        struct ProjectRuns {
            run: Option<RunRecord>,
        }

        const QUERY: &str = r"
            query RunState($entity: String!, $project: String!, $name: String!) {
                project(name: $project, entityName: $entity) {
                    run(name: $name) {
                        id
                        state
                        stopped
                    }
                }
            }
        ";

        let response: Response = self
            .execute(
                QUERY,
                Variables {
                    entity,
                    project,
                    name: run_id,
                },
            )
            .await?;
        Ok(response.project.and_then(|project| project.run))
    }
}

#[derive(Debug, Deserialize)]
struct RunRecord {
    state: Option<String>,
    #[serde(default)]
    stopped: bool,
}

fn require_success(result: &Success, operation: &str) -> Result<(), QueueError> {
    if result.success {
        Ok(())
    } else {
        Err(QueueError::Rejected(format!("{operation} was not successful")))
    }
}

#[async_trait]
impl QueueApi for GraphQlQueueClient {
    async fn capabilities(&self) -> Result<Capabilities, QueueError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "__type")]
            mutation: Option<TypeFields>,
        }

        #[derive(Deserialize)]
        struct TypeFields {
            fields: Vec<Field>,
        }

        #[derive(Deserialize)]
        struct Field {
            name: String,
        }

        const QUERY: &str = r#"
            query ProbeMutations {
                __type(name: "Mutation") {
                    fields {
                        name
                    }
                }
            }
        "#;

        let response: Response = self.execute(QUERY, serde_json::json!({})).await?;
        let names: Vec<String> = response
            .mutation
            .map(|t| t.fields.into_iter().map(|f| f.name).collect())
            .unwrap_or_default();
        let has = |name: &str| names.iter().any(|n| n == name);

        Ok(Capabilities {
            fail_run_queue_items: has("failRunQueueItem"),
            launch_agents: has("createLaunchAgent"),
        })
    }

    #[instrument(skip(self, agent_config))]
    async fn create_launch_agent(
        &self,
        queues: &[String],
        agent_config: &Value,
    ) -> Result<Option<String>, QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            entity: &'a str,
            project: &'a str,
            queues: &'a [String],
            agent_config: String,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            create_launch_agent: Option<Created>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            launch_agent_id: Option<String>,
        }

        const MUTATION: &str = r"
            mutation createLaunchAgent($entity: String!, $project: String!, $queues: [String!]!, $agentConfig: JSONString) {
                createLaunchAgent(input: { entityName: $entity, projectName: $project, queues: $queues, agentConfig: $agentConfig }) {
                    launchAgentId
                }
            }
        ";

        let response: Response = self
            .execute(
                MUTATION,
                Variables {
                    entity: &self.entity,
                    project: &self.project,
                    queues,
                    agent_config: agent_config.to_string(),
                },
            )
            .await?;
        Ok(response
            .create_launch_agent
            .and_then(|created| created.launch_agent_id))
    }

    async fn get_launch_agent(&self, agent_id: &str) -> Result<AgentInfo, QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            agent_id: &'a str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            launch_agent: Option<AgentInfo>,
        }

        const QUERY: &str = r"
            query LaunchAgent($agentId: ID!) {
                launchAgent(id: $agentId) {
                    name
                    stopPolling
                }
            }
        ";

        let response: Response = self.execute(QUERY, Variables { agent_id }).await?;
        response
            .launch_agent
            .ok_or_else(|| QueueError::Rejected(format!("launch agent {agent_id} not found")))
    }

    async fn update_launch_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            agent_id: &'a str,
            agent_status: &'static str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            update_launch_agent: Success,
        }

        const MUTATION: &str = r"
            mutation updateLaunchAgent($agentId: ID!, $agentStatus: String) {
                updateLaunchAgent(input: { launchAgentId: $agentId, agentStatus: $agentStatus }) {
                    success
                }
            }
        ";

        let response: Response = self
            .execute(
                MUTATION,
                Variables {
                    agent_id,
                    agent_status: status.as_str(),
                },
            )
            .await?;
        require_success(&response.update_launch_agent, "updateLaunchAgent")
    }

    #[instrument(skip(self))]
    async fn pop_from_run_queue(
        &self,
        queue_name: &str,
    ) -> Result<Option<RunQueueItem>, QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            entity: &'a str,
            project: &'a str,
            queue_name: &'a str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            pop_from_run_queue: Option<RunQueueItem>,
        }

        const MUTATION: &str = r"
            mutation popFromRunQueue($entity: String!, $project: String!, $queueName: String!) {
                popFromRunQueue(input: { entityName: $entity, projectName: $project, queueName: $queueName }) {
                    runQueueItemId
                    runSpec
                }
            }
        ";

        let response: Response = self
            .execute(
                MUTATION,
                Variables {
                    entity: &self.entity,
                    project: &self.project,
                    queue_name,
                },
            )
            .await?;

        Ok(response.pop_from_run_queue.map(|mut item| {
            item.queue_name = queue_name.to_string();
            debug!(run_queue_item_id = %item.id, "Popped run queue item");
            item
        }))
    }

    async fn ack_run_queue_item(&self, item_id: &str, run_id: &str) -> Result<(), QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            item_id: &'a str,
            run_id: &'a str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            ack_run_queue_item: Success,
        }

        const MUTATION: &str = r"
            mutation ackRunQueueItem($itemId: ID!, $runId: String!) {
                ackRunQueueItem(input: { runQueueItemId: $itemId, runName: $runId }) {
                    success
                }
            }
        ";

        let response: Response = self
            .execute(MUTATION, Variables { item_id, run_id })
            .await?;
        if response.ack_run_queue_item.success {
            Ok(())
        } else {
            Err(QueueError::Rejected(
                "Error acking run queue item. Item may have already been acknowledged by another process"
                    .to_string(),
            ))
        }
    }

    async fn release_run_queue_item(&self, item_id: &str) -> Result<(), QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            item_id: &'a str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            reset_run_queue_item: Success,
        }

        const MUTATION: &str = r"
            mutation resetRunQueueItem($itemId: ID!) {
                resetRunQueueItem(input: { runQueueItemId: $itemId }) {
                    success
                }
            }
        ";

        let response: Response = self.execute(MUTATION, Variables { item_id }).await?;
        require_success(&response.reset_run_queue_item, "resetRunQueueItem")
    }

    #[instrument(skip(self, message, file_paths))]
    async fn fail_run_queue_item(
        &self,
        item_id: &str,
        message: &str,
        stage: FailureStage,
        file_paths: &[String],
    ) -> Result<(), QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            item_id: &'a str,
            message: &'a str,
            stage: &'static str,
            file_paths: &'a [String],
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            fail_run_queue_item: Success,
        }

        const MUTATION: &str = r"
            mutation failRunQueueItem($itemId: ID!, $message: String!, $stage: String!, $filePaths: [String!]) {
                failRunQueueItem(input: { runQueueItemId: $itemId, message: $message, stage: $stage, filePaths: $filePaths }) {
                    success
                }
            }
        ";

        let response: Response = self
            .execute(
                MUTATION,
                Variables {
                    item_id,
                    message,
                    stage: stage.as_str(),
                    file_paths,
                },
            )
            .await?;
        require_success(&response.fail_run_queue_item, "failRunQueueItem")
    }

    #[instrument(skip(self, spec))]
    async fn add_to_queue(
        &self,
        spec: &LaunchSpec,
        project_queue: &str,
        queue_name: &str,
    ) -> Result<(), QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            entity: &'a str,
            project: &'a str,
            queue_name: &'a str,
            run_spec: String,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            push_to_run_queue_by_name: Option<Pushed>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Pushed {
            run_queue_item_id: String,
        }

        const MUTATION: &str = r"
            mutation pushToRunQueueByName($entity: String!, $project: String!, $queueName: String!, $runSpec: JSONString!) {
                pushToRunQueueByName(input: { entityName: $entity, projectName: $project, queueName: $queueName, runSpec: $runSpec }) {
                    runQueueItemId
                }
            }
        ";

        let response: Response = self
            .execute(
                MUTATION,
                Variables {
                    entity: &self.entity,
                    project: project_queue,
                    queue_name,
                    run_spec: serde_json::to_string(spec)
                        .map_err(|e| QueueError::Decode(e.to_string()))?,
                },
            )
            .await?;
        match response.push_to_run_queue_by_name {
            Some(pushed) => {
                debug!(run_queue_item_id = %pushed.run_queue_item_id, "Requeued launch spec");
                Ok(())
            }
            None => Err(QueueError::Rejected(format!(
                "queue {queue_name} did not accept the launch spec"
            ))),
        }
    }

    async fn update_run_queue_item_warning(
        &self,
        item_id: &str,
        message: &str,
        backend: &str,
        file_paths: &[String],
    ) -> Result<(), QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            item_id: &'a str,
            message: &'a str,
            stage: &'a str,
            file_paths: &'a [String],
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            update_run_queue_item_warning: Success,
        }

        const MUTATION: &str = r"
            mutation updateRunQueueItemWarning($itemId: ID!, $message: String!, $stage: String!, $filePaths: [String!]) {
                updateRunQueueItemWarning(input: { runQueueItemId: $itemId, message: $message, stage: $stage, filePaths: $filePaths }) {
                    success
                }
            }
        ";

        let response: Response = self
            .execute(
                MUTATION,
                Variables {
                    item_id,
                    message,
                    stage: backend,
                    file_paths,
                },
            )
            .await?;
        require_success(
            &response.update_run_queue_item_warning,
            "updateRunQueueItemWarning",
        )
    }

    async fn set_sweep_state(
        &self,
        sweep_id: &str,
        entity: &str,
        project: &str,
        state: SweepState,
    ) -> Result<(), QueueError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            id: &'a str,
            entity: &'a str,
            project: &'a str,
            state: &'static str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            upsert_sweep: Option<Value>,
        }

        const MUTATION: &str = r"
            mutation upsertSweep($id: ID, $entity: String, $project: String, $state: String) {
                upsertSweep(input: { id: $id, entityName: $entity, projectName: $project, state: $state }) {
                    sweep {
                        name
                    }
                }
            }
        ";

        let response: Response = self
            .execute(
                MUTATION,
                Variables {
                    id: sweep_id,
                    entity,
                    project,
                    state: state.as_str(),
                },
            )
            .await?;
        if response.upsert_sweep.is_none() {
            return Err(QueueError::Rejected(format!("sweep {sweep_id} was not updated")));
        }
        Ok(())
    }

    async fn get_run_info(&self, entity: &str, project: &str, run_id: &str) -> RunInfo {
        match self.run_record(entity, project, run_id).await {
            Ok(Some(record)) => RunInfo::Found {
                state: record.state,
            },
            Ok(None) => RunInfo::NotFound,
            Err(e) => {
                warn!(run_id, error = %e, "Run lookup failed");
                RunInfo::TransientError(e.to_string())
            }
        }
    }

    async fn check_stop_requested(
        &self,
        entity: &str,
        project: &str,
        run_id: &str,
    ) -> Result<bool, QueueError> {
        Ok(self
            .run_record(entity, project, run_id)
            .await?
            .is_some_and(|record| record.stopped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> GraphQlQueueClient {
        GraphQlQueueClient::new(&server.uri(), "test-key", "team", "model-registry").unwrap()
    }

    #[tokio::test]
    async fn pop_returns_item_tagged_with_queue_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "variables": {"entity": "team", "project": "model-registry", "queueName": "gpu"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "popFromRunQueue": {
                        "runQueueItemId": "rqi-1",
                        "runSpec": {"project": "vision", "_resume_count": 1}
                    }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let item = client_for(&server)
            .await
            .pop_from_run_queue("gpu")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.id, "rqi-1");
        assert_eq!(item.queue_name, "gpu");
        assert_eq!(item.run_spec.project.as_deref(), Some("vision"));
        assert_eq!(item.run_spec.resume_count, 1);
    }

    #[tokio::test]
    async fn empty_queue_pops_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"popFromRunQueue": null}})),
            )
            .mount(&server)
            .await;

        let item = client_for(&server).await.pop_from_run_queue("cpu").await.unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn graphql_errors_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{"message": "permission denied"}]
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .fail_run_queue_item("rqi-1", "boom", FailureStage::Agent, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::GraphQl(ref msg) if msg == "permission denied"));
    }

    #[tokio::test]
    async fn fail_run_queue_item_sends_stage_and_files() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "variables": {
                    "itemId": "rqi-9",
                    "message": "The submitted run was not successfully started",
                    "stage": "run",
                    "filePaths": ["/logs/rqi-9/error.log"]
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"failRunQueueItem": {"success": true}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .await
            .fail_run_queue_item(
                "rqi-9",
                "The submitted run was not successfully started",
                FailureStage::Run,
                &["/logs/rqi-9/error.log".to_string()],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_info_distinguishes_missing_and_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"name": "missing"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"project": {"run": null}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"name": "started"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"project": {"run": {"id": "r1", "state": "running", "stopped": true}}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"name": "flaky"}})))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(
            client.get_run_info("team", "vision", "missing").await,
            RunInfo::NotFound
        );
        assert_eq!(
            client.get_run_info("team", "vision", "started").await,
            RunInfo::Found {
                state: Some("running".into())
            }
        );
        assert!(matches!(
            client.get_run_info("team", "vision", "flaky").await,
            RunInfo::TransientError(_)
        ));
        assert!(client
            .check_stop_requested("team", "vision", "started")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn capabilities_follow_schema_introspection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"__type": {"fields": [
                    {"name": "popFromRunQueue"},
                    {"name": "createLaunchAgent"}
                ]}}
            })))
            .mount(&server)
            .await;

        let capabilities = client_for(&server).await.capabilities().await.unwrap();
        assert!(capabilities.launch_agents);
        assert!(!capabilities.fail_run_queue_items);
    }

    #[tokio::test]
    async fn rejected_ack_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"ackRunQueueItem": {"success": false}}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .ack_run_queue_item("rqi-1", "run-1")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Rejected(_)));
    }
}
