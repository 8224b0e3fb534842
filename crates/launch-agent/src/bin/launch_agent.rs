/*
 * 5D Labs Agent Platform - Launch Agent
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Launch Agent - pulls run queue items and drives them on Kubernetes
//!
//! This binary wires together:
//! - The queue service client and the agent dispatch loop
//! - The Kubernetes runner and the shared job monitor
//! - The periodic auxiliary resource cleanup
//! - Health and readiness endpoints

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use launch_agent::agent::{LaunchAgent, LimitValue, LocalFileSaver};
use launch_agent::cluster::cleanup::{KubeClusterResources, ResourceCleanup};
use launch_agent::cluster::runner::{KubernetesRunner, MonitorSlot, BACKEND_NAME};
use launch_agent::config::AgentConfig;
use launch_agent::queue::GraphQlQueueClient;
use launch_agent::runner::RunnerRegistry;
use launch_agent::telemetry::{init_tracing, LogFormat};
use serde_json::{json, Value};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "launch-agent")]
#[command(about = "Pull jobs from run queues and run them on Kubernetes")]
#[command(version)]
struct Cli {
    /// Agent configuration file (YAML)
    #[arg(long, env = "LAUNCH_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Entity whose queues to serve
    #[arg(long, env = "LAUNCH_ENTITY")]
    entity: Option<String>,

    /// Queue to poll (repeatable)
    #[arg(long = "queue", short = 'q')]
    queues: Vec<String>,

    /// Maximum concurrent jobs, -1 for unlimited
    #[arg(long, allow_hyphen_values = true)]
    max_jobs: Option<String>,

    /// Maximum concurrent sweep schedulers, -1 for unlimited
    #[arg(long, allow_hyphen_values = true)]
    max_schedulers: Option<String>,

    /// Log output format (text or json)
    #[arg(long, env = "LAUNCH_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Port for health endpoints
    #[arg(long, env = "LAUNCH_HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,
}

#[derive(Clone)]
struct AppState {
    agent: Arc<LaunchAgent>,
    monitor: MonitorSlot,
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config.apply_env()?;

    if let Some(entity) = &cli.entity {
        config.entity = Some(entity.clone());
    }
    if !cli.queues.is_empty() {
        config.queues.clone_from(&cli.queues);
    }
    if let Some(max_jobs) = &cli.max_jobs {
        config.max_jobs = Some(LimitValue::Text(max_jobs.clone()));
    }
    if let Some(max_schedulers) = &cli.max_schedulers {
        config.max_schedulers = Some(LimitValue::Text(max_schedulers.clone()));
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting 5D Labs Launch Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    let entity = config.entity.clone().unwrap_or_default();
    let api_key = config
        .api_key
        .clone()
        .context("LAUNCH_API_KEY must be set")?;
    let api = Arc::new(GraphQlQueueClient::new(
        &config.base_url,
        &api_key,
        &entity,
        &config.queue_project,
    )?);

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let monitor: MonitorSlot = Arc::default();
    let runner_id = uuid::Uuid::new_v4().to_string();
    let runner = KubernetesRunner::new(
        client.clone(),
        Arc::clone(&monitor),
        &runner_id,
        &config.namespace,
    );
    let runners = RunnerRegistry::new().with_runner(BACKEND_NAME, Arc::new(runner));
    let saver = Arc::new(LocalFileSaver::new(config.log_dir.clone()));

    let agent = Arc::new(LaunchAgent::from_config(api, runners, saver, &config)?);
    agent.initialize().await?;
    let shutdown = agent.shutdown_token();

    let cleanup = ResourceCleanup::new(
        Arc::new(KubeClusterResources::new(client)),
        Arc::new(agent.active_runs()),
        config.cleanup.clone(),
    );
    let cleanup_handle = {
        let shutdown = shutdown.child_token();
        tokio::spawn(async move { cleanup.run(shutdown).await })
    };

    let agent_handle = tokio::spawn(Arc::clone(&agent).run());

    let state = AppState {
        agent: Arc::clone(&agent),
        monitor: Arc::clone(&monitor),
    };
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(job_status))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let addr = format!("0.0.0.0:{}", cli.health_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Health server listening on {}", addr);

    {
        let shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    () = shutdown_signal() => {}
                    () = shutdown.cancelled() => {}
                }
            })
            .await?;
    }

    shutdown.cancel();
    match agent_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Agent loop failed: {}", e),
        Err(e) => error!("Agent task failed: {}", e),
    }
    cleanup_handle.abort();
    if let Some(monitor) = monitor.get() {
        monitor.shutdown().await;
    }

    info!("Launch agent stopped");
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "launch-agent",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.agent.shutdown_token().is_cancelled() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "launch-agent",
        "agent_id": state.agent.agent_id(),
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn job_status(State(state): State<AppState>) -> Json<Value> {
    let jobs = match state.monitor.get() {
        Some(monitor) => monitor
            .status_count()
            .await
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), json!(count)))
            .collect::<serde_json::Map<String, Value>>(),
        None => serde_json::Map::new(),
    };
    Json(json!({
        "running_jobs": state.agent.num_running_jobs().await,
        "running_schedulers": state.agent.num_running_schedulers().await,
        "monitored_jobs": jobs,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
