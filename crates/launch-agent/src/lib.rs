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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Launch agent library
//!
//! The agent pulls run queue items from the queue service, dispatches them to
//! a backend runner (Kubernetes today), follows every job to a terminal state
//! and reports the outcome back to the queue. Three pieces carry most of the
//! weight:
//!
//! - [`agent::LaunchAgent`]: the dispatch loop, concurrency limits and the
//!   finish/report logic that never loses a job
//! - [`cluster::monitor::ClusterJobMonitor`]: one resumable watch stream per
//!   resource kind and namespace, folded into a job-name to [`Status`] map
//! - [`cluster::cleanup::ResourceCleanup`]: garbage collection of auxiliary
//!   resources whose job is gone

pub mod agent;
pub mod cluster;
pub mod config;
pub mod error;
pub mod labels;
pub mod queue;
pub mod runner;
pub mod status;
pub mod telemetry;

// Re-export commonly used types
pub use agent::{JobAndRunStatusTracker, LaunchAgent};
pub use cluster::cleanup::{ResourceCleanup, ResourceCleanupConfig};
pub use cluster::monitor::ClusterJobMonitor;
pub use cluster::watch::SafeWatch;
pub use config::AgentConfig;
pub use error::{ConfigError, LaunchError, Result};
pub use status::{State, Status};
