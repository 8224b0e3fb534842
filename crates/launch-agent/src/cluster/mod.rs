//! Kubernetes backend: resumable watches, the job monitor, orphaned-resource
//! cleanup and the Kubernetes runner.

pub mod cleanup;
pub mod monitor;
pub mod runner;
pub mod watch;

pub use cleanup::{ActiveRunSource, ClusterResources, KubeClusterResources, ResourceCleanup};
pub use monitor::{ClusterJobMonitor, ClusterWatcher, CustomResource, KubeWatcher};
pub use runner::{KubernetesRunner, KubernetesSubmittedRun};
pub use watch::{SafeWatch, WatchError, WatchStream};
