//! External collaborators of the pipeline
//!
//! Traits for the systems the executors talk to (source repository, image
//! registry, service cluster) with git and podman implementations.
//! In-memory counterparts live in [`crate::memory`].

pub mod cluster;
pub mod podman_cluster;
pub mod registry;
pub mod source;

pub use cluster::{ServiceCluster, ServiceState, TaskHealth, TaskId, TaskState};
pub use podman_cluster::PodmanCluster;
pub use registry::{GrantTarget, ImageRegistry, PodmanRegistry, RegistryError, RegistryPolicy};
pub use source::{CommitWatcher, GitPoller, GitSource, SourceRepository};
