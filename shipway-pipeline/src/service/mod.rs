//! Pipeline services
//!
//! Stage executors and the shared state they work against:
//! - Artifact store and run registry
//! - Build and deploy executors
//! - Access policy binder for shared resources

pub mod artifacts;
pub mod binder;
pub mod build;
pub mod deploy;
pub mod runs;

pub use artifacts::{ArtifactStore, ArtifactStoreError};
pub use binder::AccessPolicyBinder;
pub use build::{BuildBackend, BuildCache, BuildExecutor, BuildOutput, BuildRequest, PodmanBuilder};
pub use deploy::{DeployExecutor, DeployResult};
pub use runs::{RunEvent, RunRegistry};
