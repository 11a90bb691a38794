//! Shipway pipeline
//!
//! The continuous-deployment pipeline library:
//! - Collaborators: source repository, image registry, service cluster
//! - Services: artifact store, run registry, build and deploy executors,
//!   access policy binder
//! - Scheduler: pipeline engine with ordered stage gates, trigger listener
//! - Configuration and topology wiring
//!
//! A commit on the watched branch becomes a run that flows through
//! Source → Build → Deploy, ending with the new image serving behind the
//! target service.

pub mod collaborator;
pub mod command;
pub mod config;
pub mod memory;
pub mod podman;
pub mod scheduler;
pub mod service;
pub mod topology;

pub use config::TopologyConfig;
pub use scheduler::{Pipeline, PipelineError, TriggerListener};
pub use topology::{Topology, bind_topology};
