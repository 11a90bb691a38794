//! Data Transfer Objects for the orchestrator API
//!
//! DTOs shared by the orchestrator, the client and the CLI. They are
//! lightweight views of domain entities optimized for network transfer.

pub mod artifact;
pub mod run;
pub mod service;
