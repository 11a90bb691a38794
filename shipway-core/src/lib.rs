//! Shipway Core
//!
//! Core types and abstractions for the Shipway deployment pipeline.
//!
//! This crate contains:
//! - Domain types: Runs, artifacts, stage layouts, target services, grants
//! - Errors: The stage error taxonomy shared by executors and the engine
//! - DTOs: Data transfer objects for the orchestrator API

pub mod domain;
pub mod dto;
pub mod error;
