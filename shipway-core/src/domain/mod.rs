//! Core domain types
//!
//! This module contains the domain structures used across Shipway services.
//! Static topology (stage layout, environment configuration, target service,
//! grants) lives next to the per-run state (runs and artifacts).

pub mod artifact;
pub mod environment;
pub mod grant;
pub mod image;
pub mod run;
pub mod service;
pub mod stage;
