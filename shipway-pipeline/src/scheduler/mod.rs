//! Scheduling
//!
//! Run admission and execution: the pipeline engine with its ordered stage
//! gates, and the trigger listener that feeds it commits.

pub mod engine;
pub mod gate;
pub mod trigger;

pub use engine::{Executors, Pipeline, PipelineError};
pub use gate::{GatePass, StageGate};
pub use trigger::TriggerListener;
