//! The analysis pipeline: raw-record normalization, concurrent multi-source
//! collection, and the job orchestrator that drives a query from submission
//! to a finished report.

pub const CRATE_NAME: &str = "revlens-pipeline";

pub mod coordinator;
pub mod normalizer;
pub mod orchestrator;

pub use orchestrator::{Orchestrator, PipelineConfig};
