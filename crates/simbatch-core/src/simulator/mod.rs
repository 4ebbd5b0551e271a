//! The boundary between the job runner and whatever engine binding executes a model.
//!
//! A [`Simulator`] materializes one private [`Simulation`] per job; the runner drives it
//! through apply -> execute -> cleanup. Nothing here is shared across jobs.

pub mod external;
pub mod overrides;

use crate::errors::JobError;
use crate::model::{JobDescriptor, ResultTable};
use std::collections::BTreeMap;
use std::path::Path;

pub use external::{EngineConfig, ExternalEngine};

pub trait Simulator: Send + Sync {
    /// Materializes a fresh, isolated copy of `job.source` inside `scratch`.
    fn load(&self, job: &JobDescriptor, scratch: &Path) -> Result<Box<dyn Simulation>, JobError>;
}

pub trait Simulation: Send {
    fn apply(&mut self, overrides: &BTreeMap<String, serde_json::Value>) -> Result<(), JobError>;

    /// Runs the model to completion and returns one table per report it produced.
    fn execute(&mut self) -> Result<Vec<ResultTable>, JobError>;

    /// Deletes everything this simulation wrote. Must not fail the job.
    fn cleanup(&mut self);
}
