//! Scheduler API abstraction.
//!
//! NomadSpace needs two things from the scheduler: turning native job syntax
//! into a job document, and registering a job. [`NomadClient`] talks to a real
//! Nomad agent; `crate::fakes::MemoryScheduler` records calls for tests.

pub mod nomad;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::Job;

pub use nomad::{NomadClient, NomadConfig};

/// Outcome of a successful job registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Evaluation created by the registration
    pub eval_id: String,
    /// Non-fatal warnings reported by the scheduler
    pub warnings: Vec<String>,
}

/// Job scheduler operations used by NomadSpace.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Parse a job written in the scheduler's native syntax.
    async fn parse_native(&self, source: &str) -> Result<Job>;

    /// Register (create or update) a job.
    async fn register(&self, job: &Job) -> Result<RunResult>;
}
