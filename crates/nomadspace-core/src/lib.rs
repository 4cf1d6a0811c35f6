//! NomadSpace Core Library
//!
//! Gives a set of Nomad jobs a private, deterministic namespace so that many
//! isolated copies of the same job graph can run side by side on one cluster.
//!
//! The pieces, leaves first: [`identity`] derives the namespace token,
//! [`loader`] reads the input directory, [`namespace`] rewrites jobs,
//! [`submit`] registers them through a [`scheduler::Scheduler`],
//! [`reconcile`] keeps templates rendered and resubmitted, and
//! [`supervisor`] runs the long-lived subsystems.

pub mod app;
pub mod config;
pub mod error;
pub mod fakes;
pub mod identity;
pub mod job;
pub mod loader;
pub mod namespace;
pub mod reconcile;
pub mod scheduler;
pub mod submit;
pub mod supervisor;
pub mod telemetry;
pub mod template;

pub use app::NomadSpace;
pub use config::{DnsSearchOptions, NomadSpaceConfig, WatchConfig};
pub use error::{ErrorList, NomadSpaceError, Result};
pub use identity::NamespaceId;
pub use job::{Job, Service, Task, TaskDriver, TaskGroup};
pub use loader::{LoadedJob, LoadedSpecs, SpecLoader};
pub use namespace::Namespacer;
pub use reconcile::ReconcileLoop;
pub use scheduler::{NomadClient, NomadConfig, RunResult, Scheduler};
pub use submit::Submitter;
pub use supervisor::Supervisor;
pub use template::{
    ConsulConfig, ConsulKvEngine, JobFormat, RenderEvent, TemplateEngine, TemplateSpec,
    WatchSession,
};

/// Crate version, reported by the binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
