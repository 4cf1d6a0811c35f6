//! Main flow: load the input directory, submit the static jobs, then keep
//! templates reconciled.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::NomadSpaceConfig;
use crate::error::Result;
use crate::loader::{LoadedSpecs, SpecLoader};
use crate::namespace::Namespacer;
use crate::reconcile::ReconcileLoop;
use crate::scheduler::Scheduler;
use crate::submit::Submitter;
use crate::template::TemplateEngine;

/// One namespaced deployment of an input directory.
pub struct NomadSpace {
    config: NomadSpaceConfig,
    scheduler: Arc<dyn Scheduler>,
    engine: Arc<dyn TemplateEngine>,
}

impl NomadSpace {
    pub fn new(
        config: NomadSpaceConfig,
        scheduler: Arc<dyn Scheduler>,
        engine: Arc<dyn TemplateEngine>,
    ) -> Self {
        Self {
            config,
            scheduler,
            engine,
        }
    }

    pub async fn load(&self) -> Result<LoadedSpecs> {
        SpecLoader::new(&self.config, self.scheduler.as_ref())
            .load()
            .await
    }

    /// Load, submit every static job, then hand templates to the
    /// reconciliation loop.
    ///
    /// Nothing is submitted if any input file fails to load, and the loop is
    /// not started if any static job fails to submit.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(ns = %self.config.id, input_dir = %self.config.input_dir.display(), "Starting");

        let LoadedSpecs { jobs, templates } = self.load().await?;

        let submitter = Submitter::new(
            self.scheduler.clone(),
            Namespacer::from_config(&self.config),
        );
        submitter.submit_all(jobs).await?;

        ReconcileLoop::new(self.engine.clone(), submitter, templates, &self.config)
            .run(cancel)
            .await
    }
}
