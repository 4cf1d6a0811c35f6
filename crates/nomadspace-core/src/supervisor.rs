//! Concurrent subsystem supervision.
//!
//! Each subsystem runs on its own tokio task. [`Supervisor::wait`] joins every
//! task and combines their failures; one subsystem failing never cancels its
//! siblings. Shutdown is driven by the shared cancellation token the
//! subsystems were given, not by the supervisor.

use std::future::Future;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{ErrorList, NomadSpaceError, Result};

struct Subsystem {
    name: String,
    handle: JoinHandle<Result<()>>,
}

/// Runs named subsystems and aggregates their outcomes.
#[derive(Default)]
pub struct Supervisor {
    subsystems: Vec<Subsystem>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `subsystem` on a new task. Must be called from within a tokio
    /// runtime.
    pub fn spawn<F, Fut>(&mut self, name: &str, subsystem: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        debug!(subsystem = name, "Starting subsystem");
        let handle = tokio::spawn(async move { subsystem().await });
        self.subsystems.push(Subsystem {
            name: name.to_string(),
            handle,
        });
    }

    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    /// Wait for every subsystem to finish.
    ///
    /// Returns `Ok` when all succeeded, otherwise the flattened errors of
    /// every subsystem that failed or panicked, in start order.
    pub async fn wait(self) -> Result<()> {
        let (names, handles): (Vec<_>, Vec<_>) = self
            .subsystems
            .into_iter()
            .map(|s| (s.name, s.handle))
            .unzip();
        let outcomes = join_all(handles).await;

        let mut errors = ErrorList::new();
        for (name, outcome) in names.into_iter().zip(outcomes) {
            match outcome {
                Ok(Ok(())) => debug!(subsystem = %name, "Subsystem finished"),
                Ok(Err(e)) => {
                    if !e.is_cancellation() {
                        error!(subsystem = %name, "Subsystem failed: {}", e);
                    }
                    errors.push(e);
                }
                Err(join_err) => {
                    error!(subsystem = %name, "Subsystem did not complete: {}", join_err);
                    errors.push(NomadSpaceError::Subsystem {
                        name,
                        reason: join_err.to_string(),
                    });
                }
            }
        }

        errors.into_result()
    }
}
