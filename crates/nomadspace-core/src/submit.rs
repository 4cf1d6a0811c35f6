//! Job submission.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{ErrorList, NomadSpaceError, Result};
use crate::job::Job;
use crate::loader::LoadedJob;
use crate::namespace::Namespacer;
use crate::scheduler::{RunResult, Scheduler};

/// Namespaces jobs and registers them with the scheduler.
///
/// There is no retry here; a failed registration is returned to the caller.
#[derive(Clone)]
pub struct Submitter {
    scheduler: Arc<dyn Scheduler>,
    namespacer: Namespacer,
}

impl Submitter {
    pub fn new(scheduler: Arc<dyn Scheduler>, namespacer: Namespacer) -> Self {
        Self {
            scheduler,
            namespacer,
        }
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Namespace `job` and register it. `file` names the job's origin in
    /// logs and errors.
    pub async fn submit(&self, file: &str, mut job: Job) -> Result<RunResult> {
        self.namespacer.apply(&mut job);
        let job_id = job.id_or_default().to_string();

        match self.scheduler.register(&job).await {
            Ok(result) => {
                info!(file, job_id = %job_id, eval_id = %result.eval_id, "Submitted job");
                if !result.warnings.is_empty() {
                    warn!(file, job_id = %job_id, "Submitted with warnings: {:?}", result.warnings);
                }
                Ok(result)
            }
            Err(e) => {
                error!(file, job_id = %job_id, "Submission failed: {}", e);
                Err(NomadSpaceError::Submit {
                    file: file.to_string(),
                    job_id,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Submit every job, continuing past failures. Returns the results of
    /// the successful registrations, or the combined error of every failed
    /// one.
    pub async fn submit_all(&self, jobs: Vec<LoadedJob>) -> Result<Vec<RunResult>> {
        let mut results = Vec::with_capacity(jobs.len());
        let mut errors = ErrorList::new();
        for LoadedJob { file, job } in jobs {
            if let Some(result) = errors.push_result(self.submit(&file, job).await) {
                results.push(result);
            }
        }
        errors.into_result()?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryScheduler;
    use crate::identity::NamespaceId;

    fn job(id: &str) -> Job {
        Job {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    fn submitter(scheduler: Arc<MemoryScheduler>) -> Submitter {
        Submitter::new(scheduler, Namespacer::new(NamespaceId::derive("team1")))
    }

    #[tokio::test]
    async fn test_submit_namespaces_before_registering() {
        let scheduler = Arc::new(MemoryScheduler::new());
        scheduler.set_warnings(&["no update stanza"]);

        let result = submitter(scheduler.clone())
            .submit("svc.json", job("svc"))
            .await
            .unwrap();

        assert_eq!(result.eval_id, "eval-1");
        assert_eq!(result.warnings, vec!["no update stanza"]);
        assert_eq!(scheduler.registered_ids(), vec!["6vit4shr-svc"]);
        let meta = scheduler.registered()[0].meta.clone().unwrap();
        assert_eq!(meta["ns"], "6vit4shr");
    }

    #[tokio::test]
    async fn test_submit_failure_carries_file_and_job() {
        let scheduler = Arc::new(MemoryScheduler::new());
        scheduler.fail_registration_of("6vit4shr-svc");

        let err = submitter(scheduler)
            .submit("svc.json", job("svc"))
            .await
            .unwrap_err();

        match err {
            NomadSpaceError::Submit { file, job_id, .. } => {
                assert_eq!(file, "svc.json");
                assert_eq!(job_id, "6vit4shr-svc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_submit_all_continues_past_failures() {
        let scheduler = Arc::new(MemoryScheduler::new());
        scheduler.fail_registration_of("6vit4shr-a");
        scheduler.fail_registration_of("6vit4shr-c");

        let jobs = ["a", "b", "c"]
            .iter()
            .map(|id| LoadedJob {
                file: format!("{id}.json"),
                job: job(id),
            })
            .collect();

        let err = submitter(scheduler.clone())
            .submit_all(jobs)
            .await
            .unwrap_err();

        assert_eq!(scheduler.registered_ids(), vec!["6vit4shr-b"]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 errors occurred:"));
        assert!(msg.contains("a.json"));
        assert!(msg.contains("c.json"));
    }
}
