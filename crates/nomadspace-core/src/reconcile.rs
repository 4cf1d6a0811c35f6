//! Template reconciliation loop.
//!
//! Keeps templates rendered against live state and resubmits the job behind
//! a template every time its rendered output changes.
//!
//! A watch session is the unit of recovery: when the engine fails after at
//! least one successful render, the session is torn down and started again
//! from the same templates. The directory load is never repeated.
//!
//! Render events are consumed on a single task. On every wake the whole
//! event buffer is scanned in timestamp order; an event is handled only if
//! it is strictly newer than the watermark, the newest timestamp handled so
//! far in the session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NomadSpaceConfig;
use crate::error::{NomadSpaceError, Result};
use crate::loader::parse_job;
use crate::submit::Submitter;
use crate::template::{template_env, RenderEvent, TemplateEngine, TemplateSpec, WatchSession};

/// What woke the loop up.
#[derive(Debug)]
enum Wake {
    Done,
    Failed(String),
    Rendered,
    Events,
}

/// How a watch session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The engine completed on its own
    Done,
    /// The engine failed; `renders` counts events with content handled in
    /// the session
    Failed { reason: String, renders: usize },
}

/// Per-wake scan result.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Events newer than the watermark
    pub processed: usize,
    /// Processed events that carried rendered content
    pub renders: usize,
    /// Renders whose parse or submission failed
    pub failures: usize,
}

/// Drives a template engine and resubmits rendered jobs.
pub struct ReconcileLoop {
    engine: Arc<dyn TemplateEngine>,
    submitter: Submitter,
    templates: Vec<TemplateSpec>,
    env: HashMap<String, String>,
    print_rendered: bool,
}

impl ReconcileLoop {
    pub fn new(
        engine: Arc<dyn TemplateEngine>,
        submitter: Submitter,
        templates: Vec<TemplateSpec>,
        config: &NomadSpaceConfig,
    ) -> Self {
        Self {
            engine,
            submitter,
            templates,
            env: template_env(config),
            print_rendered: config.print_rendered,
        }
    }

    /// Run until the engine completes, fails for good, or (when there is
    /// nothing to watch) `cancel` fires.
    ///
    /// Cancellation is only observed while idle. A running watch session is
    /// not interrupted by `cancel`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.templates.is_empty() {
            info!("Jobs are submitted, waiting for shutdown");
            cancel.cancelled().await;
            return Err(NomadSpaceError::Cancelled);
        }

        loop {
            info!(templates = self.templates.len(), "Starting template watch session");
            let mut session = self.engine.start(&self.templates, &self.env)?;
            let outcome = self.watch(&mut session).await;
            session.stop().await;
            info!("Templating stopped");

            match outcome {
                SessionOutcome::Done => return Ok(()),
                SessionOutcome::Failed { reason, renders } if renders > 0 => {
                    warn!(renders, "Template error, restarting watch session: {}", reason);
                }
                SessionOutcome::Failed { reason, .. } => {
                    return Err(NomadSpaceError::Engine(reason));
                }
            }
        }
    }

    /// Consume one session until it completes or fails.
    pub async fn watch(&self, session: &mut WatchSession) -> SessionOutcome {
        let mut watermark = session.started_at();
        let mut renders = 0usize;

        loop {
            let wake = next_wake(session).await;
            debug!(?wake, "Woke up");

            let (next, stats) = self.drain(session.render_events(), watermark).await;
            watermark = next;
            renders += stats.renders;

            match wake {
                Wake::Done => {
                    info!("Template watch done");
                    return SessionOutcome::Done;
                }
                Wake::Failed(reason) => {
                    error!("Template error: {}", reason);
                    return SessionOutcome::Failed { reason, renders };
                }
                Wake::Rendered | Wake::Events => {}
            }
        }
    }

    /// Handle every event newer than `watermark`, oldest first, and return
    /// the new watermark.
    pub async fn drain(
        &self,
        mut events: Vec<RenderEvent>,
        watermark: DateTime<Utc>,
    ) -> (DateTime<Utc>, DrainStats) {
        events.sort_by_key(|event| event.updated_at);

        let mut next = watermark;
        let mut stats = DrainStats::default();

        for (i, event) in events.into_iter().enumerate() {
            if event.updated_at <= watermark {
                continue;
            }
            next = next.max(event.updated_at);
            stats.processed += 1;

            let file = event.template.file_name();
            for dep in event.missing_deps.iter().flatten() {
                info!(event = i, template = %file, updated_at = %event.updated_at, "Missing dependency: {}", dep);
            }

            if event.contents.is_empty() {
                continue;
            }
            stats.renders += 1;

            if self.print_rendered {
                info!(
                    event = i,
                    template = %file,
                    updated_at = %event.updated_at,
                    "Rendered:\n{}",
                    String::from_utf8_lossy(&event.contents)
                );
            } else {
                info!(event = i, template = %file, updated_at = %event.updated_at, "Rendered");
            }

            if let Err(e) = self.resubmit(&file, &event).await {
                stats.failures += 1;
                error!(event = i, template = %file, "Failed to resubmit rendered job: {}", e);
            }
        }

        (next, stats)
    }

    async fn resubmit(&self, file: &str, event: &RenderEvent) -> Result<()> {
        let Some(format) = event.template.format else {
            debug!(template = %file, "Rendered template is not a job, nothing to submit");
            return Ok(());
        };
        let label = format!("rendered {}", file);
        let job = parse_job(self.submitter.scheduler(), format, &label, &event.contents).await?;
        self.submitter.submit(file, job).await?;
        Ok(())
    }
}

/// Wait for the next session signal.
///
/// An engine worker drops its signals when it exits, so a finished or failed
/// session also closes every other channel. A reported error wins over the
/// done channel, and closed channels never wake the loop.
async fn next_wake(session: &mut WatchSession) -> Wake {
    tokio::select! {
        biased;
        Some(reason) = session.errors.recv() => Wake::Failed(reason),
        done = &mut session.done => match done {
            Ok(()) => Wake::Done,
            Err(_) => Wake::Failed("template engine stopped unexpectedly".to_string()),
        },
        Some(()) = session.rendered.recv() => Wake::Rendered,
        Some(()) = session.events_available.recv() => Wake::Events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{ManualEngine, MemoryScheduler};
    use crate::identity::NamespaceId;
    use crate::namespace::Namespacer;
    use chrono::Duration;
    use std::path::{Path, PathBuf};

    struct Harness {
        engine: ManualEngine,
        scheduler: Arc<MemoryScheduler>,
        looper: ReconcileLoop,
        templates: Vec<TemplateSpec>,
    }

    fn harness(names: &[&str]) -> Harness {
        let config = NomadSpaceConfig::new(
            NamespaceId::derive("team1"),
            PathBuf::from("/in"),
            PathBuf::from("/scratch"),
        );
        let templates: Vec<_> = names
            .iter()
            .map(|n| TemplateSpec::new(&Path::new("/in").join(n), &config))
            .collect();
        let engine = ManualEngine::new();
        let scheduler = Arc::new(MemoryScheduler::new());
        let submitter = Submitter::new(
            scheduler.clone(),
            Namespacer::new(config.id.clone()),
        );
        let looper = ReconcileLoop::new(
            Arc::new(engine.clone()),
            submitter,
            templates.clone(),
            &config,
        );
        Harness {
            engine,
            scheduler,
            looper,
            templates,
        }
    }

    fn event(spec: &TemplateSpec, body: &str, at: DateTime<Utc>) -> RenderEvent {
        RenderEvent {
            template_id: spec.id(),
            template: spec.clone(),
            updated_at: at,
            missing_deps: None,
            contents: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_drain_processes_in_timestamp_order() {
        let h = harness(&["a.json.tmpl", "b.json.tmpl", "c.json.tmpl"]);
        let t0 = Utc::now();
        let (t1, t2, t3) = (
            t0 + Duration::seconds(1),
            t0 + Duration::seconds(2),
            t0 + Duration::seconds(3),
        );

        let events = vec![
            event(&h.templates[2], r#"{"ID":"third"}"#, t3),
            event(&h.templates[0], r#"{"ID":"first"}"#, t1),
            event(&h.templates[1], r#"{"ID":"second"}"#, t2),
        ];

        let (watermark, stats) = h.looper.drain(events.clone(), t0).await;
        assert_eq!(watermark, t3);
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.renders, 3);
        assert_eq!(
            h.scheduler.registered_ids(),
            vec!["6vit4shr-first", "6vit4shr-second", "6vit4shr-third"]
        );

        // Same buffer again: nothing is newer than the watermark.
        let (again, stats) = h.looper.drain(events, watermark).await;
        assert_eq!(again, t3);
        assert_eq!(stats, DrainStats::default());
        assert_eq!(h.scheduler.registered().len(), 3);
    }

    #[tokio::test]
    async fn test_drain_skips_events_at_or_before_watermark() {
        let h = harness(&["a.json.tmpl", "b.json.tmpl"]);
        let t0 = Utc::now();

        let events = vec![
            event(&h.templates[0], r#"{"ID":"stale"}"#, t0 - Duration::seconds(1)),
            event(&h.templates[1], r#"{"ID":"equal"}"#, t0),
        ];
        let (watermark, stats) = h.looper.drain(events, t0).await;

        assert_eq!(watermark, t0);
        assert_eq!(stats.processed, 0);
        assert!(h.scheduler.registered().is_empty());
    }

    #[tokio::test]
    async fn test_drain_continues_after_bad_render() {
        let h = harness(&["a.json.tmpl", "b.json.tmpl", "c.txt.tmpl"]);
        let t0 = Utc::now();

        let events = vec![
            event(&h.templates[0], "{not json", t0 + Duration::seconds(1)),
            event(&h.templates[1], r#"{"ID":"good"}"#, t0 + Duration::seconds(2)),
            event(&h.templates[2], "plain text", t0 + Duration::seconds(3)),
        ];
        let (_, stats) = h.looper.drain(events, t0).await;

        assert_eq!(stats.renders, 3);
        assert_eq!(stats.failures, 1);
        assert_eq!(h.scheduler.registered_ids(), vec!["6vit4shr-good"]);
    }

    #[tokio::test]
    async fn test_drain_counts_missing_deps_without_render() {
        let h = harness(&["a.json.tmpl"]);
        let t0 = Utc::now();
        let mut missing = event(&h.templates[0], "", t0 + Duration::seconds(1));
        missing.missing_deps = Some(["kv.block(a)".to_string()].into_iter().collect());

        let (watermark, stats) = h.looper.drain(vec![missing], t0).await;
        assert_eq!(watermark, t0 + Duration::seconds(1));
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.renders, 0);
    }

    #[tokio::test]
    async fn test_finished_worker_wakes_as_done() {
        for _ in 0..64 {
            let (mut signals, mut session) = WatchSession::channel();
            signals.done();
            drop(signals);

            assert!(matches!(next_wake(&mut session).await, Wake::Done));
        }
    }

    #[tokio::test]
    async fn test_failed_worker_keeps_its_reason() {
        for _ in 0..64 {
            let (signals, mut session) = WatchSession::channel();
            signals.fail("kv request timed out");
            drop(signals);

            match next_wake(&mut session).await {
                Wake::Failed(reason) => assert_eq!(reason, "kv request timed out"),
                other => panic!("expected failure, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_vanished_worker_is_a_failure() {
        let (signals, mut session) = WatchSession::channel();
        drop(signals);

        match next_wake(&mut session).await {
            Wake::Failed(reason) => assert!(reason.contains("stopped unexpectedly")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_done_after_render_is_not_restarted() {
        for _ in 0..16 {
            let h = harness(&["dyn.json.tmpl"]);
            let engine = h.engine.clone();
            let spec = h.templates[0].clone();

            let driver = tokio::spawn(async move {
                engine.wait_for_starts(1).await;
                let start = engine.session_started_at().unwrap();
                engine.render(&spec, r#"{"ID":"dynamic"}"#, start + Duration::seconds(1));
                engine.finish();
            });

            h.looper.run(CancellationToken::new()).await.unwrap();
            driver.await.unwrap();

            assert_eq!(h.engine.starts(), 1);
            assert_eq!(h.scheduler.registered_ids(), vec!["6vit4shr-dynamic"]);
        }
    }

    #[tokio::test]
    async fn test_idle_loop_waits_for_cancellation() {
        let h = harness(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.looper.run(cancel).await.unwrap_err();
        assert!(matches!(err, NomadSpaceError::Cancelled));
        assert_eq!(h.engine.starts(), 0);
    }

    #[tokio::test]
    async fn test_done_ends_loop_after_draining() {
        let h = harness(&["dyn.json.tmpl"]);
        let engine = h.engine.clone();
        let spec = h.templates[0].clone();

        let driver = tokio::spawn(async move {
            engine.wait_for_starts(1).await;
            let start = engine.session_started_at().unwrap();
            engine.render(&spec, r#"{"ID":"dynamic"}"#, start + Duration::seconds(1));
            engine.finish();
        });

        h.looper.run(CancellationToken::new()).await.unwrap();
        driver.await.unwrap();

        assert_eq!(h.scheduler.registered_ids(), vec!["6vit4shr-dynamic"]);
        assert_eq!(h.engine.starts(), 1);
    }

    #[tokio::test]
    async fn test_error_without_renders_is_fatal() {
        let h = harness(&["dyn.json.tmpl"]);
        let engine = h.engine.clone();

        let driver = tokio::spawn(async move {
            engine.wait_for_starts(1).await;
            engine.fail("consul unreachable");
        });

        let err = h.looper.run(CancellationToken::new()).await.unwrap_err();
        driver.await.unwrap();

        assert!(err.to_string().contains("consul unreachable"));
        assert_eq!(h.engine.starts(), 1);
    }

    #[tokio::test]
    async fn test_error_after_render_restarts_session() {
        let h = harness(&["dyn.json.tmpl"]);
        let engine = h.engine.clone();
        let scheduler = h.scheduler.clone();
        let spec = h.templates[0].clone();

        let driver = tokio::spawn(async move {
            engine.wait_for_starts(1).await;
            let start = engine.session_started_at().unwrap();
            engine.render(&spec, r#"{"ID":"dynamic"}"#, start + Duration::seconds(1));
            scheduler.wait_for_registrations(1).await;
            engine.fail("connection reset");

            engine.wait_for_starts(2).await;
            engine.finish();
        });

        h.looper.run(CancellationToken::new()).await.unwrap();
        driver.await.unwrap();

        assert_eq!(h.engine.starts(), 2);
        assert_eq!(h.engine.templates(), h.templates);
        assert_eq!(h.scheduler.registered_ids(), vec!["6vit4shr-dynamic"]);
    }

    #[tokio::test]
    async fn test_start_failure_is_returned() {
        let h = harness(&["dyn.json.tmpl"]);
        h.engine.fail_next_start("bad template");

        let err = h.looper.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("bad template"));
    }

    #[tokio::test]
    async fn test_engine_env_carries_identity() {
        let h = harness(&["dyn.json.tmpl"]);
        let engine = h.engine.clone();
        let driver = tokio::spawn(async move {
            engine.wait_for_starts(1).await;
            engine.finish();
        });

        h.looper.run(CancellationToken::new()).await.unwrap();
        driver.await.unwrap();

        let env = h.engine.env();
        assert_eq!(env["NOMADSPACE_ID"], "6vit4shr");
        assert_eq!(env["NS"], "6vit4shr");
        assert_eq!(env["GEN_DIR"], "/scratch");
    }
}
