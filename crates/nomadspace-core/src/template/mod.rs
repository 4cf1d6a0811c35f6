//! Template engine abstraction
//!
//! A [`TemplateEngine`] turns a set of [`TemplateSpec`]s into a running
//! [`WatchSession`]. The session renders templates against live external
//! state on its own task and reports progress through four channels:
//!
//! - `done`: the engine finished on its own
//! - `errors`: the engine hit a fatal error and stopped
//! - `rendered`: at least one template produced new output
//! - `events`: the render-event buffer changed
//!
//! The latest [`RenderEvent`] per template is kept in a shared buffer that the
//! consumer snapshots on every wake.

pub mod consul;
pub mod render;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{NomadSpaceConfig, ENV_NOMADSPACE_ID};
use crate::error::Result;

pub use consul::{ConsulConfig, ConsulKvEngine};

/// File suffix marking a template
pub const TEMPLATE_SUFFIX: &str = ".tmpl";

/// Job syntax produced by a template, selected by its inner suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFormat {
    /// `*.json.tmpl`
    Json,
    /// `*.nomad.tmpl`
    Native,
}

impl JobFormat {
    /// Format of a job file named `name` (without any template suffix).
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".json") {
            Some(JobFormat::Json)
        } else if name.ends_with(".nomad") {
            Some(JobFormat::Native)
        } else {
            None
        }
    }
}

/// A template registered from the input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSpec {
    /// Template file
    pub source: PathBuf,
    /// Rendered output inside the scratch directory
    pub destination: PathBuf,
    pub left_delim: String,
    pub right_delim: String,
    /// Parser applied to the rendered output, if any
    pub format: Option<JobFormat>,
}

impl TemplateSpec {
    /// Register `source`, rendering into `rendered_dir`.
    ///
    /// The destination is the base file name with the final `.tmpl` removed.
    pub fn new(source: &Path, config: &NomadSpaceConfig) -> Self {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stripped = file_name
            .strip_suffix(TEMPLATE_SUFFIX)
            .unwrap_or(&file_name)
            .to_string();

        TemplateSpec {
            source: source.to_path_buf(),
            destination: config.rendered_dir.join(&stripped),
            left_delim: config.left_delim.clone(),
            right_delim: config.right_delim.clone(),
            format: JobFormat::from_file_name(&stripped),
        }
    }

    /// Stable key identifying this template in the event buffer.
    pub fn id(&self) -> String {
        self.source.to_string_lossy().into_owned()
    }

    /// Base name of the template file, for logs and error messages.
    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id())
    }
}

/// Outcome of one render attempt of one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderEvent {
    /// Key of the template, see [`TemplateSpec::id`]
    pub template_id: String,
    pub template: TemplateSpec,
    pub updated_at: DateTime<Utc>,
    /// External dependencies that could not be resolved
    pub missing_deps: Option<BTreeSet<String>>,
    /// Rendered output; empty when nothing new was rendered
    pub contents: Vec<u8>,
}

/// Latest render event per template, shared between engine and consumer.
#[derive(Debug, Clone, Default)]
pub struct RenderEventBuffer {
    inner: Arc<Mutex<BTreeMap<String, RenderEvent>>>,
}

impl RenderEventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the event stored for the event's template.
    pub fn record(&self, event: RenderEvent) {
        let mut events = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        events.insert(event.template_id.clone(), event);
    }

    /// Copy of every buffered event.
    pub fn snapshot(&self) -> Vec<RenderEvent> {
        let events = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        events.values().cloned().collect()
    }
}

/// Sending half of a session, owned by the engine's worker task.
pub struct SessionSignals {
    done: Option<oneshot::Sender<()>>,
    errors: mpsc::Sender<String>,
    rendered: mpsc::Sender<()>,
    events_available: mpsc::Sender<()>,
    events: RenderEventBuffer,
    stop: CancellationToken,
}

impl SessionSignals {
    /// Store an event and notify the consumer.
    pub fn publish(&self, event: RenderEvent) {
        let rendered = !event.contents.is_empty();
        self.events.record(event);
        // Capacity-one channels: a pending notification already covers this one.
        let _ = self.events_available.try_send(());
        if rendered {
            let _ = self.rendered.try_send(());
        }
    }

    /// Report normal completion.
    pub fn done(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }

    /// Report a fatal error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.errors.try_send(reason.into());
    }

    /// Cancelled when the consumer stops the session.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

/// Receiving half of a running engine session.
pub struct WatchSession {
    pub(crate) done: oneshot::Receiver<()>,
    pub(crate) errors: mpsc::Receiver<String>,
    pub(crate) rendered: mpsc::Receiver<()>,
    pub(crate) events_available: mpsc::Receiver<()>,
    events: RenderEventBuffer,
    started_at: DateTime<Utc>,
    stop: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl WatchSession {
    /// Create the channel pair for a new session, stamped with the current
    /// instant.
    pub fn channel() -> (SessionSignals, WatchSession) {
        let (done_tx, done_rx) = oneshot::channel();
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let (rendered_tx, rendered_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(1);
        let events = RenderEventBuffer::new();
        let stop = CancellationToken::new();

        let signals = SessionSignals {
            done: Some(done_tx),
            errors: errors_tx,
            rendered: rendered_tx,
            events_available: events_tx,
            events: events.clone(),
            stop: stop.clone(),
        };
        let session = WatchSession {
            done: done_rx,
            errors: errors_rx,
            rendered: rendered_rx,
            events_available: events_rx,
            events,
            started_at: Utc::now(),
            stop,
            worker: None,
        };
        (signals, session)
    }

    /// Attach the task driving this session so [`WatchSession::stop`] can
    /// wait for it.
    pub fn with_worker(mut self, worker: JoinHandle<()>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Every event currently buffered.
    pub fn render_events(&self) -> Vec<RenderEvent> {
        self.events.snapshot()
    }

    /// Stop the engine and wait for its worker to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Starts watch sessions over a set of templates.
pub trait TemplateEngine: Send + Sync {
    /// Start rendering `templates`. `env` is the environment visible to
    /// templates. Must be called from within a tokio runtime.
    fn start(&self, templates: &[TemplateSpec], env: &HashMap<String, String>)
        -> Result<WatchSession>;
}

/// Environment handed to templates: the process environment plus the
/// namespace identity and the scratch directory.
pub fn template_env(config: &NomadSpaceConfig) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.insert("GEN_DIR".to_string(), config.rendered_dir.to_string_lossy().into_owned());
    env.insert(ENV_NOMADSPACE_ID.to_string(), config.id.to_string());
    env.insert("NS".to_string(), config.id.to_string());
    env
}
