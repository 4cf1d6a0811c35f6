//! In-memory fakes for the scheduler and template engine (testing only)
//!
//! `MemoryScheduler` records every registered job, `ManualEngine` hands the
//! test full control over render events and session outcomes, and
//! `KvServer` answers Consul KV reads over real HTTP.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{NomadSpaceError, Result};
use crate::job::Job;
use crate::scheduler::{RunResult, Scheduler};
use crate::template::{RenderEvent, SessionSignals, TemplateEngine, TemplateSpec, WatchSession};

// ---------------------------------------------------------------------------
// MemoryScheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SchedulerState {
    registered: Vec<Job>,
    failing: HashSet<String>,
    warnings: Vec<String>,
}

/// Scheduler that keeps registered jobs in memory.
///
/// `parse_native` understands just enough of the native syntax to pull the
/// job identifier out of `job "<id>" { ... }`.
#[derive(Debug)]
pub struct MemoryScheduler {
    state: Mutex<SchedulerState>,
    count: watch::Sender<usize>,
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            count: watch::channel(0).0,
        }
    }
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make registration of the (already namespaced) job `id` fail.
    pub fn fail_registration_of(&self, id: &str) {
        self.state.lock().unwrap().failing.insert(id.to_string());
    }

    /// Warnings returned by every successful registration.
    pub fn set_warnings(&self, warnings: &[&str]) {
        self.state.lock().unwrap().warnings = warnings.iter().map(|w| w.to_string()).collect();
    }

    /// Every job registered so far, in registration order.
    pub fn registered(&self) -> Vec<Job> {
        self.state.lock().unwrap().registered.clone()
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.registered()
            .iter()
            .map(|job| job.id_or_default().to_string())
            .collect()
    }

    /// Wait until at least `n` jobs have been registered.
    pub async fn wait_for_registrations(&self, n: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

fn job_header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| Regex::new(r#"job\s+"([^"]+)"\s*\{"#).unwrap())
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn parse_native(&self, source: &str) -> Result<Job> {
        let id = job_header()
            .captures(source)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| NomadSpaceError::Api {
                status: 400,
                body: "no job stanza found".to_string(),
            })?;
        Ok(Job {
            id: Some(id.clone()),
            name: Some(id),
            ..Default::default()
        })
    }

    async fn register(&self, job: &Job) -> Result<RunResult> {
        let result = {
            let mut state = self.state.lock().unwrap();
            if state.failing.contains(job.id_or_default()) {
                return Err(NomadSpaceError::Api {
                    status: 500,
                    body: format!("rejected {}", job.id_or_default()),
                });
            }
            state.registered.push(job.clone());
            RunResult {
                eval_id: format!("eval-{}", state.registered.len()),
                warnings: state.warnings.clone(),
            }
        };
        self.count.send_modify(|count| *count += 1);
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// ManualEngine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineState {
    current: Option<SessionSignals>,
    started_at: Option<DateTime<Utc>>,
    templates: Vec<TemplateSpec>,
    env: HashMap<String, String>,
    start_error: Option<String>,
}

/// Template engine driven entirely by the test.
///
/// Every `start` opens a new session and makes it the target of
/// [`ManualEngine::render`], [`ManualEngine::fail`] and
/// [`ManualEngine::finish`].
#[derive(Clone)]
pub struct ManualEngine {
    state: Arc<Mutex<EngineState>>,
    starts: Arc<watch::Sender<usize>>,
}

impl Default for ManualEngine {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            starts: Arc::new(watch::channel(0).0),
        }
    }
}

impl ManualEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start` call fail.
    pub fn fail_next_start(&self, reason: &str) {
        self.state.lock().unwrap().start_error = Some(reason.to_string());
    }

    /// Number of sessions started so far.
    pub fn starts(&self) -> usize {
        *self.starts.borrow()
    }

    /// Wait until at least `n` sessions have been started.
    pub async fn wait_for_starts(&self, n: usize) {
        let mut rx = self.starts.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Start instant of the current session.
    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().started_at
    }

    /// Templates passed to the latest `start`.
    pub fn templates(&self) -> Vec<TemplateSpec> {
        self.state.lock().unwrap().templates.clone()
    }

    /// Environment passed to the latest `start`.
    pub fn env(&self) -> HashMap<String, String> {
        self.state.lock().unwrap().env.clone()
    }

    /// Publish an event on the current session.
    pub fn publish(&self, event: RenderEvent) {
        if let Some(signals) = self.state.lock().unwrap().current.as_ref() {
            signals.publish(event);
        }
    }

    /// Publish rendered `contents` for `template` stamped `at`.
    pub fn render(&self, template: &TemplateSpec, contents: &str, at: DateTime<Utc>) {
        self.publish(RenderEvent {
            template_id: template.id(),
            template: template.clone(),
            updated_at: at,
            missing_deps: None,
            contents: contents.as_bytes().to_vec(),
        });
    }

    /// Fail the current session and drop its signals, like an engine worker
    /// exiting on error.
    pub fn fail(&self, reason: &str) {
        if let Some(signals) = self.state.lock().unwrap().current.take() {
            signals.fail(reason);
        }
    }

    /// Complete the current session and drop its signals.
    pub fn finish(&self) {
        if let Some(mut signals) = self.state.lock().unwrap().current.take() {
            signals.done();
        }
    }
}

impl TemplateEngine for ManualEngine {
    fn start(
        &self,
        templates: &[TemplateSpec],
        env: &HashMap<String, String>,
    ) -> Result<WatchSession> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.start_error.take() {
            return Err(NomadSpaceError::Engine(reason));
        }

        let (signals, session) = WatchSession::channel();
        state.current = Some(signals);
        state.started_at = Some(session.started_at());
        state.templates = templates.to_vec();
        state.env = env.clone();
        drop(state);

        self.starts.send_modify(|count| *count += 1);
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// KvServer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct KvState {
    values: HashMap<String, String>,
    tokens: Vec<Option<String>>,
}

/// Minimal Consul KV endpoint on a loopback port.
///
/// Answers `GET /v1/kv/<key>?raw=true` with the stored value, 404 for an
/// unknown key and 400 when `raw` is missing. Every response closes its
/// connection. The `X-Consul-Token` of each request is recorded.
pub struct KvServer {
    addr: SocketAddr,
    state: Arc<Mutex<KvState>>,
    requests: Arc<watch::Sender<usize>>,
    task: JoinHandle<()>,
}

impl KvServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(KvState::default()));
        let requests = Arc::new(watch::channel(0).0);

        let task = tokio::spawn({
            let state = state.clone();
            let requests = requests.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_kv(stream, state.clone(), requests.clone()));
                }
            }
        });

        Ok(KvServer {
            addr,
            state,
            requests,
            task,
        })
    }

    /// Base URL to hand to `ConsulConfig::new`.
    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn put(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .values
            .insert(key.to_string(), value.to_string());
    }

    /// Token sent with each request served so far.
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().tokens.clone()
    }

    /// Wait until at least `n` requests have been answered.
    pub async fn wait_for_requests(&self, n: usize) {
        let mut rx = self.requests.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

impl Drop for KvServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_kv(
    mut stream: TcpStream,
    state: Arc<Mutex<KvState>>,
    requests: Arc<watch::Sender<usize>>,
) {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&chunk[..n]),
        }
    }

    let head = String::from_utf8_lossy(&head).into_owned();
    let mut lines = head.lines();
    let target = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let token = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("x-consul-token")
            .then(|| value.trim().to_string())
    });

    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
    let key = path.strip_prefix("/v1/kv/").unwrap_or(path);
    let raw = query.split('&').any(|pair| pair == "raw=true" || pair == "raw");

    let (status, body) = {
        let mut state = state.lock().unwrap();
        state.tokens.push(token);
        match state.values.get(key) {
            _ if !raw => ("400 Bad Request", String::new()),
            Some(value) => ("200 OK", value.clone()),
            None => ("404 Not Found", String::new()),
        }
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    if stream.write_all(response.as_bytes()).await.is_ok() {
        let _ = stream.shutdown().await;
    }
    requests.send_modify(|count| *count += 1);
}
