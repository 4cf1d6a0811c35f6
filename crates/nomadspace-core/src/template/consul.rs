//! Template engine backed by the Consul KV HTTP API.
//!
//! Each session polls every KV path its templates reference, re-renders, and
//! publishes a [`RenderEvent`] whenever a template's output or its set of
//! missing dependencies changes. Rendered output is also written to the
//! template's destination file.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::render::{Rendered, Template};
use super::{RenderEvent, SessionSignals, TemplateEngine, TemplateSpec, WatchSession};
use crate::config::WatchConfig;
use crate::error::{NomadSpaceError, Result};

const DEFAULT_ADDR: &str = "http://127.0.0.1:8500";

/// Consul connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Agent address, e.g. `http://127.0.0.1:8500`
    pub address: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        ConsulConfig {
            address: DEFAULT_ADDR.to_string(),
            token: None,
        }
    }
}

impl ConsulConfig {
    /// Read `CONSUL_HTTP_ADDR` and `CONSUL_HTTP_TOKEN`.
    ///
    /// A bare `host:port` address is given an `http://` scheme.
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let address = non_empty("CONSUL_HTTP_ADDR")
            .map(|addr| {
                if addr.contains("://") {
                    addr
                } else {
                    format!("http://{}", addr)
                }
            })
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());

        ConsulConfig {
            address,
            token: non_empty("CONSUL_HTTP_TOKEN"),
        }
    }

    pub fn new(address: &str) -> Self {
        ConsulConfig {
            address: address.to_string(),
            token: None,
        }
    }
}

/// Thin Consul KV reader
#[derive(Clone)]
struct KvClient {
    config: ConsulConfig,
    http_client: reqwest::Client,
}

impl KvClient {
    /// Fetch the raw value at `path`; `None` when the key does not exist.
    async fn get(&self, path: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/v1/kv/{}",
            self.config.address.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut req = self.http_client.get(url).query(&[("raw", "true")]);
        if let Some(token) = &self.config.token {
            req = req.header("X-Consul-Token", token);
        }

        let response = req.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NomadSpaceError::Api {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(Some(response.text().await?))
    }
}

/// Template engine rendering from Consul KV
pub struct ConsulKvEngine {
    kv: KvClient,
    watch: WatchConfig,
}

impl ConsulKvEngine {
    pub fn new(config: ConsulConfig, watch: WatchConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("nomadspace/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(ConsulKvEngine {
            kv: KvClient {
                config,
                http_client,
            },
            watch,
        })
    }

    pub fn from_env(watch: WatchConfig) -> Result<Self> {
        Self::new(ConsulConfig::from_env(), watch)
    }
}

impl TemplateEngine for ConsulKvEngine {
    fn start(
        &self,
        templates: &[TemplateSpec],
        env: &HashMap<String, String>,
    ) -> Result<WatchSession> {
        // `start` is synchronous so that parse errors are returned before a
        // session exists. Template sources are small and read once per session.
        let mut compiled = Vec::with_capacity(templates.len());
        for spec in templates {
            let source = std::fs::read_to_string(&spec.source)
                .map_err(|e| NomadSpaceError::io(&spec.source, e))?;
            let template =
                Template::parse(&spec.file_name(), &source, &spec.left_delim, &spec.right_delim)?;
            compiled.push(Watched::new(spec.clone(), template));
        }

        let (signals, session) = WatchSession::channel();
        let worker = tokio::spawn(watch_templates(
            self.kv.clone(),
            self.watch.clone(),
            compiled,
            env.clone(),
            signals,
        ));
        Ok(session.with_worker(worker))
    }
}

/// A template plus what was last published for it.
struct Watched {
    spec: TemplateSpec,
    template: Template,
    last_output: Option<String>,
    last_missing: Option<BTreeSet<String>>,
}

impl Watched {
    fn new(spec: TemplateSpec, template: Template) -> Self {
        Self {
            spec,
            template,
            last_output: None,
            last_missing: None,
        }
    }
}

async fn watch_templates(
    kv: KvClient,
    watch: WatchConfig,
    mut templates: Vec<Watched>,
    env: HashMap<String, String>,
    mut signals: SessionSignals,
) {
    let stop = signals.stop_token();
    let mut failures = 0u32;
    info!(templates = templates.len(), "Watching templates");

    loop {
        match poll_once(&kv, &mut templates, &env, &signals).await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(attempt = failures, "Template poll failed: {}", e);
                if failures >= watch.max_failures {
                    signals.fail(e.to_string());
                    return;
                }
            }
        }

        if watch.once && templates.iter().all(|t| t.last_output.is_some()) {
            debug!("All templates rendered once");
            signals.done();
            return;
        }

        tokio::select! {
            _ = stop.cancelled() => {
                debug!("Template watch stopped");
                return;
            }
            _ = tokio::time::sleep(watch.poll_interval) => {}
        }
    }
}

async fn poll_once(
    kv: &KvClient,
    templates: &mut [Watched],
    env: &HashMap<String, String>,
    signals: &SessionSignals,
) -> Result<()> {
    let paths: BTreeSet<String> = templates.iter().flat_map(|t| t.template.kv_keys()).collect();
    let mut values = HashMap::with_capacity(paths.len());
    for path in paths {
        let value = kv.get(&path).await?;
        values.insert(path, value);
    }

    for watched in templates.iter_mut() {
        match watched.template.render(&values, env) {
            Rendered::Complete(output) => {
                if watched.last_output.as_deref() == Some(output.as_str()) {
                    continue;
                }
                write_destination(&watched.spec, &output).await?;
                watched.last_output = Some(output.clone());
                watched.last_missing = None;
                signals.publish(RenderEvent {
                    template_id: watched.spec.id(),
                    template: watched.spec.clone(),
                    updated_at: Utc::now(),
                    missing_deps: None,
                    contents: output.into_bytes(),
                });
            }
            Rendered::Missing(missing) => {
                if watched.last_missing.as_ref() == Some(&missing) {
                    continue;
                }
                watched.last_missing = Some(missing.clone());
                signals.publish(RenderEvent {
                    template_id: watched.spec.id(),
                    template: watched.spec.clone(),
                    updated_at: Utc::now(),
                    missing_deps: Some(missing),
                    contents: Vec::new(),
                });
            }
        }
    }
    Ok(())
}

async fn write_destination(spec: &TemplateSpec, output: &str) -> Result<()> {
    if let Some(parent) = spec.destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| NomadSpaceError::io(parent, e))?;
    }
    tokio::fs::write(&spec.destination, output)
        .await
        .map_err(|e| NomadSpaceError::io(&spec.destination, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NomadSpaceConfig;
    use crate::fakes::KvServer;
    use crate::identity::NamespaceId;
    use std::time::Duration;
    use tempfile::tempdir;

    fn spec_in(dir: &std::path::Path, name: &str, body: &str) -> TemplateSpec {
        let source = dir.join(name);
        std::fs::write(&source, body).unwrap();
        let config = NomadSpaceConfig::new(
            NamespaceId::derive("test"),
            dir.to_path_buf(),
            dir.join("rendered"),
        );
        TemplateSpec::new(&source, &config)
    }

    #[test]
    fn test_config_adds_scheme() {
        std::env::set_var("CONSUL_HTTP_ADDR", "consul.service:8500");
        let config = ConsulConfig::from_env();
        std::env::remove_var("CONSUL_HTTP_ADDR");
        assert_eq!(config.address, "http://consul.service:8500");
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_template() {
        let dir = tempdir().unwrap();
        let spec = spec_in(dir.path(), "bad.json.tmpl", r#"[[ service "web" ]]"#);
        let engine = ConsulKvEngine::new(ConsulConfig::default(), WatchConfig::default()).unwrap();

        let err = engine.start(&[spec], &HashMap::new()).err().unwrap();
        assert!(err.to_string().contains("bad.json.tmpl"));
    }

    #[tokio::test]
    async fn test_static_template_renders_without_consul() {
        let dir = tempdir().unwrap();
        let spec = spec_in(dir.path(), "dyn.json.tmpl", r#"{"ID":"[[ env "NS" ]]-dynamic"}"#);
        let destination = spec.destination.clone();
        let engine = ConsulKvEngine::new(
            ConsulConfig::new("http://127.0.0.1:1"),
            WatchConfig {
                poll_interval: Duration::from_millis(10),
                max_failures: 1,
                once: true,
            },
        )
        .unwrap();

        let env = HashMap::from([("NS".to_string(), "abc".to_string())]);
        let mut session = engine.start(&[spec], &env).unwrap();
        assert!((&mut session.done).await.is_ok());

        let events = session.render_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].contents, br#"{"ID":"abc-dynamic"}"#);
        assert_eq!(
            std::fs::read_to_string(destination).unwrap(),
            r#"{"ID":"abc-dynamic"}"#
        );
        session.stop().await;
    }

    #[tokio::test]
    async fn test_kv_value_is_rendered_with_token() {
        let server = KvServer::start().await.unwrap();
        server.put("jobs/id", "dynamic");

        let dir = tempdir().unwrap();
        let spec = spec_in(dir.path(), "kv.json.tmpl", r#"{"ID":"[[ key "jobs/id" ]]"}"#);
        let engine = ConsulKvEngine::new(
            ConsulConfig {
                address: server.address(),
                token: Some("s3cr3t".to_string()),
            },
            WatchConfig {
                poll_interval: Duration::from_millis(10),
                max_failures: 1,
                once: true,
            },
        )
        .unwrap();

        let mut session = engine.start(&[spec], &HashMap::new()).unwrap();
        assert!((&mut session.done).await.is_ok());

        let events = session.render_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].missing_deps, None);
        assert_eq!(events[0].contents, br#"{"ID":"dynamic"}"#);
        assert_eq!(server.tokens(), vec![Some("s3cr3t".to_string())]);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_absent_key_is_a_missing_dependency() {
        let server = KvServer::start().await.unwrap();

        let dir = tempdir().unwrap();
        let spec = spec_in(dir.path(), "kv.json.tmpl", r#"{"ID":"[[ key "jobs/id" ]]"}"#);
        let destination = spec.destination.clone();
        let engine = ConsulKvEngine::new(
            ConsulConfig::new(&server.address()),
            WatchConfig {
                poll_interval: Duration::from_millis(10),
                max_failures: 1,
                once: false,
            },
        )
        .unwrap();

        let mut session = engine.start(&[spec], &HashMap::new()).unwrap();
        assert!(session.events_available.recv().await.is_some());

        let events = session.render_events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].missing_deps,
            Some(BTreeSet::from(["kv.block(jobs/id)".to_string()]))
        );
        assert!(events[0].contents.is_empty());
        assert!(!destination.exists());
        assert_eq!(server.tokens()[0], None);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_consul_fails_session() {
        let dir = tempdir().unwrap();
        let spec = spec_in(dir.path(), "kv.json.tmpl", r#"{"ID":"[[ key "jobs/id" ]]"}"#);
        let engine = ConsulKvEngine::new(
            ConsulConfig::new("http://127.0.0.1:1"),
            WatchConfig {
                poll_interval: Duration::from_millis(10),
                max_failures: 2,
                once: false,
            },
        )
        .unwrap();

        let mut session = engine.start(&[spec], &HashMap::new()).unwrap();
        let reason = session.errors.recv().await;
        assert!(reason.is_some());
        assert!(session.render_events().is_empty());
        session.stop().await;
    }
}
