//! Rewrites a job so it lives inside one namespace.

use serde_json::{Map, Value};

use crate::config::{NomadSpaceConfig, ENV_NOMADSPACE_ID};
use crate::identity::NamespaceId;
use crate::job::{Job, Service, Task};

/// Metadata key holding the namespace identity
pub const META_NS: &str = "ns";
/// Metadata key holding the `"<id>-"` prefix
pub const META_NS_PREFIX: &str = "ns.prefix";

const DNS_SEARCH_KEY: &str = "dns_search_domains";
const DNS_SERVERS_KEY: &str = "dns_servers";

/// Applies the namespace identity to job documents.
///
/// Every rule is idempotent: namespacing a job twice leaves it as after the
/// first pass.
#[derive(Debug, Clone)]
pub struct Namespacer {
    id: NamespaceId,
    dns_search: Option<String>,
    dns_server: Option<String>,
}

impl Namespacer {
    pub fn new(id: NamespaceId) -> Self {
        Self {
            id,
            dns_search: None,
            dns_server: None,
        }
    }

    pub fn from_config(config: &NomadSpaceConfig) -> Self {
        Self {
            id: config.id.clone(),
            dns_search: config.dns_search.clone(),
            dns_server: config.dns_server.clone(),
        }
    }

    pub fn with_dns(mut self, search: Option<String>, server: Option<String>) -> Self {
        self.dns_search = search;
        self.dns_server = server;
        self
    }

    /// Namespace `job` in place.
    pub fn apply(&self, job: &mut Job) {
        job.id = Some(self.id.prefixed(job.id_or_default()));
        if let Some(name) = job.name.as_mut() {
            *name = self.id.prefixed(name);
        }

        let meta = job.meta.get_or_insert_with(Default::default);
        meta.insert(META_NS.to_string(), self.id.to_string());
        meta.insert(META_NS_PREFIX.to_string(), self.id.prefix());

        for group in job.task_groups.iter_mut().flatten() {
            self.prefix_services(group.services.as_mut());
        }

        for task in job.tasks_mut() {
            self.apply_task(task);
        }
    }

    fn apply_task(&self, task: &mut Task) {
        task.env
            .get_or_insert_with(Default::default)
            .insert(ENV_NOMADSPACE_ID.to_string(), self.id.to_string());

        if task.driver.is_container() {
            if let Some(search) = &self.dns_search {
                let config = task.config.get_or_insert_with(Map::new);
                append_unique(config, DNS_SEARCH_KEY, search);
            }
            if let Some(server) = &self.dns_server {
                let config = task.config.get_or_insert_with(Map::new);
                append_unique(config, DNS_SERVERS_KEY, server);
            }
        }

        self.prefix_services(task.services.as_mut());
    }

    fn prefix_services(&self, services: Option<&mut Vec<Service>>) {
        for service in services.into_iter().flatten() {
            service.name = self.id.prefixed(&service.name);
        }
    }
}

/// Append `value` to the list stored under `key`, keeping existing entries.
///
/// A scalar string is promoted to a one-element list first.
fn append_unique(config: &mut Map<String, Value>, key: &str, value: &str) {
    let mut list: Vec<Value> = match config.remove(key) {
        Some(Value::Array(items)) => items,
        Some(Value::String(s)) => vec![Value::String(s)],
        _ => Vec::new(),
    };
    if !list.iter().any(|v| v.as_str() == Some(value)) {
        list.push(Value::String(value.to_string()));
    }
    config.insert(key.to_string(), Value::Array(list));
}
