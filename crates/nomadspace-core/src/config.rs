//! Runtime configuration for a NomadSpace instance.
//!
//! The binary builds a [`NomadSpaceConfig`] from flags and environment and
//! hands it to the components that need it; nothing here reads process
//! globals except the explicit `from_env` helpers on the client configs.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NomadSpaceError, Result};
use crate::identity::NamespaceId;

/// Default template delimiters. Chosen so that Nomad's own `{{ }}`
/// interpolation can appear verbatim in templates.
pub const DEFAULT_LEFT_DELIM: &str = "[[";
pub const DEFAULT_RIGHT_DELIM: &str = "]]";

/// Placeholder replaced by the namespace identity in DNS search settings.
pub const NS_PLACEHOLDER: &str = "${NS}";

/// Search domain served by the namespace-aware DNS server.
pub const NSDNS_SEARCH: &str = "service.${NS}.ns-consul.";

/// Consul's own service search domain.
pub const CONSUL_SEARCH: &str = "service.consul.";

/// Environment key set on every task.
pub const ENV_NOMADSPACE_ID: &str = "NOMADSPACE_ID";

/// Configuration shared by the namespacer, loader and reconciliation loop.
#[derive(Debug, Clone)]
pub struct NomadSpaceConfig {
    /// Namespace identity of this instance
    pub id: NamespaceId,
    /// Directory holding job files and templates
    pub input_dir: PathBuf,
    /// Private scratch directory for rendered templates
    pub rendered_dir: PathBuf,
    /// DNS search domain appended to container tasks, already substituted
    pub dns_search: Option<String>,
    /// DNS server appended to container tasks
    pub dns_server: Option<String>,
    /// Log the full contents of every rendered template
    pub print_rendered: bool,
    pub left_delim: String,
    pub right_delim: String,
}

impl NomadSpaceConfig {
    pub fn new(id: NamespaceId, input_dir: PathBuf, rendered_dir: PathBuf) -> Self {
        Self {
            id,
            input_dir,
            rendered_dir,
            dns_search: None,
            dns_server: None,
            print_rendered: false,
            left_delim: DEFAULT_LEFT_DELIM.to_string(),
            right_delim: DEFAULT_RIGHT_DELIM.to_string(),
        }
    }

    /// Set the DNS search domain, substituting `${NS}` with the identity.
    pub fn with_dns_search(mut self, search: Option<String>) -> Self {
        self.dns_search = search
            .filter(|s| !s.is_empty())
            .map(|s| s.replace(NS_PLACEHOLDER, self.id.as_str()));
        self
    }

    pub fn with_dns_server(mut self, server: Option<String>) -> Self {
        self.dns_server = server.filter(|s| !s.is_empty());
        self
    }

    pub fn with_print_rendered(mut self, print: bool) -> Self {
        self.print_rendered = print;
        self
    }
}

/// DNS search options as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct DnsSearchOptions {
    /// Explicit search domain, may contain `${NS}`
    pub search: Option<String>,
    /// Use the namespace-aware DNS domain
    pub nsdns: bool,
    /// Use Consul's service domain
    pub consul: bool,
}

impl DnsSearchOptions {
    /// Resolve to a single search domain (still containing `${NS}`).
    ///
    /// The aliases are mutually exclusive with each other and with an
    /// explicit search domain.
    pub fn resolve(&self) -> Result<Option<String>> {
        let explicit = self.search.clone().filter(|s| !s.is_empty());

        if self.consul {
            if self.nsdns || explicit.is_some() {
                return Err(NomadSpaceError::Config(
                    "cannot combine --dns-search-consul with other --dns-search options"
                        .to_string(),
                ));
            }
            Ok(Some(CONSUL_SEARCH.to_string()))
        } else if self.nsdns {
            if explicit.is_some() {
                return Err(NomadSpaceError::Config(
                    "cannot combine --dns-search-nsdns with other --dns-search options"
                        .to_string(),
                ));
            }
            Ok(Some(NSDNS_SEARCH.to_string()))
        } else {
            Ok(explicit)
        }
    }
}

/// Polling behaviour of the template engine.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Delay between two polls of the KV store
    pub poll_interval: Duration,
    /// Consecutive transport failures tolerated before the engine gives up
    pub max_failures: u32,
    /// Stop with "done" once every template has rendered
    pub once: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_failures: 5,
            once: false,
        }
    }
}
