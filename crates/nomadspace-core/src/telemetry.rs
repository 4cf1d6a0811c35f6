//! Tracing initialisation for the NomadSpace binary.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! since the global subscriber can only be set once per process. Logs go to
//! stderr; stdout is reserved for command output.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Target of the template engine's own logging.
pub const TEMPLATE_TARGET: &str = "nomadspace_core::template";

/// Build the filter used when `RUST_LOG` is unset: `level` for everything,
/// plus any extra `target=level` directives.
pub fn default_filter(level: Level, directives: &[String]) -> EnvFilter {
    let mut filter = EnvFilter::new(level.as_str());
    for directive in directives {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("ignoring log directive {:?}: {}", directive, e),
        }
    }
    filter
}

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
/// * `directives`: extra `target=level` filters, e.g. to raise the template
///   engine's verbosity independently.
///
/// `RUST_LOG`, when set, replaces the defaults entirely.
pub fn init_tracing(json: bool, level: Level, directives: &[String]) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(level, directives));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
