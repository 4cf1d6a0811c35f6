//! NomadSpace CLI
//!
//! Runs a directory of Nomad jobs and templates inside a private namespace
//! derived from the job name, resubmitting templated jobs whenever their
//! rendered output changes.
//!
//! ## Commands
//!
//! - (none): load, namespace and submit the input directory, then watch templates
//! - `id`: print the namespace identity of one or more seeds

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use nomadspace_core::config::ENV_NOMADSPACE_ID;
use nomadspace_core::telemetry::{self, TEMPLATE_TARGET};
use nomadspace_core::{
    ConsulKvEngine, DnsSearchOptions, NamespaceId, NomadClient, NomadSpace, NomadSpaceConfig,
    Supervisor, WatchConfig,
};

/// Variable Nomad exposes the job's `ns` meta under inside a task.
const ENV_META_NS: &str = "env.meta.ns";

#[derive(Parser)]
#[command(name = "nomadspace")]
#[command(version = nomadspace_core::VERSION)]
#[command(about = "Run Nomad job graphs in private, deterministic namespaces", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the namespace identity of each seed, or of the current task
    Id {
        /// Seeds to derive identities from
        seeds: Vec<String>,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Input directory where to find Nomad jobs and templates
    #[arg(long, env = "NOMADSPACE_INPUT_DIR", default_value = ".")]
    input_dir: PathBuf,

    /// Job name the namespace identity is derived from
    #[arg(long, env = "NOMAD_JOB_NAME")]
    job_name: Option<String>,

    /// Log the contents of rendered templates
    #[arg(long, env = "NOMADSPACE_PRINT_RENDERED", value_parser = BoolishValueParser::new())]
    print_rendered: bool,

    /// DNS server to add to container tasks
    #[arg(long, env = "NOMADSPACE_DNS_SERVER")]
    dns_server: Option<String>,

    /// DNS search domain to add to container tasks, ${NS} is replaced with the identity
    #[arg(long, env = "NOMADSPACE_DNS_SEARCH")]
    dns_search: Option<String>,

    /// Alias for --dns-search=service.${NS}.ns-consul.
    #[arg(long, env = "NOMADSPACE_DNS_SEARCH_NSDNS", value_parser = BoolishValueParser::new())]
    dns_search_nsdns: bool,

    /// Alias for --dns-search=service.consul.
    #[arg(long, env = "NOMADSPACE_DNS_SEARCH_CONSUL", value_parser = BoolishValueParser::new())]
    dns_search_consul: bool,

    /// Seconds between two polls of Consul KV
    #[arg(long, env = "NOMADSPACE_POLL_INTERVAL", default_value_t = 2)]
    poll_interval: u64,

    /// Stop once every template has rendered instead of watching forever
    #[arg(long, env = "NOMADSPACE_ONCE", value_parser = BoolishValueParser::new())]
    once: bool,

    /// Debug logging for the template engine only
    #[arg(long, env = "NOMADSPACE_VERBOSE_TEMPLATE", value_parser = BoolishValueParser::new())]
    verbose_template: bool,
}

impl RunArgs {
    fn dns_search_options(&self) -> DnsSearchOptions {
        DnsSearchOptions {
            search: self.dns_search.clone(),
            nsdns: self.dns_search_nsdns,
            consul: self.dns_search_consul,
        }
    }

    fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            once: self.once,
            ..WatchConfig::default()
        }
    }

    /// Build the instance configuration, rendering into `rendered_dir`.
    fn config(&self, rendered_dir: PathBuf) -> Result<NomadSpaceConfig> {
        let dns_search = self
            .dns_search_options()
            .resolve()
            .context("Invalid DNS search options")?;

        Ok(NomadSpaceConfig::new(
            NamespaceId::derive(self.job_name.as_deref().unwrap_or_default()),
            self.input_dir.clone(),
            rendered_dir,
        )
        .with_dns_search(dns_search)
        .with_dns_server(self.dns_server.clone())
        .with_print_rendered(self.print_rendered))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let mut directives = Vec::new();
    if cli.run.verbose_template {
        directives.push(format!("{}=debug", TEMPLATE_TARGET));
    }
    telemetry::init_tracing(cli.json, level, &directives);

    match cli.command {
        Some(Commands::Id { seeds }) => cmd_id(&seeds),
        None => cmd_run(&cli.run).await,
    }
}

fn cmd_id(seeds: &[String]) -> Result<()> {
    if seeds.is_empty() {
        let ns = current_namespace(|name| std::env::var(name).ok())
            .ok_or_else(|| anyhow!("neither {} nor {} is set", ENV_META_NS, ENV_NOMADSPACE_ID))?;
        println!("{}", ns);
        return Ok(());
    }

    for seed in seeds {
        println!("{}", NamespaceId::derive(seed));
    }
    Ok(())
}

/// Namespace of the task this process runs in, from its environment.
fn current_namespace(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    [ENV_META_NS, ENV_NOMADSPACE_ID]
        .into_iter()
        .find_map(|name| lookup(name).filter(|v| !v.is_empty()))
}

async fn cmd_run(args: &RunArgs) -> Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix("nomadspace-")
        .tempdir()
        .context("Failed to create render directory")?;
    let config = args.config(scratch.path().to_path_buf())?;

    info!("NomadSpace id:           {}", config.id);
    info!("NomadSpace source dir:   {}", config.input_dir.display());
    info!("NomadSpace rendered dir: {}", config.rendered_dir.display());

    let scheduler = NomadClient::from_env().context("Failed to create Nomad client")?;
    let engine =
        ConsulKvEngine::from_env(args.watch_config()).context("Failed to create Consul client")?;
    let space = NomadSpace::new(config, Arc::new(scheduler), Arc::new(engine));

    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new();
    supervisor.spawn("nomadspace", {
        let cancel = cancel.clone();
        move || async move { space.run(cancel).await }
    });

    let wait = supervisor.wait();
    tokio::pin!(wait);

    let mut interrupted = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            received = shutdown_signal() => {
                let name = received?;
                if interrupted {
                    bail!("received {} again, exiting without waiting for subsystems", name);
                }
                info!("Received {}, shutting down", name);
                cancel.cancel();
                interrupted = true;
            }
        }
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancellation() => {
            info!("Stopped");
            Ok(())
        }
        Err(e) => {
            warn!("NomadSpace stopped with errors");
            Err(e).context("NomadSpace failed")
        }
    }
}

/// Wait for SIGINT or SIGTERM and return its name.
async fn shutdown_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}
