//! Harbor CLI - plugin host runtime

use clap::{Parser, Subcommand};
use harbor_core::config::HostConfig;
use harbor_plugins::manifest::SerializerRegistry;
use harbor_plugins::validation::{Rejection, ValidatorPipeline};
use harbor_plugins::{
    CachingHost, ConcurrencyLimitedHost, DependencyGraph, Discovery, DiscoveryIssue,
    DiscoveryReport, HostRuntime, LoadReport, PluginHost,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "harbor")]
#[command(author, version, about = "Plugin host runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file (defaults to the harbor config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugin manifests found under a directory
    Discover {
        /// Plugin directory
        dir: PathBuf,
    },

    /// Validate manifests and compute the load order without loading anything
    Check {
        /// Plugin directory
        dir: PathBuf,
    },

    /// Load every plugin under a directory and host them until interrupted
    Run {
        /// Plugin directory
        dir: PathBuf,
        /// Unload and exit right after loading
        #[arg(long)]
        once: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("harbor=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Discover { dir } => {
            cmd_discover(&load_config(cli.config.as_deref())?, &dir, out).await
        }
        Commands::Check { dir } => {
            cmd_check(&load_config(cli.config.as_deref())?, &dir, out).await
        }
        Commands::Run { dir, once } => {
            cmd_run(load_config(cli.config.as_deref())?, &dir, once, out).await
        }
        Commands::Config { action } => cmd_config(action, cli.config.as_deref(), out),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HostConfig> {
    let config = match path {
        Some(path) => HostConfig::load_from(path)?,
        None => HostConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn print_issues(issues: &[DiscoveryIssue]) {
    for issue in issues {
        println!("  [skipped] {} - {}", issue.path.display(), issue.reason);
    }
}

fn print_rejections(rejections: &[Rejection]) {
    for rejection in rejections {
        for failure in &rejection.failures {
            println!(
                "  [rejected] {} ({}): {}",
                rejection.plugin_id,
                failure.rule,
                failure.reasons.join("; ")
            );
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn discover(config: &HostConfig, dir: &Path) -> anyhow::Result<DiscoveryReport> {
    let discovery = Discovery::new(
        config.discovery.clone(),
        Arc::new(SerializerRegistry::with_defaults()),
    );
    Ok(discovery.discover(dir, &CancellationToken::new()).await?)
}

async fn cmd_discover(config: &HostConfig, dir: &Path, out: Output) -> anyhow::Result<()> {
    let report = discover(config, dir).await?;
    if out.json() {
        return out.print_json(&report);
    }

    if report.descriptors.is_empty() {
        if !out.quiet {
            println!("No plugin manifests found in {}", dir.display());
        }
    } else {
        if !out.quiet {
            println!("Plugins:");
        }
        for descriptor in &report.descriptors {
            println!(
                "  {} {} ({}) - {}",
                descriptor.id,
                descriptor.version,
                descriptor.entry_type,
                descriptor.artifact.display()
            );
        }
    }
    if !out.quiet {
        print_issues(&report.issues);
    }
    Ok(())
}

#[derive(Serialize)]
struct CheckReport {
    order: Vec<String>,
    rejected: Vec<Rejection>,
    issues: Vec<DiscoveryIssue>,
}

async fn cmd_check(config: &HostConfig, dir: &Path, out: Output) -> anyhow::Result<()> {
    let report = discover(config, dir).await?;
    let validator = ValidatorPipeline::from_config(&config.validation);
    let outcome = validator.validate(report.descriptors, &HashSet::new());

    let graph = DependencyGraph::build(&outcome.admitted)?;
    let order = graph.topological_order()?;
    let check = CheckReport {
        order,
        rejected: outcome.rejected,
        issues: report.issues,
    };

    if out.json() {
        out.print_json(&check)?;
    } else {
        if !out.quiet {
            println!("Load order:");
            for (position, id) in check.order.iter().enumerate() {
                println!("  {}. {}", position + 1, id);
            }
            print_rejections(&check.rejected);
            print_issues(&check.issues);
        }
        if check.rejected.is_empty() {
            println!("{} plugin(s) ready to load.", check.order.len());
        }
    }

    if !check.rejected.is_empty() {
        anyhow::bail!("{} plugin(s) failed validation", check.rejected.len());
    }
    Ok(())
}

fn print_load_report(report: &LoadReport, out: Output) {
    if out.quiet {
        return;
    }
    for id in &report.loaded {
        println!("  [running] {id}");
    }
    for failure in &report.failures {
        println!(
            "  [failed] {} ({} during {}): {}",
            failure.plugin_id, failure.code, failure.phase, failure.message
        );
    }
    for id in &report.cancelled {
        println!("  [cancelled] {id}");
    }
    print_rejections(&report.rejected);
    print_issues(&report.discovery_issues);
}

async fn cmd_run(config: HostConfig, dir: &Path, once: bool, out: Output) -> anyhow::Result<()> {
    let runtime = HostRuntime::builder(config).with_default_backends()?.build()?;
    let ttl = runtime.config().cache.discovery_ttl();
    let host = CachingHost::new(
        Arc::new(ConcurrencyLimitedHost::from_runtime(Arc::clone(&runtime))),
        ttl,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let report = host.discover_and_load(dir, &cancel).await?;
    if out.json() {
        out.print_json(&report)?;
    } else {
        print_load_report(&report, out);
        println!("Loaded {} plugin(s).", report.loaded.len());
    }

    if !once && !cancel.is_cancelled() {
        info!(plugins = report.loaded.len(), "Hosting plugins; press Ctrl-C to stop");
        cancel.cancelled().await;
    }

    // Shutdown runs to completion even after an interrupt
    let unloaded = host.unload_all(&CancellationToken::new()).await?;
    if !out.quiet && !out.json() {
        println!("Unloaded {} plugin(s).", unloaded.len());
    }

    if !report.failures.is_empty() {
        warn!(failed = report.failures.len(), "Some plugins failed to load");
        anyhow::bail!("{} plugin(s) failed to load", report.failures.len());
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, path: Option<&Path>, out: Output) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(path)?;
            if out.json() {
                out.print_json(&config)?;
            } else {
                for (key, value) in config.list()? {
                    println!("{} = {}", key, value);
                }
            }
        }
        ConfigAction::Path => {
            let path = match path {
                Some(path) => path.to_path_buf(),
                None => HostConfig::config_path()?,
            };
            println!("{}", path.display());
        }
    }
    Ok(())
}
