//! `jsverticle`: deploy a JavaScript component against a real timer host.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use jsverticle::{
    ArchiveLoader, CapabilityProbe, ComponentFactory, DirectoryLoader, HostSystem,
    IsolationSupport, JsComponentFactory, LifecycleFuture, ResourceLoader, ThreadedHost,
    completion, environment,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// How long to wait for a lifecycle token before giving up.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "jsverticle", version, about = "Run JavaScript components")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy a component, keep it running for a while, then stop it.
    Run {
        /// Directory, or `.zip`/`.jar` archive, holding the component.
        source: PathBuf,
        /// Component name inside the source (a `js:` prefix is accepted).
        component: String,
        /// Seconds to keep the component running after it started.
        #[arg(long = "for", value_name = "SECS", default_value_t = 0)]
        duration: u64,
        /// Allow package-style components to run in the isolated runtime.
        #[arg(long)]
        node_packages: bool,
    },
    /// Evaluate an expression in the embedded engine and print it as JSON.
    Eval {
        expr: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();
}

fn loader_for(source: &Path) -> Result<Arc<dyn ResourceLoader>> {
    if source.is_dir() {
        return Ok(Arc::new(DirectoryLoader::new(source)));
    }
    match source.extension().and_then(|ext| ext.to_str()) {
        Some("zip" | "jar") if source.is_file() => Ok(Arc::new(ArchiveLoader::new(source))),
        _ => bail!(
            "{} is neither a directory nor a .zip/.jar archive",
            source.display()
        ),
    }
}

/// Isolation only ever applies to archive sources.
fn check_isolation(loader: &dyn ResourceLoader, node_packages: bool) -> Result<()> {
    if node_packages && !loader.is_isolating() {
        bail!(
            "--node-packages needs a .zip/.jar archive; {} would run embedded",
            loader.describe()
        );
    }
    Ok(())
}

fn await_lifecycle(phase: &str, future: &LifecycleFuture) -> Result<()> {
    match future.wait_timeout(LIFECYCLE_TIMEOUT) {
        Some(Ok(())) => Ok(()),
        Some(Err(cause)) => Err(anyhow!("{phase} failed: {cause}")),
        None => bail!(
            "{phase} did not complete within {}s",
            LIFECYCLE_TIMEOUT.as_secs()
        ),
    }
}

fn run(source: &Path, name: &str, duration: u64, node_packages: bool) -> Result<()> {
    let loader = loader_for(source)?;
    check_isolation(loader.as_ref(), node_packages)?;

    let host: Arc<dyn HostSystem> =
        Arc::new(ThreadedHost::new().context("failed to start timer thread")?);
    let mut factory = JsComponentFactory::new(Arc::clone(&host));
    if node_packages {
        factory = factory.with_isolation(Arc::new(IsolationSupport::new(
            true,
            CapabilityProbe::standard(),
        )));
    }

    let mut component = factory
        .create_component(name, loader)
        .with_context(|| format!("failed to create component {name}"))?;
    tracing::info!(component = name, kind = ?component.kind(), "deploying");

    let (token, started) = completion();
    component
        .start(token)
        .with_context(|| format!("failed to start {name}"))?;
    await_lifecycle("start", &started)?;
    tracing::info!(component = name, "started");

    if duration > 0 {
        std::thread::sleep(Duration::from_secs(duration));
    }

    let (token, stopped) = completion();
    component
        .stop(token)
        .with_context(|| format!("failed to stop {name}"))?;
    await_lifecycle("stop", &stopped)?;
    tracing::info!(component = name, "stopped");
    Ok(())
}

fn eval(expr: &str) -> Result<()> {
    let host: Arc<dyn HostSystem> =
        Arc::new(ThreadedHost::new().context("failed to start timer thread")?);
    let engine = environment::ensure_ready(&host)?;
    let value = engine.eval_json(expr)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            source,
            component,
            duration,
            node_packages,
        } => run(&source, &component, duration, node_packages),
        Command::Eval { expr } => eval(&expr),
    }
}
