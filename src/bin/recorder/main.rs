mod collector;
mod scenario;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use scenario::{Scenario, ScenarioRunner, StdoutSink};
use step_recorder::{
    CoordinatorOptions, Document, HttpSink, JsonFileStore, MemoryStore, MetadataStore,
    RecorderConfig, SessionCoordinator, StepSink, SystemClock, UiEvent, capture_snapshot,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recorder", about = "Record browser interactions as replayable steps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collector that receives steps and streams them to a web page.
    Collect {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5001)]
        port: u16,
    },
    /// Play a scenario file through a live coordinator.
    Record {
        scenario: PathBuf,
        /// Print steps as JSON lines instead of posting them.
        #[arg(long)]
        stdout: bool,
        /// Overrides the configured collector URL.
        #[arg(long)]
        collector: Option<String>,
        /// Time left for in-flight HTTP deliveries before exiting.
        #[arg(long, default_value_t = 500)]
        linger_ms: u64,
    },
    /// Print the element snapshot and selector candidates for one node.
    Locate {
        dom: PathBuf,
        /// `ref` name or `id` of the target element.
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("step_recorder=info,recorder=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Collect { host, port } => collect(&host, port).await,
        Commands::Record {
            scenario,
            stdout,
            collector,
            linger_ms,
        } => record(scenario, stdout, collector, Duration::from_millis(linger_ms)).await,
        Commands::Locate { dom, target } => locate(dom, &target),
    }
}

async fn collect(host: &str, port: u16) -> Result<()> {
    let addr = collector::start_server(host, port).await?;
    info!("Open http://{} to watch incoming steps", addr);
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

async fn record(
    path: PathBuf,
    stdout: bool,
    collector_url: Option<String>,
    linger: Duration,
) -> Result<()> {
    let mut config = RecorderConfig::from_env()?;
    if let Some(url) = collector_url {
        config.collector_url = url;
    }
    let scenario = Scenario::load(&path)?;

    let sink: Arc<dyn StepSink> = if stdout {
        Arc::new(StdoutSink)
    } else {
        info!(collector = %config.collector_url, "posting steps to collector");
        Arc::new(HttpSink::new(&config.collector_url, config.request_timeout)?)
    };
    let store: Box<dyn MetadataStore> = match &config.store_path {
        Some(path) => Box::new(JsonFileStore::open(path)?),
        None => Box::new(MemoryStore::default()),
    };

    let coordinator = SessionCoordinator::new(sink, store, CoordinatorOptions::from(&config));
    let mut ui = coordinator.subscribe();
    let (handle, task) = coordinator.spawn();

    let monitor = tokio::spawn(async move {
        while let Ok(event) = ui.recv().await {
            match event {
                UiEvent::Status(status) => {
                    info!(recording = status.recording, paused = status.paused, "session status")
                }
                UiEvent::Step {
                    step,
                    origin,
                    panel,
                } => info!(
                    id = step.sequence_id,
                    action = %step.action,
                    selector = %step.primary_selector,
                    %origin,
                    panel = ?panel,
                    "step recorded"
                ),
            }
        }
    });

    let summary = ScenarioRunner::new(handle.clone(), Arc::new(SystemClock))
        .run(scenario)
        .await?;
    if summary.rejected_commands > 0 {
        warn!(count = summary.rejected_commands, "some session commands were rejected");
    }

    if !stdout {
        tokio::time::sleep(linger).await;
    }
    drop(handle);
    task.await.context("coordinator task failed")?;
    monitor.abort();
    Ok(())
}

fn locate(path: PathBuf, target: &str) -> Result<()> {
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let doc = Document::from_json(&raw)?;
    let node = doc.resolve(target)?;
    let snapshot = capture_snapshot(&doc, node)
        .with_context(|| format!("{target:?} is not an element"))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
