//! Funnel Insights: runs funnel, cohort and segment analyses over a JSON
//! dataset of funnel definitions and visitor events.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use funnel_analytics::export::step_rows;
use funnel_analytics::{FunnelAnalyzer, InMemoryEventStore, InMemoryFunnelStore};
use funnel_core::config::AppConfig;
use funnel_core::error::AnalysisError;
use funnel_core::types::{FunnelDefinition, Granularity, Period, RawEvent};

#[derive(Parser, Debug)]
#[command(name = "funnel-insights")]
#[command(about = "Funnel conversion, cohort and segment analysis")]
#[command(version)]
struct Cli {
    /// JSON dataset with `funnels` and `events` arrays
    #[arg(long, env = "FUNNEL_INSIGHTS__DATA")]
    data: PathBuf,

    /// Config file (TOML, YAML or JSON; extension optional)
    #[arg(long, default_value = "funnel-insights")]
    config: String,

    /// Analysis deadline in milliseconds (overrides config)
    #[arg(long, env = "FUNNEL_INSIGHTS__ANALYSIS__TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Sessions per worker shard (overrides config)
    #[arg(long, env = "FUNNEL_INSIGHTS__ANALYSIS__SHARD_SIZE")]
    shard_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct Window {
    #[arg(long)]
    funnel_id: Uuid,
    /// RFC 3339 start of the window (inclusive)
    #[arg(long)]
    start: DateTime<Utc>,
    /// RFC 3339 end of the window (inclusive)
    #[arg(long)]
    end: DateTime<Utc>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Step-level conversion and drop-off
    Analyze {
        #[command(flatten)]
        window: Window,
    },
    /// Completion by entry date
    Cohorts {
        #[command(flatten)]
        window: Window,
        /// day, week or month
        #[arg(long, default_value = "day")]
        granularity: String,
    },
    /// Completion by session attribute
    Segments {
        #[command(flatten)]
        window: Window,
        /// browser, device, source or location
        #[arg(long)]
        dimension: String,
    },
    /// One row per step with formatted rates and durations
    Export {
        #[command(flatten)]
        window: Window,
    },
    /// List the funnels in the dataset
    Funnels,
}

#[derive(Debug, Deserialize)]
struct Dataset {
    #[serde(default)]
    funnels: Vec<FunnelDefinition>,
    #[serde(default)]
    events: Vec<RawEvent>,
}

fn load_dataset(path: &Path) -> anyhow::Result<Dataset> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading dataset {}", path.display()))?;
    let dataset: Dataset = serde_json::from_str(&raw)
        .with_context(|| format!("parsing dataset {}", path.display()))?;
    Ok(dataset)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funnel_insights=info,funnel_analytics=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(timeout_ms) = cli.timeout_ms {
        config.analysis.timeout_ms = timeout_ms;
    }
    if let Some(shard_size) = cli.shard_size {
        config.analysis.shard_size = shard_size;
    }

    info!(
        shard_size = config.analysis.shard_size,
        timeout_ms = config.analysis.timeout_ms,
        cache = config.cache.enabled,
        "Configuration loaded"
    );

    let dataset = load_dataset(&cli.data)?;
    let funnels = Arc::new(InMemoryFunnelStore::new());
    let events = Arc::new(InMemoryEventStore::new());
    events.extend(dataset.events);

    let analyzer = FunnelAnalyzer::from_config(funnels, events.clone(), &config);
    let mut defined = 0usize;
    for definition in dataset.funnels {
        let funnel_id = definition.id;
        match analyzer.define_funnel(definition) {
            Ok(_) => defined += 1,
            Err(e) => warn!(funnel_id = %funnel_id, error = %e, "Skipping invalid funnel"),
        }
    }
    info!(funnels = defined, events = events.len(), "Dataset loaded");

    // Ctrl-C cancels whatever analysis is in flight.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = run(&analyzer, cli.command, &cancel).await;
    if let Err(e) = outcome {
        eprintln!("{}", serde_json::to_string(&e.to_body())?);
        std::process::exit(if e.is_cancellation() { 130 } else { 1 });
    }
    Ok(())
}

async fn run(
    analyzer: &FunnelAnalyzer,
    command: Command,
    cancel: &CancellationToken,
) -> Result<(), AnalysisError> {
    match command {
        Command::Analyze { window } => {
            let period = Period::new(window.start, window.end)?;
            let result = analyzer.analyze_funnel(window.funnel_id, period, cancel).await?;
            print_json(&result)?;
        }
        Command::Cohorts {
            window,
            granularity,
        } => {
            let period = Period::new(window.start, window.end)?;
            let granularity: Granularity = granularity.parse()?;
            let rows = analyzer
                .cohort_analysis(window.funnel_id, period, granularity, cancel)
                .await?;
            print_json(&rows)?;
        }
        Command::Segments { window, dimension } => {
            let period = Period::new(window.start, window.end)?;
            let rows = analyzer
                .segment_analysis(window.funnel_id, &dimension, period, cancel)
                .await?;
            print_json(&rows)?;
        }
        Command::Export { window } => {
            let period = Period::new(window.start, window.end)?;
            let result = analyzer.analyze_funnel(window.funnel_id, period, cancel).await?;
            print_json(&step_rows(&result))?;
        }
        Command::Funnels => {
            let listing: Vec<serde_json::Value> = analyzer
                .list_funnels()?
                .iter()
                .map(|f| serde_json::json!({ "id": f.id, "name": f.name, "steps": f.steps.len() }))
                .collect();
            print_json(&listing)?;
        }
    }
    Ok(())
}
