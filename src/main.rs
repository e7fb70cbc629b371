mod ai;
mod checkpoint;
mod config;
mod db;
mod discover;
mod entity;
mod error;
mod normalize;
mod pacer;
mod parser;
mod pipeline;
mod scraper;
mod search;
mod sink;
mod triage;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use crate::ai::Gemini;
use crate::checkpoint::CheckpointStore;
use crate::config::{FetchBackend, Secrets, Settings};
use crate::db::{SqliteStore, TabularStore};
use crate::discover::Discovery;
use crate::pacer::Pacer;
use crate::pipeline::{Driver, Services};
use crate::scraper::{HttpFetcher, PageFetcher, SpiderFetcher};
use crate::search::SerperSearch;
use crate::triage::Tier;

#[derive(Parser)]
#[command(name = "sports_scout", about = "Discover, enrich and triage sports organizations")]
struct Cli {
    /// Config file (default: ./scout.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find organizations on directory pages and add them to the raw table
    Discover {
        /// Run a single mission instead of the configured ones
        #[arg(short, long)]
        mission: Option<String>,
    },
    /// Enrich and triage raw entities into the tier tables
    Run {
        /// Max entities to process (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Row counts per table and checkpoint sizes
    Stats,
    /// Print a table as tab-separated values
    Export {
        /// Table name, or a tier code P1..P5
        sheet: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let store = SqliteStore::open(&settings.paths.db)?;

    let result = match cli.command {
        Commands::Discover { mission } => {
            let services = build_services(&settings)?;
            let anchors = CheckpointStore::load(&settings.paths.anchors)?;
            let missions = match mission {
                Some(m) => vec![m],
                None => settings.discovery.missions.clone(),
            };
            if missions.is_empty() {
                println!("No missions configured. Pass --mission or set discovery.missions.");
                return Ok(());
            }

            let mut discovery =
                Discovery::new(&settings, &services, &store, anchors, Pacer::new(&settings.pacing));
            watch_signals(discovery.stop_flag());
            println!("Discovering entities for {} mission(s)...", missions.len());
            let s = discovery.run(&missions).await?;
            println!(
                "Added {} raw entities ({} already known) from {} anchor pages ({} skipped), {} keywords over {} mission(s).",
                s.added, s.duplicates, s.anchors_visited, s.anchors_skipped, s.keywords, s.missions
            );
            if s.interrupted {
                println!("Interrupted; rerun to continue.");
            }
            Ok(())
        }
        Commands::Run { limit } => {
            let services = build_services(&settings)?;
            let checkpoint = CheckpointStore::load(&settings.paths.checkpoint)?;
            info!(path = %checkpoint.path().display(), "Using checkpoint");

            let mut driver =
                Driver::new(&settings, &services, &store, checkpoint, Pacer::new(&settings.pacing));
            watch_signals(driver.stop_flag());
            let s = driver.run(limit).await?;

            println!(
                "Processed {} of {} entities ({} already done, {} duplicate input rows, {} duplicates).",
                s.processed, s.considered, s.skipped, s.collapsed, s.duplicates
            );
            for tier in Tier::ALL {
                println!(
                    "  {:<34} {}",
                    settings.sheets.for_tier(tier),
                    s.tiers.get(&tier).copied().unwrap_or(0)
                );
            }
            println!("Wrote {} rows.", s.written);
            if s.unflushed > 0 {
                println!(
                    "{} rows could not be written; those entities will be retried on the next run.",
                    s.unflushed
                );
            }
            if s.interrupted {
                println!("Interrupted; rerun to continue.");
            }
            Ok(())
        }
        Commands::Stats => {
            let stats = store.stats()?;
            if stats.is_empty() {
                println!("No tables yet. Run 'discover' first.");
            }
            for s in &stats {
                println!(
                    "{:<36} {:>6}  {}",
                    truncate(&s.name, 36),
                    s.rows,
                    s.last_append.as_deref().unwrap_or("-")
                );
            }
            let entities = CheckpointStore::load(&settings.paths.checkpoint)?;
            let anchors = CheckpointStore::load(&settings.paths.anchors)?;
            println!("\nCheckpointed entities: {}", entities.len());
            println!("Checkpointed anchors:  {}", anchors.len());
            Ok(())
        }
        Commands::Export { sheet } => {
            let name = match Tier::ALL.iter().find(|t| t.code().eq_ignore_ascii_case(&sheet)) {
                Some(tier) => settings.sheets.for_tier(*tier).to_string(),
                None => sheet,
            };
            let Some(header) = store.header(&name)? else {
                bail!("No table named '{}'", name);
            };
            println!("{}", tsv_line(&header));
            for row in store.read_all(&name)? {
                println!("{}", tsv_line(&row));
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_services(settings: &Settings) -> Result<Services> {
    let secrets = Secrets::from_env(settings)?;
    let model = Gemini::new(
        &secrets.gemini_api_key,
        &settings.model.name,
        Duration::from_secs(settings.model.timeout_secs),
    )?;
    let fetcher: Arc<dyn PageFetcher> = match (settings.fetch.backend, &secrets.spider_api_key) {
        (FetchBackend::Spider, Some(key)) => Arc::new(SpiderFetcher::new(key)?),
        (FetchBackend::Spider, None) => bail!("SPIDER_API_KEY environment variable must be set"),
        (FetchBackend::Http, _) => Arc::new(HttpFetcher::new(&settings.fetch)?),
    };
    Ok(Services {
        model: Arc::new(model),
        search: Arc::new(SerperSearch::new(&secrets.serper_api_key)?),
        fetcher,
    })
}

/// Set `flag` on the first Ctrl-C or SIGTERM so the running agent drains and
/// stops. A second signal exits at once.
fn watch_signals(flag: Arc<AtomicBool>) {
    tokio::spawn(on_shutdown(flag, shutdown_signal, || std::process::exit(130)));
}

async fn on_shutdown<S, Fut, F>(flag: Arc<AtomicBool>, mut next_signal: S, force: F)
where
    S: FnMut() -> Fut,
    Fut: Future<Output = ()>,
    F: FnOnce(),
{
    next_signal().await;
    warn!("Shutdown requested, finishing the current step and flushing (repeat to force exit)");
    flag.store(true, Ordering::SeqCst);

    next_signal().await;
    warn!("Second shutdown signal, exiting without flushing");
    force();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn tsv_line(cells: &[String]) -> String {
    cells
        .iter()
        .map(|c| c.replace(['\t', '\n'], " "))
        .collect::<Vec<_>>()
        .join("\t")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
