use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobfeed_core::Resume;
use jobfeed_pipeline::{
    AnalysisCache, AnalysisEvent, AnalysisQueue, FeedService, RefreshConfig, RefreshScheduler,
    SearchPreferences,
};
use jobfeed_sources::{
    FixtureApiSource, FixtureVendorSource, JobSearchApi, KeywordScorer, SourceKind, SourceRegistry,
    VendorJobSource,
};
use jobfeed_store::FileStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobfeed")]
#[command(about = "Unified job feed & analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one refresh against the configured sources and print the summary.
    Refresh,
    /// Print the restored feed snapshot counts.
    Status,
    /// Score every unanalyzed job in the feed against the configured résumé.
    Analyze,
    /// Keep refreshing on the configured interval until interrupted.
    Watch,
}

struct AppConfig {
    data_dir: PathBuf,
    sources_file: PathBuf,
    resume_file: PathBuf,
    preferences: SearchPreferences,
}

impl AppConfig {
    fn from_env() -> Self {
        Self {
            data_dir: std::env::var("JOBFEED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".jobfeed")),
            sources_file: std::env::var("JOBFEED_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/sources.yaml")),
            resume_file: std::env::var("JOBFEED_RESUME_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/resume.txt")),
            preferences: SearchPreferences {
                query: std::env::var("JOBFEED_QUERY").unwrap_or_default(),
                location: std::env::var("JOBFEED_LOCATION").unwrap_or_default(),
                work_type: std::env::var("JOBFEED_WORK_TYPE").ok(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Refresh => refresh(&config).await,
        Commands::Status => status(&config).await,
        Commands::Analyze => analyze(&config).await,
        Commands::Watch => watch(&config).await,
    }
}

async fn restore_feed(config: &AppConfig) -> Arc<FeedService> {
    FeedService::restore(Arc::new(FileStore::new(&config.data_dir))).await
}

fn load_sources(
    config: &AppConfig,
) -> Result<(Vec<Arc<dyn JobSearchApi>>, Option<Arc<dyn VendorJobSource>>)> {
    let registry = SourceRegistry::load(&config.sources_file)?;
    let mut apis: Vec<Arc<dyn JobSearchApi>> = Vec::new();
    let mut vendor: Option<Arc<dyn VendorJobSource>> = None;
    for source in registry.enabled() {
        let Some(fixture) = source.fixture_path.as_deref() else {
            tracing::warn!(platform = %source.platform, "source has no fixture path, skipping");
            continue;
        };
        match source.kind {
            SourceKind::Api => {
                apis.push(Arc::new(FixtureApiSource::new(
                    source.platform.as_str(),
                    fixture,
                )));
            }
            SourceKind::Email if vendor.is_none() => {
                vendor = Some(Arc::new(FixtureVendorSource::new(fixture)));
            }
            SourceKind::Email => {
                tracing::warn!(platform = %source.platform, "extra vendor source ignored");
            }
        }
    }
    Ok((apis, vendor))
}

fn load_resume(path: &Path) -> Result<Resume> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading résumé {}", path.display()))?;
    let id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "resume".to_string());
    Ok(Resume { id, text })
}

async fn refresh(config: &AppConfig) -> Result<()> {
    let store = Arc::new(FileStore::new(&config.data_dir));
    let refresh_config = RefreshConfig::load(store.as_ref()).await;
    let feed = FeedService::restore(store).await;
    let (apis, vendor) = load_sources(config)?;
    let summary = feed
        .refresh(&config.preferences, &refresh_config, &apis, vendor)
        .await?;
    match summary {
        Some(summary) => {
            println!(
                "refresh {} complete: api={} email={} new={} total={}",
                summary.run_id,
                summary.api_jobs,
                summary.email_jobs,
                summary.new_jobs,
                summary.total_jobs
            );
            if !summary.failed_sources.is_empty() {
                println!("failed sources: {}", summary.failed_sources.join(", "));
            }
        }
        None => println!("a refresh is already in flight"),
    }
    Ok(())
}

async fn status(config: &AppConfig) -> Result<()> {
    let feed = restore_feed(config).await;
    let snapshot = feed.snapshot();
    let analyzed = snapshot.jobs.iter().filter(|job| job.analyzed).count();
    println!(
        "{} jobs ({} new, {} analyzed)",
        snapshot.jobs.len(),
        snapshot.new_jobs_count,
        analyzed
    );
    match snapshot.last_refresh_time {
        Some(at) => println!("last refresh: {at}"),
        None => println!("last refresh: never"),
    }
    Ok(())
}

async fn analyze(config: &AppConfig) -> Result<()> {
    let store = Arc::new(FileStore::new(&config.data_dir));
    let feed = FeedService::restore(store.clone()).await;
    let cache = AnalysisCache::restore(store).await;
    let resume = load_resume(&config.resume_file)?;

    let pending: Vec<String> = feed
        .snapshot()
        .jobs
        .iter()
        .filter(|job| !job.analyzed)
        .map(|job| job.id.clone())
        .collect();
    if pending.is_empty() {
        println!("nothing to analyze");
        return Ok(());
    }

    let (queue, mut events) = AnalysisQueue::new(feed, cache, Arc::new(KeywordScorer));
    let queued = queue.enqueue(pending, &resume).await;
    println!("analyzing {queued} jobs");
    queue.run(&resume).await;

    while let Ok(event) = events.try_recv() {
        match event {
            AnalysisEvent::JobScored {
                job_id,
                match_score,
            } => println!("  {job_id}: {match_score}"),
            AnalysisEvent::JobFailed { job_id, error } => {
                println!("  {job_id}: failed ({error})")
            }
            AnalysisEvent::RunCompleted { scored, failed } => {
                println!("done: {scored} scored, {failed} failed")
            }
        }
    }
    Ok(())
}

async fn watch(config: &AppConfig) -> Result<()> {
    let store = Arc::new(FileStore::new(&config.data_dir));
    let refresh_config = RefreshConfig::load(store.as_ref()).await;
    let feed = FeedService::restore(store).await;
    let (apis, vendor) = load_sources(config)?;
    let (scheduler, mut triggers) =
        RefreshScheduler::new(feed.refresh_guard(), refresh_config.clone());

    println!(
        "refreshing every {} minutes; ctrl-c to stop",
        refresh_config.interval_minutes
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(trigger) = triggers.recv() => {
                let summary = feed
                    .refresh(&config.preferences, &refresh_config, &apis, vendor.clone())
                    .await?;
                if let Some(summary) = summary {
                    scheduler.record_refresh(summary.finished_at);
                    let tag = if trigger.manual { " (manual)" } else { "" };
                    println!(
                        "refresh {}{tag}: {} jobs, {} new",
                        summary.run_id, summary.total_jobs, summary.new_jobs
                    );
                }
            }
        }
    }
    scheduler.stop();
    Ok(())
}
