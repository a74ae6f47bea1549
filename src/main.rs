/*
 * Podcast Seeder CLI - Rust Edition
 * Copyright (c) 2024 Podcast Seeder Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use podcast_seeder::checkpoint::CheckpointManager;
use podcast_seeder::config::{Config, LlmBackend, PodcastRegistry};
use podcast_seeder::error::PipelineError;
use podcast_seeder::extraction::KnowledgeExtractor;
use podcast_seeder::graph::{build_store, GraphBackend, InMemoryGraph, PodcastRouter};
use podcast_seeder::ingest::{scan_inbox, FileTranscriber};
use podcast_seeder::key_rotation::KeyRotationManager;
use podcast_seeder::llm::{CacheManager, GeminiClient, LlmProvider, MockLlm};
use podcast_seeder::metrics::{AuditLog, PipelineMetrics};
use podcast_seeder::orchestrator::{EpisodeJob, Orchestrator};
use podcast_seeder::speaker_id::SpeakerIdentifier;
use podcast_seeder::types::JobPriority;

const EXIT_FATAL: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

/// Podcast Seeder CLI - resumable transcript processing into per-podcast knowledge graphs
#[derive(Parser)]
#[command(name = "podcast-seeder")]
#[command(version = "0.1.0")]
#[command(about = "Processes podcast transcripts into per-podcast knowledge graphs")]
#[command(long_about = "
Podcast Seeder CLI - Rust Edition

A batch processor that drives podcast episodes from transcript to knowledge graph:
• Parses time-coded VTT transcripts with embedded metadata
• Identifies generic speaker labels using contextual analysis
• Extracts entities, relationships, quotes, and insights via LLM
• Stores everything in a per-podcast graph database with durable checkpoints
• Survives crashes: interrupted episodes resume at the last completed stage
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process transcripts from the inbox directory (default)
    Seed {
        /// Override the inbox directory
        #[arg(long)]
        inbox: Option<PathBuf>,

        /// Only process episodes for this podcast id
        #[arg(long)]
        podcast: Option<String>,

        /// Queue priority: low, normal, high, critical
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Per-episode deadline in seconds
        #[arg(long)]
        deadline: Option<u64>,
    },

    /// Resume incomplete episodes from their checkpoints
    Resume,

    /// Show key state, checkpoint, and metrics status
    Status,

    /// Remove checkpoint files older than N days
    Cleanup {
        #[arg(long, default_value = "7")]
        days: u64,
    },

    /// Export checkpoints to a .tar.gz archive
    Export {
        /// Archive path to write
        output: PathBuf,

        /// Restrict to these episode ids
        #[arg(long)]
        episode: Vec<String>,
    },

    /// Import checkpoints from a .tar.gz archive
    Import {
        /// Archive path to read
        archive: PathBuf,
    },

    /// Validate the podcast registry file
    Registry,
}

struct Pipeline {
    orchestrator: Arc<Orchestrator>,
    key_manager: Arc<KeyRotationManager>,
    checkpoints: Arc<CheckpointManager>,
    metrics: Arc<PipelineMetrics>,
    config: Config,
    registry: PodcastRegistry,
}

fn build_pipeline(config: Config) -> Result<Pipeline> {
    let registry = if config.registry_path.exists() {
        let registry = PodcastRegistry::load(&config.registry_path)?;
        registry.validate(config.isolation_required)?;
        registry
    } else {
        tracing::warn!(
            "No podcast registry at {}, running with an empty registry",
            config.registry_path.display()
        );
        PodcastRegistry::default()
    };

    let key_manager = Arc::new(KeyRotationManager::new(
        config.api_keys.clone(),
        config.key_state_path(),
        config.rate_limits.clone(),
    )?);

    let provider: Arc<dyn LlmProvider> = match config.llm_backend {
        LlmBackend::Gemini => Arc::new(GeminiClient::new(key_manager.clone())),
        LlmBackend::Mock => Arc::new(MockLlm::new()),
    };

    let cache = Arc::new(CacheManager::new(config.extraction.min_transcript_size_for_cache));
    let extractor = Arc::new(KnowledgeExtractor::new(
        provider.clone(),
        cache,
        config.extraction.clone(),
        config.model.clone(),
    ));
    let identifier = Arc::new(SpeakerIdentifier::new(provider, config.model.clone()));

    let backend: Arc<dyn GraphBackend> = Arc::new(InMemoryGraph::new());
    let router = Arc::new(PodcastRouter::from_podcasts(
        &registry.podcasts,
        config.isolation_required,
    ));
    let store = build_store(
        backend,
        router.clone(),
        config.extraction.mode,
        config.extraction.mode == podcast_seeder::types::ExtractionMode::Dual,
    );

    let checkpoints = Arc::new(CheckpointManager::new(config.checkpoint_dir(), config.distributed)?);
    let metrics = Arc::new(PipelineMetrics::new(config.metrics_path()));
    let audit_log = Arc::new(AuditLog::new(config.audit_log_path()));

    let orchestrator = Orchestrator::new(
        config.clone(),
        registry.clone(),
        checkpoints.clone(),
        extractor,
        identifier,
        store,
        router,
        Arc::new(FileTranscriber),
        metrics.clone(),
        audit_log,
    );

    Ok(Pipeline {
        orchestrator,
        key_manager,
        checkpoints,
        metrics,
        config,
        registry,
    })
}

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "❌".red(), e);
            EXIT_FATAL
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    setup_logging().await?;

    let config = Config::load().map_err(|e| anyhow::anyhow!("{}", e))?;

    match cli.command.unwrap_or(Commands::Seed {
        inbox: None,
        podcast: None,
        priority: "normal".to_string(),
        deadline: None,
    }) {
        Commands::Seed {
            inbox,
            podcast,
            priority,
            deadline,
        } => {
            let mut config = config;
            if let Some(inbox) = inbox {
                config.input_dir = inbox;
            }
            let priority = parse_priority(&priority)?;
            run_seed(config, podcast, priority, deadline).await
        }
        Commands::Resume => run_resume(config).await,
        Commands::Status => run_status(config),
        Commands::Cleanup { days } => run_cleanup(config, days),
        Commands::Export { output, episode } => run_export(config, output, episode),
        Commands::Import { archive } => run_import(config, archive),
        Commands::Registry => run_registry(config),
    }
}

fn parse_priority(raw: &str) -> Result<JobPriority> {
    match raw {
        "low" => Ok(JobPriority::Low),
        "normal" => Ok(JobPriority::Normal),
        "high" => Ok(JobPriority::High),
        "critical" => Ok(JobPriority::Critical),
        other => anyhow::bail!("unknown priority '{}': expected low|normal|high|critical", other),
    }
}

async fn run_seed(
    config: Config,
    podcast_filter: Option<String>,
    priority: JobPriority,
    deadline: Option<u64>,
) -> Result<i32> {
    let pipeline = build_pipeline(config)?;

    let default_podcast = pipeline
        .registry
        .enabled()
        .next()
        .map(|p| p.id.clone())
        .unwrap_or_else(|| "default".to_string());

    let items = scan_inbox(&pipeline.config.input_dir, &default_podcast)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let items: Vec<_> = items
        .into_iter()
        .filter(|item| {
            podcast_filter
                .as_ref()
                .map(|p| &item.episode.podcast_id == p)
                .unwrap_or(true)
        })
        .collect();

    if items.is_empty() {
        println!("{} No transcripts found in {}", "ℹ️".blue(), pipeline.config.input_dir.display());
        return Ok(0);
    }

    println!(
        "{} Processing {} episode(s) with {} worker(s)",
        "🚀".green(),
        items.len(),
        pipeline.config.orchestrator.workers
    );

    pipeline.orchestrator.install_signal_handler().ok();
    pipeline
        .metrics
        .start_flush_task(Duration::from_secs(60), pipeline.orchestrator.shutdown_token());

    let jobs: Vec<EpisodeJob> = items
        .into_iter()
        .map(|item| {
            let mut job = EpisodeJob::new(item).with_priority(priority);
            if let Some(secs) = deadline {
                job = job.with_deadline(Duration::from_secs(secs));
            }
            job
        })
        .collect();

    let result = pipeline.orchestrator.run_batch(jobs).await;
    pipeline.orchestrator.cleanup();

    let cancelled = pipeline.orchestrator.shutdown_token().is_cancelled();
    match result {
        Ok(summary) => {
            println!(
                "{} Done: {} processed, {} failed, {} skipped",
                "✅".green(),
                summary.processed,
                summary.failed,
                summary.skipped
            );
            if cancelled {
                Ok(EXIT_CANCELLED)
            } else {
                Ok(0)
            }
        }
        Err(e) => {
            if cancelled && matches!(e, PipelineError::Cancelled) {
                Ok(EXIT_CANCELLED)
            } else {
                Err(anyhow::anyhow!("{}", e)).context("batch processing failed")
            }
        }
    }
}

async fn run_resume(config: Config) -> Result<i32> {
    let pipeline = build_pipeline(config)?;
    let incomplete = pipeline
        .orchestrator
        .incomplete_episodes()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    if incomplete.is_empty() {
        println!("{} Nothing to resume", "ℹ️".blue());
        return Ok(0);
    }

    println!("{} Resuming {} incomplete episode(s)", "🔁".yellow(), incomplete.len());

    // Incomplete episodes still sitting in the inbox resume with priority.
    let default_podcast = pipeline
        .registry
        .enabled()
        .next()
        .map(|p| p.id.clone())
        .unwrap_or_else(|| "default".to_string());
    let items = scan_inbox(&pipeline.config.input_dir, &default_podcast)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let jobs: Vec<EpisodeJob> = items
        .into_iter()
        .filter(|item| incomplete.contains(&item.episode.id))
        .map(|item| EpisodeJob::new(item).with_priority(JobPriority::High))
        .collect();

    if jobs.is_empty() {
        println!(
            "{} Incomplete episodes found but their transcripts are no longer in the inbox",
            "⚠️".yellow()
        );
        return Ok(0);
    }

    pipeline.orchestrator.install_signal_handler().ok();
    let summary = pipeline
        .orchestrator
        .run_batch(jobs)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    pipeline.orchestrator.cleanup();

    println!(
        "{} Resume done: {} processed, {} failed",
        "✅".green(),
        summary.processed,
        summary.failed
    );
    Ok(if pipeline.orchestrator.shutdown_token().is_cancelled() {
        EXIT_CANCELLED
    } else {
        0
    })
}

fn run_status(config: Config) -> Result<i32> {
    println!("{}", "=== Podcast Seeder Status ===".bold());
    println!();

    // Key state.
    let key_manager = KeyRotationManager::new(
        config.api_keys.clone(),
        config.key_state_path(),
        config.rate_limits.clone(),
    )
    .map_err(|e| anyhow::anyhow!("{}", e))?;

    println!("{}", "API keys:".bold());
    for state in key_manager.snapshot() {
        let status = match state.status.to_string().as_str() {
            "available" => state.status.to_string().green(),
            _ => state.status.to_string().red(),
        };
        println!(
            "  {} [{}] requests today: {}, tokens today: {}",
            state.key_name, status, state.requests_today, state.tokens_today
        );
    }
    println!();

    // Checkpoints.
    let checkpoints = CheckpointManager::new(config.checkpoint_dir(), false)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let stats = checkpoints.statistics().map_err(|e| anyhow::anyhow!("{}", e))?;
    println!("{}", "Checkpoints:".bold());
    println!("  active episodes:    {}", stats.active_episodes);
    println!("  completed episodes: {}", stats.completed_episodes);
    println!("  files:              {} ({} bytes)", stats.total_files, stats.total_bytes);

    let incomplete = checkpoints
        .get_incomplete_episodes()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    if !incomplete.is_empty() {
        println!("  resumable:          {}", incomplete.join(", "));
    }
    println!();

    // Metrics.
    if config.metrics_path().exists() {
        let raw = std::fs::read_to_string(config.metrics_path())?;
        if let Ok(report) = serde_json::from_str::<podcast_seeder::metrics::MetricsReport>(&raw) {
            println!("{}", "Last run:".bold());
            println!("  episodes processed: {}", report.episodes_processed);
            println!("  episodes failed:    {}", report.episodes_failed);
            println!("  entities:           {}", report.entities);
            println!("  llm calls:          {}", report.llm_calls);
        }
    }

    Ok(0)
}

fn run_cleanup(config: Config, days: u64) -> Result<i32> {
    let checkpoints = CheckpointManager::new(config.checkpoint_dir(), false)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let removed = checkpoints
        .clean_old_checkpoints(days)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    println!("{} Removed {} checkpoint file(s) older than {} days", "🧹".green(), removed, days);
    Ok(0)
}

fn run_export(config: Config, output: PathBuf, episodes: Vec<String>) -> Result<i32> {
    let checkpoints = CheckpointManager::new(config.checkpoint_dir(), false)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let filter = if episodes.is_empty() { None } else { Some(episodes.as_slice()) };
    checkpoints
        .export_checkpoints(&output, filter)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    println!("{} Exported checkpoints to {}", "📦".green(), output.display());
    Ok(0)
}

fn run_import(config: Config, archive: PathBuf) -> Result<i32> {
    let checkpoints = CheckpointManager::new(config.checkpoint_dir(), false)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let imported = checkpoints
        .import_checkpoints(&archive)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    println!("{} Imported {} checkpoint file(s)", "📦".green(), imported);
    Ok(0)
}

fn run_registry(config: Config) -> Result<i32> {
    let registry = PodcastRegistry::load(&config.registry_path).map_err(|e| anyhow::anyhow!("{}", e))?;
    registry
        .validate(config.isolation_required)
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    println!("{} Registry OK: {} podcast(s)", "✅".green(), registry.podcasts.len());
    for podcast in &registry.podcasts {
        let flag = if podcast.enabled { "enabled".green() } else { "disabled".yellow() };
        println!(
            "  {} [{}] -> database '{}'",
            podcast.id, flag, podcast.database.database_name
        );
    }
    Ok(0)
}

async fn setup_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Create log directory
    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".podcast-seeder")
        .join("logs");

    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "podcast-seeder.log");

    // File gets everything, stderr only errors.
    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("podcast_seeder=debug".parse()?)
                        .add_directive("debug".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("podcast_seeder=error".parse()?)
                        .add_directive("error".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    tracing::info!("Logging system initialized");
    Ok(())
}
