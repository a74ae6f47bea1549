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

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointManager;
use crate::config::{Config, PodcastRegistry};
use crate::error::{PipelineError, Result};
use crate::extraction::KnowledgeExtractor;
use crate::graph::{GraphStore, PodcastRouter};
use crate::ingest::{IntakeItem, Transcriber};
use crate::metrics::{AuditLog, FailureRecord, PipelineMetrics};
use crate::pool::DeadlockDetector;
use crate::retry::RetryConfig;
use crate::speaker_id::SpeakerIdentifier;
use crate::types::{
    AuditRecord, DatabaseTarget, Episode, ExtractionResult, JobPriority, PipelineStage,
    PodcastConfig, Segment, SpeakerMapping,
};
use crate::vtt::{self, TranscriptMetadata};

#[derive(Debug, Clone)]
pub struct EpisodeJob {
    pub item: IntakeItem,
    pub priority: JobPriority,
    pub deadline: Option<Duration>,
}

impl EpisodeJob {
    pub fn new(item: IntakeItem) -> Self {
        Self {
            item,
            priority: JobPriority::Normal,
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

struct QueuedJob {
    job: EpisodeJob,
    seq: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job.priority == other.job.priority && self.seq == other.seq
    }
}
impl Eq for QueuedJob {}
impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, FIFO within a class.
        self.job
            .priority
            .cmp(&other.job.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Bounded-priority job queue: dequeue blocks until an item arrives, the
/// queue closes, or shutdown is signaled.
pub struct JobQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    notify: tokio::sync::Notify,
    closed: AtomicBool,
    seq: AtomicU64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: tokio::sync::Notify::new(),
            closed: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    pub fn push(&self, job: EpisodeJob) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.heap.lock().push(QueuedJob { job, seq });
        self.notify.notify_one();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub async fn pop_wait(&self, shutdown: &CancellationToken) -> Option<EpisodeJob> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            if let Some(queued) = self.heap.lock().pop() {
                return Some(queued.job);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

/// Per-episode working state threaded through the stages. Fields are lazily
/// rehydrated from checkpoints when a run resumes past their producing stage.
#[derive(Default)]
struct EpisodeContext {
    raw_vtt: Option<String>,
    mappings: Option<Vec<SpeakerMapping>>,
    emitted: Option<EmittedTranscript>,
    extraction: Option<ExtractionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranscribePayload {
    vtt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentifyPayload {
    mappings: Vec<SpeakerMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmittedTranscript {
    vtt: String,
    metadata: TranscriptMetadata,
    segments: Vec<Segment>,
    audits: Vec<AuditRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MovePayload {
    moved_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletePayload {
    completed_at: String,
}

/// Drives each episode through the staged state machine with durable
/// checkpoints, a priority worker pool, and cooperative shutdown.
pub struct Orchestrator {
    config: Config,
    registry: PodcastRegistry,
    checkpoints: Arc<CheckpointManager>,
    extractor: Arc<KnowledgeExtractor>,
    identifier: Arc<SpeakerIdentifier>,
    store: Arc<dyn GraphStore>,
    router: Arc<PodcastRouter>,
    transcriber: Arc<dyn Transcriber>,
    metrics: Arc<PipelineMetrics>,
    audit_log: Arc<AuditLog>,
    shutdown: CancellationToken,
    retry: RetryConfig,
    detector: DeadlockDetector,
    observer_started: AtomicBool,
    cleaned_up: AtomicBool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: PodcastRegistry,
        checkpoints: Arc<CheckpointManager>,
        extractor: Arc<KnowledgeExtractor>,
        identifier: Arc<SpeakerIdentifier>,
        store: Arc<dyn GraphStore>,
        router: Arc<PodcastRouter>,
        transcriber: Arc<dyn Transcriber>,
        metrics: Arc<PipelineMetrics>,
        audit_log: Arc<AuditLog>,
    ) -> Arc<Self> {
        let retry = RetryConfig {
            max_retries: config.orchestrator.max_retries.max(1),
            ..Default::default()
        };
        Arc::new(Self {
            config,
            registry,
            checkpoints,
            extractor,
            identifier,
            store,
            router,
            transcriber,
            metrics,
            audit_log,
            shutdown: CancellationToken::new(),
            retry,
            detector: DeadlockDetector::new(Duration::from_secs(300)),
            observer_started: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Install SIGINT/SIGTERM handling: running stages finish, queued work is
    /// discarded at the next boundary.
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<()> {
        let token = self.shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("Shutdown signal received, finishing running stages");
            token.cancel();
        })
        .map_err(|e| PipelineError::Config(format!("failed to install signal handler: {}", e)))?;
        Ok(())
    }

    /// Episodes with checkpoints but no complete marker, for resume runs.
    pub fn incomplete_episodes(&self) -> Result<Vec<String>> {
        self.checkpoints.get_incomplete_episodes()
    }

    /// Process a batch of episodes through the worker pool. Returns once the
    /// queue drains, a fatal error occurs, or shutdown is observed.
    pub async fn run_batch(self: &Arc<Self>, jobs: Vec<EpisodeJob>) -> Result<BatchSummary> {
        if !self.observer_started.swap(true, Ordering::SeqCst) {
            self.detector.start(Duration::from_secs(60));
        }

        let queue = Arc::new(JobQueue::new());
        for job in jobs {
            queue.push(job);
        }
        queue.close();

        let processed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let skipped = Arc::new(AtomicUsize::new(0));
        let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let worker_count = self.config.orchestrator.workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let orchestrator = self.clone();
            let queue = queue.clone();
            let processed = processed.clone();
            let failed = failed.clone();
            let skipped = skipped.clone();
            let fatal = fatal.clone();

            handles.push(tokio::spawn(async move {
                while let Some(job) = queue.pop_wait(&orchestrator.shutdown).await {
                    let episode_id = job.item.episode.id.clone();
                    let podcast_id = job.item.episode.podcast_id.clone();

                    if let Some(podcast) = orchestrator.registry.find(&podcast_id) {
                        if !podcast.enabled {
                            tracing::info!("Podcast '{}' disabled, skipping {}", podcast_id, episode_id);
                            skipped.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                    }

                    tracing::info!(
                        "[worker {}] episode {} ({} priority)",
                        worker_id,
                        episode_id,
                        job.priority
                    );

                    let deadline = job.deadline;
                    let outcome = match deadline {
                        Some(limit) => {
                            match tokio::time::timeout(limit, orchestrator.process_episode(&job)).await {
                                Ok(result) => result,
                                Err(_) => Err(PipelineError::Timeout {
                                    seconds: limit.as_secs(),
                                }),
                            }
                        }
                        None => orchestrator.process_episode(&job).await,
                    };

                    match outcome {
                        Ok(()) => {
                            processed.fetch_add(1, Ordering::SeqCst);
                            orchestrator.metrics.record_episode_processed(&podcast_id);
                        }
                        Err(PipelineError::Cancelled) => {
                            tracing::info!("Episode {} interrupted by shutdown", episode_id);
                            skipped.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                            tracing::error!("Episode {} failed: {}", episode_id, err);
                            orchestrator.metrics.record_episode_failed(
                                &podcast_id,
                                FailureRecord {
                                    episode_id: episode_id.clone(),
                                    stage: "pipeline".to_string(),
                                    error_kind: err.kind().to_string(),
                                    message: err.to_string(),
                                    timestamp: Utc::now(),
                                },
                            );

                            if err.is_fatal() {
                                *fatal.lock() = Some(err.to_string());
                                orchestrator.shutdown.cancel();
                            } else if !orchestrator.config.orchestrator.skip_errors {
                                *fatal.lock() = Some(format!(
                                    "aborting batch (skip_errors off): {}",
                                    err
                                ));
                                orchestrator.shutdown.cancel();
                            }
                        }
                    }
                }
            }));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!("Worker task panicked: {}", e);
            }
        }

        self.metrics.persist()?;

        if let Some(reason) = fatal.lock().take() {
            return Err(PipelineError::ResourceExhausted(reason));
        }

        Ok(BatchSummary {
            processed: processed.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
            skipped: skipped.load(Ordering::SeqCst),
            cancelled: if self.shutdown.is_cancelled() { queue.len() } else { 0 },
        })
    }

    /// Drive one episode through all stages, skipping stages already
    /// checkpointed and retrying recoverable failures.
    pub async fn process_episode(&self, job: &EpisodeJob) -> Result<()> {
        let episode = &job.item.episode;

        if self
            .checkpoints
            .is_expired(&episode.id, self.config.orchestrator.checkpoint_expiry_hours)?
        {
            tracing::warn!(
                "Checkpoints for episode {} are older than {}h, restarting from scratch",
                episode.id,
                self.config.orchestrator.checkpoint_expiry_hours
            );
            self.checkpoints.reset_episode(&episode.id)?;
        }

        let mut ctx = EpisodeContext::default();

        for stage in PipelineStage::ordered() {
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.checkpoints.is_stage_complete(&episode.id, *stage)? {
                tracing::debug!("Episode {} stage {} already complete, skipping", episode.id, stage);
                continue;
            }

            tracing::info!("Episode {} entering stage {}", episode.id, stage);
            self.run_stage_with_retry(job, &mut ctx, *stage).await.map_err(|e| {
                tracing::error!("Episode {} stage {} failed: {}", episode.id, stage, e);
                e
            })?;
            self.checkpoints.mark_stage_complete(&episode.id, *stage)?;
        }

        Ok(())
    }

    async fn run_stage_with_retry(
        &self,
        job: &EpisodeJob,
        ctx: &mut EpisodeContext,
        stage: PipelineStage,
    ) -> Result<()> {
        let _held = self
            .detector
            .track(format!("episode {} stage {}", job.item.episode.id, stage));

        let mut attempt = 0usize;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            match self.run_stage(job, ctx, stage).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_recoverable() && attempt + 1 < self.retry.max_retries => {
                    if matches!(err, PipelineError::Timeout { .. }) {
                        self.metrics.record_llm_timeout();
                    } else {
                        self.metrics.record_llm_error();
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Stage {} attempt {}/{} failed ({}), retrying in {:.1}s",
                        stage,
                        attempt + 1,
                        self.retry.max_retries,
                        err,
                        delay.as_secs_f64()
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_stage(
        &self,
        job: &EpisodeJob,
        ctx: &mut EpisodeContext,
        stage: PipelineStage,
    ) -> Result<()> {
        let episode = &job.item.episode;
        match stage {
            PipelineStage::Discover => {
                self.checkpoints
                    .save_episode_progress(&episode.id, stage, episode, None).await?;
            }
            PipelineStage::Transcribe => {
                let raw = match &job.item.vtt_path {
                    Some(path) => std::fs::read_to_string(path)?,
                    None => self.transcriber.transcribe(episode).await?,
                };
                self.checkpoints.save_episode_progress(
                    &episode.id,
                    stage,
                    &TranscribePayload { vtt: raw.clone() },
                    None,
                ).await?;
                ctx.raw_vtt = Some(raw);
            }
            PipelineStage::IdentifySpeakers => {
                let raw = self.ensure_raw_vtt(job, ctx)?;
                let parsed = vtt::parse(&raw)?;
                let segments =
                    vtt::postprocess(parsed.segments, self.config.orchestrator.min_segment_duration);

                let outcome = self.identifier.identify(episode, &segments).await?;
                let summary = crate::speaker_id::speaker_metadata(&outcome.mappings);
                tracing::info!(
                    "Episode {}: {} speaker(s), format '{}'",
                    episode.id,
                    summary.speaker_count,
                    summary.podcast_format
                );
                self.metrics
                    .record_speakers_identified(&episode.podcast_id, outcome.mappings.len() as u64);

                self.checkpoints.save_episode_progress(
                    &episode.id,
                    stage,
                    &IdentifyPayload {
                        mappings: outcome.mappings.clone(),
                    },
                    None,
                ).await?;
                ctx.mappings = Some(outcome.mappings);
            }
            PipelineStage::EmitTranscript => {
                let raw = self.ensure_raw_vtt(job, ctx)?;
                let mappings = self.ensure_mappings(ctx, &episode.id)?;

                let parsed = vtt::parse(&raw)?;
                let mut segments =
                    vtt::postprocess(parsed.segments, self.config.orchestrator.min_segment_duration);
                self.identifier.apply_to_segments(&mut segments, &mappings);

                let mut metadata = parsed.metadata;
                metadata.podcast_id = episode.podcast_id.clone();
                metadata.episode_id = episode.id.clone();
                if metadata.episode_title.is_empty() {
                    metadata.episode_title = episode.title.clone();
                }
                if metadata.podcast_name.is_empty() {
                    metadata.podcast_name = self
                        .registry
                        .find(&episode.podcast_id)
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| episode.podcast_id.clone());
                }
                metadata.transcription_date = Some(Utc::now().format("%Y-%m-%d").to_string());
                metadata.speakers = mappings
                    .iter()
                    .map(|m| (m.generic_label.clone(), m.identified_name.clone()))
                    .collect::<BTreeMap<_, _>>();

                let emitted = vtt::emit(&metadata, &segments);

                // Audit each label the mapping actually changed.
                let audits: Vec<AuditRecord> = mappings
                    .iter()
                    .filter(|m| m.identified_name != m.generic_label && raw.contains(&m.generic_label))
                    .map(|m| AuditRecord {
                        episode_id: episode.id.clone(),
                        old_label: m.generic_label.clone(),
                        new_label: m.identified_name.clone(),
                        timestamp: Utc::now(),
                        source: m.source,
                    })
                    .collect();
                self.audit_log.append_all(&audits)?;

                let transcripts_dir = self.config.data_dir.join("transcripts");
                std::fs::create_dir_all(&transcripts_dir)?;
                std::fs::write(transcripts_dir.join(format!("{}.vtt", episode.id)), &emitted)?;

                let payload = EmittedTranscript {
                    vtt: emitted,
                    metadata,
                    segments,
                    audits,
                };
                self.checkpoints
                    .save_episode_progress(&episode.id, stage, &payload, None).await?;
                ctx.emitted = Some(payload);
            }
            PipelineStage::ExtractKnowledge => {
                let emitted = self.ensure_emitted(ctx, &episode.id)?;
                let batch_size = self.config.extraction.batch_size.max(1);
                let cache_name = self
                    .extractor
                    .prepare_cache(&episode.id, &emitted.vtt)
                    .await;

                let mut result = ExtractionResult::default();
                for (index, batch) in emitted.segments.chunks(batch_size).enumerate() {
                    if self.shutdown.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }

                    // Per-batch segment checkpoints make a crash mid-extraction
                    // resume without re-running finished batches.
                    if let Some(cached) = self.checkpoints.load_episode_progress::<ExtractionResult>(
                        &episode.id,
                        stage,
                        Some(index),
                    )? {
                        tracing::debug!("Batch {} of episode {} from checkpoint", index, episode.id);
                        result.merge(cached);
                        continue;
                    }

                    let started = std::time::Instant::now();
                    let batch_result = self.extractor.extract_batch(batch, cache_name.clone()).await?;
                    self.metrics.record_llm_call(started.elapsed());
                    self.checkpoints.save_episode_progress(
                        &episode.id,
                        stage,
                        &batch_result,
                        Some(index),
                    ).await?;
                    result.merge(batch_result);
                }
                result.discovered_types = self.extractor.discovered_types();

                let cache_stats = self.extractor.cache_stats();
                self.metrics.record_cache(cache_stats.hits, cache_stats.attempts);

                self.metrics.record_extraction(
                    &episode.podcast_id,
                    emitted.segments.len() as u64,
                    result.entities.len() as u64,
                    result.relationships.len() as u64,
                    result.quotes.len() as u64,
                    result.insights.len() as u64,
                );

                self.checkpoints
                    .save_episode_progress(&episode.id, stage, &result, None).await?;
                ctx.extraction = Some(result);
            }
            PipelineStage::Store => {
                let emitted = self.ensure_emitted(ctx, &episode.id)?;
                let extraction = self.ensure_extraction(ctx, &episode.id)?;

                self.router.set_context(Some(&episode.podcast_id))?;
                let store_result = self
                    .store_episode_data(episode, &emitted, &extraction)
                    .await;
                self.router.set_context(None)?;
                store_result?;

                self.checkpoints.save_episode_progress(
                    &episode.id,
                    stage,
                    &serde_json::json!({ "stored": true, "entities": extraction.entities.len() }),
                    None,
                ).await?;
            }
            PipelineStage::Move => {
                let moved_to = self.move_to_processed(job)?;
                self.checkpoints.save_episode_progress(
                    &episode.id,
                    stage,
                    &MovePayload {
                        moved_to: moved_to.map(|p| p.to_string_lossy().to_string()),
                    },
                    None,
                ).await?;
            }
            PipelineStage::Complete => {
                self.checkpoints.save_episode_progress(
                    &episode.id,
                    stage,
                    &CompletePayload {
                        completed_at: Utc::now().to_rfc3339(),
                    },
                    None,
                ).await?;
                tracing::info!("Episode {} completed", episode.id);
            }
        }
        Ok(())
    }

    async fn store_episode_data(
        &self,
        episode: &Episode,
        emitted: &EmittedTranscript,
        extraction: &ExtractionResult,
    ) -> Result<()> {
        self.store.setup_schema(&episode.podcast_id).await?;

        let podcast = self
            .registry
            .find(&episode.podcast_id)
            .cloned()
            .unwrap_or_else(|| PodcastConfig {
                id: episode.podcast_id.clone(),
                name: emitted.metadata.podcast_name.clone(),
                enabled: true,
                feed_url: None,
                database: DatabaseTarget {
                    uri: String::new(),
                    database_name: String::new(),
                },
            });

        self.store.store_podcast(&podcast).await?;
        self.store.store_episode(episode).await?;
        self.store.store_segments(episode, &emitted.segments).await?;
        self.store.store_extraction(episode, extraction).await?;
        // Mirror the audit trail into the graph now that it is reachable.
        self.store
            .store_audits(&episode.podcast_id, &emitted.audits)
            .await?;
        Ok(())
    }

    /// Move the inbox file to the processed directory, preserving relative
    /// path structure. Storage is never retracted on a move failure; the
    /// `store` checkpoint stays durable and the mover re-runs on next start.
    fn move_to_processed(&self, job: &EpisodeJob) -> Result<Option<PathBuf>> {
        let source = match &job.item.vtt_path {
            Some(path) if path.exists() => path.clone(),
            _ => return Ok(None),
        };

        let relative = job
            .item
            .relative_path
            .clone()
            .or_else(|| source.file_name().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(format!("{}.vtt", job.item.episode.id)));
        let destination = self.config.processed_dir.join(&relative);

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::rename(&source, &destination) {
            Ok(()) => {}
            Err(_) => {
                // Cross-device fallback.
                std::fs::copy(&source, &destination)?;
                std::fs::remove_file(&source)?;
            }
        }

        tracing::info!("Moved {} -> {}", source.display(), destination.display());
        Ok(Some(destination))
    }

    fn ensure_raw_vtt(&self, job: &EpisodeJob, ctx: &mut EpisodeContext) -> Result<String> {
        if let Some(raw) = &ctx.raw_vtt {
            return Ok(raw.clone());
        }
        if let Some(payload) = self.checkpoints.load_episode_progress::<TranscribePayload>(
            &job.item.episode.id,
            PipelineStage::Transcribe,
            None,
        )? {
            ctx.raw_vtt = Some(payload.vtt.clone());
            return Ok(payload.vtt);
        }
        if let Some(path) = &job.item.vtt_path {
            let raw = std::fs::read_to_string(path)?;
            ctx.raw_vtt = Some(raw.clone());
            return Ok(raw);
        }
        Err(PipelineError::Invariant(format!(
            "transcribe checkpoint missing for episode {}",
            job.item.episode.id
        )))
    }

    fn ensure_mappings(&self, ctx: &mut EpisodeContext, episode_id: &str) -> Result<Vec<SpeakerMapping>> {
        if let Some(mappings) = &ctx.mappings {
            return Ok(mappings.clone());
        }
        if let Some(payload) = self.checkpoints.load_episode_progress::<IdentifyPayload>(
            episode_id,
            PipelineStage::IdentifySpeakers,
            None,
        )? {
            ctx.mappings = Some(payload.mappings.clone());
            return Ok(payload.mappings);
        }
        Err(PipelineError::Invariant(format!(
            "speaker checkpoint missing for episode {}",
            episode_id
        )))
    }

    fn ensure_emitted(&self, ctx: &mut EpisodeContext, episode_id: &str) -> Result<EmittedTranscript> {
        if let Some(emitted) = &ctx.emitted {
            return Ok(emitted.clone());
        }
        if let Some(payload) = self.checkpoints.load_episode_progress::<EmittedTranscript>(
            episode_id,
            PipelineStage::EmitTranscript,
            None,
        )? {
            ctx.emitted = Some(payload.clone());
            return Ok(payload);
        }
        Err(PipelineError::Invariant(format!(
            "emitted transcript checkpoint missing for episode {}",
            episode_id
        )))
    }

    fn ensure_extraction(&self, ctx: &mut EpisodeContext, episode_id: &str) -> Result<ExtractionResult> {
        if let Some(extraction) = &ctx.extraction {
            return Ok(extraction.clone());
        }
        if let Some(payload) = self.checkpoints.load_episode_progress::<ExtractionResult>(
            episode_id,
            PipelineStage::ExtractKnowledge,
            None,
        )? {
            ctx.extraction = Some(payload.clone());
            return Ok(payload);
        }
        Err(PipelineError::Invariant(format!(
            "extraction checkpoint missing for episode {}",
            episode_id
        )))
    }

    /// Release resources in LIFO order. Safe to call more than once.
    pub fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detector.stop();
        tracing::info!("Cleaning up: extractor, storage, rate limiter, checkpoints");
        // Extractor and storage hold no OS resources beyond the shared
        // backend; the key manager persists on every transition, so the final
        // flush is the metrics file.
        if let Err(e) = self.metrics.persist() {
            tracing::warn!("Metrics flush during cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IntakeItem;

    fn job(priority: JobPriority, id: &str) -> EpisodeJob {
        EpisodeJob {
            item: IntakeItem {
                episode: Episode {
                    id: id.into(),
                    podcast_id: "pod".into(),
                    title: id.into(),
                    description: String::new(),
                    published_at: None,
                    audio_url: String::new(),
                    duration_secs: None,
                    guid: None,
                    youtube_url: None,
                    author: None,
                },
                vtt_path: None,
                relative_path: None,
            },
            priority,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_fifo() {
        let queue = JobQueue::new();
        let token = CancellationToken::new();

        queue.push(job(JobPriority::Normal, "n1"));
        queue.push(job(JobPriority::Low, "l1"));
        queue.push(job(JobPriority::Critical, "c1"));
        queue.push(job(JobPriority::Normal, "n2"));
        queue.push(job(JobPriority::High, "h1"));
        queue.close();

        let mut order = Vec::new();
        while let Some(job) = queue.pop_wait(&token).await {
            order.push(job.item.episode.id);
        }
        assert_eq!(order, vec!["c1", "h1", "n1", "n2", "l1"]);
    }

    #[tokio::test]
    async fn queue_pop_unblocks_on_shutdown() {
        let queue = Arc::new(JobQueue::new());
        let token = CancellationToken::new();

        let popper = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.pop_wait(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = popper.await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn queue_pop_returns_none_when_closed_and_empty() {
        let queue = JobQueue::new();
        let token = CancellationToken::new();
        queue.close();
        assert!(queue.pop_wait(&token).await.is_none());
    }
}
