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

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use podcast_seeder::checkpoint::CheckpointManager;
use podcast_seeder::config::{
    Config, ExtractionSettings, LlmBackend, ModelLimits, OrchestratorSettings, PodcastMode,
    PodcastRegistry, RateLimitTable,
};
use podcast_seeder::error::Result;
use podcast_seeder::extraction::KnowledgeExtractor;
use podcast_seeder::graph::{build_store, CompatibleGraphStore, InMemoryGraph, PodcastRouter};
use podcast_seeder::ingest::FileTranscriber;
use podcast_seeder::key_rotation::KeyRotationManager;
use podcast_seeder::llm::{CacheManager, CompletionRequest, CompletionResponse, LlmProvider, MockLlm};
use podcast_seeder::metrics::{AuditLog, PipelineMetrics};
use podcast_seeder::orchestrator::Orchestrator;
use podcast_seeder::speaker_id::SpeakerIdentifier;
use podcast_seeder::types::{DatabaseTarget, ExtractionMode, PodcastConfig};

/// Mock provider that consults the key rotation manager exactly the way the
/// production client does, with an optional simulated crash point.
pub struct RotatingProvider {
    inner: MockLlm,
    key_manager: Arc<KeyRotationManager>,
    calls: AtomicU64,
    fail_after: parking_lot::Mutex<Option<u64>>,
}

impl RotatingProvider {
    pub fn new(key_manager: Arc<KeyRotationManager>) -> Self {
        Self {
            inner: MockLlm::new(),
            key_manager,
            calls: AtomicU64::new(0),
            fail_after: parking_lot::Mutex::new(None),
        }
    }

    pub fn fail_after(&self, successful_calls: u64) {
        *self.fail_after.lock() = Some(successful_calls);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for RotatingProvider {
    fn name(&self) -> &str {
        "rotating-mock"
    }

    fn supports_caching(&self) -> bool {
        true
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = *self.fail_after.lock() {
            if n > limit {
                return Err(podcast_seeder::PipelineError::Transient(
                    "simulated process crash".to_string(),
                ));
            }
        }

        let (_key, index) = self.key_manager.get_next_key(&request.model)?;
        match self.inner.complete(request.clone()).await {
            Ok(response) => {
                self.key_manager.mark_key_success(index)?;
                self.key_manager
                    .update_key_usage(index, response.total_tokens(), &request.model)?;
                Ok(response)
            }
            Err(e) => {
                self.key_manager.mark_key_failure(index, &e.to_string())?;
                Err(e)
            }
        }
    }

    async fn create_cached_content(
        &self,
        content: &str,
        episode_id: &str,
        system_instruction: &str,
        ttl: Duration,
    ) -> Result<String> {
        self.inner
            .create_cached_content(content, episode_id, system_instruction, ttl)
            .await
    }
}

pub struct HarnessOptions {
    pub mode: ExtractionMode,
    pub podcasts: Vec<PodcastConfig>,
    pub keys: Vec<String>,
    pub batch_size: usize,
    pub workers: usize,
    pub max_retries: usize,
    pub isolation_required: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            mode: ExtractionMode::Fixed,
            podcasts: vec![podcast("tech_talk", "db_tech_talk")],
            keys: vec!["test-key-1".to_string()],
            batch_size: 10,
            workers: 2,
            max_retries: 3,
            isolation_required: true,
        }
    }
}

pub struct Harness {
    pub config: Config,
    pub registry: PodcastRegistry,
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<CompatibleGraphStore>,
    pub backend: Arc<InMemoryGraph>,
    pub provider: Arc<RotatingProvider>,
    pub key_manager: Arc<KeyRotationManager>,
    pub checkpoints: Arc<CheckpointManager>,
    pub metrics: Arc<PipelineMetrics>,
    pub audit_log: Arc<AuditLog>,
}

pub fn podcast(id: &str, db: &str) -> PodcastConfig {
    PodcastConfig {
        id: id.to_string(),
        name: format!("{} show", id),
        enabled: true,
        feed_url: None,
        database: DatabaseTarget {
            uri: "bolt://localhost:7687".to_string(),
            database_name: db.to_string(),
        },
    }
}

impl Harness {
    /// Build a pipeline rooted at `root` so a second harness on the same root
    /// models a process restart.
    pub fn with_root(root: &Path, opts: HarnessOptions) -> Self {
        let data_dir = root.join("data");
        let input_dir = root.join("inbox");
        let processed_dir = root.join("processed");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::create_dir_all(&processed_dir).unwrap();

        let mut rate_limits = RateLimitTable::default();
        rate_limits.models.insert(
            "default".to_string(),
            ModelLimits {
                rpm: 0,
                tpm: 0,
                rpd: 0,
                tpd: 0,
            },
        );

        let config = Config {
            api_keys: opts.keys.clone(),
            mode: if opts.isolation_required {
                PodcastMode::Multi
            } else {
                PodcastMode::Single
            },
            llm_backend: LlmBackend::Mock,
            model: "test-model".to_string(),
            registry_path: data_dir.join("podcasts.yaml"),
            data_dir: data_dir.clone(),
            input_dir,
            processed_dir,
            rate_limits: rate_limits.clone(),
            extraction: ExtractionSettings {
                mode: opts.mode,
                batch_size: opts.batch_size,
                // Keep provider-side caching out of call-count accounting.
                min_transcript_size_for_cache: usize::MAX,
                ..Default::default()
            },
            orchestrator: OrchestratorSettings {
                workers: opts.workers,
                skip_errors: true,
                max_retries: opts.max_retries,
                ..Default::default()
            },
            isolation_required: opts.isolation_required,
            distributed: false,
        };

        let registry = PodcastRegistry {
            version: "1.0".to_string(),
            podcasts: opts.podcasts.clone(),
        };

        let key_manager = Arc::new(
            KeyRotationManager::new(opts.keys, config.key_state_path(), rate_limits).unwrap(),
        );
        let provider = Arc::new(RotatingProvider::new(key_manager.clone()));

        let cache = Arc::new(CacheManager::new(config.extraction.min_transcript_size_for_cache));
        let extractor = Arc::new(KnowledgeExtractor::new(
            provider.clone(),
            cache,
            config.extraction.clone(),
            config.model.clone(),
        ));
        let identifier = Arc::new(SpeakerIdentifier::new(provider.clone(), config.model.clone()));

        let backend = Arc::new(InMemoryGraph::new());
        let router = Arc::new(PodcastRouter::from_podcasts(
            &registry.podcasts,
            config.isolation_required,
        ));
        let store = build_store(
            backend.clone(),
            router.clone(),
            opts.mode,
            opts.mode == ExtractionMode::Dual,
        );

        let checkpoints = Arc::new(CheckpointManager::new(config.checkpoint_dir(), false).unwrap());
        let metrics = Arc::new(PipelineMetrics::new(config.metrics_path()));
        let audit_log = Arc::new(AuditLog::new(config.audit_log_path()));

        let orchestrator = Orchestrator::new(
            config.clone(),
            registry.clone(),
            checkpoints.clone(),
            extractor,
            identifier,
            store.clone(),
            router,
            Arc::new(FileTranscriber),
            metrics.clone(),
            audit_log.clone(),
        );

        Harness {
            config,
            registry,
            orchestrator,
            store,
            backend,
            provider,
            key_manager,
            checkpoints,
            metrics,
            audit_log,
        }
    }

    pub fn inbox(&self) -> &Path {
        &self.config.input_dir
    }

    pub fn processed(&self) -> &Path {
        &self.config.processed_dir
    }
}

/// A well-formed transcript with metadata, two generic speakers, a quoted
/// sentence, and proper-noun-rich text for the entity mock.
pub fn sample_transcript(podcast_id: &str, episode_id: &str, title: &str) -> String {
    let mut out = String::from("WEBVTT\n\nNOTE JSON Metadata\n");
    out.push_str(&format!(
        "{{\"podcast_id\": \"{}\", \"episode_id\": \"{}\", \"episode_title\": \"{}\"}}\n\n",
        podcast_id, episode_id, title
    ));

    let cues = [
        ("SPEAKER_1", "Welcome to the show everyone, I'm Maria Chen and today we explore warehouse automation."),
        ("SPEAKER_2", "Thanks Maria, great to be here to talk about Acme Robotics and machine learning."),
        ("SPEAKER_1", "Tell us how Acme Robotics got started with their automation systems."),
        ("SPEAKER_2", "\"The future belongs to those who automate everything,\" as my mentor used to say."),
        ("SPEAKER_1", "That is a bold claim about the future of robotics in general."),
        ("SPEAKER_2", "Quantum Computing may change the entire landscape for Acme Robotics."),
    ];

    for (i, (speaker, text)) in cues.iter().enumerate() {
        let start = i as f64 * 10.0;
        out.push_str(&format!(
            "{} --> {}\n<v {}>{}\n\n",
            podcast_seeder::vtt::format_timestamp(start),
            podcast_seeder::vtt::format_timestamp(start + 8.0),
            speaker,
            text
        ));
    }
    out
}

/// A longer transcript with `n` segments, each rich in proper nouns so every
/// extraction batch performs the full four prompt calls.
pub fn long_transcript(podcast_id: &str, episode_id: &str, n: usize) -> String {
    let mut out = String::from("WEBVTT\n\nNOTE JSON Metadata\n");
    out.push_str(&format!(
        "{{\"podcast_id\": \"{}\", \"episode_id\": \"{}\", \"episode_title\": \"Long Episode\"}}\n\n",
        podcast_id, episode_id
    ));

    let names = [
        ("Grace Hopper", "Harvard University"),
        ("Ada Lovelace", "Analytical Engine"),
        ("Alan Turing", "Bletchley Park"),
        ("Katherine Johnson", "Langley Research"),
        ("Margaret Hamilton", "Apollo Program"),
    ];

    for i in 0..n {
        let speaker = if i % 2 == 0 { "SPEAKER_1" } else { "SPEAKER_2" };
        let (person, place) = names[i % names.len()];
        let start = i as f64 * 10.0;
        out.push_str(&format!(
            "{} --> {}\n<v {}>{} did remarkable early computing work at {} during segment number {}.\n\n",
            podcast_seeder::vtt::format_timestamp(start),
            podcast_seeder::vtt::format_timestamp(start + 8.0),
            speaker,
            person,
            place,
            i
        ));
    }
    out
}

pub fn write_inbox_file(harness: &Harness, name: &str, content: &str) -> PathBuf {
    let path = harness.inbox().join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}
