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

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::types::{ExtractionMode, PodcastConfig};

lazy_static! {
    static ref PODCAST_ID_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodcastMode {
    Single,
    Multi,
}

/// Which LLM backend to construct. The mock is a real implementation chosen by
/// configuration, used by tests and dry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Gemini,
    Mock,
}

/// Per-model request/token limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelLimits {
    pub rpm: u32,
    pub tpm: u64,
    pub rpd: u32,
    pub tpd: u64,
}

impl Default for ModelLimits {
    fn default() -> Self {
        // Gemini flash free-tier defaults.
        Self {
            rpm: 10,
            tpm: 250_000,
            rpd: 250,
            tpd: 2_000_000,
        }
    }
}

/// Rate-limit table keyed by model name with a `default` fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitTable {
    pub models: HashMap<String, ModelLimits>,
}

impl RateLimitTable {
    pub fn limits_for(&self, model: &str) -> ModelLimits {
        self.models
            .get(model)
            .or_else(|| self.models.get("default"))
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub mode: ExtractionMode,
    pub max_entities_per_segment: usize,
    pub min_insight_length: usize,
    pub min_quote_length: usize,
    pub batch_size: usize,
    pub cache_ttl_secs: u64,
    pub min_transcript_size_for_cache: usize,
    pub use_large_context: bool,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            mode: ExtractionMode::Fixed,
            max_entities_per_segment: 50,
            min_insight_length: 20,
            min_quote_length: 10,
            batch_size: 10,
            cache_ttl_secs: 3600,
            min_transcript_size_for_cache: 5000,
            use_large_context: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub skip_errors: bool,
    pub checkpoint_expiry_hours: i64,
    pub job_deadline_secs: Option<u64>,
    pub min_segment_duration: f64,
    pub max_retries: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            skip_errors: true,
            checkpoint_expiry_hours: 24,
            job_deadline_secs: None,
            min_segment_duration: 2.0,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_keys: Vec<String>,
    pub mode: PodcastMode,
    pub llm_backend: LlmBackend,
    pub model: String,
    pub registry_path: PathBuf,
    pub data_dir: PathBuf,
    pub input_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub rate_limits: RateLimitTable,
    pub extraction: ExtractionSettings,
    pub orchestrator: OrchestratorSettings,
    /// When set, storage operations refuse to run without a podcast context.
    pub isolation_required: bool,
    /// Guard checkpoint writes with an advisory file lock.
    pub distributed: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let api_keys = collect_api_keys(|name| env::var(name).ok());
        if api_keys.is_empty() {
            return Err(PipelineError::Config(
                "no API keys found: set GEMINI_API_KEY_1..N or GEMINI_API_KEY".to_string(),
            ));
        }

        let mode = match env::var("PODCAST_MODE").as_deref() {
            Ok("multi") => PodcastMode::Multi,
            Ok("single") | Err(_) => PodcastMode::Single,
            Ok(other) => {
                return Err(PipelineError::Config(format!(
                    "invalid PODCAST_MODE '{}': expected single|multi",
                    other
                )))
            }
        };

        let llm_backend = match env::var("LLM_BACKEND").as_deref() {
            Ok("mock") => LlmBackend::Mock,
            _ => LlmBackend::Gemini,
        };

        let model = env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string());

        let data_dir = env::var("PODCAST_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".podcast-seeder")
            });

        let registry_path = env::var("PODCAST_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("podcasts.yaml"));

        let input_dir = env::var("VTT_INPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("inbox"));

        let processed_dir = env::var("PROCESSED_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("processed"));

        std::fs::create_dir_all(&data_dir)?;

        let mut rate_limits = RateLimitTable::default();
        rate_limits
            .models
            .insert("default".to_string(), ModelLimits::default());

        let mut extraction = ExtractionSettings::default();
        if let Ok(raw) = env::var("EXTRACTION_MODE") {
            extraction.mode = ExtractionMode::parse(&raw).ok_or_else(|| {
                PipelineError::Config(format!(
                    "unknown EXTRACTION_MODE '{}': expected fixed|schemaless|mixed",
                    raw
                ))
            })?;
        }

        let mut orchestrator = OrchestratorSettings::default();
        if let Ok(raw) = env::var("PIPELINE_WORKERS") {
            orchestrator.workers = raw.parse().unwrap_or(orchestrator.workers);
        }
        if let Ok(raw) = env::var("SKIP_ERRORS") {
            orchestrator.skip_errors = raw != "0" && raw.to_lowercase() != "false";
        }

        Ok(Config {
            api_keys,
            mode,
            llm_backend,
            model,
            registry_path,
            data_dir,
            input_dir,
            processed_dir,
            rate_limits,
            extraction,
            orchestrator,
            isolation_required: mode == PodcastMode::Multi,
            distributed: env::var("DISTRIBUTED_CHECKPOINTS").map(|v| v == "1").unwrap_or(false),
        })
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn key_state_path(&self) -> PathBuf {
        self.data_dir.join("key_state.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.data_dir.join("metrics.json")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("speaker_audit.jsonl")
    }
}

/// Enumerate `GEMINI_API_KEY_1..N`, stopping at the first gap. Falls back to
/// the single `GEMINI_API_KEY` when no numbered key is present.
pub fn collect_api_keys(lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
    let mut keys = Vec::new();
    let mut index = 1usize;

    loop {
        match lookup(&format!("GEMINI_API_KEY_{}", index)) {
            Some(key) if !key.trim().is_empty() => {
                keys.push(key.trim().to_string());
                index += 1;
            }
            _ => break,
        }
    }

    if keys.is_empty() {
        if let Some(key) = lookup("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                keys.push(key.trim().to_string());
            }
        }
    }

    keys
}

pub fn is_valid_podcast_id(id: &str) -> bool {
    !id.is_empty() && PODCAST_ID_RE.is_match(id)
}

/// The podcast registry file: version plus the configured podcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodcastRegistry {
    pub version: String,
    pub podcasts: Vec<PodcastConfig>,
}

impl Default for PodcastRegistry {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            podcasts: Vec::new(),
        }
    }
}

impl PodcastRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read podcast registry {}: {}", path.display(), e))
        })?;
        let registry: PodcastRegistry = serde_yaml::from_str(&raw)
            .map_err(|e| PipelineError::MalformedInput(format!("podcast registry: {}", e)))?;
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self)
            .map_err(|e| PipelineError::Config(format!("serialize registry: {}", e)))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Validate ids, uniqueness, and the podcast → database mapping.
    /// With isolation, two distinct podcasts must map to distinct databases.
    pub fn validate(&self, isolation_required: bool) -> Result<()> {
        let mut seen_ids = HashSet::new();
        let mut database_owners: HashMap<&str, &str> = HashMap::new();

        for podcast in &self.podcasts {
            if !is_valid_podcast_id(&podcast.id) {
                return Err(PipelineError::Config(format!(
                    "invalid podcast id '{}': only letters, digits, '_' and '-' are allowed",
                    podcast.id
                )));
            }
            if !seen_ids.insert(podcast.id.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate podcast id '{}'",
                    podcast.id
                )));
            }
            if podcast.database.database_name.is_empty() {
                return Err(PipelineError::Config(format!(
                    "podcast '{}' has no database name",
                    podcast.id
                )));
            }

            if let Some(owner) =
                database_owners.insert(podcast.database.database_name.as_str(), podcast.id.as_str())
            {
                if isolation_required {
                    return Err(PipelineError::Config(format!(
                        "podcasts '{}' and '{}' share database '{}' but isolation is required",
                        owner, podcast.id, podcast.database.database_name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn find(&self, podcast_id: &str) -> Option<&PodcastConfig> {
        self.podcasts.iter().find(|p| p.id == podcast_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PodcastConfig> {
        self.podcasts.iter().filter(|p| p.enabled)
    }

    /// Total map podcast_id → database name over configured podcasts.
    pub fn database_map(&self) -> HashMap<String, String> {
        self.podcasts
            .iter()
            .map(|p| (p.id.clone(), p.database.database_name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatabaseTarget;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn numbered_keys_stop_at_first_gap() {
        let keys = collect_api_keys(lookup_from(&[
            ("GEMINI_API_KEY_1", "aaa"),
            ("GEMINI_API_KEY_2", "bbb"),
            ("GEMINI_API_KEY_4", "ddd"),
        ]));
        assert_eq!(keys, vec!["aaa", "bbb"]);
    }

    #[test]
    fn falls_back_to_single_key() {
        let keys = collect_api_keys(lookup_from(&[("GEMINI_API_KEY", "solo")]));
        assert_eq!(keys, vec!["solo"]);
    }

    #[test]
    fn numbered_keys_win_over_fallback() {
        let keys = collect_api_keys(lookup_from(&[
            ("GEMINI_API_KEY", "solo"),
            ("GEMINI_API_KEY_1", "one"),
        ]));
        assert_eq!(keys, vec!["one"]);
    }

    #[test]
    fn podcast_id_charset() {
        assert!(is_valid_podcast_id("my_podcast-01"));
        assert!(!is_valid_podcast_id("bad id"));
        assert!(!is_valid_podcast_id(""));
        assert!(!is_valid_podcast_id("a/b"));
    }

    fn podcast(id: &str, db: &str) -> PodcastConfig {
        PodcastConfig {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            feed_url: None,
            database: DatabaseTarget {
                uri: "bolt://localhost:7687".to_string(),
                database_name: db.to_string(),
            },
        }
    }

    #[test]
    fn registry_round_trip_preserves_database_map() {
        let registry = PodcastRegistry {
            version: "1.0".to_string(),
            podcasts: vec![podcast("alpha", "db_alpha"), podcast("beta", "db_beta")],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podcasts.yaml");
        registry.save(&path).unwrap();
        let loaded = PodcastRegistry::load(&path).unwrap();

        assert_eq!(loaded.podcasts.len(), 2);
        assert_eq!(loaded.database_map(), registry.database_map());
    }

    #[test]
    fn isolation_rejects_shared_database() {
        let registry = PodcastRegistry {
            version: "1.0".to_string(),
            podcasts: vec![podcast("alpha", "shared"), podcast("beta", "shared")],
        };
        assert!(registry.validate(false).is_ok());
        assert!(registry.validate(true).is_err());
    }

    #[test]
    fn model_limits_fall_back_to_default() {
        let mut table = RateLimitTable::default();
        table.models.insert(
            "default".to_string(),
            ModelLimits {
                rpm: 5,
                tpm: 100,
                rpd: 50,
                tpd: 1000,
            },
        );
        table.models.insert(
            "gemini-2.0-pro".to_string(),
            ModelLimits {
                rpm: 2,
                tpm: 50,
                rpd: 25,
                tpd: 500,
            },
        );

        assert_eq!(table.limits_for("gemini-2.0-pro").rpm, 2);
        assert_eq!(table.limits_for("anything-else").rpm, 5);
    }
}
