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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Pipeline stages in execution order. Each stage is checkpointed individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    Discover,
    Transcribe,
    IdentifySpeakers,
    EmitTranscript,
    ExtractKnowledge,
    Store,
    Move,
    Complete,
}

impl PipelineStage {
    /// All stages in the order the orchestrator drives them.
    pub fn ordered() -> &'static [PipelineStage] {
        &[
            PipelineStage::Discover,
            PipelineStage::Transcribe,
            PipelineStage::IdentifySpeakers,
            PipelineStage::EmitTranscript,
            PipelineStage::ExtractKnowledge,
            PipelineStage::Store,
            PipelineStage::Move,
            PipelineStage::Complete,
        ]
    }

    pub fn next(&self) -> Option<PipelineStage> {
        let ordered = Self::ordered();
        let idx = ordered.iter().position(|s| s == self)?;
        ordered.get(idx + 1).copied()
    }

    pub fn parse(s: &str) -> Option<PipelineStage> {
        match s {
            "discover" => Some(PipelineStage::Discover),
            "transcribe" => Some(PipelineStage::Transcribe),
            "identify_speakers" => Some(PipelineStage::IdentifySpeakers),
            "emit_transcript" => Some(PipelineStage::EmitTranscript),
            "extract_knowledge" => Some(PipelineStage::ExtractKnowledge),
            "store" => Some(PipelineStage::Store),
            "move" => Some(PipelineStage::Move),
            "complete" => Some(PipelineStage::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Discover => write!(f, "discover"),
            PipelineStage::Transcribe => write!(f, "transcribe"),
            PipelineStage::IdentifySpeakers => write!(f, "identify_speakers"),
            PipelineStage::EmitTranscript => write!(f, "emit_transcript"),
            PipelineStage::ExtractKnowledge => write!(f, "extract_knowledge"),
            PipelineStage::Store => write!(f, "store"),
            PipelineStage::Move => write!(f, "move"),
            PipelineStage::Complete => write!(f, "complete"),
        }
    }
}

/// Episode lifecycle states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpisodeStatus {
    New,
    Discovered,
    Transcribing,
    Transcribed,
    SpeakersIdentified,
    TranscriptEmitted,
    Extracting,
    Extracted,
    Stored,
    Moved,
    Completed,
    Failed(String),
}

impl EpisodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EpisodeStatus::Completed | EpisodeStatus::Failed(_))
    }

    /// Status reached when the given stage finished successfully.
    pub fn after_stage(stage: PipelineStage) -> EpisodeStatus {
        match stage {
            PipelineStage::Discover => EpisodeStatus::Discovered,
            PipelineStage::Transcribe => EpisodeStatus::Transcribed,
            PipelineStage::IdentifySpeakers => EpisodeStatus::SpeakersIdentified,
            PipelineStage::EmitTranscript => EpisodeStatus::TranscriptEmitted,
            PipelineStage::ExtractKnowledge => EpisodeStatus::Extracted,
            PipelineStage::Store => EpisodeStatus::Stored,
            PipelineStage::Move => EpisodeStatus::Moved,
            PipelineStage::Complete => EpisodeStatus::Completed,
        }
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpisodeStatus::New => write!(f, "new"),
            EpisodeStatus::Discovered => write!(f, "discovered"),
            EpisodeStatus::Transcribing => write!(f, "transcribing"),
            EpisodeStatus::Transcribed => write!(f, "transcribed"),
            EpisodeStatus::SpeakersIdentified => write!(f, "speakers_identified"),
            EpisodeStatus::TranscriptEmitted => write!(f, "transcript_emitted"),
            EpisodeStatus::Extracting => write!(f, "extracting"),
            EpisodeStatus::Extracted => write!(f, "extracted"),
            EpisodeStatus::Stored => write!(f, "stored"),
            EpisodeStatus::Moved => write!(f, "moved"),
            EpisodeStatus::Completed => write!(f, "completed"),
            EpisodeStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Priority classes for batch submission. Higher priority dominates queue order
/// but never preempts a running stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Database target for a podcast's dedicated graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseTarget {
    pub uri: String,
    pub database_name: String,
}

/// One configured podcast from the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodcastConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
    pub database: DatabaseTarget,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub podcast_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub audio_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl Episode {
    /// Content-addressed episode ID, stable across re-runs of the same feed.
    /// Prefers the feed GUID; falls back to title + audio URL.
    pub fn content_id(guid: Option<&str>, title: &str, audio_url: &str) -> String {
        let basis = match guid {
            Some(g) if !g.is_empty() => g.to_string(),
            _ => format!("{}\n{}", title, audio_url),
        };
        let digest = Sha256::digest(basis.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        hex[..32].to_string()
    }
}

/// A time-coded utterance. Times are seconds; `end_time > start_time` except
/// for zero-duration markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// Entity types used in fixed-schema mode.
pub const FIXED_ENTITY_TYPES: &[&str] = &[
    "Person",
    "Organization",
    "Concept",
    "Technology",
    "Product",
    "Location",
    "Event",
    "Topic",
];

/// Relationship types used in fixed-schema mode.
pub const FIXED_RELATIONSHIP_TYPES: &[&str] = &[
    "WORKS_FOR",
    "FOUNDED",
    "CREATED",
    "USES",
    "RELATED_TO",
    "PART_OF",
    "LOCATED_IN",
    "DISCUSSES",
    "co-occurrence",
];

/// Known insight categories; unknown categories normalize to `observation`.
pub const INSIGHT_CATEGORIES: &[&str] = &[
    "observation",
    "recommendation",
    "prediction",
    "lesson",
    "fact",
    "opinion",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub importance: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source_name: String,
    pub target_name: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub text: String,
    #[serde(default)]
    pub speaker: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Extraction operating mode. Dual runs both schemas for migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionMode {
    Fixed,
    Schemaless,
    Dual,
}

impl ExtractionMode {
    pub fn parse(s: &str) -> Option<ExtractionMode> {
        match s {
            "fixed" => Some(ExtractionMode::Fixed),
            "schemaless" => Some(ExtractionMode::Schemaless),
            "dual" | "mixed" => Some(ExtractionMode::Dual),
            _ => None,
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMode::Fixed => write!(f, "fixed"),
            ExtractionMode::Schemaless => write!(f, "schemaless"),
            ExtractionMode::Dual => write!(f, "mixed"),
        }
    }
}

/// Aggregate output of knowledge extraction over an episode or batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub quotes: Vec<Quote>,
    pub insights: Vec<Insight>,
    /// Entity types observed in schemaless mode, for observability.
    #[serde(default)]
    pub discovered_types: Vec<String>,
}

impl ExtractionResult {
    pub fn merge(&mut self, other: ExtractionResult) {
        self.entities.extend(other.entities);
        self.relationships.extend(other.relationships);
        self.quotes.extend(other.quotes);
        self.insights.extend(other.insights);
        for t in other.discovered_types {
            if !self.discovered_types.contains(&t) {
                self.discovered_types.push(t);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.relationships.is_empty()
            && self.quotes.is_empty()
            && self.insights.is_empty()
    }
}

/// Where a speaker identification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingSource {
    DescriptionPattern,
    SelfIntroduction,
    ClosingCredits,
    ChannelDescription,
    Llm,
    Fallback,
}

impl fmt::Display for MappingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingSource::DescriptionPattern => write!(f, "description_pattern"),
            MappingSource::SelfIntroduction => write!(f, "self_introduction"),
            MappingSource::ClosingCredits => write!(f, "closing_credits"),
            MappingSource::ChannelDescription => write!(f, "channel_description"),
            MappingSource::Llm => write!(f, "llm"),
            MappingSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// A mapping from a generic diarization label to an identified speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerMapping {
    pub generic_label: String,
    pub identified_name: String,
    pub confidence: f64,
    pub source: MappingSource,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Append-only record of a speaker-label remapping applied to stored data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub episode_id: String,
    pub old_label: String,
    pub new_label: String,
    pub timestamp: DateTime<Utc>,
    pub source: MappingSource,
}
