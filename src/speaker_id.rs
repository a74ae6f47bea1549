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
use chrono::Utc;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::Result;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::types::{AuditRecord, Episode, MappingSource, Segment, SpeakerMapping};

lazy_static! {
    static ref GENERIC_LABEL_RE: Regex = Regex::new(
        r"(?i)^(speaker|guest|host|co-host)([\s_]*\d+|\s*\(.*\))?$"
    )
    .unwrap();
    static ref GUEST_EXPERT_RE: Regex = Regex::new(r"(?i)^guest expert(\s*\(.*\))?$").unwrap();
    static ref SPEAKER_NUM_RE: Regex = Regex::new(r"(?i)(?:speaker|guest)[\s_]*(\d+)").unwrap();
    // Proper-noun phrase after a role marker in the episode description.
    static ref ROLE_MARKER_RES: [(Regex, bool); 4] = [
        (Regex::new(r"(?m)Host:\s*([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(), true),
        (Regex::new(r"(?m)Guest:\s*([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(), false),
        (
            Regex::new(r"(?i)welcome\s+(?:back\s+)?([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(),
            false
        ),
        (
            Regex::new(r"(?i)joined\s+(?:today\s+)?by\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(),
            false
        ),
    ];
    static ref SELF_INTRO_RES: [Regex; 3] = [
        Regex::new(r"\bI'm\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(),
        Regex::new(r"(?i)my name is\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(),
        Regex::new(r"(?:^|[.!?]\s+)This is\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(),
    ];
    static ref CREDITS_RES: [Regex; 3] = [
        Regex::new(r"(?i)thanks?\s+to\s+our\s+guest,?\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(),
        Regex::new(r"(?i)my\s+guest\s+(?:today\s+)?(?:was|has been)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)")
            .unwrap(),
        Regex::new(r"(?i)produced\s+by\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap(),
    ];
    static ref VOICE_TAG_RE: Regex = Regex::new(r"<v\s+([^>]+)>").unwrap();
}

/// Number of closing segments scanned for credits.
const CREDITS_WINDOW: usize = 10;
const MAX_SAMPLES_PER_SPEAKER: usize = 5;

/// True for diarization placeholders like `Speaker 0`, `SPEAKER_2`,
/// `Guest Expert (AI)`, `Co-host 1`.
pub fn is_generic_label(label: &str) -> bool {
    let trimmed = label.trim();
    GENERIC_LABEL_RE.is_match(trimmed) || GUEST_EXPERT_RE.is_match(trimmed)
}

/// External source for a channel/video description (strategy 4). The real
/// implementation lives with the network clients outside the core.
#[async_trait]
pub trait ChannelDescriptionSource: Send + Sync {
    async fn fetch_description(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct IdentificationOutcome {
    pub mappings: Vec<SpeakerMapping>,
}

impl IdentificationOutcome {
    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.mappings
            .iter()
            .map(|m| (m.generic_label.clone(), m.identified_name.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SpeakerInfo {
    pub label: String,
    pub name: String,
    pub role: String,
    pub full_identification: String,
}

/// Summary of the identified speakers, including the inferred show format.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpeakerMetadata {
    pub speakers: Vec<SpeakerInfo>,
    pub speaker_count: usize,
    pub podcast_format: String,
}

/// Build a metadata summary from a finished mapping. A trailing
/// parenthesized role in the identified name is split out.
pub fn speaker_metadata(mappings: &[SpeakerMapping]) -> SpeakerMetadata {
    lazy_static! {
        static ref ROLE_SUFFIX_RE: Regex = Regex::new(r"\(([^)]+)\)$").unwrap();
    }

    let speakers: Vec<SpeakerInfo> = mappings
        .iter()
        .map(|mapping| {
            let full = mapping.identified_name.clone();
            let (name, role) = match ROLE_SUFFIX_RE.captures(&full) {
                Some(caps) => {
                    let role = caps[1].to_string();
                    let name = full[..caps.get(0).map(|m| m.start()).unwrap_or(full.len())]
                        .trim()
                        .to_string();
                    (name, role)
                }
                None => (full.clone(), "Unknown".to_string()),
            };
            SpeakerInfo {
                label: mapping.generic_label.clone(),
                name,
                role,
                full_identification: full,
            }
        })
        .collect();

    let podcast_format = match speakers.len() {
        0 | 1 => "solo",
        2 => "interview",
        3 => "co-hosted_interview",
        _ => "panel",
    }
    .to_string();

    SpeakerMetadata {
        speaker_count: speakers.len(),
        speakers,
        podcast_format,
    }
}

/// Replaces generic speaker labels with real names using a cascade of
/// increasingly expensive strategies; the first hit per label wins.
pub struct SpeakerIdentifier {
    provider: Arc<dyn LlmProvider>,
    model: String,
    confidence_threshold: f64,
    channel_source: Option<Arc<dyn ChannelDescriptionSource>>,
    /// Per-podcast cache of stable identifications (hosts recur across episodes).
    podcast_cache: Mutex<HashMap<String, Vec<SpeakerMapping>>>,
}

impl SpeakerIdentifier {
    pub fn new(provider: Arc<dyn LlmProvider>, model: String) -> Self {
        Self {
            provider,
            model,
            confidence_threshold: 0.7,
            channel_source: None,
            podcast_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_channel_source(mut self, source: Arc<dyn ChannelDescriptionSource>) -> Self {
        self.channel_source = Some(source);
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Identify every generic speaker in the episode's segments.
    pub async fn identify(&self, episode: &Episode, segments: &[Segment]) -> Result<IdentificationOutcome> {
        let labels = generic_labels(segments);
        if labels.is_empty() {
            return Ok(IdentificationOutcome { mappings: Vec::new() });
        }

        tracing::info!(
            "Identifying {} generic speakers in episode {}: {:?}",
            labels.len(),
            episode.id,
            labels
        );

        let mut resolved: BTreeMap<String, SpeakerMapping> = BTreeMap::new();

        // Cached identifications from earlier episodes of the same podcast.
        {
            let cache = self.podcast_cache.lock();
            if let Some(known) = cache.get(&episode.podcast_id) {
                for mapping in known {
                    if labels.contains(&mapping.generic_label) {
                        resolved.insert(mapping.generic_label.clone(), mapping.clone());
                    }
                }
            }
        }
        if !resolved.is_empty() {
            tracing::info!("Reused {} cached speaker identifications", resolved.len());
        }

        self.apply_description_patterns(episode, &labels, &mut resolved);
        self.apply_self_introductions(segments, &labels, &mut resolved);
        self.apply_closing_credits(segments, &labels, &mut resolved);
        self.apply_channel_description(episode, &labels, &mut resolved).await;
        self.apply_llm(episode, segments, &labels, &mut resolved).await?;

        // Sub-threshold and unresolved labels fall back to positional roles.
        let mut mappings = Vec::new();
        for (position, label) in labels.iter().enumerate() {
            let mapping = match resolved.remove(label) {
                Some(m) if m.confidence >= self.confidence_threshold => m,
                Some(m) => {
                    tracing::debug!(
                        "Mapping for '{}' below threshold ({:.2}), using role fallback",
                        label,
                        m.confidence
                    );
                    fallback_mapping(label, position, labels.len(), episode)
                }
                None => fallback_mapping(label, position, labels.len(), episode),
            };
            mappings.push(mapping);
        }

        // Remember confident identifications for this podcast's next episodes.
        {
            let mut cache = self.podcast_cache.lock();
            let entry = cache.entry(episode.podcast_id.clone()).or_default();
            for mapping in &mappings {
                if mapping.source != MappingSource::Fallback
                    && !entry.iter().any(|m| m.generic_label == mapping.generic_label)
                {
                    entry.push(mapping.clone());
                }
            }
        }

        Ok(IdentificationOutcome { mappings })
    }

    /// Strategy 1: role markers in the episode description.
    fn apply_description_patterns(
        &self,
        episode: &Episode,
        labels: &[String],
        resolved: &mut BTreeMap<String, SpeakerMapping>,
    ) {
        if episode.description.is_empty() {
            return;
        }

        let mut host_names = Vec::new();
        let mut guest_names = Vec::new();
        for (re, is_host) in ROLE_MARKER_RES.iter() {
            for caps in re.captures_iter(&episode.description) {
                let name = caps[1].trim().to_string();
                let bucket = if *is_host { &mut host_names } else { &mut guest_names };
                if !bucket.contains(&name) {
                    bucket.push(name);
                }
            }
        }

        // First label is conventionally the host; later labels are guests.
        let mut guests = guest_names.into_iter();
        for (position, label) in labels.iter().enumerate() {
            if resolved.contains_key(label) {
                continue;
            }
            let candidate = if position == 0 {
                host_names.first().cloned()
            } else {
                guests.next()
            };
            if let Some(name) = candidate {
                resolved.insert(
                    label.clone(),
                    SpeakerMapping {
                        generic_label: label.clone(),
                        identified_name: name.clone(),
                        confidence: 0.8,
                        source: MappingSource::DescriptionPattern,
                        evidence: vec![format!("episode description mentions {}", name)],
                    },
                );
            }
        }
    }

    /// Strategy 2: in-transcript self-introductions, attributable per label.
    fn apply_self_introductions(
        &self,
        segments: &[Segment],
        labels: &[String],
        resolved: &mut BTreeMap<String, SpeakerMapping>,
    ) {
        for label in labels {
            if resolved.contains_key(label) {
                continue;
            }
            for segment in segments.iter().filter(|s| s.speaker.as_deref() == Some(label)) {
                if let Some(name) = SELF_INTRO_RES.iter().find_map(|re| {
                    re.captures(&segment.text).map(|c| c[1].trim().to_string())
                }) {
                    resolved.insert(
                        label.clone(),
                        SpeakerMapping {
                            generic_label: label.clone(),
                            identified_name: name.clone(),
                            confidence: 0.9,
                            source: MappingSource::SelfIntroduction,
                            evidence: vec![format!("self-introduction: \"{}\"", truncate(&segment.text, 80))],
                        },
                    );
                    break;
                }
            }
        }
    }

    /// Strategy 3: scan the closing segments for credits.
    fn apply_closing_credits(
        &self,
        segments: &[Segment],
        labels: &[String],
        resolved: &mut BTreeMap<String, SpeakerMapping>,
    ) {
        let tail_start = segments.len().saturating_sub(CREDITS_WINDOW);
        let tail = &segments[tail_start..];

        let mut credited = Vec::new();
        for segment in tail {
            for re in CREDITS_RES.iter() {
                for caps in re.captures_iter(&segment.text) {
                    let name = caps[1].trim().to_string();
                    if !credited.contains(&name) {
                        credited.push(name);
                    }
                }
            }
        }

        // Credits name guests, so map non-first labels.
        let mut names = credited.into_iter();
        for label in labels.iter().skip(1) {
            if resolved.contains_key(label) {
                continue;
            }
            if let Some(name) = names.next() {
                resolved.insert(
                    label.clone(),
                    SpeakerMapping {
                        generic_label: label.clone(),
                        identified_name: name.clone(),
                        confidence: 0.7,
                        source: MappingSource::ClosingCredits,
                        evidence: vec![format!("closing credits mention {}", name)],
                    },
                );
            }
        }
    }

    /// Strategy 4: fetch and scan an external channel/video description.
    async fn apply_channel_description(
        &self,
        episode: &Episode,
        labels: &[String],
        resolved: &mut BTreeMap<String, SpeakerMapping>,
    ) {
        if labels.iter().all(|l| resolved.contains_key(l)) {
            return;
        }
        let (source, url) = match (&self.channel_source, &episode.youtube_url) {
            (Some(source), Some(url)) => (source, url),
            _ => return,
        };

        let description = match source.fetch_description(url).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Channel description fetch failed: {}", e);
                return;
            }
        };

        let mut names = Vec::new();
        for (re, _) in ROLE_MARKER_RES.iter() {
            for caps in re.captures_iter(&description) {
                let name = caps[1].trim().to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let mut names = names.into_iter();
        for label in labels {
            if resolved.contains_key(label) {
                continue;
            }
            if let Some(name) = names.next() {
                resolved.insert(
                    label.clone(),
                    SpeakerMapping {
                        generic_label: label.clone(),
                        identified_name: name.clone(),
                        confidence: 0.75,
                        source: MappingSource::ChannelDescription,
                        evidence: vec!["channel description".to_string()],
                    },
                );
            }
        }
    }

    /// Strategy 5: ask the LLM with all accumulated signals.
    async fn apply_llm(
        &self,
        episode: &Episode,
        segments: &[Segment],
        labels: &[String],
        resolved: &mut BTreeMap<String, SpeakerMapping>,
    ) -> Result<()> {
        let unresolved: Vec<String> = labels
            .iter()
            .filter(|l| !resolved.contains_key(*l))
            .cloned()
            .collect();
        if unresolved.is_empty() {
            return Ok(());
        }

        let prompt = self.build_llm_prompt(episode, segments, &unresolved, resolved);
        let response = self
            .provider
            .complete(CompletionRequest::new(prompt, self.model.clone()))
            .await?;

        let mapping = parse_llm_mapping(&response.text);
        for label in &unresolved {
            if let Some(name) = mapping.get(label) {
                let name = name.trim().trim_matches(['"', '\'']).to_string();
                if name.len() < 2 || name.eq_ignore_ascii_case("unknown") || name == *label {
                    continue;
                }
                resolved.insert(
                    label.clone(),
                    SpeakerMapping {
                        generic_label: label.clone(),
                        identified_name: name,
                        confidence: 0.85,
                        source: MappingSource::Llm,
                        evidence: vec!["LLM contextual identification".to_string()],
                    },
                );
            }
        }

        Ok(())
    }

    fn build_llm_prompt(
        &self,
        episode: &Episode,
        segments: &[Segment],
        labels: &[String],
        already_resolved: &BTreeMap<String, SpeakerMapping>,
    ) -> String {
        let samples = speaker_samples(segments, labels);
        let mut samples_text = String::new();
        for (label, texts) in &samples {
            samples_text.push_str(&format!("\n{} sample dialogue:\n", label));
            for text in texts {
                samples_text.push_str(&format!("- \"{}\"\n", text));
            }
        }

        let mut known = String::new();
        for mapping in already_resolved.values() {
            known.push_str(&format!(
                "- {} is {} (via {})\n",
                mapping.generic_label, mapping.identified_name, mapping.source
            ));
        }
        if known.is_empty() {
            known.push_str("(none)\n");
        }

        format!(
            r#"Analyze this podcast transcript excerpt and identify the speakers from context.

Podcast: {podcast}
Episode Title: {title}
Author: {author}
Description: {description}

Speaker Labels Found: {labels}

Already identified:
{known}
Sample dialogue for each speaker:
{samples}
Rules:
1. Use self-introductions, how speakers address each other, and the episode
   description.
2. The first speaker is often the host; later speakers are usually guests.
3. If you cannot determine a name, answer "UNKNOWN" for that label.

Return ONLY a JSON object mapping each label to a name or role:
{{"SPEAKER_1": "Jane Doe (Host)", "SPEAKER_2": "UNKNOWN"}}"#,
            podcast = episode.podcast_id,
            title = episode.title,
            author = episode.author.as_deref().unwrap_or("Unknown"),
            description = truncate(&episode.description, 500),
            labels = labels.join(", "),
            known = known,
            samples = samples_text,
        )
    }

    /// Apply a mapping to a VTT transcript, longest labels first so partial
    /// label names never clobber longer ones. Returns the rewritten text plus
    /// one audit record per changed label.
    pub fn apply_mapping(
        &self,
        episode_id: &str,
        transcript: &str,
        mappings: &[SpeakerMapping],
    ) -> (String, Vec<AuditRecord>) {
        let mut updated = transcript.to_string();
        let mut audits = Vec::new();

        let mut ordered: Vec<&SpeakerMapping> = mappings.iter().collect();
        ordered.sort_by(|a, b| b.generic_label.len().cmp(&a.generic_label.len()));

        for mapping in ordered {
            if mapping.identified_name == mapping.generic_label {
                continue;
            }
            let pattern = format!("<v {}>", mapping.generic_label);
            if updated.contains(&pattern) {
                updated = updated.replace(&pattern, &format!("<v {}>", mapping.identified_name));
                audits.push(AuditRecord {
                    episode_id: episode_id.to_string(),
                    old_label: mapping.generic_label.clone(),
                    new_label: mapping.identified_name.clone(),
                    timestamp: Utc::now(),
                    source: mapping.source,
                });
            }
        }

        (updated, audits)
    }

    /// Apply a mapping to parsed segments in place.
    pub fn apply_to_segments(&self, segments: &mut [Segment], mappings: &[SpeakerMapping]) {
        let map: HashMap<&str, &str> = mappings
            .iter()
            .map(|m| (m.generic_label.as_str(), m.identified_name.as_str()))
            .collect();
        for segment in segments {
            if let Some(speaker) = &segment.speaker {
                if let Some(name) = map.get(speaker.as_str()) {
                    segment.speaker = Some(name.to_string());
                }
            }
        }
    }
}

/// Unique generic labels in segment order of first appearance.
pub fn generic_labels(segments: &[Segment]) -> Vec<String> {
    let mut labels = Vec::new();
    for segment in segments {
        if let Some(speaker) = &segment.speaker {
            if is_generic_label(speaker) && !labels.contains(speaker) {
                labels.push(speaker.clone());
            }
        }
    }
    labels
}

/// Labels present in a raw VTT text's voice tags.
pub fn labels_in_transcript(transcript: &str) -> Vec<String> {
    let mut labels = Vec::new();
    for caps in VOICE_TAG_RE.captures_iter(transcript) {
        let label = caps[1].trim().to_string();
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

fn speaker_samples(segments: &[Segment], labels: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut samples: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for label in labels {
        samples.insert(label.clone(), Vec::new());
    }

    for segment in segments {
        if let Some(speaker) = &segment.speaker {
            if let Some(bucket) = samples.get_mut(speaker) {
                if bucket.len() < MAX_SAMPLES_PER_SPEAKER && segment.text.len() > 20 {
                    bucket.push(truncate(&segment.text, 200));
                }
            }
        }
    }

    samples
}

fn parse_llm_mapping(response: &str) -> BTreeMap<String, String> {
    let start = match response.find('{') {
        Some(i) => i,
        None => return BTreeMap::new(),
    };
    let end = match response.rfind('}') {
        Some(i) if i > start => i,
        _ => return BTreeMap::new(),
    };

    serde_json::from_str::<BTreeMap<String, String>>(&response[start..=end]).unwrap_or_default()
}

/// Positional role fallback used when no strategy produced a confident name.
fn fallback_mapping(label: &str, position: usize, total: usize, episode: &Episode) -> SpeakerMapping {
    let speaker_num = SPEAKER_NUM_RE
        .captures(label)
        .and_then(|c| c[1].parse::<usize>().ok());
    let effective_position = speaker_num
        .map(|n| n.saturating_sub(if n > 0 { 1 } else { 0 }))
        .unwrap_or(position);

    let name = if total == 1 {
        "Host/Narrator".to_string()
    } else if effective_position == 0 {
        match &episode.author {
            Some(author) if !author.trim().is_empty() => format!("{} (Host)", author.trim()),
            _ => "Primary Speaker".to_string(),
        }
    } else if effective_position == 1 {
        "Guest".to_string()
    } else {
        format!("Guest {}", effective_position)
    };

    SpeakerMapping {
        generic_label: label.to_string(),
        identified_name: name,
        confidence: 0.5,
        source: MappingSource::Fallback,
        evidence: vec!["positional role".to_string()],
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}
