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
use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};
use crate::text::wrap_text;
use crate::types::Segment;

lazy_static! {
    static ref TIMING_RE: Regex = Regex::new(
        r"^(\d{1,2}):(\d{2}):(\d{2})\.(\d{3})\s*-->\s*(\d{1,2}):(\d{2}):(\d{2})\.(\d{3})"
    )
    .unwrap();
    static ref VOICE_RE: Regex = Regex::new(r"^<v\s+([^>]+)>(.*)$").unwrap();
}

/// Speaker cue colors for the optional STYLE block. First is typically the host.
const SPEAKER_COLORS: &[&str] = &["#3498db", "#2ecc71", "#e74c3c", "#f39c12", "#9b59b6"];

/// Metadata embedded in (and recovered from) a transcript's NOTE blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptMetadata {
    #[serde(default)]
    pub podcast_id: String,
    #[serde(default)]
    pub podcast_name: String,
    #[serde(default)]
    pub episode_id: String,
    #[serde(default)]
    pub episode_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guests: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_date: Option<String>,
    /// Generic label -> identified speaker, once identification has run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub speakers: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ParsedTranscript {
    pub metadata: TranscriptMetadata,
    pub segments: Vec<Segment>,
}

/// Parse a WebVTT transcript: header marker, optional NOTE metadata blocks,
/// cue blocks with optional `<v Speaker>` voice tags.
pub fn parse(content: &str) -> Result<ParsedTranscript> {
    let trimmed = content.trim_start_matches('\u{feff}');
    let mut lines = trimmed.lines().peekable();

    match lines.next() {
        Some(first) if first.trim_start().starts_with("WEBVTT") => {}
        _ => {
            return Err(PipelineError::MalformedInput(
                "transcript missing WEBVTT header marker".to_string(),
            ))
        }
    }

    let mut metadata = TranscriptMetadata::default();
    let mut segments: Vec<Segment> = Vec::new();
    let mut saw_timing = false;

    let all_lines: Vec<&str> = lines.collect();
    let mut i = 0usize;

    while i < all_lines.len() {
        let line = all_lines[i].trim_end();

        if line.trim().is_empty() {
            i += 1;
            continue;
        }

        if line.trim_start().starts_with("NOTE") {
            let mut block = Vec::new();
            i += 1;
            while i < all_lines.len() && !all_lines[i].trim().is_empty() {
                block.push(all_lines[i]);
                i += 1;
            }
            parse_note_block(&block, &mut metadata);
            continue;
        }

        if line.trim_start().starts_with("STYLE") {
            i += 1;
            while i < all_lines.len() && !all_lines[i].trim().is_empty() {
                i += 1;
            }
            continue;
        }

        // Cue block: an optional identifier line, then the timing line.
        let timing_line = if TIMING_RE.is_match(line.trim()) {
            line.trim().to_string()
        } else if i + 1 < all_lines.len() && TIMING_RE.is_match(all_lines[i + 1].trim()) {
            i += 1;
            all_lines[i].trim().to_string()
        } else {
            if line.contains("-->") {
                return Err(PipelineError::MalformedInput(format!(
                    "invalid cue timing line: '{}'",
                    line.trim()
                )));
            }
            // Stray text outside any cue; skip it.
            i += 1;
            continue;
        };

        saw_timing = true;
        let caps = TIMING_RE.captures(&timing_line).ok_or_else(|| {
            PipelineError::MalformedInput(format!("invalid cue timing line: '{}'", timing_line))
        })?;
        let start_time = timestamp_to_seconds(&caps, 1);
        let mut end_time = timestamp_to_seconds(&caps, 5);

        if end_time < start_time {
            tracing::warn!(
                "Cue end {:.3} precedes start {:.3}; clamping",
                end_time,
                start_time
            );
            end_time = start_time;
        }

        // Collect text lines until the blank separator.
        i += 1;
        let mut speaker = None;
        let mut text_parts = Vec::new();
        while i < all_lines.len() && !all_lines[i].trim().is_empty() {
            let text_line = all_lines[i].trim();
            if let Some(vcaps) = VOICE_RE.captures(text_line) {
                speaker = Some(vcaps.get(1).unwrap().as_str().trim().to_string());
                text_parts.push(unescape_cue_text(vcaps.get(2).unwrap().as_str().trim()));
            } else {
                text_parts.push(unescape_cue_text(text_line));
            }
            i += 1;
        }

        let text = text_parts.join(" ").trim().to_string();

        if let Some(prev) = segments.last() {
            if start_time < prev.start_time {
                tracing::warn!(
                    "Cue at {:.3}s is out of order (previous start {:.3}s)",
                    start_time,
                    prev.start_time
                );
            } else if start_time < prev.end_time {
                tracing::debug!(
                    "Overlapping cues: {:.3}s starts before previous ends at {:.3}s",
                    start_time,
                    prev.end_time
                );
            }
        }

        segments.push(Segment {
            id: segments.len(),
            start_time,
            end_time,
            speaker,
            text,
        });
    }

    if !saw_timing {
        return Err(PipelineError::MalformedInput(
            "transcript has no cue with a '-->' separator".to_string(),
        ));
    }

    // File order must be start-time order; sort defensively when it is not.
    let mut ordered = true;
    for pair in segments.windows(2) {
        if pair[1].start_time < pair[0].start_time {
            ordered = false;
            break;
        }
    }
    if !ordered {
        segments.sort_by(|a, b| {
            a.start_time
                .partial_cmp(&b.start_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (idx, segment) in segments.iter_mut().enumerate() {
            segment.id = idx;
        }
    }

    Ok(ParsedTranscript { metadata, segments })
}

fn parse_note_block(block: &[&str], metadata: &mut TranscriptMetadata) {
    let joined = block.join("\n");
    let json_start = joined.find('{');
    let json_end = joined.rfind('}');

    if let (Some(start), Some(end)) = (json_start, json_end) {
        if end > start {
            if let Ok(parsed) =
                serde_json::from_str::<TranscriptMetadata>(&joined[start..=end])
            {
                merge_metadata(metadata, parsed);
                return;
            }
        }
    }

    // Human-readable NOTE lines ("Podcast: X").
    for line in block {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "Podcast" => metadata.podcast_name = value.to_string(),
                "Episode" => metadata.episode_title = value.to_string(),
                "Date" => metadata.publication_date = Some(value.to_string()),
                "Duration" => metadata.duration = Some(value.to_string()),
                "Host" => metadata.host = Some(value.to_string()),
                "YouTube" => metadata.youtube_url = Some(value.to_string()),
                _ => {}
            }
        }
    }
}

fn merge_metadata(into: &mut TranscriptMetadata, from: TranscriptMetadata) {
    if !from.podcast_id.is_empty() {
        into.podcast_id = from.podcast_id;
    }
    if !from.podcast_name.is_empty() {
        into.podcast_name = from.podcast_name;
    }
    if !from.episode_id.is_empty() {
        into.episode_id = from.episode_id;
    }
    if !from.episode_title.is_empty() {
        into.episode_title = from.episode_title;
    }
    into.publication_date = from.publication_date.or(into.publication_date.take());
    into.duration = from.duration.or(into.duration.take());
    into.host = from.host.or(into.host.take());
    into.guests = from.guests.or(into.guests.take());
    into.description = from.description.or(into.description.take());
    into.youtube_url = from.youtube_url.or(into.youtube_url.take());
    into.transcription_date = from.transcription_date.or(into.transcription_date.take());
    if !from.speakers.is_empty() {
        into.speakers = from.speakers;
    }
}

fn timestamp_to_seconds(caps: &regex::Captures<'_>, base: usize) -> f64 {
    let hours: f64 = caps[base].parse().unwrap_or(0.0);
    let minutes: f64 = caps[base + 1].parse().unwrap_or(0.0);
    let seconds: f64 = caps[base + 2].parse().unwrap_or(0.0);
    let millis: f64 = caps[base + 3].parse().unwrap_or(0.0);
    hours * 3600.0 + minutes * 60.0 + seconds + millis / 1000.0
}

pub fn format_timestamp(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

fn escape_cue_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn unescape_cue_text(text: &str) -> String {
    text.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

/// Post-process parsed segments: drop empty text, coalesce short consecutive
/// same-speaker cues below `min_duration`, and reassign contiguous IDs.
pub fn postprocess(segments: Vec<Segment>, min_duration: f64) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::new();

    for segment in segments {
        if segment.text.trim().is_empty() {
            continue;
        }

        match merged.last_mut() {
            Some(prev)
                if prev.speaker == segment.speaker
                    && prev.duration() + segment.duration() < min_duration =>
            {
                prev.end_time = prev.end_time.max(segment.end_time);
                prev.text = format!("{} {}", prev.text, segment.text.trim());
            }
            _ => merged.push(segment),
        }
    }

    for (idx, segment) in merged.iter_mut().enumerate() {
        segment.id = idx;
    }
    merged
}

/// Emit a complete VTT file: header, NOTE metadata (human lines + JSON),
/// optional STYLE block, then escaped cues.
pub fn emit(metadata: &TranscriptMetadata, segments: &[Segment]) -> String {
    let mut out = Vec::new();
    out.push("WEBVTT".to_string());
    out.push(String::new());

    out.push(build_note_block(metadata));
    out.push(String::new());

    if let Some(style) = build_style_block(&metadata.speakers) {
        out.push(style);
        out.push(String::new());
    }

    for segment in segments {
        out.push(format!(
            "{} --> {}",
            format_timestamp(segment.start_time),
            format_timestamp(segment.end_time)
        ));
        let text = escape_cue_text(&segment.text);
        match &segment.speaker {
            Some(speaker) => out.push(format!("<v {}>{}", speaker, text)),
            None => out.push(text),
        }
        out.push(String::new());
    }

    let mut joined = out.join("\n");
    if !joined.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

fn build_note_block(metadata: &TranscriptMetadata) -> String {
    let mut lines = vec!["NOTE".to_string()];

    if !metadata.podcast_name.is_empty() {
        lines.push(format!("Podcast: {}", metadata.podcast_name));
    }
    if !metadata.episode_title.is_empty() {
        lines.push(format!("Episode: {}", metadata.episode_title));
    }
    if let Some(date) = &metadata.publication_date {
        lines.push(format!("Date: {}", date));
    }
    if let Some(duration) = &metadata.duration {
        lines.push(format!("Duration: {}", duration));
    }
    if let Some(host) = &metadata.host {
        lines.push(format!("Host: {}", host));
    }
    if let Some(guests) = &metadata.guests {
        if !guests.is_empty() {
            lines.push(format!("Guests: {}", guests.join(", ")));
        }
    }
    if let Some(description) = &metadata.description {
        lines.extend(wrap_text(&format!("Description: {}", description), 80));
    }
    if let Some(url) = &metadata.youtube_url {
        lines.push(format!("YouTube: {}", url));
    }
    if let Some(date) = &metadata.transcription_date {
        lines.push(format!("Transcribed: {}", date));
    }

    lines.push(String::new());
    lines.push("NOTE JSON Metadata".to_string());
    lines.push(serde_json::to_string_pretty(metadata).unwrap_or_else(|_| "{}".to_string()));
    lines.join("\n")
}

fn build_style_block(speakers: &BTreeMap<String, String>) -> Option<String> {
    if speakers.is_empty() {
        return None;
    }

    let mut lines = vec!["STYLE".to_string()];
    for (i, name) in speakers.values().enumerate() {
        let color = SPEAKER_COLORS[i % SPEAKER_COLORS.len()];
        let safe_name = name.replace(' ', "\\ ").replace('(', "\\(").replace(')', "\\)");
        lines.push(format!("::cue(v[voice=\"{}\"]) {{", safe_name));
        lines.push(format!("  color: {};", color));
        lines.push("}".to_string());
    }
    Some(lines.join("\n"))
}
