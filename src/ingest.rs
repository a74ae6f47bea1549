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

use crate::error::{PipelineError, Result};
use crate::types::Episode;
use crate::vtt;

/// Feed resolution collaborator: a feed URL becomes an ordered episode list.
/// The network RSS client implements this outside the core.
#[async_trait]
pub trait EpisodeSource: Send + Sync {
    async fn discover(&self, podcast_id: &str, feed_url: &str) -> Result<Vec<Episode>>;
}

/// Transcription collaborator: audio in, time-coded VTT text out. The core
/// never performs speech-to-text itself.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, episode: &Episode) -> Result<String>;
}

/// One unit of intake work: an episode, optionally backed by a pre-transcribed
/// VTT file sitting in the inbox directory.
#[derive(Debug, Clone)]
pub struct IntakeItem {
    pub episode: Episode,
    pub vtt_path: Option<PathBuf>,
    /// Path relative to the inbox root, preserved on move to processed/.
    pub relative_path: Option<PathBuf>,
}

/// Scan the VTT inbox directory recursively and build intake items from the
/// transcripts' embedded metadata.
pub fn scan_inbox(input_dir: &Path, default_podcast_id: &str) -> Result<Vec<IntakeItem>> {
    let mut items = Vec::new();
    if !input_dir.exists() {
        return Ok(items);
    }

    let mut paths = Vec::new();
    collect_vtt_files(input_dir, &mut paths)?;
    paths.sort();

    for path in paths {
        match intake_from_vtt(&path, input_dir, default_podcast_id) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!("Skipping unreadable transcript {}: {}", path.display(), e);
            }
        }
    }

    Ok(items)
}

fn collect_vtt_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_vtt_files(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("vtt") {
            out.push(path);
        }
    }
    Ok(())
}

/// Build an intake item from a transcript file. Metadata comes from the NOTE
/// blocks when present; missing fields fall back to the filename.
pub fn intake_from_vtt(path: &Path, input_root: &Path, default_podcast_id: &str) -> Result<IntakeItem> {
    let content = std::fs::read_to_string(path)?;

    // A peek at the metadata only; full validation happens in the pipeline.
    let metadata = match vtt::parse(&content) {
        Ok(parsed) => parsed.metadata,
        Err(PipelineError::MalformedInput(_)) => Default::default(),
        Err(e) => return Err(e),
    };

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("episode")
        .to_string();

    let podcast_id = if metadata.podcast_id.is_empty() {
        default_podcast_id.to_string()
    } else {
        metadata.podcast_id.clone()
    };
    let title = if metadata.episode_title.is_empty() {
        stem.clone()
    } else {
        metadata.episode_title.clone()
    };

    let id = if metadata.episode_id.is_empty() {
        Episode::content_id(None, &title, &path.to_string_lossy())
    } else {
        metadata.episode_id.clone()
    };

    let episode = Episode {
        id,
        podcast_id,
        title,
        description: metadata.description.clone().unwrap_or_default(),
        published_at: None,
        audio_url: String::new(),
        duration_secs: None,
        guid: None,
        youtube_url: metadata.youtube_url.clone(),
        author: metadata.host.clone(),
    };

    let relative_path = path.strip_prefix(input_root).ok().map(|p| p.to_path_buf());

    Ok(IntakeItem {
        episode,
        vtt_path: Some(path.to_path_buf()),
        relative_path,
    })
}

/// Transcriber for pre-transcribed inbox files: reads the VTT from disk.
pub struct FileTranscriber;

#[async_trait]
impl Transcriber for FileTranscriber {
    async fn transcribe(&self, episode: &Episode) -> Result<String> {
        Err(PipelineError::Config(format!(
            "episode '{}' has no transcript file and no audio transcriber is configured",
            episode.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "WEBVTT\n\nNOTE JSON Metadata\n{\"podcast_id\": \"tech_talk\", \"episode_id\": \"ep42\", \"episode_title\": \"The Future\"}\n\n00:00:01.000 --> 00:00:04.000\n<v SPEAKER_1>Hello there everyone.\n";

    #[test]
    fn scans_nested_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("shows/tech");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("ep1.vtt"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("ep2.vtt"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a transcript").unwrap();

        let items = scan_inbox(dir.path(), "default_pod").unwrap();
        assert_eq!(items.len(), 2);
        assert!(items
            .iter()
            .any(|i| i.relative_path.as_deref() == Some(Path::new("shows/tech/ep1.vtt"))));
    }

    #[test]
    fn intake_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ep.vtt");
        std::fs::write(&path, SAMPLE).unwrap();

        let item = intake_from_vtt(&path, dir.path(), "fallback").unwrap();
        assert_eq!(item.episode.podcast_id, "tech_talk");
        assert_eq!(item.episode.id, "ep42");
        assert_eq!(item.episode.title, "The Future");
    }

    #[test]
    fn intake_falls_back_to_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my_episode.vtt");
        // Headerless file: metadata peek degrades, filename wins.
        std::fs::write(&path, "no header at all\n").unwrap();

        let item = intake_from_vtt(&path, dir.path(), "fallback").unwrap();
        assert_eq!(item.episode.podcast_id, "fallback");
        assert_eq!(item.episode.title, "my_episode");
        assert_eq!(item.episode.id.len(), 32);
    }

    #[test]
    fn missing_inbox_is_empty() {
        let items = scan_inbox(Path::new("/nonexistent/inbox"), "x").unwrap();
        assert!(items.is_empty());
    }
}
