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
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::pool::FileLock;
use crate::types::PipelineStage;

pub const CHECKPOINT_VERSION: &str = "3.0";

/// Payloads at or above this size are gzipped on disk.
const GZIP_THRESHOLD: usize = 1024;

type MigrationFn = Box<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Sibling metadata for every checkpoint blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: String,
    pub episode_id: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub compressed: bool,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Per-episode progress: current status plus the vector of completed stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeProgress {
    pub episode_id: String,
    pub status: String,
    pub completed_stages: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointStats {
    pub active_episodes: usize,
    pub completed_episodes: usize,
    pub total_files: usize,
    pub total_bytes: u64,
}

/// Makes each pipeline stage idempotent and resumable across crashes.
/// Blobs live under `episodes/` and `segments/`, metadata under `metadata/`.
/// Every write goes through temp-file + fsync + rename.
pub struct CheckpointManager {
    root: PathBuf,
    distributed: bool,
    lock_path: PathBuf,
    migrations: HashMap<String, MigrationFn>,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>, distributed: bool) -> Result<Self> {
        let root = root.into();
        for sub in ["episodes", "metadata", "segments"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        let lock_path = root.join(".checkpoint.lock");
        Ok(Self {
            root,
            distributed,
            lock_path,
            migrations: HashMap::new(),
        })
    }

    /// Register a migration applied to payloads stored under `from_version`.
    pub fn register_migration(
        &mut self,
        from_version: impl Into<String>,
        migrate: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) {
        self.migrations.insert(from_version.into(), Box::new(migrate));
    }

    fn blob_path(&self, episode_id: &str, stage: PipelineStage, segment_index: Option<usize>, gz: bool) -> PathBuf {
        let ext = if gz { "ckpt.gz" } else { "ckpt" };
        match segment_index {
            Some(idx) => self
                .root
                .join("segments")
                .join(format!("{}_{}_{}.{}", episode_id, stage, idx, ext)),
            None => self
                .root
                .join("episodes")
                .join(format!("{}_{}.{}", episode_id, stage, ext)),
        }
    }

    fn metadata_path(&self, episode_id: &str, stage: PipelineStage, segment_index: Option<usize>) -> PathBuf {
        let name = match segment_index {
            Some(idx) => format!("{}_{}_{}.json", episode_id, stage, idx),
            None => format!("{}_{}.json", episode_id, stage),
        };
        self.root.join("metadata").join(name)
    }

    fn progress_path(&self, episode_id: &str) -> PathBuf {
        self.root.join("episodes").join(format!("{}_progress.json", episode_id))
    }

    /// Serialize, optionally gzip, and durably write a stage payload. The
    /// lock wait, compression, and fsync run on the blocking pool so an
    /// async worker is never parked behind a contended checkpoint lock.
    pub async fn save_episode_progress<T: Serialize>(
        &self,
        episode_id: &str,
        stage: PipelineStage,
        payload: &T,
        segment_index: Option<usize>,
    ) -> Result<()> {
        let raw = serde_json::to_vec(payload)?;
        let compressed = raw.len() >= GZIP_THRESHOLD;

        let job = SaveJob {
            checksum: hex_digest(&raw),
            final_path: self.blob_path(episode_id, stage, segment_index, compressed),
            stale_path: self.blob_path(episode_id, stage, segment_index, !compressed),
            meta_path: self.metadata_path(episode_id, stage, segment_index),
            lock_path: self.distributed.then(|| self.lock_path.clone()),
            episode_id: episode_id.to_string(),
            stage: stage.to_string(),
            segment_index,
            raw,
            compressed,
        };

        tokio::task::spawn_blocking(move || write_checkpoint(job))
            .await
            .map_err(|e| PipelineError::Invariant(format!("checkpoint write task failed: {}", e)))?
    }

    /// Load a stage payload. Malformed content is quarantined and `None` is
    /// returned so the caller simply re-runs the stage.
    pub fn load_episode_progress<T: DeserializeOwned>(
        &self,
        episode_id: &str,
        stage: PipelineStage,
        segment_index: Option<usize>,
    ) -> Result<Option<T>> {
        let gz_path = self.blob_path(episode_id, stage, segment_index, true);
        let plain_path = self.blob_path(episode_id, stage, segment_index, false);
        let (path, compressed) = if gz_path.exists() {
            (gz_path, true)
        } else if plain_path.exists() {
            (plain_path, false)
        } else {
            return Ok(None);
        };

        let bytes = std::fs::read(&path)?;
        let raw = if compressed {
            let mut decoder = GzDecoder::new(bytes.as_slice());
            let mut out = Vec::new();
            match decoder.read_to_end(&mut out) {
                Ok(_) => out,
                Err(e) => {
                    tracing::error!("Checkpoint {} failed to decompress: {}", path.display(), e);
                    self.quarantine(&path);
                    return Ok(None);
                }
            }
        } else {
            bytes
        };

        let meta_path = self.metadata_path(episode_id, stage, segment_index);
        let metadata = read_metadata(&meta_path);

        if let Some(meta) = &metadata {
            if meta.checksum != hex_digest(&raw) {
                tracing::error!("Checkpoint {} failed checksum verification", path.display());
                self.quarantine(&path);
                return Ok(None);
            }
        }

        let mut value: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Checkpoint {} is not valid JSON: {}", path.display(), e);
                self.quarantine(&path);
                return Ok(None);
            }
        };

        // Walk the migration chain from the stored version. Unknown versions
        // are read as-is when the structure still matches.
        if let Some(meta) = &metadata {
            let mut version = meta.version.clone();
            while version != CHECKPOINT_VERSION {
                match self.migrations.get(&version) {
                    Some(migrate) => {
                        value = migrate(value);
                        version = CHECKPOINT_VERSION.to_string();
                    }
                    None => break,
                }
            }
        }

        match serde_json::from_value(value) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                tracing::error!("Checkpoint {} has unexpected shape: {}", path.display(), e);
                self.quarantine(&path);
                Ok(None)
            }
        }
    }

    fn quarantine(&self, path: &Path) {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("checkpoint");
        let target = path.with_file_name(format!("corrupted_{}_{}", stamp, name));
        if let Err(e) = std::fs::rename(path, &target) {
            tracing::warn!("Failed to quarantine {}: {}", path.display(), e);
        } else {
            tracing::warn!("Quarantined corrupted checkpoint to {}", target.display());
        }
    }

    /// Append a stage to the episode's completed set and refresh its status.
    pub fn mark_stage_complete(&self, episode_id: &str, stage: PipelineStage) -> Result<()> {
        let path = self.progress_path(episode_id);
        let mut progress = self.load_progress(episode_id)?.unwrap_or_else(|| EpisodeProgress {
            episode_id: episode_id.to_string(),
            status: stage.to_string(),
            completed_stages: Vec::new(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let name = stage.to_string();
        if !progress.completed_stages.contains(&name) {
            progress.completed_stages.push(name);
        }
        progress.status = stage.to_string();
        progress.updated_at = Utc::now();

        atomic_write(&path, &serde_json::to_vec_pretty(&progress)?)?;
        Ok(())
    }

    pub fn load_progress(&self, episode_id: &str) -> Result<Option<EpisodeProgress>> {
        let path = self.progress_path(episode_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(progress) => Ok(Some(progress)),
            Err(e) => {
                tracing::error!("Progress file {} is corrupt: {}", path.display(), e);
                self.quarantine(&path);
                Ok(None)
            }
        }
    }

    pub fn is_stage_complete(&self, episode_id: &str, stage: PipelineStage) -> Result<bool> {
        Ok(self
            .load_progress(episode_id)?
            .map(|p| p.completed_stages.contains(&stage.to_string()))
            .unwrap_or(false))
    }

    pub fn completed_stages(&self, episode_id: &str) -> Result<Vec<PipelineStage>> {
        let progress = match self.load_progress(episode_id)? {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        Ok(progress
            .completed_stages
            .iter()
            .filter_map(|s| PipelineStage::parse(s))
            .collect())
    }

    /// Stages with a persisted checkpoint blob for this episode.
    pub fn get_episode_checkpoints(&self, episode_id: &str) -> Result<Vec<PipelineStage>> {
        let mut found = Vec::new();
        for stage in PipelineStage::ordered() {
            if self.blob_path(episode_id, *stage, None, true).exists()
                || self.blob_path(episode_id, *stage, None, false).exists()
            {
                found.push(*stage);
            }
        }
        Ok(found)
    }

    /// Episodes with some progress but no `complete` marker.
    pub fn get_incomplete_episodes(&self) -> Result<Vec<String>> {
        let mut incomplete = Vec::new();
        let dir = self.root.join("episodes");
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("corrupted_") {
                continue;
            }
            if let Some(episode_id) = name.strip_suffix("_progress.json") {
                if let Some(progress) = self.load_progress(episode_id)? {
                    let complete_name = PipelineStage::Complete.to_string();
                    if !progress.completed_stages.contains(&complete_name) {
                        incomplete.push(episode_id.to_string());
                    }
                }
            }
        }
        incomplete.sort();
        Ok(incomplete)
    }

    /// True when the episode's last update is older than the expiry window.
    /// Expired episodes restart from the beginning rather than resuming.
    pub fn is_expired(&self, episode_id: &str, expiry_hours: i64) -> Result<bool> {
        match self.load_progress(episode_id)? {
            Some(progress) => {
                let age = Utc::now() - progress.updated_at;
                Ok(age.num_hours() >= expiry_hours)
            }
            None => Ok(false),
        }
    }

    /// Drop every on-disk artifact for an episode so it restarts fresh.
    pub fn reset_episode(&self, episode_id: &str) -> Result<()> {
        for sub in ["episodes", "metadata", "segments"] {
            let dir = self.root.join(sub);
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&format!("{}_", episode_id)) {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        tracing::info!("Reset checkpoints for episode {}", episode_id);
        Ok(())
    }

    /// Remove checkpoint files older than `days`, by filesystem mtime.
    pub fn clean_old_checkpoints(&self, days: u64) -> Result<usize> {
        let cutoff = std::time::SystemTime::now()
            .checked_sub(Duration::from_secs(days * 24 * 3600))
            .unwrap_or(std::time::UNIX_EPOCH);
        let mut removed = 0usize;

        for sub in ["episodes", "metadata", "segments"] {
            let dir = self.root.join(sub);
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let mtime = entry.metadata()?.modified()?;
                if mtime < cutoff {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!("Cleaned up {} old checkpoint files", removed);
        }
        Ok(removed)
    }

    /// Archive checkpoints (optionally a subset of episodes) into a .tar.gz.
    pub fn export_checkpoints(&self, archive: &Path, episode_ids: Option<&[String]>) -> Result<()> {
        let file = std::fs::File::create(archive)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for sub in ["episodes", "metadata", "segments"] {
            let dir = self.root.join(sub);
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let include = match episode_ids {
                    Some(ids) => ids.iter().any(|id| name.starts_with(&format!("{}_", id))),
                    None => true,
                };
                if include {
                    builder.append_path_with_name(entry.path(), format!("{}/{}", sub, name))?;
                }
            }
        }

        builder.into_inner()?.finish()?;
        tracing::info!("Exported checkpoints to {}", archive.display());
        Ok(())
    }

    /// Restore checkpoints from an archive produced by `export_checkpoints`.
    /// Entries outside the known subdirectories are skipped.
    pub fn import_checkpoints(&self, archive: &Path) -> Result<usize> {
        let file = std::fs::File::open(archive)?;
        let decoder = GzDecoder::new(file);
        let mut reader = tar::Archive::new(decoder);
        let mut imported = 0usize;

        for entry in reader.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_path_buf();
            let mut components = path.components();
            let sub = components
                .next()
                .and_then(|c| c.as_os_str().to_str().map(|s| s.to_string()));
            let file_name = components
                .next()
                .and_then(|c| c.as_os_str().to_str().map(|s| s.to_string()));

            match (sub.as_deref(), file_name) {
                (Some(sub @ ("episodes" | "metadata" | "segments")), Some(name)) => {
                    let target = self.root.join(sub).join(name);
                    let mut bytes = Vec::new();
                    entry.read_to_end(&mut bytes)?;
                    atomic_write(&target, &bytes)?;
                    imported += 1;
                }
                _ => {
                    tracing::warn!("Skipping unexpected archive entry {}", path.display());
                }
            }
        }

        tracing::info!("Imported {} checkpoint files from {}", imported, archive.display());
        Ok(imported)
    }

    pub fn statistics(&self) -> Result<CheckpointStats> {
        let mut stats = CheckpointStats::default();
        let mut completed = 0usize;
        let mut active = 0usize;

        for sub in ["episodes", "metadata", "segments"] {
            let dir = self.root.join(sub);
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                stats.total_files += 1;
                stats.total_bytes += entry.metadata()?.len();

                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("corrupted_") {
                    continue;
                }
                if let Some(episode_id) = name.strip_suffix("_progress.json") {
                    if self.is_stage_complete(episode_id, PipelineStage::Complete)? {
                        completed += 1;
                    } else {
                        active += 1;
                    }
                }
            }
        }

        stats.completed_episodes = completed;
        stats.active_episodes = active;
        Ok(stats)
    }
}

/// Everything the blocking writer needs, detached from the manager so the
/// closure can move onto the blocking pool.
struct SaveJob {
    raw: Vec<u8>,
    compressed: bool,
    checksum: String,
    final_path: PathBuf,
    stale_path: PathBuf,
    meta_path: PathBuf,
    lock_path: Option<PathBuf>,
    episode_id: String,
    stage: String,
    segment_index: Option<usize>,
}

fn write_checkpoint(job: SaveJob) -> Result<()> {
    let _guard = match &job.lock_path {
        Some(path) => Some(FileLock::new(path.clone()).acquire(Some(Duration::from_secs(30)))?),
        None => None,
    };

    let bytes = if job.compressed {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&job.raw)?;
        encoder.finish()?
    } else {
        job.raw.clone()
    };

    atomic_write(&job.final_path, &bytes)?;
    if job.stale_path.exists() {
        let _ = std::fs::remove_file(&job.stale_path);
    }

    let created_at = read_metadata(&job.meta_path)
        .map(|m| m.created_at)
        .unwrap_or_else(Utc::now);
    let metadata = CheckpointMetadata {
        version: CHECKPOINT_VERSION.to_string(),
        episode_id: job.episode_id.clone(),
        stage: job.stage.clone(),
        segment_index: job.segment_index,
        created_at,
        updated_at: Utc::now(),
        compressed: job.compressed,
        size_bytes: job.raw.len() as u64,
        checksum: job.checksum,
    };
    atomic_write(&job.meta_path, &serde_json::to_vec_pretty(&metadata)?)?;

    tracing::debug!(
        "Checkpoint saved: episode={} stage={} segment={:?} bytes={} gz={}",
        job.episode_id,
        job.stage,
        job.segment_index,
        job.raw.len(),
        job.compressed
    );
    Ok(())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn read_metadata(path: &Path) -> Option<CheckpointMetadata> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Write bytes via temp file + fsync + rename in the target directory.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (CheckpointManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), false).unwrap();
        (mgr, dir)
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let (mgr, _dir) = manager();
        let payload = json!({"segments": [1, 2, 3], "note": "hello"});
        mgr.save_episode_progress("ep1", PipelineStage::Transcribe, &payload, None).await.unwrap();

        let loaded: Option<serde_json::Value> =
            mgr.load_episode_progress("ep1", PipelineStage::Transcribe, None).unwrap();
        assert_eq!(loaded, Some(payload));
    }

    #[tokio::test]
    async fn large_payloads_are_gzipped_and_round_trip() {
        let (mgr, dir) = manager();
        let big: String = "x".repeat(10_000);
        let payload = json!({ "blob": big });
        mgr.save_episode_progress("ep1", PipelineStage::ExtractKnowledge, &payload, None).await.unwrap();

        let gz = dir
            .path()
            .join("episodes")
            .join("ep1_extract_knowledge.ckpt.gz");
        assert!(gz.exists());

        let loaded: Option<serde_json::Value> =
            mgr.load_episode_progress("ep1", PipelineStage::ExtractKnowledge, None).unwrap();
        assert_eq!(loaded, Some(payload));
    }

    #[tokio::test]
    async fn segment_checkpoints_are_separate() {
        let (mgr, _dir) = manager();
        mgr.save_episode_progress("ep1", PipelineStage::ExtractKnowledge, &json!({"i": 1}), Some(1)).await.unwrap();
        mgr.save_episode_progress("ep1", PipelineStage::ExtractKnowledge, &json!({"i": 2}), Some(2)).await.unwrap();

        let one: Option<serde_json::Value> = mgr
            .load_episode_progress("ep1", PipelineStage::ExtractKnowledge, Some(1))
            .unwrap();
        assert_eq!(one, Some(json!({"i": 1})));

        let missing: Option<serde_json::Value> = mgr
            .load_episode_progress("ep1", PipelineStage::ExtractKnowledge, Some(3))
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn corrupted_checkpoint_is_quarantined() {
        let (mgr, dir) = manager();
        mgr.save_episode_progress("ep1", PipelineStage::Transcribe, &json!({"ok": true}), None).await.unwrap();

        let path = dir.path().join("episodes").join("ep1_transcribe.ckpt");
        std::fs::write(&path, b"{not json at all").unwrap();

        let loaded: Option<serde_json::Value> =
            mgr.load_episode_progress("ep1", PipelineStage::Transcribe, None).unwrap();
        assert!(loaded.is_none());
        assert!(!path.exists());

        let quarantined = std::fs::read_dir(dir.path().join("episodes"))
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("corrupted_"));
        assert!(quarantined);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_quarantined() {
        let (mgr, dir) = manager();
        mgr.save_episode_progress("ep1", PipelineStage::Transcribe, &json!({"v": 1}), None).await.unwrap();

        // Valid JSON, wrong checksum.
        let path = dir.path().join("episodes").join("ep1_transcribe.ckpt");
        std::fs::write(&path, b"{\"v\":2}").unwrap();

        let loaded: Option<serde_json::Value> =
            mgr.load_episode_progress("ep1", PipelineStage::Transcribe, None).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn completed_stages_drive_incomplete_listing() {
        let (mgr, _dir) = manager();
        mgr.mark_stage_complete("ep1", PipelineStage::Transcribe).unwrap();
        mgr.mark_stage_complete("ep2", PipelineStage::Transcribe).unwrap();
        mgr.mark_stage_complete("ep2", PipelineStage::Complete).unwrap();

        assert!(mgr.is_stage_complete("ep1", PipelineStage::Transcribe).unwrap());
        assert!(!mgr.is_stage_complete("ep1", PipelineStage::Store).unwrap());
        assert_eq!(mgr.get_incomplete_episodes().unwrap(), vec!["ep1".to_string()]);
    }

    #[tokio::test]
    async fn migration_applies_to_old_versions() {
        let (mgr, dir) = manager();
        mgr.save_episode_progress("ep1", PipelineStage::Transcribe, &json!({"old_field": 7}), None).await.unwrap();

        // Rewrite the metadata to claim an older version.
        let meta_path = dir.path().join("metadata").join("ep1_transcribe.json");
        let mut meta: CheckpointMetadata =
            serde_json::from_str(&std::fs::read_to_string(&meta_path).unwrap()).unwrap();
        meta.version = "2.0".to_string();
        std::fs::write(&meta_path, serde_json::to_string(&meta).unwrap()).unwrap();

        let mut mgr = mgr;
        mgr.register_migration("2.0", |mut value| {
            if let Some(obj) = value.as_object_mut() {
                if let Some(v) = obj.remove("old_field") {
                    obj.insert("new_field".to_string(), v);
                }
            }
            value
        });

        let loaded: Option<serde_json::Value> =
            mgr.load_episode_progress("ep1", PipelineStage::Transcribe, None).unwrap();
        assert_eq!(loaded, Some(json!({"new_field": 7})));
    }

    #[tokio::test]
    async fn export_import_round_trip() {
        let (mgr, dir) = manager();
        mgr.save_episode_progress("ep1", PipelineStage::Transcribe, &json!({"v": 1}), None).await.unwrap();
        mgr.mark_stage_complete("ep1", PipelineStage::Transcribe).unwrap();

        let archive = dir.path().join("backup.tar.gz");
        mgr.export_checkpoints(&archive, None).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let mgr2 = CheckpointManager::new(dir2.path(), false).unwrap();
        let imported = mgr2.import_checkpoints(&archive).unwrap();
        assert!(imported >= 2);

        let loaded: Option<serde_json::Value> =
            mgr2.load_episode_progress("ep1", PipelineStage::Transcribe, None).unwrap();
        assert_eq!(loaded, Some(json!({"v": 1})));
        assert!(mgr2.is_stage_complete("ep1", PipelineStage::Transcribe).unwrap());
    }

    #[tokio::test]
    async fn reset_removes_episode_files() {
        let (mgr, _dir) = manager();
        mgr.save_episode_progress("ep1", PipelineStage::Transcribe, &json!({"v": 1}), None).await.unwrap();
        mgr.save_episode_progress("ep2", PipelineStage::Transcribe, &json!({"v": 2}), None).await.unwrap();

        mgr.reset_episode("ep1").unwrap();

        let gone: Option<serde_json::Value> =
            mgr.load_episode_progress("ep1", PipelineStage::Transcribe, None).unwrap();
        let kept: Option<serde_json::Value> =
            mgr.load_episode_progress("ep2", PipelineStage::Transcribe, None).unwrap();
        assert!(gone.is_none());
        assert!(kept.is_some());
    }

    #[test]
    fn statistics_count_episodes() {
        let (mgr, _dir) = manager();
        mgr.mark_stage_complete("ep1", PipelineStage::Transcribe).unwrap();
        mgr.mark_stage_complete("ep2", PipelineStage::Complete).unwrap();

        let stats = mgr.statistics().unwrap();
        assert_eq!(stats.active_episodes, 1);
        assert_eq!(stats.completed_episodes, 1);
        assert!(stats.total_files >= 2);
    }
}
