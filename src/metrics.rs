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
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::AuditRecord;

/// Bounded window for response-time percentiles.
const RESPONSE_WINDOW: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodcastCounters {
    pub episodes_processed: u64,
    pub episodes_failed: u64,
    pub segments: u64,
    pub entities: u64,
    pub relationships: u64,
    pub quotes: u64,
    pub insights: u64,
    pub speakers_identified: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub episode_id: String,
    pub stage: String,
    pub error_kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsReport {
    pub episodes_processed: u64,
    pub episodes_failed: u64,
    pub segments: u64,
    pub entities: u64,
    pub relationships: u64,
    pub quotes: u64,
    pub insights: u64,
    pub speakers_identified: u64,
    pub llm_calls: u64,
    pub llm_timeouts: u64,
    pub llm_errors: u64,
    pub cache_hits: u64,
    pub cache_attempts: u64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub per_podcast: HashMap<String, PodcastCounters>,
    pub failures: Vec<FailureRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MetricsInner {
    report: MetricsReport,
    response_times_ms: Vec<f64>,
}

/// Per-run counters with per-podcast rollups, persisted to a JSON file on a
/// configurable interval and on shutdown.
pub struct PipelineMetrics {
    inner: Mutex<MetricsInner>,
    path: PathBuf,
}

impl PipelineMetrics {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Mutex::new(MetricsInner::default()),
            path,
        }
    }

    pub fn record_episode_processed(&self, podcast_id: &str) {
        let mut inner = self.inner.lock();
        inner.report.episodes_processed += 1;
        inner
            .report
            .per_podcast
            .entry(podcast_id.to_string())
            .or_default()
            .episodes_processed += 1;
    }

    pub fn record_episode_failed(&self, podcast_id: &str, failure: FailureRecord) {
        let mut inner = self.inner.lock();
        inner.report.episodes_failed += 1;
        inner
            .report
            .per_podcast
            .entry(podcast_id.to_string())
            .or_default()
            .episodes_failed += 1;
        inner.report.failures.push(failure);
    }

    pub fn record_extraction(
        &self,
        podcast_id: &str,
        segments: u64,
        entities: u64,
        relationships: u64,
        quotes: u64,
        insights: u64,
    ) {
        let mut inner = self.inner.lock();
        inner.report.segments += segments;
        inner.report.entities += entities;
        inner.report.relationships += relationships;
        inner.report.quotes += quotes;
        inner.report.insights += insights;

        let podcast = inner.report.per_podcast.entry(podcast_id.to_string()).or_default();
        podcast.segments += segments;
        podcast.entities += entities;
        podcast.relationships += relationships;
        podcast.quotes += quotes;
        podcast.insights += insights;
    }

    pub fn record_speakers_identified(&self, podcast_id: &str, count: u64) {
        let mut inner = self.inner.lock();
        inner.report.speakers_identified += count;
        inner
            .report
            .per_podcast
            .entry(podcast_id.to_string())
            .or_default()
            .speakers_identified += count;
    }

    pub fn record_llm_call(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.report.llm_calls += 1;
        if inner.response_times_ms.len() >= RESPONSE_WINDOW {
            inner.response_times_ms.remove(0);
        }
        inner.response_times_ms.push(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_llm_timeout(&self) {
        self.inner.lock().report.llm_timeouts += 1;
    }

    pub fn record_llm_error(&self) {
        self.inner.lock().report.llm_errors += 1;
    }

    pub fn record_cache(&self, hits: u64, attempts: u64) {
        let mut inner = self.inner.lock();
        inner.report.cache_hits = hits;
        inner.report.cache_attempts = attempts;
    }

    pub fn snapshot(&self) -> MetricsReport {
        let mut inner = self.inner.lock();

        let (avg, p95) = if inner.response_times_ms.is_empty() {
            (0.0, 0.0)
        } else {
            let mut sorted = inner.response_times_ms.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;
            let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
            let p95 = sorted[idx.min(sorted.len()).saturating_sub(1)];
            (avg, p95)
        };

        inner.report.avg_response_ms = avg;
        inner.report.p95_response_ms = p95;
        inner.report.updated_at = Some(Utc::now());
        inner.report.clone()
    }

    /// Atomically replace the metrics file with the current snapshot.
    pub fn persist(&self) -> Result<()> {
        let report = self.snapshot();
        let raw = serde_json::to_vec_pretty(&report)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&raw)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Spawn the periodic flush task; it stops (with a final flush) when the
    /// shutdown token fires.
    pub fn start_flush_task(self: &Arc<Self>, interval: Duration, token: CancellationToken) {
        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = metrics.persist() {
                            tracing::warn!("Final metrics flush failed: {}", e);
                        }
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = metrics.persist() {
                            tracing::warn!("Metrics flush failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}

/// Append-only durable log of speaker-mapping audits, one JSON object per line.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(()),
        }
    }

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let _guard = self.writer.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn append_all(&self, records: &[AuditRecord]) -> Result<()> {
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
