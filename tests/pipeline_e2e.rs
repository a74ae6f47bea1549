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

mod common;

use common::{long_transcript, podcast, sample_transcript, write_inbox_file, Harness, HarnessOptions};
use podcast_seeder::graph::{GraphBackend, Row};
use podcast_seeder::ingest::scan_inbox;
use podcast_seeder::key_rotation::KeyStatus;
use podcast_seeder::orchestrator::EpisodeJob;
use podcast_seeder::types::{Episode, ExtractionMode, PipelineStage};
use serde_json::json;

fn jobs_from_inbox(harness: &Harness) -> Vec<EpisodeJob> {
    scan_inbox(harness.inbox(), "tech_talk")
        .unwrap()
        .into_iter()
        .map(EpisodeJob::new)
        .collect()
}

fn episode_stub(podcast_id: &str, episode_id: &str) -> Episode {
    Episode {
        id: episode_id.to_string(),
        podcast_id: podcast_id.to_string(),
        title: String::new(),
        description: String::new(),
        published_at: None,
        audio_url: String::new(),
        duration_secs: None,
        guid: None,
        youtube_url: None,
        author: None,
    }
}

#[tokio::test]
async fn single_episode_happy_path() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::with_root(root.path(), HarnessOptions::default());

    let source = write_inbox_file(
        &harness,
        "shows/ep1.vtt",
        &sample_transcript("tech_talk", "ep1", "Automation Now"),
    );

    let summary = harness
        .orchestrator
        .run_batch(jobs_from_inbox(&harness))
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);

    // Episode reached the terminal completed state.
    assert!(harness
        .checkpoints
        .is_stage_complete("ep1", PipelineStage::Complete)
        .unwrap());

    // File moved to the processed directory, preserving relative structure.
    assert!(!source.exists());
    assert!(harness.processed().join("shows/ep1.vtt").exists());

    // Six segments parsed and stored.
    let mut filters = Row::new();
    filters.insert("episode_id".into(), json!("ep1"));
    let segments = harness
        .backend
        .find_nodes("db_tech_talk", Some("Segment"), &filters)
        .await
        .unwrap();
    assert_eq!(segments.len(), 6);

    // Both generic speakers mapped to concrete names in the emitted file.
    let emitted =
        std::fs::read_to_string(harness.config.data_dir.join("transcripts/ep1.vtt")).unwrap();
    assert!(!emitted.contains("<v SPEAKER_1>"));
    assert!(!emitted.contains("<v SPEAKER_2>"));
    assert!(emitted.contains("<v Maria Chen>"));

    // At least one entity and one quote extracted and stored.
    let entities = harness
        .backend
        .find_nodes("db_tech_talk", Some("Entity"), &Row::new())
        .await
        .unwrap();
    assert!(!entities.is_empty());
    let quotes = harness
        .backend
        .find_nodes("db_tech_talk", Some("Quote"), &Row::new())
        .await
        .unwrap();
    assert!(!quotes.is_empty());

    // Exactly one audit record per applied remapping, durable and mirrored.
    let audits = harness.audit_log.read_all().unwrap();
    assert_eq!(audits.len(), 2);
    assert!(audits.iter().any(|a| a.old_label == "SPEAKER_1" && a.new_label == "Maria Chen"));
    let audit_nodes = harness
        .backend
        .find_nodes("db_tech_talk", Some("Audit"), &Row::new())
        .await
        .unwrap();
    assert_eq!(audit_nodes.len(), 2);

    // Re-run is a no-op: all stages checkpointed, graph counts unchanged.
    let nodes_before = harness.backend.count_nodes("db_tech_talk", None).await.unwrap();
    let rels_before = harness.backend.relationships("db_tech_talk").await.unwrap().len();
    let calls_before = harness.provider.calls();

    let item = podcast_seeder::ingest::IntakeItem {
        episode: episode_stub("tech_talk", "ep1"),
        vtt_path: None,
        relative_path: None,
    };
    let summary2 = harness
        .orchestrator
        .run_batch(vec![EpisodeJob::new(item)])
        .await
        .unwrap();
    assert_eq!(summary2.processed, 1);
    assert_eq!(harness.provider.calls(), calls_before);
    assert_eq!(
        harness.backend.count_nodes("db_tech_talk", None).await.unwrap(),
        nodes_before
    );
    assert_eq!(
        harness.backend.relationships("db_tech_talk").await.unwrap().len(),
        rels_before
    );
    assert_eq!(harness.audit_log.read_all().unwrap().len(), 2);

    let report = harness.metrics.snapshot();
    assert_eq!(report.episodes_failed, 0);
    assert!(report.entities > 0);
}

#[tokio::test]
async fn rate_limit_rotation_pins_remaining_key() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::with_root(
        root.path(),
        HarnessOptions {
            keys: vec!["key-a".into(), "key-b".into(), "key-c".into()],
            ..Default::default()
        },
    );

    // Keys 0 and 2 are already quota-exhausted before the batch starts.
    harness
        .key_manager
        .mark_key_failure(0, "Resource has been exhausted (e.g. check quota)")
        .unwrap();
    harness
        .key_manager
        .mark_key_failure(2, "exceeded your current quota")
        .unwrap();

    write_inbox_file(
        &harness,
        "ep1.vtt",
        &sample_transcript("tech_talk", "ep1", "Rotation"),
    );

    let summary = harness
        .orchestrator
        .run_batch(jobs_from_inbox(&harness))
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert!(harness.provider.calls() > 0);

    // Every LLM call used key 1; the others never accrued usage.
    let snapshot = harness.key_manager.snapshot();
    assert_eq!(snapshot[0].status, KeyStatus::QuotaExceeded);
    assert_eq!(snapshot[1].status, KeyStatus::Available);
    assert_eq!(snapshot[2].status, KeyStatus::QuotaExceeded);
    assert_eq!(snapshot[1].requests_today as u64, harness.provider.calls());
    assert_eq!(snapshot[0].requests_today, 0);
    assert_eq!(snapshot[2].requests_today, 0);

    // The persisted key-state file reflects the same picture.
    let raw = std::fs::read_to_string(harness.config.key_state_path()).unwrap();
    let state: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(state["key_states"][0]["status"], json!("quota_exceeded"));
    assert_eq!(state["key_states"][1]["status"], json!("available"));
    assert_eq!(state["key_states"][2]["status"], json!("quota_exceeded"));
}

#[tokio::test]
async fn crash_mid_extraction_resumes_without_rework() {
    let root = tempfile::tempdir().unwrap();

    let opts = || HarnessOptions {
        batch_size: 1,
        workers: 1,
        max_retries: 1,
        ..Default::default()
    };

    // Run 1: the provider dies after the speaker call plus five full batches
    // (1 + 5 * 4 prompt calls), mid-way through batch index 5.
    {
        let harness = Harness::with_root(root.path(), opts());
        write_inbox_file(&harness, "ep_long.vtt", &long_transcript("tech_talk", "ep_long", 10));
        harness.provider.fail_after(21);

        let summary = harness
            .orchestrator
            .run_batch(jobs_from_inbox(&harness))
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);

        // Batches 0-4 are checkpointed; the episode is incomplete.
        for index in 0..5 {
            let cached: Option<serde_json::Value> = harness
                .checkpoints
                .load_episode_progress("ep_long", PipelineStage::ExtractKnowledge, Some(index))
                .unwrap();
            assert!(cached.is_some(), "batch {} checkpoint missing", index);
        }
        assert_eq!(
            harness.checkpoints.get_incomplete_episodes().unwrap(),
            vec!["ep_long".to_string()]
        );
    }

    // Run 2: a fresh process on the same data directory resumes. Only the
    // remaining five batches hit the provider.
    {
        let harness = Harness::with_root(root.path(), opts());
        let summary = harness
            .orchestrator
            .run_batch(jobs_from_inbox(&harness))
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(harness.provider.calls(), 20);

        assert!(harness
            .checkpoints
            .is_stage_complete("ep_long", PipelineStage::Complete)
            .unwrap());
        assert!(harness.checkpoints.get_incomplete_episodes().unwrap().is_empty());

        // All ten segments made it to storage exactly once.
        let mut filters = Row::new();
        filters.insert("episode_id".into(), json!("ep_long"));
        let segments = harness
            .backend
            .find_nodes("db_tech_talk", Some("Segment"), &filters)
            .await
            .unwrap();
        assert_eq!(segments.len(), 10);
    }
}

#[tokio::test]
async fn dual_write_keeps_both_schemas_consistent() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::with_root(
        root.path(),
        HarnessOptions {
            mode: ExtractionMode::Dual,
            ..Default::default()
        },
    );

    write_inbox_file(
        &harness,
        "ep1.vtt",
        &sample_transcript("tech_talk", "ep1", "Migration"),
    );

    let summary = harness
        .orchestrator
        .run_batch(jobs_from_inbox(&harness))
        .await
        .unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.processed, 1);

    // Identical entity sets under both schemas.
    let fixed = harness
        .backend
        .find_nodes("db_tech_talk", Some("Entity"), &Row::new())
        .await
        .unwrap();
    let mut filters = Row::new();
    filters.insert("_type".into(), json!("Entity"));
    let schemaless = harness
        .backend
        .find_nodes("db_tech_talk", Some("Node"), &filters)
        .await
        .unwrap();

    assert!(!fixed.is_empty());
    assert_eq!(fixed.len(), schemaless.len());

    let mut fixed_names: Vec<_> = fixed
        .iter()
        .filter_map(|n| n.properties.get("normalized_name").cloned())
        .collect();
    let mut schemaless_names: Vec<_> = schemaless
        .iter()
        .filter_map(|n| n.properties.get("normalized_name").cloned())
        .collect();
    fixed_names.sort_by_key(|v| v.to_string());
    schemaless_names.sort_by_key(|v| v.to_string());
    assert_eq!(fixed_names, schemaless_names);

    assert!(harness
        .store
        .verify_dual_write(&episode_stub("tech_talk", "ep1"))
        .await
        .unwrap());
}

#[tokio::test]
async fn per_podcast_isolation_routes_to_distinct_databases() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::with_root(
        root.path(),
        HarnessOptions {
            podcasts: vec![podcast("alpha", "db_alpha"), podcast("beta", "db_beta")],
            workers: 2,
            ..Default::default()
        },
    );

    write_inbox_file(
        &harness,
        "alpha_ep.vtt",
        &sample_transcript("alpha", "alpha_ep", "Alpha Hour"),
    );
    write_inbox_file(&harness, "beta_ep.vtt", &long_transcript("beta", "beta_ep", 4));

    let summary = harness
        .orchestrator
        .run_batch(jobs_from_inbox(&harness))
        .await
        .unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 0);

    // Database A holds only podcast A's data, and vice versa.
    let alpha_entities = harness
        .backend
        .find_nodes("db_alpha", Some("Entity"), &Row::new())
        .await
        .unwrap();
    assert!(!alpha_entities.is_empty());
    assert!(alpha_entities
        .iter()
        .all(|n| n.properties.get("podcast_id") == Some(&json!("alpha"))));

    let beta_entities = harness
        .backend
        .find_nodes("db_beta", Some("Entity"), &Row::new())
        .await
        .unwrap();
    assert!(!beta_entities.is_empty());
    assert!(beta_entities
        .iter()
        .all(|n| n.properties.get("podcast_id") == Some(&json!("beta"))));

    // Audit streams land in each podcast's own database.
    let alpha_audits = harness
        .backend
        .find_nodes("db_alpha", Some("Audit"), &Row::new())
        .await
        .unwrap();
    assert!(alpha_audits
        .iter()
        .all(|n| n.properties.get("episode_id") == Some(&json!("alpha_ep"))));
    let beta_audits = harness
        .backend
        .find_nodes("db_beta", Some("Audit"), &Row::new())
        .await
        .unwrap();
    assert!(beta_audits
        .iter()
        .all(|n| n.properties.get("episode_id") == Some(&json!("beta_ep"))));
}

#[tokio::test]
async fn malformed_transcript_fails_episode_but_not_batch() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::with_root(root.path(), HarnessOptions::default());

    let bad = write_inbox_file(&harness, "bad.vtt", "this file has no header\n00:00 nonsense\n");
    write_inbox_file(
        &harness,
        "good.vtt",
        &sample_transcript("tech_talk", "good_ep", "Still Works"),
    );

    let summary = harness
        .orchestrator
        .run_batch(jobs_from_inbox(&harness))
        .await
        .unwrap();

    // skip_errors keeps the batch going past the malformed episode.
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed, 1);

    assert!(harness
        .checkpoints
        .is_stage_complete("good_ep", PipelineStage::Complete)
        .unwrap());

    // The malformed file stays in the inbox; its episode never completed.
    assert!(bad.exists());
    assert!(harness.processed().join("good.vtt").exists());

    let report = harness.metrics.snapshot();
    assert_eq!(report.episodes_failed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].error_kind, "malformed_input");
}

#[tokio::test]
async fn expired_checkpoints_restart_from_scratch() {
    let root = tempfile::tempdir().unwrap();

    // Complete a run, then age the progress file past the expiry window.
    {
        let harness = Harness::with_root(root.path(), HarnessOptions::default());
        write_inbox_file(
            &harness,
            "ep1.vtt",
            &sample_transcript("tech_talk", "ep1", "Old Run"),
        );
        harness
            .orchestrator
            .run_batch(jobs_from_inbox(&harness))
            .await
            .unwrap();
    }

    let progress_path = root
        .path()
        .join("data/checkpoints/episodes/ep1_progress.json");
    let raw = std::fs::read_to_string(&progress_path).unwrap();
    let mut progress: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let stale = chrono::Utc::now() - chrono::Duration::hours(48);
    progress["updated_at"] = json!(stale.to_rfc3339());
    std::fs::write(&progress_path, serde_json::to_string(&progress).unwrap()).unwrap();

    // A restart sees the expired checkpoint and reprocesses from the start.
    let harness = Harness::with_root(root.path(), HarnessOptions::default());
    // The transcript moved to processed/ on the first run; feed it back in.
    std::fs::rename(
        harness.processed().join("ep1.vtt"),
        harness.inbox().join("ep1.vtt"),
    )
    .unwrap();

    let summary = harness
        .orchestrator
        .run_batch(jobs_from_inbox(&harness))
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert!(harness.provider.calls() > 0, "expired episode must re-run stages");
    assert!(harness
        .checkpoints
        .is_stage_complete("ep1", PipelineStage::Complete)
        .unwrap());
}
