use std::path::{Path, PathBuf};
use std::time::Duration;

use roster_core::{EventType, JobStatus, SyncStage, SyncStatus};
use roster_storage::{MemoryRosterStore, RosterStore};
use roster_sync::{BatchConfig, SyncConfig, SyncError, SyncPipeline, SyncRequest};
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/exports")
        .join(name)
}

fn test_config(chunk_size: usize, max_failed_chunks: usize) -> SyncConfig {
    SyncConfig {
        fetch_attempts: 2,
        fetch_retry_delay: Duration::from_millis(10),
        http_timeout: Duration::from_secs(5),
        batch: BatchConfig {
            chunk_size,
            max_failed_chunks,
            chunk_pause: Duration::ZERO,
            progress_every: 5,
        },
        ..SyncConfig::default()
    }
}

fn pipeline(store: &MemoryRosterStore, config: SyncConfig) -> SyncPipeline<MemoryRosterStore> {
    SyncPipeline::new(config, store.clone()).unwrap()
}

fn request(job_id: &str) -> SyncRequest {
    SyncRequest {
        job_id: job_id.to_string(),
        dataset_id: Some("bmm-test".to_string()),
        url: "http://127.0.0.1:9/unused".to_string(),
        event_type: EventType::BmmVoting,
        data_source: "membership_export".to_string(),
    }
}

fn members(n: usize) -> Vec<JsonValue> {
    (0..n)
        .map(|i| {
            json!({
                "membershipNumber": format!("{}", 200_000 + i),
                "fore1": format!("First{i}"),
                "surname": format!("Last{i}"),
                "primaryEmail": format!("member{i}@mail.co.nz"),
                "telephoneMobile": "0215550000",
                "branchDesc": ["Auckland"]
            })
        })
        .collect()
}

fn bare_array(records: &[JsonValue]) -> String {
    serde_json::to_string(records).unwrap()
}

#[tokio::test]
async fn sample_export_syncs_into_a_placeholder_event() {
    let store = MemoryRosterStore::new();
    let raw = std::fs::read_to_string(fixture("members_sample.json")).unwrap();
    let summary = pipeline(&store, test_config(500, 20))
        .run_with_text(&request("job-sample"), &raw)
        .await
        .unwrap();

    assert_eq!(summary.status, JobStatus::Success);
    assert!(summary.event_created);
    assert_eq!(summary.envelope, "object.data");
    assert_eq!(summary.report.stats.created, 5);
    assert_eq!(summary.report.stats.errored, 1);

    let events = store.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sync_status, SyncStatus::Success);
    assert!(events[0].last_sync_at.is_some());
    assert_eq!(events[0].dataset_ids, vec!["bmm-test".to_string()]);

    let progress = store.load_job_progress("job-sample").await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::Success);
    assert_eq!(progress.stage, SyncStage::Report);
    assert_eq!((progress.processed, progress.created, progress.errored), (6, 5, 1));
    assert!(progress.finished_at.is_some());

    let sam = store.roster_row(summary.event_id, "100002").await.unwrap().unwrap();
    assert_eq!(sam.name, "Sam Tuilagi");
    assert!(!sam.contact.has_valid_email);
    assert!(!sam.contact.has_valid_mobile);
}

#[tokio::test]
async fn rerunning_the_same_export_is_idempotent_and_keeps_identity() {
    let store = MemoryRosterStore::new();
    let sync = pipeline(&store, test_config(4, 20));
    let raw = bare_array(&members(10));

    let first = sync.run_with_text(&request("run-1"), &raw).await.unwrap();
    let before = store.roster(first.event_id).await;

    let second = sync.run_with_text(&request("run-2"), &raw).await.unwrap();
    let after = store.roster(second.event_id).await;

    assert_eq!(first.event_id, second.event_id);
    assert!(!second.event_created);
    assert_eq!(first.report.stats.created, 10);
    assert_eq!(second.report.stats.created, 0);
    assert_eq!(second.report.stats.updated, 10);
    assert_eq!(after.len(), 10);
    for (old, new) in before.iter().zip(after.iter()) {
        assert_eq!(old.id, new.id);
        assert_eq!(old.identity, new.identity);
        assert_eq!(old.workflow, new.workflow);
        assert_eq!(old.name, new.name);
        assert_eq!(old.profile, new.profile);
        assert_ne!(
            old.provenance.import_batch_id,
            new.provenance.import_batch_id
        );
    }
}

#[tokio::test]
async fn numeric_membership_number_and_bad_contacts_are_normalized() {
    let store = MemoryRosterStore::new();
    let raw = json!([{
        "membershipNumber": 123,
        "fore1": "Jo",
        "surname": "Doe",
        "primaryEmail": "",
        "telephoneMobile": "021"
    }])
    .to_string();

    let summary = pipeline(&store, test_config(500, 20))
        .run_with_text(&request("job-123"), &raw)
        .await
        .unwrap();
    assert_eq!(summary.report.stats.created, 1);

    let row = store.roster_row(summary.event_id, "123").await.unwrap().unwrap();
    assert_eq!(row.membership_number, "123");
    assert_eq!(row.name, "Jo Doe");
    assert!(!row.contact.has_valid_email);
    assert!(!row.contact.has_valid_mobile);
    assert_eq!(row.identity.verification_code.len(), 6);
}

#[tokio::test]
async fn blank_membership_numbers_are_skipped_not_fatal() {
    let store = MemoryRosterStore::new();
    let mut records = members(3);
    records.insert(1, json!({"membershipNumber": "   ", "fore1": "Blank"}));

    let summary = pipeline(&store, test_config(500, 20))
        .run_with_text(&request("job-blank"), &bare_array(&records))
        .await
        .unwrap();

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.report.stats.processed, 4);
    assert_eq!(summary.report.stats.created, 3);
    assert_eq!(summary.report.stats.errored, 1);
    assert_eq!(summary.report.failures[0].index, 1);
    assert_eq!(store.count_roster_rows(summary.event_id).await.unwrap(), 3);
}

#[tokio::test]
async fn slightly_corrupted_payload_is_repaired_and_synced() {
    let store = MemoryRosterStore::new();
    let clean = bare_array(&members(40));
    // A handful of stray control characters between tokens.
    let raw = format!("\u{0}{}", clean.replacen("},{", "},\u{0}\u{1}{", 3));

    let summary = pipeline(&store, test_config(500, 20))
        .run_with_text(&request("job-repair"), &raw)
        .await
        .unwrap();

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.stripped_chars, 7);
    assert_eq!(summary.report.stats.created, 40);
}

#[tokio::test]
async fn heavily_corrupted_payload_persists_nothing() {
    let store = MemoryRosterStore::new();
    let raw = format!("[{}]", "\u{FFFD}".repeat(600) + &"{}".repeat(100));

    let err = pipeline(&store, test_config(500, 20))
        .run_with_text(&request("job-corrupt"), &raw)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Corruption(_)));
    assert!(store.events().await.is_empty());
    let progress = store.load_job_progress("job-corrupt").await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::Failed);
    assert_eq!(progress.stage, SyncStage::Validate);
    assert!(progress.message.unwrap().contains("payload rejected"));
}

#[tokio::test]
async fn rejected_payload_is_archived_for_inspection() {
    let store = MemoryRosterStore::new();
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        archive_dir: Some(dir.path().to_path_buf()),
        ..test_config(500, 20)
    };

    let err = pipeline(&store, config)
        .run_with_text(&request("job-archive"), "{\"data\": \"not a list\"}")
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Envelope(_)));
    let progress = store.load_job_progress("job-archive").await.unwrap().unwrap();
    assert_eq!(progress.stage, SyncStage::Normalize);
    let message = progress.message.unwrap();
    assert!(message.contains("payload archived at"));
    assert!(message.contains(&dir.path().display().to_string()));
}

#[tokio::test]
async fn every_envelope_shape_yields_the_same_records() {
    let records = members(3);
    let shapes = [
        ("array", bare_array(&records)),
        ("object.data", json!({"data": records}).to_string()),
        ("object.results", json!({"count": 3, "results": records}).to_string()),
        ("object.items", json!({"meta": {"page": 1}, "items": records}).to_string()),
        ("object.data.records", json!({"data": {"records": records}}).to_string()),
    ];

    for (expected, raw) in shapes {
        let store = MemoryRosterStore::new();
        let summary = pipeline(&store, test_config(500, 20))
            .run_with_text(&request("job-shape"), &raw)
            .await
            .unwrap();
        assert_eq!(summary.envelope, expected);
        assert_eq!(summary.report.stats.created, 3, "shape {expected}");
        assert!(store
            .roster_row(summary.event_id, "200001")
            .await
            .unwrap()
            .is_some());
    }
}

#[tokio::test]
async fn unexpected_root_fails_before_persistence() {
    let store = MemoryRosterStore::new();
    let err = pipeline(&store, test_config(500, 20))
        .run_with_text(&request("job-root"), "{\"status\": \"ok\"}")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Envelope(_)));
    assert!(store.events().await.is_empty());
}

#[tokio::test]
async fn failed_chunk_rolls_back_alone_and_reports_partial() {
    let store = MemoryRosterStore::new();
    store.fail_commit_number(3).await;
    let records = members(10);

    let summary = pipeline(&store, test_config(3, 20))
        .run_with_text(&request("job-partial"), &bare_array(&records))
        .await
        .unwrap();

    assert_eq!(summary.status, JobStatus::Partial);
    let stats = summary.report.stats;
    assert_eq!(stats.processed, 10);
    assert_eq!(stats.created, 7);
    assert_eq!(stats.errored, 3);
    assert_eq!(stats.failed_chunks, 1);
    assert_eq!(stats.committed_chunks, 3);

    let rows = store.roster(summary.event_id).await;
    assert_eq!(rows.len(), 7);
    for missing in ["200006", "200007", "200008"] {
        assert!(rows.iter().all(|r| r.membership_number != missing));
    }

    let progress = store.load_job_progress("job-partial").await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::Partial);
    assert_eq!((progress.created, progress.errored, progress.failed_chunks), (7, 3, 1));
    assert_eq!(store.events().await[0].sync_status, SyncStatus::Partial);

    // Re-running fills the gap without duplicating anything.
    let rerun = pipeline(&store, test_config(3, 20))
        .run_with_text(&request("job-partial-rerun"), &bare_array(&records))
        .await
        .unwrap();
    assert_eq!(rerun.status, JobStatus::Success);
    assert_eq!((rerun.report.stats.created, rerun.report.stats.updated), (3, 7));
    assert_eq!(store.count_roster_rows(summary.event_id).await.unwrap(), 10);
}

#[tokio::test]
async fn exhausted_failure_budget_aborts_the_run() {
    let store = MemoryRosterStore::new();
    store.set_unavailable(true).await;

    let summary = pipeline(&store, test_config(1, 2))
        .run_with_text(&request("job-budget"), &bare_array(&members(10)))
        .await
        .unwrap();

    assert_eq!(summary.status, JobStatus::Failed);
    assert!(summary.report.aborted);
    assert_eq!(summary.report.stats.failed_chunks, 3);
    assert_eq!(summary.report.skipped, 7);

    let progress = store.load_job_progress("job-budget").await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::Failed);
    assert!(progress.message.unwrap().contains("7 records skipped"));
    assert_eq!(store.events().await[0].sync_status, SyncStatus::Failed);
}

#[tokio::test]
async fn fetch_failure_is_recorded_without_touching_events_or_leaking_tokens() {
    let store = MemoryRosterStore::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut req = request("job-fetch");
    req.url = format!("http://{addr}/export?token=SUPERSECRET");
    let err = pipeline(&store, test_config(500, 20)).run(&req).await.unwrap_err();

    match &err {
        SyncError::Fetch(fetch) => assert_eq!(fetch.attempts(), 2),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!err.to_string().contains("SUPERSECRET"));
    assert!(store.events().await.is_empty());
    let progress = store.load_job_progress("job-fetch").await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::Failed);
    assert_eq!(progress.stage, SyncStage::Fetch);
    let message = progress.message.unwrap();
    assert!(message.starts_with("fetch failed"));
    assert!(!message.contains("SUPERSECRET"));
}

#[tokio::test]
async fn fetches_over_http_and_syncs() {
    let body = std::fs::read_to_string(fixture("members_sample.json")).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    let store = MemoryRosterStore::new();
    let mut req = request("job-http");
    req.url = format!("http://{addr}/export?token=abc");
    let summary = pipeline(&store, test_config(2, 20)).run(&req).await.unwrap();

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.report.total_chunks, 3);
    assert_eq!(summary.report.stats.created, 5);
    assert_eq!(store.count_roster_rows(summary.event_id).await.unwrap(), 5);
}

#[tokio::test]
async fn member_linking_sets_member_ids() {
    let store = MemoryRosterStore::new();
    let config = SyncConfig {
        link_members: true,
        ..test_config(500, 20)
    };
    let summary = pipeline(&store, config)
        .run_with_text(&request("job-link"), &bare_array(&members(4)))
        .await
        .unwrap();

    let members = store.members().await;
    assert_eq!(members.len(), 4);
    for row in store.roster(summary.event_id).await {
        let member = members
            .iter()
            .find(|m| m.membership_number == row.membership_number)
            .unwrap();
        assert_eq!(row.member_id, Some(member.id));
    }
}
