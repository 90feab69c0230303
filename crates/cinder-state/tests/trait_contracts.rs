//! Trait contract tests for RunLedger.
//!
//! Every contract runs against both the in-memory fake and the filesystem
//! ledger. Any conforming implementation must pass these.

use chrono::Utc;
use cinder_state::storage_traits::*;
use cinder_state::{FsRunLedger, MemoryRunLedger, StorageError};

fn sample_metadata() -> RunMetadata {
    RunMetadata {
        revision: Some("abc123".to_string()),
        pipeline: "ci".to_string(),
        tags: serde_json::json!({"env": "test"}),
    }
}

fn sample_event(seq: u64, kind: &str) -> RunEvent {
    RunEvent {
        seq,
        kind: kind.to_string(),
        payload: serde_json::json!({"detail": kind}),
        timestamp: Utc::now(),
    }
}

fn sample_summary(total_events: u64, success: bool) -> RunSummary {
    RunSummary {
        total_events,
        duration_ms: 100,
        success,
        failed_stage: if success {
            None
        } else {
            Some("run_tests".to_string())
        },
    }
}

/// Runs a contract body against a fresh instance of each backend.
macro_rules! ledger_contract {
    ($name:ident, |$ledger:ident| $body:block) => {
        mod $name {
            use super::*;

            #[tokio::test]
            async fn memory() {
                let $ledger = MemoryRunLedger::new();
                $body
            }

            #[tokio::test]
            async fn filesystem() {
                let dir = tempfile::tempdir().unwrap();
                let $ledger = FsRunLedger::open(dir.path()).unwrap();
                $body
            }
        }
    };
}

ledger_contract!(create_run_returns_unique_ids, |ledger| {
    let spec = ContentDigest::from_bytes(b"spec");

    let id1 = ledger.create_run(&spec, sample_metadata()).await.unwrap();
    let id2 = ledger.create_run(&spec, sample_metadata()).await.unwrap();

    assert_ne!(id1, id2);
});

ledger_contract!(get_run_returns_created_run, |ledger| {
    let spec = ContentDigest::from_bytes(b"spec");
    let run_id = ledger.create_run(&spec, sample_metadata()).await.unwrap();

    let record = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.run_id, run_id);
    assert_eq!(record.spec_digest, spec);
    assert_eq!(record.status, RunStatus::Running);
    assert!(record.summary.is_none());
});

ledger_contract!(get_run_not_found, |ledger| {
    let bogus = RunId("nonexistent".to_string());
    let err = ledger.get_run(&bogus).await.unwrap_err();

    assert!(matches!(err, StorageError::RunNotFound { .. }));
});

ledger_contract!(append_and_get_events_ordered, |ledger| {
    let spec = ContentDigest::from_bytes(b"spec");
    let run_id = ledger.create_run(&spec, sample_metadata()).await.unwrap();

    // Append out of order
    ledger
        .append_event(&run_id, sample_event(2, "stage_passed"))
        .await
        .unwrap();
    ledger
        .append_event(&run_id, sample_event(1, "stage_started"))
        .await
        .unwrap();
    ledger
        .append_event(&run_id, sample_event(3, "stage_started"))
        .await
        .unwrap();

    let events = ledger.get_events(&run_id).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[1].seq, 2);
    assert_eq!(events[2].seq, 3);
});

ledger_contract!(complete_run_sets_status, |ledger| {
    let spec = ContentDigest::from_bytes(b"spec");
    let run_id = ledger.create_run(&spec, sample_metadata()).await.unwrap();

    ledger
        .complete_run(&run_id, sample_summary(0, true))
        .await
        .unwrap();

    let record = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.summary.is_some());
    assert!(record.completed_at.is_some());
});

ledger_contract!(fail_run_records_failed_stage, |ledger| {
    let spec = ContentDigest::from_bytes(b"spec");
    let run_id = ledger.create_run(&spec, sample_metadata()).await.unwrap();

    ledger
        .fail_run(&run_id, sample_summary(4, false))
        .await
        .unwrap();

    let record = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(
        record.summary.unwrap().failed_stage.as_deref(),
        Some("run_tests")
    );
});

ledger_contract!(cannot_append_to_completed_run, |ledger| {
    let spec = ContentDigest::from_bytes(b"spec");
    let run_id = ledger.create_run(&spec, sample_metadata()).await.unwrap();
    ledger
        .complete_run(&run_id, sample_summary(0, true))
        .await
        .unwrap();

    let err = ledger
        .append_event(&run_id, sample_event(1, "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
});

ledger_contract!(cannot_close_twice, |ledger| {
    let spec = ContentDigest::from_bytes(b"spec");
    let run_id = ledger.create_run(&spec, sample_metadata()).await.unwrap();
    ledger
        .complete_run(&run_id, sample_summary(0, true))
        .await
        .unwrap();

    let err = ledger
        .fail_run(&run_id, sample_summary(0, false))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
});

ledger_contract!(list_runs_filtered_by_spec, |ledger| {
    let spec_a = ContentDigest::from_bytes(b"spec-a");
    let spec_b = ContentDigest::from_bytes(b"spec-b");

    ledger.create_run(&spec_a, sample_metadata()).await.unwrap();
    ledger.create_run(&spec_a, sample_metadata()).await.unwrap();
    ledger.create_run(&spec_b, sample_metadata()).await.unwrap();

    let all = ledger.list_runs(None).await.unwrap();
    assert_eq!(all.len(), 3);

    let filtered = ledger.list_runs(Some(&spec_a)).await.unwrap();
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|r| r.spec_digest == spec_a));
});
