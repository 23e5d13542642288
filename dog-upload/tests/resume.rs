mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing_test::traced_test;

use common::{
    new_draft, Harness, MockEncryptor, MockRemote, ALREADY_COMMITTED_CODE, EXPIRED_CODE,
    INVALID_REVISION_CODE, QUOTA_CODE,
};
use dog_upload::{
    BoxStream, Change, ChangeSet, DraftId, DraftRecord, DraftStage, DraftStore, ErrorClass,
    MemoryDraftStore, PipelineCoordinator, RemoteError, RevisionState, RevisionUploadState,
    UploadConfig, UploadError, UploadEvent, UploadResult,
};

async fn wait_for<F>(events: &mut BoxStream<UploadEvent>, mut predicate: F) -> UploadEvent
where
    F: FnMut(&UploadEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.next().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn transient_block_failure_then_retry_uploads_only_the_missing_block() {
    let h = Harness::new(UploadConfig::default());
    h.remote.fail_block_once(2, RemoteError::response(503, "busy"));
    let draft_id = h.coordinator.create_draft(new_draft(3, false)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(matches!(outcome.error(), Some(UploadError::Remote(_))));

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::Failed);
    assert!(record.blocks[0].uploaded);
    assert!(record.blocks[1].uploaded);
    assert!(!record.blocks[2].uploaded);
    assert_eq!(record.draft.last_error.as_ref().map(|f| f.class), Some(ErrorClass::Transient));

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
    assert_eq!(h.remote.transfer_calls(), 4);
    assert_eq!(h.remote.allocation_calls(), 1);
    assert_eq!(h.remote.uploaded_blocks().last(), Some(&2));

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert!(record.draft.last_error.is_none());
}

#[tokio::test]
async fn quota_during_block_upload_blocks_the_draft() {
    let h = Harness::new(UploadConfig::default());
    h.remote.fail_block_once(1, RemoteError::response(QUOTA_CODE, "no space"));
    let mut events = h.coordinator.events();
    let draft_id = h.coordinator.create_draft(new_draft(5, false)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_blocked());
    wait_for(&mut events, |e| matches!(e, UploadEvent::Blocked { .. })).await;

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::BlockedNoSpace);
    assert_eq!(
        record.draft.last_error.as_ref().map(|f| f.class),
        Some(ErrorClass::QuotaExceeded)
    );
    assert_eq!(record.uploaded_block_count(), 4);
    assert!(!record.blocks[1].uploaded);

    let refused = h.coordinator.start_upload(&draft_id).await;
    assert!(matches!(refused, Err(UploadError::Blocked { .. })));

    let stage = h.coordinator.release_blocked(&draft_id).await.unwrap();
    assert_eq!(stage, DraftStage::UploadingBlocks);

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
    assert_eq!(h.remote.transfer_calls(), 6);
}

#[tokio::test]
async fn quota_wins_over_other_block_errors() {
    let h = Harness::new(UploadConfig::default());
    h.remote.fail_block_once(0, RemoteError::Timeout);
    h.remote.fail_block_once(1, RemoteError::response(QUOTA_CODE, "no space"));
    h.remote.fail_block_once(2, RemoteError::response(400, "bad"));
    let draft_id = h.coordinator.create_draft(new_draft(3, false)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_blocked());
}

#[tokio::test]
async fn quota_at_allocation_blocks_without_transfers() {
    let h = Harness::new(UploadConfig::default());
    h.remote
        .fail_next_allocation(RemoteError::response(QUOTA_CODE, "no space"));
    let draft_id = h.coordinator.create_draft(new_draft(2, true)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_blocked());
    assert_eq!(h.remote.transfer_calls(), 0);

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::BlockedNoSpace);
    assert!(record.revision.remote_id.is_none());

    assert_eq!(
        h.coordinator.release_blocked(&draft_id).await.unwrap(),
        DraftStage::CreatingRevision
    );
    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
}

#[tokio::test]
async fn releasing_a_draft_that_is_not_blocked_is_refused() {
    let h = Harness::new(UploadConfig::default());
    let draft_id = h.coordinator.create_draft(new_draft(1, false)).await.unwrap();
    let result = h.coordinator.release_blocked(&draft_id).await;
    assert!(matches!(result, Err(UploadError::InvalidState { .. })));
}

#[tokio::test]
#[traced_test]
async fn expired_target_is_reallocated_on_resume() {
    let h = Harness::new(UploadConfig::default());
    h.remote
        .fail_block_once(1, RemoteError::response(EXPIRED_CODE, "upload url expired"));
    let draft_id = h.coordinator.create_draft(new_draft(3, false)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.error().is_some());
    assert!(logs_contain("upload target expired"));

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::Failed);
    assert!(record.blocks[1].target.is_none());
    assert_eq!(
        record.draft.last_error.as_ref().map(|f| f.class),
        Some(ErrorClass::Transient)
    );

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());

    let requests = h.remote.allocation_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].revision_id.as_deref(), Some("remote-rev-1"));
    assert_eq!(
        requests[1].blocks.iter().map(|b| b.index).collect::<Vec<_>>(),
        vec![1]
    );
}

#[tokio::test]
async fn cancellation_completes_progress_and_keeps_the_stage() {
    let h = Harness::new(UploadConfig::default());
    h.remote.set_upload_delay(Some(Duration::from_secs(30)));
    let mut events = h.coordinator.events();
    let draft_id = h.coordinator.create_draft(new_draft(4, true)).await.unwrap();

    let handle = h.coordinator.start_upload(&draft_id).await.unwrap();
    let progress = handle.progress();
    wait_for(&mut events, |e| {
        matches!(e, UploadEvent::StageStarted { stage: DraftStage::UploadingBlocks, .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    handle.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("cancellation must be prompt");
    assert!(outcome.is_cancelled());
    assert_eq!(*progress.borrow(), 1.0);
    wait_for(&mut events, |e| matches!(e, UploadEvent::Cancelled { .. })).await;

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::UploadingBlocks);
    assert_eq!(record.uploaded_block_count(), 0);
    assert!(record.draft.last_error.is_none());

    h.remote.set_upload_delay(None);
    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
    assert_eq!(h.remote.allocation_calls(), 1);
}

#[tokio::test]
async fn restart_from_exported_store_skips_uploaded_blocks() {
    let h = Harness::new(UploadConfig::default());
    h.remote.delay_block(3, Duration::from_secs(30));
    let mut events = h.coordinator.events();
    let draft_id = h.coordinator.create_draft(new_draft(4, false)).await.unwrap();

    let handle = h.coordinator.start_upload(&draft_id).await.unwrap();
    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, UploadEvent::BlockUploaded { .. })).await;
    }

    // Snapshot as a crashed process would have left it on disk
    let snapshot = h.store.export_json().unwrap();
    handle.cancel();
    handle.wait().await;
    h.remote.clear_block_delays();

    let restored = Arc::new(MemoryDraftStore::import_json(&snapshot).unwrap());
    let restarted = Harness::with_store(restored, h.remote.clone(), UploadConfig::default());

    let record = restarted.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::UploadingBlocks);
    assert_eq!(record.uploaded_block_count(), 3);

    let handles = restarted.coordinator.resume_all().await.unwrap();
    assert_eq!(handles.len(), 1);
    for handle in handles {
        assert!(handle.wait().await.is_finished());
    }

    let mut uploaded = h.remote.uploaded_blocks();
    uploaded.sort_unstable();
    assert_eq!(uploaded, vec![0, 1, 2, 3]);
    assert_eq!(h.remote.allocation_calls(), 1);
}

#[tokio::test]
async fn failed_confirmation_write_is_rolled_back() {
    let h = Harness::new(UploadConfig::default());
    h.store.fail_commits_matching(|_, changes| {
        changes
            .changes
            .iter()
            .any(|c| matches!(c, Change::MarkBlockUploaded { index: 1, .. }))
    });
    let draft_id = h.coordinator.create_draft(new_draft(3, false)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(matches!(outcome.error(), Some(UploadError::Persistence { .. })));

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::Failed);
    assert!(!record.blocks[1].uploaded);
    assert_eq!(
        record.draft.last_error.as_ref().map(|f| f.class),
        Some(ErrorClass::Persistence)
    );

    h.store.clear_faults();
    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
    assert_eq!(h.remote.transfer_calls(), 4);
}

#[tokio::test]
async fn failed_allocation_write_leaves_no_partial_targets() {
    let h = Harness::new(UploadConfig::default());
    h.store.fail_commits_matching(|_, changes| {
        changes
            .changes
            .iter()
            .any(|c| matches!(c, Change::AssignRevision { .. }))
    });
    let draft_id = h.coordinator.create_draft(new_draft(3, true)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(matches!(outcome.error(), Some(UploadError::Persistence { .. })));

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert!(record.revision.remote_id.is_none());
    assert!(record.blocks.iter().all(|b| b.target.is_none()));
    assert!(record.thumbnail.as_ref().is_some_and(|t| t.target.is_none()));
    assert_eq!(record.stage(), DraftStage::Failed);
}

#[tokio::test]
async fn cancelling_a_slow_allocation_keeps_the_stage() {
    let h = Harness::new(UploadConfig::default());
    h.remote.set_allocation_delay(Some(Duration::from_secs(30)));
    let mut events = h.coordinator.events();
    let draft_id = h.coordinator.create_draft(new_draft(3, true)).await.unwrap();

    let handle = h.coordinator.start_upload(&draft_id).await.unwrap();
    let progress = handle.progress();
    wait_for(&mut events, |e| {
        matches!(e, UploadEvent::StageStarted { stage: DraftStage::CreatingRevision, .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.remote.allocation_calls(), 1);

    handle.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("cancellation must be prompt");
    assert!(outcome.is_cancelled());
    assert_eq!(*progress.borrow(), 1.0);

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::CreatingRevision);
    assert!(record.revision.remote_id.is_none());
    assert!(record.draft.last_error.is_none());

    h.remote.set_allocation_delay(None);
    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
    assert_eq!(h.remote.allocation_calls(), 2);
    assert_eq!(h.remote.transfer_calls(), 4);
}

#[tokio::test]
async fn cancelling_a_slow_seal_keeps_the_stage() {
    let h = Harness::new(UploadConfig::default());
    h.remote.set_seal_delay(Some(Duration::from_secs(30)));
    let mut events = h.coordinator.events();
    let draft_id = h.coordinator.create_draft(new_draft(2, false)).await.unwrap();

    let handle = h.coordinator.start_upload(&draft_id).await.unwrap();
    let progress = handle.progress();
    wait_for(&mut events, |e| {
        matches!(e, UploadEvent::StageStarted { stage: DraftStage::SealingRevision, .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.remote.seal_calls(), 1);

    handle.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("cancellation must be prompt");
    assert!(outcome.is_cancelled());
    assert_eq!(*progress.borrow(), 1.0);

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::SealingRevision);
    assert_eq!(record.revision.upload_state, RevisionUploadState::Uploaded);
    assert_ne!(record.revision.state, RevisionState::Active);

    h.remote.set_seal_delay(None);
    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
    assert_eq!(h.remote.transfer_calls(), 2);
    assert_eq!(h.remote.seal_calls(), 2);
}

#[tokio::test]
async fn quota_at_seal_blocks_then_seals_without_transfers() {
    let h = Harness::new(UploadConfig::default());
    h.remote
        .fail_next_seal(RemoteError::response(QUOTA_CODE, "no space"));
    let draft_id = h.coordinator.create_draft(new_draft(2, true)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_blocked());

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::BlockedNoSpace);
    assert_eq!(record.revision.upload_state, RevisionUploadState::Uploaded);
    assert_eq!(
        record.draft.last_error.as_ref().map(|f| f.class),
        Some(ErrorClass::QuotaExceeded)
    );

    assert_eq!(
        h.coordinator.release_blocked(&draft_id).await.unwrap(),
        DraftStage::SealingRevision
    );
    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
    assert_eq!(h.remote.transfer_calls(), 3);
    assert_eq!(h.remote.seal_calls(), 2);
}

#[tokio::test]
#[traced_test]
async fn seal_retried_after_a_lost_local_write_finishes() {
    let h = Harness::new(UploadConfig::default());
    h.store.fail_commits_matching(|_, changes| {
        changes
            .changes
            .iter()
            .any(|c| matches!(c, Change::SealRevision { .. }))
    });
    let draft_id = h.coordinator.create_draft(new_draft(2, false)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(matches!(outcome.error(), Some(UploadError::Persistence { .. })));
    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::Failed);
    assert_ne!(record.revision.state, RevisionState::Active);

    // The remote already holds the seal and answers the retry accordingly
    h.store.clear_faults();
    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished(), "unexpected outcome: {outcome:?}");
    assert_eq!(h.remote.seal_calls(), 2);
    assert_eq!(h.remote.transfer_calls(), 2);
    assert!(logs_contain("revision already sealed remotely"));
    assert!(logs_contain(&ALREADY_COMMITTED_CODE.to_string()));

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::Finished);
    assert_eq!(record.revision.state, RevisionState::Active);
    assert!(record.revision.manifest_signature.is_some());
    assert!(record.draft.last_error.is_none());
}

#[tokio::test]
async fn rejected_revision_is_marked_pending_and_sealed_on_retry() {
    let h = Harness::new(UploadConfig::default());
    h.remote
        .fail_next_seal(RemoteError::response(INVALID_REVISION_CODE, "invalid revision"));
    let draft_id = h.coordinator.create_draft(new_draft(3, false)).await.unwrap();

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(matches!(outcome.error(), Some(UploadError::Remote(_))));

    let record = h.coordinator.draft(&draft_id).await.unwrap();
    assert_eq!(record.stage(), DraftStage::Failed);
    assert_eq!(record.revision.upload_state, RevisionUploadState::Pending);
    assert!(record.all_blocks_uploaded());
    assert_eq!(
        record.draft.last_error.as_ref().map(|f| f.class),
        Some(ErrorClass::Transient)
    );
    assert_eq!(record.resume_stage(), DraftStage::UploadingBlocks);

    let outcome = h.coordinator.start_upload(&draft_id).await.unwrap().wait().await;
    assert!(outcome.is_finished());
    assert_eq!(h.remote.allocation_calls(), 1);
    assert_eq!(h.remote.transfer_calls(), 3);
    assert_eq!(h.remote.seal_calls(), 2);
}

#[tokio::test]
async fn release_is_refused_while_a_pipeline_owns_the_draft() {
    let h = Harness::new(UploadConfig::default());
    h.remote.set_upload_delay(Some(Duration::from_secs(30)));
    let draft_id = h.coordinator.create_draft(new_draft(2, false)).await.unwrap();

    let handle = h.coordinator.start_upload(&draft_id).await.unwrap();
    let result = h.coordinator.release_blocked(&draft_id).await;
    assert!(matches!(result, Err(UploadError::AlreadyRunning { .. })));

    handle.cancel();
    assert!(handle.wait().await.is_cancelled());
    // a refused release leaves the draft free to start again
    assert!(!h.coordinator.is_running(&draft_id));
    let result = h.coordinator.release_blocked(&draft_id).await;
    assert!(matches!(result, Err(UploadError::InvalidState { .. })));
}

/// Store whose loads yield once, so concurrent callers interleave
struct YieldingStore(MemoryDraftStore);

#[async_trait]
impl DraftStore for YieldingStore {
    async fn insert(&self, record: DraftRecord) -> UploadResult<()> {
        self.0.insert(record).await
    }

    async fn load(&self, draft_id: &DraftId) -> UploadResult<DraftRecord> {
        tokio::task::yield_now().await;
        self.0.load(draft_id).await
    }

    async fn commit(&self, draft_id: &DraftId, changes: ChangeSet) -> UploadResult<DraftRecord> {
        self.0.commit(draft_id, changes).await
    }

    async fn remove(&self, draft_id: &DraftId) -> UploadResult<()> {
        self.0.remove(draft_id).await
    }

    async fn list(&self) -> UploadResult<Vec<DraftId>> {
        self.0.list().await
    }
}

#[tokio::test]
async fn concurrent_resumes_skip_drafts_the_other_started() {
    let remote = MockRemote::new();
    let coordinator = PipelineCoordinator::from_shared(
        Arc::new(YieldingStore(MemoryDraftStore::new())),
        remote.clone(),
        Arc::new(MockEncryptor),
        UploadConfig::default(),
    );
    let draft_id = coordinator.create_draft(new_draft(2, false)).await.unwrap();

    let (first, second) = tokio::join!(coordinator.resume_all(), coordinator.resume_all());
    let handles: Vec<_> = first
        .expect("first resume")
        .into_iter()
        .chain(second.expect("second resume"))
        .collect();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].draft_id(), &draft_id);

    for handle in handles {
        assert!(handle.wait().await.is_finished());
    }
    assert_eq!(remote.allocation_calls(), 1);
}
