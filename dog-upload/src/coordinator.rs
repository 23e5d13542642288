use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

use crate::types::now_ts;
use crate::{
    BlockFanout, BlockUploader, BoxStream, Change, ContentCreator, ContentEncryptor, DraftFailure,
    DraftId, DraftRecord, DraftStage, DraftStore, DraftWriter, ErrorClass, EventSink, NewDraft,
    PaginatedRevisionUploader, PlainRevisionUploader, ProgressTracker, ProgressWeights,
    RemoteUploadService,
    RevisionFinalizer, RevisionUploader, ThumbnailUploader, UploadConfig, UploadError,
    UploadEvent, UploadHandle, UploadOutcome, UploadResult,
};

/// Owns drafts and runs their upload pipelines.
///
/// Each `start_upload` spawns one pipeline task which walks the draft
/// through its stages, persisting every transition, until it finishes,
/// fails, gets blocked or is cancelled.
pub struct PipelineCoordinator {
    store: Arc<dyn DraftStore>,
    remote: Arc<dyn RemoteUploadService>,
    encryptor: Arc<dyn ContentEncryptor>,
    config: UploadConfig,
    events: EventSink,
    running: Arc<Mutex<HashSet<DraftId>>>,
}

impl PipelineCoordinator {
    pub fn new<S, R, E>(store: S, remote: R, encryptor: E, config: UploadConfig) -> Self
    where
        S: DraftStore + 'static,
        R: RemoteUploadService + 'static,
        E: ContentEncryptor + 'static,
    {
        Self::from_shared(Arc::new(store), Arc::new(remote), Arc::new(encryptor), config)
    }

    /// Build from collaborators the caller keeps handles to
    pub fn from_shared(
        store: Arc<dyn DraftStore>,
        remote: Arc<dyn RemoteUploadService>,
        encryptor: Arc<dyn ContentEncryptor>,
        config: UploadConfig,
    ) -> Self {
        let events = EventSink::new(config.event_capacity.max(1));
        Self {
            store,
            remote,
            encryptor,
            config,
            events,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DraftStore> {
        &self.store
    }

    /// Track a new file upload; nothing is sent until `start_upload`
    #[instrument(skip_all, fields(node = %request.node.as_str(), blocks = request.blocks.len()))]
    pub async fn create_draft(&self, request: NewDraft) -> UploadResult<DraftId> {
        let record = DraftRecord::new(request);
        let draft_id = record.id().clone();
        self.store.insert(record).await?;
        info!(draft_id = %draft_id, "draft created");
        Ok(draft_id)
    }

    /// Current record tree of a draft
    pub async fn draft(&self, draft_id: &DraftId) -> UploadResult<DraftRecord> {
        self.store.load(draft_id).await
    }

    /// Whether a pipeline is currently running for the draft
    pub fn is_running(&self, draft_id: &DraftId) -> bool {
        self.running.lock().contains(draft_id)
    }

    /// Start (or resume) the pipeline of a draft
    #[instrument(skip(self), fields(draft_id = %draft_id))]
    pub async fn start_upload(&self, draft_id: &DraftId) -> UploadResult<UploadHandle> {
        self.config.validate()?;
        let record = self.store.load(draft_id).await?;

        if record.stage() == DraftStage::BlockedNoSpace {
            return Err(UploadError::Blocked {
                draft_id: draft_id.clone(),
            });
        }

        let guard = RunningGuard::acquire(self.running.clone(), draft_id.clone())?;
        let cancel = CancellationToken::new();
        let progress = self.progress_tree(&record);
        let receiver = progress.root.subscribe();

        let run = PipelineRun {
            draft_id: draft_id.clone(),
            store: self.store.clone(),
            remote: self.remote.clone(),
            encryptor: self.encryptor.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            progress,
            cancel: cancel.clone(),
            span: info_span!("upload_pipeline", draft_id = %draft_id),
        };

        let span = run.span.clone();
        let join = tokio::spawn(
            async move {
                let _guard = guard;
                run.execute().await
            }
            .instrument(span),
        );

        info!(stage = %record.stage(), "pipeline started");
        Ok(UploadHandle::new(draft_id.clone(), cancel, receiver, join))
    }

    /// Start every draft a previous process left mid-pipeline
    pub async fn resume_all(&self) -> UploadResult<Vec<UploadHandle>> {
        let mut handles = Vec::new();
        for draft_id in self.store.list().await? {
            let record = self.store.load(&draft_id).await?;
            if !record.stage().is_active() || self.is_running(&draft_id) {
                continue;
            }
            // Another caller may have started it since the check
            match self.start_upload(&draft_id).await {
                Ok(handle) => handles.push(handle),
                Err(UploadError::AlreadyRunning { .. }) => {
                    debug!(draft_id = %draft_id, "draft already running, skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(handles)
    }

    /// External trigger once remote space was freed: move a blocked draft
    /// back to the stage its records say it should continue from
    #[instrument(skip(self), fields(draft_id = %draft_id))]
    pub async fn release_blocked(&self, draft_id: &DraftId) -> UploadResult<DraftStage> {
        // Holding the running slot keeps a pipeline from starting mid-release
        let _guard = RunningGuard::acquire(self.running.clone(), draft_id.clone())?;
        let record = self.store.load(draft_id).await?;
        if record.stage() != DraftStage::BlockedNoSpace {
            return Err(UploadError::invalid_state(format!(
                "draft {} is {}, not blocked",
                draft_id,
                record.stage()
            )));
        }

        let stage = record.resume_stage();
        let (writer, _writer_task) = DraftWriter::spawn(self.store.clone(), draft_id.clone());
        writer.commit(Change::SetStage { stage, failure: None }).await?;
        info!(stage = %stage, "blocked draft released");
        Ok(stage)
    }

    /// Stream of pipeline events for every draft
    pub fn events(&self) -> BoxStream<UploadEvent> {
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() });
        Box::pin(stream)
    }

    fn progress_tree(&self, record: &DraftRecord) -> StageProgress {
        StageProgress::new(self.config.progress_weights, record)
    }
}

struct StageProgress {
    root: ProgressTracker,
    allocation: ProgressTracker,
    transfer: ProgressTracker,
    sealing: ProgressTracker,
}

impl StageProgress {
    fn new(weights: ProgressWeights, record: &DraftRecord) -> Self {
        let root = ProgressTracker::root(weights.total());
        // An empty file still gets one transfer unit, finished when the
        // upload stage skips straight to sealing
        let transfer_units = if record.is_empty() {
            1
        } else {
            record.blocks.len() as u64 + u64::from(record.thumbnail.is_some())
        };

        Self {
            allocation: root.child(weights.allocation, 1),
            transfer: root.child(weights.transfer, transfer_units),
            sealing: root.child(weights.sealing, 1),
            root,
        }
    }
}

/// Marks a draft as running for as long as it lives
struct RunningGuard {
    running: Arc<Mutex<HashSet<DraftId>>>,
    draft_id: DraftId,
}

impl RunningGuard {
    fn acquire(running: Arc<Mutex<HashSet<DraftId>>>, draft_id: DraftId) -> UploadResult<Self> {
        if !running.lock().insert(draft_id.clone()) {
            return Err(UploadError::AlreadyRunning { draft_id });
        }
        Ok(Self { running, draft_id })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.draft_id);
    }
}

/// One pipeline run of one draft
struct PipelineRun {
    draft_id: DraftId,
    store: Arc<dyn DraftStore>,
    remote: Arc<dyn RemoteUploadService>,
    encryptor: Arc<dyn ContentEncryptor>,
    config: UploadConfig,
    events: EventSink,
    progress: StageProgress,
    cancel: CancellationToken,
    span: Span,
}

impl PipelineRun {
    async fn execute(self) -> UploadOutcome {
        let (writer, _writer_task) = DraftWriter::spawn(self.store.clone(), self.draft_id.clone());
        let outcome = self.drive(&writer).await;
        // Observers waiting for 1.0 must get there whatever happened
        self.progress.root.complete_all();
        outcome
    }

    async fn drive(&self, writer: &DraftWriter) -> UploadOutcome {
        let mut record = match self.store.load(&self.draft_id).await {
            Ok(record) => record,
            Err(e) => return self.fail(writer, e).await,
        };

        // A failed (or freshly restarted) draft picks up where its records say
        if record.stage() == DraftStage::Failed || record.stage().is_active() {
            let stage = record.resume_stage();
            if stage != record.stage() {
                info!(from = %record.stage(), to = %stage, "resuming draft");
                record = match writer.commit(Change::SetStage { stage, failure: None }).await {
                    Ok(record) => record,
                    Err(e) => return self.fail(writer, e).await,
                };
            }
        }

        loop {
            let stage = record.stage();
            if self.cancel.is_cancelled() {
                return self.cancelled(stage);
            }
            if stage.is_active() {
                self.events.emit(UploadEvent::StageStarted {
                    draft_id: self.draft_id.clone(),
                    stage,
                    at: Utc::now(),
                });
            }

            let result = match stage {
                DraftStage::CreatingRevision => {
                    let creator = ContentCreator::new(
                        self.remote.clone(),
                        writer.clone(),
                        self.component_span("content_creator"),
                    );
                    creator.create(&record, &self.cancel).await
                }
                DraftStage::UploadingBlocks => {
                    self.progress.allocation.complete_all();
                    let uploader = self.revision_uploader(&record, writer);
                    uploader
                        .upload(&record, &self.progress.transfer, &self.cancel)
                        .await
                }
                DraftStage::SealingRevision => {
                    self.progress.allocation.complete_all();
                    self.progress.transfer.complete_all();
                    let finalizer = RevisionFinalizer::new(
                        self.remote.clone(),
                        self.encryptor.clone(),
                        writer.clone(),
                        self.config.error_policy.clone(),
                        self.component_span("revision_finalizer"),
                    );
                    finalizer.seal(&record, &self.cancel).await
                }
                DraftStage::Finished => {
                    self.progress.sealing.complete_all();
                    info!("upload finished");
                    self.events.emit(UploadEvent::Finished {
                        draft_id: self.draft_id.clone(),
                        at: Utc::now(),
                    });
                    return UploadOutcome::Finished;
                }
                DraftStage::Failed | DraftStage::BlockedNoSpace => {
                    let e = UploadError::invalid_state(format!(
                        "pipeline cannot run a draft in stage {}",
                        stage
                    ));
                    return self.fail(writer, e).await;
                }
            };

            record = match result {
                Ok(record) => record,
                Err(UploadError::Cancelled) => return self.cancelled(stage),
                Err(e) => return self.fail(writer, e).await,
            };
        }
    }

    fn revision_uploader(
        &self,
        record: &DraftRecord,
        writer: &DraftWriter,
    ) -> Box<dyn RevisionUploader> {
        let policy = self.config.error_policy.clone();
        let blocks = Arc::new(BlockUploader::new(
            self.remote.clone(),
            self.encryptor.clone(),
            writer.clone(),
            self.events.clone(),
            policy.clone(),
            self.component_span("block_uploader"),
        ));
        let thumbnail = Arc::new(ThumbnailUploader::new(
            self.remote.clone(),
            self.encryptor.clone(),
            writer.clone(),
            self.events.clone(),
            self.component_span("thumbnail_uploader"),
        ));
        let fanout = BlockFanout::new(
            blocks,
            thumbnail,
            writer.clone(),
            policy,
            self.config.max_concurrent_blocks,
            self.span.clone(),
        );

        let pending = record.pending_blocks().count();
        match self.config.page_size {
            Some(page_size) if pending > page_size => {
                Box::new(PaginatedRevisionUploader::new(fanout, page_size))
            }
            _ => Box::new(PlainRevisionUploader::new(fanout)),
        }
    }

    fn component_span(&self, component: &'static str) -> Span {
        info_span!(parent: &self.span, "component", component = component, draft_id = %self.draft_id)
    }

    fn cancelled(&self, stage: DraftStage) -> UploadOutcome {
        info!(stage = %stage, "upload cancelled");
        self.events.emit(UploadEvent::Cancelled {
            draft_id: self.draft_id.clone(),
            stage,
            at: Utc::now(),
        });
        UploadOutcome::Cancelled
    }

    /// Classify an unrecovered error and persist the resulting stage
    async fn fail(&self, writer: &DraftWriter, e: UploadError) -> UploadOutcome {
        let class = self.config.error_policy.classify(&e);
        let failure = DraftFailure {
            class,
            message: e.to_string(),
            at: now_ts(),
        };

        let stage = match class {
            ErrorClass::QuotaExceeded => DraftStage::BlockedNoSpace,
            _ => DraftStage::Failed,
        };

        if let Err(commit_error) = writer
            .commit(Change::SetStage {
                stage,
                failure: Some(failure),
            })
            .await
        {
            error!(error = %commit_error, stage = %stage, "could not persist pipeline outcome");
        }

        if class == ErrorClass::QuotaExceeded {
            warn!(error = %e, "remote is out of space, draft blocked");
            self.events.emit(UploadEvent::Blocked {
                draft_id: self.draft_id.clone(),
                error: e.to_string(),
                at: Utc::now(),
            });
            return UploadOutcome::BlockedNoSpace;
        }

        error!(error = %e, class = ?class, "upload failed");
        self.events.emit(UploadEvent::Failed {
            draft_id: self.draft_id.clone(),
            class,
            error: e.to_string(),
            at: Utc::now(),
        });
        UploadOutcome::Failed(e)
    }
}
