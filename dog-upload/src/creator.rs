use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, Span};

use crate::remote::{AllocationRequest, BlockDescriptor};
use crate::types::now_ts;
use crate::{
    Allocation, Change, ChangeSet, DraftRecord, DraftStage, DraftWriter, RemoteUploadService,
    UploadError, UploadResult,
};

/// Allocates the remote revision and upload targets for pending content
pub struct ContentCreator {
    remote: Arc<dyn RemoteUploadService>,
    writer: DraftWriter,
    span: Span,
}

impl ContentCreator {
    pub fn new(remote: Arc<dyn RemoteUploadService>, writer: DraftWriter, span: Span) -> Self {
        Self {
            remote,
            writer,
            span,
        }
    }

    /// Request targets for every pending block (and thumbnail) that has none,
    /// persist them and advance the draft to `uploading_blocks`.
    ///
    /// An empty file, or a revision whose pending content already has
    /// targets, needs no remote call.
    #[instrument(parent = &self.span, skip_all, fields(revision = %record.revision.id))]
    pub async fn create(
        &self,
        record: &DraftRecord,
        cancel: &CancellationToken,
    ) -> UploadResult<DraftRecord> {
        let request = self.allocation_request(record);
        let mut changes = ChangeSet::new();

        match request {
            None => debug!("nothing to allocate"),
            Some(request) => {
                info!(
                    blocks = request.blocks.len(),
                    thumbnail = request.thumbnail,
                    existing = request.revision_id.is_some(),
                    "allocating revision content"
                );

                let allocation = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    result = self.remote.allocate_revision(request.clone()) => result?,
                };

                changes = Self::allocation_changes(&request, allocation)?;
            }
        }

        changes.push(Change::SetStage {
            stage: DraftStage::UploadingBlocks,
            failure: None,
        });
        self.writer.commit(changes).await
    }

    fn allocation_request(&self, record: &DraftRecord) -> Option<AllocationRequest> {
        if record.is_empty() {
            return None;
        }

        let blocks: Vec<BlockDescriptor> = record
            .blocks_needing_target()
            .map(|b| BlockDescriptor {
                index: b.index,
                hash: b.hash.clone(),
                size: b.size,
            })
            .collect();
        let thumbnail = record.thumbnail_needs_target();

        if blocks.is_empty() && !thumbnail && record.revision.remote_id.is_some() {
            return None;
        }

        Some(AllocationRequest {
            revision_id: record.revision.remote_id.clone(),
            blocks,
            thumbnail,
        })
    }

    /// Check the response against the request and turn it into changes
    fn allocation_changes(
        request: &AllocationRequest,
        allocation: Allocation,
    ) -> UploadResult<ChangeSet> {
        if let Some(existing) = &request.revision_id {
            if existing != &allocation.revision_id {
                return Err(UploadError::invalid_response(format!(
                    "asked to top up revision {} but got {}",
                    existing, allocation.revision_id
                )));
            }
        }

        let mut targets = BTreeMap::new();
        for block_target in allocation.block_targets {
            if targets.insert(block_target.index, block_target.target).is_some() {
                return Err(UploadError::invalid_response(format!(
                    "duplicate target for block {}",
                    block_target.index
                )));
            }
        }
        if targets.len() != request.blocks.len()
            || request.blocks.iter().any(|b| !targets.contains_key(&b.index))
        {
            return Err(UploadError::invalid_response(format!(
                "requested targets for {} block(s), received {}",
                request.blocks.len(),
                targets.len()
            )));
        }

        let mut changes = ChangeSet::single(Change::AssignRevision {
            remote_id: allocation.revision_id,
            created_at: now_ts(),
        });
        for (index, target) in targets {
            changes.push(Change::SetBlockTarget { index, target });
        }

        match (request.thumbnail, allocation.thumbnail_target) {
            (true, Some(target)) => changes.push(Change::SetThumbnailTarget { target }),
            (true, None) => {
                return Err(UploadError::invalid_response("missing thumbnail target"));
            }
            (false, _) => {}
        }

        Ok(changes)
    }
}
