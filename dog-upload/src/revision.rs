//! Revision-level block fan-out.
//!
//! Two strategies share one contract: every pending block is transferred
//! with at most `max_concurrent_blocks` in flight, already uploaded content
//! is credited to progress up front, and the revision is only marked
//! uploaded once every block is confirmed.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, Span};

use crate::{
    Block, BlockUploader, Change, ChangeSet, DraftRecord, DraftStage, DraftWriter, ErrorPolicy,
    ProgressTracker, Thumbnail, ThumbnailOutcome, ThumbnailUploader, UploadError, UploadResult,
};

/// Drives all block transfers of one revision
#[async_trait]
pub trait RevisionUploader: Send + Sync {
    /// Upload every pending block (and the thumbnail, best-effort).
    ///
    /// `progress` tracks one unit per block plus one for the thumbnail.
    /// On success the revision is marked uploaded and the draft moved to
    /// `sealing_revision`.
    async fn upload(
        &self,
        record: &DraftRecord,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> UploadResult<DraftRecord>;
}

/// Shared machinery of both strategies
pub struct BlockFanout {
    blocks: Arc<BlockUploader>,
    thumbnail: Arc<ThumbnailUploader>,
    writer: DraftWriter,
    policy: ErrorPolicy,
    max_concurrent: usize,
    span: Span,
}

impl BlockFanout {
    pub fn new(
        blocks: Arc<BlockUploader>,
        thumbnail: Arc<ThumbnailUploader>,
        writer: DraftWriter,
        policy: ErrorPolicy,
        max_concurrent: usize,
        span: Span,
    ) -> Self {
        Self {
            blocks,
            thumbnail,
            writer,
            policy,
            max_concurrent: max_concurrent.max(1),
            span,
        }
    }

    /// Pending blocks in index order, after checking each has a target
    fn pending(record: &DraftRecord) -> UploadResult<Vec<Block>> {
        record
            .pending_blocks()
            .map(|block| match block.target {
                Some(_) => Ok(block.clone()),
                None => Err(UploadError::invalid_state(format!(
                    "block {} reached transfer without a target",
                    block.index
                ))),
            })
            .collect()
    }

    /// Credit content that needs no transfer in this run
    fn credit_settled(record: &DraftRecord, progress: &ProgressTracker) -> u64 {
        let thumbnail_settled = record
            .thumbnail
            .as_ref()
            .is_some_and(|_| record.pending_thumbnail().is_none());
        let settled = record.uploaded_block_count() as u64 + u64::from(thumbnail_settled);
        progress.complete_units(settled);
        settled
    }

    /// Transfer one page: its blocks with bounded concurrency and,
    /// alongside, the thumbnail if it rides with this page.
    async fn run_page(
        &self,
        page: Vec<Block>,
        thumbnail: Option<Thumbnail>,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        let thumbnail_task = async {
            match thumbnail {
                Some(thumbnail) => Some(
                    self.thumbnail
                        .upload(thumbnail, progress.unit(), cancel.clone())
                        .await,
                ),
                None => None,
            }
        };

        let block_tasks = stream::iter(page.into_iter().map(|block| {
            let unit = progress.unit();
            let uploader = self.blocks.clone();
            let cancel = cancel.clone();
            async move { uploader.upload(block, unit, cancel).await }
        }))
        .buffer_unordered(self.max_concurrent)
        .collect::<Vec<_>>();

        let (thumbnail_outcome, results) = tokio::join!(thumbnail_task, block_tasks);

        if cancel.is_cancelled() || thumbnail_outcome == Some(ThumbnailOutcome::Cancelled) {
            return Err(UploadError::Cancelled);
        }

        let mut errors: Vec<UploadError> = results
            .into_iter()
            .filter_map(Result::err)
            .filter(|e| !e.is_cancelled())
            .collect();

        if errors.is_empty() {
            return Ok(());
        }

        debug!(failed = errors.len(), "page finished with failures");
        // A full remote wins over whatever else went wrong alongside it
        let quota = errors
            .iter()
            .position(|e| e.remote().is_some_and(|r| self.policy.is_quota_exceeded(r)));
        Err(errors.swap_remove(quota.unwrap_or(0)))
    }

    async fn mark_uploaded(&self) -> UploadResult<DraftRecord> {
        self.writer
            .commit(ChangeSet::single(Change::MarkRevisionUploaded).with(Change::SetStage {
                stage: DraftStage::SealingRevision,
                failure: None,
            }))
            .await
    }
}

/// Uploads every pending block as one batch
pub struct PlainRevisionUploader {
    fanout: BlockFanout,
}

impl PlainRevisionUploader {
    pub fn new(fanout: BlockFanout) -> Self {
        Self { fanout }
    }
}

#[async_trait]
impl RevisionUploader for PlainRevisionUploader {
    #[instrument(parent = &self.fanout.span, name = "revision_uploader", skip_all)]
    async fn upload(
        &self,
        record: &DraftRecord,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> UploadResult<DraftRecord> {
        if record.is_empty() {
            debug!("empty file, nothing to transfer");
            progress.complete_all();
            return self.fanout.mark_uploaded().await;
        }

        let pending = BlockFanout::pending(record)?;
        let settled = BlockFanout::credit_settled(record, progress);
        info!(pending = pending.len(), settled, "uploading revision blocks");

        self.fanout
            .run_page(pending, record.pending_thumbnail().cloned(), progress, cancel)
            .await?;

        self.fanout.mark_uploaded().await
    }
}

/// Uploads pending blocks in sequential pages; the thumbnail rides with
/// the first page. A failed page stops the remaining ones.
pub struct PaginatedRevisionUploader {
    fanout: BlockFanout,
    page_size: usize,
}

impl PaginatedRevisionUploader {
    pub fn new(fanout: BlockFanout, page_size: usize) -> Self {
        Self {
            fanout,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl RevisionUploader for PaginatedRevisionUploader {
    #[instrument(parent = &self.fanout.span, name = "paginated_revision_uploader", skip_all)]
    async fn upload(
        &self,
        record: &DraftRecord,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> UploadResult<DraftRecord> {
        if record.is_empty() {
            debug!("empty file, nothing to transfer");
            progress.complete_all();
            return self.fanout.mark_uploaded().await;
        }

        let pending = BlockFanout::pending(record)?;
        let settled = BlockFanout::credit_settled(record, progress);
        let pages: Vec<Vec<Block>> = pending
            .chunks(self.page_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        info!(
            pending = pending.len(),
            settled,
            pages = pages.len(),
            "uploading revision blocks in pages"
        );

        let mut thumbnail = record.pending_thumbnail().cloned();
        if pages.is_empty() {
            // Only the thumbnail is left
            self.fanout
                .run_page(Vec::new(), thumbnail.take(), progress, cancel)
                .await?;
        }

        for (number, page) in pages.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            debug!(page = number + 1, blocks = page.len(), "starting page");
            self.fanout
                .run_page(page, thumbnail.take(), progress, cancel)
                .await?;
        }

        self.fanout.mark_uploaded().await
    }
}
