use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Span};

use crate::{
    Change, ContentEncryptor, DraftWriter, EventSink, ProgressUnit, RemoteUploadService,
    Thumbnail, UploadError, UploadEvent,
};

/// How a best-effort thumbnail transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailOutcome {
    Uploaded,
    /// Failed and recorded as such; the revision carries on without it
    Failed,
    Cancelled,
}

/// Transfers the optional thumbnail. Failures never propagate.
pub struct ThumbnailUploader {
    remote: Arc<dyn RemoteUploadService>,
    encryptor: Arc<dyn ContentEncryptor>,
    writer: DraftWriter,
    events: EventSink,
    span: Span,
}

impl ThumbnailUploader {
    pub fn new(
        remote: Arc<dyn RemoteUploadService>,
        encryptor: Arc<dyn ContentEncryptor>,
        writer: DraftWriter,
        events: EventSink,
        span: Span,
    ) -> Self {
        Self {
            remote,
            encryptor,
            writer,
            events,
            span,
        }
    }

    #[instrument(parent = &self.span, skip_all)]
    pub async fn upload(
        &self,
        thumbnail: Thumbnail,
        unit: ProgressUnit,
        cancel: CancellationToken,
    ) -> ThumbnailOutcome {
        if thumbnail.uploaded {
            unit.complete();
            return ThumbnailOutcome::Uploaded;
        }

        let transfer = async {
            let target = thumbnail
                .target
                .clone()
                .ok_or_else(|| UploadError::invalid_state("thumbnail has no upload target"))?;
            let data = self.encryptor.encrypt_thumbnail(&thumbnail).await?;
            self.remote
                .upload_bytes(&target, data)
                .await
                .map_err(UploadError::from)?;
            self.writer.commit(Change::MarkThumbnailUploaded).await?;
            Ok::<_, UploadError>(())
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                unit.complete();
                return ThumbnailOutcome::Cancelled;
            }
            result = transfer => result,
        };

        // Either way the unit is settled; a failed thumbnail is never retried
        unit.complete();

        match result {
            Ok(()) => {
                debug!("thumbnail uploaded");
                ThumbnailOutcome::Uploaded
            }
            Err(e) => {
                warn!(error = %e, "thumbnail upload failed, continuing without it");
                if let Err(commit_error) = self.writer.commit(Change::MarkThumbnailFailed).await {
                    warn!(error = %commit_error, "could not record thumbnail failure");
                }
                self.events.emit(UploadEvent::ThumbnailFailed {
                    draft_id: self.writer.draft_id().clone(),
                    error: e.to_string(),
                    at: Utc::now(),
                });
                ThumbnailOutcome::Failed
            }
        }
    }
}
