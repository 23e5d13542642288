use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Span};

use crate::types::now_ts;
use crate::{
    Block, Change, ContentEncryptor, DraftWriter, ErrorPolicy, EventSink, ProgressUnit,
    RemoteUploadService, UploadError, UploadEvent, UploadResult,
};

/// Transfers one block and records its confirmation.
///
/// The progress unit handed in is always completed once the block is either
/// confirmed or abandoned because of cancellation. Errors leave it open.
pub struct BlockUploader {
    remote: Arc<dyn RemoteUploadService>,
    encryptor: Arc<dyn ContentEncryptor>,
    writer: DraftWriter,
    events: EventSink,
    policy: ErrorPolicy,
    span: Span,
}

impl BlockUploader {
    pub fn new(
        remote: Arc<dyn RemoteUploadService>,
        encryptor: Arc<dyn ContentEncryptor>,
        writer: DraftWriter,
        events: EventSink,
        policy: ErrorPolicy,
        span: Span,
    ) -> Self {
        Self {
            remote,
            encryptor,
            writer,
            events,
            policy,
            span,
        }
    }

    #[instrument(parent = &self.span, skip_all, fields(index = block.index))]
    pub async fn upload(
        &self,
        block: Block,
        unit: ProgressUnit,
        cancel: CancellationToken,
    ) -> UploadResult<()> {
        if block.uploaded {
            unit.complete();
            return Ok(());
        }

        let target = block.target.clone().ok_or_else(|| {
            UploadError::invalid_state(format!("block {} has no upload target", block.index))
        })?;

        let transfer = async {
            let data = self.encryptor.encrypt_block(&block).await?;
            debug!(bytes = data.len(), "transferring block");
            self.remote
                .upload_bytes(&target, data)
                .await
                .map_err(UploadError::from)
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("block abandoned on cancellation");
                unit.complete();
                return Err(UploadError::Cancelled);
            }
            result = transfer => result,
        };

        match result {
            Ok(()) => {
                self.writer
                    .commit(Change::MarkBlockUploaded {
                        index: block.index,
                        at: now_ts(),
                    })
                    .await?;
                unit.complete();
                self.events.emit(UploadEvent::BlockUploaded {
                    draft_id: self.writer.draft_id().clone(),
                    index: block.index,
                    at: Utc::now(),
                });
                debug!("block uploaded");
                Ok(())
            }
            Err(UploadError::Remote(remote)) if self.policy.is_expired_target(&remote) => {
                warn!(error = %remote, "upload target expired");
                // A resume will ask for a fresh target
                if let Err(e) = self
                    .writer
                    .commit(Change::ClearBlockTarget { index: block.index })
                    .await
                {
                    warn!(error = %e, "could not drop expired target");
                }
                Err(UploadError::Remote(remote))
            }
            Err(e) => {
                warn!(error = %e, "block upload failed");
                Err(e)
            }
        }
    }
}
