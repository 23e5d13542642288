use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use crate::remote::SealRequest;
use crate::types::now_ts;
use crate::{
    Change, ChangeSet, ContentEncryptor, ContentHash, DraftRecord, DraftStage, DraftWriter,
    ErrorPolicy, RemoteUploadService, RevisionState, RevisionUploadState, UploadError,
    UploadResult,
};

/// Seals an uploaded revision and finishes the draft
pub struct RevisionFinalizer {
    remote: Arc<dyn RemoteUploadService>,
    encryptor: Arc<dyn ContentEncryptor>,
    writer: DraftWriter,
    policy: ErrorPolicy,
    span: Span,
}

impl RevisionFinalizer {
    pub fn new(
        remote: Arc<dyn RemoteUploadService>,
        encryptor: Arc<dyn ContentEncryptor>,
        writer: DraftWriter,
        policy: ErrorPolicy,
        span: Span,
    ) -> Self {
        Self {
            remote,
            encryptor,
            writer,
            policy,
            span,
        }
    }

    /// Sign the manifest, seal remotely and mark the revision active.
    ///
    /// Refuses to run unless every block is confirmed and the revision is
    /// marked uploaded. Empty files are sealed locally.
    ///
    /// A seal the remote reports as already committed (an earlier attempt
    /// whose local write was lost) is finished locally. A revision the
    /// remote rejects goes back to pending upload before the error is
    /// returned.
    #[instrument(parent = &self.span, skip_all, fields(revision = %record.revision.id))]
    pub async fn seal(
        &self,
        record: &DraftRecord,
        cancel: &CancellationToken,
    ) -> UploadResult<DraftRecord> {
        let finish = Change::SetStage {
            stage: DraftStage::Finished,
            failure: None,
        };

        if record.revision.state == RevisionState::Active {
            debug!("revision already sealed");
            return self.writer.commit(finish).await;
        }

        if record.revision.upload_state != RevisionUploadState::Uploaded
            || !record.all_blocks_uploaded()
        {
            return Err(UploadError::invalid_state(format!(
                "revision {} has unconfirmed blocks and cannot be sealed",
                record.revision.id
            )));
        }

        // Index order regardless of the order transfers completed in
        let mut blocks: Vec<_> = record.blocks.iter().collect();
        blocks.sort_by_key(|b| b.index);
        let hashes: Vec<ContentHash> = blocks.iter().map(|b| b.hash.clone()).collect();
        let manifest_signature = self.encryptor.sign_manifest(&hashes).await?;

        match &record.revision.remote_id {
            None if record.is_empty() => debug!("empty file, sealing locally"),
            None => {
                return Err(UploadError::invalid_state(format!(
                    "revision {} was never allocated",
                    record.revision.id
                )));
            }
            Some(remote_id) => {
                let block_tokens = blocks
                    .iter()
                    .map(|b| {
                        b.target.as_ref().map(|t| t.token.clone()).ok_or_else(|| {
                            UploadError::invalid_state(format!(
                                "uploaded block {} lost its target",
                                b.index
                            ))
                        })
                    })
                    .collect::<UploadResult<Vec<_>>>()?;

                info!(blocks = block_tokens.len(), "sealing revision");
                let request = SealRequest {
                    revision_id: remote_id.clone(),
                    manifest_signature: manifest_signature.clone(),
                    block_tokens,
                };
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    result = self.remote.seal_revision(request) => result,
                };
                match result {
                    Ok(()) => {}
                    Err(e) if self.policy.is_already_committed(&e) => {
                        warn!(error = %e, "revision already sealed remotely, finishing locally");
                    }
                    Err(e) if self.policy.is_invalid_revision(&e) => {
                        warn!(error = %e, "remote rejected the revision, rolling back upload state");
                        self.writer.commit(Change::RollbackRevisionUpload).await?;
                        return Err(e.into());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.writer
            .commit(
                ChangeSet::single(Change::SealRevision {
                    manifest_signature,
                    at: now_ts(),
                })
                .with(finish),
            )
            .await
    }
}
