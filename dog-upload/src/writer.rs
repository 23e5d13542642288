//! Single-writer confinement for a draft's record tree.
//!
//! Concurrent block uploaders never touch the store directly. They send
//! change sets to the draft's writer task, which commits them one at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::{ChangeSet, DraftId, DraftRecord, DraftStore, UploadError, UploadResult};

const WRITER_QUEUE_DEPTH: usize = 64;

struct WriteCommand {
    changes: ChangeSet,
    reply: oneshot::Sender<UploadResult<DraftRecord>>,
}

/// Handle to the writer task owning all writes for one draft
#[derive(Clone)]
pub struct DraftWriter {
    draft_id: DraftId,
    tx: mpsc::Sender<WriteCommand>,
}

impl DraftWriter {
    /// Spawn the writer task. It stops once every handle is dropped.
    pub fn spawn(store: Arc<dyn DraftStore>, draft_id: DraftId) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<WriteCommand>(WRITER_QUEUE_DEPTH);
        let span = tracing::debug_span!("draft_writer", draft_id = %draft_id);
        let owned_id = draft_id.clone();

        let join = tokio::spawn(
            async move {
                while let Some(command) = rx.recv().await {
                    let count = command.changes.len();
                    let result = store.commit(&owned_id, command.changes).await;
                    match &result {
                        Ok(_) => debug!(changes = count, "committed"),
                        Err(e) => warn!(changes = count, error = %e, "commit rolled back"),
                    }
                    let _ = command.reply.send(result);
                }
                debug!("writer stopped");
            }
            .instrument(span),
        );

        (Self { draft_id, tx }, join)
    }

    pub fn draft_id(&self) -> &DraftId {
        &self.draft_id
    }

    /// Queue a change set and wait until it is committed or rolled back
    pub async fn commit(&self, changes: impl Into<ChangeSet>) -> UploadResult<DraftRecord> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(WriteCommand {
                changes: changes.into(),
                reply,
            })
            .await
            .map_err(|_| UploadError::Internal(format!("writer for {} is gone", self.draft_id)))?;

        response
            .await
            .map_err(|_| UploadError::Internal(format!("writer for {} dropped a reply", self.draft_id)))?
    }
}
