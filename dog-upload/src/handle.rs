use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::{DraftId, UploadError};

/// How a pipeline run ended
#[derive(Debug)]
pub enum UploadOutcome {
    /// Revision sealed and active
    Finished,
    /// Stopped on request; the draft keeps its stage and can be resumed
    Cancelled,
    /// Remote is out of space; parked until `release_blocked`
    BlockedNoSpace,
    /// Persisted as `failed`; a later `start_upload` retries what is left
    Failed(UploadError),
}

impl UploadOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::BlockedNoSpace)
    }

    pub fn error(&self) -> Option<&UploadError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Handle to a running pipeline
pub struct UploadHandle {
    draft_id: DraftId,
    cancel: CancellationToken,
    progress: watch::Receiver<f64>,
    join: JoinHandle<UploadOutcome>,
}

impl UploadHandle {
    pub(crate) fn new(
        draft_id: DraftId,
        cancel: CancellationToken,
        progress: watch::Receiver<f64>,
        join: JoinHandle<UploadOutcome>,
    ) -> Self {
        Self {
            draft_id,
            cancel,
            progress,
            join,
        }
    }

    pub fn draft_id(&self) -> &DraftId {
        &self.draft_id
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Aggregated progress in `[0.0, 1.0]`; never decreases
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    pub fn progress_stream(&self) -> WatchStream<f64> {
        WatchStream::new(self.progress.clone())
    }

    pub fn current_progress(&self) -> f64 {
        *self.progress.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end
    pub async fn wait(self) -> UploadOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => UploadOutcome::Failed(UploadError::Internal(format!(
                "pipeline task for {} died: {}",
                self.draft_id, e
            ))),
        }
    }
}
