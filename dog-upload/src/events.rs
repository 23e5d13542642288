use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::{DraftId, DraftStage, ErrorClass};

/// Type alias for boxed streams
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Structured pipeline events, in the order they happen for one draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UploadEvent {
    StageStarted {
        draft_id: DraftId,
        stage: DraftStage,
        at: DateTime<Utc>,
    },

    BlockUploaded {
        draft_id: DraftId,
        index: u32,
        at: DateTime<Utc>,
    },

    /// Best-effort thumbnail failed; the revision carries on
    ThumbnailFailed {
        draft_id: DraftId,
        error: String,
        at: DateTime<Utc>,
    },

    Finished {
        draft_id: DraftId,
        at: DateTime<Utc>,
    },

    Cancelled {
        draft_id: DraftId,
        stage: DraftStage,
        at: DateTime<Utc>,
    },

    /// Parked in `blocked_no_space`
    Blocked {
        draft_id: DraftId,
        error: String,
        at: DateTime<Utc>,
    },

    Failed {
        draft_id: DraftId,
        class: ErrorClass,
        error: String,
        at: DateTime<Utc>,
    },
}

impl UploadEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stage_started",
            Self::BlockUploaded { .. } => "block_uploaded",
            Self::ThumbnailFailed { .. } => "thumbnail_failed",
            Self::Finished { .. } => "finished",
            Self::Cancelled { .. } => "cancelled",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
        }
    }

    /// Get the draft ID from any event
    pub fn draft_id(&self) -> &DraftId {
        match self {
            Self::StageStarted { draft_id, .. }
            | Self::BlockUploaded { draft_id, .. }
            | Self::ThumbnailFailed { draft_id, .. }
            | Self::Finished { draft_id, .. }
            | Self::Cancelled { draft_id, .. }
            | Self::Blocked { draft_id, .. }
            | Self::Failed { draft_id, .. } => draft_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::StageStarted { at, .. }
            | Self::BlockUploaded { at, .. }
            | Self::ThumbnailFailed { at, .. }
            | Self::Finished { at, .. }
            | Self::Cancelled { at, .. }
            | Self::Blocked { at, .. }
            | Self::Failed { at, .. } => at,
        }
    }

    /// Whether this event ends a pipeline run
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Cancelled { .. } | Self::Blocked { .. } | Self::Failed { .. }
        )
    }
}

/// Cheap clonable sender side of the event channel
#[derive(Clone)]
pub struct EventSink {
    tx: tokio::sync::broadcast::Sender<UploadEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event; having no subscribers is fine
    pub fn emit(&self, event: UploadEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }
}
