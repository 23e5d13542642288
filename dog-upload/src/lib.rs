//! # dog-upload: Resumable revision upload pipeline
//!
//! `dog-upload` moves a locally prepared file revision (an ordered set of
//! encrypted blocks plus an optional thumbnail) to a remote storage service
//! and survives crashes, cancellation and partial failure on the way.
//!
//! ## Key Features
//!
//! - **Resumable**: every stage transition is persisted; a restarted process continues from the last committed stage
//! - **Idempotent resume**: confirmed blocks are never sent twice
//! - **Bounded fan-out**: concurrent block transfers capped per draft, optionally in sequential pages
//! - **Transactional records**: change sets commit atomically through a single writer per draft
//! - **Aggregated progress**: a weighted progress tree that always reaches 1.0
//! - **Classified failures**: quota errors park a draft, everything else fails it verbatim
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dog_upload::prelude::*;
//!
//! # async fn run(remote: impl RemoteUploadService + 'static, crypto: impl ContentEncryptor + 'static) -> UploadResult<()> {
//! let coordinator = PipelineCoordinator::new(
//!     MemoryDraftStore::new(),
//!     remote,
//!     crypto,
//!     UploadConfig::default().with_max_concurrent_blocks(8),
//! );
//!
//! let draft_id = coordinator
//!     .create_draft(
//!         NewDraft::new(NodeRef::new("file-42"))
//!             .with_block(ContentHash::new(b"h0".to_vec()), 4 * 1024 * 1024)
//!             .with_block(ContentHash::new(b"h1".to_vec()), 1024),
//!     )
//!     .await?;
//!
//! let handle = coordinator.start_upload(&draft_id).await?;
//! match handle.wait().await {
//!     UploadOutcome::Finished => println!("sealed"),
//!     UploadOutcome::BlockedNoSpace => println!("free some space, then release_blocked"),
//!     UploadOutcome::Cancelled => println!("resume later"),
//!     UploadOutcome::Failed(e) => println!("failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ PipelineCoordinator  │  ← stage machine, classification, progress root
//! ├──────────────────────┤
//! │ ContentCreator       │  ← revision + target allocation
//! │ RevisionUploader     │  ← bounded block fan-out (+ thumbnail)
//! │ RevisionFinalizer    │  ← manifest signature + seal
//! ├──────────────────────┤
//! │ DraftWriter          │  ← one writer per draft
//! │ DraftStore           │  ← transactional record tables
//! └──────────────────────┘
//! ```

pub mod block;
pub mod config;
pub mod coordinator;
pub mod creator;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod handle;
pub mod progress;
pub mod record;
pub mod remote;
pub mod revision;
pub mod store;
pub mod thumbnail;
pub mod types;
pub mod writer;

#[cfg(feature = "tracing-basic")]
pub mod telemetry;

pub use block::BlockUploader;
pub use config::{ProgressWeights, UploadConfig};
pub use coordinator::PipelineCoordinator;
pub use creator::ContentCreator;
pub use error::{ErrorClass, ErrorPolicy, RemoteError, UploadError, UploadResult};
pub use events::{BoxStream, EventSink, UploadEvent};
pub use finalizer::RevisionFinalizer;
pub use handle::{UploadHandle, UploadOutcome};
pub use progress::{ProgressTracker, ProgressUnit};
pub use record::{Block, Draft, DraftRecord, Revision, Thumbnail};
pub use remote::{
    Allocation, AllocationRequest, BlockDescriptor, BlockTarget, ContentEncryptor,
    RemoteUploadService, SealRequest,
};
pub use revision::{
    BlockFanout, PaginatedRevisionUploader, PlainRevisionUploader, RevisionUploader,
};
pub use store::memory::MemoryDraftStore;
pub use store::{Change, ChangeSet, DraftStore};
pub use thumbnail::{ThumbnailOutcome, ThumbnailUploader};
pub use types::{
    BlockSpec, ContentHash, DraftFailure, DraftId, DraftStage, NewDraft, NodeRef, RevisionId,
    RevisionState, RevisionUploadState, UploadTarget,
};
pub use writer::DraftWriter;

/// Everything an embedding application usually needs
pub mod prelude {
    pub use crate::{
        ContentEncryptor, ContentHash, DraftId, DraftRecord, DraftStage, DraftStore,
        MemoryDraftStore, NewDraft, NodeRef, PipelineCoordinator, RemoteUploadService,
        UploadConfig, UploadError, UploadEvent, UploadHandle, UploadOutcome, UploadResult,
    };

    pub use crate::{Allocation, AllocationRequest, RemoteError, SealRequest, UploadTarget};

    pub use async_trait::async_trait;
}
