//! Draft record tree.
//!
//! Records live in flat tables inside a [`DraftStore`](crate::DraftStore) and
//! refer to each other by ID only. A [`DraftRecord`] is the assembled,
//! read-only view of one draft that pipeline components work from.

use serde::{Deserialize, Serialize};

use crate::types::now_ts;
use crate::{
    ContentHash, DraftFailure, DraftId, DraftStage, NewDraft, NodeRef, RevisionId,
    RevisionState, RevisionUploadState, UploadTarget,
};

/// One file being uploaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: DraftId,
    pub node: NodeRef,
    pub revision_id: RevisionId,
    pub stage: DraftStage,
    pub last_error: Option<DraftFailure>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One content version of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub draft_id: DraftId,
    /// Identifier assigned by the remote service at allocation time
    pub remote_id: Option<String>,
    /// Allocation time
    pub created_at: Option<i64>,
    pub size: u64,
    pub manifest_signature: Option<String>,
    pub state: RevisionState,
    pub upload_state: RevisionUploadState,
    pub sealed_at: Option<i64>,
}

/// One content chunk of a revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub revision_id: RevisionId,
    pub index: u32,
    pub hash: ContentHash,
    pub size: u64,
    pub target: Option<UploadTarget>,
    /// Monotonic: only ever goes from false to true
    pub uploaded: bool,
    pub uploaded_at: Option<i64>,
}

/// Optional preview asset; best-effort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub revision_id: RevisionId,
    pub hash: ContentHash,
    pub size: u64,
    pub target: Option<UploadTarget>,
    pub uploaded: bool,
    pub failed: bool,
}

/// Assembled view of a draft and its revision tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub draft: Draft,
    pub revision: Revision,
    /// Ordered by index
    pub blocks: Vec<Block>,
    pub thumbnail: Option<Thumbnail>,
}

impl DraftRecord {
    /// Build the initial record tree for a new upload
    pub fn new(request: NewDraft) -> Self {
        let now = now_ts();
        let draft_id = DraftId::new();
        let revision_id = RevisionId::new();

        let blocks: Vec<Block> = request
            .blocks
            .into_iter()
            .enumerate()
            .map(|(index, spec)| Block {
                revision_id: revision_id.clone(),
                index: index as u32,
                hash: spec.hash,
                size: spec.size,
                target: None,
                uploaded: false,
                uploaded_at: None,
            })
            .collect();

        let thumbnail = request.thumbnail.map(|spec| Thumbnail {
            revision_id: revision_id.clone(),
            hash: spec.hash,
            size: spec.size,
            target: None,
            uploaded: false,
            failed: false,
        });

        let revision = Revision {
            id: revision_id.clone(),
            draft_id: draft_id.clone(),
            remote_id: None,
            created_at: None,
            size: blocks.iter().map(|b| b.size).sum(),
            manifest_signature: None,
            state: RevisionState::Draft,
            upload_state: RevisionUploadState::Pending,
            sealed_at: None,
        };

        let draft = Draft {
            id: draft_id,
            node: request.node,
            revision_id,
            stage: DraftStage::CreatingRevision,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        Self {
            draft,
            revision,
            blocks,
            thumbnail,
        }
    }

    pub fn id(&self) -> &DraftId {
        &self.draft.id
    }

    pub fn stage(&self) -> DraftStage {
        self.draft.stage
    }

    /// Empty file: no content blocks. Its revision is completed locally and
    /// a thumbnail alone is never transferred.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks still waiting for a confirmed transfer
    pub fn pending_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| !b.uploaded)
    }

    /// Pending blocks with no valid upload target
    pub fn blocks_needing_target(&self) -> impl Iterator<Item = &Block> {
        self.pending_blocks().filter(|b| b.target.is_none())
    }

    pub fn uploaded_block_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.uploaded).count()
    }

    pub fn all_blocks_uploaded(&self) -> bool {
        self.blocks.iter().all(|b| b.uploaded)
    }

    /// Thumbnail that still has to be transferred, if any.
    /// A thumbnail that already failed once is not retried.
    pub fn pending_thumbnail(&self) -> Option<&Thumbnail> {
        self.thumbnail.as_ref().filter(|t| !t.uploaded && !t.failed)
    }

    pub fn thumbnail_needs_target(&self) -> bool {
        self.pending_thumbnail().is_some_and(|t| t.target.is_none())
    }

    pub fn block(&self, index: u32) -> Option<&Block> {
        self.blocks.iter().find(|b| b.index == index)
    }

    /// Stage a resumed pipeline should continue from, derived from what the
    /// records say has been committed so far.
    pub fn resume_stage(&self) -> DraftStage {
        if self.revision.state == RevisionState::Active {
            return DraftStage::Finished;
        }
        if self.revision.upload_state == RevisionUploadState::Uploaded {
            return DraftStage::SealingRevision;
        }
        // Empty files never talk to the remote; run them through from the start
        if self.is_empty() {
            return DraftStage::CreatingRevision;
        }

        let allocated = self.revision.remote_id.is_some();
        let targets_missing =
            self.blocks_needing_target().next().is_some() || self.thumbnail_needs_target();

        if !allocated || targets_missing {
            DraftStage::CreatingRevision
        } else {
            DraftStage::UploadingBlocks
        }
    }
}
