pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    DraftFailure, DraftId, DraftRecord, DraftStage, RevisionState, RevisionUploadState,
    UploadError, UploadResult, UploadTarget,
};

/// Transactional storage for draft record trees
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Save a freshly created record tree
    async fn insert(&self, record: DraftRecord) -> UploadResult<()>;

    /// Assemble the current record tree of a draft
    async fn load(&self, draft_id: &DraftId) -> UploadResult<DraftRecord>;

    /// Apply a change set atomically and return the updated tree.
    ///
    /// Either every change is applied or none is: a failing change, or a
    /// failing write, leaves the stored tree untouched.
    async fn commit(&self, draft_id: &DraftId, changes: ChangeSet) -> UploadResult<DraftRecord>;

    /// Delete a draft and its whole record tree
    async fn remove(&self, draft_id: &DraftId) -> UploadResult<()>;

    /// IDs of every stored draft
    async fn list(&self) -> UploadResult<Vec<DraftId>>;
}

/// A single mutation of a draft's record tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Move the draft to a stage, optionally recording why
    SetStage {
        stage: DraftStage,
        failure: Option<DraftFailure>,
    },
    AssignRevision {
        remote_id: String,
        created_at: i64,
    },
    SetBlockTarget {
        index: u32,
        target: UploadTarget,
    },
    ClearBlockTarget {
        index: u32,
    },
    MarkBlockUploaded {
        index: u32,
        at: i64,
    },
    SetThumbnailTarget {
        target: UploadTarget,
    },
    MarkThumbnailUploaded,
    MarkThumbnailFailed,
    MarkRevisionUploaded,
    /// Undo `MarkRevisionUploaded` after the remote refused the revision
    RollbackRevisionUpload,
    SealRevision {
        manifest_signature: String,
        at: i64,
    },
}

/// Ordered list of changes committed as one transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(change: Change) -> Self {
        Self {
            changes: vec![change],
        }
    }

    pub fn with(mut self, change: Change) -> Self {
        self.changes.push(change);
        self
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Apply every change to a working copy of `record`.
    ///
    /// Returns the updated copy; `record` itself is never touched, so a
    /// store can discard the copy to roll back.
    pub fn apply_to(&self, record: &DraftRecord, now: i64) -> UploadResult<DraftRecord> {
        let mut working = record.clone();
        for change in &self.changes {
            apply_change(&mut working, change)?;
        }
        if !self.changes.is_empty() {
            working.draft.updated_at = now;
        }
        Ok(working)
    }
}

impl From<Change> for ChangeSet {
    fn from(change: Change) -> Self {
        Self::single(change)
    }
}

fn apply_change(record: &mut DraftRecord, change: &Change) -> UploadResult<()> {
    match change {
        Change::SetStage { stage, failure } => {
            record.draft.stage = *stage;
            if *stage == DraftStage::Finished {
                record.draft.last_error = None;
            } else if let Some(failure) = failure {
                record.draft.last_error = Some(failure.clone());
            }
        }
        Change::AssignRevision {
            remote_id,
            created_at,
        } => {
            match &record.revision.remote_id {
                Some(existing) if existing != remote_id => {
                    return Err(UploadError::invalid_state(format!(
                        "revision {} is already allocated as {}, refusing {}",
                        record.revision.id, existing, remote_id
                    )));
                }
                Some(_) => {}
                None => {
                    record.revision.remote_id = Some(remote_id.clone());
                    record.revision.created_at = Some(*created_at);
                }
            }
        }
        Change::SetBlockTarget { index, target } => {
            let block = block_mut(record, *index)?;
            if !block.uploaded {
                block.target = Some(target.clone());
            }
        }
        Change::ClearBlockTarget { index } => {
            let block = block_mut(record, *index)?;
            if !block.uploaded {
                block.target = None;
            }
        }
        Change::MarkBlockUploaded { index, at } => {
            let block = block_mut(record, *index)?;
            if block.target.is_none() {
                return Err(UploadError::invalid_state(format!(
                    "block {} has no upload target and cannot be uploaded",
                    index
                )));
            }
            // Repeat confirmations keep the first timestamp
            if !block.uploaded {
                block.uploaded = true;
                block.uploaded_at = Some(*at);
            }
        }
        Change::SetThumbnailTarget { target } => {
            let thumbnail = thumbnail_mut(record)?;
            if !thumbnail.uploaded {
                thumbnail.target = Some(target.clone());
            }
        }
        Change::MarkThumbnailUploaded => {
            let thumbnail = thumbnail_mut(record)?;
            thumbnail.uploaded = true;
            thumbnail.failed = false;
        }
        Change::MarkThumbnailFailed => {
            let thumbnail = thumbnail_mut(record)?;
            if !thumbnail.uploaded {
                thumbnail.failed = true;
            }
        }
        Change::MarkRevisionUploaded => {
            if let Some(block) = record.blocks.iter().find(|b| !b.uploaded) {
                return Err(UploadError::invalid_state(format!(
                    "revision {} still has block {} pending",
                    record.revision.id, block.index
                )));
            }
            record.revision.upload_state = RevisionUploadState::Uploaded;
        }
        Change::RollbackRevisionUpload => {
            if record.revision.state == RevisionState::Active {
                return Err(UploadError::invalid_state(format!(
                    "revision {} is already sealed",
                    record.revision.id
                )));
            }
            record.revision.upload_state = RevisionUploadState::Pending;
        }
        Change::SealRevision {
            manifest_signature,
            at,
        } => {
            if record.revision.upload_state != RevisionUploadState::Uploaded
                || !record.all_blocks_uploaded()
            {
                return Err(UploadError::invalid_state(format!(
                    "revision {} cannot be sealed before all blocks are uploaded",
                    record.revision.id
                )));
            }
            record.revision.state = RevisionState::Active;
            record.revision.manifest_signature = Some(manifest_signature.clone());
            record.revision.sealed_at = Some(*at);
        }
    }
    Ok(())
}

fn block_mut(record: &mut DraftRecord, index: u32) -> UploadResult<&mut crate::Block> {
    let revision = record.revision.id.clone();
    record
        .blocks
        .iter_mut()
        .find(|b| b.index == index)
        .ok_or_else(|| {
            UploadError::invalid_state(format!("revision {} has no block {}", revision, index))
        })
}

fn thumbnail_mut(record: &mut DraftRecord) -> UploadResult<&mut crate::Thumbnail> {
    let revision = record.revision.id.clone();
    record
        .thumbnail
        .as_mut()
        .ok_or_else(|| UploadError::invalid_state(format!("revision {} has no thumbnail", revision)))
}
