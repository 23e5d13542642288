use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ErrorClass;

/// Stable identifier of a draft (the upload ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DraftId(pub String);

impl DraftId {
    /// Generate a new random draft ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DraftId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DraftId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DraftId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Local identifier of a revision record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionId(pub String);

impl RevisionId {
    /// Generate a new random revision ID
    pub fn new() -> Self {
        Self(format!("rev_{}", Uuid::new_v4().simple()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RevisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to the file/node a draft uploads content for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef(pub String);

impl NodeRef {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Digest of a block's content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub Vec<u8>);

impl ContentHash {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Base64 form, as sent to the remote service
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Where and with which token a block or thumbnail is uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    pub url: String,
    pub token: String,
}

impl UploadTarget {
    pub fn new<U: Into<String>, T: Into<String>>(url: U, token: T) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }
}

/// Macro-stage of a draft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStage {
    CreatingRevision,
    /// Blocks and the optional thumbnail upload concurrently in this stage
    UploadingBlocks,
    SealingRevision,
    /// Parked until an external action frees remote space
    BlockedNoSpace,
    Failed,
    Finished,
}

impl DraftStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Stages a pipeline run actively works on
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::CreatingRevision | Self::UploadingBlocks | Self::SealingRevision
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatingRevision => "creating_revision",
            Self::UploadingBlocks => "uploading_blocks",
            Self::SealingRevision => "sealing_revision",
            Self::BlockedNoSpace => "blocked_no_space",
            Self::Failed => "failed",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for DraftStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote lifecycle of a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionState {
    Draft,
    Active,
    Inactive,
}

/// Local upload progress of a revision's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionUploadState {
    Pending,
    Uploaded,
}

/// Last error recorded on a draft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftFailure {
    pub class: ErrorClass,
    pub message: String,
    pub at: i64,
}

/// Description of one block of a new draft
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    pub hash: ContentHash,
    pub size: u64,
}

impl BlockSpec {
    pub fn new(hash: ContentHash, size: u64) -> Self {
        Self { hash, size }
    }
}

/// Request to track a new file upload
#[derive(Debug, Clone)]
pub struct NewDraft {
    pub node: NodeRef,
    pub blocks: Vec<BlockSpec>,
    pub thumbnail: Option<BlockSpec>,
}

impl NewDraft {
    pub fn new(node: NodeRef) -> Self {
        Self {
            node,
            blocks: Vec::new(),
            thumbnail: None,
        }
    }

    pub fn with_block(mut self, hash: ContentHash, size: u64) -> Self {
        self.blocks.push(BlockSpec::new(hash, size));
        self
    }

    pub fn with_blocks(mut self, blocks: Vec<BlockSpec>) -> Self {
        self.blocks.extend(blocks);
        self
    }

    pub fn with_thumbnail(mut self, hash: ContentHash, size: u64) -> Self {
        self.thumbnail = Some(BlockSpec::new(hash, size));
        self
    }
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
