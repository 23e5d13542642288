use async_trait::async_trait;
use bytes::Bytes;

use crate::{Block, ContentHash, RemoteError, Thumbnail, UploadResult, UploadTarget};

/// Remote side of the upload: allocation, transfer and sealing
#[async_trait]
pub trait RemoteUploadService: Send + Sync {
    /// Allocate (or top up) a revision and hand out upload targets
    async fn allocate_revision(
        &self,
        request: AllocationRequest,
    ) -> Result<Allocation, RemoteError>;

    /// Transfer one ciphertext to its target
    async fn upload_bytes(&self, target: &UploadTarget, data: Bytes) -> Result<(), RemoteError>;

    /// Seal a revision once its blocks are uploaded
    async fn seal_revision(&self, request: SealRequest) -> Result<(), RemoteError>;
}

/// Produces ciphertext and signatures; the algorithm is opaque to the pipeline
#[async_trait]
pub trait ContentEncryptor: Send + Sync {
    async fn encrypt_block(&self, block: &Block) -> UploadResult<Bytes>;

    async fn encrypt_thumbnail(&self, thumbnail: &Thumbnail) -> UploadResult<Bytes>;

    /// Signature over the block hashes, in index order
    async fn sign_manifest(&self, hashes: &[ContentHash]) -> UploadResult<String>;
}

/// One block asking for an upload target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub index: u32,
    pub hash: ContentHash,
    pub size: u64,
}

/// Request to allocate a revision and upload targets.
///
/// `revision_id` is set when the revision already exists remotely and only
/// some targets are missing (e.g. after a target expired).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub revision_id: Option<String>,
    pub blocks: Vec<BlockDescriptor>,
    pub thumbnail: bool,
}

/// Targets for one requested block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTarget {
    pub index: u32,
    pub target: UploadTarget,
}

/// Result of a successful allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub revision_id: String,
    pub block_targets: Vec<BlockTarget>,
    pub thumbnail_target: Option<UploadTarget>,
}

/// Request to seal an uploaded revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealRequest {
    pub revision_id: String,
    pub manifest_signature: String,
    /// Upload tokens of every block, in index order
    pub block_tokens: Vec<String>,
}
