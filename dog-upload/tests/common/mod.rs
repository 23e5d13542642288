#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use dog_upload::{
    Allocation, AllocationRequest, Block, BlockTarget, ContentEncryptor, ContentHash,
    MemoryDraftStore, NewDraft, NodeRef, PipelineCoordinator, RemoteError, RemoteUploadService,
    SealRequest, Thumbnail, UploadConfig, UploadError, UploadResult, UploadTarget,
};

pub const QUOTA_CODE: i64 = 200_001;
pub const EXPIRED_CODE: i64 = 2501;
pub const ALREADY_COMMITTED_CODE: i64 = 2500;
pub const INVALID_REVISION_CODE: i64 = 2511;

/// What an upload URL points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Block(u32),
    Thumbnail,
}

#[derive(Default)]
struct MockState {
    revisions: u32,
    generation: u32,
    targets: HashMap<String, TargetKind>,
    allocation_failures: VecDeque<RemoteError>,
    block_failures: HashMap<u32, VecDeque<RemoteError>>,
    thumbnail_failure: Option<RemoteError>,
    block_delays: HashMap<u32, Duration>,
    allocation_delay: Option<Duration>,
    seal_failures: VecDeque<RemoteError>,
    seal_delay: Option<Duration>,
    sealed: HashSet<String>,
    allocation_requests: Vec<AllocationRequest>,
    seal_requests: Vec<SealRequest>,
    uploads: Vec<TargetKind>,
}

/// Scriptable in-memory remote
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
    upload_delay: Mutex<Option<Duration>>,
    allocations: AtomicUsize,
    transfers: AtomicUsize,
    seals: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every remote call made so far
    pub fn total_calls(&self) -> usize {
        self.allocation_calls() + self.transfer_calls() + self.seal_calls()
    }

    pub fn allocation_calls(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn transfer_calls(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn seal_calls(&self) -> usize {
        self.seals.load(Ordering::SeqCst)
    }

    pub fn fail_next_allocation(&self, error: RemoteError) {
        self.state.lock().allocation_failures.push_back(error);
    }

    /// The next transfer of block `index` fails with `error`
    pub fn fail_block_once(&self, index: u32, error: RemoteError) {
        self.state
            .lock()
            .block_failures
            .entry(index)
            .or_default()
            .push_back(error);
    }

    pub fn fail_thumbnail(&self, error: RemoteError) {
        self.state.lock().thumbnail_failure = Some(error);
    }

    pub fn delay_block(&self, index: u32, delay: Duration) {
        self.state.lock().block_delays.insert(index, delay);
    }

    pub fn clear_block_delays(&self) {
        self.state.lock().block_delays.clear();
    }

    pub fn set_allocation_delay(&self, delay: Option<Duration>) {
        self.state.lock().allocation_delay = delay;
    }

    pub fn fail_next_seal(&self, error: RemoteError) {
        self.state.lock().seal_failures.push_back(error);
    }

    pub fn set_seal_delay(&self, delay: Option<Duration>) {
        self.state.lock().seal_delay = delay;
    }

    pub fn set_upload_delay(&self, delay: Option<Duration>) {
        *self.upload_delay.lock() = delay;
    }

    /// Successful transfers, in completion order
    pub fn uploads(&self) -> Vec<TargetKind> {
        self.state.lock().uploads.clone()
    }

    pub fn uploaded_blocks(&self) -> Vec<u32> {
        self.uploads()
            .into_iter()
            .filter_map(|kind| match kind {
                TargetKind::Block(index) => Some(index),
                TargetKind::Thumbnail => None,
            })
            .collect()
    }

    pub fn allocation_requests(&self) -> Vec<AllocationRequest> {
        self.state.lock().allocation_requests.clone()
    }

    pub fn seal_requests(&self) -> Vec<SealRequest> {
        self.state.lock().seal_requests.clone()
    }
}

#[async_trait]
impl RemoteUploadService for MockRemote {
    async fn allocate_revision(
        &self,
        request: AllocationRequest,
    ) -> Result<Allocation, RemoteError> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().allocation_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.allocation_requests.push(request.clone());
        if let Some(error) = state.allocation_failures.pop_front() {
            return Err(error);
        }

        let revision_id = match request.revision_id {
            Some(existing) => existing,
            None => {
                state.revisions += 1;
                format!("remote-rev-{}", state.revisions)
            }
        };
        state.generation += 1;
        let generation = state.generation;

        let block_targets = request
            .blocks
            .iter()
            .map(|block| {
                let url = format!("https://blocks/{revision_id}/{}/{generation}", block.index);
                state.targets.insert(url.clone(), TargetKind::Block(block.index));
                BlockTarget {
                    index: block.index,
                    target: UploadTarget::new(url, format!("tok-{}", block.index)),
                }
            })
            .collect();

        let thumbnail_target = request.thumbnail.then(|| {
            let url = format!("https://thumbs/{revision_id}/{generation}");
            state.targets.insert(url.clone(), TargetKind::Thumbnail);
            UploadTarget::new(url, "tok-thumb")
        });

        Ok(Allocation {
            revision_id,
            block_targets,
            thumbnail_target,
        })
    }

    async fn upload_bytes(&self, target: &UploadTarget, _data: Bytes) -> Result<(), RemoteError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);

        let (kind, delay) = {
            let state = self.state.lock();
            let kind = state
                .targets
                .get(&target.url)
                .copied()
                .ok_or_else(|| RemoteError::response(404, format!("unknown target {}", target.url)))?;
            let delay = match kind {
                TargetKind::Block(index) => state.block_delays.get(&index).copied(),
                TargetKind::Thumbnail => None,
            };
            (kind, delay.or(*self.upload_delay.lock()))
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let failure = match kind {
            TargetKind::Block(index) => state
                .block_failures
                .get_mut(&index)
                .and_then(VecDeque::pop_front),
            TargetKind::Thumbnail => state.thumbnail_failure.clone(),
        };
        if let Some(error) = failure {
            return Err(error);
        }
        state.uploads.push(kind);
        Ok(())
    }

    async fn seal_revision(&self, request: SealRequest) -> Result<(), RemoteError> {
        self.seals.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().seal_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let revision_id = request.revision_id.clone();
        state.seal_requests.push(request);
        if let Some(error) = state.seal_failures.pop_front() {
            return Err(error);
        }
        // A real remote refuses to seal the same revision twice
        if !state.sealed.insert(revision_id.clone()) {
            return Err(RemoteError::response(
                ALREADY_COMMITTED_CODE,
                format!("revision {revision_id} already committed"),
            ));
        }
        Ok(())
    }
}

/// Deterministic stand-in for real encryption
pub struct MockEncryptor;

#[async_trait]
impl ContentEncryptor for MockEncryptor {
    async fn encrypt_block(&self, block: &Block) -> UploadResult<Bytes> {
        let mut data = b"enc:".to_vec();
        data.extend_from_slice(block.hash.as_bytes());
        Ok(Bytes::from(data))
    }

    async fn encrypt_thumbnail(&self, thumbnail: &Thumbnail) -> UploadResult<Bytes> {
        if thumbnail.hash.as_bytes().is_empty() {
            return Err(UploadError::encryption("empty thumbnail"));
        }
        Ok(Bytes::copy_from_slice(thumbnail.hash.as_bytes()))
    }

    async fn sign_manifest(&self, hashes: &[ContentHash]) -> UploadResult<String> {
        let joined: Vec<String> = hashes.iter().map(ContentHash::to_base64).collect();
        Ok(format!("sig:{}", joined.join(",")))
    }
}

pub fn new_draft(blocks: usize, thumbnail: bool) -> NewDraft {
    let mut request = NewDraft::new(NodeRef::new("node-1"));
    for i in 0..blocks {
        request = request.with_block(ContentHash::new(format!("hash-{i}").into_bytes()), 1024);
    }
    if thumbnail {
        request = request.with_thumbnail(ContentHash::new(b"thumb".to_vec()), 64);
    }
    request
}

pub struct Harness {
    pub store: Arc<MemoryDraftStore>,
    pub remote: Arc<MockRemote>,
    pub coordinator: PipelineCoordinator,
}

impl Harness {
    pub fn new(config: UploadConfig) -> Self {
        Self::with_store(Arc::new(MemoryDraftStore::new()), MockRemote::new(), config)
    }

    pub fn with_store(
        store: Arc<MemoryDraftStore>,
        remote: Arc<MockRemote>,
        config: UploadConfig,
    ) -> Self {
        let coordinator = PipelineCoordinator::from_shared(
            store.clone(),
            remote.clone(),
            Arc::new(MockEncryptor),
            config,
        );
        Self {
            store,
            remote,
            coordinator,
        }
    }
}
