use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::types::now_ts;
use crate::{
    Block, ChangeSet, Draft, DraftId, DraftRecord, DraftStore, Revision, RevisionId, Thumbnail,
    UploadError, UploadResult,
};

type CommitFault = Box<dyn Fn(&DraftId, &ChangeSet) -> bool + Send + Sync>;

/// Flat record tables, relationships resolved by ID
#[derive(Default)]
struct Tables {
    drafts: HashMap<DraftId, Draft>,
    revisions: HashMap<RevisionId, Revision>,
    /// revision -> index -> block
    blocks: HashMap<RevisionId, BTreeMap<u32, Block>>,
    thumbnails: HashMap<RevisionId, Thumbnail>,
}

impl Tables {
    fn assemble(&self, draft_id: &DraftId) -> UploadResult<DraftRecord> {
        let draft = self
            .drafts
            .get(draft_id)
            .ok_or_else(|| UploadError::DraftNotFound {
                draft_id: draft_id.clone(),
            })?;

        let revision = self.revisions.get(&draft.revision_id).ok_or_else(|| {
            UploadError::persistence(format!(
                "draft {} points at missing revision {}",
                draft_id, draft.revision_id
            ))
        })?;

        let blocks = self
            .blocks
            .get(&revision.id)
            .map(|by_index| by_index.values().cloned().collect())
            .unwrap_or_default();

        Ok(DraftRecord {
            draft: draft.clone(),
            revision: revision.clone(),
            blocks,
            thumbnail: self.thumbnails.get(&revision.id).cloned(),
        })
    }

    fn store(&mut self, record: DraftRecord) {
        let revision_id = record.revision.id.clone();
        let blocks = record
            .blocks
            .into_iter()
            .map(|b| (b.index, b))
            .collect::<BTreeMap<_, _>>();

        self.blocks.insert(revision_id.clone(), blocks);
        match record.thumbnail {
            Some(thumbnail) => {
                self.thumbnails.insert(revision_id.clone(), thumbnail);
            }
            None => {
                self.thumbnails.remove(&revision_id);
            }
        }
        self.revisions.insert(revision_id, record.revision);
        self.drafts.insert(record.draft.id.clone(), record.draft);
    }

    fn delete(&mut self, draft_id: &DraftId) -> Option<Draft> {
        let draft = self.drafts.remove(draft_id)?;
        self.revisions.remove(&draft.revision_id);
        self.blocks.remove(&draft.revision_id);
        self.thumbnails.remove(&draft.revision_id);
        Some(draft)
    }
}

/// Serialized form of the whole store
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    drafts: Vec<Draft>,
    revisions: Vec<Revision>,
    blocks: Vec<Block>,
    thumbnails: Vec<Thumbnail>,
}

/// In-memory draft store for tests, development and embedding
pub struct MemoryDraftStore {
    tables: Arc<RwLock<Tables>>,
    commits: AtomicUsize,
    failing_commits: AtomicUsize,
    commit_fault: Mutex<Option<CommitFault>>,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            commits: AtomicUsize::new(0),
            failing_commits: AtomicUsize::new(0),
            commit_fault: Mutex::new(None),
        }
    }

    /// Serialize every table to JSON
    pub fn export_json(&self) -> UploadResult<String> {
        let tables = self.tables.read();
        let mut snapshot = StoreSnapshot::default();

        for draft in tables.drafts.values() {
            snapshot.drafts.push(draft.clone());
        }
        snapshot.revisions.extend(tables.revisions.values().cloned());
        for by_index in tables.blocks.values() {
            snapshot.blocks.extend(by_index.values().cloned());
        }
        snapshot.thumbnails.extend(tables.thumbnails.values().cloned());

        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Rebuild a store from [`export_json`](Self::export_json) output
    pub fn import_json(json: &str) -> UploadResult<Self> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        let mut tables = Tables::default();

        for draft in snapshot.drafts {
            tables.drafts.insert(draft.id.clone(), draft);
        }
        for revision in snapshot.revisions {
            tables.revisions.insert(revision.id.clone(), revision);
        }
        for block in snapshot.blocks {
            tables
                .blocks
                .entry(block.revision_id.clone())
                .or_default()
                .insert(block.index, block);
        }
        for thumbnail in snapshot.thumbnails {
            tables.thumbnails.insert(thumbnail.revision_id.clone(), thumbnail);
        }

        let store = Self::new();
        *store.tables.write() = tables;
        Ok(store)
    }

    /// Number of successfully committed change sets
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make the next `n` commits fail with a persistence error
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Fail every commit for which `predicate` returns true
    pub fn fail_commits_matching<F>(&self, predicate: F)
    where
        F: Fn(&DraftId, &ChangeSet) -> bool + Send + Sync + 'static,
    {
        *self.commit_fault.lock() = Some(Box::new(predicate));
    }

    pub fn clear_faults(&self) {
        self.failing_commits.store(0, Ordering::SeqCst);
        *self.commit_fault.lock() = None;
    }

    fn injected_fault(&self, draft_id: &DraftId, changes: &ChangeSet) -> bool {
        let counted = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if counted {
            return true;
        }
        self.commit_fault
            .lock()
            .as_ref()
            .is_some_and(|fault| fault(draft_id, changes))
    }
}

impl Default for MemoryDraftStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DraftStore for MemoryDraftStore {
    async fn insert(&self, record: DraftRecord) -> UploadResult<()> {
        let mut tables = self.tables.write();
        if tables.drafts.contains_key(record.id()) {
            return Err(UploadError::persistence(format!(
                "draft {} already exists",
                record.id()
            )));
        }
        tables.store(record);
        Ok(())
    }

    async fn load(&self, draft_id: &DraftId) -> UploadResult<DraftRecord> {
        self.tables.read().assemble(draft_id)
    }

    async fn commit(&self, draft_id: &DraftId, changes: ChangeSet) -> UploadResult<DraftRecord> {
        let mut tables = self.tables.write();
        let current = tables.assemble(draft_id)?;
        let updated = changes.apply_to(&current, now_ts())?;

        if self.injected_fault(draft_id, &changes) {
            return Err(UploadError::persistence(format!(
                "write of {} change(s) for draft {} failed",
                changes.len(),
                draft_id
            )));
        }

        tables.store(updated.clone());
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn remove(&self, draft_id: &DraftId) -> UploadResult<()> {
        self.tables
            .write()
            .delete(draft_id)
            .map(|_| ())
            .ok_or_else(|| UploadError::DraftNotFound {
                draft_id: draft_id.clone(),
            })
    }

    async fn list(&self) -> UploadResult<Vec<DraftId>> {
        let mut ids: Vec<DraftId> = self.tables.read().drafts.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
