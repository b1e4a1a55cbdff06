use serde::{Deserialize, Serialize};

use bibedit_core::{
    HpChange, RecId, Record, UndoOperation, UserId, request::ChangesetSummary,
};

use crate::error::StorageError;

/// Everything the server remembers about one user's editing session on one
/// record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached record differs from the stored revision.
    pub dirty: bool,
    pub revision: Option<String>,
    pub record: Record,
    /// Holding-pen changesets waiting for review.
    pub pending_changes: Vec<ChangesetSummary>,
    pub disabled_hp_changes: Vec<u64>,
    /// Changes currently visualised in the editor.
    pub hp_changes: Vec<HpChange>,
    pub undo_list: Vec<UndoOperation>,
    pub redo_list: Vec<UndoOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMeta {
    pub uid: UserId,
    pub mtime_ms: u64,
    pub dirty: bool,
    pub fingerprint: [u8; 32],
}

#[derive(Debug, Clone, PartialEq)]
pub struct HpChangeset {
    pub changeset_number: u64,
    pub rec_id: RecId,
    pub record: Record,
    pub created_ms: u64,
}

pub trait CacheStore {
    /// Store the entry and stamp it with `now_ms`, which is returned as the
    /// new modification time.
    fn write_cache(
        &mut self,
        rec_id: RecId,
        uid: UserId,
        entry: &CacheEntry,
        now_ms: u64,
    ) -> Result<u64, StorageError>;

    fn read_cache(&self, rec_id: RecId, uid: UserId) -> Result<Option<CacheEntry>, StorageError>;

    fn cache_exists(&self, rec_id: RecId, uid: UserId) -> Result<bool, StorageError>;

    fn cache_meta(&self, rec_id: RecId, uid: UserId) -> Result<Option<CacheMeta>, StorageError>;

    fn cache_mtime(&self, rec_id: RecId, uid: UserId) -> Result<Option<u64>, StorageError> {
        Ok(self.cache_meta(rec_id, uid)?.map(|m| m.mtime_ms))
    }

    /// Caches held on the record by every user, oldest first.
    fn cache_holders(&self, rec_id: RecId) -> Result<Vec<CacheMeta>, StorageError>;

    /// Returns whether a cache was removed.
    fn delete_cache(&mut self, rec_id: RecId, uid: UserId) -> Result<bool, StorageError>;

    /// A missing cache counts as expired.
    fn cache_expired(
        &self,
        rec_id: RecId,
        uid: UserId,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Result<bool, StorageError> {
        Ok(match self.cache_mtime(rec_id, uid)? {
            Some(mtime) => now_ms.saturating_sub(mtime) > timeout_ms,
            None => true,
        })
    }

    fn touch_cache(&mut self, rec_id: RecId, uid: UserId, now_ms: u64)
    -> Result<(), StorageError>;

    fn insert_hp_changeset(
        &mut self,
        rec_id: RecId,
        record: &Record,
        now_ms: u64,
    ) -> Result<u64, StorageError>;

    fn get_hp_changeset(&self, changeset_number: u64) -> Result<Option<HpChangeset>, StorageError>;

    fn list_hp_changesets(&self, rec_id: RecId) -> Result<Vec<ChangesetSummary>, StorageError>;

    fn delete_hp_changeset(&mut self, changeset_number: u64) -> Result<bool, StorageError>;
}
