use std::collections::{BTreeMap, VecDeque};

use bibedit_core::request::HpChangesUpdate;
use bibedit_core::{
    CoreError, EditRequest, Field, ManualClock, RecId, Record, RequestEnvelope, Response,
    ResultCode, UserId,
};
use bibedit_engine::{Transport, TransportError};
use bibedit_storage::{CacheEntry, CacheStore, SqliteCache, StorageError};
use tracing::debug;

struct StoredRecord {
    revision: u64,
    record: Record,
}

/// In-process stand-in for the editing endpoint.
///
/// Requests go through their JSON form, and record updates are applied to a
/// per-user cache kept in SQLite, so tests can compare the server's copy with
/// the editor's.
pub struct MockServer {
    store: SqliteCache,
    clock: ManualClock,
    uid: UserId,
    records: BTreeMap<RecId, StoredRecord>,
    received: Vec<RequestEnvelope>,
    scripted: VecDeque<Result<Response, TransportError>>,
    session_expired: bool,
    cache_timeout_ms: u64,
}

impl MockServer {
    pub fn new(clock: ManualClock, uid: UserId) -> Result<Self, StorageError> {
        Ok(Self::with_store(SqliteCache::open_in_memory()?, clock, uid))
    }

    pub fn with_store(store: SqliteCache, clock: ManualClock, uid: UserId) -> Self {
        Self {
            store,
            clock,
            uid,
            records: BTreeMap::new(),
            received: Vec::new(),
            scripted: VecDeque::new(),
            session_expired: false,
            cache_timeout_ms: 3_600_000,
        }
    }

    // ========================================================================
    // Test setup
    // ========================================================================

    /// Store a new revision of a record. Returns the revision string.
    pub fn put_record(&mut self, rec_id: RecId, record: Record) -> String {
        let revision = self
            .records
            .get(&rec_id)
            .map(|s| s.revision + 1)
            .unwrap_or(1);
        self.records.insert(rec_id, StoredRecord { revision, record });
        revision_string(revision)
    }

    pub fn stored_record(&self, rec_id: RecId) -> Option<&Record> {
        self.records.get(&rec_id).map(|s| &s.record)
    }

    pub fn stored_revision(&self, rec_id: RecId) -> Option<String> {
        self.records.get(&rec_id).map(|s| revision_string(s.revision))
    }

    /// The record in the current user's editing cache.
    pub fn cached_record(&self, rec_id: RecId) -> Result<Option<Record>, StorageError> {
        Ok(self.store.read_cache(rec_id, self.uid)?.map(|e| e.record))
    }

    pub fn cache_entry(&self, rec_id: RecId) -> Result<Option<CacheEntry>, StorageError> {
        self.store.read_cache(rec_id, self.uid)
    }

    pub fn add_changeset(&mut self, rec_id: RecId, proposed: &Record) -> Result<u64, StorageError> {
        let now = self.now();
        self.store.insert_hp_changeset(rec_id, proposed, now)
    }

    pub fn store(&self) -> &SqliteCache {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SqliteCache {
        &mut self.store
    }

    pub fn uid(&self) -> UserId {
        self.uid
    }

    /// Return this instead of processing the next request.
    pub fn script(&mut self, response: Response) {
        self.scripted.push_back(Ok(response));
    }

    pub fn fail_next(&mut self, error: TransportError) {
        self.scripted.push_back(Err(error));
    }

    pub fn expire_session(&mut self) {
        self.session_expired = true;
    }

    /// Every request received, in order.
    pub fn received(&self) -> &[RequestEnvelope] {
        &self.received
    }

    /// Received requests of one type.
    pub fn received_of(&self, request_type: &str) -> Vec<&RequestEnvelope> {
        self.received
            .iter()
            .filter(|r| r.request.request_type() == request_type)
            .collect()
    }

    pub fn clear_received(&mut self) {
        self.received.clear();
    }

    fn now(&self) -> u64 {
        self.clock.get()
    }

    // ========================================================================
    // Request handling
    // ========================================================================

    fn handle(&mut self, envelope: &RequestEnvelope) -> Result<Response, StorageError> {
        if self.session_expired {
            return Ok(Response::with_code(ResultCode::SESSION_EXPIRED));
        }
        let Some(rec_id) = envelope.rec_id else {
            return Ok(Response::with_code(ResultCode::UNKNOWN_REQUEST));
        };
        let mut response = match &envelope.request {
            EditRequest::GetRecord {
                delete_record_cache,
                in_read_only_mode,
                ..
            } => self.get_record(rec_id, *delete_record_cache, *in_read_only_mode)?,
            EditRequest::ApplyBulkUpdates { requests_to_apply } => {
                self.apply_updates(rec_id, envelope.cache_m_time, requests_to_apply)?
            }
            EditRequest::Submit { force } => self.submit(rec_id, *force)?,
            EditRequest::Cancel => {
                self.store.delete_cache(rec_id, self.uid)?;
                Response::with_code(ResultCode::RECORD_CANCELLED)
            }
            EditRequest::DeleteRecordCache => {
                self.store.delete_cache(rec_id, self.uid)?;
                Response::with_code(ResultCode::CACHE_DELETED)
            }
            EditRequest::GetHoldingPenUpdateDetails { changeset_number } => {
                match self.store.get_hp_changeset(*changeset_number)? {
                    Some(changeset) => Response {
                        new_record: Some(changeset.record),
                        ..Response::with_code(ResultCode::HP_CHANGESET_LOADED)
                    },
                    None => Response::with_code(ResultCode::NO_CHANGESET),
                }
            }
            EditRequest::DeleteHoldingPenChangeset { changeset_number } => {
                if self.store.delete_hp_changeset(*changeset_number)? {
                    Response::with_code(ResultCode::HP_CHANGESET_DELETED)
                } else {
                    Response::with_code(ResultCode::NO_CHANGESET)
                }
            }
            // Single updates are only ever sent in bulk.
            _ => Response::with_code(ResultCode::UNKNOWN_REQUEST),
        };
        response.rec_id = Some(rec_id);
        response.id = Some(envelope.id);
        Ok(response)
    }

    fn get_record(
        &mut self,
        rec_id: RecId,
        delete_cache: bool,
        read_only: bool,
    ) -> Result<Response, StorageError> {
        let now = self.now();
        let Some(stored) = self.records.get(&rec_id) else {
            return Ok(Response::with_code(ResultCode::NON_EXISTENT_RECORD));
        };
        let (stored_record, stored_revision) = (stored.record.clone(), stored.revision);

        let locked = self.store.cache_holders(rec_id)?.iter().any(|holder| {
            holder.uid != self.uid
                && now.saturating_sub(holder.mtime_ms) <= self.cache_timeout_ms
        });
        if locked && !read_only {
            return Ok(Response::with_code(ResultCode::LOCKED_BY_USER));
        }

        if delete_cache {
            self.store.delete_cache(rec_id, self.uid)?;
        }
        let entry = match self.store.read_cache(rec_id, self.uid)? {
            Some(entry) if !read_only => entry,
            _ => {
                let entry = CacheEntry {
                    revision: Some(revision_string(stored_revision)),
                    record: stored_record,
                    pending_changes: self.store.list_hp_changesets(rec_id)?,
                    ..CacheEntry::default()
                };
                if !read_only {
                    self.store.write_cache(rec_id, self.uid, &entry, now)?;
                }
                entry
            }
        };
        Ok(Response {
            cache_m_time: self.store.cache_mtime(rec_id, self.uid)?,
            cache_dirty: entry.dirty,
            record: Some(entry.record),
            record_revision: entry.revision,
            read_only,
            pending_hp_changes: entry.pending_changes,
            disabled_hp_changes: entry.disabled_hp_changes,
            hp_changes: entry.hp_changes,
            ..Response::with_code(ResultCode::RECORD_LOADED)
        })
    }

    fn apply_updates(
        &mut self,
        rec_id: RecId,
        cache_m_time: Option<u64>,
        requests: &[RequestEnvelope],
    ) -> Result<Response, StorageError> {
        let Some(mut entry) = self.store.read_cache(rec_id, self.uid)? else {
            return Ok(Response::with_code(ResultCode::CACHE_MISSING));
        };
        let mtime = self.store.cache_mtime(rec_id, self.uid)?;
        if cache_m_time.is_some() && cache_m_time != mtime {
            return Ok(Response::with_code(ResultCode::CACHE_CHANGED));
        }
        for request in requests {
            if let Err(e) = apply_update(&mut entry, &request.request) {
                debug!(id = %request.id, error = %e, "update rejected");
                return Ok(Response {
                    errors: vec![e.to_string()],
                    ..Response::with_code(ResultCode::INVALID_CONTENT)
                });
            }
        }
        entry.dirty = true;
        let now = self.now();
        let mtime = self.store.write_cache(rec_id, self.uid, &entry, now)?;
        Ok(Response {
            cache_m_time: Some(mtime),
            cache_dirty: true,
            ..Response::with_code(ResultCode::BULK_APPLIED)
        })
    }

    fn submit(&mut self, rec_id: RecId, force: bool) -> Result<Response, StorageError> {
        let Some(entry) = self.store.read_cache(rec_id, self.uid)? else {
            return Ok(Response::with_code(ResultCode::CACHE_MISSING));
        };
        let current = self.stored_revision(rec_id);
        if !force && entry.revision != current {
            return Ok(Response {
                cache_outdated: true,
                ..Response::with_code(ResultCode::OK)
            });
        }
        let mut record = entry.record;
        record.strip_volatile_subfields();
        self.put_record(rec_id, record);
        self.store.delete_cache(rec_id, self.uid)?;
        Ok(Response::with_code(ResultCode::RECORD_SUBMITTED))
    }
}

impl Transport for MockServer {
    fn send(&mut self, request: &RequestEnvelope) -> Result<Response, TransportError> {
        let json = request
            .to_json()
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let decoded =
            RequestEnvelope::from_json(&json).map_err(|e| TransportError::Malformed(e.to_string()))?;
        debug!(id = %decoded.id, kind = decoded.request.request_type(), "server received");
        self.received.push(decoded.clone());

        if let Some(scripted) = self.scripted.pop_front() {
            return scripted;
        }
        let response = self
            .handle(&decoded)
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let body =
            serde_json::to_string(&response).map_err(|e| TransportError::Malformed(e.to_string()))?;
        Response::from_json(&body).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

fn revision_string(revision: u64) -> String {
    format!("{revision:014}")
}

/// Apply one record update to a cache entry the way the endpoint does.
fn apply_update(entry: &mut CacheEntry, request: &EditRequest) -> Result<(), CoreError> {
    let record = &mut entry.record;
    match request {
        EditRequest::AddField {
            tag,
            field_position,
            controlfield,
            ind1,
            ind2,
            subfields,
            value,
        } => {
            let field = if *controlfield {
                Field::control(value.clone())
            } else {
                Field::data(*ind1, *ind2, subfields.clone())
            };
            record.insert_field(tag, *field_position, field)?;
        }
        EditRequest::AddSubfields {
            tag,
            field_position,
            subfields,
        } => {
            record.append_subfields(tag, *field_position, subfields.clone())?;
        }
        EditRequest::DeleteFields { to_delete } => {
            let mut fields = Vec::new();
            let mut subfields = Vec::new();
            for (tag, position, indices) in to_delete.iter() {
                if indices.is_empty() {
                    fields.push((tag, position));
                } else {
                    subfields.extend(indices.iter().map(|i| (tag, position, *i)));
                }
            }
            for (tag, position, index) in subfields.into_iter().rev() {
                record.remove_subfield(tag, position, index)?;
            }
            for (tag, position) in fields.into_iter().rev() {
                record.delete_field(tag, position)?;
            }
        }
        EditRequest::ModifyContent {
            tag,
            field_position,
            subfield_index,
            value,
        } => {
            match subfield_index {
                Some(i) => record.set_subfield_value(tag, *field_position, *i, value.clone())?,
                None => record.set_control_value(tag, *field_position, value.clone())?,
            };
        }
        EditRequest::ModifySubfieldCode {
            tag,
            field_position,
            subfield_index,
            subfield_code,
        } => {
            record.set_subfield_code(tag, *field_position, *subfield_index, *subfield_code)?;
        }
        EditRequest::ModifyFieldTag {
            old_tag,
            old_field_position,
            new_tag,
            new_field_position,
            ind1,
            ind2,
        } => {
            let mut field = record.delete_field(old_tag, *old_field_position)?;
            field.ind1 = *ind1;
            field.ind2 = *ind2;
            record.insert_field(new_tag, *new_field_position, field)?;
        }
        EditRequest::ModifyField {
            tag,
            field_position,
            ind1,
            ind2,
            subfields,
            value,
        } => {
            let field = Field {
                subfields: subfields.clone(),
                ind1: *ind1,
                ind2: *ind2,
                control_value: value.clone(),
                reserved: 0,
            };
            record.replace_field(tag, *field_position, field)?;
        }
        EditRequest::MoveField {
            tag,
            field_position,
            direction,
        } => {
            let target = direction
                .neighbour(*field_position, record.field_count(tag))
                .ok_or_else(|| CoreError::FieldNotFound {
                    tag: tag.clone(),
                    position: direction.target(*field_position),
                })?;
            record.swap_fields(tag, *field_position, target)?;
        }
        EditRequest::MoveSubfield {
            tag,
            field_position,
            subfield_index,
            new_subfield_index,
        } => {
            record.swap_subfields(tag, *field_position, *subfield_index, *new_subfield_index)?;
        }
        EditRequest::OtherUpdateRequest {
            hp_changes:
                HpChangesUpdate {
                    to_override,
                    changesets_to_deactivate,
                    changesets_to_activate,
                },
        } => {
            if let Some(changes) = to_override {
                entry.hp_changes = changes.clone();
            }
            for n in changesets_to_deactivate {
                if !entry.disabled_hp_changes.contains(n) {
                    entry.disabled_hp_changes.push(*n);
                }
            }
            entry
                .disabled_hp_changes
                .retain(|n| !changesets_to_activate.contains(n));
        }
        other => {
            return Err(CoreError::InvalidData(format!(
                "{} cannot be part of a bulk update",
                other.request_type()
            )));
        }
    }
    Ok(())
}
