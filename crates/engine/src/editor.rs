use bibedit_core::validation::{self, marc_address};
use bibedit_core::{
    ChangeDescriptor, Clock, CoreError, DeleteSelection, DeletedField, DeletedSubfield,
    Direction, EditRequest, EditorHash, EditorState, Field, HpChange, Indicators, RecId, Record,
    RequestEnvelope, Response, ResultClass, ResultCode, SessionId, Subfield, TransactionId,
    UndoOperation, UndoRedo, UserId,
};
use bibedit_storage::{CacheEntry, CacheStore};
use tracing::{debug, info, warn};

use crate::config::EditorConfig;
use crate::diff::{DiffOptions, diff_records, filter_changes};
use crate::error::EngineError;
use crate::holding_pen::HoldingPen;
use crate::poll::PollBackoff;
use crate::queue::{FlushOutcome, RequestQueue, Transport};
use crate::replay::{ReplayDirection, holding_pen_update, replay, replay_step};
use crate::undo::UndoManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    /// The operation was replayed; carries its description.
    Applied(String),
    /// Nothing to undo or redo.
    Empty,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub flush: Option<FlushOutcome>,
    /// A poll found newer server state and reloaded it.
    pub refreshed: bool,
}

/// One editing session on one record.
///
/// Every edit mutates the local record immediately, is recorded for undo,
/// and queues the request that reproduces it on the server.
pub struct Editor<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    config: EditorConfig,
    session_id: SessionId,
    rec_id: Option<RecId>,
    revision: Option<String>,
    record: Record,
    cache_m_time: Option<u64>,
    cache_dirty: bool,
    read_only: bool,
    undo: UndoManager,
    pen: HoldingPen,
    queue: RequestQueue,
    poll: PollBackoff,
    next_id: TransactionId,
}

impl<T: Transport, C: Clock> Editor<T, C> {
    pub fn new(transport: T, clock: C, config: EditorConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            transport,
            clock,
            session_id: SessionId::new(),
            rec_id: None,
            revision: None,
            record: Record::new(),
            cache_m_time: None,
            cache_dirty: false,
            read_only: false,
            undo: UndoManager::new(config.undo_depth),
            pen: HoldingPen::new(),
            queue: RequestQueue::new(config.auto_flush_interval_ms),
            poll: PollBackoff::new(config.poll_initial_ms, config.poll_max_ms, config.poll_factor),
            next_id: TransactionId(1),
            config,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn rec_id(&self) -> Option<RecId> {
        self.rec_id
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn cache_m_time(&self) -> Option<u64> {
        self.cache_m_time
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The server cache or the local queue holds changes not yet submitted.
    pub fn is_dirty(&self) -> bool {
        self.cache_dirty || self.queue.is_dirty()
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    pub fn holding_pen(&self) -> &HoldingPen {
        &self.pen
    }

    pub fn hp_changes(&self) -> &[HpChange] {
        self.pen.changes()
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Fetch a record (optionally an older revision) and start a fresh
    /// session on it. Unsent changes to the previous record are flushed
    /// first.
    pub fn load(
        &mut self,
        rec_id: RecId,
        revision: Option<String>,
        read_only: bool,
    ) -> Result<(), EngineError> {
        if self.rec_id.is_some() {
            self.flush_now()?;
        }
        self.fetch(rec_id, revision, read_only, false)
    }

    /// Follow a deep link. Only `edit` states with a record id load anything;
    /// the resolved state is returned for the caller to act on.
    pub fn open_hash(&mut self, hash: &EditorHash) -> Result<Option<EditorState>, EngineError> {
        let state = hash.resolve();
        if let Some(EditorState::Edit {
            rec_id,
            revision,
            read_only,
        }) = &state
        {
            self.load(*rec_id, revision.clone(), *read_only)?;
        }
        Ok(state)
    }

    /// Deep link to the current session.
    pub fn hash(&self) -> EditorHash {
        match self.rec_id {
            Some(rec_id) => EditorHash::edit(rec_id, self.revision.as_deref(), self.read_only),
            None => EditorHash::default(),
        }
    }

    /// Reload the current record. With `discard_cache` the server drops the
    /// cached copy and every unsubmitted change is lost.
    pub fn reload(&mut self, discard_cache: bool) -> Result<(), EngineError> {
        let rec_id = self.rec_id.ok_or(EngineError::NoRecordLoaded)?;
        if discard_cache {
            self.queue.clear();
        } else {
            self.flush_now()?;
        }
        let revision = self.revision.clone();
        let read_only = self.read_only;
        self.fetch(rec_id, revision, read_only, discard_cache)
    }

    fn fetch(
        &mut self,
        rec_id: RecId,
        revision: Option<String>,
        read_only: bool,
        discard_cache: bool,
    ) -> Result<(), EngineError> {
        info!(session = %self.session_id, %rec_id, ?revision, read_only, "loading record");
        self.rec_id = Some(rec_id);
        let request = EditRequest::GetRecord {
            record_revision: revision.clone(),
            delete_record_cache: discard_cache,
            in_read_only_mode: read_only,
        };
        let response = self
            .send(request)
            .and_then(|response| self.interpret(&response).map(|()| response));
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        if response.record.is_none() {
            self.reset();
            return Err(EngineError::Server(response.result_code));
        }
        self.install(response, revision, read_only)
    }

    fn install(
        &mut self,
        response: Response,
        revision: Option<String>,
        read_only: bool,
    ) -> Result<(), EngineError> {
        let now = self.clock.now_ms()?;
        self.record = response.record.unwrap_or_default();
        self.revision = response.record_revision.or(revision);
        self.read_only = read_only || response.read_only;
        self.cache_m_time = response.cache_m_time;
        self.cache_dirty = response.cache_dirty;
        self.pen.clear();
        self.pen.set_available(response.pending_hp_changes);
        for changeset in response.disabled_hp_changes {
            self.pen.disable(changeset);
        }
        self.pen.replace(response.hp_changes);
        self.undo.clear();
        self.queue.clear();
        self.poll.record_poll(now, true);
        info!(
            session = %self.session_id,
            rec_id = ?self.rec_id,
            read_only = self.read_only,
            pending_changesets = self.pen.available().len(),
            "record loaded"
        );
        Ok(())
    }

    /// Flush, then ask the server to store the cached record. `force`
    /// overrides a cache made outdated by someone else's submission.
    pub fn submit(&mut self, force: bool) -> Result<(), EngineError> {
        self.ensure_editable()?;
        if let FlushOutcome::Failed(e) = self.flush_now()? {
            return Err(e.into());
        }
        let response = self.send(EditRequest::Submit { force })?;
        self.interpret(&response)?;
        info!(session = %self.session_id, rec_id = ?self.rec_id, force, "record submitted");
        self.reset();
        Ok(())
    }

    /// Drop every unsubmitted change, here and on the server.
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        self.queue.clear();
        let response = self.send(EditRequest::Cancel)?;
        self.interpret(&response)?;
        info!(session = %self.session_id, rec_id = ?self.rec_id, "editing cancelled");
        self.reset();
        Ok(())
    }

    /// Leave the record, keeping the server cache for a later session.
    pub fn close(&mut self) -> Result<FlushOutcome, EngineError> {
        let outcome = if self.rec_id.is_some() {
            self.flush_now()?
        } else {
            FlushOutcome::Empty
        };
        self.reset();
        Ok(outcome)
    }

    fn reset(&mut self) {
        self.rec_id = None;
        self.revision = None;
        self.record = Record::new();
        self.cache_m_time = None;
        self.cache_dirty = false;
        self.read_only = false;
        self.undo.clear();
        self.pen.clear();
        self.queue.clear();
        self.poll.stop();
    }

    fn ensure_loaded(&self) -> Result<RecId, EngineError> {
        self.rec_id.ok_or(EngineError::NoRecordLoaded)
    }

    fn ensure_editable(&self) -> Result<RecId, EngineError> {
        let rec_id = self.ensure_loaded()?;
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        Ok(rec_id)
    }

    // =========================================================================
    // Server exchange
    // =========================================================================

    fn allocate_id(&mut self) -> TransactionId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    fn envelope(&mut self, request: EditRequest, undo_redo: Option<UndoRedo>) -> RequestEnvelope {
        RequestEnvelope {
            rec_id: self.rec_id,
            id: self.allocate_id(),
            cache_m_time: self.cache_m_time,
            undo_redo,
            request,
        }
    }

    /// Send a request straight away, outside the queue.
    fn send(&mut self, request: EditRequest) -> Result<Response, EngineError> {
        let envelope = self.envelope(request, None);
        debug!(id = %envelope.id, kind = envelope.request.request_type(), "sending");
        Ok(self.transport.send(&envelope)?)
    }

    /// Map a response onto local state and an outcome. Session expiry and
    /// records that became unavailable end the session.
    fn interpret(&mut self, response: &Response) -> Result<(), EngineError> {
        if let Some(mtime) = response.cache_m_time {
            self.cache_m_time = Some(mtime);
        }
        let code = response.result_code;
        if response.cache_outdated || code == ResultCode::CACHE_CHANGED {
            warn!(rec_id = ?self.rec_id, "cache outdated by another submission");
            return Err(EngineError::CacheOutdated);
        }
        match code.class() {
            ResultClass::Report => Ok(()),
            ResultClass::SessionExpired => {
                warn!(rec_id = ?self.rec_id, "session expired");
                let rec_id = self.rec_id;
                self.reset();
                Err(EngineError::SessionExpired(rec_id))
            }
            ResultClass::RecordUnavailable => {
                warn!(rec_id = ?self.rec_id, %code, "record unavailable");
                self.reset();
                Err(EngineError::RecordUnavailable(code))
            }
            ResultClass::InvalidContent => {
                warn!(rec_id = ?self.rec_id, errors = response.errors.len(), "invalid content");
                Err(EngineError::InvalidContent(response.errors.clone()))
            }
            ResultClass::Error => {
                warn!(rec_id = ?self.rec_id, %code, "request failed");
                Err(EngineError::Server(code))
            }
        }
    }

    fn enqueue_all(&mut self, requests: Vec<EditRequest>, undo_redo: Option<UndoRedo>) {
        for request in requests {
            let envelope = self.envelope(request, undo_redo);
            self.queue.enqueue(&envelope);
        }
    }

    /// Send everything queued as one bulk request. A lost request is logged
    /// and reported as `FlushOutcome::Failed`, not as an error.
    pub fn flush_now(&mut self) -> Result<FlushOutcome, EngineError> {
        let now = self.clock.now_ms()?;
        let id = self.allocate_id();
        let outcome = self
            .queue
            .flush(&mut self.transport, self.rec_id, id, self.cache_m_time, now);
        if let FlushOutcome::Sent(response) = &outcome {
            self.cache_dirty = true;
            self.interpret(response)?;
        }
        Ok(outcome)
    }

    /// Periodic housekeeping: auto-flush once the queue is due, then poll the
    /// server if the backoff says so.
    pub fn tick(&mut self) -> Result<TickOutcome, EngineError> {
        let now = self.clock.now_ms()?;
        let mut outcome = TickOutcome::default();
        if self.queue.should_auto_flush(now) {
            outcome.flush = Some(self.flush_now()?);
        }
        if self.rec_id.is_some() && self.poll.is_due(now) {
            outcome.refreshed = self.poll_server()?;
        }
        Ok(outcome)
    }

    pub fn focus_regained(&mut self) -> Result<(), EngineError> {
        let now = self.clock.now_ms()?;
        self.poll.on_focus_regained(now);
        Ok(())
    }

    /// Re-fetch the record and reload it if the server cache changed behind
    /// our back. Returns whether it did.
    pub fn poll_server(&mut self) -> Result<bool, EngineError> {
        let rec_id = self.ensure_loaded()?;
        self.flush_now()?;
        let known = self.cache_m_time;
        let response = self.send(EditRequest::GetRecord {
            record_revision: self.revision.clone(),
            delete_record_cache: false,
            in_read_only_mode: self.read_only,
        })?;
        let changed = response.cache_m_time.is_some() && response.cache_m_time != known;
        self.interpret(&response)?;
        let now = self.clock.now_ms()?;
        if changed && response.record.is_some() {
            info!(%rec_id, "server cache changed, reloading");
            let (revision, read_only) = (self.revision.clone(), self.read_only);
            self.install(response, revision, read_only)?;
        }
        self.poll.record_poll(now, changed);
        Ok(changed)
    }

    // =========================================================================
    // Editing
    // =========================================================================

    fn perform(&mut self, op: UndoOperation) -> Result<(), EngineError> {
        let requests = replay(&op, ReplayDirection::Forward, &mut self.record, &mut self.pen)?;
        debug!(kind = op.kind_name(), requests = requests.len(), "performed");
        self.undo.record(op);
        self.enqueue_all(requests, None);
        Ok(())
    }

    fn check_protected(&self, marc: &str) -> Result<(), EngineError> {
        Ok(self.config.protected_fields.check(marc)?)
    }

    /// The field address and every subfield address.
    fn check_protected_field(&self, tag: &str, field: &Field) -> Result<(), EngineError> {
        self.check_protected(&marc_address(tag, field, None))?;
        for i in 0..field.subfields.len() {
            self.check_protected(&marc_address(tag, field, Some(i)))?;
        }
        Ok(())
    }

    /// Add a data field at its ordered position. Returns that position.
    pub fn add_field(
        &mut self,
        tag: &str,
        ind1: char,
        ind2: char,
        subfields: Vec<Subfield>,
    ) -> Result<usize, EngineError> {
        self.ensure_editable()?;
        if !validation::is_data_tag(tag) || validation::is_control_tag(tag) {
            return Err(CoreError::InvalidTag(tag.to_string()).into());
        }
        let field = Field::data(ind1, ind2, subfields);
        validation::validate_field(tag, &field)?;
        self.check_protected_field(tag, &field)?;
        let field_position = self.record.field_position_for(tag, &field);
        self.perform(UndoOperation::AddField {
            tag: tag.to_string(),
            field_position,
            field,
        })?;
        Ok(field_position)
    }

    pub fn add_control_field(&mut self, tag: &str, value: &str) -> Result<usize, EngineError> {
        self.ensure_editable()?;
        if !validation::is_control_tag(tag) {
            return Err(CoreError::InvalidTag(tag.to_string()).into());
        }
        let field = Field::control(value);
        validation::validate_field(tag, &field)?;
        self.check_protected(tag)?;
        let field_position = self.record.field_position_for(tag, &field);
        self.perform(UndoOperation::AddField {
            tag: tag.to_string(),
            field_position,
            field,
        })?;
        Ok(field_position)
    }

    /// Append subfields to an existing data field.
    pub fn add_subfields(
        &mut self,
        tag: &str,
        field_position: usize,
        subfields: Vec<Subfield>,
    ) -> Result<(), EngineError> {
        self.ensure_editable()?;
        if subfields.is_empty() {
            return Err(CoreError::EmptyField(tag.to_string()).into());
        }
        let field = self.record.field(tag, field_position)?;
        if field.is_control() {
            return Err(CoreError::InvalidData(format!("{tag} is a control field")).into());
        }
        let address = marc_address(tag, field, None);
        for sf in &subfields {
            validation::validate_subfield_code(sf.code)?;
            self.check_protected(&format!("{address}{}", sf.code))?;
        }
        let first_subfield = field.subfields.len();
        self.perform(UndoOperation::AddSubfields {
            tag: tag.to_string(),
            field_position,
            first_subfield,
            subfields,
        })
    }

    /// Delete the selected fields and subfields in one undoable step.
    /// Selecting every subfield of a field deletes the field.
    ///
    /// Positions refer to the record before the deletion.
    pub fn delete_fields(&mut self, selection: &DeleteSelection) -> Result<(), EngineError> {
        self.ensure_editable()?;
        let mut fields = Vec::new();
        let mut subfields = Vec::new();
        for (tag, position, indices) in selection.iter() {
            let field = self.record.field(tag, position)?;
            let whole =
                indices.is_empty() || (0..field.subfields.len()).all(|i| indices.contains(&i));
            if whole {
                self.check_protected(&marc_address(tag, field, None))?;
                fields.push(DeletedField {
                    tag: tag.to_string(),
                    position,
                    field: field.clone(),
                });
                continue;
            }
            let mut indices = indices.to_vec();
            indices.sort_unstable();
            indices.dedup();
            for i in indices {
                let subfield = self.record.subfield(tag, position, i)?.clone();
                self.check_protected(&marc_address(tag, field, Some(i)))?;
                subfields.push(DeletedSubfield {
                    tag: tag.to_string(),
                    field_position: position,
                    subfield_position: i,
                    subfield,
                });
            }
        }
        if fields.is_empty() && subfields.is_empty() {
            return Ok(());
        }
        self.perform(UndoOperation::DeleteFields { fields, subfields })
    }

    pub fn move_field(
        &mut self,
        tag: &str,
        field_position: usize,
        direction: Direction,
    ) -> Result<(), EngineError> {
        self.ensure_editable()?;
        self.record.field(tag, field_position)?;
        if direction
            .neighbour(field_position, self.record.field_count(tag))
            .is_none()
        {
            return Err(EngineError::InvalidMove(format!(
                "{tag}[{field_position}] {direction:?}"
            )));
        }
        self.perform(UndoOperation::MoveField {
            tag: tag.to_string(),
            field_position,
            direction,
        })
    }

    pub fn move_subfield(
        &mut self,
        tag: &str,
        field_position: usize,
        subfield_position: usize,
        direction: Direction,
    ) -> Result<(), EngineError> {
        self.ensure_editable()?;
        let len = self.record.field(tag, field_position)?.subfields.len();
        self.record.subfield(tag, field_position, subfield_position)?;
        if direction.neighbour(subfield_position, len).is_none() {
            return Err(EngineError::InvalidMove(format!(
                "{tag}[{field_position}][{subfield_position}] {direction:?}"
            )));
        }
        self.perform(UndoOperation::MoveSubfield {
            tag: tag.to_string(),
            field_position,
            subfield_position,
            direction,
        })
    }

    /// Change a subfield value, or the value of a control field when
    /// `subfield_position` is `None`. Unchanged content queues nothing.
    pub fn change_content(
        &mut self,
        tag: &str,
        field_position: usize,
        subfield_position: Option<usize>,
        value: &str,
    ) -> Result<(), EngineError> {
        self.ensure_editable()?;
        let field = self.record.field(tag, field_position)?;
        let old_value = match subfield_position {
            Some(i) => self.record.subfield(tag, field_position, i)?.value.clone(),
            None if field.is_control() => field.control_value.clone(),
            None => {
                return Err(CoreError::InvalidData(format!("{tag} is not a control field")).into());
            }
        };
        let address = marc_address(tag, field, subfield_position);
        if value.is_empty() {
            return Err(CoreError::EmptyField(address).into());
        }
        self.check_protected(&address)?;
        if old_value == value {
            return Ok(());
        }
        self.perform(UndoOperation::ChangeContent {
            tag: tag.to_string(),
            field_position,
            subfield_position,
            old_value,
            new_value: value.to_string(),
        })
    }

    pub fn change_subfield_code(
        &mut self,
        tag: &str,
        field_position: usize,
        subfield_position: usize,
        code: char,
    ) -> Result<(), EngineError> {
        self.ensure_editable()?;
        validation::validate_subfield_code(code)?;
        let field = self.record.field(tag, field_position)?;
        let old_code = self.record.subfield(tag, field_position, subfield_position)?.code;
        self.check_protected(&marc_address(tag, field, Some(subfield_position)))?;
        self.check_protected(&format!("{}{code}", marc_address(tag, field, None)))?;
        if old_code == code {
            return Ok(());
        }
        self.perform(UndoOperation::ChangeSubfieldCode {
            tag: tag.to_string(),
            field_position,
            subfield_position,
            old_code,
            new_code: code,
        })
    }

    /// Move a field under another tag and/or indicator pair. Returns its new
    /// position.
    pub fn change_field_code(
        &mut self,
        tag: &str,
        field_position: usize,
        new_tag: &str,
        ind1: char,
        ind2: char,
    ) -> Result<usize, EngineError> {
        self.ensure_editable()?;
        validation::validate_tag(new_tag)?;
        let field = self.record.field(tag, field_position)?.clone();
        let control = validation::is_control_tag(tag);
        if control != validation::is_control_tag(new_tag) {
            return Err(CoreError::InvalidTag(new_tag.to_string()).into());
        }
        let new_indicators = if control {
            Indicators::blank()
        } else {
            validation::validate_indicator(ind1)?;
            validation::validate_indicator(ind2)?;
            Indicators(Indicators::normalize(ind1), Indicators::normalize(ind2))
        };
        let old_indicators = field.indicators();
        if new_tag == tag && new_indicators == old_indicators {
            return Ok(field_position);
        }

        let mut moved = field.clone();
        moved.ind1 = new_indicators.0;
        moved.ind2 = new_indicators.1;
        self.check_protected(&marc_address(tag, &field, None))?;
        self.check_protected_field(new_tag, &moved)?;

        let mut scratch = self.record.clone();
        scratch.delete_field(tag, field_position)?;
        let new_position = scratch.field_position_for(new_tag, &moved);
        self.perform(UndoOperation::ChangeFieldCode {
            old_tag: tag.to_string(),
            old_position: field_position,
            old_indicators,
            new_tag: new_tag.to_string(),
            new_position,
            new_indicators,
        })?;
        Ok(new_position)
    }

    /// Replace every subfield of a data field at once.
    pub fn change_field(
        &mut self,
        tag: &str,
        field_position: usize,
        subfields: Vec<Subfield>,
    ) -> Result<(), EngineError> {
        self.ensure_editable()?;
        let old_field = self.record.field(tag, field_position)?.clone();
        if old_field.is_control() {
            return Err(CoreError::InvalidData(format!("{tag} is a control field")).into());
        }
        let new_field = Field::data(old_field.ind1, old_field.ind2, subfields);
        validation::validate_field(tag, &new_field)?;
        self.check_protected_field(tag, &new_field)?;
        if new_field == old_field {
            return Ok(());
        }
        self.perform(UndoOperation::ChangeField {
            tag: tag.to_string(),
            field_position,
            old_field,
            new_field,
        })
    }

    // =========================================================================
    // Holding Pen
    // =========================================================================

    /// Changes that would turn the current record into `proposed`.
    pub fn compute_hp_changes(&self, proposed: &Record) -> Vec<HpChange> {
        let options = DiffOptions {
            report_removed: self.config.report_removed,
        };
        filter_changes(diff_records(&self.record, proposed, &options))
            .into_iter()
            .map(HpChange::new)
            .collect()
    }

    /// Show the differences between the record and a changeset's proposed
    /// revision. Refused while earlier changes are still unprocessed.
    /// Returns the number of changes shown.
    pub fn visualize_hp_changeset(
        &mut self,
        changeset_number: u64,
        proposed: &Record,
    ) -> Result<usize, EngineError> {
        self.ensure_editable()?;
        if self.pen.has_pending() {
            return Err(EngineError::UnprocessedChanges);
        }
        let changes_after = self.compute_hp_changes(proposed);
        let count = changes_after.len();
        self.perform(UndoOperation::VisualizeHpChangeset {
            changeset_number,
            changes_before: self.pen.changes().to_vec(),
            changes_after,
        })?;
        info!(changeset_number, count, "holding pen changeset shown");
        Ok(count)
    }

    /// The proposed record of a changeset, fetched once and then cached.
    pub fn fetch_hp_changeset(&mut self, changeset_number: u64) -> Result<Record, EngineError> {
        self.ensure_loaded()?;
        if let Some(record) = self.pen.loaded_changeset(changeset_number) {
            return Ok(record.clone());
        }
        let response = self.send(EditRequest::GetHoldingPenUpdateDetails { changeset_number })?;
        if response.result_code == ResultCode::NO_CHANGESET {
            return Err(EngineError::HpChangesetNotFound(changeset_number));
        }
        self.interpret(&response)?;
        let record = response
            .new_record
            .ok_or(EngineError::HpChangesetNotFound(changeset_number))?;
        self.pen.cache_changeset(changeset_number, record.clone());
        Ok(record)
    }

    /// Fetch a changeset and show it.
    pub fn review_hp_changeset(&mut self, changeset_number: u64) -> Result<usize, EngineError> {
        let proposed = self.fetch_hp_changeset(changeset_number)?;
        self.visualize_hp_changeset(changeset_number, &proposed)
    }

    fn build_hp_apply(&self, number: usize) -> Result<UndoOperation, EngineError> {
        let change = self.pen.change(number)?;
        if change.applied_change {
            return Err(EngineError::HpChangeAlreadyProcessed(number));
        }
        let mut superseded = Vec::new();
        let mut shifted = Vec::new();
        let operation = match &change.change {
            ChangeDescriptor::FieldAdded { tag, .. } => {
                let field = change
                    .change
                    .proposed_field()
                    .ok_or_else(|| EngineError::ChangeNotApplicable(tag.clone()))?;
                let field_position = self.record.field_position_for(tag, &field);
                shifted = self.pen.after_insertion(number, tag, field_position);
                UndoOperation::AddField {
                    tag: tag.clone(),
                    field_position,
                    field,
                }
            }
            ChangeDescriptor::FieldRemoved {
                tag,
                field_position,
                ..
            } => {
                let field = self.record.field(tag, *field_position)?.clone();
                (superseded, shifted) = self.pen.after_removal(number, tag, *field_position);
                UndoOperation::DeleteFields {
                    fields: vec![DeletedField {
                        tag: tag.clone(),
                        position: *field_position,
                        field,
                    }],
                    subfields: Vec::new(),
                }
            }
            ChangeDescriptor::FieldChanged {
                tag,
                field_position,
                ..
            } => {
                let old_field = self.record.field(tag, *field_position)?.clone();
                let new_field = change
                    .change
                    .proposed_field()
                    .ok_or_else(|| EngineError::ChangeNotApplicable(tag.clone()))?;
                UndoOperation::ChangeField {
                    tag: tag.clone(),
                    field_position: *field_position,
                    old_field,
                    new_field,
                }
            }
            ChangeDescriptor::SubfieldAdded {
                tag,
                field_position,
                subfield_code,
                subfield_content,
                ..
            } => UndoOperation::AddSubfields {
                tag: tag.clone(),
                field_position: *field_position,
                first_subfield: self.record.field(tag, *field_position)?.subfields.len(),
                subfields: vec![Subfield::new(*subfield_code, subfield_content.clone())],
            },
            ChangeDescriptor::SubfieldRemoved {
                tag,
                field_position,
                subfield_position,
                ..
            } => UndoOperation::DeleteFields {
                fields: Vec::new(),
                subfields: vec![DeletedSubfield {
                    tag: tag.clone(),
                    field_position: *field_position,
                    subfield_position: *subfield_position,
                    subfield: self
                        .record
                        .subfield(tag, *field_position, *subfield_position)?
                        .clone(),
                }],
            },
            ChangeDescriptor::SubfieldChanged {
                tag,
                field_position,
                subfield_position,
                subfield_content,
                ..
            } => UndoOperation::ChangeContent {
                tag: tag.clone(),
                field_position: *field_position,
                subfield_position: Some(*subfield_position),
                old_value: self
                    .record
                    .subfield(tag, *field_position, *subfield_position)?
                    .value
                    .clone(),
                new_value: subfield_content.clone(),
            },
            ChangeDescriptor::SubfieldSame { tag, .. } => {
                return Err(EngineError::ChangeNotApplicable(format!(
                    "{tag}: unchanged subfield"
                )));
            }
        };
        Ok(UndoOperation::ApplyHpChange {
            change_number: number,
            operation: Box::new(operation),
            superseded,
            shifted,
        })
    }

    pub fn apply_hp_change(&mut self, number: usize) -> Result<(), EngineError> {
        self.ensure_editable()?;
        let op = self.build_hp_apply(number)?;
        self.perform(op)
    }

    /// Mark a change as dealt with without touching the record.
    pub fn reject_hp_change(&mut self, number: usize) -> Result<(), EngineError> {
        self.ensure_editable()?;
        if self.pen.change(number)?.applied_change {
            return Err(EngineError::HpChangeAlreadyProcessed(number));
        }
        self.perform(UndoOperation::ApplyHpChange {
            change_number: number,
            operation: Box::new(UndoOperation::NoOperation),
            superseded: Vec::new(),
            shifted: Vec::new(),
        })
    }

    /// Apply the listed changes in order, each against the record as left by
    /// the previous one. Changes superseded on the way are skipped. On error
    /// everything applied so far is reversed.
    fn apply_hp_batch(
        &mut self,
        numbers: Vec<usize>,
    ) -> Result<(Vec<UndoOperation>, Vec<EditRequest>), EngineError> {
        let mut operations: Vec<UndoOperation> = Vec::new();
        let mut requests = Vec::new();
        for number in numbers {
            if self.pen.change(number)?.applied_change {
                continue;
            }
            let step = self.build_hp_apply(number).and_then(|op| {
                let produced =
                    replay_step(&op, ReplayDirection::Forward, &mut self.record, &mut self.pen)?;
                Ok((op, produced))
            });
            match step {
                Ok((op, produced)) => {
                    operations.push(op);
                    requests.extend(produced);
                }
                Err(e) => {
                    for op in operations.iter().rev() {
                        if let Err(undo_err) = replay_step(
                            op,
                            ReplayDirection::Backward,
                            &mut self.record,
                            &mut self.pen,
                        ) {
                            warn!(error = %undo_err, "could not roll back holding pen change");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok((operations, requests))
    }

    fn record_batch(&mut self, op: UndoOperation, mut requests: Vec<EditRequest>) {
        requests.extend(holding_pen_update(&op, ReplayDirection::Forward, &self.pen));
        debug!(kind = op.kind_name(), requests = requests.len(), "performed");
        self.undo.record(op);
        self.enqueue_all(requests, None);
    }

    /// Apply every pending change as one undoable step and send it at once:
    /// additions and modifications first, then subfield removals, then field
    /// removals, then the change list is cleared. Returns how many changes
    /// were applied. Nothing is recorded or sent when no change is pending.
    ///
    /// The bulk request is not retried if it is lost; the record keeps the
    /// applied changes locally.
    pub fn apply_all_hp_changes(&mut self) -> Result<usize, EngineError> {
        self.ensure_editable()?;
        if !self.pen.has_pending() {
            return Ok(0);
        }
        let order: Vec<usize> = self.pen.aggregate().ordered().collect();
        let (mut operations, mut requests) = self.apply_hp_batch(order)?;
        let applied = operations.len();

        let clear = UndoOperation::RemoveAllHpChanges {
            changes: self.pen.changes().to_vec(),
        };
        requests.extend(replay_step(
            &clear,
            ReplayDirection::Forward,
            &mut self.record,
            &mut self.pen,
        )?);
        operations.push(clear);

        self.record_batch(UndoOperation::ApplyHpChanges { operations }, requests);
        info!(applied, "all holding pen changes applied");
        if let FlushOutcome::Failed(e) = self.flush_now()? {
            warn!(error = %e, applied, "applied holding pen changes were not sent");
        }
        Ok(applied)
    }

    /// Apply the pending reference (`999C5`) changes as one undoable step.
    pub fn apply_all_references(&mut self) -> Result<usize, EngineError> {
        self.ensure_editable()?;
        let references = self.pen.reference_changes();
        let (operations, requests) = self.apply_hp_batch(references)?;
        let applied = operations.len();
        if applied > 0 {
            self.record_batch(
                UndoOperation::BulkOperation {
                    label: "apply references".to_string(),
                    operations,
                },
                requests,
            );
        }
        Ok(applied)
    }

    /// Hide every shown change, applied or not.
    pub fn reject_all_hp_changes(&mut self) -> Result<(), EngineError> {
        self.ensure_editable()?;
        if self.pen.changes().is_empty() {
            return Ok(());
        }
        self.perform(UndoOperation::RemoveAllHpChanges {
            changes: self.pen.changes().to_vec(),
        })
    }

    /// Delete a changeset on the server. This cannot be undone.
    pub fn delete_hp_changeset(&mut self, changeset_number: u64) -> Result<(), EngineError> {
        self.ensure_editable()?;
        let response = self.send(EditRequest::DeleteHoldingPenChangeset { changeset_number })?;
        if response.result_code == ResultCode::NO_CHANGESET {
            return Err(EngineError::HpChangesetNotFound(changeset_number));
        }
        self.interpret(&response)?;
        self.pen.remove_changeset(changeset_number);
        info!(changeset_number, "holding pen changeset deleted");
        Ok(())
    }

    // =========================================================================
    // Undo / Redo
    // =========================================================================

    pub fn undo(&mut self) -> Result<UndoOutcome, EngineError> {
        self.ensure_editable()?;
        let Some(op) = self.undo.pop_undo() else {
            debug!("nothing to undo");
            return Ok(UndoOutcome::Empty);
        };
        match replay(&op, ReplayDirection::Backward, &mut self.record, &mut self.pen) {
            Ok(requests) => {
                let description = op.description();
                debug!(kind = op.kind_name(), "undone");
                self.undo.push_redo(op);
                self.enqueue_all(requests, Some(UndoRedo::Undo));
                Ok(UndoOutcome::Applied(description))
            }
            Err(e) => {
                self.undo.push_undo(op);
                Err(e)
            }
        }
    }

    pub fn redo(&mut self) -> Result<UndoOutcome, EngineError> {
        self.ensure_editable()?;
        let Some(op) = self.undo.pop_redo() else {
            debug!("nothing to redo");
            return Ok(UndoOutcome::Empty);
        };
        match replay(&op, ReplayDirection::Forward, &mut self.record, &mut self.pen) {
            Ok(requests) => {
                let description = op.description();
                debug!(kind = op.kind_name(), "redone");
                self.undo.push_undo(op);
                self.enqueue_all(requests, Some(UndoRedo::Redo));
                Ok(UndoOutcome::Applied(description))
            }
            Err(e) => {
                self.undo.push_redo(op);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Session cache
    // =========================================================================

    /// Persist the session so it can be resumed later. Returns the cache
    /// modification time.
    pub fn save_session<S: CacheStore>(
        &self,
        store: &mut S,
        uid: UserId,
    ) -> Result<u64, EngineError> {
        let rec_id = self.ensure_loaded()?;
        let (undo_list, redo_list) = self.undo.snapshot();
        let entry = CacheEntry {
            dirty: self.is_dirty(),
            revision: self.revision.clone(),
            record: self.record.clone(),
            pending_changes: self.pen.available().to_vec(),
            disabled_hp_changes: self.pen.disabled().collect(),
            hp_changes: self.pen.changes().to_vec(),
            undo_list,
            redo_list,
        };
        let now = self.clock.now_ms()?;
        let mtime = store.write_cache(rec_id, uid, &entry, now)?;
        debug!(%rec_id, %uid, mtime, "session saved");
        Ok(mtime)
    }

    /// Resume a saved session. Returns `false` when there is none or it has
    /// expired.
    pub fn restore_session<S: CacheStore>(
        &mut self,
        store: &S,
        rec_id: RecId,
        uid: UserId,
    ) -> Result<bool, EngineError> {
        let now = self.clock.now_ms()?;
        if store.cache_expired(rec_id, uid, now, self.config.cache_timeout_ms())? {
            debug!(%rec_id, %uid, "no live session cache");
            return Ok(false);
        }
        let Some(entry) = store.read_cache(rec_id, uid)? else {
            return Ok(false);
        };
        let mtime = store.cache_mtime(rec_id, uid)?;
        self.reset();
        self.rec_id = Some(rec_id);
        self.revision = entry.revision;
        self.record = entry.record;
        self.cache_m_time = mtime;
        self.cache_dirty = entry.dirty;
        self.pen.set_available(entry.pending_changes);
        for changeset in entry.disabled_hp_changes {
            self.pen.disable(changeset);
        }
        self.pen.replace(entry.hp_changes);
        self.undo.restore(entry.undo_list, entry.redo_list);
        info!(%rec_id, %uid, undo = self.undo.undo_depth(), "session restored");
        Ok(true)
    }
}
