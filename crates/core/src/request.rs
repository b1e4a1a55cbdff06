//! JSON request and response shapes exchanged with the editing endpoint.
//!
//! Every request is a flat object `{recID, ID, requestType, ...}`; bulk
//! updates carry an ordered array of the single-operation shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::change::HpChange;
use crate::error::CoreError;
use crate::ids::{RecId, TransactionId};
use crate::operations::Direction;
use crate::record::{Field, Record, Subfield};
use crate::result_code::ResultCode;

type SelectionRepr = BTreeMap<String, BTreeMap<String, Vec<usize>>>;

/// Fields and subfields picked for deletion, as `{tag: {position: [subfield
/// indices]}}`. An empty index list selects the whole field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectionRepr", into = "SelectionRepr")]
pub struct DeleteSelection {
    entries: BTreeMap<String, BTreeMap<usize, Vec<usize>>>,
}

impl DeleteSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_field(&mut self, tag: &str, position: usize) -> &mut Self {
        self.entries
            .entry(tag.to_string())
            .or_default()
            .insert(position, Vec::new());
        self
    }

    /// Selecting a subfield of an already fully selected field is a no-op.
    pub fn select_subfield(&mut self, tag: &str, position: usize, subfield: usize) -> &mut Self {
        let fields = self.entries.entry(tag.to_string()).or_default();
        match fields.get_mut(&position) {
            Some(list) if list.is_empty() => {}
            Some(list) => {
                if !list.contains(&subfield) {
                    list.push(subfield);
                    list.sort_unstable();
                }
            }
            None => {
                fields.insert(position, vec![subfield]);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(tag, position, subfields)` in tag then position order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, &[usize])> {
        self.entries.iter().flat_map(|(tag, fields)| {
            fields
                .iter()
                .map(move |(pos, sfs)| (tag.as_str(), *pos, sfs.as_slice()))
        })
    }
}

impl TryFrom<SelectionRepr> for DeleteSelection {
    type Error = CoreError;

    fn try_from(repr: SelectionRepr) -> Result<Self, Self::Error> {
        let mut entries = BTreeMap::new();
        for (tag, fields) in repr {
            let mut parsed = BTreeMap::new();
            for (pos, sfs) in fields {
                let pos = pos
                    .parse::<usize>()
                    .map_err(|_| CoreError::InvalidData(format!("bad field position {pos:?}")))?;
                parsed.insert(pos, sfs);
            }
            if !parsed.is_empty() {
                entries.insert(tag, parsed);
            }
        }
        Ok(Self { entries })
    }
}

impl From<DeleteSelection> for SelectionRepr {
    fn from(sel: DeleteSelection) -> Self {
        sel.entries
            .into_iter()
            .map(|(tag, fields)| {
                let fields = fields
                    .into_iter()
                    .map(|(pos, sfs)| (pos.to_string(), sfs))
                    .collect();
                (tag, fields)
            })
            .collect()
    }
}

/// Holding-pen bookkeeping the server keeps alongside the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HpChangesUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_override: Option<Vec<HpChange>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changesets_to_deactivate: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changesets_to_activate: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "requestType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum EditRequest {
    /// `field_position` is where the server inserts the field; control fields
    /// carry `value` and no subfields.
    AddField {
        tag: String,
        field_position: usize,
        controlfield: bool,
        ind1: char,
        ind2: char,
        subfields: Vec<Subfield>,
        value: String,
    },
    AddSubfields {
        tag: String,
        field_position: usize,
        subfields: Vec<Subfield>,
    },
    DeleteFields {
        to_delete: DeleteSelection,
    },
    /// Without a subfield index the control value is replaced.
    ModifyContent {
        tag: String,
        field_position: usize,
        #[serde(default)]
        subfield_index: Option<usize>,
        value: String,
    },
    ModifySubfieldCode {
        tag: String,
        field_position: usize,
        subfield_index: usize,
        subfield_code: char,
    },
    ModifyFieldTag {
        old_tag: String,
        old_field_position: usize,
        new_tag: String,
        new_field_position: usize,
        ind1: char,
        ind2: char,
    },
    ModifyField {
        tag: String,
        field_position: usize,
        ind1: char,
        ind2: char,
        subfields: Vec<Subfield>,
        value: String,
    },
    MoveField {
        tag: String,
        field_position: usize,
        direction: Direction,
    },
    MoveSubfield {
        tag: String,
        field_position: usize,
        subfield_index: usize,
        new_subfield_index: usize,
    },
    OtherUpdateRequest {
        hp_changes: HpChangesUpdate,
    },
    DeleteHoldingPenChangeset {
        changeset_number: u64,
    },
    GetHoldingPenUpdateDetails {
        changeset_number: u64,
    },
    GetRecord {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_revision: Option<String>,
        #[serde(default)]
        delete_record_cache: bool,
        #[serde(default)]
        in_read_only_mode: bool,
    },
    Submit {
        #[serde(default)]
        force: bool,
    },
    Cancel,
    DeleteRecordCache,
    /// Queued requests, each with its own transaction number, applied by the
    /// server in order.
    ApplyBulkUpdates {
        requests_to_apply: Vec<RequestEnvelope>,
    },
}

impl EditRequest {
    pub fn request_type(&self) -> &'static str {
        match self {
            Self::AddField { .. } => "addField",
            Self::AddSubfields { .. } => "addSubfields",
            Self::DeleteFields { .. } => "deleteFields",
            Self::ModifyContent { .. } => "modifyContent",
            Self::ModifySubfieldCode { .. } => "modifySubfieldCode",
            Self::ModifyFieldTag { .. } => "modifyFieldTag",
            Self::ModifyField { .. } => "modifyField",
            Self::MoveField { .. } => "moveField",
            Self::MoveSubfield { .. } => "moveSubfield",
            Self::OtherUpdateRequest { .. } => "otherUpdateRequest",
            Self::DeleteHoldingPenChangeset { .. } => "deleteHoldingPenChangeset",
            Self::GetHoldingPenUpdateDetails { .. } => "getHoldingPenUpdateDetails",
            Self::GetRecord { .. } => "getRecord",
            Self::Submit { .. } => "submit",
            Self::Cancel => "cancel",
            Self::DeleteRecordCache => "deleteRecordCache",
            Self::ApplyBulkUpdates { .. } => "applyBulkUpdates",
        }
    }

    pub fn add_field(tag: &str, position: usize, field: &Field) -> Self {
        Self::AddField {
            tag: tag.to_string(),
            field_position: position,
            controlfield: field.is_control(),
            ind1: field.ind1,
            ind2: field.ind2,
            subfields: field.subfields.clone(),
            value: field.control_value.clone(),
        }
    }

    pub fn modify_field(tag: &str, position: usize, field: &Field) -> Self {
        Self::ModifyField {
            tag: tag.to_string(),
            field_position: position,
            ind1: field.ind1,
            ind2: field.ind2,
            subfields: field.subfields.clone(),
            value: field.control_value.clone(),
        }
    }

    /// Requests that change record content and may be batched.
    pub fn is_record_update(&self) -> bool {
        matches!(
            self,
            Self::AddField { .. }
                | Self::AddSubfields { .. }
                | Self::DeleteFields { .. }
                | Self::ModifyContent { .. }
                | Self::ModifySubfieldCode { .. }
                | Self::ModifyFieldTag { .. }
                | Self::ModifyField { .. }
                | Self::MoveField { .. }
                | Self::MoveSubfield { .. }
                | Self::OtherUpdateRequest { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UndoRedo {
    Undo,
    Redo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "recID", default, skip_serializing_if = "Option::is_none")]
    pub rec_id: Option<RecId>,
    #[serde(rename = "ID")]
    pub id: TransactionId,
    #[serde(rename = "cacheMTime", default, skip_serializing_if = "Option::is_none")]
    pub cache_m_time: Option<u64>,
    #[serde(rename = "undoRedo", default, skip_serializing_if = "Option::is_none")]
    pub undo_redo: Option<UndoRedo>,
    #[serde(flatten)]
    pub request: EditRequest,
}

impl RequestEnvelope {
    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Summary of a holding-pen changeset waiting for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetSummary {
    pub changeset_number: u64,
    #[serde(default)]
    pub changeset_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub result_code: ResultCode,
    #[serde(rename = "recID", default, skip_serializing_if = "Option::is_none")]
    pub rec_id: Option<RecId>,
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TransactionId>,
    #[serde(rename = "cacheMTime", default, skip_serializing_if = "Option::is_none")]
    pub cache_m_time: Option<u64>,
    #[serde(default)]
    pub cache_dirty: bool,
    #[serde(default)]
    pub cache_outdated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_revision: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_hp_changes: Vec<ChangesetSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_hp_changes: Vec<u64>,
    /// Changes already visualised in an earlier session on this cache.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hp_changes: Vec<HpChange>,
    /// Proposed record of a changeset, for `getHoldingPenUpdateDetails`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_record: Option<Record>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Response {
    pub fn with_code(result_code: ResultCode) -> Self {
        Self {
            result_code,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_is_flat_json() {
        let env = RequestEnvelope {
            rec_id: Some(RecId(7)),
            id: TransactionId(3),
            cache_m_time: Some(1000),
            undo_redo: None,
            request: EditRequest::MoveField {
                tag: "700".into(),
                field_position: 1,
                direction: Direction::Up,
            },
        };
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "recID": 7,
                "ID": 3,
                "cacheMTime": 1000,
                "requestType": "moveField",
                "tag": "700",
                "fieldPosition": 1,
                "direction": "up"
            })
        );
        let back = RequestEnvelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn delete_selection_wire_shape() {
        let mut sel = DeleteSelection::new();
        sel.select_field("100", 2).select_subfield("245", 0, 1);
        sel.select_subfield("100", 2, 0);
        let req = EditRequest::DeleteFields { to_delete: sel };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "requestType": "deleteFields",
                "toDelete": {"100": {"2": []}, "245": {"0": [1]}}
            })
        );
        let back: EditRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn bulk_request_nests_operations_in_order() {
        let envelope = |id, request| RequestEnvelope {
            rec_id: Some(RecId(1)),
            id: TransactionId(id),
            cache_m_time: None,
            undo_redo: Some(UndoRedo::Undo),
            request,
        };
        let bulk = EditRequest::ApplyBulkUpdates {
            requests_to_apply: vec![
                envelope(1, EditRequest::Cancel),
                envelope(
                    2,
                    EditRequest::ModifyContent {
                        tag: "005".into(),
                        field_position: 0,
                        subfield_index: None,
                        value: "x".into(),
                    },
                ),
            ],
        };
        let value = serde_json::to_value(&bulk).unwrap();
        assert_eq!(value["requestsToApply"][0]["requestType"], "cancel");
        assert_eq!(value["requestsToApply"][1]["requestType"], "modifyContent");
        assert_eq!(value["requestsToApply"][1]["ID"], 2);
        assert_eq!(value["requestsToApply"][1]["undoRedo"], "undo");
        let back: EditRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, bulk);
    }

    #[test]
    fn response_defaults() {
        let resp = Response::from_json(r#"{"resultCode": 107, "recID": 4}"#).unwrap();
        assert_eq!(resp.result_code, ResultCode::CACHE_CHANGED);
        assert_eq!(resp.rec_id, Some(RecId(4)));
        assert!(resp.errors.is_empty());
        assert!(resp.record.is_none());
    }
}
