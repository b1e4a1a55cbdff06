use serde::{Deserialize, Serialize};

use crate::change::HpChange;
use crate::record::{Field, Indicators, Subfield};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }

    /// Neighbour index in this direction, if there is one below `len`.
    pub fn neighbour(self, index: usize, len: usize) -> Option<usize> {
        match self {
            Self::Up => index.checked_sub(1),
            Self::Down => (index + 1 < len).then_some(index + 1),
        }
    }

    /// Index the moved element ends up at.
    pub fn target(self, index: usize) -> usize {
        match self {
            Self::Up => index.saturating_sub(1),
            Self::Down => index + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedField {
    pub tag: String,
    pub position: usize,
    pub field: Field,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedSubfield {
    pub tag: String,
    pub field_position: usize,
    pub subfield_position: usize,
    pub subfield: Subfield,
}

/// A reversible editing step, as kept on the undo and redo stacks.
///
/// Every variant holds enough state to replay the step forward and backward
/// against the record and the holding-pen change list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum UndoOperation {
    AddField {
        tag: String,
        field_position: usize,
        field: Field,
    },
    AddSubfields {
        tag: String,
        field_position: usize,
        first_subfield: usize,
        subfields: Vec<Subfield>,
    },
    DeleteFields {
        fields: Vec<DeletedField>,
        subfields: Vec<DeletedSubfield>,
    },
    MoveField {
        tag: String,
        field_position: usize,
        direction: Direction,
    },
    MoveSubfield {
        tag: String,
        field_position: usize,
        subfield_position: usize,
        direction: Direction,
    },
    /// `subfield_position` is `None` for control fields.
    ChangeContent {
        tag: String,
        field_position: usize,
        subfield_position: Option<usize>,
        old_value: String,
        new_value: String,
    },
    ChangeSubfieldCode {
        tag: String,
        field_position: usize,
        subfield_position: usize,
        old_code: char,
        new_code: char,
    },
    ChangeFieldCode {
        old_tag: String,
        old_position: usize,
        old_indicators: Indicators,
        new_tag: String,
        new_position: usize,
        new_indicators: Indicators,
    },
    ChangeField {
        tag: String,
        field_position: usize,
        old_field: Field,
        new_field: Field,
    },
    BulkOperation {
        label: String,
        operations: Vec<UndoOperation>,
    },
    /// `superseded` lists other changes that targeted a field this one
    /// removed; they are marked applied along with it. `shifted` lists the
    /// changes whose field position moved by one because `operation` inserted
    /// or removed a field under their tag.
    ApplyHpChange {
        change_number: usize,
        operation: Box<UndoOperation>,
        #[serde(default)]
        superseded: Vec<usize>,
        #[serde(default)]
        shifted: Vec<usize>,
    },
    ApplyHpChanges {
        operations: Vec<UndoOperation>,
    },
    VisualizeHpChangeset {
        changeset_number: u64,
        changes_before: Vec<HpChange>,
        changes_after: Vec<HpChange>,
    },
    RemoveAllHpChanges {
        changes: Vec<HpChange>,
    },
    NoOperation,
}

impl UndoOperation {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::AddField { .. } => "add_field",
            Self::AddSubfields { .. } => "add_subfields",
            Self::DeleteFields { .. } => "delete_fields",
            Self::MoveField { .. } => "move_field",
            Self::MoveSubfield { .. } => "move_subfield",
            Self::ChangeContent { .. } => "change_content",
            Self::ChangeSubfieldCode { .. } => "change_subfield_code",
            Self::ChangeFieldCode { .. } => "change_field_code",
            Self::ChangeField { .. } => "change_field",
            Self::BulkOperation { .. } => "bulk_operation",
            Self::ApplyHpChange { .. } => "apply_hp_change",
            Self::ApplyHpChanges { .. } => "apply_hp_changes",
            Self::VisualizeHpChangeset { .. } => "visualize_hp_changeset",
            Self::RemoveAllHpChanges { .. } => "remove_all_hp_changes",
            Self::NoOperation => "no_operation",
        }
    }

    /// Whether replaying the operation changes the holding-pen change list.
    pub fn touches_holding_pen(&self) -> bool {
        match self {
            Self::ApplyHpChange { .. }
            | Self::ApplyHpChanges { .. }
            | Self::VisualizeHpChangeset { .. }
            | Self::RemoveAllHpChanges { .. } => true,
            Self::BulkOperation { operations, .. } => {
                operations.iter().any(UndoOperation::touches_holding_pen)
            }
            _ => false,
        }
    }

    /// Human-readable description for undo/redo controls.
    pub fn description(&self) -> String {
        match self {
            Self::AddField { tag, .. } => format!("add field {tag}"),
            Self::AddSubfields { tag, subfields, .. } => {
                format!("add {} subfield(s) to {tag}", subfields.len())
            }
            Self::DeleteFields { fields, subfields } => format!(
                "delete {} field(s) and {} subfield(s)",
                fields.len(),
                subfields.len()
            ),
            Self::MoveField { tag, .. } => format!("move field {tag}"),
            Self::MoveSubfield { tag, .. } => format!("move subfield in {tag}"),
            Self::ChangeContent { tag, .. } => format!("change content of {tag}"),
            Self::ChangeSubfieldCode { tag, .. } => format!("change subfield code in {tag}"),
            Self::ChangeFieldCode {
                old_tag, new_tag, ..
            } => format!("change field code {old_tag} to {new_tag}"),
            Self::ChangeField { tag, .. } => format!("change field {tag}"),
            Self::BulkOperation { label, .. } => label.clone(),
            Self::ApplyHpChange { operation, .. } => {
                format!("apply holding pen change ({})", operation.description())
            }
            Self::ApplyHpChanges { operations } => {
                format!("apply {} holding pen change(s)", operations.len())
            }
            Self::VisualizeHpChangeset {
                changeset_number, ..
            } => format!("show holding pen changeset {changeset_number}"),
            Self::RemoveAllHpChanges { .. } => "remove all holding pen changes".to_string(),
            Self::NoOperation => "no operation".to_string(),
        }
    }
}
