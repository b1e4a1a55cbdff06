//! Replaying undo operations against the record and the holding-pen list.
//!
//! Forward replay performs (or redoes) an operation; backward replay reverses
//! it. Both mutate local state and return the requests that bring the server
//! cache to the same state.

use bibedit_core::request::HpChangesUpdate;
use bibedit_core::{
    DeleteSelection, DeletedField, DeletedSubfield, EditRequest, Indicators, Record,
    UndoOperation,
};

use crate::error::EngineError;
use crate::holding_pen::HoldingPen;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    Forward,
    Backward,
}

/// Replay `op` and, when it touched the holding-pen list, append the request
/// that overrides the server's copy of that list.
pub fn replay(
    op: &UndoOperation,
    direction: ReplayDirection,
    record: &mut Record,
    pen: &mut HoldingPen,
) -> Result<Vec<EditRequest>, EngineError> {
    let mut requests = replay_step(op, direction, record, pen)?;
    requests.extend(holding_pen_update(op, direction, pen));
    Ok(requests)
}

/// Replay without the trailing holding-pen update, for building composite
/// operations one child at a time.
pub(crate) fn replay_step(
    op: &UndoOperation,
    direction: ReplayDirection,
    record: &mut Record,
    pen: &mut HoldingPen,
) -> Result<Vec<EditRequest>, EngineError> {
    match direction {
        ReplayDirection::Forward => forward(op, record, pen),
        ReplayDirection::Backward => backward(op, record, pen),
    }
}

/// The `otherUpdateRequest` carrying the current change list, if `op` changed
/// it. Changesets shown by `op` are deactivated going forward and reactivated
/// going backward.
pub(crate) fn holding_pen_update(
    op: &UndoOperation,
    direction: ReplayDirection,
    pen: &HoldingPen,
) -> Option<EditRequest> {
    if !op.touches_holding_pen() {
        return None;
    }
    let mut changesets = Vec::new();
    visualized_changesets(op, &mut changesets);
    let (changesets_to_deactivate, changesets_to_activate) = match direction {
        ReplayDirection::Forward => (changesets, Vec::new()),
        ReplayDirection::Backward => (Vec::new(), changesets),
    };
    Some(EditRequest::OtherUpdateRequest {
        hp_changes: HpChangesUpdate {
            to_override: Some(pen.changes().to_vec()),
            changesets_to_deactivate,
            changesets_to_activate,
        },
    })
}

fn visualized_changesets(op: &UndoOperation, out: &mut Vec<u64>) {
    match op {
        UndoOperation::VisualizeHpChangeset {
            changeset_number, ..
        } => out.push(*changeset_number),
        UndoOperation::BulkOperation { operations, .. }
        | UndoOperation::ApplyHpChanges { operations } => {
            for child in operations {
                visualized_changesets(child, out);
            }
        }
        _ => {}
    }
}

fn forward(
    op: &UndoOperation,
    record: &mut Record,
    pen: &mut HoldingPen,
) -> Result<Vec<EditRequest>, EngineError> {
    let requests = match op {
        UndoOperation::AddField {
            tag,
            field_position,
            field,
        } => {
            record.insert_field(tag, *field_position, field.clone())?;
            vec![EditRequest::add_field(tag, *field_position, field)]
        }
        UndoOperation::AddSubfields {
            tag,
            field_position,
            first_subfield,
            subfields,
        } => {
            for (i, sf) in subfields.iter().enumerate() {
                record.insert_subfield(tag, *field_position, first_subfield + i, sf.clone())?;
            }
            vec![EditRequest::AddSubfields {
                tag: tag.clone(),
                field_position: *field_position,
                subfields: subfields.clone(),
            }]
        }
        UndoOperation::DeleteFields { fields, subfields } => {
            delete(record, fields, subfields)?;
            vec![EditRequest::DeleteFields {
                to_delete: selection(fields, subfields),
            }]
        }
        UndoOperation::MoveField {
            tag,
            field_position,
            direction,
        } => {
            let len = record.field_count(tag);
            let target = direction.neighbour(*field_position, len).ok_or_else(|| {
                EngineError::InvalidMove(format!("{tag}[{field_position}] {direction:?}"))
            })?;
            record.swap_fields(tag, *field_position, target)?;
            vec![EditRequest::MoveField {
                tag: tag.clone(),
                field_position: *field_position,
                direction: *direction,
            }]
        }
        UndoOperation::MoveSubfield {
            tag,
            field_position,
            subfield_position,
            direction,
        } => {
            let len = record.field(tag, *field_position)?.subfields.len();
            let target = direction.neighbour(*subfield_position, len).ok_or_else(|| {
                EngineError::InvalidMove(format!(
                    "{tag}[{field_position}][{subfield_position}] {direction:?}"
                ))
            })?;
            record.swap_subfields(tag, *field_position, *subfield_position, target)?;
            vec![EditRequest::MoveSubfield {
                tag: tag.clone(),
                field_position: *field_position,
                subfield_index: *subfield_position,
                new_subfield_index: target,
            }]
        }
        UndoOperation::ChangeContent {
            tag,
            field_position,
            subfield_position,
            new_value,
            ..
        } => set_content(record, tag, *field_position, *subfield_position, new_value)?,
        UndoOperation::ChangeSubfieldCode {
            tag,
            field_position,
            subfield_position,
            new_code,
            ..
        } => set_code(record, tag, *field_position, *subfield_position, *new_code)?,
        UndoOperation::ChangeFieldCode {
            old_tag,
            old_position,
            new_tag,
            new_position,
            new_indicators,
            ..
        } => retag(
            record,
            (old_tag, *old_position),
            (new_tag, *new_position),
            *new_indicators,
        )?,
        UndoOperation::ChangeField {
            tag,
            field_position,
            new_field,
            ..
        } => {
            record.replace_field(tag, *field_position, new_field.clone())?;
            vec![EditRequest::modify_field(tag, *field_position, new_field)]
        }
        UndoOperation::BulkOperation { operations, .. }
        | UndoOperation::ApplyHpChanges { operations } => {
            let mut requests = Vec::new();
            for child in operations {
                requests.extend(forward(child, record, pen)?);
            }
            requests
        }
        UndoOperation::ApplyHpChange {
            change_number,
            operation,
            superseded,
            shifted,
        } => {
            let requests = forward(operation, record, pen)?;
            pen.mark_applied(*change_number)?;
            for &n in superseded {
                pen.mark_applied(n)?;
            }
            pen.shift_positions(shifted, shift_delta(operation))?;
            requests
        }
        UndoOperation::VisualizeHpChangeset {
            changeset_number,
            changes_after,
            ..
        } => {
            pen.replace(changes_after.clone());
            pen.disable(*changeset_number);
            Vec::new()
        }
        UndoOperation::RemoveAllHpChanges { .. } => {
            pen.replace(Vec::new());
            Vec::new()
        }
        UndoOperation::NoOperation => Vec::new(),
    };
    Ok(requests)
}

fn backward(
    op: &UndoOperation,
    record: &mut Record,
    pen: &mut HoldingPen,
) -> Result<Vec<EditRequest>, EngineError> {
    let requests = match op {
        UndoOperation::AddField {
            tag,
            field_position,
            ..
        } => {
            record.delete_field(tag, *field_position)?;
            let mut sel = DeleteSelection::new();
            sel.select_field(tag, *field_position);
            vec![EditRequest::DeleteFields { to_delete: sel }]
        }
        UndoOperation::AddSubfields {
            tag,
            field_position,
            first_subfield,
            subfields,
        } => {
            let mut sel = DeleteSelection::new();
            for i in (0..subfields.len()).rev() {
                record.remove_subfield(tag, *field_position, first_subfield + i)?;
                sel.select_subfield(tag, *field_position, first_subfield + i);
            }
            vec![EditRequest::DeleteFields { to_delete: sel }]
        }
        UndoOperation::DeleteFields { fields, subfields } => {
            restore(record, fields, subfields)?
        }
        UndoOperation::MoveField {
            tag,
            field_position,
            direction,
        } => {
            let moved_to = direction.target(*field_position);
            record.swap_fields(tag, moved_to, *field_position)?;
            vec![EditRequest::MoveField {
                tag: tag.clone(),
                field_position: moved_to,
                direction: direction.reversed(),
            }]
        }
        UndoOperation::MoveSubfield {
            tag,
            field_position,
            subfield_position,
            direction,
        } => {
            let moved_to = direction.target(*subfield_position);
            record.swap_subfields(tag, *field_position, moved_to, *subfield_position)?;
            vec![EditRequest::MoveSubfield {
                tag: tag.clone(),
                field_position: *field_position,
                subfield_index: moved_to,
                new_subfield_index: *subfield_position,
            }]
        }
        UndoOperation::ChangeContent {
            tag,
            field_position,
            subfield_position,
            old_value,
            ..
        } => set_content(record, tag, *field_position, *subfield_position, old_value)?,
        UndoOperation::ChangeSubfieldCode {
            tag,
            field_position,
            subfield_position,
            old_code,
            ..
        } => set_code(record, tag, *field_position, *subfield_position, *old_code)?,
        UndoOperation::ChangeFieldCode {
            old_tag,
            old_position,
            old_indicators,
            new_tag,
            new_position,
            ..
        } => retag(
            record,
            (new_tag, *new_position),
            (old_tag, *old_position),
            *old_indicators,
        )?,
        UndoOperation::ChangeField {
            tag,
            field_position,
            old_field,
            ..
        } => {
            record.replace_field(tag, *field_position, old_field.clone())?;
            vec![EditRequest::modify_field(tag, *field_position, old_field)]
        }
        UndoOperation::BulkOperation { operations, .. }
        | UndoOperation::ApplyHpChanges { operations } => {
            let mut requests = Vec::new();
            for child in operations.iter().rev() {
                requests.extend(backward(child, record, pen)?);
            }
            requests
        }
        UndoOperation::ApplyHpChange {
            change_number,
            operation,
            superseded,
            shifted,
        } => {
            pen.shift_positions(shifted, -shift_delta(operation))?;
            for &n in superseded {
                pen.mark_reverted(n)?;
            }
            pen.mark_reverted(*change_number)?;
            backward(operation, record, pen)?
        }
        UndoOperation::VisualizeHpChangeset {
            changeset_number,
            changes_before,
            ..
        } => {
            pen.replace(changes_before.clone());
            pen.enable(*changeset_number);
            Vec::new()
        }
        UndoOperation::RemoveAllHpChanges { changes } => {
            pen.replace(changes.clone());
            Vec::new()
        }
        UndoOperation::NoOperation => Vec::new(),
    };
    Ok(requests)
}

/// Positions of other changes move up after a field insertion and down
/// after a field removal.
fn shift_delta(op: &UndoOperation) -> isize {
    match op {
        UndoOperation::AddField { .. } => 1,
        UndoOperation::DeleteFields { fields, .. } if !fields.is_empty() => -1,
        _ => 0,
    }
}

fn selection(fields: &[DeletedField], subfields: &[DeletedSubfield]) -> DeleteSelection {
    let mut sel = DeleteSelection::new();
    for f in fields {
        sel.select_field(&f.tag, f.position);
    }
    for sf in subfields {
        sel.select_subfield(&sf.tag, sf.field_position, sf.subfield_position);
    }
    sel
}

/// Entries are stored in ascending order; removing back to front keeps the
/// stored positions valid.
fn delete(
    record: &mut Record,
    fields: &[DeletedField],
    subfields: &[DeletedSubfield],
) -> Result<(), EngineError> {
    for sf in subfields.iter().rev() {
        record.remove_subfield(&sf.tag, sf.field_position, sf.subfield_position)?;
    }
    for f in fields.iter().rev() {
        record.delete_field(&f.tag, f.position)?;
    }
    Ok(())
}

fn restore(
    record: &mut Record,
    fields: &[DeletedField],
    subfields: &[DeletedSubfield],
) -> Result<Vec<EditRequest>, EngineError> {
    let mut requests = Vec::new();
    for f in fields {
        record.insert_field(&f.tag, f.position, f.field.clone())?;
        requests.push(EditRequest::add_field(&f.tag, f.position, &f.field));
    }
    let mut touched: Vec<(&str, usize)> = Vec::new();
    for sf in subfields {
        record.insert_subfield(&sf.tag, sf.field_position, sf.subfield_position, sf.subfield.clone())?;
        let key = (sf.tag.as_str(), sf.field_position);
        if !touched.contains(&key) {
            touched.push(key);
        }
    }
    for (tag, position) in touched {
        requests.push(EditRequest::modify_field(tag, position, record.field(tag, position)?));
    }
    Ok(requests)
}

fn set_content(
    record: &mut Record,
    tag: &str,
    position: usize,
    subfield: Option<usize>,
    value: &str,
) -> Result<Vec<EditRequest>, EngineError> {
    match subfield {
        Some(i) => record.set_subfield_value(tag, position, i, value)?,
        None => record.set_control_value(tag, position, value)?,
    };
    Ok(vec![EditRequest::ModifyContent {
        tag: tag.to_string(),
        field_position: position,
        subfield_index: subfield,
        value: value.to_string(),
    }])
}

fn set_code(
    record: &mut Record,
    tag: &str,
    position: usize,
    subfield: usize,
    code: char,
) -> Result<Vec<EditRequest>, EngineError> {
    record.set_subfield_code(tag, position, subfield, code)?;
    Ok(vec![EditRequest::ModifySubfieldCode {
        tag: tag.to_string(),
        field_position: position,
        subfield_index: subfield,
        subfield_code: code,
    }])
}

/// Move a field to another tag and indicator pair. `to.1` is the position
/// computed once the field has left `from`.
fn retag(
    record: &mut Record,
    from: (&str, usize),
    to: (&str, usize),
    indicators: Indicators,
) -> Result<Vec<EditRequest>, EngineError> {
    let mut field = record.delete_field(from.0, from.1)?;
    field.ind1 = indicators.0;
    field.ind2 = indicators.1;
    record.insert_field(to.0, to.1, field)?;
    Ok(vec![EditRequest::ModifyFieldTag {
        old_tag: from.0.to_string(),
        old_field_position: from.1,
        new_tag: to.0.to_string(),
        new_field_position: to.1,
        ind1: indicators.0,
        ind2: indicators.1,
    }])
}
