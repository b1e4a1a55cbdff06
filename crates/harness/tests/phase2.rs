//! Record comparison and the Holding Pen review workflow: showing a
//! changeset, applying or rejecting its changes one at a time or all at
//! once, and undoing each of those steps.

use bibedit_core::{
    ChangeDescriptor, EditRequest, Field, HpChange, Indicators, RecId, Record, Subfield,
};
use bibedit_engine::{
    DiffOptions, EngineError, TransportError, UndoOutcome, diff_records, filter_changes,
};
use bibedit_harness::{START_MS, TEST_USER, TestSession, article, data_field};
use bibedit_storage::{CacheEntry, CacheStore};

const REC: RecId = RecId(42);

fn kinds(changes: &[HpChange]) -> Vec<&'static str> {
    changes.iter().map(|c| c.change.change_type_name()).collect()
}

fn values(record: &Record, tag: &str) -> Vec<String> {
    record
        .fields(tag)
        .iter()
        .map(|f| f.subfields[0].value.clone())
        .collect()
}

/// The article as a harvester would revise it: retitled, one co-author
/// dropped and a collection field added.
fn revised() -> Result<Record, Box<dyn std::error::Error>> {
    let mut record = article();
    record.set_subfield_value("245", 0, 0, "On bibliographic records, revisited")?;
    record.delete_field("700", 1)?;
    record.add_field("980", data_field(' ', ' ', &[('a', "ARTICLE")]));
    Ok(record)
}

/// Open the article with `changes` already shown, as left by an earlier
/// session on the same cache.
fn with_changes(changes: Vec<ChangeDescriptor>) -> Result<TestSession, Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    let revision = s.server_mut().put_record(REC, article());
    let entry = CacheEntry {
        revision: Some(revision),
        record: article(),
        hp_changes: changes.into_iter().map(HpChange::new).collect(),
        ..CacheEntry::default()
    };
    s.server_mut()
        .store_mut()
        .write_cache(REC, TEST_USER, &entry, START_MS)?;
    s.editor.load(REC, None, false)?;
    Ok(s)
}

fn subfield_changed(tag: &str, field: usize, subfield: usize, value: &str) -> ChangeDescriptor {
    ChangeDescriptor::SubfieldChanged {
        tag: tag.to_string(),
        indicators: Indicators::blank(),
        field_position: field,
        subfield_position: subfield,
        subfield_code: 'a',
        subfield_content: value.to_string(),
    }
}

fn reference(position: usize, label: &str) -> ChangeDescriptor {
    ChangeDescriptor::FieldAdded {
        tag: "999".to_string(),
        indicators: Indicators('C', '5'),
        field_position: position,
        field_content: vec![Subfield::new('o', label), Subfield::new('s', "Phys.Rev.,D1,1")],
        control_value: String::new(),
    }
}

// =============================================================================
// Comparison
// =============================================================================

#[test]
fn title_edit_is_one_subfield_change() -> Result<(), Box<dyn std::error::Error>> {
    let base: Record = serde_json::from_str(r#"{"245": [[[["a", "Title"]], " ", " ", "", 0]]}"#)?;
    let candidate: Record =
        serde_json::from_str(r#"{"245": [[[["a", "New title"]], " ", " ", "", 0]]}"#)?;

    let changes = diff_records(&base, &candidate, &DiffOptions::default());
    assert_eq!(changes, vec![subfield_changed("245", 0, 0, "New title")]);
    Ok(())
}

#[test]
fn identical_records_have_no_changes() {
    let record = article();
    let with_removals = DiffOptions {
        report_removed: true,
    };
    assert!(diff_records(&record, &record, &with_removals).is_empty());
}

#[test]
fn volatile_placeholders_never_differ() -> Result<(), Box<dyn std::error::Error>> {
    let mut base = article();
    base.append_subfields("700", 0, vec![Subfield::volatile('e', "editor")])?;
    let options = DiffOptions {
        report_removed: true,
    };
    assert!(diff_records(&base, &article(), &options).is_empty());
    Ok(())
}

#[test]
fn subfield_additions_come_with_unchanged_neighbours() -> Result<(), Box<dyn std::error::Error>> {
    let mut candidate = article();
    candidate.append_subfields("100", 0, vec![Subfield::new('e', "ed.")])?;

    let changes = diff_records(&article(), &candidate, &DiffOptions::default());
    let names: Vec<_> = changes.iter().map(ChangeDescriptor::change_type_name).collect();
    assert_eq!(names, ["subfield_same", "subfield_same", "subfield_added"]);
    Ok(())
}

#[test]
fn removals_reported_only_on_request() -> Result<(), Box<dyn std::error::Error>> {
    let mut candidate = article();
    candidate.delete_field("700", 1)?;

    assert!(diff_records(&article(), &candidate, &DiffOptions::default()).is_empty());
    let changes = diff_records(
        &article(),
        &candidate,
        &DiffOptions {
            report_removed: true,
        },
    );
    assert_eq!(
        changes,
        vec![ChangeDescriptor::FieldRemoved {
            tag: "700".to_string(),
            indicators: Indicators::blank(),
            field_position: 1,
        }]
    );
    Ok(())
}

#[test]
fn case_only_edit_is_a_subfield_change() -> Result<(), Box<dyn std::error::Error>> {
    let mut candidate = article();
    candidate.set_subfield_value("245", 0, 0, "ON BIBLIOGRAPHIC RECORDS")?;

    let changes = diff_records(&article(), &candidate, &DiffOptions::default());
    assert_eq!(
        changes,
        vec![subfield_changed("245", 0, 0, "ON BIBLIOGRAPHIC RECORDS")]
    );
    Ok(())
}

#[test]
fn new_control_tag_is_offered_and_applied() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    s.server_mut().put_record(REC, article());
    let mut proposed = article();
    proposed.add_field("008", Field::control("240101s2024"));
    let number = s.server_mut().add_changeset(REC, &proposed)?;
    s.editor.load(REC, None, false)?;

    assert_eq!(s.editor.review_hp_changeset(number)?, 1);
    assert_eq!(kinds(s.editor.hp_changes()), ["field_added"]);

    s.editor.apply_hp_change(0)?;
    assert_eq!(s.editor.record(), &proposed);
    s.editor.flush_now()?;
    assert_eq!(s.server_copy()?.as_ref(), Some(&proposed));
    Ok(())
}

/// Leftover fields pair greedily in order, not by similarity: swapping two
/// authors while editing both reads as two in-place rewrites.
#[test]
fn leftover_fields_pair_in_order() {
    let mut base = Record::new();
    base.add_field("700", data_field(' ', ' ', &[('a', "Smith")]));
    base.add_field("700", data_field(' ', ' ', &[('a', "Jones")]));
    let mut candidate = Record::new();
    candidate.add_field("700", data_field(' ', ' ', &[('a', "Jones, A.")]));
    candidate.add_field("700", data_field(' ', ' ', &[('a', "Smith, J.")]));

    let changes = diff_records(&base, &candidate, &DiffOptions::default());
    assert_eq!(
        changes,
        vec![
            subfield_changed("700", 0, 0, "Jones, A."),
            subfield_changed("700", 1, 0, "Smith, J."),
        ]
    );
}

#[test]
fn record_identifier_changes_are_filtered() {
    let changes = vec![
        ChangeDescriptor::FieldChanged {
            tag: "001".to_string(),
            indicators: Indicators::blank(),
            field_position: 0,
            field_content: vec![Subfield::new('a', "43")],
        },
        subfield_changed("245", 0, 0, "Kept"),
    ];
    assert_eq!(
        filter_changes(changes),
        vec![subfield_changed("245", 0, 0, "Kept")]
    );
}

// =============================================================================
// Reviewing a changeset
// =============================================================================

#[test]
fn review_then_apply_all_in_one_request() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    s.server_mut().put_record(REC, article());
    let proposed = revised()?;
    let number = s.server_mut().add_changeset(REC, &proposed)?;
    s.editor.load(REC, None, false)?;
    assert_eq!(s.editor.holding_pen().offered().count(), 1);

    assert_eq!(s.editor.review_hp_changeset(number)?, 3);
    assert_eq!(
        kinds(s.editor.hp_changes()),
        ["subfield_changed", "field_removed", "field_added"]
    );
    assert!(s.editor.holding_pen().is_disabled(number));
    assert_eq!(s.editor.holding_pen().offered().count(), 0);
    assert!(matches!(
        s.editor.review_hp_changeset(number),
        Err(EngineError::UnprocessedChanges)
    ));

    s.server_mut().clear_received();
    assert_eq!(s.editor.apply_all_hp_changes()?, 3);
    assert_eq!(s.editor.record(), &proposed);
    assert!(s.editor.hp_changes().is_empty());
    assert!(s.editor.queue().is_empty());

    let received = s.server().received();
    assert_eq!(received.len(), 1);
    let EditRequest::ApplyBulkUpdates { requests_to_apply } = &received[0].request else {
        return Err("expected a bulk update".into());
    };
    let sent: Vec<_> = requests_to_apply
        .iter()
        .map(|r| r.request.request_type())
        .collect();
    assert_eq!(
        sent,
        [
            "otherUpdateRequest",
            "modifyContent",
            "addField",
            "deleteFields",
            "otherUpdateRequest"
        ]
    );

    let entry = s.server().cache_entry(REC)?.ok_or("cache missing")?;
    assert_eq!(entry.record, proposed);
    assert!(entry.hp_changes.is_empty());
    assert_eq!(entry.disabled_hp_changes, [number]);
    Ok(())
}

#[test]
fn apply_all_with_nothing_pending_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    s.open(REC, article())?;
    s.server_mut().clear_received();

    assert_eq!(s.editor.apply_all_hp_changes()?, 0);
    assert!(!s.editor.undo_manager().can_undo());
    assert!(s.editor.queue().is_empty());
    assert!(s.server().received().is_empty());
    Ok(())
}

#[test]
fn lost_apply_all_stays_applied_locally() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    s.server_mut().put_record(REC, article());
    let proposed = revised()?;
    let number = s.server_mut().add_changeset(REC, &proposed)?;
    s.editor.load(REC, None, false)?;
    s.editor.review_hp_changeset(number)?;

    s.server_mut().fail_next(TransportError::Timeout);
    assert_eq!(s.editor.apply_all_hp_changes()?, 3);
    assert_eq!(s.editor.record(), &proposed);
    assert!(s.editor.queue().is_empty());
    assert!(s.editor.undo_manager().can_undo());

    let entry = s.server().cache_entry(REC)?.ok_or("cache missing")?;
    assert_eq!(entry.record, article());
    assert!(entry.disabled_hp_changes.is_empty());
    Ok(())
}

#[test]
fn undoing_apply_all_then_review() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    s.server_mut().put_record(REC, article());
    let number = s.server_mut().add_changeset(REC, &revised()?)?;
    s.editor.load(REC, None, false)?;
    s.editor.review_hp_changeset(number)?;
    s.editor.apply_all_hp_changes()?;

    assert!(matches!(s.editor.undo()?, UndoOutcome::Applied(_)));
    assert_eq!(s.editor.record(), &article());
    assert_eq!(s.editor.hp_changes().len(), 3);
    assert!(s.editor.hp_changes().iter().all(|c| !c.applied_change));

    assert!(matches!(s.editor.undo()?, UndoOutcome::Applied(_)));
    assert!(s.editor.hp_changes().is_empty());
    assert!(!s.editor.holding_pen().is_disabled(number));

    s.editor.flush_now()?;
    let entry = s.server().cache_entry(REC)?.ok_or("cache missing")?;
    assert_eq!(entry.record, article());
    assert!(entry.hp_changes.is_empty());
    assert!(entry.disabled_hp_changes.is_empty());
    Ok(())
}

#[test]
fn changeset_is_fetched_once() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    s.server_mut().put_record(REC, article());
    let number = s.server_mut().add_changeset(REC, &revised()?)?;
    s.editor.load(REC, None, false)?;

    let first = s.editor.fetch_hp_changeset(number)?;
    let second = s.editor.fetch_hp_changeset(number)?;
    assert_eq!(first, second);
    assert_eq!(s.server().received_of("getHoldingPenUpdateDetails").len(), 1);
    Ok(())
}

#[test]
fn deleting_a_changeset() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    s.server_mut().put_record(REC, article());
    let number = s.server_mut().add_changeset(REC, &revised()?)?;
    s.editor.load(REC, None, false)?;

    assert!(matches!(
        s.editor.fetch_hp_changeset(number + 1),
        Err(EngineError::HpChangesetNotFound(_))
    ));

    s.editor.delete_hp_changeset(number)?;
    assert!(s.editor.holding_pen().available().is_empty());
    assert!(s.server().store().list_hp_changesets(REC)?.is_empty());
    assert!(!s.editor.undo_manager().can_undo());
    assert!(matches!(
        s.editor.delete_hp_changeset(number),
        Err(EngineError::HpChangesetNotFound(n)) if n == number
    ));
    Ok(())
}

// =============================================================================
// Single changes
// =============================================================================

#[test]
fn removal_supersedes_and_shifts_later_changes() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = with_changes(vec![
        ChangeDescriptor::FieldRemoved {
            tag: "700".to_string(),
            indicators: Indicators::blank(),
            field_position: 0,
        },
        subfield_changed("700", 0, 0, "Jones, Anna"),
        subfield_changed("700", 1, 0, "Brown, Bob"),
    ])?;
    assert_eq!(s.editor.hp_changes().len(), 3);

    s.editor.apply_hp_change(0)?;
    assert!(s.editor.hp_changes()[1].applied_change);
    assert_eq!(s.editor.hp_changes()[2].change.field_position(), 0);

    s.editor.apply_hp_change(2)?;
    assert_eq!(values(s.editor.record(), "700"), ["Brown, Bob"]);
    assert!(matches!(
        s.editor.apply_hp_change(1),
        Err(EngineError::HpChangeAlreadyProcessed(1))
    ));

    s.editor.flush_now()?;
    let entry = s.server().cache_entry(REC)?.ok_or("cache missing")?;
    assert_eq!(&entry.record, s.editor.record());
    assert_eq!(entry.hp_changes, s.editor.hp_changes());

    s.editor.undo()?;
    s.editor.undo()?;
    assert_eq!(s.editor.record(), &article());
    assert_eq!(s.editor.hp_changes()[2].change.field_position(), 1);
    assert!(s.editor.hp_changes().iter().all(|c| !c.applied_change));
    Ok(())
}

#[test]
fn subfield_addition_is_applied_at_the_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = TestSession::new()?;
    s.open(REC, article())?;
    let mut proposed = article();
    proposed.append_subfields("100", 0, vec![Subfield::new('e', "ed.")])?;

    assert_eq!(s.editor.visualize_hp_changeset(7, &proposed)?, 3);
    assert!(matches!(
        s.editor.apply_hp_change(0),
        Err(EngineError::ChangeNotApplicable(_))
    ));
    s.editor.apply_hp_change(2)?;
    assert_eq!(s.editor.record(), &proposed);
    assert!(!s.editor.holding_pen().has_pending());
    Ok(())
}

#[test]
fn rejecting_leaves_the_record_alone() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = with_changes(vec![subfield_changed("245", 0, 0, "Rejected title")])?;

    s.editor.reject_hp_change(0)?;
    assert_eq!(s.editor.record(), &article());
    assert!(s.editor.hp_changes()[0].applied_change);
    let pending = s.editor.queue().pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.request_type(), "otherUpdateRequest");

    assert!(matches!(
        s.editor.reject_hp_change(0),
        Err(EngineError::HpChangeAlreadyProcessed(0))
    ));
    s.editor.undo()?;
    assert!(!s.editor.hp_changes()[0].applied_change);
    Ok(())
}

#[test]
fn rejecting_all_hides_the_list() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = with_changes(vec![
        subfield_changed("245", 0, 0, "One"),
        subfield_changed("100", 0, 0, "Two"),
    ])?;

    s.editor.reject_all_hp_changes()?;
    assert!(s.editor.hp_changes().is_empty());
    assert_eq!(s.editor.record(), &article());

    s.editor.undo()?;
    assert_eq!(s.editor.hp_changes().len(), 2);
    Ok(())
}

#[test]
fn references_are_applied_together() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = with_changes(vec![
        reference(0, "[1]"),
        subfield_changed("245", 0, 0, "Left pending"),
        reference(1, "[2]"),
    ])?;

    assert_eq!(s.editor.apply_all_references()?, 2);
    assert_eq!(values(s.editor.record(), "999"), ["[1]", "[2]"]);
    assert_eq!(s.editor.record().field("999", 0)?.indicators(), Indicators('C', '5'));
    assert_eq!(s.editor.holding_pen().pending().count(), 1);
    assert_eq!(s.editor.undo_manager().undo_depth(), 1);

    s.editor.flush_now()?;
    assert_eq!(s.server_copy()?.as_ref(), Some(s.editor.record()));

    s.editor.undo()?;
    assert_eq!(s.editor.record(), &article());
    assert_eq!(s.editor.holding_pen().pending().count(), 3);

    // Nothing left to apply is not an undoable step.
    s.editor.reject_hp_change(0)?;
    s.editor.reject_hp_change(2)?;
    assert_eq!(s.editor.apply_all_references()?, 0);
    assert_eq!(s.editor.undo_manager().undo_depth(), 2);
    Ok(())
}
