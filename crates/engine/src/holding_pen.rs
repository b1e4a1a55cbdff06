use std::collections::{BTreeMap, BTreeSet};

use bibedit_core::request::ChangesetSummary;
use bibedit_core::{ChangeDescriptor, HpChange, Indicators, Record};

use crate::error::EngineError;

const REFERENCE_TAG: &str = "999";
const REFERENCE_INDICATORS: Indicators = Indicators('C', '5');

/// Pending change indices, split into the order they are applied in bulk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedChanges {
    /// Additions and modifications, in list order.
    pub add_modify: Vec<usize>,
    /// Subfield removals, last subfield first.
    pub subfield_removals: Vec<usize>,
    /// Field removals, last field first.
    pub field_removals: Vec<usize>,
}

impl AggregatedChanges {
    /// All indices in application order.
    pub fn ordered(&self) -> impl Iterator<Item = usize> + '_ {
        self.add_modify
            .iter()
            .chain(&self.subfield_removals)
            .chain(&self.field_removals)
            .copied()
    }
}

/// Holding-pen state of the editor: the changes currently shown against the
/// record, the changesets on offer, and the ones the user has hidden.
#[derive(Debug, Clone, Default)]
pub struct HoldingPen {
    changes: Vec<HpChange>,
    available: Vec<ChangesetSummary>,
    disabled: BTreeSet<u64>,
    loaded: BTreeMap<u64, Record>,
}

impl HoldingPen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> &[HpChange] {
        &self.changes
    }

    pub fn change(&self, number: usize) -> Result<&HpChange, EngineError> {
        self.changes
            .get(number)
            .ok_or(EngineError::HpChangeNotFound(number))
    }

    /// Swap in a new change list, returning the previous one.
    pub fn replace(&mut self, changes: Vec<HpChange>) -> Vec<HpChange> {
        std::mem::replace(&mut self.changes, changes)
    }

    pub fn mark_applied(&mut self, number: usize) -> Result<(), EngineError> {
        self.set_applied(number, true)
    }

    pub fn mark_reverted(&mut self, number: usize) -> Result<(), EngineError> {
        self.set_applied(number, false)
    }

    fn set_applied(&mut self, number: usize, applied: bool) -> Result<(), EngineError> {
        let change = self
            .changes
            .get_mut(number)
            .ok_or(EngineError::HpChangeNotFound(number))?;
        change.applied_change = applied;
        Ok(())
    }

    /// Changes the user has neither applied nor rejected.
    pub fn pending(&self) -> impl Iterator<Item = (usize, &HpChange)> {
        self.changes
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.applied_change && c.change.is_applicable())
    }

    pub fn has_pending(&self) -> bool {
        self.pending().next().is_some()
    }

    /// Move the field position of each listed change by `delta`.
    pub fn shift_positions(&mut self, numbers: &[usize], delta: isize) -> Result<(), EngineError> {
        for &n in numbers {
            let change = self
                .changes
                .get_mut(n)
                .ok_or(EngineError::HpChangeNotFound(n))?;
            let position = change
                .change
                .field_position()
                .checked_add_signed(delta)
                .ok_or(EngineError::HpChangeNotFound(n))?;
            change.change.set_field_position(position);
        }
        Ok(())
    }

    /// Changes whose position follows a field inserted at `position` under
    /// `tag`. Additions are positioned against the proposed record and never
    /// move.
    pub fn after_insertion(&self, except: usize, tag: &str, position: usize) -> Vec<usize> {
        self.same_tag(except, tag)
            .filter(|(_, c)| c.change.field_position() >= position)
            .map(|(i, _)| i)
            .collect()
    }

    /// `(superseded, shifted)` for removing the field at `position` under
    /// `tag`: pending changes to that same field, and changes to later fields.
    pub fn after_removal(&self, except: usize, tag: &str, position: usize) -> (Vec<usize>, Vec<usize>) {
        let mut superseded = Vec::new();
        let mut shifted = Vec::new();
        for (i, c) in self.same_tag(except, tag) {
            let p = c.change.field_position();
            if p == position && !c.applied_change {
                superseded.push(i);
            } else if p > position {
                shifted.push(i);
            }
        }
        (superseded, shifted)
    }

    fn same_tag<'a>(
        &'a self,
        except: usize,
        tag: &'a str,
    ) -> impl Iterator<Item = (usize, &'a HpChange)> + 'a {
        self.changes.iter().enumerate().filter(move |(i, c)| {
            *i != except
                && c.change.tag() == tag
                && !matches!(c.change, ChangeDescriptor::FieldAdded { .. })
        })
    }

    /// Split pending changes for bulk application. Removals go last and
    /// back to front so earlier positions stay valid.
    pub fn aggregate(&self) -> AggregatedChanges {
        let mut agg = AggregatedChanges::default();
        for (i, c) in self.pending() {
            match c.change {
                ChangeDescriptor::SubfieldRemoved { .. } => agg.subfield_removals.push(i),
                ChangeDescriptor::FieldRemoved { .. } => agg.field_removals.push(i),
                _ => agg.add_modify.push(i),
            }
        }
        let key = |i: &usize| match &self.changes[*i].change {
            ChangeDescriptor::SubfieldRemoved {
                tag,
                field_position,
                subfield_position,
                ..
            } => (tag.clone(), *field_position, *subfield_position),
            other => (other.tag().to_string(), other.field_position(), 0),
        };
        agg.subfield_removals
            .sort_by_key(|i| std::cmp::Reverse((key(i).2, key(i).1)));
        agg.field_removals
            .sort_by_key(|i| std::cmp::Reverse(key(i).1));
        agg
    }

    /// Pending changes to reference fields (`999C5`).
    pub fn reference_changes(&self) -> Vec<usize> {
        self.pending()
            .filter(|(_, c)| {
                c.change.tag() == REFERENCE_TAG && c.change.indicators() == REFERENCE_INDICATORS
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn available(&self) -> &[ChangesetSummary] {
        &self.available
    }

    pub fn set_available(&mut self, changesets: Vec<ChangesetSummary>) {
        self.available = changesets;
    }

    pub fn disable(&mut self, changeset: u64) {
        self.disabled.insert(changeset);
    }

    pub fn enable(&mut self, changeset: u64) {
        self.disabled.remove(&changeset);
    }

    pub fn is_disabled(&self, changeset: u64) -> bool {
        self.disabled.contains(&changeset)
    }

    pub fn disabled(&self) -> impl Iterator<Item = u64> + '_ {
        self.disabled.iter().copied()
    }

    /// Changesets still offered for review.
    pub fn offered(&self) -> impl Iterator<Item = &ChangesetSummary> {
        self.available
            .iter()
            .filter(|c| !self.disabled.contains(&c.changeset_number))
    }

    pub fn cache_changeset(&mut self, changeset: u64, record: Record) {
        self.loaded.insert(changeset, record);
    }

    pub fn loaded_changeset(&self, changeset: u64) -> Option<&Record> {
        self.loaded.get(&changeset)
    }

    /// Forget a changeset deleted on the server.
    pub fn remove_changeset(&mut self, changeset: u64) {
        self.available.retain(|c| c.changeset_number != changeset);
        self.disabled.remove(&changeset);
        self.loaded.remove(&changeset);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibedit_core::Subfield;

    fn removed_field(tag: &str, pos: usize) -> HpChange {
        HpChange::new(ChangeDescriptor::FieldRemoved {
            tag: tag.into(),
            indicators: Indicators::blank(),
            field_position: pos,
        })
    }

    fn removed_subfield(pos: usize, sf: usize) -> HpChange {
        HpChange::new(ChangeDescriptor::SubfieldRemoved {
            tag: "100".into(),
            indicators: Indicators::blank(),
            field_position: pos,
            subfield_position: sf,
        })
    }

    fn changed_subfield(tag: &str, ind: Indicators, pos: usize) -> HpChange {
        HpChange::new(ChangeDescriptor::SubfieldChanged {
            tag: tag.into(),
            indicators: ind,
            field_position: pos,
            subfield_position: 0,
            subfield_code: 'a',
            subfield_content: "x".into(),
        })
    }

    #[test]
    fn aggregate_orders_removals_back_to_front() {
        let mut pen = HoldingPen::new();
        pen.replace(vec![
            removed_field("700", 0),
            removed_subfield(0, 1),
            changed_subfield("245", Indicators::blank(), 0),
            removed_field("700", 2),
            removed_subfield(0, 3),
        ]);
        let agg = pen.aggregate();
        assert_eq!(agg.add_modify, vec![2]);
        assert_eq!(agg.subfield_removals, vec![4, 1]);
        assert_eq!(agg.field_removals, vec![3, 0]);
        assert_eq!(agg.ordered().collect::<Vec<_>>(), vec![2, 4, 1, 3, 0]);
    }

    #[test]
    fn pending_skips_processed_and_display_only() {
        let mut pen = HoldingPen::new();
        pen.replace(vec![
            changed_subfield("100", Indicators::blank(), 0),
            HpChange::new(ChangeDescriptor::SubfieldSame {
                tag: "100".into(),
                indicators: Indicators::blank(),
                field_position: 0,
                subfield_position: 1,
                subfield_code: 'u',
                subfield_content: "CERN".into(),
            }),
        ]);
        assert!(pen.has_pending());
        pen.mark_applied(0).unwrap();
        assert!(!pen.has_pending());
        pen.mark_reverted(0).unwrap();
        assert_eq!(pen.pending().count(), 1);
        assert!(matches!(
            pen.mark_applied(9),
            Err(EngineError::HpChangeNotFound(9))
        ));
    }

    #[test]
    fn removal_supersedes_and_shifts() {
        let mut pen = HoldingPen::new();
        pen.replace(vec![
            removed_field("700", 1),
            changed_subfield("700", Indicators::blank(), 1),
            changed_subfield("700", Indicators::blank(), 2),
            changed_subfield("700", Indicators::blank(), 0),
            changed_subfield("710", Indicators::blank(), 2),
            HpChange::new(ChangeDescriptor::FieldAdded {
                tag: "700".into(),
                indicators: Indicators::blank(),
                field_position: 3,
                field_content: vec![Subfield::new('a', "Brown")],
                control_value: String::new(),
            }),
        ]);
        let (superseded, shifted) = pen.after_removal(0, "700", 1);
        assert_eq!(superseded, vec![1]);
        assert_eq!(shifted, vec![2]);

        pen.shift_positions(&shifted, -1).unwrap();
        assert_eq!(pen.change(2).unwrap().change.field_position(), 1);
        pen.shift_positions(&shifted, 1).unwrap();
        assert_eq!(pen.change(2).unwrap().change.field_position(), 2);
    }

    #[test]
    fn insertion_shifts_later_fields() {
        let mut pen = HoldingPen::new();
        pen.replace(vec![
            changed_subfield("700", Indicators::blank(), 0),
            changed_subfield("700", Indicators('1', ' '), 1),
        ]);
        assert_eq!(pen.after_insertion(usize::MAX, "700", 1), vec![1]);
    }

    #[test]
    fn reference_changes_pick_999c5() {
        let mut pen = HoldingPen::new();
        pen.replace(vec![
            changed_subfield("999", Indicators('C', '5'), 0),
            changed_subfield("999", Indicators('C', '6'), 0),
            changed_subfield("100", Indicators::blank(), 0),
        ]);
        assert_eq!(pen.reference_changes(), vec![0]);
    }

    #[test]
    fn changeset_bookkeeping() {
        let mut pen = HoldingPen::new();
        pen.set_available(vec![
            ChangesetSummary {
                changeset_number: 4,
                changeset_date: "2024-01-01".into(),
            },
            ChangesetSummary {
                changeset_number: 7,
                changeset_date: "2024-01-02".into(),
            },
        ]);
        pen.disable(4);
        assert_eq!(
            pen.offered().map(|c| c.changeset_number).collect::<Vec<_>>(),
            vec![7]
        );
        pen.cache_changeset(7, Record::new());
        assert!(pen.loaded_changeset(7).is_some());
        pen.remove_changeset(7);
        assert!(pen.loaded_changeset(7).is_none());
        assert_eq!(pen.available().len(), 1);
        pen.enable(4);
        assert!(!pen.is_disabled(4));
    }
}
