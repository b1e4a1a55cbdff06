//! Field-level comparison of a record against a proposed revision.
//!
//! Data fields are compared subfield by subfield. Control fields only count
//! when their whole tag appears or disappears: their values are identifiers
//! and timestamps that a revision always rewrites.

use bibedit_core::{ChangeDescriptor, Field, Indicators, Record, Subfield};

/// Tags whose changes are never offered to the user.
const UNCHANGEABLE_TAGS: &[&str] = &["001"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Also emit `FieldRemoved` and `SubfieldRemoved` for content only `base`
    /// has.
    pub report_removed: bool,
}

/// Compare `candidate` against `base`, listing what would turn `base` into
/// `candidate`.
///
/// Field pairing within a tag and indicator pair is first by exact content,
/// then greedy: a leftover candidate field takes the first leftover base
/// field, whether or not it is the closest one.
pub fn diff_records(
    base: &Record,
    candidate: &Record,
    options: &DiffOptions,
) -> Vec<ChangeDescriptor> {
    let mut changes = Vec::new();

    for (tag, cand_fields) in candidate.iter() {
        let base_fields = base.fields(tag);
        if base_fields.is_empty() {
            for (pos, field) in cand_fields.iter().enumerate() {
                if reportable(field) {
                    changes.push(field_added(tag, pos, field));
                }
            }
            continue;
        }

        for indicators in indicator_groups(cand_fields, base_fields, options.report_removed) {
            let cand_idx = group_members(cand_fields, indicators);
            let base_idx = group_members(base_fields, indicators);
            diff_group(
                tag,
                indicators,
                (base_fields, &base_idx),
                (cand_fields, &cand_idx),
                options,
                &mut changes,
            );
        }
    }

    if options.report_removed {
        for (tag, base_fields) in base.iter() {
            if candidate.contains_tag(tag) {
                continue;
            }
            for (pos, field) in base_fields.iter().enumerate() {
                if reportable(field) {
                    changes.push(ChangeDescriptor::FieldRemoved {
                        tag: tag.to_string(),
                        indicators: field.indicators(),
                        field_position: pos,
                    });
                }
            }
        }
    }

    changes
}

/// Drop changes to fields that must never be modified.
pub fn filter_changes(changes: Vec<ChangeDescriptor>) -> Vec<ChangeDescriptor> {
    changes
        .into_iter()
        .filter(|c| !UNCHANGEABLE_TAGS.contains(&c.tag()))
        .collect()
}

fn comparable(field: &Field) -> bool {
    !field.subfields.is_empty() && !field.is_volatile()
}

/// Whether a field in a tag only one side has is worth a change entry.
fn reportable(field: &Field) -> bool {
    field.is_control() || comparable(field)
}

/// Indicator pairs in first-seen order: candidate groups, then (when removals
/// are reported) groups only `base` has.
fn indicator_groups(cand: &[Field], base: &[Field], include_base: bool) -> Vec<Indicators> {
    let mut groups: Vec<Indicators> = Vec::new();
    let sources = cand
        .iter()
        .chain(base.iter().filter(|_| include_base));
    for field in sources {
        let ind = field.indicators();
        if comparable(field) && !groups.contains(&ind) {
            groups.push(ind);
        }
    }
    groups
}

fn group_members(fields: &[Field], indicators: Indicators) -> Vec<usize> {
    fields
        .iter()
        .enumerate()
        .filter(|(_, f)| comparable(f) && f.indicators() == indicators)
        .map(|(i, _)| i)
        .collect()
}

/// Same length, and every position either holds a volatile subfield on some
/// side or matches (same code, value equal ignoring case).
fn equivalent(a: &Field, b: &Field) -> bool {
    a.subfields.len() == b.subfields.len()
        && a
            .subfields
            .iter()
            .zip(&b.subfields)
            .all(|(x, y)| x.is_volatile() || y.is_volatile() || x.matches(y))
}

fn diff_group(
    tag: &str,
    indicators: Indicators,
    (base_fields, base_idx): (&[Field], &[usize]),
    (cand_fields, cand_idx): (&[Field], &[usize]),
    options: &DiffOptions,
    out: &mut Vec<ChangeDescriptor>,
) {
    let mut base_used = vec![false; base_idx.len()];
    let mut pairing: Vec<Option<usize>> = vec![None; cand_idx.len()];

    for (ci, &c) in cand_idx.iter().enumerate() {
        let found = base_idx
            .iter()
            .enumerate()
            .find(|(bi, b)| !base_used[*bi] && equivalent(&base_fields[**b], &cand_fields[c]));
        if let Some((bi, _)) = found {
            base_used[bi] = true;
            pairing[ci] = Some(bi);
        }
    }

    for slot in pairing.iter_mut().filter(|p| p.is_none()) {
        if let Some(bi) = base_used.iter().position(|used| !used) {
            base_used[bi] = true;
            *slot = Some(bi);
        }
    }

    for (ci, &c) in cand_idx.iter().enumerate() {
        let cand = &cand_fields[c];
        match pairing[ci] {
            Some(bi) => {
                let b = base_idx[bi];
                out.extend(compare_fields(tag, indicators, b, &base_fields[b], cand, options));
            }
            None => out.push(field_added(tag, c, cand)),
        }
    }

    if options.report_removed {
        for (bi, &b) in base_idx.iter().enumerate() {
            if !base_used[bi] {
                out.push(ChangeDescriptor::FieldRemoved {
                    tag: tag.to_string(),
                    indicators,
                    field_position: b,
                });
            }
        }
    }
}

/// Subfield-level comparison of a paired field. A code mismatch at any shared
/// position replaces the whole field. `SubfieldSame` entries accompany real
/// differences only.
fn compare_fields(
    tag: &str,
    indicators: Indicators,
    position: usize,
    base: &Field,
    cand: &Field,
    options: &DiffOptions,
) -> Vec<ChangeDescriptor> {
    let mut result = Vec::new();
    let mut differs = false;

    for (i, sf) in cand.subfields.iter().enumerate() {
        let Some(old) = base.subfields.get(i) else {
            if !sf.is_volatile() {
                differs = true;
                result.push(ChangeDescriptor::SubfieldAdded {
                    tag: tag.to_string(),
                    indicators,
                    field_position: position,
                    subfield_code: sf.code,
                    subfield_content: sf.value.clone(),
                });
            }
            continue;
        };
        if old.is_volatile() || sf.is_volatile() {
            continue;
        }
        if old.code != sf.code {
            return vec![ChangeDescriptor::FieldChanged {
                tag: tag.to_string(),
                indicators,
                field_position: position,
                field_content: confirmed(&cand.subfields),
            }];
        }
        let (subfield_code, subfield_content) = (sf.code, sf.value.clone());
        if old.value != sf.value {
            differs = true;
            result.push(ChangeDescriptor::SubfieldChanged {
                tag: tag.to_string(),
                indicators,
                field_position: position,
                subfield_position: i,
                subfield_code,
                subfield_content,
            });
        } else {
            result.push(ChangeDescriptor::SubfieldSame {
                tag: tag.to_string(),
                indicators,
                field_position: position,
                subfield_position: i,
                subfield_code,
                subfield_content,
            });
        }
    }

    if options.report_removed {
        for (i, old) in base.subfields.iter().enumerate().skip(cand.subfields.len()) {
            if !old.is_volatile() {
                differs = true;
                result.push(ChangeDescriptor::SubfieldRemoved {
                    tag: tag.to_string(),
                    indicators,
                    field_position: position,
                    subfield_position: i,
                });
            }
        }
    }

    if differs { result } else { Vec::new() }
}

fn field_added(tag: &str, position: usize, field: &Field) -> ChangeDescriptor {
    ChangeDescriptor::FieldAdded {
        tag: tag.to_string(),
        indicators: field.indicators(),
        field_position: position,
        field_content: confirmed(&field.subfields),
        control_value: field.control_value.clone(),
    }
}

fn confirmed(subfields: &[Subfield]) -> Vec<Subfield> {
    subfields.iter().filter(|sf| !sf.is_volatile()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(subfields: &[(char, &str)]) -> Field {
        Field::data(
            ' ',
            ' ',
            subfields.iter().map(|(c, v)| Subfield::new(*c, *v)).collect(),
        )
    }

    fn record(fields: &[(&str, Field)]) -> Record {
        let mut r = Record::new();
        for (tag, f) in fields {
            r.add_field(tag, f.clone());
        }
        r
    }

    fn with_removals() -> DiffOptions {
        DiffOptions {
            report_removed: true,
        }
    }

    #[test]
    fn self_diff_is_empty() {
        let r = record(&[
            ("001", Field::control("1")),
            ("100", data(&[('a', "Smith"), ('u', "CERN")])),
            ("245", data(&[('a', "Title")])),
            ("980", Field::data(' ', ' ', vec![Subfield::volatile('a', "ARTICLE")])),
        ]);
        assert!(diff_records(&r, &r, &with_removals()).is_empty());
    }

    #[test]
    fn changed_title_yields_one_subfield_change() {
        let base = record(&[("245", data(&[('a', "Title")]))]);
        let cand = record(&[("245", data(&[('a', "New Title")]))]);
        let changes = diff_records(&base, &cand, &DiffOptions::default());
        assert_eq!(
            changes,
            vec![ChangeDescriptor::SubfieldChanged {
                tag: "245".into(),
                indicators: Indicators::blank(),
                field_position: 0,
                subfield_position: 0,
                subfield_code: 'a',
                subfield_content: "New Title".into(),
            }]
        );
    }

    #[test]
    fn unchanged_subfields_accompany_changes() {
        let base = record(&[("100", data(&[('a', "Smith"), ('u', "CERN")]))]);
        let cand = record(&[("100", data(&[('a', "Smith"), ('u', "DESY")]))]);
        let kinds: Vec<_> = diff_records(&base, &cand, &DiffOptions::default())
            .iter()
            .map(ChangeDescriptor::change_type_name)
            .collect();
        assert_eq!(kinds, vec!["subfield_same", "subfield_changed"]);
    }

    #[test]
    fn code_mismatch_replaces_field() {
        let base = record(&[("100", data(&[('a', "Smith"), ('u', "CERN")]))]);
        let cand = record(&[("100", data(&[('a', "Smith"), ('v', "CERN")]))]);
        let changes = diff_records(&base, &cand, &DiffOptions::default());
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0],
            ChangeDescriptor::FieldChanged { field_content, .. } if field_content.len() == 2
        ));
    }

    #[test]
    fn new_tag_and_extra_subfield() {
        let base = record(&[("100", data(&[('a', "Smith")]))]);
        let cand = record(&[
            ("100", data(&[('a', "Smith"), ('u', "CERN")])),
            ("700", data(&[('a', "Jones")])),
        ]);
        let kinds: Vec<_> = diff_records(&base, &cand, &DiffOptions::default())
            .iter()
            .map(ChangeDescriptor::change_type_name)
            .collect();
        assert_eq!(kinds, vec!["subfield_same", "subfield_added", "field_added"]);
    }

    #[test]
    fn exact_matches_pair_before_greedy() {
        let base = record(&[
            ("700", data(&[('a', "Smith")])),
            ("700", data(&[('a', "Jones")])),
        ]);
        let cand = record(&[
            ("700", data(&[('a', "JONES")])),
            ("700", data(&[('a', "Smith")])),
            ("700", data(&[('a', "Brown")])),
        ]);
        // Pairing ignores case, the value comparison does not.
        let changes = diff_records(&base, &cand, &DiffOptions::default());
        assert_eq!(changes.len(), 2);
        assert!(matches!(
            &changes[0],
            ChangeDescriptor::SubfieldChanged { field_position: 1, subfield_content, .. }
                if subfield_content == "JONES"
        ));
        assert!(matches!(
            &changes[1],
            ChangeDescriptor::FieldAdded { field_position: 2, .. }
        ));
    }

    #[test]
    fn removals_only_when_requested() {
        let base = record(&[
            ("100", data(&[('a', "Smith"), ('u', "CERN")])),
            ("500", data(&[('a', "Note")])),
        ]);
        let cand = record(&[("100", data(&[('a', "Smith")]))]);
        assert!(diff_records(&base, &cand, &DiffOptions::default()).is_empty());

        let kinds: Vec<_> = diff_records(&base, &cand, &with_removals())
            .iter()
            .map(ChangeDescriptor::change_type_name)
            .collect();
        assert_eq!(kinds, vec!["subfield_same", "subfield_removed", "field_removed"]);
    }

    #[test]
    fn volatile_content_is_never_a_difference() {
        let base = record(&[("100", data(&[('a', "Smith")]))]);
        let mut cand = base.clone();
        cand.append_subfields("100", 0, vec![Subfield::volatile('u', "affiliation")])
            .unwrap();
        cand.add_field("980", Field::data(' ', ' ', vec![Subfield::volatile('a', "x")]));
        assert!(diff_records(&base, &cand, &with_removals()).is_empty());
        assert!(diff_records(&cand, &base, &with_removals()).is_empty());
    }

    #[test]
    fn control_tags_only_one_side_has_are_reported() {
        let base = record(&[("001", Field::control("1")), ("100", data(&[('a', "Smith")]))]);
        let cand = record(&[
            ("001", Field::control("1")),
            ("008", Field::control("240101s2024")),
            ("100", data(&[('a', "Smith")])),
        ]);
        let changes = diff_records(&base, &cand, &with_removals());
        assert_eq!(
            changes,
            vec![ChangeDescriptor::FieldAdded {
                tag: "008".into(),
                indicators: Indicators::blank(),
                field_position: 0,
                field_content: Vec::new(),
                control_value: "240101s2024".into(),
            }]
        );

        let removed = diff_records(&cand, &base, &with_removals());
        assert_eq!(removed.len(), 1);
        assert!(matches!(
            &removed[0],
            ChangeDescriptor::FieldRemoved { tag, field_position: 0, .. } if tag == "008"
        ));
        assert!(diff_records(&cand, &base, &DiffOptions::default()).is_empty());

        let identifier_only = record(&[("001", Field::control("2"))]);
        let changes = diff_records(&Record::new(), &identifier_only, &with_removals());
        assert_eq!(changes.len(), 1);
        assert!(filter_changes(changes).is_empty());
    }

    #[test]
    fn control_values_in_shared_tags_are_not_compared() {
        let base = record(&[("001", Field::control("1")), ("005", Field::control("a"))]);
        let cand = record(&[("001", Field::control("2")), ("005", Field::control("b"))]);
        assert!(diff_records(&base, &cand, &with_removals()).is_empty());
    }

    #[test]
    fn filter_drops_record_identifier() {
        let changes = vec![
            ChangeDescriptor::FieldRemoved {
                tag: "001".into(),
                indicators: Indicators::blank(),
                field_position: 0,
            },
            ChangeDescriptor::FieldRemoved {
                tag: "100".into(),
                indicators: Indicators::blank(),
                field_position: 0,
            },
        ];
        let filtered = filter_changes(changes);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].tag(), "100");
    }
}
