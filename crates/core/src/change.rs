use serde::{Deserialize, Serialize};

use crate::record::{Field, Indicators, Subfield};

/// One atomic difference between a record and a proposed revision of it.
///
/// `field_position` indexes the field under `tag` in the record the change
/// applies to, except for `FieldAdded` where it is the field's index in the
/// proposed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change_type", rename_all = "snake_case")]
pub enum ChangeDescriptor {
    FieldAdded {
        tag: String,
        indicators: Indicators,
        field_position: usize,
        field_content: Vec<Subfield>,
        /// Value of an added control field; empty for data fields.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        control_value: String,
    },
    FieldRemoved {
        tag: String,
        indicators: Indicators,
        field_position: usize,
    },
    FieldChanged {
        tag: String,
        indicators: Indicators,
        field_position: usize,
        field_content: Vec<Subfield>,
    },
    SubfieldAdded {
        tag: String,
        indicators: Indicators,
        field_position: usize,
        subfield_code: char,
        subfield_content: String,
    },
    SubfieldRemoved {
        tag: String,
        indicators: Indicators,
        field_position: usize,
        subfield_position: usize,
    },
    SubfieldChanged {
        tag: String,
        indicators: Indicators,
        field_position: usize,
        subfield_position: usize,
        subfield_code: char,
        subfield_content: String,
    },
    /// Unchanged subfield inside a changed field; for highlighting only.
    SubfieldSame {
        tag: String,
        indicators: Indicators,
        field_position: usize,
        subfield_position: usize,
        subfield_code: char,
        subfield_content: String,
    },
}

impl ChangeDescriptor {
    pub fn tag(&self) -> &str {
        match self {
            Self::FieldAdded { tag, .. }
            | Self::FieldRemoved { tag, .. }
            | Self::FieldChanged { tag, .. }
            | Self::SubfieldAdded { tag, .. }
            | Self::SubfieldRemoved { tag, .. }
            | Self::SubfieldChanged { tag, .. }
            | Self::SubfieldSame { tag, .. } => tag,
        }
    }

    pub fn indicators(&self) -> Indicators {
        match self {
            Self::FieldAdded { indicators, .. }
            | Self::FieldRemoved { indicators, .. }
            | Self::FieldChanged { indicators, .. }
            | Self::SubfieldAdded { indicators, .. }
            | Self::SubfieldRemoved { indicators, .. }
            | Self::SubfieldChanged { indicators, .. }
            | Self::SubfieldSame { indicators, .. } => *indicators,
        }
    }

    pub fn field_position(&self) -> usize {
        match self {
            Self::FieldAdded { field_position, .. }
            | Self::FieldRemoved { field_position, .. }
            | Self::FieldChanged { field_position, .. }
            | Self::SubfieldAdded { field_position, .. }
            | Self::SubfieldRemoved { field_position, .. }
            | Self::SubfieldChanged { field_position, .. }
            | Self::SubfieldSame { field_position, .. } => *field_position,
        }
    }

    pub fn set_field_position(&mut self, position: usize) {
        match self {
            Self::FieldAdded { field_position, .. }
            | Self::FieldRemoved { field_position, .. }
            | Self::FieldChanged { field_position, .. }
            | Self::SubfieldAdded { field_position, .. }
            | Self::SubfieldRemoved { field_position, .. }
            | Self::SubfieldChanged { field_position, .. }
            | Self::SubfieldSame { field_position, .. } => *field_position = position,
        }
    }

    pub fn change_type_name(&self) -> &'static str {
        match self {
            Self::FieldAdded { .. } => "field_added",
            Self::FieldRemoved { .. } => "field_removed",
            Self::FieldChanged { .. } => "field_changed",
            Self::SubfieldAdded { .. } => "subfield_added",
            Self::SubfieldRemoved { .. } => "subfield_removed",
            Self::SubfieldChanged { .. } => "subfield_changed",
            Self::SubfieldSame { .. } => "subfield_same",
        }
    }

    /// Whether applying the change can be requested at all. `SubfieldSame`
    /// only exists for display.
    pub fn is_applicable(&self) -> bool {
        !matches!(self, Self::SubfieldSame { .. })
    }

    /// The complete proposed field for changes that carry one.
    pub fn proposed_field(&self) -> Option<Field> {
        match self {
            Self::FieldAdded { control_value, .. } if !control_value.is_empty() => {
                Some(Field::control(control_value.clone()))
            }
            Self::FieldAdded {
                indicators,
                field_content,
                ..
            }
            | Self::FieldChanged {
                indicators,
                field_content,
                ..
            } => Some(Field::data(indicators.0, indicators.1, field_content.clone())),
            _ => None,
        }
    }
}

/// A change shown in the editor, with whether the user already dealt with it
/// (applied or rejected).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpChange {
    #[serde(flatten)]
    pub change: ChangeDescriptor,
    #[serde(default)]
    pub applied_change: bool,
}

impl HpChange {
    pub fn new(change: ChangeDescriptor) -> Self {
        Self {
            change,
            applied_change: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_change_type_tag() {
        let change = ChangeDescriptor::SubfieldChanged {
            tag: "245".into(),
            indicators: Indicators::blank(),
            field_position: 0,
            subfield_position: 0,
            subfield_code: 'a',
            subfield_content: "New Title".into(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["change_type"], "subfield_changed");
        assert_eq!(json["indicators"], "__");
        assert_eq!(json["subfield_code"], "a");
        let back: ChangeDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn hp_change_flattens_descriptor() {
        let hp = HpChange::new(ChangeDescriptor::FieldRemoved {
            tag: "100".into(),
            indicators: Indicators::blank(),
            field_position: 2,
        });
        let json = serde_json::to_value(&hp).unwrap();
        assert_eq!(json["change_type"], "field_removed");
        assert_eq!(json["applied_change"], false);
    }

    #[test]
    fn added_control_field_keeps_its_value() {
        let change = ChangeDescriptor::FieldAdded {
            tag: "008".into(),
            indicators: Indicators::blank(),
            field_position: 0,
            field_content: Vec::new(),
            control_value: "240101s2024".into(),
        };
        assert_eq!(change.proposed_field(), Some(Field::control("240101s2024")));

        let data = ChangeDescriptor::FieldAdded {
            tag: "700".into(),
            indicators: Indicators::blank(),
            field_position: 0,
            field_content: vec![Subfield::new('a', "Brown")],
            control_value: String::new(),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("control_value").is_none());
    }
}
