use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Marks subfield content coming from a template that the user has not
/// confirmed yet.
pub const VOLATILE_PREFIX: &str = "VOLATILE:";

pub const BLANK_INDICATOR: char = ' ';

type SubfieldRepr = (char, String);
type FieldRepr = (Vec<Subfield>, char, char, String, i64);
type RecordRepr = BTreeMap<String, Vec<Field>>;

/// A `(code, value)` pair. Serialized as `["a", "value"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SubfieldRepr", into = "SubfieldRepr")]
pub struct Subfield {
    pub code: char,
    pub value: String,
}

impl Subfield {
    pub fn new(code: char, value: impl Into<String>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }

    pub fn volatile(code: char, value: &str) -> Self {
        Self {
            code,
            value: format!("{VOLATILE_PREFIX}{value}"),
        }
    }

    pub fn is_volatile(&self) -> bool {
        self.value.starts_with(VOLATILE_PREFIX)
    }

    /// Same code, value equal ignoring case.
    pub fn matches(&self, other: &Subfield) -> bool {
        self.code == other.code && self.value.to_lowercase() == other.value.to_lowercase()
    }
}

impl From<SubfieldRepr> for Subfield {
    fn from((code, value): SubfieldRepr) -> Self {
        Self { code, value }
    }
}

impl From<Subfield> for SubfieldRepr {
    fn from(sf: Subfield) -> Self {
        (sf.code, sf.value)
    }
}

/// The two indicator characters of a data field. Blank indicators are
/// displayed (and sent over the wire) as `_`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Indicators(pub char, pub char);

impl Indicators {
    pub fn blank() -> Self {
        Self(BLANK_INDICATOR, BLANK_INDICATOR)
    }

    /// Maps the display form `_` back to a blank.
    pub fn normalize(c: char) -> char {
        if c == '_' { BLANK_INDICATOR } else { c }
    }

    fn display_char(c: char) -> char {
        if c == BLANK_INDICATOR { '_' } else { c }
    }
}

impl fmt::Display for Indicators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            Self::display_char(self.0),
            Self::display_char(self.1)
        )
    }
}

impl FromStr for Indicators {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(a), Some(b), None) => Ok(Self(Self::normalize(a), Self::normalize(b))),
            _ => Err(CoreError::InvalidData(format!("invalid indicator pair: {s:?}"))),
        }
    }
}

impl Serialize for Indicators {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Indicators {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One field instance. Control fields keep their content in `control_value`
/// and have no subfields; data fields use `subfields`. Both slots always
/// exist. Serialized as `[subfields, ind1, ind2, controlValue, reserved]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FieldRepr", into = "FieldRepr")]
pub struct Field {
    pub subfields: Vec<Subfield>,
    pub ind1: char,
    pub ind2: char,
    pub control_value: String,
    pub reserved: i64,
}

impl Field {
    pub fn data(ind1: char, ind2: char, subfields: Vec<Subfield>) -> Self {
        Self {
            subfields,
            ind1: Indicators::normalize(ind1),
            ind2: Indicators::normalize(ind2),
            control_value: String::new(),
            reserved: 0,
        }
    }

    pub fn control(value: impl Into<String>) -> Self {
        Self {
            subfields: Vec::new(),
            ind1: BLANK_INDICATOR,
            ind2: BLANK_INDICATOR,
            control_value: value.into(),
            reserved: 0,
        }
    }

    pub fn indicators(&self) -> Indicators {
        Indicators(self.ind1, self.ind2)
    }

    pub fn is_control(&self) -> bool {
        self.subfields.is_empty() && !self.control_value.is_empty()
    }

    /// True when the field has subfields and all of them are volatile.
    pub fn is_volatile(&self) -> bool {
        !self.subfields.is_empty() && self.subfields.iter().all(Subfield::is_volatile)
    }

    /// Ordering of fields sharing a tag: by indicator pair, case-insensitive.
    pub fn cmp_indicators(&self, other: &Field) -> Ordering {
        self.ind1
            .to_ascii_lowercase()
            .cmp(&other.ind1.to_ascii_lowercase())
            .then(
                self.ind2
                    .to_ascii_lowercase()
                    .cmp(&other.ind2.to_ascii_lowercase()),
            )
    }

    /// Same subfield count, same codes in order, values equal ignoring case.
    pub fn subfields_match(&self, other: &Field) -> bool {
        self.subfields.len() == other.subfields.len()
            && self
                .subfields
                .iter()
                .zip(&other.subfields)
                .all(|(a, b)| a.matches(b))
    }
}

impl From<FieldRepr> for Field {
    fn from((subfields, ind1, ind2, control_value, reserved): FieldRepr) -> Self {
        Self {
            subfields,
            ind1,
            ind2,
            control_value,
            reserved,
        }
    }
}

impl From<Field> for FieldRepr {
    fn from(f: Field) -> Self {
        (f.subfields, f.ind1, f.ind2, f.control_value, f.reserved)
    }
}

/// A bibliographic record: tag to ordered field instances.
///
/// A tag present in the map always has at least one field; removing the last
/// field of a tag removes the tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RecordRepr", into = "RecordRepr")]
pub struct Record {
    fields: BTreeMap<String, Vec<Field>>,
}

impl From<RecordRepr> for Record {
    fn from(mut fields: RecordRepr) -> Self {
        fields.retain(|_, list| !list.is_empty());
        Self { fields }
    }
}

impl From<Record> for RecordRepr {
    fn from(record: Record) -> Self {
        record.fields
    }
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Tags in sorted order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Field])> {
        self.fields.iter().map(|(t, f)| (t.as_str(), f.as_slice()))
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.fields.contains_key(tag)
    }

    /// Fields under `tag`, empty when the tag is absent.
    pub fn fields(&self, tag: &str) -> &[Field] {
        self.fields.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn field_count(&self, tag: &str) -> usize {
        self.fields(tag).len()
    }

    pub fn field(&self, tag: &str, position: usize) -> Result<&Field, CoreError> {
        self.fields
            .get(tag)
            .and_then(|list| list.get(position))
            .ok_or_else(|| CoreError::FieldNotFound {
                tag: tag.to_string(),
                position,
            })
    }

    pub fn field_mut(&mut self, tag: &str, position: usize) -> Result<&mut Field, CoreError> {
        self.fields
            .get_mut(tag)
            .and_then(|list| list.get_mut(position))
            .ok_or_else(|| CoreError::FieldNotFound {
                tag: tag.to_string(),
                position,
            })
    }

    pub fn subfield(
        &self,
        tag: &str,
        position: usize,
        subfield: usize,
    ) -> Result<&Subfield, CoreError> {
        self.field(tag, position)?
            .subfields
            .get(subfield)
            .ok_or_else(|| CoreError::SubfieldNotFound {
                tag: tag.to_string(),
                position,
                subfield,
            })
    }

    fn subfield_mut(
        &mut self,
        tag: &str,
        position: usize,
        subfield: usize,
    ) -> Result<&mut Subfield, CoreError> {
        self.field_mut(tag, position)?
            .subfields
            .get_mut(subfield)
            .ok_or_else(|| CoreError::SubfieldNotFound {
                tag: tag.to_string(),
                position,
                subfield,
            })
    }

    /// Position a new field would take under `tag`: after every field whose
    /// indicators compare less than or equal to its own.
    pub fn field_position_for(&self, tag: &str, field: &Field) -> usize {
        self.fields(tag)
            .iter()
            .take_while(|existing| field.cmp_indicators(existing) != Ordering::Less)
            .count()
    }

    /// Insert following the indicator ordering rule. Returns the position.
    pub fn add_field(&mut self, tag: &str, field: Field) -> usize {
        let position = self.field_position_for(tag, &field);
        self.fields
            .entry(tag.to_string())
            .or_default()
            .insert(position, field);
        position
    }

    /// Insert at an explicit position (`position == len` appends).
    pub fn insert_field(
        &mut self,
        tag: &str,
        position: usize,
        field: Field,
    ) -> Result<(), CoreError> {
        let len = self.field_count(tag);
        if position > len {
            return Err(CoreError::PositionOutOfRange {
                tag: tag.to_string(),
                position,
                len,
            });
        }
        self.fields
            .entry(tag.to_string())
            .or_default()
            .insert(position, field);
        Ok(())
    }

    /// Remove a field. Deleting the last field under a tag removes the tag.
    pub fn delete_field(&mut self, tag: &str, position: usize) -> Result<Field, CoreError> {
        let list = self
            .fields
            .get_mut(tag)
            .filter(|list| position < list.len())
            .ok_or_else(|| CoreError::FieldNotFound {
                tag: tag.to_string(),
                position,
            })?;
        let removed = list.remove(position);
        if list.is_empty() {
            self.fields.remove(tag);
        }
        Ok(removed)
    }

    /// Swap in a new field at the same position, returning the old one.
    pub fn replace_field(
        &mut self,
        tag: &str,
        position: usize,
        field: Field,
    ) -> Result<Field, CoreError> {
        let slot = self.field_mut(tag, position)?;
        Ok(std::mem::replace(slot, field))
    }

    pub fn set_subfield_value(
        &mut self,
        tag: &str,
        position: usize,
        subfield: usize,
        value: impl Into<String>,
    ) -> Result<String, CoreError> {
        let sf = self.subfield_mut(tag, position, subfield)?;
        Ok(std::mem::replace(&mut sf.value, value.into()))
    }

    pub fn set_subfield_code(
        &mut self,
        tag: &str,
        position: usize,
        subfield: usize,
        code: char,
    ) -> Result<char, CoreError> {
        let sf = self.subfield_mut(tag, position, subfield)?;
        Ok(std::mem::replace(&mut sf.code, code))
    }

    pub fn set_control_value(
        &mut self,
        tag: &str,
        position: usize,
        value: impl Into<String>,
    ) -> Result<String, CoreError> {
        let field = self.field_mut(tag, position)?;
        Ok(std::mem::replace(&mut field.control_value, value.into()))
    }

    /// Append subfields to a field. Returns the index of the first one added.
    pub fn append_subfields(
        &mut self,
        tag: &str,
        position: usize,
        subfields: Vec<Subfield>,
    ) -> Result<usize, CoreError> {
        let field = self.field_mut(tag, position)?;
        let first = field.subfields.len();
        field.subfields.extend(subfields);
        Ok(first)
    }

    pub fn remove_subfield(
        &mut self,
        tag: &str,
        position: usize,
        subfield: usize,
    ) -> Result<Subfield, CoreError> {
        let field = self.field_mut(tag, position)?;
        if subfield >= field.subfields.len() {
            return Err(CoreError::SubfieldNotFound {
                tag: tag.to_string(),
                position,
                subfield,
            });
        }
        Ok(field.subfields.remove(subfield))
    }

    pub fn insert_subfield(
        &mut self,
        tag: &str,
        position: usize,
        index: usize,
        subfield: Subfield,
    ) -> Result<(), CoreError> {
        let field = self.field_mut(tag, position)?;
        if index > field.subfields.len() {
            return Err(CoreError::SubfieldNotFound {
                tag: tag.to_string(),
                position,
                subfield: index,
            });
        }
        field.subfields.insert(index, subfield);
        Ok(())
    }

    pub fn swap_fields(&mut self, tag: &str, a: usize, b: usize) -> Result<(), CoreError> {
        self.field(tag, a)?;
        self.field(tag, b)?;
        if let Some(list) = self.fields.get_mut(tag) {
            list.swap(a, b);
        }
        Ok(())
    }

    pub fn swap_subfields(
        &mut self,
        tag: &str,
        position: usize,
        a: usize,
        b: usize,
    ) -> Result<(), CoreError> {
        self.subfield(tag, position, a)?;
        self.subfield(tag, position, b)?;
        self.field_mut(tag, position)?.subfields.swap(a, b);
        Ok(())
    }

    /// Drop unconfirmed placeholder subfields, then any data field left
    /// without content.
    pub fn strip_volatile_subfields(&mut self) {
        for list in self.fields.values_mut() {
            for field in list.iter_mut() {
                field.subfields.retain(|sf| !sf.is_volatile());
            }
            list.retain(|f| !f.subfields.is_empty() || !f.control_value.is_empty());
        }
        self.fields.retain(|_, list| !list.is_empty());
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Content hash of the record, stable across identical snapshots.
    pub fn fingerprint(&self) -> Result<[u8; 32], CoreError> {
        let bytes = self.to_msgpack()?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}
