//! MARC syntax predicates and protected-field checks.
//!
//! These run before anything is sent to the server; a failure is shown on the
//! offending input and nothing is queued.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::record::{BLANK_INDICATOR, Field};

static CONTROL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^00[1-9A-Za-z]$").expect("valid regex"));

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:0[1-9A-Z][0-9A-Z]|0[1-9a-z][0-9a-z]|[1-9A-Z][0-9A-Z]{2}|[1-9a-z][0-9a-z]{2})$",
    )
    .expect("valid regex")
});

static INDICATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-z]$").expect("valid regex"));

static SUBFIELD_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r##"^[0-9a-z!"#$%&'()*+,\-./:;<=>?{}_^`~\[\]\\]$"##).expect("valid regex")
});

pub fn is_control_tag(tag: &str) -> bool {
    CONTROL_TAG.is_match(tag)
}

pub fn is_data_tag(tag: &str) -> bool {
    TAG.is_match(tag)
}

/// Blank (or its display form `_`) is always accepted.
pub fn is_valid_indicator(c: char) -> bool {
    c == BLANK_INDICATOR || c == '_' || INDICATOR.is_match(c.encode_utf8(&mut [0; 4]))
}

pub fn is_valid_subfield_code(c: char) -> bool {
    SUBFIELD_CODE.is_match(c.encode_utf8(&mut [0; 4]))
}

pub fn validate_tag(tag: &str) -> Result<(), CoreError> {
    if is_control_tag(tag) || is_data_tag(tag) {
        Ok(())
    } else {
        Err(CoreError::InvalidTag(tag.to_string()))
    }
}

pub fn validate_indicator(c: char) -> Result<(), CoreError> {
    if is_valid_indicator(c) {
        Ok(())
    } else {
        Err(CoreError::InvalidIndicator(c))
    }
}

pub fn validate_subfield_code(c: char) -> Result<(), CoreError> {
    if is_valid_subfield_code(c) {
        Ok(())
    } else {
        Err(CoreError::InvalidSubfieldCode(c))
    }
}

/// Full check of a field about to be added or replaced under `tag`.
pub fn validate_field(tag: &str, field: &Field) -> Result<(), CoreError> {
    if is_control_tag(tag) {
        if field.control_value.is_empty() {
            return Err(CoreError::EmptyField(tag.to_string()));
        }
        return Ok(());
    }
    if !is_data_tag(tag) {
        return Err(CoreError::InvalidTag(tag.to_string()));
    }
    validate_indicator(field.ind1)?;
    validate_indicator(field.ind2)?;
    if field.subfields.is_empty() {
        return Err(CoreError::EmptyField(tag.to_string()));
    }
    for sf in &field.subfields {
        validate_subfield_code(sf.code)?;
    }
    Ok(())
}

/// MARC address of a field or subfield, e.g. `100__a`. Control tags carry no
/// indicators.
pub fn marc_address(tag: &str, field: &Field, subfield_index: Option<usize>) -> String {
    let mut marc = tag.to_string();
    if !is_control_tag(tag) {
        marc.push(display_indicator(field.ind1));
        marc.push(display_indicator(field.ind2));
    }
    if let Some(sf) = subfield_index.and_then(|i| field.subfields.get(i)) {
        marc.push(sf.code);
    }
    marc
}

fn display_indicator(c: char) -> char {
    if c == BLANK_INDICATOR { '_' } else { c }
}

/// MARC prefixes the user may not add or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtectedFields(Vec<String>);

impl ProtectedFields {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(Into::into).collect())
    }

    /// True when the address, or any prefix of it at least a tag long, is
    /// listed.
    pub fn is_protected(&self, marc: &str) -> bool {
        let mut end = marc.len();
        while end >= 3 {
            if let Some(prefix) = marc.get(..end)
                && self.0.iter().any(|p| p == prefix)
            {
                return true;
            }
            end -= 1;
        }
        false
    }

    pub fn check(&self, marc: &str) -> Result<(), CoreError> {
        if self.is_protected(marc) {
            Err(CoreError::ProtectedField(marc.to_string()))
        } else {
            Ok(())
        }
    }
}
