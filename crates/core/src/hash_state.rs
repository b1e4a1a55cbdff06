//! Deep links into the editor, encoded in the URL fragment as
//! `#state=edit&recid=12&recrev=20240101120000&romode=true`.

use std::fmt;
use std::str::FromStr;

use crate::ids::RecId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditorHash {
    pub state: Option<String>,
    pub recid: Option<String>,
    pub recrev: Option<String>,
    pub romode: bool,
}

/// Where a hash leaves the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorState {
    StartPage,
    Edit {
        rec_id: RecId,
        revision: Option<String>,
        read_only: bool,
    },
    /// `state=edit` with a record id that is not a number.
    InvalidRecord(String),
    NewRecord,
    Submit(String),
    Cancel(String),
    DeleteRecord(String),
}

impl EditorHash {
    pub fn edit(rec_id: RecId, revision: Option<&str>, read_only: bool) -> Self {
        Self {
            state: Some("edit".to_string()),
            recid: Some(rec_id.to_string()),
            recrev: revision.map(str::to_string),
            romode: read_only,
        }
    }

    pub fn new_record() -> Self {
        Self {
            state: Some("newRecord".to_string()),
            ..Self::default()
        }
    }

    /// `None` for hashes that do not name a legal state; the caller keeps
    /// its current state.
    pub fn resolve(&self) -> Option<EditorState> {
        let state = self.state.as_deref()?;
        match &self.recid {
            Some(recid) => match state {
                "edit" => Some(match recid.parse::<u64>() {
                    Ok(id) => EditorState::Edit {
                        rec_id: RecId(id),
                        revision: self
                            .recrev
                            .clone()
                            .filter(|rev| !rev.is_empty() && rev != "0"),
                        read_only: self.romode,
                    },
                    Err(_) => EditorState::InvalidRecord(recid.clone()),
                }),
                "submit" => Some(EditorState::Submit(recid.clone())),
                "cancel" => Some(EditorState::Cancel(recid.clone())),
                "deleteRecord" => Some(EditorState::DeleteRecord(recid.clone())),
                _ => None,
            },
            None => match state {
                "edit" => Some(EditorState::StartPage),
                "newRecord" => Some(EditorState::NewRecord),
                _ => None,
            },
        }
    }
}

impl FromStr for EditorHash {
    type Err = std::convert::Infallible;

    /// Pairs that are not exactly `key=value` are ignored, as are unknown keys.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hash = Self::default();
        for pair in s.trim_start_matches('#').split('&') {
            let mut parts = pair.split('=');
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            match key {
                "state" => hash.state = Some(value.to_string()),
                "recid" => hash.recid = Some(value.to_string()),
                "recrev" => hash.recrev = Some(value.to_string()),
                "romode" => hash.romode = value == "true",
                _ => {}
            }
        }
        Ok(hash)
    }
}

impl fmt::Display for EditorHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs = Vec::new();
        if let Some(state) = &self.state {
            pairs.push(format!("state={state}"));
        }
        if let Some(recid) = &self.recid {
            pairs.push(format!("recid={recid}"));
        }
        if let Some(recrev) = &self.recrev {
            pairs.push(format!("recrev={recrev}"));
        }
        if self.romode {
            pairs.push("romode=true".to_string());
        }
        write!(f, "#{}", pairs.join("&"))
    }
}
