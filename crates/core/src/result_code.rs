use std::fmt;

use serde::{Deserialize, Serialize};

/// Server outcome code carried in every response as `resultCode`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(pub u16);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResultClass {
    /// Normal outcome; the message is a status report.
    Report,
    /// The user's session timed out; the page must be reloaded.
    SessionExpired,
    /// The record cannot be edited right now (permissions, locks, missing or
    /// changed cache). Local state is discarded.
    RecordUnavailable,
    /// The server rejected the record content; `errors` lists why.
    InvalidContent,
    Error,
}

impl ResultCode {
    pub const OK: Self = Self(0);
    pub const RECORD_LOADED: Self = Self(3);
    pub const RECORD_SUBMITTED: Self = Self(4);
    pub const RECORD_CANCELLED: Self = Self(5);
    pub const CACHE_DELETED: Self = Self(9);
    pub const HP_CHANGESET_LOADED: Self = Self(12);
    pub const HP_CHANGESET_DELETED: Self = Self(13);
    pub const BULK_APPLIED: Self = Self(20);
    pub const SESSION_EXPIRED: Self = Self(100);
    pub const PERMISSION_DENIED: Self = Self(101);
    pub const NON_EXISTENT_RECORD: Self = Self(102);
    pub const DELETED_RECORD: Self = Self(103);
    pub const LOCKED_BY_USER: Self = Self(104);
    pub const LOCKED_BY_QUEUE: Self = Self(105);
    pub const CACHE_MISSING: Self = Self(106);
    pub const CACHE_CHANGED: Self = Self(107);
    pub const INVALID_CONTENT: Self = Self(110);
    pub const UNKNOWN_REQUEST: Self = Self(111);
    pub const NO_CHANGESET: Self = Self(112);

    pub fn class(self) -> ResultClass {
        match self.0 {
            100 => ResultClass::SessionExpired,
            101..=109 => ResultClass::RecordUnavailable,
            110 => ResultClass::InvalidContent,
            111..=120 => ResultClass::Error,
            _ if self.0 < 100 => ResultClass::Report,
            _ => ResultClass::Error,
        }
    }

    pub fn is_success(self) -> bool {
        self.class() == ResultClass::Report
    }

    pub fn message(self) -> &'static str {
        match self.0 {
            0 => "",
            1 => "Search completed",
            2 => "Tickets retrieved",
            3 => "Record loaded",
            4 => "Record submitted",
            5 => "Cancelled",
            6 => "Record created (new)",
            7 => "Record created (from template)",
            8 => "Record created (from existing)",
            9 => "Cache deleted",
            10 => "Record ready for merge",
            11 => "Field added",
            12 => "Holding Pen changeset loaded",
            13 => "Holding Pen changeset deleted",
            14 => "Holding Pen changes updated",
            15 => "Subfield(s) added",
            16 => "Field(s) deleted",
            17 => "Content modified",
            18 => "Field moved",
            19 => "Subfield moved",
            20 => "Bulk updates applied",
            100 => "Error: Not logged in",
            101 => "Error: Permission denied",
            102 => "Error: Non-existent record",
            103 => "Error: Deleted record",
            104 => "Error: Record locked by user",
            105 => "Error: Record locked by queue",
            106 => "Error: Cache file missing",
            107 => "Error: Cache file changed",
            108 => "Error: Record locked by merge",
            109 => "Error: Record already being edited",
            110 => "Error: Invalid record content",
            111 => "Error: Unknown request type",
            112 => "Error: Holding Pen changeset not found",
            113 => "Error: Could not save cache",
            _ => "Unknown result code",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(ResultCode(3).class(), ResultClass::Report);
        assert_eq!(ResultCode::SESSION_EXPIRED.class(), ResultClass::SessionExpired);
        for code in 101..=109 {
            assert_eq!(ResultCode(code).class(), ResultClass::RecordUnavailable);
        }
        assert_eq!(ResultCode(110).class(), ResultClass::InvalidContent);
        assert_eq!(ResultCode(115).class(), ResultClass::Error);
        assert_eq!(ResultCode(500).class(), ResultClass::Error);
    }

    #[test]
    fn only_reports_succeed() {
        assert!(ResultCode::OK.is_success());
        assert!(ResultCode::BULK_APPLIED.is_success());
        assert!(!ResultCode::CACHE_CHANGED.is_success());
        assert!(!ResultCode::INVALID_CONTENT.is_success());
    }

    #[test]
    fn messages() {
        assert_eq!(ResultCode::CACHE_CHANGED.message(), "Error: Cache file changed");
        assert!(ResultCode(99).to_string().starts_with("99"));
    }
}
