use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("field not found: {tag}[{position}]")]
    FieldNotFound { tag: String, position: usize },

    #[error("subfield not found: {tag}[{position}][{subfield}]")]
    SubfieldNotFound {
        tag: String,
        position: usize,
        subfield: usize,
    },

    #[error("position {position} out of range for tag {tag} ({len} fields)")]
    PositionOutOfRange {
        tag: String,
        position: usize,
        len: usize,
    },

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("invalid indicator: {0:?}")]
    InvalidIndicator(char),

    #[error("invalid subfield code: {0:?}")]
    InvalidSubfieldCode(char),

    #[error("field {0} has no content")]
    EmptyField(String),

    #[error("protected field: {0}")]
    ProtectedField(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
