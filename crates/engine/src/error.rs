use bibedit_core::{CoreError, RecId, ResultCode};
use bibedit_storage::StorageError;
use thiserror::Error;

use crate::queue::TransportError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no record loaded")]
    NoRecordLoaded,

    #[error("editor is in read-only mode")]
    ReadOnly,

    #[error("session expired while editing record {0:?}")]
    SessionExpired(Option<RecId>),

    #[error("record unavailable: {0}")]
    RecordUnavailable(ResultCode),

    #[error("invalid record content: {}", .0.join("; "))]
    InvalidContent(Vec<String>),

    #[error("cache outdated: the stored record changed since editing started")]
    CacheOutdated,

    #[error("server error: {0}")]
    Server(ResultCode),

    #[error("unapplied holding pen changes are still displayed")]
    UnprocessedChanges,

    #[error("holding pen change not found: {0}")]
    HpChangeNotFound(usize),

    #[error("holding pen change already processed: {0}")]
    HpChangeAlreadyProcessed(usize),

    #[error("holding pen changeset not found: {0}")]
    HpChangesetNotFound(u64),

    #[error("change cannot be applied: {0}")]
    ChangeNotApplicable(String),

    #[error("invalid move: {0}")]
    InvalidMove(String),
}
