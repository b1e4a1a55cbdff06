pub mod config;
pub mod diff;
pub mod editor;
pub mod error;
pub mod holding_pen;
pub mod poll;
pub mod queue;
pub mod replay;
pub mod undo;

pub use config::EditorConfig;
pub use diff::{DiffOptions, diff_records, filter_changes};
pub use editor::{Editor, TickOutcome, UndoOutcome};
pub use error::EngineError;
pub use holding_pen::{AggregatedChanges, HoldingPen};
pub use poll::PollBackoff;
pub use queue::{FlushOutcome, RequestQueue, Transport, TransportError};
pub use replay::{ReplayDirection, replay};
pub use undo::UndoManager;
