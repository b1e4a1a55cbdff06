pub mod change;
pub mod clock;
pub mod error;
pub mod hash_state;
pub mod ids;
pub mod operations;
pub mod record;
pub mod request;
pub mod result_code;
pub mod validation;

pub use change::{ChangeDescriptor, HpChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use hash_state::{EditorHash, EditorState};
pub use ids::*;
pub use operations::{DeletedField, DeletedSubfield, Direction, UndoOperation};
pub use record::{Field, Indicators, Record, Subfield};
pub use request::{DeleteSelection, EditRequest, RequestEnvelope, Response, UndoRedo};
pub use result_code::{ResultClass, ResultCode};
