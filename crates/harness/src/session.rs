use bibedit_core::{Field, ManualClock, RecId, Record, Subfield, UserId};
use bibedit_engine::{Editor, EditorConfig, EngineError};
use bibedit_storage::StorageError;

use crate::server::MockServer;

pub const TEST_USER: UserId = UserId(1);
pub const START_MS: u64 = 1_700_000_000_000;

/// An editor wired to a [`MockServer`] on simulated time.
pub struct TestSession {
    pub editor: Editor<MockServer, ManualClock>,
    pub clock: ManualClock,
}

impl TestSession {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(EditorConfig::default())
    }

    pub fn with_config(config: EditorConfig) -> Result<Self, Box<dyn std::error::Error>> {
        crate::init_logging();
        let clock = ManualClock::new(START_MS);
        let server = MockServer::new(clock.clone(), TEST_USER)?;
        let editor = Editor::new(server, clock.clone(), config)?;
        Ok(Self { editor, clock })
    }

    /// Store `record` on the server and open it for editing.
    pub fn open(&mut self, rec_id: RecId, record: Record) -> Result<(), EngineError> {
        self.server_mut().put_record(rec_id, record);
        self.editor.load(rec_id, None, false)
    }

    pub fn server(&self) -> &MockServer {
        self.editor.transport()
    }

    pub fn server_mut(&mut self) -> &mut MockServer {
        self.editor.transport_mut()
    }

    pub fn advance(&self, ms: u64) {
        self.clock.advance(ms);
    }

    /// The server's cached copy of the open record.
    pub fn server_copy(&self) -> Result<Option<Record>, StorageError> {
        match self.editor.rec_id() {
            Some(rec_id) => self.server().cached_record(rec_id),
            None => Ok(None),
        }
    }
}

pub fn data_field(ind1: char, ind2: char, subfields: &[(char, &str)]) -> Field {
    Field::data(
        ind1,
        ind2,
        subfields.iter().map(|(c, v)| Subfield::new(*c, *v)).collect(),
    )
}

/// A small article record: identifiers, one author, a title and two
/// co-authors.
pub fn article() -> Record {
    let mut record = Record::new();
    record.add_field("001", Field::control("42"));
    record.add_field("005", Field::control("20240101120000.0"));
    record.add_field("100", data_field(' ', ' ', &[('a', "Smith, J."), ('u', "CERN")]));
    record.add_field("245", data_field(' ', ' ', &[('a', "On bibliographic records")]));
    record.add_field("700", data_field(' ', ' ', &[('a', "Jones, A."), ('u', "DESY")]));
    record.add_field("700", data_field(' ', ' ', &[('a', "Brown, B.")]));
    record
}
