use crate::commands::CommandStore;
use crate::documents::DocumentLibrary;
use crate::errors::SessionResult;
use crate::models::{DeleteOutcome, TerminalCreated, TerminalSummary};
use crate::notes::NoteStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Terminal lifecycle operations exposed to the HTTP layer.
#[async_trait]
pub trait TerminalService: Send + Sync + 'static {
    async fn create(&self) -> SessionResult<TerminalCreated>;
    async fn list(&self) -> SessionResult<Vec<TerminalSummary>>;
    /// Stops the terminal on `port`. The main terminal is refused with `Forbidden`.
    async fn delete(&self, port: u16) -> SessionResult<DeleteOutcome>;
    async fn send_keys(&self, port: u16, text: String) -> SessionResult<()>;
}

#[derive(Clone)]
pub struct AppState {
    pub terminals: Arc<dyn TerminalService>,
    pub commands: CommandStore,
    pub notes: NoteStore,
    pub documents: DocumentLibrary,
}

impl AppState {
    pub fn new(
        terminals: Arc<dyn TerminalService>,
        commands: CommandStore,
        notes: NoteStore,
        documents: DocumentLibrary,
    ) -> Self {
        Self {
            terminals,
            commands,
            notes,
            documents,
        }
    }
}

#[allow(dead_code)]
fn assert_app_state_bounds() {
    fn assert_state<T: Clone + Send + Sync + 'static>() {}
    assert_state::<AppState>();
}
