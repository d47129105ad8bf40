use crate::config::session_name;
use crate::errors::{SessionError, SessionResult};
use crate::models::SessionState;
use crate::supervisor::TerminalProcess;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One running terminal: a tmux session and the ttyd process exposing it.
#[derive(Debug)]
pub struct Session {
    pub port: u16,
    pub name: String,
    pub process: TerminalProcess,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// Assigned by [`SessionRegistry::register`]; distinguishes reuses of the same port.
    generation: u64,
}

impl Session {
    pub fn running(process: TerminalProcess) -> Self {
        let port = process.port();
        Self {
            port,
            name: session_name(port),
            process,
            state: SessionState::Running,
            started_at: Utc::now(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Names one registration of a port. A session registered later on the same port carries a
/// different generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTicket {
    pub name: String,
    pub generation: u64,
}

/// Read-only view of a registered session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub port: u16,
    pub name: String,
    pub pid: Option<u32>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: BTreeMap<u16, Session>,
    /// Processes that lost their session mapping or could not be confirmed dead.
    stale: BTreeMap<u16, Vec<TerminalProcess>>,
    next_generation: u64,
}

/// Port → session map. Every operation takes the lock once, so compound changes like
/// "detach and return" happen atomically and handles are moved out before any process I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, mut session: Session) -> SessionResult<()> {
        let mut state = self.inner.lock().await;
        if state.sessions.contains_key(&session.port) {
            warn!(port = session.port, "refusing to register already tracked port");
            return Err(SessionError::AlreadyTracked(session.port));
        }
        state.next_generation += 1;
        session.generation = state.next_generation;
        debug!(
            port = session.port,
            session = %session.name,
            generation = session.generation,
            "registered session"
        );
        state.sessions.insert(session.port, session);
        Ok(())
    }

    pub async fn lookup(&self, port: u16) -> Option<String> {
        let state = self.inner.lock().await;
        state.sessions.get(&port).map(|session| session.name.clone())
    }

    /// Like [`lookup`](Self::lookup), but also identifies which registration answered.
    pub async fn ticket(&self, port: u16) -> Option<SessionTicket> {
        let state = self.inner.lock().await;
        state.sessions.get(&port).map(|session| SessionTicket {
            name: session.name.clone(),
            generation: session.generation,
        })
    }

    pub async fn contains(&self, port: u16) -> bool {
        let state = self.inner.lock().await;
        state.sessions.contains_key(&port) || state.stale.contains_key(&port)
    }

    /// Detaches the session for `port`. Of several concurrent callers exactly one gets it.
    pub async fn remove(&self, port: u16) -> Option<Session> {
        let mut state = self.inner.lock().await;
        state.sessions.remove(&port)
    }

    /// Detaches the session for `port` only if it is still the registration `generation`
    /// refers to. A newer session on the same port is left alone.
    pub async fn remove_if(&self, port: u16, generation: u64) -> Option<Session> {
        let mut state = self.inner.lock().await;
        match state.sessions.get(&port) {
            Some(session) if session.generation == generation => state.sessions.remove(&port),
            Some(session) => {
                debug!(
                    port,
                    expected = generation,
                    found = session.generation,
                    "port was re-registered; keeping newer session"
                );
                None
            }
            None => None,
        }
    }

    /// Keeps a process handle that still needs killing.
    pub async fn park_stale(&self, port: u16, process: TerminalProcess) {
        warn!(port, pid = ?process.pid(), "keeping stale ttyd handle for later cleanup");
        let mut state = self.inner.lock().await;
        state.stale.entry(port).or_default().push(process);
    }

    pub async fn take_stale(&self, port: u16) -> Vec<TerminalProcess> {
        let mut state = self.inner.lock().await;
        state.stale.remove(&port).unwrap_or_default()
    }

    /// Every port with a session or a stale handle.
    pub async fn all_ports(&self) -> BTreeSet<u16> {
        let state = self.inner.lock().await;
        state
            .sessions
            .keys()
            .chain(state.stale.keys())
            .copied()
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let state = self.inner.lock().await;
        state
            .sessions
            .values()
            .map(|session| SessionSnapshot {
                port: session.port,
                name: session.name.clone(),
                pid: session.process.pid(),
                state: session.state,
                started_at: session.started_at,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        let state = self.inner.lock().await;
        state.sessions.is_empty() && state.stale.is_empty()
    }
}
