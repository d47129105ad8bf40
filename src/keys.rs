use crate::errors::{SessionError, SessionResult};
use crate::registry::SessionRegistry;
use crate::tmux::Tmux;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Types text into running terminals, healing the registry when tmux reports the
/// session is gone.
pub struct KeyInjector {
    registry: Arc<SessionRegistry>,
    tmux: Tmux,
    send_timeout: Duration,
    kill_grace: Duration,
}

impl KeyInjector {
    pub fn new(
        registry: Arc<SessionRegistry>,
        tmux: Tmux,
        send_timeout: Duration,
        kill_grace: Duration,
    ) -> Self {
        Self {
            registry,
            tmux,
            send_timeout,
            kill_grace,
        }
    }

    pub async fn send(&self, port: u16, text: &str) -> SessionResult<()> {
        let Some(ticket) = self.registry.ticket(port).await else {
            error!(port, "send keys failed: no active tmux session for port");
            self.kill_stale(port).await;
            return Err(SessionError::SessionNotFound(port));
        };

        let session = ticket.name;
        info!(port, %session, "sending keys to tmux");
        let text = with_trailing_newline(text);

        match self.tmux.send_keys(&session, &text, self.send_timeout).await {
            Ok(()) => {
                info!(port, %session, "keys sent");
                Ok(())
            }
            Err(SessionError::SessionGone(name)) => {
                self.forget_dead_session(port, ticket.generation).await;
                Err(SessionError::SessionGone(name))
            }
            Err(error) => Err(error),
        }
    }

    /// Drops the session the failed send was aimed at. If the port was deleted and
    /// recreated while tmux was answering, the new session stays.
    async fn forget_dead_session(&self, port: u16, generation: u64) {
        if let Some(mut session) = self.registry.remove_if(port, generation).await {
            warn!(port, session = %session.name, "dropping dead session from registry");
            if !session.process.kill(self.kill_grace).await {
                self.registry.park_stale(port, session.process).await;
            }
        }
    }

    async fn kill_stale(&self, port: u16) {
        for mut process in self.registry.take_stale(port).await {
            warn!(port, pid = ?process.pid(), "killing stale ttyd without a session");
            if !process.kill(self.kill_grace).await {
                self.registry.park_stale(port, process).await;
            }
        }
    }
}

fn with_trailing_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}
