//! Thin client for the tmux commands the orchestrator needs.

use crate::errors::{SessionError, SessionResult};
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// How a failed tmux invocation should be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFailure {
    /// The target session or the whole tmux server no longer exists.
    DeadSession,
    Other(String),
}

/// Classifies tmux diagnostic output.
///
/// tmux does not report failures in a structured way, so this matches its wording. An
/// explicit `has-session` probe could replace it.
pub fn classify_failure(stderr: &str) -> RelayFailure {
    let lower = stderr.to_lowercase();
    if lower.contains("session not found")
        || lower.contains("can't find session")
        || lower.contains("no server running")
    {
        RelayFailure::DeadSession
    } else {
        RelayFailure::Other(stderr.trim().to_string())
    }
}

#[derive(Clone, Debug)]
pub struct Tmux {
    bin: String,
}

impl Tmux {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// `tmux kill-session -t <session>`. The exit status is ignored: a session that is
    /// already gone is as good as killed.
    pub async fn kill_session(&self, session: &str, limit: Duration) -> SessionResult<()> {
        info!(%session, "killing tmux session");
        let mut command = Command::new(&self.bin);
        command
            .args(["kill-session", "-t", session])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match timeout(limit, command.status()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(self.io_error(error)),
            Err(_) => Err(SessionError::Timeout(format!("tmux kill-session -t {session}"))),
        }
    }

    /// Types `text` into the session literally.
    pub async fn send_keys(&self, session: &str, text: &str, limit: Duration) -> SessionResult<()> {
        let mut command = Command::new(&self.bin);
        command
            .args(["send-keys", "-t", session, "-l", text])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match timeout(limit, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => return Err(self.io_error(error)),
            Err(_) => {
                error!(%session, "timeout sending keys to tmux");
                return Err(SessionError::Timeout(format!("tmux send-keys -t {session}")));
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        match classify_failure(&stderr) {
            RelayFailure::DeadSession => {
                warn!(%session, "tmux session not found or server dead");
                Err(SessionError::SessionGone(session.to_string()))
            }
            RelayFailure::Other(message) => {
                error!(%session, status = %output.status, stderr = %message, "tmux error sending keys");
                Err(SessionError::MultiplexerError(message))
            }
        }
    }

    fn io_error(&self, error: std::io::Error) -> SessionError {
        if error.kind() == ErrorKind::NotFound {
            error!(fatal = true, "'{}' not found; cannot talk to tmux", self.bin);
            SessionError::MissingBinary(self.bin.clone())
        } else {
            SessionError::Io(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_dead_session_messages() {
        assert_eq!(
            classify_failure("session not found: cmd_wave_term_7682\n"),
            RelayFailure::DeadSession
        );
        assert_eq!(
            classify_failure("can't find session: cmd_wave_term_7682"),
            RelayFailure::DeadSession
        );
        assert_eq!(
            classify_failure("no server running on /tmp/tmux-0/default"),
            RelayFailure::DeadSession
        );
        assert_eq!(
            classify_failure("No Server Running on /tmp/tmux-0/default"),
            RelayFailure::DeadSession
        );
    }

    #[test]
    fn keeps_other_diagnostics_verbatim() {
        assert_eq!(
            classify_failure("  unknown flag -z\n"),
            RelayFailure::Other("unknown flag -z".to_string())
        );
    }

    #[tokio::test]
    async fn missing_binary_is_distinct() {
        let tmux = Tmux::new("/nonexistent/cmdwave-tmux");
        let error = tmux
            .send_keys("s", "ls\n", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, SessionError::MissingBinary(_)));
    }
}
