//! Runtime configuration for the terminal orchestration core.
//!
//! The daemon builds a [`TerminalConfig`] from its command line; tests build one by hand
//! with short grace periods and stand-in binaries.

use crate::errors::{SessionError, SessionResult};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAIN_PORT: u16 = 7681;
pub const DEFAULT_FIRST_DYNAMIC_PORT: u16 = 7682;
pub const DEFAULT_MAX_DYNAMIC_PORT: u16 = 7781;
pub const SESSION_PREFIX: &str = "cmd_wave_term_";
const THEME_FILE: &str = ".tmux.conf.cmdwave";

/// Bounded waits applied to every interaction with an external process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// How long a freshly spawned ttyd must survive before it counts as running.
    pub spawn_grace: Duration,
    /// Wait after SIGTERM before escalating to SIGKILL, and again after SIGKILL.
    pub terminate_grace: Duration,
    pub kill_session: Duration,
    pub send_keys: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            spawn_grace: Duration::from_millis(500),
            terminate_grace: Duration::from_secs(1),
            kill_session: Duration::from_secs(2),
            send_keys: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub main_port: u16,
    pub first_dynamic_port: u16,
    pub max_dynamic_port: u16,
    pub ttyd_bin: String,
    pub tmux_bin: String,
    /// Optional themed tmux configuration, loaded when present on disk.
    pub tmux_config: Option<PathBuf>,
    /// Force tmux built-in defaults even if the themed file exists.
    pub use_default_tmux_config: bool,
    /// Host name placed in the connect URLs handed back to clients.
    pub public_host: String,
    pub timeouts: Timeouts,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            main_port: DEFAULT_MAIN_PORT,
            first_dynamic_port: DEFAULT_FIRST_DYNAMIC_PORT,
            max_dynamic_port: DEFAULT_MAX_DYNAMIC_PORT,
            ttyd_bin: "ttyd".to_string(),
            tmux_bin: "tmux".to_string(),
            tmux_config: default_tmux_config(),
            use_default_tmux_config: false,
            public_host: "localhost".to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

impl TerminalConfig {
    pub fn validate(&self) -> SessionResult<()> {
        if self.first_dynamic_port > self.max_dynamic_port {
            return Err(SessionError::InvalidRequest(format!(
                "dynamic port range {}-{} is empty",
                self.first_dynamic_port, self.max_dynamic_port
            )));
        }
        if (self.first_dynamic_port..=self.max_dynamic_port).contains(&self.main_port) {
            return Err(SessionError::InvalidRequest(format!(
                "main port {} must lie outside the dynamic range {}-{}",
                self.main_port, self.first_dynamic_port, self.max_dynamic_port
            )));
        }
        if self.public_host.trim().is_empty() {
            return Err(SessionError::InvalidRequest(
                "public host must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.public_host)
    }
}

/// tmux session name for the terminal bound to `port`.
pub fn session_name(port: u16) -> String {
    format!("{SESSION_PREFIX}{port}")
}

pub fn default_tmux_config() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(THEME_FILE))
}
