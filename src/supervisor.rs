use crate::config::{session_name, TerminalConfig, Timeouts};
use crate::errors::{SessionError, SessionResult, SpawnFailure};
use crate::port_pool::PortProbe;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use which::which;

/// Owned handle to one ttyd process and the tmux client it runs.
///
/// ttyd is started as the leader of its own process group so signals reach the tmux
/// client as well.
#[derive(Debug)]
pub struct TerminalProcess {
    port: u16,
    pid: Option<u32>,
    child: Child,
}

impl TerminalProcess {
    pub fn from_child(port: u16, child: Child) -> Self {
        let pid = child.id();
        Self { port, pid, child }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, then SIGKILL once `grace` elapses. Returns whether the process is known
    /// to be gone. A handle whose process already exited counts as stopped.
    pub async fn terminate(&mut self, grace: Duration) -> bool {
        if !self.is_alive() {
            debug!(port = self.port, pid = ?self.pid, "process already terminated");
            return true;
        }

        info!(port = self.port, pid = ?self.pid, "terminating ttyd process");
        self.signal_group(Signal::SIGTERM);
        if let Ok(Ok(_)) = timeout(grace, self.child.wait()).await {
            return true;
        }

        warn!(
            port = self.port,
            pid = ?self.pid,
            "ttyd did not terminate gracefully, killing"
        );
        self.kill(grace).await
    }

    /// SIGKILL without a graceful phase, waiting up to `grace` for the reap.
    pub async fn kill(&mut self, grace: Duration) -> bool {
        if !self.is_alive() {
            return true;
        }

        self.signal_group(Signal::SIGKILL);
        if let Err(error) = self.child.start_kill() {
            if error.kind() != ErrorKind::InvalidInput {
                warn!(port = self.port, pid = ?self.pid, "failed to kill ttyd: {error}");
            }
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(_)) => true,
            Ok(Err(error)) => {
                error!(port = self.port, pid = ?self.pid, "error waiting for killed ttyd: {error}");
                false
            }
            Err(_) => {
                error!(port = self.port, pid = ?self.pid, "killed ttyd was not reaped in time");
                false
            }
        }
    }

    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        if let Err(error) = killpg(Pid::from_raw(pid as i32), signal) {
            debug!(port = self.port, pid, %signal, "signalling process group failed: {error}");
        }
    }
}

/// Starts ttyd processes that each host a new tmux session.
pub struct ProcessSupervisor {
    ttyd_bin: String,
    tmux_bin: String,
    tmux_config: Option<PathBuf>,
    timeouts: Timeouts,
    probe: Arc<dyn PortProbe>,
}

impl ProcessSupervisor {
    pub fn new(config: &TerminalConfig, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            ttyd_bin: config.ttyd_bin.clone(),
            tmux_bin: config.tmux_bin.clone(),
            tmux_config: config.tmux_config.clone(),
            timeouts: config.timeouts.clone(),
            probe,
        }
    }

    /// Arguments handed to tmux after the binary, e.g. `-f theme.conf new -s name`.
    pub fn tmux_args(&self, session: &str, use_custom_config: bool) -> Vec<String> {
        let mut args = Vec::new();

        if use_custom_config {
            match &self.tmux_config {
                Some(path) if path.is_file() => {
                    args.push("-f".to_string());
                    args.push(path.to_string_lossy().to_string());
                }
                Some(path) => {
                    warn!(
                        path = %path.display(),
                        "themed tmux config not found; using tmux defaults"
                    );
                }
                None => warn!("no themed tmux config configured; using tmux defaults"),
            }
        }

        args.extend(["new", "-s", session].map(String::from));
        args
    }

    pub async fn spawn(&self, port: u16, use_custom_config: bool) -> SessionResult<TerminalProcess> {
        if !self.probe.is_free(port) {
            error!(port, "port is already in use; cannot start ttyd");
            return Err(SessionError::SpawnFailed {
                port,
                reason: SpawnFailure::Other(format!("port {port} is already in use")),
            });
        }

        let ttyd = find_binary(&self.ttyd_bin)?;
        let tmux = find_binary(&self.tmux_bin)?;
        let session = session_name(port);

        let mut command = Command::new(&ttyd);
        command
            .arg("-p")
            .arg(port.to_string())
            .arg("-W")
            .arg(&tmux)
            .args(self.tmux_args(&session, use_custom_config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .process_group(0);

        #[cfg(target_os = "linux")]
        // SAFETY: prctl is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }

        info!(port, %session, "starting ttyd: {ttyd} -p {port} -W {tmux} new -s {session}");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                error!(fatal = true, port, "'{ttyd}' could not be executed: {error}");
                return Err(SessionError::MissingBinary(self.ttyd_bin.clone()));
            }
            Err(error) => {
                error!(port, ?error, "failed to start ttyd process");
                return Err(SessionError::SpawnFailed {
                    port,
                    reason: SpawnFailure::Other(error.to_string()),
                });
            }
        };

        let pid = child.id();
        sleep(self.timeouts.spawn_grace).await;

        match child.try_wait() {
            Ok(None) => {
                info!(port, pid = ?pid, %session, "ttyd <-> tmux running");
                Ok(TerminalProcess::from_child(port, child))
            }
            Ok(Some(status)) => {
                error!(port, pid = ?pid, %status, "ttyd process exited immediately");
                Err(SessionError::SpawnFailed {
                    port,
                    reason: SpawnFailure::ImmediateExit(status.code()),
                })
            }
            Err(error) => {
                let _ = child.start_kill();
                error!(port, pid = ?pid, ?error, "could not poll new ttyd process");
                Err(SessionError::SpawnFailed {
                    port,
                    reason: SpawnFailure::Other(error.to_string()),
                })
            }
        }
    }
}

pub(crate) fn find_binary(name: &str) -> SessionResult<String> {
    let path = which(name).map_err(|_| {
        error!(
            fatal = true,
            "'{name}' not found; ensure ttyd and tmux are installed and in PATH"
        );
        SessionError::MissingBinary(name.to_owned())
    })?;
    Ok(path.to_string_lossy().to_string())
}
