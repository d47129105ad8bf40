use crate::config::TerminalConfig;
use crate::errors::{SessionError, SessionResult};
use crate::keys::KeyInjector;
use crate::models::{DeleteOutcome, SessionState, TerminalCreated, TerminalSummary};
use crate::port_pool::{LoopbackProbe, PortAllocator, PortProbe};
use crate::registry::{Session, SessionRegistry};
use crate::service::TerminalService;
use crate::supervisor::{ProcessSupervisor, TerminalProcess};
use crate::tmux::Tmux;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Result of tearing down one port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown {
    Stopped,
    AlreadyClean,
    /// A live process could not be confirmed dead; its handle stays in the registry.
    Incomplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Exit,
    Signal(Signal),
}

impl ShutdownTrigger {
    /// Exit status the parent should use after sweeping, if it must exit at all.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ShutdownTrigger::Exit => None,
            ShutdownTrigger::Signal(signal) => Some(128 + *signal as i32),
        }
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Exit => f.write_str("exit"),
            ShutdownTrigger::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<u16>,
    pub incomplete: Vec<u16>,
}

/// Owns every terminal the service starts, from allocation to the final sweep.
pub struct TerminalManager {
    config: TerminalConfig,
    /// Held for the whole allocate → spawn → register sequence, so creates are serial.
    allocator: Mutex<PortAllocator>,
    supervisor: ProcessSupervisor,
    registry: Arc<SessionRegistry>,
    tmux: Tmux,
    keys: KeyInjector,
}

impl TerminalManager {
    pub fn new(config: TerminalConfig) -> SessionResult<Self> {
        Self::with_probe(config, Arc::new(LoopbackProbe))
    }

    pub fn with_probe(config: TerminalConfig, probe: Arc<dyn PortProbe>) -> SessionResult<Self> {
        config.validate()?;

        let allocator = PortAllocator::with_probe(
            config.first_dynamic_port,
            config.max_dynamic_port,
            config.main_port,
            probe.clone(),
        );
        let supervisor = ProcessSupervisor::new(&config, probe);
        let registry = Arc::new(SessionRegistry::new());
        let tmux = Tmux::new(config.tmux_bin.clone());
        let keys = KeyInjector::new(
            registry.clone(),
            tmux.clone(),
            config.timeouts.send_keys,
            config.timeouts.terminate_grace,
        );

        Ok(Self {
            config,
            allocator: Mutex::new(allocator),
            supervisor,
            registry,
            tmux,
            keys,
        })
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn allocator_cursor(&self) -> u16 {
        self.allocator.lock().await.cursor()
    }

    /// The port the next create would try first.
    pub async fn next_port_hint(&self) -> Option<u16> {
        let allocator = self.allocator.lock().await;
        let tracked = self.registry.all_ports().await;
        allocator.peek(|port| tracked.contains(&port))
    }

    fn use_custom_config(&self) -> bool {
        !self.config.use_default_tmux_config
    }

    /// Starts the reserved main terminal. Failure leaves the service running without it.
    pub async fn start_main_session(&self, use_custom_config: bool) -> SessionResult<()> {
        let port = self.config.main_port;
        info!(port, "starting main terminal");

        if self.registry.contains(port).await {
            warn!(port, "main terminal already tracked; not starting another");
            return Err(SessionError::AlreadyTracked(port));
        }

        let process = match self.supervisor.spawn(port, use_custom_config).await {
            Ok(process) => process,
            Err(error) => {
                error!(fatal = true, port, "CRITICAL: failed to start main terminal: {error}");
                return Err(error);
            }
        };

        let pid = process.pid();
        self.register_or_discard(process).await?;
        info!(port, pid = ?pid, "main terminal running");
        Ok(())
    }

    async fn register_or_discard(&self, process: TerminalProcess) -> SessionResult<()> {
        let session = Session::running(process);
        let name = session.name.clone();
        let port = session.port;
        if let Err(error) = self.registry.register(session).await {
            // The rejected session's process is killed on drop; its tmux session is not.
            if let Err(kill_error) = self
                .tmux
                .kill_session(&name, self.config.timeouts.kill_session)
                .await
            {
                warn!(port, %name, "failed to kill orphaned tmux session: {kill_error}");
            }
            return Err(error);
        }
        Ok(())
    }

    /// Tears down everything tracked for `port`. Safe on untracked ports.
    pub async fn stop(&self, port: u16) -> Teardown {
        let session = self.registry.remove(port).await;
        let stale = self.registry.take_stale(port).await;

        if session.is_none() && stale.is_empty() {
            info!(port, "no tracked terminal to clean up");
            return Teardown::AlreadyClean;
        }

        let timeouts = &self.config.timeouts;
        let mut cleaned = false;
        let mut incomplete = false;

        if let Some(session) = session {
            let Session {
                name, mut process, ..
            } = session;
            debug!(port, session = %name, state = ?SessionState::Stopping, "stopping terminal");

            match self.tmux.kill_session(&name, timeouts.kill_session).await {
                Ok(()) => cleaned = true,
                Err(error) => warn!(port, session = %name, "could not kill tmux session: {error}"),
            }

            if process.terminate(timeouts.terminate_grace).await {
                cleaned = true;
            } else {
                incomplete = true;
                self.registry.park_stale(port, process).await;
            }
        }

        for mut process in stale {
            if process.terminate(timeouts.terminate_grace).await {
                cleaned = true;
            } else {
                incomplete = true;
                self.registry.park_stale(port, process).await;
            }
        }

        if incomplete || !cleaned {
            warn!(port, "could not confirm terminal cleanup");
            Teardown::Incomplete
        } else {
            info!(port, state = ?SessionState::Stopped, "cleaned up terminal");
            Teardown::Stopped
        }
    }

    /// Stops every tracked terminal, the main one included.
    pub async fn shutdown(&self, trigger: ShutdownTrigger) -> ShutdownReport {
        let ports = self.registry.all_ports().await;
        info!(%trigger, ?ports, "cleanup triggered");

        let mut report = ShutdownReport::default();
        for port in ports {
            match self.stop(port).await {
                Teardown::Stopped => report.stopped.push(port),
                Teardown::AlreadyClean => {}
                Teardown::Incomplete => {
                    error!(port, "terminal could not be stopped; best-effort cleanup only");
                    report.incomplete.push(port);
                }
            }
        }
        report
    }
}

#[async_trait]
impl TerminalService for TerminalManager {
    async fn create(&self) -> SessionResult<TerminalCreated> {
        let mut allocator = self.allocator.lock().await;
        let tracked = self.registry.all_ports().await;
        let lease = allocator.allocate(|port| tracked.contains(&port))?;
        let port = lease.port;
        debug!(port, state = ?SessionState::Starting, "starting terminal");

        let process = match self.supervisor.spawn(port, self.use_custom_config()).await {
            Ok(process) => process,
            Err(error) => {
                debug!(port, state = ?SessionState::Failed, "terminal failed to start");
                allocator.rollback(lease);
                return Err(error);
            }
        };

        let pid = process.pid();
        if let Err(error) = self.register_or_discard(process).await {
            allocator.rollback(lease);
            return Err(error);
        }

        info!(port, pid = ?pid, "new terminal running");
        Ok(TerminalCreated {
            success: true,
            port,
            url: self.config.connect_url(port),
        })
    }

    async fn list(&self) -> SessionResult<Vec<TerminalSummary>> {
        let sessions = self.registry.snapshot().await;
        Ok(sessions
            .into_iter()
            .map(|session| TerminalSummary {
                url: self.config.connect_url(session.port),
                main: session.port == self.config.main_port,
                port: session.port,
                session_name: session.name,
                pid: session.pid,
                state: session.state,
                started_at: session.started_at,
            })
            .collect())
    }

    async fn delete(&self, port: u16) -> SessionResult<DeleteOutcome> {
        info!(port, "request to delete terminal");
        if port == self.config.main_port {
            return Err(SessionError::Forbidden(
                "cannot delete the main terminal".to_string(),
            ));
        }

        match self.stop(port).await {
            Teardown::Stopped => Ok(DeleteOutcome::Stopped),
            Teardown::AlreadyClean => {
                warn!(port, "request to delete untracked terminal");
                Ok(DeleteOutcome::AlreadyClean)
            }
            Teardown::Incomplete => Err(SessionError::CleanupIncomplete(port)),
        }
    }

    async fn send_keys(&self, port: u16, text: String) -> SessionResult<()> {
        self.keys.send(port, &text).await
    }
}
