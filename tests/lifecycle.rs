#![cfg(unix)]

//! Drives the real terminal manager against shell-script stand-ins for ttyd and tmux.

use cmdwave::config::Timeouts;
use cmdwave::errors::SpawnFailure;
use cmdwave::manager::ShutdownReport;
use cmdwave::models::DeleteOutcome;
use cmdwave::port_pool::PortProbe;
use cmdwave::service::TerminalService;
use cmdwave::supervisor::TerminalProcess;
use cmdwave::{SessionError, ShutdownTrigger, TerminalConfig, TerminalManager};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const MAIN_PORT: u16 = 47681;
const FIRST_PORT: u16 = 47682;
const MAX_PORT: u16 = 47684;

/// Stays alive like ttyd would, unless a `fail_once` marker asks it to die right away.
const FAKE_TTYD: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
if [ -e "$dir/fail_once" ]; then
    rm -f "$dir/fail_once"
    exit 1
fi
exec sleep 30
"#;

/// Records keys and kills; reports a dead server while a `dead` marker exists. A `slow`
/// marker holds the number of seconds send-keys takes before answering.
const FAKE_TMUX: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
case "$1" in
    send-keys)
        if [ -e "$dir/slow" ]; then
            sleep "$(cat "$dir/slow")"
        fi
        if [ -e "$dir/dead" ]; then
            echo "can't find session: $3" >&2
            exit 1
        fi
        if [ -e "$dir/broken" ]; then
            echo "unknown key table" >&2
            exit 1
        fi
        printf '%s' "$5" >> "$dir/keys.log"
        ;;
    kill-session)
        echo "$3" >> "$dir/killed.log"
        ;;
esac
exit 0
"#;

struct AllFree;

impl PortProbe for AllFree {
    fn is_free(&self, _port: u16) -> bool {
        true
    }
}

struct AllTaken;

impl PortProbe for AllTaken {
    fn is_free(&self, _port: u16) -> bool {
        false
    }
}

struct Harness {
    dir: TempDir,
    manager: Arc<TerminalManager>,
}

impl Harness {
    fn new() -> Self {
        Self::with_probe(Arc::new(AllFree))
    }

    fn with_probe(probe: Arc<dyn PortProbe>) -> Self {
        Self::build(probe, |_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut TerminalConfig)) -> Self {
        Self::build(Arc::new(AllFree), adjust)
    }

    fn build(probe: Arc<dyn PortProbe>, adjust: impl FnOnce(&mut TerminalConfig)) -> Self {
        let dir = tempdir().unwrap();
        let ttyd = write_script(dir.path(), "ttyd", FAKE_TTYD);
        let tmux = write_script(dir.path(), "tmux", FAKE_TMUX);
        let mut config = test_config(ttyd, tmux);
        adjust(&mut config);
        let manager = Arc::new(TerminalManager::with_probe(config, probe).unwrap());
        Self { dir, manager }
    }

    fn write_marker(&self, name: &str, contents: &str) {
        std::fs::write(self.marker(name), contents).unwrap();
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn touch(&self, name: &str) {
        std::fs::write(self.marker(name), "").unwrap();
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.marker(name)).unwrap_or_default()
    }
}

fn test_config(ttyd: PathBuf, tmux: PathBuf) -> TerminalConfig {
    TerminalConfig {
        main_port: MAIN_PORT,
        first_dynamic_port: FIRST_PORT,
        max_dynamic_port: MAX_PORT,
        ttyd_bin: ttyd.to_string_lossy().to_string(),
        tmux_bin: tmux.to_string_lossy().to_string(),
        tmux_config: None,
        use_default_tmux_config: true,
        public_host: "localhost".to_string(),
        timeouts: Timeouts {
            spawn_grace: Duration::from_millis(150),
            terminate_grace: Duration::from_millis(500),
            kill_session: Duration::from_secs(2),
            send_keys: Duration::from_secs(2),
        },
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn is_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn create_registers_port_and_moves_hint() {
    let harness = Harness::new();
    let manager = &harness.manager;

    let created = manager.create().await.unwrap();
    assert!(created.success);
    assert_eq!(created.port, FIRST_PORT);
    assert_eq!(created.url, format!("http://localhost:{FIRST_PORT}"));

    assert_eq!(
        manager.registry().lookup(FIRST_PORT).await.as_deref(),
        Some("cmd_wave_term_47682")
    );
    assert_ne!(manager.next_port_hint().await, Some(created.port));

    let listed = manager.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].main);
    assert!(listed[0].pid.is_some());

    manager.shutdown(ShutdownTrigger::Exit).await;
}

#[tokio::test]
async fn create_send_delete_send_round_trip() {
    let harness = Harness::new();
    let manager = &harness.manager;

    let port = manager.create().await.unwrap().port;
    manager.send_keys(port, "whoami".to_string()).await.unwrap();
    manager.send_keys(port, "id\n".to_string()).await.unwrap();
    assert_eq!(harness.read("keys.log"), "whoami\nid\n");

    assert_eq!(manager.delete(port).await.unwrap(), DeleteOutcome::Stopped);
    assert!(harness.read("killed.log").contains("cmd_wave_term_47682"));
    assert!(manager.registry().is_empty().await);

    let error = manager.send_keys(port, "id".to_string()).await.unwrap_err();
    assert!(matches!(error, SessionError::SessionNotFound(p) if p == port));

    assert_eq!(manager.delete(port).await.unwrap(), DeleteOutcome::AlreadyClean);
}

#[tokio::test]
async fn dead_session_is_dropped_from_registry() {
    let harness = Harness::new();
    let manager = &harness.manager;

    let created = manager.create().await.unwrap();
    let pid = manager.list().await.unwrap()[0].pid.unwrap();
    harness.touch("dead");

    let error = manager
        .send_keys(created.port, "ls".to_string())
        .await
        .unwrap_err();
    assert!(matches!(error, SessionError::SessionGone(_)));
    assert_eq!(manager.registry().lookup(created.port).await, None);
    assert!(!is_running(pid));

    let error = manager
        .send_keys(created.port, "ls".to_string())
        .await
        .unwrap_err();
    assert!(matches!(error, SessionError::SessionNotFound(_)));
}

#[tokio::test]
async fn other_tmux_failures_keep_the_session() {
    let harness = Harness::new();
    let manager = &harness.manager;

    let port = manager.create().await.unwrap().port;
    harness.touch("broken");

    let error = manager.send_keys(port, "ls".to_string()).await.unwrap_err();
    assert!(matches!(error, SessionError::MultiplexerError(ref message) if message.contains("unknown key table")));
    assert!(manager.registry().lookup(port).await.is_some());

    manager.shutdown(ShutdownTrigger::Exit).await;
}

#[tokio::test]
async fn exhausted_range_leaves_cursor_alone() {
    let harness = Harness::with_probe(Arc::new(AllTaken));
    let manager = &harness.manager;

    let before = manager.allocator_cursor().await;
    let error = manager.create().await.unwrap_err();
    assert!(matches!(
        error,
        SessionError::PortExhausted {
            first: FIRST_PORT,
            max: MAX_PORT
        }
    ));
    assert_eq!(manager.allocator_cursor().await, before);
    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn failed_spawn_port_is_reused() {
    let harness = Harness::new();
    let manager = &harness.manager;
    harness.touch("fail_once");

    let error = manager.create().await.unwrap_err();
    assert!(matches!(
        error,
        SessionError::SpawnFailed {
            port: FIRST_PORT,
            reason: SpawnFailure::ImmediateExit(Some(1))
        }
    ));
    assert!(manager.registry().is_empty().await);

    let created = manager.create().await.unwrap();
    assert_eq!(created.port, FIRST_PORT);

    manager.shutdown(ShutdownTrigger::Exit).await;
}

#[tokio::test]
async fn main_terminal_cannot_be_deleted_while_running() {
    let harness = Harness::new();
    let manager = &harness.manager;

    manager.start_main_session(false).await.unwrap();
    for _ in 0..2 {
        assert!(matches!(
            manager.delete(MAIN_PORT).await.unwrap_err(),
            SessionError::Forbidden(_)
        ));
    }
    assert!(manager.registry().lookup(MAIN_PORT).await.is_some());
    assert!(matches!(
        manager.start_main_session(false).await.unwrap_err(),
        SessionError::AlreadyTracked(MAIN_PORT)
    ));

    let created = manager.create().await.unwrap();
    assert_ne!(created.port, MAIN_PORT);

    manager.shutdown(ShutdownTrigger::Exit).await;
}

#[tokio::test]
async fn shutdown_sweeps_every_terminal() {
    let harness = Harness::new();
    let manager = &harness.manager;

    manager.start_main_session(true).await.unwrap();
    manager.create().await.unwrap();
    manager.create().await.unwrap();

    let pids: Vec<u32> = manager
        .list()
        .await
        .unwrap()
        .iter()
        .filter_map(|terminal| terminal.pid)
        .collect();
    assert_eq!(pids.len(), 3);

    let report = manager
        .shutdown(ShutdownTrigger::Signal(nix::sys::signal::Signal::SIGTERM))
        .await;
    assert_eq!(
        report,
        ShutdownReport {
            stopped: vec![MAIN_PORT, FIRST_PORT, FIRST_PORT + 1],
            incomplete: Vec::new(),
        }
    );
    assert!(manager.registry().is_empty().await);
    assert!(manager.registry().all_ports().await.is_empty());
    for pid in pids {
        assert!(!is_running(pid), "pid {pid} survived shutdown");
    }

    let killed = harness.read("killed.log");
    assert_eq!(killed.lines().count(), 3);
}

#[tokio::test]
async fn missing_ttyd_is_reported() {
    let harness = Harness::new();
    let mut config = harness.manager.config().clone();
    config.ttyd_bin = harness
        .dir
        .path()
        .join("no-such-ttyd")
        .to_string_lossy()
        .to_string();
    let manager = TerminalManager::with_probe(config, Arc::new(AllFree)).unwrap();

    let error = manager.create().await.unwrap_err();
    assert!(matches!(error, SessionError::MissingBinary(_)));
    assert_eq!(
        manager.next_port_hint().await,
        Some(FIRST_PORT),
        "a failed start must not consume the port"
    );
}

#[tokio::test]
async fn send_keys_timeout_keeps_the_session() {
    let harness = Harness::with_config(|config| {
        config.timeouts.send_keys = Duration::from_millis(300);
    });
    let manager = &harness.manager;

    let port = manager.create().await.unwrap().port;
    harness.write_marker("slow", "2");

    let error = manager.send_keys(port, "id".to_string()).await.unwrap_err();
    assert!(matches!(error, SessionError::Timeout(ref what) if what.contains("cmd_wave_term_47682")));
    assert!(manager.registry().lookup(port).await.is_some());
    assert_eq!(manager.list().await.unwrap().len(), 1);

    manager.shutdown(ShutdownTrigger::Exit).await;
}

#[tokio::test]
async fn concurrent_creates_get_distinct_ports() {
    let harness = Harness::new();

    let creates: Vec<_> = (0..5)
        .map(|_| {
            let manager = harness.manager.clone();
            tokio::spawn(async move { manager.create().await })
        })
        .collect();

    let mut ports = Vec::new();
    let mut exhausted = 0;
    for create in creates {
        match create.await.unwrap() {
            Ok(created) => ports.push(created.port),
            Err(SessionError::PortExhausted { .. }) => exhausted += 1,
            Err(other) => panic!("unexpected create failure: {other}"),
        }
    }
    ports.sort_unstable();
    assert_eq!(ports, vec![FIRST_PORT, FIRST_PORT + 1, MAX_PORT]);
    assert_eq!(exhausted, 2);
    assert_eq!(harness.manager.registry().len().await, 3);

    harness.manager.shutdown(ShutdownTrigger::Exit).await;
}

#[tokio::test]
async fn send_to_untracked_port_kills_stale_handle() {
    let harness = Harness::new();
    let manager = &harness.manager;

    let child = tokio::process::Command::new("sleep")
        .arg("30")
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let process = TerminalProcess::from_child(FIRST_PORT, child);
    let pid = process.pid().unwrap();
    manager.registry().park_stale(FIRST_PORT, process).await;
    assert!(manager.registry().contains(FIRST_PORT).await);

    let error = manager
        .send_keys(FIRST_PORT, "id".to_string())
        .await
        .unwrap_err();
    assert!(matches!(error, SessionError::SessionNotFound(FIRST_PORT)));
    assert!(!is_running(pid));
    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn late_dead_session_report_spares_recreated_terminal() {
    let harness = Harness::with_config(|config| {
        config.max_dynamic_port = config.first_dynamic_port;
    });
    let manager = harness.manager.clone();

    let port = manager.create().await.unwrap().port;
    harness.write_marker("slow", "1");
    harness.touch("dead");

    let sending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send_keys(port, "id".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.delete(port).await.unwrap(), DeleteOutcome::Stopped);
    let recreated = manager.create().await.unwrap();
    assert_eq!(recreated.port, port);
    let pid = manager.list().await.unwrap()[0].pid.unwrap();

    let error = sending.await.unwrap().unwrap_err();
    assert!(matches!(error, SessionError::SessionGone(_)));
    assert!(manager.registry().lookup(port).await.is_some());
    assert!(is_running(pid));

    manager.shutdown(ShutdownTrigger::Exit).await;
}
