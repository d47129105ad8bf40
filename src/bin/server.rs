use anyhow::Context;
use clap::Parser;
use cmdwave::commands::{CommandStore, TagVocabulary};
use cmdwave::config::{
    default_tmux_config, Timeouts, DEFAULT_FIRST_DYNAMIC_PORT, DEFAULT_MAIN_PORT,
    DEFAULT_MAX_DYNAMIC_PORT,
};
use cmdwave::documents::DocumentLibrary;
use cmdwave::notes::NoteStore;
use cmdwave::{build_router, ShutdownTrigger, TerminalConfig, TerminalManager, DEFAULT_HTTP_PORT};
use nix::sys::signal::Signal;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cmdwaved", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "CMDWAVE_BIND")]
    bind: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "CMDWAVE_PORT")]
    port: u16,
    /// Port of the main terminal started with the server
    #[arg(long, default_value_t = DEFAULT_MAIN_PORT, env = "CMDWAVE_MAIN_PORT")]
    main_port: u16,
    /// First port handed out to new terminals
    #[arg(long, default_value_t = DEFAULT_FIRST_DYNAMIC_PORT, env = "CMDWAVE_FIRST_DYNAMIC_PORT")]
    first_dynamic_port: u16,
    /// Last port handed out to new terminals
    #[arg(long, default_value_t = DEFAULT_MAX_DYNAMIC_PORT, env = "CMDWAVE_MAX_DYNAMIC_PORT")]
    max_dynamic_port: u16,
    #[arg(long, default_value = "ttyd", env = "CMDWAVE_TTYD_BIN")]
    ttyd_bin: String,
    #[arg(long, default_value = "tmux", env = "CMDWAVE_TMUX_BIN")]
    tmux_bin: String,
    /// Themed tmux configuration (defaults to ~/.tmux.conf.cmdwave)
    #[arg(long, env = "CMDWAVE_TMUX_CONFIG")]
    tmux_config: Option<PathBuf>,
    /// Start terminals with tmux built-in defaults instead of the themed configuration
    #[arg(long, env = "CMDWAVE_DEFAULT_TMUX_CONFIG")]
    default_tmux_config: bool,
    /// Host name used in terminal URLs returned to clients
    #[arg(long, default_value = "localhost", env = "CMDWAVE_PUBLIC_HOST")]
    public_host: String,
    /// Directory holding the command database and notes
    #[arg(long, default_value = "data", env = "CMDWAVE_DATA_DIR")]
    data_dir: PathBuf,
    /// Directory of searchable reference documents
    #[arg(long, default_value = "docs", env = "CMDWAVE_DOCS_DIR")]
    docs_dir: PathBuf,
    /// JSON file overriding the allowed OS, item and filter tags
    #[arg(long, env = "CMDWAVE_TAGS_FILE")]
    tags_file: Option<PathBuf>,
    /// Directory used for logs
    #[arg(long, default_value = "logs", env = "CMDWAVE_LOG_DIR")]
    log_dir: PathBuf,
}

impl Options {
    fn terminal_config(&self) -> TerminalConfig {
        TerminalConfig {
            main_port: self.main_port,
            first_dynamic_port: self.first_dynamic_port,
            max_dynamic_port: self.max_dynamic_port,
            ttyd_bin: self.ttyd_bin.clone(),
            tmux_bin: self.tmux_bin.clone(),
            tmux_config: self.tmux_config.clone().or_else(default_tmux_config),
            use_default_tmux_config: self.default_tmux_config,
            public_host: self.public_host.clone(),
            timeouts: Timeouts::default(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let guard = init_tracing(&options.log_dir);

    let manager = Arc::new(
        TerminalManager::new(options.terminal_config()).context("invalid terminal configuration")?,
    );

    let vocabulary = match &options.tags_file {
        Some(path) => TagVocabulary::from_file(path)
            .with_context(|| format!("failed to load tag vocabulary from {}", path.display()))?,
        None => TagVocabulary::default(),
    };
    let commands = CommandStore::open(&options.data_dir.join("database.db"), vocabulary)
        .context("failed to open command database")?;
    let notes = NoteStore::new(options.data_dir.join("notes"));
    let documents = DocumentLibrary::new(options.docs_dir.clone());

    if manager
        .start_main_session(!options.default_tmux_config)
        .await
        .is_err()
    {
        tracing::warn!("continuing without the main terminal");
    }

    let token = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(token.clone()));

    let app = build_router(manager.clone(), commands, notes, documents);
    let served = serve(&options, app, token.clone()).await;

    let trigger = shutdown_trigger(&token, signals).await;

    let report = manager.shutdown(trigger).await;
    tracing::info!(
        stopped = ?report.stopped,
        incomplete = ?report.incomplete,
        "cleanup finished"
    );

    if let Some(code) = trigger.exit_code() {
        tracing::info!(%trigger, code, "exiting after signal");
        drop(guard);
        std::process::exit(code);
    }

    served
}

/// Only the signal task cancels `token`, and it returns right after; a cancelled token
/// means its signal is worth waiting for even if the task has not finished yet.
async fn shutdown_trigger(
    token: &CancellationToken,
    signals: JoinHandle<Option<Signal>>,
) -> ShutdownTrigger {
    if !token.is_cancelled() {
        signals.abort();
        return ShutdownTrigger::Exit;
    }
    match signals.await {
        Ok(Some(signal)) => ShutdownTrigger::Signal(signal),
        _ => ShutdownTrigger::Exit,
    }
}

/// Stdout plus a daily file under `log_dir`. The file layer is skipped when the directory
/// cannot be created; the returned guard must outlive the last log line.
fn init_tracing(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let file_writer = match std::fs::create_dir_all(log_dir) {
        Ok(()) => Some(tracing_appender::non_blocking(
            tracing_appender::rolling::daily(log_dir, "cmdwaved.log"),
        )),
        Err(error) => {
            eprintln!(
                "cmdwaved: cannot create log directory {}: {error}; logging to stdout only",
                log_dir.display()
            );
            None
        }
    };

    let Some((non_blocking, guard)) = file_writer else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

/// Waits for SIGINT, SIGTERM or SIGHUP and cancels `token`. Returns the signal received.
async fn wait_for_signal(token: CancellationToken) -> Option<Signal> {
    let (mut interrupt, mut terminate, mut hangup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(interrupt), Ok(terminate), Ok(hangup)) => (interrupt, terminate, hangup),
        _ => {
            tracing::error!("failed to install signal handlers; cleanup will only run on exit");
            return None;
        }
    };

    let received = tokio::select! {
        _ = interrupt.recv() => Signal::SIGINT,
        _ = terminate.recv() => Signal::SIGTERM,
        _ = hangup.recv() => Signal::SIGHUP,
    };
    tracing::info!(signal = %received, "shutdown signal received");
    token.cancel();
    Some(received)
}

async fn serve(options: &Options, app: axum::Router, token: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::new(parse_bind_ip(&options.bind), options.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("cmdwaved listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("server error")?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}
