pub mod api;
pub mod commands;
pub mod config;
pub mod documents;
pub mod errors;
pub mod keys;
pub mod manager;
pub mod models;
pub mod notes;
pub mod port_pool;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod tmux;

pub use api::build_router;
pub use config::TerminalConfig;
pub use errors::{SessionError, SessionResult};
pub use manager::{ShutdownTrigger, TerminalManager};

pub const DEFAULT_HTTP_PORT: u16 = 5000;
