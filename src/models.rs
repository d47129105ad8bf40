use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle of one terminal session.
///
/// `Requested → Starting → Running → Stopping → Stopped`, with `Failed` reachable from
/// `Starting`. Only `Running` sessions are ever visible in the registry.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct TerminalSummary {
    pub port: u16,
    pub session_name: String,
    pub url: String,
    pub pid: Option<u32>,
    pub state: SessionState,
    /// True for the reserved terminal started with the service.
    pub main: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct TerminalCreated {
    pub success: bool,
    pub port: u16,
    #[schema(example = "http://localhost:7682")]
    pub url: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Processes were found and stopped.
    Stopped,
    /// Nothing was tracked for the port.
    AlreadyClean,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SendKeysRequest {
    pub port: u16,
    #[schema(example = "ls -la")]
    pub command: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// A stored command snippet.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub struct CommandRecord {
    pub id: i64,
    pub os: Vec<String>,
    pub command: String,
    pub description: String,
    pub items: Vec<String>,
    pub filters: Vec<String>,
}

/// Incoming command data. Tag fields accept either a list or a comma-separated string.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct CommandInput {
    #[serde(default)]
    pub os: TagList,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub items: TagList,
    #[serde(default)]
    pub filters: TagList,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum TagList {
    List(Vec<String>),
    Joined(String),
}

impl Default for TagList {
    fn default() -> Self {
        TagList::List(Vec::new())
    }
}

impl TagList {
    pub fn values(&self) -> Vec<String> {
        match self {
            TagList::List(values) => values
                .iter()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
            TagList::Joined(joined) => joined
                .split(',')
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct CommandSaved {
    pub message: String,
    pub command: CommandRecord,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub struct ImportReport {
    pub message: String,
    pub success_count: usize,
    pub fail_count: usize,
    pub errors: Vec<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeFormat {
    Json,
    Csv,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct NoteBody {
    pub key: String,
    pub text: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub struct SearchHit {
    pub source_name: String,
    pub line_number: usize,
    pub line_text: String,
}
