use crate::commands::{CommandStore, TagVocabulary};
use crate::documents::DocumentLibrary;
use crate::errors::{ErrorBody, SessionError, SessionResult};
use crate::models::{
    CommandInput, CommandRecord, CommandSaved, DeleteOutcome, ExchangeFormat, HealthResponse,
    ImportReport, MessageResponse, NoteBody, SearchHit, SendKeysRequest, SessionState,
    TerminalCreated, TerminalSummary,
};
use crate::notes::NoteStore;
use crate::service::{AppState, TerminalService};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::OpenApi as UtoipaOpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Deserialize)]
struct FormatParams {
    format: Option<ExchangeFormat>,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

#[derive(Deserialize, utoipa::ToSchema)]
struct NoteUpdate {
    text: String,
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(
        health,
        list_terminals,
        create_terminal,
        delete_terminal,
        send_keys,
        list_commands,
        create_command,
        update_command,
        delete_command,
        import_commands,
        export_commands,
        filter_tags,
        read_note,
        write_note,
        search_documents,
        load_document,
    ),
    components(schemas(
        TerminalSummary,
        TerminalCreated,
        SessionState,
        SendKeysRequest,
        MessageResponse,
        HealthResponse,
        ErrorBody,
        CommandRecord,
        CommandInput,
        CommandSaved,
        ImportReport,
        NoteBody,
        NoteUpdate,
        SearchHit
    )),
    tags((name = "terminals", description = "Manage ttyd/tmux web terminals"))
)]
pub struct ApiDoc;

pub fn build_router(
    terminals: Arc<dyn TerminalService>,
    commands: CommandStore,
    notes: NoteStore,
    documents: DocumentLibrary,
) -> Router {
    let state = AppState::new(terminals, commands, notes, documents);
    let openapi = ApiDoc::openapi();
    let swagger_routes: Router<AppState> =
        SwaggerUi::new("/docs").url("/openapi.json", openapi).into();

    Router::new()
        .route("/healthz", get(health))
        .route("/terminals", get(list_terminals).post(create_terminal))
        .route("/terminals/keys", post(send_keys))
        .route("/terminals/{port}", axum::routing::delete(delete_terminal))
        .route("/commands", get(list_commands).post(create_command))
        .route("/commands/{id}", put(update_command).delete(delete_command))
        .route("/commands/import", post(import_commands))
        .route("/commands/export", get(export_commands))
        .route("/filter_tags", get(filter_tags))
        .route("/notes/{key}", get(read_note).put(write_note))
        .route("/docs-search", get(search_documents))
        .route("/documents/{*name}", get(load_document))
        .merge(swagger_routes)
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/terminals",
    responses((status = 200, description = "Tracked terminals", body = [TerminalSummary]))
)]
async fn list_terminals(State(state): State<AppState>) -> SessionResult<Json<Vec<TerminalSummary>>> {
    Ok(Json(state.terminals.list().await?))
}

#[utoipa::path(
    post,
    path = "/terminals",
    responses(
        (status = 200, description = "Terminal started", body = TerminalCreated),
        (status = 503, description = "No free port in the dynamic range", body = ErrorBody),
        (status = 500, description = "Terminal process failed to start", body = ErrorBody)
    )
)]
async fn create_terminal(State(state): State<AppState>) -> SessionResult<Json<TerminalCreated>> {
    Ok(Json(state.terminals.create().await?))
}

#[utoipa::path(
    delete,
    path = "/terminals/{port}",
    params(("port" = u16, Path, description = "Port the terminal listens on")),
    responses(
        (status = 200, description = "Terminal stopped or already gone", body = MessageResponse),
        (status = 403, description = "The main terminal cannot be deleted", body = ErrorBody),
        (status = 500, description = "Cleanup could not be confirmed", body = ErrorBody)
    )
)]
async fn delete_terminal(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> SessionResult<Json<MessageResponse>> {
    let message = match state.terminals.delete(port).await? {
        DeleteOutcome::Stopped => format!("Terminal on port {port} stopped and cleaned up."),
        DeleteOutcome::AlreadyClean => {
            format!("Terminal on port {port} was not actively tracked.")
        }
    };
    Ok(Json(MessageResponse::ok(message)))
}

#[utoipa::path(
    post,
    path = "/terminals/keys",
    request_body = SendKeysRequest,
    responses(
        (status = 200, description = "Keys delivered", body = MessageResponse),
        (status = 400, description = "Malformed body", body = ErrorBody),
        (status = 404, description = "No live session on that port", body = ErrorBody),
        (status = 500, description = "tmux failed or timed out", body = ErrorBody)
    )
)]
async fn send_keys(
    State(state): State<AppState>,
    body: Bytes,
) -> SessionResult<Json<MessageResponse>> {
    let request = parse_send_keys(&body)?;
    state
        .terminals
        .send_keys(request.port, request.command)
        .await?;
    Ok(Json(MessageResponse::ok("Command sent successfully.")))
}

/// Accepts the port as a JSON number or a numeric string.
fn parse_send_keys(body: &[u8]) -> SessionResult<SendKeysRequest> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| SessionError::InvalidRequest("invalid JSON body".to_string()))?;

    let (Some(port), Some(command)) = (value.get("port"), value.get("command")) else {
        return Err(SessionError::InvalidRequest(
            "missing \"port\" or \"command\"".to_string(),
        ));
    };

    let port = match port {
        Value::Number(number) => number.as_u64().and_then(|port| u16::try_from(port).ok()),
        Value::String(text) => text.trim().parse::<u16>().ok(),
        _ => None,
    }
    .ok_or_else(|| SessionError::InvalidRequest("invalid port number".to_string()))?;

    let command = match command {
        Value::String(text) => text.clone(),
        _ => {
            return Err(SessionError::InvalidRequest(
                "\"command\" must be a string".to_string(),
            ))
        }
    };

    Ok(SendKeysRequest { port, command })
}

#[utoipa::path(
    get,
    path = "/commands",
    responses((status = 200, description = "All commands", body = [CommandRecord]))
)]
async fn list_commands(State(state): State<AppState>) -> SessionResult<Json<Vec<CommandRecord>>> {
    Ok(Json(state.commands.list()?))
}

#[utoipa::path(
    post,
    path = "/commands",
    request_body = CommandInput,
    responses(
        (status = 201, description = "Command added", body = CommandSaved),
        (status = 400, description = "Validation failed", body = ErrorBody)
    )
)]
async fn create_command(
    State(state): State<AppState>,
    Json(input): Json<CommandInput>,
) -> SessionResult<(StatusCode, Json<CommandSaved>)> {
    let command = state.commands.create(&input)?;
    Ok((
        StatusCode::CREATED,
        Json(CommandSaved {
            message: "Command added successfully".to_string(),
            command,
        }),
    ))
}

#[utoipa::path(
    put,
    path = "/commands/{id}",
    params(("id" = i64, Path, description = "Command identifier")),
    request_body = CommandInput,
    responses(
        (status = 200, description = "Command updated", body = CommandSaved),
        (status = 404, description = "Command not found", body = ErrorBody)
    )
)]
async fn update_command(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<CommandInput>,
) -> SessionResult<Json<CommandSaved>> {
    let command = state.commands.update(id, &input)?;
    Ok(Json(CommandSaved {
        message: "Command updated successfully".to_string(),
        command,
    }))
}

#[utoipa::path(
    delete,
    path = "/commands/{id}",
    params(("id" = i64, Path, description = "Command identifier")),
    responses(
        (status = 200, description = "Command deleted", body = MessageResponse),
        (status = 404, description = "Command not found", body = ErrorBody)
    )
)]
async fn delete_command(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> SessionResult<Json<MessageResponse>> {
    state.commands.delete(id)?;
    Ok(Json(MessageResponse::ok(format!("Command {id} deleted"))))
}

#[utoipa::path(
    post,
    path = "/commands/import",
    params(("format" = Option<String>, Query, description = "json (default) or csv")),
    request_body(content = String, description = "JSON array or CSV with a header row"),
    responses(
        (status = 200, description = "Import finished", body = ImportReport),
        (status = 400, description = "Unreadable file", body = ErrorBody)
    )
)]
async fn import_commands(
    State(state): State<AppState>,
    Query(params): Query<FormatParams>,
    body: Bytes,
) -> SessionResult<Json<ImportReport>> {
    let content = std::str::from_utf8(&body)
        .map_err(|_| SessionError::InvalidRequest("file encoding not valid UTF-8".to_string()))?;
    let format = params.format.unwrap_or(ExchangeFormat::Json);
    Ok(Json(state.commands.import(format, content)?))
}

#[utoipa::path(
    get,
    path = "/commands/export",
    params(("format" = Option<String>, Query, description = "json (default) or csv")),
    responses((status = 200, description = "Exported commands as a download"))
)]
async fn export_commands(
    State(state): State<AppState>,
    Query(params): Query<FormatParams>,
) -> SessionResult<Response> {
    let format = params.format.unwrap_or(ExchangeFormat::Json);
    let bytes = state.commands.export(format)?;
    let (content_type, file_name) = match format {
        ExchangeFormat::Json => ("application/json", "command_wave_export.json"),
        ExchangeFormat::Csv => ("text/csv", "command_wave_export.csv"),
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/filter_tags",
    responses((status = 200, description = "Filter tags grouped by category"))
)]
async fn filter_tags(State(state): State<AppState>) -> Json<BTreeMap<String, Vec<String>>> {
    let vocabulary: &TagVocabulary = state.commands.vocabulary();
    Json(vocabulary.filter_categories.clone())
}

#[utoipa::path(
    get,
    path = "/notes/{key}",
    params(("key" = String, Path, description = "'main' or a terminal port")),
    responses(
        (status = 200, description = "Note text, empty if never saved", body = NoteBody),
        (status = 400, description = "Invalid key", body = ErrorBody)
    )
)]
async fn read_note(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> SessionResult<Json<NoteBody>> {
    let text = state.notes.read(&key).await?;
    Ok(Json(NoteBody { key, text }))
}

#[utoipa::path(
    put,
    path = "/notes/{key}",
    params(("key" = String, Path, description = "'main' or a terminal port")),
    request_body = NoteUpdate,
    responses(
        (status = 200, description = "Note saved", body = MessageResponse),
        (status = 400, description = "Invalid key", body = ErrorBody)
    )
)]
async fn write_note(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(update): Json<NoteUpdate>,
) -> SessionResult<Json<MessageResponse>> {
    state.notes.write(&key, &update.text).await?;
    Ok(Json(MessageResponse::ok(format!("Note '{key}' saved"))))
}

#[utoipa::path(
    get,
    path = "/docs-search",
    params(("q" = String, Query, description = "Case-insensitive text to look for")),
    responses(
        (status = 200, description = "Matching lines", body = [SearchHit]),
        (status = 400, description = "Empty query", body = ErrorBody)
    )
)]
async fn search_documents(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> SessionResult<Json<Vec<SearchHit>>> {
    Ok(Json(state.documents.search(&params.q).await?))
}

#[utoipa::path(
    get,
    path = "/documents/{name}",
    params(("name" = String, Path, description = "Document path relative to the library")),
    responses(
        (status = 200, description = "Document text", body = String),
        (status = 403, description = "Path escapes the library", body = ErrorBody),
        (status = 404, description = "No such document", body = ErrorBody)
    )
)]
async fn load_document(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> SessionResult<Response> {
    let text = state.documents.load(&name).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}
