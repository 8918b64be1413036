use super::protocol::{
    BridgeRequest, BridgeResponse, CreateNotePayload, DeleteNotePayload, GetNotePayload, SearchNotesPayload,
    UpdateNotePayload,
};
use crate::config;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{is_safe_id, now_ms, NoteUpdate};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_SEARCH_LIMIT: i64 = 80;

/// Opens the canonical store for a short-lived writer.
pub fn open_store(data_dir: &Path) -> AppResult<Database> {
    let db = Database::new(&config::db_path(data_dir))?;
    db.set_busy_timeout(BUSY_TIMEOUT)?;
    Ok(db)
}

/// Reads one request from `input`, answers it on `output` as a single line.
pub fn serve<R: Read, W: Write>(input: &mut R, output: &mut W, data_dir: &Path) -> AppResult<()> {
    let mut raw = String::new();
    let response = if input.read_to_string(&mut raw).is_err() {
        BridgeResponse::err("VALIDATION", "failed to read request from stdin")
    } else {
        match serde_json::from_str::<BridgeRequest>(&raw) {
            Err(_) => BridgeResponse::err("VALIDATION", "invalid JSON request"),
            Ok(request) => match open_store(data_dir) {
                Ok(db) => handle_request(&db, request),
                Err(error) => {
                    tracing::warn!(data_dir = %data_dir.display(), error = %error, "bridge could not open store");
                    BridgeResponse::err("INTERNAL", error.message())
                }
            },
        }
    };
    writeln!(output, "{}", response.to_line())?;
    output.flush()?;
    Ok(())
}

pub fn serve_stdio(data_dir: &Path) -> AppResult<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(&mut stdin.lock(), &mut stdout.lock(), data_dir)
}

/// Entry point for writer processes. Always answers with one line; failures to
/// even write that line go to stderr. The exit status stays 0 either way.
pub fn run_stdio() {
    let served = match config::resolve_data_dir() {
        Ok(data_dir) => {
            let _log_guard = match crate::install_tracing(&config::logs_dir(&data_dir), "notesync-bridge.log") {
                Ok(guard) => Some(guard),
                Err(error) => {
                    eprintln!("notesync-bridge: logging disabled: {}", error);
                    None
                }
            };
            serve_stdio(&data_dir)
        }
        Err(error) => {
            let mut stdout = std::io::stdout();
            writeln!(stdout, "{}", BridgeResponse::from_error(&error).to_line()).map_err(AppError::from)
        }
    };
    if let Err(error) = served {
        eprintln!("notesync-bridge: {}", error);
    }
}

pub fn handle_request(db: &Database, request: BridgeRequest) -> BridgeResponse {
    let op = request.op.clone();
    let result = match op.as_str() {
        "ensure_inbox" => db.ensure_inbox().map(|folder_id| json!({ "folder_id": folder_id })),
        "create_note" => parse::<CreateNotePayload>(&op, request.payload).and_then(|payload| create_note(db, payload)),
        "update_note" => parse::<UpdateNotePayload>(&op, request.payload).and_then(|payload| update_note(db, payload)),
        "delete_note" => parse::<DeleteNotePayload>(&op, request.payload).and_then(|payload| delete_note(db, payload)),
        "search_notes" => {
            parse::<SearchNotesPayload>(&op, request.payload).and_then(|payload| search_notes(db, payload))
        }
        "get_note" => parse::<GetNotePayload>(&op, request.payload).and_then(|payload| get_note(db, payload)),
        _ => Err(AppError::Validation(format!("unknown op '{}'", op))),
    };
    match result {
        Ok(data) => BridgeResponse::ok(data),
        Err(error) => {
            if error.protocol_code() == "INTERNAL" {
                tracing::warn!(op = %op, error = %error, "bridge request failed");
            } else {
                tracing::info!(op = %op, error = %error, "bridge request rejected");
            }
            BridgeResponse::from_error(&error)
        }
    }
}

fn parse<T: DeserializeOwned>(op: &str, payload: Value) -> AppResult<T> {
    // Ops whose fields are all optional accept a missing payload.
    let payload = if payload.is_null() { json!({}) } else { payload };
    serde_json::from_value(payload).map_err(|_| AppError::Validation(format!("invalid payload for {}", op)))
}

fn require_safe_id(id: &str, what: &str) -> AppResult<()> {
    if is_safe_id(id) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid {}", what)))
    }
}

fn create_note(db: &Database, payload: CreateNotePayload) -> AppResult<Value> {
    if let Some(folder_id) = &payload.folder_id {
        require_safe_id(folder_id, "folder_id")?;
    }
    let created = db.create_note_in(payload.folder_id.as_deref(), &payload.title, &payload.body)?;
    Ok(serde_json::to_value(created)?)
}

fn update_note(db: &Database, payload: UpdateNotePayload) -> AppResult<Value> {
    require_safe_id(&payload.id, "note id")?;
    let receipt = db
        .update_note(&NoteUpdate {
            id: payload.id.clone(),
            title: payload.title,
            body: payload.body,
            updated_at: payload.updated_at.unwrap_or_else(now_ms),
            expected_updated_at: payload.expected_updated_at,
        })
        .map_err(not_found_as_validation)?;
    Ok(json!({ "id": payload.id, "updated_at": receipt.updated_at }))
}

fn delete_note(db: &Database, payload: DeleteNotePayload) -> AppResult<Value> {
    require_safe_id(&payload.id, "note id")?;
    db.delete_note(&payload.id, payload.expected_updated_at)
        .map_err(not_found_as_validation)?;
    Ok(json!({ "id": payload.id, "deleted": true }))
}

fn search_notes(db: &Database, payload: SearchNotesPayload) -> AppResult<Value> {
    let query = payload.query.unwrap_or_default();
    let notes = db.search_notes(&query, payload.limit.unwrap_or(DEFAULT_SEARCH_LIMIT))?;
    Ok(json!({ "notes": notes }))
}

fn get_note(db: &Database, payload: GetNotePayload) -> AppResult<Value> {
    require_safe_id(&payload.id, "note id")?;
    let detail = db.note_detail(&payload.id).map_err(not_found_as_validation)?;
    Ok(serde_json::to_value(detail)?)
}

fn not_found_as_validation(error: AppError) -> AppError {
    match error {
        AppError::NotFound(message) => AppError::Validation(message),
        other => other,
    }
}
