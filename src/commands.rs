//! SQLite-backed store of command snippets with JSON/CSV import and export.

use crate::errors::{SessionError, SessionResult};
use crate::models::{CommandInput, CommandRecord, ExchangeFormat, ImportReport, TagList};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const CSV_FIELDS: [&str; 5] = ["os", "command", "description", "items", "filters"];
const MAX_REPORTED_ERRORS: usize = 20;

/// Allowed values for the tag fields of a command.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TagVocabulary {
    pub os: Vec<String>,
    pub items: Vec<String>,
    /// Filter tags grouped by category, as shown in the UI.
    pub filter_categories: BTreeMap<String, Vec<String>>,
}

impl Default for TagVocabulary {
    fn default() -> Self {
        let mut filter_categories = BTreeMap::new();
        filter_categories.insert(
            "Services".to_string(),
            strings(&[
                "SMB", "WMI", "DCOM", "Kerberos", "RPC", "LDAP", "NTLM", "DNS", "SSH", "FTP",
                "HTTP/HTTPS", "SNMP",
            ]),
        );
        filter_categories.insert(
            "Attack Type".to_string(),
            strings(&[
                "Enumeration",
                "Exploitation",
                "Persistence",
                "Privilege Escalation",
                "Credential Access",
                "Exfiltration",
                "Lateral Movement",
                "Masquerade",
            ]),
        );

        Self {
            os: strings(&["linux", "windows"]),
            items: strings(&[
                "Username", "Password", "No Creds", "Hash", "TGS", "TGT", "PFX", "Shell",
                "Target IP", "DC IP", "DNS IP",
            ]),
            filter_categories,
        }
    }
}

impl TagVocabulary {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn allows_filter(&self, tag: &str) -> bool {
        self.filter_categories
            .values()
            .any(|tags| tags.iter().any(|allowed| allowed == tag))
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Validated command fields, tags sorted and restricted to the vocabulary.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Prepared {
    os: Vec<String>,
    command: String,
    description: String,
    items: Vec<String>,
    filters: Vec<String>,
}

#[derive(Clone)]
pub struct CommandStore {
    conn: Arc<Mutex<Connection>>,
    vocabulary: Arc<TagVocabulary>,
}

impl CommandStore {
    pub fn open(path: &Path, vocabulary: TagVocabulary) -> SessionResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?, vocabulary)
    }

    pub fn open_in_memory(vocabulary: TagVocabulary) -> SessionResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, vocabulary)
    }

    fn with_connection(conn: Connection, vocabulary: TagVocabulary) -> SessionResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS commands (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                os TEXT,
                command TEXT NOT NULL,
                description TEXT,
                items TEXT,
                filters TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_commands_command ON commands (command)",
            [],
        )?;
        info!("command database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            vocabulary: Arc::new(vocabulary),
        })
    }

    pub fn vocabulary(&self) -> &TagVocabulary {
        &self.vocabulary
    }

    pub fn list(&self) -> SessionResult<Vec<CommandRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, os, command, description, items, filters
             FROM commands ORDER BY command COLLATE NOCASE",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CommandRecord {
                id: row.get(0)?,
                os: split_tags(row.get::<_, Option<String>>(1)?),
                command: row.get(2)?,
                description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                items: split_tags(row.get::<_, Option<String>>(4)?),
                filters: split_tags(row.get::<_, Option<String>>(5)?),
            })
        })?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn create(&self, input: &CommandInput) -> SessionResult<CommandRecord> {
        let prepared = self.prepare(input)?;
        let conn = self.conn.lock();
        let id = insert(&conn, &prepared)?;
        info!(id, "command added");
        Ok(prepared.into_record(id))
    }

    pub fn update(&self, id: i64, input: &CommandInput) -> SessionResult<CommandRecord> {
        let prepared = self.prepare(input)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE commands SET os = ?1, command = ?2, description = ?3, items = ?4, filters = ?5
             WHERE id = ?6",
            params![
                prepared.os.join(","),
                prepared.command,
                prepared.description,
                prepared.items.join(","),
                prepared.filters.join(","),
                id
            ],
        )?;
        if changed == 0 {
            return Err(SessionError::NotFound(format!("command {id}")));
        }
        info!(id, "command updated");
        Ok(prepared.into_record(id))
    }

    pub fn delete(&self, id: i64) -> SessionResult<()> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM commands WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(SessionError::NotFound(format!("command {id}")));
        }
        conn.execute("DELETE FROM commands WHERE id = ?1", params![id])?;
        info!(id, "command deleted");
        Ok(())
    }

    /// Inserts each valid record; invalid rows are counted and described, not fatal.
    pub fn import(&self, format: ExchangeFormat, content: &str) -> SessionResult<ImportReport> {
        let content = content.trim_start_matches('\u{feff}');
        let (inputs, first_line) = match format {
            ExchangeFormat::Json => (parse_json_batch(content)?, 1),
            ExchangeFormat::Csv => (parse_csv_batch(content)?, 2),
        };

        let mut success_count = 0;
        let mut errors = Vec::new();
        let conn = self.conn.lock();

        for (index, input) in inputs.into_iter().enumerate() {
            let line = index + first_line;
            let input = match input {
                Ok(input) => input,
                Err(message) => {
                    errors.push(format!("Row {line}: {message}"));
                    continue;
                }
            };
            let prepared = match self.prepare(&input) {
                Ok(prepared) => prepared,
                Err(error) => {
                    errors.push(format!("Row {line}: Validation Error - {error}"));
                    continue;
                }
            };
            match insert(&conn, &prepared) {
                Ok(_) => success_count += 1,
                Err(error) => errors.push(format!("Row {line}: DB Error - {error}")),
            }
        }

        let fail_count = errors.len();
        info!(success_count, fail_count, "import done");
        if fail_count > 0 {
            warn!(first = %errors[0], "some imported commands were rejected");
        }
        errors.truncate(MAX_REPORTED_ERRORS);

        Ok(ImportReport {
            message: format!(
                "Import finished. Added: {success_count}, Failed/Skipped: {fail_count}."
            ),
            success_count,
            fail_count,
            errors,
        })
    }

    pub fn export(&self, format: ExchangeFormat) -> SessionResult<Vec<u8>> {
        #[derive(Serialize)]
        struct Exported<'a> {
            os: &'a [String],
            command: &'a str,
            description: &'a str,
            items: &'a [String],
            filters: &'a [String],
        }

        let records = self.list()?;
        match format {
            ExchangeFormat::Json => {
                let exported: Vec<_> = records
                    .iter()
                    .map(|record| Exported {
                        os: &record.os,
                        command: &record.command,
                        description: &record.description,
                        items: &record.items,
                        filters: &record.filters,
                    })
                    .collect();
                serde_json::to_vec_pretty(&exported)
                    .map_err(|error| SessionError::Internal(error.to_string()))
            }
            ExchangeFormat::Csv => {
                let mut writer = csv::WriterBuilder::new()
                    .quote_style(csv::QuoteStyle::Always)
                    .terminator(csv::Terminator::CRLF)
                    .from_writer(Vec::new());
                if !records.is_empty() {
                    writer.write_record(CSV_FIELDS).map_err(csv_failure)?;
                    for record in &records {
                        writer
                            .write_record([
                                record.os.join(","),
                                record.command.clone(),
                                record.description.clone(),
                                record.items.join(","),
                                record.filters.join(","),
                            ])
                            .map_err(csv_failure)?;
                    }
                }
                writer
                    .into_inner()
                    .map_err(|error| SessionError::Internal(format!("CSV export failed: {error}")))
            }
        }
    }

    fn prepare(&self, input: &CommandInput) -> SessionResult<Prepared> {
        let command = input.command.trim().to_string();
        if command.is_empty() {
            return Err(SessionError::InvalidRequest(
                "command field cannot be empty".to_string(),
            ));
        }

        let vocabulary = &self.vocabulary;
        Ok(Prepared {
            os: keep_allowed(&input.os, |tag| vocabulary.os.iter().any(|os| os == tag)),
            command,
            description: input.description.trim().to_string(),
            items: keep_allowed(&input.items, |tag| {
                vocabulary.items.iter().any(|item| item == tag)
            }),
            filters: keep_allowed(&input.filters, |tag| vocabulary.allows_filter(tag)),
        })
    }
}

impl Prepared {
    fn into_record(self, id: i64) -> CommandRecord {
        CommandRecord {
            id,
            os: self.os,
            command: self.command,
            description: self.description,
            items: self.items,
            filters: self.filters,
        }
    }
}

fn insert(conn: &Connection, prepared: &Prepared) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO commands (os, command, description, items, filters)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            prepared.os.join(","),
            prepared.command,
            prepared.description,
            prepared.items.join(","),
            prepared.filters.join(","),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn keep_allowed(tags: &TagList, allowed: impl Fn(&str) -> bool) -> Vec<String> {
    let mut values: Vec<String> = tags
        .values()
        .into_iter()
        .filter(|tag| allowed(tag.as_str()))
        .collect();
    values.sort();
    values.dedup();
    values
}

fn split_tags(raw: Option<String>) -> Vec<String> {
    let mut tags = TagList::Joined(raw.unwrap_or_default()).values();
    tags.sort();
    tags
}

type BatchRow = Result<CommandInput, String>;

fn parse_json_batch(content: &str) -> SessionResult<Vec<BatchRow>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(content)
        .map_err(|error| SessionError::InvalidRequest(format!("invalid JSON: {error}")))?;

    Ok(values
        .into_iter()
        .map(|value| {
            if !value.is_object() {
                return Err("Invalid format.".to_string());
            }
            serde_json::from_value::<CommandInput>(value)
                .map_err(|error| format!("Invalid format - {error}"))
        })
        .collect())
}

fn parse_csv_batch(content: &str) -> SessionResult<Vec<BatchRow>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());
    let header = reader
        .headers()
        .map_err(|error| SessionError::InvalidRequest(format!("invalid CSV: {error}")))?
        .clone();
    let column = |name: &str| header.iter().position(|field| field.trim() == name);
    let Some(command_column) = column("command") else {
        return Err(SessionError::InvalidRequest(
            "invalid CSV: needs headers including 'command'".to_string(),
        ));
    };
    let (os, description, items, filters) = (
        column("os"),
        column("description"),
        column("items"),
        column("filters"),
    );

    Ok(reader
        .records()
        .map(|row| {
            let row = row.map_err(|error| format!("Invalid format - {error}"))?;
            let field = |index: Option<usize>| {
                index
                    .and_then(|index| row.get(index))
                    .unwrap_or_default()
                    .to_string()
            };
            Ok(CommandInput {
                os: TagList::Joined(field(os)),
                command: field(Some(command_column)),
                description: field(description),
                items: TagList::Joined(field(items)),
                filters: TagList::Joined(field(filters)),
            })
        })
        .collect())
}

fn csv_failure(error: csv::Error) -> SessionError {
    SessionError::Internal(format!("CSV export failed: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CommandStore {
        CommandStore::open_in_memory(TagVocabulary::default()).unwrap()
    }

    fn input(command: &str) -> CommandInput {
        CommandInput {
            os: TagList::List(vec!["windows".into(), "linux".into(), "plan9".into()]),
            command: command.to_string(),
            description: "  list shares ".to_string(),
            items: TagList::Joined("Username, Password,Bogus".to_string()),
            filters: TagList::List(vec!["SMB".into(), "Enumeration".into()]),
        }
    }

    #[test]
    fn create_filters_and_sorts_tags() {
        let store = store();
        let record = store.create(&input("smbclient -L //$IP")).unwrap();
        assert_eq!(record.os, vec!["linux", "windows"]);
        assert_eq!(record.items, vec!["Password", "Username"]);
        assert_eq!(record.filters, vec!["Enumeration", "SMB"]);
        assert_eq!(record.description, "list shares");
        assert_eq!(store.list().unwrap(), vec![record]);
    }

    #[test]
    fn rejects_empty_command() {
        let store = store();
        let error = store.create(&input("   ")).unwrap_err();
        assert!(matches!(error, SessionError::InvalidRequest(_)));
    }

    #[test]
    fn list_is_sorted_case_insensitively() {
        let store = store();
        store.create(&input("zzz")).unwrap();
        store.create(&input("Bbb")).unwrap();
        store.create(&input("aaa")).unwrap();
        let commands: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|record| record.command)
            .collect();
        assert_eq!(commands, vec!["aaa", "Bbb", "zzz"]);
    }

    #[test]
    fn update_and_delete_missing_are_not_found() {
        let store = store();
        assert!(matches!(
            store.update(42, &input("x")).unwrap_err(),
            SessionError::NotFound(_)
        ));
        assert!(matches!(store.delete(42).unwrap_err(), SessionError::NotFound(_)));

        let record = store.create(&input("x")).unwrap();
        let updated = store.update(record.id, &input("y")).unwrap();
        assert_eq!(updated.command, "y");
        store.delete(record.id).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn json_import_reports_bad_rows() {
        let store = store();
        let report = store
            .import(
                ExchangeFormat::Json,
                r#"[{"command":"id","os":["linux"]},{"command":""},42]"#,
            )
            .unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.fail_count, 2);
        assert!(report.errors[0].starts_with("Row 2:"));
        assert!(report.errors[1].starts_with("Row 3: Invalid format"));
    }

    #[test]
    fn json_import_requires_array() {
        let store = store();
        assert!(store.import(ExchangeFormat::Json, r#"{"command":"id"}"#).is_err());
    }

    #[test]
    fn csv_export_then_import() {
        let source = store();
        source.create(&input("echo \"hi, there\"")).unwrap();
        let csv = String::from_utf8(source.export(ExchangeFormat::Csv).unwrap()).unwrap();
        assert!(csv.starts_with("\"os\",\"command\",\"description\",\"items\",\"filters\"\r\n"));

        let target = store();
        let report = target.import(ExchangeFormat::Csv, &csv).unwrap();
        assert_eq!(report.success_count, 1, "{report:?}");
        let imported = target.list().unwrap().remove(0);
        assert_eq!(imported.command, "echo \"hi, there\"");
        assert_eq!(imported.os, vec!["linux", "windows"]);
        assert_eq!(imported.filters, vec!["Enumeration", "SMB"]);
    }

    #[test]
    fn csv_import_needs_command_header() {
        let store = store();
        let error = store
            .import(ExchangeFormat::Csv, "os,description\nlinux,x\n")
            .unwrap_err();
        assert!(matches!(error, SessionError::InvalidRequest(_)));
    }

    #[test]
    fn json_export_omits_ids() {
        let store = store();
        store.create(&input("whoami")).unwrap();
        let exported: serde_json::Value =
            serde_json::from_slice(&store.export(ExchangeFormat::Json).unwrap()).unwrap();
        assert_eq!(exported[0]["command"], "whoami");
        assert!(exported[0].get("id").is_none());
    }

    #[test]
    fn csv_import_keeps_quotes_inside_unquoted_fields() {
        let store = store();
        let report = store
            .import(
                ExchangeFormat::Csv,
                "command,description\necho 5\" disk,x\nls,y\n",
            )
            .unwrap();
        assert_eq!(report.success_count, 2, "{report:?}");
        let commands: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|record| record.command)
            .collect();
        assert_eq!(commands, vec!["echo 5\" disk", "ls"]);
    }

    #[test]
    fn csv_import_tolerates_short_rows_and_blank_lines() {
        let store = store();
        let report = store
            .import(
                ExchangeFormat::Csv,
                "os,command,description\r\nlinux,\"id\"\r\n\r\nwindows,whoami,\"a, b\"\r\n",
            )
            .unwrap();
        assert_eq!(report.success_count, 2, "{report:?}");
        let records = store.list().unwrap();
        assert_eq!(records[0].command, "id");
        assert_eq!(records[0].description, "");
        assert_eq!(records[1].description, "a, b");
        assert_eq!(records[1].os, vec!["windows"]);
    }
}
