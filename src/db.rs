use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "conductd.sqlite3";

/// Concurrent sidecars on one workspace wait this long for the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            nisn TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            class_name TEXT NOT NULL,
            cohort TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS catalog_items(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            points INTEGER NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            UNIQUE(kind, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reports(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            item_id TEXT,
            item_name TEXT NOT NULL,
            category TEXT,
            points INTEGER NOT NULL,
            occurred_on TEXT NOT NULL,
            reporter TEXT NOT NULL,
            note TEXT,
            voided INTEGER NOT NULL DEFAULT 0,
            void_reason TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(item_id) REFERENCES catalog_items(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_student_year ON reports(student_id, academic_year_id)",
        [],
    )?;

    // Append-only. Nothing in the crate issues UPDATE or DELETE against it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            source_report_id TEXT,
            reverses_entry_id TEXT,
            kind TEXT NOT NULL,
            delta INTEGER NOT NULL,
            occurred_on TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            note TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(source_report_id) REFERENCES reports(id),
            FOREIGN KEY(reverses_entry_id) REFERENCES ledger_entries(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_student_year ON ledger_entries(student_id, academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS escalation_rules(
            id TEXT PRIMARY KEY,
            letter_kind TEXT NOT NULL UNIQUE,
            level INTEGER NOT NULL,
            threshold INTEGER NOT NULL,
            template TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS warning_letters(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            rule_id TEXT NOT NULL,
            letter_kind TEXT NOT NULL,
            level INTEGER NOT NULL,
            threshold INTEGER NOT NULL,
            total_at_issue INTEGER NOT NULL,
            trigger_entry_id TEXT NOT NULL,
            body TEXT NOT NULL,
            content_digest TEXT NOT NULL,
            snapshot_json TEXT NOT NULL,
            issued_at TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            sent_at TEXT,
            receipt TEXT,
            claimed_until TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(rule_id) REFERENCES escalation_rules(id),
            FOREIGN KEY(trigger_entry_id) REFERENCES ledger_entries(id),
            UNIQUE(student_id, academic_year_id, letter_kind)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_warning_letters_status ON warning_letters(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS letter_attempts(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            letter_id TEXT NOT NULL,
            attempted_at TEXT NOT NULL,
            event TEXT NOT NULL,
            status_after TEXT NOT NULL,
            detail TEXT,
            FOREIGN KEY(letter_id) REFERENCES warning_letters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_letter_attempts_letter ON letter_attempts(letter_id)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => {
            let v = serde_json::from_str(&s)
                .with_context(|| format!("settings value for {} is not valid JSON", key))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[cfg(test)]
pub fn open_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_schema(&conn).expect("init schema");
    conn
}
