use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

use crate::rank::RankedTotal;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("assessd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            student_no TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_name ON students(name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_scores(
            id TEXT PRIMARY KEY,
            subject_key TEXT NOT NULL,
            subject TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score INTEGER NOT NULL,
            position INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(subject_key, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_scores_subject ON subject_scores(subject_key)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_scores_student ON subject_scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS uploaded_subjects(
            subject_key TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            uploaded_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_total_scores(
            student_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            total INTEGER NOT NULL,
            position INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_total_scores_position ON student_total_scores(position)",
        [],
    )?;

    Ok(conn)
}

pub struct UploadedSubject {
    pub subject: String,
    pub uploaded_at: String,
}

/// Marker lookup for the read side. The write side never checks this;
/// ingestion claims the subject with a conditional insert instead.
pub fn subject_uploaded(
    conn: &Connection,
    subject_key: &str,
) -> rusqlite::Result<Option<UploadedSubject>> {
    conn.query_row(
        "SELECT subject, uploaded_at FROM uploaded_subjects WHERE subject_key = ?",
        [subject_key],
        |row| {
            Ok(UploadedSubject {
                subject: row.get(0)?,
                uploaded_at: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Insert-if-absent claim on a subject. Returns false when an earlier upload
/// already holds the claim. Must run inside the same transaction that writes
/// the subject's score rows, so the marker and the rows land or vanish
/// together.
pub fn claim_subject(conn: &Connection, subject_key: &str, subject: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "INSERT INTO uploaded_subjects(subject_key, subject, uploaded_at)
         VALUES(?, ?, ?)
         ON CONFLICT(subject_key) DO NOTHING",
        (subject_key, subject, Utc::now().to_rfc3339()),
    )?;
    Ok(changed == 1)
}

/// Select-or-insert a registry row for (canonical name, student number) and
/// return its id. Students sharing a name but carrying different numbers stay
/// distinct; a missing number matches only rows without one.
pub fn resolve_student(
    conn: &Connection,
    name: &str,
    student_no: Option<&str>,
) -> rusqlite::Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE name = ? AND student_no IS ?",
            (name, student_no),
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, name, student_no, created_at) VALUES(?, ?, ?, ?)",
        (&id, name, student_no, Utc::now().to_rfc3339()),
    )?;
    Ok(id)
}

/// Overwrites the standings table with a freshly ranked result, all rows in
/// one transaction: a refresh that fails midway leaves the previous standings
/// untouched instead of a half-updated mix. Rows are keyed by student id, so
/// recomputes update in place.
pub fn upsert_total_scores(conn: &Connection, standings: &[RankedTotal]) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    let computed_at = Utc::now().to_rfc3339();
    for row in standings {
        tx.execute(
            "INSERT INTO student_total_scores(student_id, name, total, position, computed_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id) DO UPDATE SET
                name = excluded.name,
                total = excluded.total,
                position = excluded.position,
                computed_at = excluded.computed_at",
            (
                &row.student_id,
                &row.name,
                row.total,
                row.position,
                &computed_at,
            ),
        )?;
    }
    tx.commit()
}
