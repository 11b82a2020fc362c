use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rank;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

const SUBMIT_MAX_SUBJECTS: usize = 64;
const SUBMIT_MAX_STUDENTS_PER_SUBJECT: usize = 2000;
const SUBMIT_MAX_SCORE: i64 = 1_000_000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

struct ParsedStudent {
    name: String,
    student_no: Option<String>,
    score: i64,
}

struct ParsedBatch {
    subject: String,
    subject_key: String,
    students: Vec<ParsedStudent>,
}

fn reject_entry(
    subject: Option<&str>,
    batch_index: usize,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut entry = json!({
        "subject": subject,
        "batchIndex": batch_index,
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        entry["details"] = d;
    }
    entry
}

fn parse_batch(batch_index: usize, raw: &serde_json::Value) -> Result<ParsedBatch, serde_json::Value> {
    let Some(obj) = raw.as_object() else {
        return Err(reject_entry(
            None,
            batch_index,
            "bad_params",
            "batch must be an object",
            None,
        ));
    };

    let subject_raw = match obj.get("subject").and_then(|v| v.as_str()) {
        Some(v) => v,
        None => {
            return Err(reject_entry(
                None,
                batch_index,
                "bad_params",
                "missing subject",
                None,
            ))
        }
    };
    let subject = subject_raw.trim().to_string();
    if subject.is_empty() {
        return Err(reject_entry(
            None,
            batch_index,
            "bad_params",
            "subject must not be empty",
            None,
        ));
    }
    let subject_key = rank::subject_key(subject_raw);

    let Some(students_raw) = obj.get("students").and_then(|v| v.as_array()) else {
        return Err(reject_entry(
            Some(&subject),
            batch_index,
            "bad_params",
            "missing students[]",
            None,
        ));
    };
    if students_raw.is_empty() {
        return Err(reject_entry(
            Some(&subject),
            batch_index,
            "bad_params",
            "students must not be empty",
            None,
        ));
    }
    if students_raw.len() > SUBMIT_MAX_STUDENTS_PER_SUBJECT {
        return Err(reject_entry(
            Some(&subject),
            batch_index,
            "bad_params",
            "too many students in one batch",
            Some(json!({
                "students": students_raw.len(),
                "max": SUBMIT_MAX_STUDENTS_PER_SUBJECT
            })),
        ));
    }

    let mut students: Vec<ParsedStudent> = Vec::with_capacity(students_raw.len());
    let mut seen: HashSet<(String, Option<String>)> = HashSet::new();
    for (i, sv) in students_raw.iter().enumerate() {
        let Some(sobj) = sv.as_object() else {
            return Err(reject_entry(
                Some(&subject),
                batch_index,
                "bad_params",
                format!("student at index {} must be an object", i),
                None,
            ));
        };

        let name = match sobj.get("name").and_then(|v| v.as_str()) {
            Some(v) => rank::canonical_name(v),
            None => {
                return Err(reject_entry(
                    Some(&subject),
                    batch_index,
                    "bad_params",
                    format!("student at index {} missing name", i),
                    None,
                ))
            }
        };
        if name.is_empty() {
            return Err(reject_entry(
                Some(&subject),
                batch_index,
                "bad_params",
                format!("student at index {} has an empty name", i),
                None,
            ));
        }

        let student_no = match sobj.get("studentNo") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => match v.as_str() {
                Some(s) if s.trim().is_empty() => None,
                Some(s) => Some(s.trim().to_string()),
                None => {
                    return Err(reject_entry(
                        Some(&subject),
                        batch_index,
                        "bad_params",
                        format!("student at index {} studentNo must be a string", i),
                        None,
                    ))
                }
            },
        };

        let score = match sobj.get("score").and_then(|v| v.as_i64()) {
            Some(v) => v,
            None => {
                return Err(reject_entry(
                    Some(&subject),
                    batch_index,
                    "bad_params",
                    format!("student at index {} missing integer score", i),
                    None,
                ))
            }
        };
        if score < 0 {
            return Err(reject_entry(
                Some(&subject),
                batch_index,
                "bad_params",
                "score must not be negative",
                Some(json!({ "name": name, "score": score })),
            ));
        }
        // The cap keeps cross-subject totals far away from the accumulator's
        // limits.
        if score > SUBMIT_MAX_SCORE {
            return Err(reject_entry(
                Some(&subject),
                batch_index,
                "bad_params",
                "score exceeds the maximum",
                Some(json!({ "name": name, "score": score, "max": SUBMIT_MAX_SCORE })),
            ));
        }

        if !seen.insert((name.clone(), student_no.clone())) {
            return Err(reject_entry(
                Some(&subject),
                batch_index,
                "duplicate_student",
                "student listed more than once in one batch",
                Some(json!({ "name": name })),
            ));
        }

        students.push(ParsedStudent {
            name,
            student_no,
            score,
        });
    }

    Ok(ParsedBatch {
        subject,
        subject_key,
        students,
    })
}

/// Writes one subject batch inside its own transaction: claim the subject,
/// resolve student identities, rank, insert rows, commit. Losing the claim
/// means a previous upload owns the subject; nothing is written.
fn ingest_subject(conn: &Connection, batch: &ParsedBatch) -> Result<usize, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let claimed = db::claim_subject(&tx, &batch.subject_key, &batch.subject)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    if !claimed {
        let _ = tx.rollback();
        return Err(HandlerErr::new(
            "already_uploaded",
            format!("scores for subject {} already uploaded", batch.subject),
        ));
    }

    let mut entries: Vec<rank::ScoreEntry> = Vec::with_capacity(batch.students.len());
    for s in &batch.students {
        let student_id = db::resolve_student(&tx, &s.name, s.student_no.as_deref())
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        entries.push(rank::ScoreEntry {
            student_id,
            name: s.name.clone(),
            score: s.score,
        });
    }

    let ranked = rank::assign_subject_positions(&entries);
    let created_at = Utc::now().to_rfc3339();
    for row in &ranked {
        tx.execute(
            "INSERT INTO subject_scores(id, subject_key, subject, student_id, score, position, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &batch.subject_key,
                &batch.subject,
                &row.student_id,
                row.score,
                row.position,
                &created_at,
            ),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "subject_scores" }),
            )
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(ranked.len())
}

fn handle_scores_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(batches) = req.params.get("batches").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing batches[]", None);
    };
    if batches.is_empty() {
        return err(&req.id, "bad_params", "batches must not be empty", None);
    }
    if batches.len() > SUBMIT_MAX_SUBJECTS {
        return err(
            &req.id,
            "bad_params",
            "too many batches in one request",
            Some(json!({ "batches": batches.len(), "max": SUBMIT_MAX_SUBJECTS })),
        );
    }

    let mut ingested: Vec<serde_json::Value> = Vec::new();
    let mut rejected: Vec<serde_json::Value> = Vec::new();

    for (i, raw) in batches.iter().enumerate() {
        let batch = match parse_batch(i, raw) {
            Ok(b) => b,
            Err(entry) => {
                rejected.push(entry);
                continue;
            }
        };

        match ingest_subject(conn, &batch) {
            Ok(count) => ingested.push(json!({
                "subject": batch.subject,
                "students": count
            })),
            Err(e) if e.code == "already_uploaded" => {
                rejected.push(reject_entry(
                    Some(&batch.subject),
                    i,
                    e.code,
                    e.message,
                    None,
                ));
            }
            Err(e) => return e.response(&req.id),
        }
    }

    // Standings reflect everything on disk after this request, accepted
    // batches included.
    let standings = match rank::compute_overall_standings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    if let Err(e) = db::upsert_total_scores(conn, &standings) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "student_total_scores" })),
        );
    }

    ok(
        &req.id,
        json!({
            "ingested": ingested,
            "rejected": rejected,
            "standings": standings
        }),
    )
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    // Correlated subquery for the per-subject row count, same trick the
    // dashboards use to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           u.subject,
           u.uploaded_at,
           (SELECT COUNT(*) FROM subject_scores sc WHERE sc.subject_key = u.subject_key) AS student_count
         FROM uploaded_subjects u
         ORDER BY u.subject",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let subject: String = row.get(0)?;
            let uploaded_at: String = row.get(1)?;
            let student_count: i64 = row.get(2)?;
            Ok(json!({
                "subject": subject,
                "uploadedAt": uploaded_at,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.submit" => Some(handle_scores_submit(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}
