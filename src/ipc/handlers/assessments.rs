use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rank;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

struct StudentRow {
    id: String,
    name: String,
    student_no: Option<String>,
}

fn find_students(
    conn: &Connection,
    name: &str,
    student_no: Option<&str>,
) -> rusqlite::Result<Vec<StudentRow>> {
    let mut out = Vec::new();
    match student_no {
        Some(no) => {
            let mut stmt = conn.prepare(
                "SELECT id, name, student_no FROM students WHERE name = ? AND student_no = ?",
            )?;
            let rows = stmt.query_map((name, no), |row| {
                Ok(StudentRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    student_no: row.get(2)?,
                })
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, name, student_no FROM students WHERE name = ? ORDER BY student_no",
            )?;
            let rows = stmt.query_map([name], |row| {
                Ok(StudentRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    student_no: row.get(2)?,
                })
            })?;
            for row in rows {
                out.push(row?);
            }
        }
    }
    Ok(out)
}

fn handle_assessments_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let subject_raw = match req.params.get("subject").and_then(|v| v.as_str()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing subject", None),
    };
    let key = rank::subject_key(subject_raw);
    if key.is_empty() {
        return err(&req.id, "bad_params", "subject must not be empty", None);
    }

    let uploaded = match db::subject_uploaded(conn, &key) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT sc.student_id, st.name, st.student_no, sc.score, sc.position
         FROM subject_scores sc
         JOIN students st ON st.id = sc.student_id
         WHERE sc.subject_key = ?
         ORDER BY sc.score DESC, sc.position ASC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&key], |row| {
            let student_id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let student_no: Option<String> = row.get(2)?;
            let score: i64 = row.get(3)?;
            let position: i64 = row.get(4)?;
            Ok(json!({
                "studentId": student_id,
                "name": name,
                "studentNo": student_no,
                "score": score,
                "position": position
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    let students = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // An unknown subject answers with an empty list, not an error; uploaded
    // distinguishes "never uploaded" from "uploaded with zero rows".
    let display = uploaded
        .as_ref()
        .map(|u| u.subject.clone())
        .unwrap_or_else(|| subject_raw.trim().to_string());

    ok(
        &req.id,
        json!({
            "subject": display,
            "uploaded": uploaded.is_some(),
            "uploadedAt": uploaded.as_ref().map(|u| u.uploaded_at.clone()),
            "students": students
        }),
    )
}

fn handle_assessments_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => rank::canonical_name(v),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    // Same studentNo typing as the submit path: absent and null mean "no
    // number", anything else must be a string.
    let student_no = match req.params.get("studentNo") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) if s.trim().is_empty() => None,
            Some(s) => Some(s.trim().to_string()),
            None => return err(&req.id, "bad_params", "studentNo must be a string", None),
        },
    };

    let matches = match find_students(conn, &name, student_no.as_deref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if matches.is_empty() {
        return err(&req.id, "not_found", "student not found", None);
    }
    if matches.len() > 1 {
        let candidates: Vec<serde_json::Value> = matches
            .iter()
            .map(|m| json!({ "studentNo": m.student_no }))
            .collect();
        return err(
            &req.id,
            "ambiguous_student",
            "several students share this name; pass studentNo",
            Some(json!({ "name": name, "candidates": candidates })),
        );
    }
    let student = &matches[0];

    let total_row: Option<(i64, i64)> = match conn
        .query_row(
            "SELECT total, position FROM student_total_scores WHERE student_id = ?",
            [&student.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((total, position)) = total_row else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT subject, score, position FROM subject_scores
         WHERE student_id = ?
         ORDER BY subject_key",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let results = match stmt
        .query_map([&student.id], |row| {
            let subject: String = row.get(0)?;
            let score: i64 = row.get(1)?;
            let position: i64 = row.get(2)?;
            Ok(json!({
                "subject": subject,
                "score": score,
                "position": position
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "student": {
                "studentId": student.id,
                "name": student.name,
                "studentNo": student.student_no
            },
            "total": total,
            "position": position,
            "results": results
        }),
    )
}

fn handle_assessments_overall(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    // Recompute from subject_scores and refresh the stored table, so the
    // answer stays right even if a previous refresh was interrupted.
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

    ok(&req.id, json!({ "standings": standings }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.subject" => Some(handle_assessments_subject(state, req)),
        "assessments.student" => Some(handle_assessments_student(state, req)),
        "assessments.overall" => Some(handle_assessments_overall(state, req)),
        _ => None,
    }
}
