use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::recurrence::format_datetime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value as JsonValue;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn parse_bool(v: Option<&JsonValue>, default: bool) -> Result<bool, &'static str> {
    match v {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v.as_bool().ok_or("must be boolean"),
    }
}

pub fn parse_opt_string(v: Option<&JsonValue>) -> Result<Option<String>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v.as_str().ok_or("must be string or null")?.trim().to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

pub fn parse_opt_i64(v: Option<&JsonValue>) -> Result<Option<i64>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or("must be integer or null"),
    }
}

pub fn now_stamp() -> String {
    format_datetime(chrono::Local::now().naive_local())
}

/// Teacher profiles live outside this core; a stub row is materialized on
/// first reference so foreign keys hold.
pub fn ensure_teacher(conn: &Connection, teacher_id: &str) -> Result<(), String> {
    conn.execute(
        "INSERT OR IGNORE INTO teachers(id, display_name) VALUES(?, ?)",
        (teacher_id, teacher_id),
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, String> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| e.to_string())
}

pub fn student_linked(
    conn: &Connection,
    teacher_id: &str,
    student_id: &str,
) -> Result<bool, String> {
    conn.query_row(
        "SELECT 1 FROM teacher_students WHERE teacher_id = ? AND student_id = ?",
        (teacher_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| e.to_string())
}

/// Forbidden check from the ownership model: every student named in a write
/// must already be linked to the acting teacher.
pub fn ensure_students_linked(
    conn: &Connection,
    req: &Request,
    teacher_id: &str,
    student_ids: &[String],
) -> Result<(), serde_json::Value> {
    for student_id in student_ids {
        match student_linked(conn, teacher_id, student_id) {
            Ok(true) => {}
            Ok(false) => {
                return Err(err(
                    &req.id,
                    "forbidden",
                    format!("student {} is not linked to this teacher", student_id),
                    None,
                ))
            }
            Err(e) => return Err(err(&req.id, "db_query_failed", e, None)),
        }
    }
    Ok(())
}

pub fn subject_exists(conn: &Connection, teacher_id: &str, subject_id: &str) -> Result<bool, String> {
    conn.query_row(
        "SELECT 1 FROM subjects WHERE id = ? AND teacher_id = ?",
        (subject_id, teacher_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| e.to_string())
}
