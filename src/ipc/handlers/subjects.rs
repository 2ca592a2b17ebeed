use crate::ipc::error::{err, ok};
use crate::ipc::handlers::helpers::{db_conn, ensure_teacher, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn duplicate_subject(
    conn: &Connection,
    teacher_id: &str,
    name: &str,
    code: Option<&str>,
    exclude_id: Option<&str>,
) -> Result<bool, String> {
    let by_name: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE teacher_id = ? AND name = ?",
            (teacher_id, name),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    if by_name.as_deref().is_some() && by_name.as_deref() != exclude_id {
        return Ok(true);
    }
    if let Some(code) = code {
        let by_code: Option<String> = conn
            .query_row(
                "SELECT id FROM subjects WHERE teacher_id = ? AND code = ?",
                (teacher_id, code),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        if by_code.as_deref().is_some() && by_code.as_deref() != exclude_id {
            return Ok(true);
        }
    }
    Ok(false)
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match parse_opt_string(req.params.get("code")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("code {}", m), None),
    };
    if let Err(e) = ensure_teacher(conn, &teacher_id) {
        return err(&req.id, "db_insert_failed", e, None);
    }
    match duplicate_subject(conn, &teacher_id, &name, code.as_deref(), None) {
        Ok(true) => return err(&req.id, "conflict", "subject name or code already in use", None),
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, teacher_id, name, code) VALUES(?, ?, ?, ?)",
        (&subject_id, &teacher_id, &name, code.as_deref()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "subjectId": subject_id }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let existing = conn
        .query_row(
            "SELECT teacher_id, name, code FROM subjects WHERE id = ?",
            [&subject_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional();
    let (teacher_id, old_name, old_code) = match existing {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let name = match parse_opt_string(req.params.get("name")) {
        Ok(v) => v.unwrap_or(old_name),
        Err(m) => return err(&req.id, "bad_params", format!("name {}", m), None),
    };
    let code = if req.params.get("code").is_some() {
        match parse_opt_string(req.params.get("code")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("code {}", m), None),
        }
    } else {
        old_code
    };
    match duplicate_subject(conn, &teacher_id, &name, code.as_deref(), Some(&subject_id)) {
        Ok(true) => return err(&req.id, "conflict", "subject name or code already in use", None),
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    }
    if let Err(e) = conn.execute(
        "UPDATE subjects SET name = ?, code = ? WHERE id = ?",
        (&name, code.as_deref(), &subject_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let referenced = conn
        .query_row(
            "SELECT 1 FROM lessons WHERE subject_id = ? LIMIT 1",
            [&subject_id],
            |r| r.get::<_, i64>(0),
        )
        .optional();
    match referenced {
        Ok(Some(_)) => {
            return err(
                &req.id,
                "conflict",
                "subject is referenced by existing lessons",
                None,
            )
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, name, code FROM subjects WHERE teacher_id = ? ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subjects = match stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, Option<String>>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}
