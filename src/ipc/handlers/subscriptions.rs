use crate::calc::{subscription_expired, subscription_remaining, SUBSCRIPTION_DATE, SUBSCRIPTION_LESSONS};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::helpers::{
    db_conn, ensure_students_linked, ensure_teacher, now_stamp, parse_bool, parse_opt_i64,
    parse_opt_string, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::recurrence::parse_date;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SubscriptionRow {
    id: String,
    teacher_id: String,
    student_id: String,
    kind: String,
    name: String,
    total_lessons: Option<i64>,
    used_lessons: i64,
    expires_at: Option<String>,
    deleted_at: Option<String>,
    created_at: String,
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

impl SubscriptionRow {
    fn remaining(&self) -> Option<i64> {
        subscription_remaining(self.total_lessons, self.used_lessons)
    }

    fn is_expired(&self, today: NaiveDate) -> bool {
        subscription_expired(
            &self.kind,
            self.total_lessons,
            self.used_lessons,
            self.expires_at.as_deref().and_then(parse_date),
            today,
        )
    }

    fn is_active(&self, today: NaiveDate) -> bool {
        self.deleted_at.is_none() && !self.is_expired(today)
    }

    /// Short status string the UI shows next to a student's name.
    fn display(&self) -> Option<String> {
        match self.kind.as_str() {
            SUBSCRIPTION_LESSONS => self.remaining().map(|r| format!("{} lessons left", r)),
            SUBSCRIPTION_DATE => self.expires_at.as_ref().map(|d| format!("until {}", d)),
            _ => None,
        }
    }

    fn to_json(&self, today: NaiveDate) -> JsonValue {
        json!({
            "id": self.id,
            "teacherId": self.teacher_id,
            "studentId": self.student_id,
            "kind": self.kind,
            "name": self.name,
            "totalLessons": self.total_lessons,
            "usedLessons": self.used_lessons,
            "remainingLessons": self.remaining(),
            "expiresAt": self.expires_at,
            "isExpired": self.is_expired(today),
            "isActive": self.is_active(today),
            "deletedAt": self.deleted_at,
            "createdAt": self.created_at,
        })
    }
}

fn map_subscription(r: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        id: r.get(0)?,
        teacher_id: r.get(1)?,
        student_id: r.get(2)?,
        kind: r.get(3)?,
        name: r.get(4)?,
        total_lessons: r.get(5)?,
        used_lessons: r.get(6)?,
        expires_at: r.get(7)?,
        deleted_at: r.get(8)?,
        created_at: r.get(9)?,
    })
}

const SUBSCRIPTION_COLUMNS: &str = "id, teacher_id, student_id, kind, name, total_lessons,
    used_lessons, expires_at, deleted_at, created_at";

fn load_subscription(conn: &Connection, id: &str) -> Result<Option<SubscriptionRow>, String> {
    let sql = format!("SELECT {} FROM subscriptions WHERE id = ?", SUBSCRIPTION_COLUMNS);
    conn.query_row(&sql, [id], |r| map_subscription(r))
        .optional()
        .map_err(|e| e.to_string())
}

fn handle_subscriptions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind = match required_str(req, "kind") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let total_lessons = match parse_opt_i64(req.params.get("totalLessons")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("totalLessons {}", m), None),
    };
    let expires_at = match parse_opt_string(req.params.get("expiresAt")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("expiresAt {}", m), None),
    };
    match kind.as_str() {
        SUBSCRIPTION_LESSONS => {
            if !total_lessons.map(|t| t > 0).unwrap_or(false) {
                return err(
                    &req.id,
                    "bad_params",
                    "lessons subscriptions need a positive totalLessons",
                    None,
                );
            }
        }
        SUBSCRIPTION_DATE => {
            if expires_at.as_deref().and_then(parse_date).is_none() {
                return err(
                    &req.id,
                    "bad_params",
                    "date subscriptions need an expiresAt (YYYY-MM-DD)",
                    None,
                );
            }
        }
        other => {
            return err(
                &req.id,
                "bad_params",
                format!("kind must be lessons or date (got {})", other),
                None,
            )
        }
    }
    if let Some(raw) = expires_at.as_deref() {
        if parse_date(raw).is_none() {
            return err(&req.id, "bad_params", "expiresAt must be YYYY-MM-DD", None);
        }
    }

    if let Err(e) = ensure_teacher(conn, &teacher_id) {
        return err(&req.id, "db_insert_failed", e, None);
    }
    if let Err(resp) = ensure_students_linked(conn, req, &teacher_id, &[student_id.clone()]) {
        return resp;
    }

    let subscription_id = Uuid::new_v4().to_string();
    let ts = now_stamp();
    if let Err(e) = conn.execute(
        "INSERT INTO subscriptions(
            id, teacher_id, student_id, kind, name, total_lessons, used_lessons,
            expires_at, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, 0, ?, ?)",
        rusqlite::params![
            subscription_id,
            teacher_id,
            student_id,
            kind,
            name,
            total_lessons,
            expires_at,
            ts
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    match load_subscription(conn, &subscription_id) {
        Ok(Some(sub)) => ok(&req.id, json!({ "subscription": sub.to_json(today()) })),
        Ok(None) => err(&req.id, "db_query_failed", "created subscription vanished", None),
        Err(e) => err(&req.id, "db_query_failed", e, None),
    }
}

fn handle_subscriptions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match parse_opt_string(req.params.get("studentId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentId {}", m), None),
    };
    let include_deleted = match parse_bool(req.params.get("includeDeleted"), false) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("includeDeleted {}", m), None),
    };

    let mut sql = format!(
        "SELECT {} FROM subscriptions WHERE teacher_id = ?",
        SUBSCRIPTION_COLUMNS
    );
    let mut binds: Vec<String> = vec![teacher_id];
    if let Some(student_id) = student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(student_id);
    }
    if !include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    sql.push_str(" ORDER BY created_at, id");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| map_subscription(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let now = today();
    let subscriptions: Vec<JsonValue> = rows.iter().map(|s| s.to_json(now)).collect();
    ok(&req.id, json!({ "subscriptions": subscriptions }))
}

fn handle_subscriptions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    set_deleted_at(state, req, true)
}

fn handle_subscriptions_restore(state: &mut AppState, req: &Request) -> serde_json::Value {
    set_deleted_at(state, req, false)
}

fn set_deleted_at(state: &mut AppState, req: &Request, delete: bool) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subscription_id = match required_str(req, "subscriptionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_subscription(conn, &subscription_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "subscription not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    }
    let result = if delete {
        conn.execute(
            "UPDATE subscriptions SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
            (now_stamp(), &subscription_id),
        )
    } else {
        conn.execute(
            "UPDATE subscriptions SET deleted_at = NULL WHERE id = ?",
            [&subscription_id],
        )
    };
    if let Err(e) = result {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    match load_subscription(conn, &subscription_id) {
        Ok(Some(sub)) => ok(&req.id, json!({ "subscription": sub.to_json(today()) })),
        Ok(None) => err(&req.id, "db_query_failed", "subscription vanished", None),
        Err(e) => err(&req.id, "db_query_failed", e, None),
    }
}

fn handle_subscriptions_consume(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subscription_id = match required_str(req, "subscriptionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sub = match load_subscription(conn, &subscription_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "subscription not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    };
    if sub.deleted_at.is_some() {
        return err(&req.id, "conflict", "subscription is deleted", None);
    }
    if sub.kind != SUBSCRIPTION_LESSONS {
        return err(
            &req.id,
            "conflict",
            "only lesson-credit subscriptions can be consumed",
            None,
        );
    }
    if sub.remaining().unwrap_or(0) == 0 {
        return err(&req.id, "conflict", "no credits left", None);
    }
    if let Err(e) = conn.execute(
        "UPDATE subscriptions SET used_lessons = used_lessons + 1 WHERE id = ?",
        [&subscription_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    match load_subscription(conn, &subscription_id) {
        Ok(Some(sub)) => ok(&req.id, json!({ "subscription": sub.to_json(today()) })),
        Ok(None) => err(&req.id, "db_query_failed", "subscription vanished", None),
        Err(e) => err(&req.id, "db_query_failed", e, None),
    }
}

fn handle_subscriptions_has_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sql = format!(
        "SELECT {} FROM subscriptions
         WHERE teacher_id = ? AND student_id = ? AND deleted_at IS NULL
         ORDER BY created_at, id",
        SUBSCRIPTION_COLUMNS
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map((&teacher_id, &student_id), |r| map_subscription(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let now = today();
    let active = rows.iter().find(|s| s.is_active(now));
    ok(
        &req.id,
        json!({
            "hasActive": active.is_some(),
            "display": active.and_then(|s| s.display()),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subscriptions.create" => Some(handle_subscriptions_create(state, req)),
        "subscriptions.list" => Some(handle_subscriptions_list(state, req)),
        "subscriptions.delete" => Some(handle_subscriptions_delete(state, req)),
        "subscriptions.restore" => Some(handle_subscriptions_restore(state, req)),
        "subscriptions.consume" => Some(handle_subscriptions_consume(state, req)),
        "subscriptions.hasActive" => Some(handle_subscriptions_has_active(state, req)),
        _ => None,
    }
}
