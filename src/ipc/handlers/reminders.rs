use crate::ipc::error::{err, ok};
use crate::ipc::handlers::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::reminder::run_scan;
use serde_json::json;

/// Runs one scan pass synchronously on the request connection. The
/// background thread runs the same function on its own schedule.
fn handle_reminders_scan_now(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let now = chrono::Local::now().naive_local();
    match run_scan(conn, now) {
        Ok(outcome) => ok(
            &req.id,
            json!({ "examined": outcome.examined, "enqueued": outcome.enqueued }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e, None),
    }
}

fn handle_reminders_pending(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, lesson_id, start_at, enqueued_at FROM reminder_queue ORDER BY start_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reminders = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "lessonId": r.get::<_, String>(1)?,
                "startAt": r.get::<_, String>(2)?,
                "enqueuedAt": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "reminders": reminders }))
}

/// Delivery confirmation from the push collaborator: acknowledged rows leave
/// the queue.
fn handle_reminders_ack(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(ids) = req.params.get("reminderIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing reminderIds", None);
    };
    let mut acked = 0usize;
    for id in ids {
        let Some(id) = id.as_str() else {
            return err(&req.id, "bad_params", "reminderIds must be strings", None);
        };
        match conn.execute("DELETE FROM reminder_queue WHERE id = ?", [id]) {
            Ok(n) => acked += n,
            Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
        }
    }
    ok(&req.id, json!({ "acked": acked }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reminders.scanNow" => Some(handle_reminders_scan_now(state, req)),
        "reminders.pending" => Some(handle_reminders_pending(state, req)),
        "reminders.ack" => Some(handle_reminders_ack(state, req)),
        _ => None,
    }
}
