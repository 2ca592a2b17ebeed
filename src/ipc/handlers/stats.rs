use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::helpers::{db_conn, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn load_rows(
    state: &AppState,
    req: &Request,
) -> Result<Vec<calc::SettlementRow>, serde_json::Value> {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let teacher_id = parse_opt_string(req.params.get("teacherId"))
        .map_err(|m| err(&req.id, "bad_params", format!("teacherId {}", m), None))?;
    calc::load_settlement_rows(conn, &student_id, teacher_id.as_deref())
        .map_err(|e| err(&req.id, &e.code, e.message, e.details))
}

fn handle_stats_attendance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let rows = match load_rows(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let stats = calc::attendance_stats(&rows);
    ok(&req.id, json!({ "stats": stats }))
}

fn handle_stats_debt(state: &mut AppState, req: &Request) -> serde_json::Value {
    let rows = match load_rows(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let debt = calc::debt_info(&rows);
    ok(&req.id, json!({ "debt": debt }))
}

fn handle_stats_detailed(state: &mut AppState, req: &Request) -> serde_json::Value {
    let rows = match load_rows(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let detailed = calc::DetailedStats {
        overall: calc::attendance_stats(&rows),
        per_subject: calc::per_subject_stats(&rows),
        per_teacher: calc::per_teacher_stats(&rows),
        streak: calc::streak_info(&rows),
    };
    ok(&req.id, json!({ "stats": detailed }))
}

fn handle_stats_achievements(state: &mut AppState, req: &Request) -> serde_json::Value {
    let rows = match load_rows(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let achievements = calc::achievements(&rows);
    ok(&req.id, json!({ "achievements": achievements }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.attendance" => Some(handle_stats_attendance(state, req)),
        "stats.debt" => Some(handle_stats_debt(state, req)),
        "stats.detailed" => Some(handle_stats_detailed(state, req)),
        "stats.achievements" => Some(handle_stats_achievements(state, req)),
        _ => None,
    }
}
