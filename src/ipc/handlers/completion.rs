use crate::calc::{
    ATTENDANCE_ATTENDED, ATTENDANCE_MISSED, ATTENDANCE_UNKNOWN, PAYMENT_PAID,
    PAYMENT_TYPE_SUBSCRIPTION, PAYMENT_UNPAID, STATUS_PLANNED, SUBSCRIPTION_DATE,
    SUBSCRIPTION_LESSONS,
};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::helpers::{db_conn, now_stamp, required_str};
use crate::ipc::handlers::lessons::lesson_json;
use crate::ipc::types::{AppState, Request};
use crate::recurrence::parse_date;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone)]
struct Outcome {
    student_id: String,
    attendance: String,
    rating: Option<i64>,
    payment_status: Option<String>,
    use_subscription: bool,
}

fn parse_attendance(raw: &str) -> Result<String, String> {
    match raw {
        ATTENDANCE_UNKNOWN | ATTENDANCE_ATTENDED | ATTENDANCE_MISSED => Ok(raw.to_string()),
        other => Err(format!(
            "attendance must be unknown, attended or missed (got {})",
            other
        )),
    }
}

fn parse_payment_status(raw: &str) -> Result<String, String> {
    match raw {
        PAYMENT_UNPAID | PAYMENT_PAID => Ok(raw.to_string()),
        other => Err(format!("paymentStatus must be unpaid or paid (got {})", other)),
    }
}

fn parse_rating(v: &JsonValue) -> Result<i64, String> {
    v.as_i64()
        .filter(|r| (1..=5).contains(r))
        .ok_or_else(|| "rating must be an integer between 1 and 5".to_string())
}

fn parse_outcomes(v: Option<&JsonValue>) -> Result<Vec<Outcome>, String> {
    let Some(raw) = v else {
        return Err("missing outcomes".to_string());
    };
    let arr = raw.as_array().ok_or("outcomes must be an array")?;
    if arr.is_empty() {
        return Err("outcomes must not be empty".to_string());
    }
    let mut out: Vec<Outcome> = Vec::with_capacity(arr.len());
    for item in arr {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or("outcomes entries need a studentId")?;
        if out.iter().any(|o| o.student_id == student_id) {
            return Err(format!("duplicate outcome for student {}", student_id));
        }
        let attendance_raw = item
            .get("attendance")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "outcomes entries need an attendance".to_string())?;
        let attendance = parse_attendance(attendance_raw)?;
        let rating = match item.get("rating") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => Some(parse_rating(v)?),
        };
        let payment_status = match item.get("paymentStatus") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or("paymentStatus must be a string".to_string())
                    .and_then(|raw| parse_payment_status(raw))?,
            ),
        };
        let use_subscription = item
            .get("useSubscription")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        out.push(Outcome {
            student_id,
            attendance,
            rating,
            payment_status,
            use_subscription,
        });
    }
    Ok(out)
}

enum BulkAction {
    Attendance(String),
    Rating(Option<i64>),
    Payment(String),
}

struct LessonHead {
    teacher_id: String,
    status: String,
}

fn load_lesson_head(conn: &Connection, lesson_id: &str) -> Result<Option<LessonHead>, String> {
    conn.query_row(
        "SELECT teacher_id, status FROM lessons WHERE id = ?",
        [lesson_id],
        |r| {
            Ok(LessonHead {
                teacher_id: r.get(0)?,
                status: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(|e| e.to_string())
}

fn participant_row_id(
    conn: &Connection,
    lesson_id: &str,
    student_id: &str,
) -> Result<Option<String>, String> {
    conn.query_row(
        "SELECT id FROM lesson_students WHERE lesson_id = ? AND student_id = ?",
        (lesson_id, student_id),
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| e.to_string())
}

#[derive(Debug, Clone)]
struct ActiveSubscription {
    id: String,
    kind: String,
}

/// Oldest consumable subscription for the pair: a lessons-kind grant with
/// credits left wins over a date-kind grant that is merely unexpired.
fn find_active_subscription(
    conn: &Connection,
    teacher_id: &str,
    student_id: &str,
    today: &str,
) -> Result<Option<ActiveSubscription>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, kind, total_lessons, used_lessons, expires_at
             FROM subscriptions
             WHERE teacher_id = ? AND student_id = ? AND deleted_at IS NULL
             ORDER BY created_at",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map((teacher_id, student_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<i64>>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| e.to_string())?;

    let today = parse_date(today);
    let mut date_fallback: Option<ActiveSubscription> = None;
    for (id, kind, total, used, expires_at) in rows {
        match kind.as_str() {
            SUBSCRIPTION_LESSONS => {
                let remaining = total.map(|t| (t - used).max(0)).unwrap_or(0);
                if remaining > 0 {
                    return Ok(Some(ActiveSubscription { id, kind }));
                }
            }
            SUBSCRIPTION_DATE => {
                let expired = match (expires_at.as_deref().and_then(parse_date), today) {
                    (Some(exp), Some(now)) => now > exp,
                    _ => false,
                };
                if !expired && date_fallback.is_none() {
                    date_fallback = Some(ActiveSubscription { id, kind });
                }
            }
            _ => {}
        }
    }
    Ok(date_fallback)
}

fn apply_outcome(
    tx: &Transaction<'_>,
    row_id: &str,
    outcome: &Outcome,
    consumed: Option<&ActiveSubscription>,
) -> Result<(), String> {
    match outcome.attendance.as_str() {
        // Missed always wins: any rating/payment supplied alongside is void.
        ATTENDANCE_MISSED => {
            tx.execute(
                "UPDATE lesson_students
                 SET attendance = 'missed', rating = NULL, payment_status = 'unpaid'
                 WHERE id = ?",
                params![row_id],
            )
            .map_err(|e| e.to_string())?;
        }
        ATTENDANCE_ATTENDED => {
            tx.execute(
                "UPDATE lesson_students SET attendance = 'attended' WHERE id = ?",
                params![row_id],
            )
            .map_err(|e| e.to_string())?;
            if let Some(rating) = outcome.rating {
                tx.execute(
                    "UPDATE lesson_students SET rating = ? WHERE id = ?",
                    params![rating, row_id],
                )
                .map_err(|e| e.to_string())?;
            }
            if let Some(payment) = &outcome.payment_status {
                tx.execute(
                    "UPDATE lesson_students SET payment_status = ? WHERE id = ?",
                    params![payment, row_id],
                )
                .map_err(|e| e.to_string())?;
            }
            if let Some(subscription) = consumed {
                tx.execute(
                    "UPDATE lesson_students
                     SET payment_type = ?, payment_status = 'paid', used_subscription = 1
                     WHERE id = ?",
                    params![PAYMENT_TYPE_SUBSCRIPTION, row_id],
                )
                .map_err(|e| e.to_string())?;
                if subscription.kind == SUBSCRIPTION_LESSONS {
                    tx.execute(
                        "UPDATE subscriptions SET used_lessons = used_lessons + 1 WHERE id = ?",
                        params![subscription.id],
                    )
                    .map_err(|e| e.to_string())?;
                }
            }
        }
        _ => {
            tx.execute(
                "UPDATE lesson_students SET attendance = 'unknown' WHERE id = ?",
                params![row_id],
            )
            .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn handle_lessons_complete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let outcomes = match parse_outcomes(req.params.get("outcomes")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let lesson = match load_lesson_head(conn, &lesson_id) {
        Ok(Some(l)) => l,
        Ok(None) => return err(&req.id, "not_found", "lesson not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    };
    if lesson.status != STATUS_PLANNED {
        return err(
            &req.id,
            "conflict",
            format!("lesson is already {}", lesson.status),
            None,
        );
    }

    // Resolve every row and subscription up front; nothing is written until
    // the whole request is known to be applicable.
    let today = now_stamp();
    let today = today.get(0..10).unwrap_or("").to_string();
    let mut resolved: Vec<(String, Outcome, Option<ActiveSubscription>)> =
        Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let row_id = match participant_row_id(conn, &lesson_id, &outcome.student_id) {
            Ok(Some(id)) => id,
            Ok(None) => {
                return err(
                    &req.id,
                    "not_found",
                    format!("student {} is not on this lesson", outcome.student_id),
                    None,
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e, None),
        };
        let consumed = if outcome.use_subscription && outcome.attendance == ATTENDANCE_ATTENDED {
            match find_active_subscription(conn, &lesson.teacher_id, &outcome.student_id, &today) {
                Ok(Some(sub)) => Some(sub),
                Ok(None) => {
                    return err(
                        &req.id,
                        "conflict",
                        format!("student {} has no active subscription", outcome.student_id),
                        None,
                    )
                }
                Err(e) => return err(&req.id, "db_query_failed", e, None),
            }
        } else {
            None
        };
        resolved.push((row_id, outcome, consumed));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (row_id, outcome, consumed) in &resolved {
        if let Err(e) = apply_outcome(&tx, row_id, outcome, consumed.as_ref()) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e, None);
        }
    }
    let ts = now_stamp();
    if let Err(e) = tx.execute(
        "UPDATE lessons SET status = 'done', updated_at = ? WHERE id = ?",
        params![ts, lesson_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match lesson_json(conn, &lesson_id) {
        Ok(Some(lesson)) => ok(&req.id, json!({ "lesson": lesson })),
        Ok(None) => err(&req.id, "db_query_failed", "completed lesson vanished", None),
        Err(e) => err(&req.id, "db_query_failed", e, None),
    }
}

fn handle_bulk_set_participants(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let action = match required_str(req, "action") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let lesson = match load_lesson_head(conn, &lesson_id) {
        Ok(Some(l)) => l,
        Ok(None) => return err(&req.id, "not_found", "lesson not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    };
    if lesson.status != STATUS_PLANNED {
        return err(
            &req.id,
            "conflict",
            format!("lesson is already {}", lesson.status),
            None,
        );
    }

    let parsed = match action.as_str() {
        "setAttendance" => req
            .params
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing value".to_string())
            .and_then(parse_attendance)
            .map(BulkAction::Attendance),
        "setRating" => match req.params.get("value") {
            Some(v) if v.is_null() => Ok(BulkAction::Rating(None)),
            Some(v) => parse_rating(v).map(|r| BulkAction::Rating(Some(r))),
            None => Err("missing value".to_string()),
        },
        "setPayment" => req
            .params
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing value".to_string())
            .and_then(parse_payment_status)
            .map(BulkAction::Payment),
        other => Err(format!(
            "action must be setAttendance, setRating or setPayment (got {})",
            other
        )),
    };
    let parsed = match parsed {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let applied = match &parsed {
        // Marking everyone missed voids ratings and payments in the same
        // statement; missed always wins.
        BulkAction::Attendance(value) if value == ATTENDANCE_MISSED => tx.execute(
            "UPDATE lesson_students
             SET attendance = 'missed', rating = NULL, payment_status = 'unpaid'
             WHERE lesson_id = ?",
            params![lesson_id],
        ),
        BulkAction::Attendance(value) => tx.execute(
            "UPDATE lesson_students SET attendance = ? WHERE lesson_id = ?",
            params![value, lesson_id],
        ),
        // Rating and payment only ever land on participants already marked
        // attended; everyone else is a no-op.
        BulkAction::Rating(value) => tx.execute(
            "UPDATE lesson_students SET rating = ? WHERE lesson_id = ? AND attendance = 'attended'",
            params![value, lesson_id],
        ),
        BulkAction::Payment(value) => tx.execute(
            "UPDATE lesson_students SET payment_status = ? WHERE lesson_id = ? AND attendance = 'attended'",
            params![value, lesson_id],
        ),
    };
    let applied = match applied {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match lesson_json(conn, &lesson_id) {
        Ok(Some(lesson)) => ok(&req.id, json!({ "lesson": lesson, "applied": applied })),
        Ok(None) => err(&req.id, "db_query_failed", "lesson vanished", None),
        Err(e) => err(&req.id, "db_query_failed", e, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lessons.complete" => Some(handle_lessons_complete(state, req)),
        "lessons.bulkSetParticipants" => Some(handle_bulk_set_participants(state, req)),
        _ => None,
    }
}
