use crate::calc::{
    CANCELLED_BY_STUDENT, CANCELLED_BY_TEACHER, PAYMENT_TYPE_FIXED, PAYMENT_TYPE_FREE,
    STATUS_CANCELLED, STATUS_PLANNED,
};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::helpers::{
    db_conn, ensure_students_linked, ensure_teacher, now_stamp, parse_bool, parse_opt_i64,
    parse_opt_string, required_str, subject_exists,
};
use crate::ipc::types::{AppState, Request};
use crate::recurrence::{
    expand_occurrences, format_datetime, parse_date, parse_datetime, template_slot, Frequency,
    Recurrence, DATE_FMT,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    This,
    Future,
    All,
}

impl Scope {
    fn parse(v: Option<&JsonValue>) -> Result<Scope, String> {
        match v.and_then(|x| x.as_str()) {
            None => Ok(Scope::This),
            Some("this") => Ok(Scope::This),
            Some("future") => Ok(Scope::Future),
            Some("all") => Ok(Scope::All),
            Some(other) => Err(format!("scope must be this, future or all (got {})", other)),
        }
    }
}

#[derive(Debug, Clone)]
struct ParticipantSpec {
    student_id: String,
    price_rub: Option<i64>,
}

fn parse_participants(v: Option<&JsonValue>, key: &str) -> Result<Vec<ParticipantSpec>, String> {
    let Some(raw) = v else {
        return Err(format!("missing {}", key));
    };
    let arr = raw
        .as_array()
        .ok_or_else(|| format!("{} must be an array", key))?;
    let mut out: Vec<ParticipantSpec> = Vec::with_capacity(arr.len());
    for item in arr {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{} entries need a studentId", key))?;
        let price_rub = match item.get("priceRub") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => Some(
                v.as_i64()
                    .filter(|p| *p >= 0)
                    .ok_or_else(|| format!("{} priceRub must be a non-negative integer", key))?,
            ),
        };
        if out.iter().any(|p| p.student_id == student_id) {
            continue;
        }
        out.push(ParticipantSpec {
            student_id,
            price_rub,
        });
    }
    if out.is_empty() {
        return Err(format!("{} must name at least one student", key));
    }
    Ok(out)
}

fn parse_recurrence(raw: &JsonValue) -> Result<Recurrence, String> {
    let obj = raw.as_object().ok_or("recurrence must be an object")?;
    let frequency = obj
        .get("frequency")
        .and_then(|v| v.as_str())
        .and_then(Frequency::parse)
        .ok_or("recurrence.frequency must be weekly or biweekly")?;
    let end_date = match obj.get("endDate") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_str()
                .and_then(parse_date)
                .ok_or("recurrence.endDate must be YYYY-MM-DD")?,
        ),
    };
    let max_occurrences = match obj.get("maxOccurrences") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(v.as_i64().ok_or("recurrence.maxOccurrences must be an integer")?),
    };
    Ok(Recurrence {
        frequency,
        end_date,
        max_occurrences,
    })
}

#[derive(Debug, Clone)]
struct LessonRow {
    id: String,
    series_id: Option<String>,
    teacher_id: String,
    subject_id: String,
    start_at: String,
    duration_minutes: i64,
    price_rub: i64,
    is_free: bool,
    meeting_url: Option<String>,
    reminder_minutes: Option<i64>,
}

fn load_lesson(conn: &Connection, lesson_id: &str) -> Result<Option<LessonRow>, String> {
    conn.query_row(
        "SELECT id, series_id, teacher_id, subject_id, start_at, duration_minutes,
                price_rub, is_free, meeting_url, reminder_minutes
         FROM lessons WHERE id = ?",
        [lesson_id],
        |r| {
            Ok(LessonRow {
                id: r.get(0)?,
                series_id: r.get(1)?,
                teacher_id: r.get(2)?,
                subject_id: r.get(3)?,
                start_at: r.get(4)?,
                duration_minutes: r.get(5)?,
                price_rub: r.get(6)?,
                is_free: r.get::<_, i64>(7)? != 0,
                meeting_url: r.get(8)?,
                reminder_minutes: r.get(9)?,
            })
        },
    )
    .optional()
    .map_err(|e| e.to_string())
}

pub(super) fn lesson_json(conn: &Connection, lesson_id: &str) -> Result<Option<JsonValue>, String> {
    let row = conn
        .query_row(
            "SELECT id, series_id, teacher_id, subject_id, start_at, duration_minutes,
                    price_rub, is_free, status, cancelled_by, cancellation_reason,
                    notes, meeting_url, reminder_minutes
             FROM lessons WHERE id = ?",
            [lesson_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "seriesId": r.get::<_, Option<String>>(1)?,
                    "teacherId": r.get::<_, String>(2)?,
                    "subjectId": r.get::<_, String>(3)?,
                    "startAt": r.get::<_, String>(4)?,
                    "durationMinutes": r.get::<_, i64>(5)?,
                    "priceRub": r.get::<_, i64>(6)?,
                    "isFree": r.get::<_, i64>(7)? != 0,
                    "status": r.get::<_, String>(8)?,
                    "cancelledBy": r.get::<_, Option<String>>(9)?,
                    "cancellationReason": r.get::<_, Option<String>>(10)?,
                    "notes": r.get::<_, String>(11)?,
                    "meetingUrl": r.get::<_, Option<String>>(12)?,
                    "reminderMinutes": r.get::<_, Option<i64>>(13)?,
                }))
            },
        )
        .optional()
        .map_err(|e| e.to_string())?;
    let Some(mut lesson) = row else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT student_id, price_rub, attendance, rating, payment_status,
                    payment_type, used_subscription
             FROM lesson_students WHERE lesson_id = ? ORDER BY student_id",
        )
        .map_err(|e| e.to_string())?;
    let participants = stmt
        .query_map([lesson_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "priceRub": r.get::<_, i64>(1)?,
                "attendance": r.get::<_, String>(2)?,
                "rating": r.get::<_, Option<i64>>(3)?,
                "paymentStatus": r.get::<_, String>(4)?,
                "paymentType": r.get::<_, String>(5)?,
                "usedSubscription": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| e.to_string())?;
    lesson["participants"] = JsonValue::Array(participants);
    Ok(Some(lesson))
}

fn insert_lesson(
    tx: &Transaction<'_>,
    lesson_id: &str,
    series_id: Option<&str>,
    teacher_id: &str,
    subject_id: &str,
    start_at: &str,
    duration_minutes: i64,
    price_rub: i64,
    is_free: bool,
    notes: &str,
    meeting_url: Option<&str>,
    reminder_minutes: Option<i64>,
    ts: &str,
) -> Result<(), String> {
    tx.execute(
        "INSERT INTO lessons(
            id, series_id, teacher_id, subject_id, start_at, duration_minutes,
            price_rub, is_free, status, notes, meeting_url, reminder_minutes,
            created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'planned', ?, ?, ?, ?, ?)",
        params![
            lesson_id,
            series_id,
            teacher_id,
            subject_id,
            start_at,
            duration_minutes,
            price_rub,
            is_free as i64,
            notes,
            meeting_url,
            reminder_minutes,
            ts,
            ts
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn insert_participant(
    tx: &Transaction<'_>,
    lesson_id: &str,
    student_id: &str,
    price_rub: i64,
    is_free: bool,
) -> Result<(), String> {
    let payment_type = if is_free {
        PAYMENT_TYPE_FREE
    } else {
        PAYMENT_TYPE_FIXED
    };
    tx.execute(
        "INSERT INTO lesson_students(
            id, lesson_id, student_id, price_rub, attendance, payment_status,
            payment_type, used_subscription
         ) VALUES(?, ?, ?, ?, 'unknown', 'unpaid', ?, 0)",
        params![
            Uuid::new_v4().to_string(),
            lesson_id,
            student_id,
            price_rub,
            payment_type
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

struct PriceSpec {
    price_rub: i64,
    is_free: bool,
}

fn parse_price(req: &Request) -> Result<PriceSpec, String> {
    let is_free = parse_bool(req.params.get("isFree"), false).map_err(|m| format!("isFree {}", m))?;
    if is_free {
        return Ok(PriceSpec {
            price_rub: 0,
            is_free: true,
        });
    }
    let price = req
        .params
        .get("priceRub")
        .and_then(|v| v.as_i64())
        .filter(|p| *p >= 0)
        .ok_or("priceRub must be a non-negative integer (or pass isFree)")?;
    Ok(PriceSpec {
        price_rub: price,
        is_free: false,
    })
}

fn handle_lessons_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_at_raw = match required_str(req, "startAt") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(anchor) = parse_datetime(&start_at_raw) else {
        return err(&req.id, "bad_params", "startAt must be YYYY-MM-DDTHH:MM:SS", None);
    };
    let duration_minutes = match req.params.get("durationMinutes").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        Some(_) => return err(&req.id, "bad_params", "durationMinutes must be positive", None),
        None => return err(&req.id, "bad_params", "missing durationMinutes", None),
    };
    let price = match parse_price(req) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let participants = match parse_participants(req.params.get("participants"), "participants") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let notes = match parse_opt_string(req.params.get("notes")) {
        Ok(v) => v.unwrap_or_default(),
        Err(m) => return err(&req.id, "bad_params", format!("notes {}", m), None),
    };
    let meeting_url = match parse_opt_string(req.params.get("meetingUrl")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("meetingUrl {}", m), None),
    };
    let reminder_minutes = match parse_opt_i64(req.params.get("reminderMinutes")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("reminderMinutes {}", m), None),
    };
    let recurrence = match req.params.get("recurrence") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match parse_recurrence(v) {
            Ok(r) => Some(r),
            Err(m) => return err(&req.id, "bad_params", m, None),
        },
    };

    if let Err(e) = ensure_teacher(conn, &teacher_id) {
        return err(&req.id, "db_insert_failed", e, None);
    }
    match subject_exists(conn, &teacher_id, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    }
    let student_ids: Vec<String> = participants.iter().map(|p| p.student_id.clone()).collect();
    if let Err(resp) = ensure_students_linked(conn, req, &teacher_id, &student_ids) {
        return resp;
    }

    // Bounds are validated (and the whole series expanded) before the first
    // write, so bad input can never leave a partial series behind.
    let occurrences = match &recurrence {
        Some(rec) => match expand_occurrences(anchor, rec) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", m, None),
        },
        None => vec![anchor],
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let ts = now_stamp();

    let series_id = if let Some(rec) = &recurrence {
        let series_id = Uuid::new_v4().to_string();
        let (day_of_week, time_of_day) = template_slot(anchor);
        if let Err(e) = tx.execute(
            "INSERT INTO lesson_series(
                id, teacher_id, subject_id, frequency, day_of_week, time_of_day,
                duration_minutes, price_rub, is_free, end_date, max_occurrences,
                meeting_url, created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                series_id,
                teacher_id,
                subject_id,
                rec.frequency.as_str(),
                day_of_week,
                time_of_day,
                duration_minutes,
                price.price_rub,
                price.is_free as i64,
                rec.end_date.map(|d| d.format(DATE_FMT).to_string()),
                rec.max_occurrences,
                meeting_url.as_deref(),
                ts,
                ts
            ],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        for p in &participants {
            if let Err(e) = tx.execute(
                "INSERT INTO lesson_series_students(series_id, student_id, price_rub) VALUES(?, ?, ?)",
                params![series_id, p.student_id, p.price_rub],
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
        Some(series_id)
    } else {
        None
    };

    let mut created: Vec<JsonValue> = Vec::with_capacity(occurrences.len());
    for occ in &occurrences {
        let lesson_id = Uuid::new_v4().to_string();
        let start_s = format_datetime(*occ);
        if let Err(e) = insert_lesson(
            &tx,
            &lesson_id,
            series_id.as_deref(),
            &teacher_id,
            &subject_id,
            &start_s,
            duration_minutes,
            price.price_rub,
            price.is_free,
            &notes,
            meeting_url.as_deref(),
            reminder_minutes,
            &ts,
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e, None);
        }
        for p in &participants {
            let row_price = p.price_rub.unwrap_or(price.price_rub);
            if let Err(e) = insert_participant(&tx, &lesson_id, &p.student_id, row_price, price.is_free)
            {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e, None);
            }
        }
        created.push(json!({ "lessonId": lesson_id, "startAt": start_s }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match series_id {
        Some(series_id) => ok(
            &req.id,
            json!({
                "seriesId": series_id,
                "occurrenceCount": created.len(),
                "occurrences": created
            }),
        ),
        None => {
            let lesson_id = created[0]
                .get("lessonId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            match lesson_json(conn, &lesson_id) {
                Ok(Some(lesson)) => ok(&req.id, json!({ "lesson": lesson })),
                Ok(None) => err(&req.id, "db_query_failed", "created lesson vanished", None),
                Err(e) => err(&req.id, "db_query_failed", e, None),
            }
        }
    }
}

fn handle_lessons_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match lesson_json(conn, &lesson_id) {
        Ok(Some(lesson)) => ok(&req.id, json!({ "lesson": lesson })),
        Ok(None) => err(&req.id, "not_found", "lesson not found", None),
        Err(e) => err(&req.id, "db_query_failed", e, None),
    }
}

fn handle_lessons_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let from = match parse_opt_string(req.params.get("from")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("from {}", m), None),
    };
    let to = match parse_opt_string(req.params.get("to")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("to {}", m), None),
    };

    let mut sql = String::from(
        "SELECT id, series_id, subject_id, start_at, duration_minutes, price_rub, is_free, status
         FROM lessons WHERE teacher_id = ?",
    );
    let mut binds: Vec<String> = vec![teacher_id];
    if let Some(from) = from {
        sql.push_str(" AND start_at >= ?");
        binds.push(from);
    }
    if let Some(to) = to {
        sql.push_str(" AND start_at <= ?");
        binds.push(to);
    }
    sql.push_str(" ORDER BY start_at");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let lessons = match stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "seriesId": r.get::<_, Option<String>>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "startAt": r.get::<_, String>(3)?,
                "durationMinutes": r.get::<_, i64>(4)?,
                "priceRub": r.get::<_, i64>(5)?,
                "isFree": r.get::<_, i64>(6)? != 0,
                "status": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "lessons": lessons }))
}

#[derive(Debug, Default, Clone)]
struct TemplateChanges {
    subject_id: Option<String>,
    duration_minutes: Option<i64>,
    price_rub: Option<i64>,
    is_free: Option<bool>,
    meeting_url: Option<Option<String>>,
    add_participants: Vec<ParticipantSpec>,
    remove_student_ids: Vec<String>,
}

impl TemplateChanges {
    fn any(&self) -> bool {
        self.subject_id.is_some()
            || self.duration_minutes.is_some()
            || self.price_rub.is_some()
            || self.is_free.is_some()
            || self.meeting_url.is_some()
            || !self.add_participants.is_empty()
            || !self.remove_student_ids.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
struct InstanceChanges {
    start_at: Option<String>,
    notes: Option<String>,
    reminder_minutes: Option<Option<i64>>,
    status: Option<String>,
    cancelled_by: Option<String>,
    cancellation_reason: Option<String>,
}

impl InstanceChanges {
    fn any(&self) -> bool {
        self.start_at.is_some()
            || self.notes.is_some()
            || self.reminder_minutes.is_some()
            || self.status.is_some()
    }
}

fn parse_changes(changes: &JsonValue) -> Result<(TemplateChanges, InstanceChanges), String> {
    let obj = changes.as_object().ok_or("changes must be an object")?;
    let mut template = TemplateChanges::default();
    let mut instance = InstanceChanges::default();

    for (key, value) in obj {
        match key.as_str() {
            "subjectId" => {
                template.subject_id = Some(
                    value
                        .as_str()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .ok_or("subjectId must be a string")?,
                );
            }
            "durationMinutes" => {
                template.duration_minutes = Some(
                    value
                        .as_i64()
                        .filter(|v| *v > 0)
                        .ok_or("durationMinutes must be positive")?,
                );
            }
            "priceRub" => {
                template.price_rub = Some(
                    value
                        .as_i64()
                        .filter(|v| *v >= 0)
                        .ok_or("priceRub must be a non-negative integer")?,
                );
            }
            "isFree" => {
                template.is_free = Some(value.as_bool().ok_or("isFree must be boolean")?);
            }
            "meetingUrl" => {
                template.meeting_url =
                    Some(parse_opt_string(Some(value)).map_err(|m| format!("meetingUrl {}", m))?);
            }
            "addParticipants" => {
                template.add_participants = parse_participants(Some(value), "addParticipants")?;
            }
            "removeStudentIds" => {
                let arr = value
                    .as_array()
                    .ok_or("removeStudentIds must be an array of strings")?;
                for v in arr {
                    let id = v
                        .as_str()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .ok_or("removeStudentIds must be an array of strings")?;
                    if !template.remove_student_ids.contains(&id) {
                        template.remove_student_ids.push(id);
                    }
                }
            }
            "startAt" => {
                let raw = value.as_str().ok_or("startAt must be a string")?;
                if parse_datetime(raw).is_none() {
                    return Err("startAt must be YYYY-MM-DDTHH:MM:SS".to_string());
                }
                instance.start_at = Some(raw.trim().to_string());
            }
            "notes" => {
                instance.notes = Some(value.as_str().ok_or("notes must be a string")?.to_string());
            }
            "reminderMinutes" => {
                instance.reminder_minutes =
                    Some(parse_opt_i64(Some(value)).map_err(|m| format!("reminderMinutes {}", m))?);
            }
            "status" => {
                let status = value.as_str().ok_or("status must be a string")?;
                if status != STATUS_PLANNED && status != STATUS_CANCELLED {
                    return Err(
                        "status can only change to planned or cancelled here; completion sets done"
                            .to_string(),
                    );
                }
                instance.status = Some(status.to_string());
            }
            "cancelledBy" => {
                let actor = value.as_str().ok_or("cancelledBy must be a string")?;
                if actor != CANCELLED_BY_TEACHER && actor != CANCELLED_BY_STUDENT {
                    return Err("cancelledBy must be teacher or student".to_string());
                }
                instance.cancelled_by = Some(actor.to_string());
            }
            "cancellationReason" => {
                instance.cancellation_reason = Some(
                    value
                        .as_str()
                        .ok_or("cancellationReason must be a string")?
                        .to_string(),
                );
            }
            "recurrence" => {} // handled by the caller
            other => return Err(format!("unknown change field: {}", other)),
        }
    }

    if instance.status.as_deref() == Some(STATUS_CANCELLED) && instance.cancelled_by.is_none() {
        return Err("cancelling needs cancelledBy".to_string());
    }
    Ok((template, instance))
}

/// Applies template fields to one lesson row; participant rows whose price
/// matched the old lesson default follow the new default, diverged per-student
/// prices stay put.
fn apply_template_to_lesson(
    tx: &Transaction<'_>,
    lesson_id: &str,
    old_price: i64,
    old_is_free: bool,
    template: &TemplateChanges,
    ts: &str,
) -> Result<(), String> {
    if let Some(subject_id) = &template.subject_id {
        tx.execute(
            "UPDATE lessons SET subject_id = ?, updated_at = ? WHERE id = ?",
            params![subject_id, ts, lesson_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(duration) = template.duration_minutes {
        tx.execute(
            "UPDATE lessons SET duration_minutes = ?, updated_at = ? WHERE id = ?",
            params![duration, ts, lesson_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(meeting_url) = &template.meeting_url {
        tx.execute(
            "UPDATE lessons SET meeting_url = ?, updated_at = ? WHERE id = ?",
            params![meeting_url.as_deref(), ts, lesson_id],
        )
        .map_err(|e| e.to_string())?;
    }
    let new_free = template.is_free;
    let new_price = match (new_free, template.price_rub) {
        (Some(true), _) => Some(0),
        (_, Some(p)) => Some(p),
        _ => None,
    };
    if new_free.is_some() || new_price.is_some() {
        let price = new_price.unwrap_or(old_price);
        let free = new_free.unwrap_or(old_is_free);
        tx.execute(
            "UPDATE lessons SET price_rub = ?, is_free = ?, updated_at = ? WHERE id = ?",
            params![price, free as i64, ts, lesson_id],
        )
        .map_err(|e| e.to_string())?;
        tx.execute(
            "UPDATE lesson_students SET price_rub = ? WHERE lesson_id = ? AND price_rub = ?",
            params![price, lesson_id, old_price],
        )
        .map_err(|e| e.to_string())?;
        if free {
            tx.execute(
                "UPDATE lesson_students SET payment_type = 'free', price_rub = 0 WHERE lesson_id = ?",
                params![lesson_id],
            )
            .map_err(|e| e.to_string())?;
        }
    }
    for p in &template.add_participants {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM lesson_students WHERE lesson_id = ? AND student_id = ?",
                params![lesson_id, p.student_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        if exists.is_some() {
            continue;
        }
        let (lesson_price, lesson_free): (i64, i64) = tx
            .query_row(
                "SELECT price_rub, is_free FROM lessons WHERE id = ?",
                params![lesson_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|e| e.to_string())?;
        insert_participant(
            tx,
            lesson_id,
            &p.student_id,
            p.price_rub.unwrap_or(lesson_price),
            lesson_free != 0,
        )?;
    }
    if !template.remove_student_ids.is_empty() {
        for student_id in &template.remove_student_ids {
            tx.execute(
                "DELETE FROM lesson_students WHERE lesson_id = ? AND student_id = ?",
                params![lesson_id, student_id],
            )
            .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn apply_instance_to_lesson(
    tx: &Transaction<'_>,
    lesson_id: &str,
    instance: &InstanceChanges,
    ts: &str,
) -> Result<(), String> {
    if let Some(start_at) = &instance.start_at {
        tx.execute(
            "UPDATE lessons SET start_at = ?, updated_at = ? WHERE id = ?",
            params![start_at, ts, lesson_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(notes) = &instance.notes {
        tx.execute(
            "UPDATE lessons SET notes = ?, updated_at = ? WHERE id = ?",
            params![notes, ts, lesson_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(reminder) = &instance.reminder_minutes {
        tx.execute(
            "UPDATE lessons SET reminder_minutes = ?, updated_at = ? WHERE id = ?",
            params![reminder, ts, lesson_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(status) = &instance.status {
        if status == STATUS_CANCELLED {
            tx.execute(
                "UPDATE lessons SET status = 'cancelled', cancelled_by = ?, cancellation_reason = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    instance.cancelled_by.as_deref(),
                    instance.cancellation_reason.as_deref(),
                    ts,
                    lesson_id
                ],
            )
            .map_err(|e| e.to_string())?;
        } else {
            tx.execute(
                "UPDATE lessons SET status = 'planned', cancelled_by = NULL, cancellation_reason = NULL, updated_at = ?
                 WHERE id = ?",
                params![ts, lesson_id],
            )
            .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn series_lesson_ids(
    conn: &Connection,
    series_id: &str,
    from_start_at: Option<&str>,
) -> Result<Vec<(String, i64, bool)>, String> {
    let (sql, binds): (&str, Vec<&str>) = match from_start_at {
        Some(from) => (
            "SELECT id, price_rub, is_free FROM lessons WHERE series_id = ? AND start_at >= ? ORDER BY start_at",
            vec![series_id, from],
        ),
        None => (
            "SELECT id, price_rub, is_free FROM lessons WHERE series_id = ? ORDER BY start_at",
            vec![series_id],
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    stmt.query_map(rusqlite::params_from_iter(binds.iter()), |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, i64>(1)?,
            r.get::<_, i64>(2)? != 0,
        ))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| e.to_string())
}

fn update_series_template(
    tx: &Transaction<'_>,
    series_id: &str,
    template: &TemplateChanges,
    ts: &str,
) -> Result<(), String> {
    if let Some(subject_id) = &template.subject_id {
        tx.execute(
            "UPDATE lesson_series SET subject_id = ?, updated_at = ? WHERE id = ?",
            params![subject_id, ts, series_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(duration) = template.duration_minutes {
        tx.execute(
            "UPDATE lesson_series SET duration_minutes = ?, updated_at = ? WHERE id = ?",
            params![duration, ts, series_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(meeting_url) = &template.meeting_url {
        tx.execute(
            "UPDATE lesson_series SET meeting_url = ?, updated_at = ? WHERE id = ?",
            params![meeting_url.as_deref(), ts, series_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(price) = template.price_rub {
        tx.execute(
            "UPDATE lesson_series SET price_rub = ?, updated_at = ? WHERE id = ?",
            params![price, ts, series_id],
        )
        .map_err(|e| e.to_string())?;
    }
    if let Some(free) = template.is_free {
        tx.execute(
            "UPDATE lesson_series SET is_free = ?, updated_at = ? WHERE id = ?",
            params![free as i64, ts, series_id],
        )
        .map_err(|e| e.to_string())?;
        if free {
            tx.execute(
                "UPDATE lesson_series SET price_rub = 0 WHERE id = ?",
                params![series_id],
            )
            .map_err(|e| e.to_string())?;
        }
    }
    for p in &template.add_participants {
        tx.execute(
            "INSERT OR REPLACE INTO lesson_series_students(series_id, student_id, price_rub) VALUES(?, ?, ?)",
            params![series_id, p.student_id, p.price_rub],
        )
        .map_err(|e| e.to_string())?;
    }
    for student_id in &template.remove_student_ids {
        tx.execute(
            "DELETE FROM lesson_series_students WHERE series_id = ? AND student_id = ?",
            params![series_id, student_id],
        )
        .map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Converts a standalone lesson into occurrence #1 of a new series. The
/// lesson keeps its id, start time and already-set fields; later occurrences
/// are materialized from its current values. The converted lesson counts
/// against the occurrence bound.
fn convert_to_series(
    conn: &Connection,
    req: &Request,
    lesson: &LessonRow,
    rec: &Recurrence,
) -> serde_json::Value {
    let Some(anchor) = parse_datetime(&lesson.start_at) else {
        return err(&req.id, "db_query_failed", "lesson start_at is unreadable", None);
    };
    let occurrences = match expand_occurrences(anchor, rec) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let participants = {
        let mut stmt = match conn.prepare(
            "SELECT student_id, price_rub FROM lesson_students WHERE lesson_id = ? ORDER BY student_id",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&lesson.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let ts = now_stamp();
    let series_id = Uuid::new_v4().to_string();
    let (day_of_week, time_of_day) = template_slot(anchor);
    if let Err(e) = tx.execute(
        "INSERT INTO lesson_series(
            id, teacher_id, subject_id, frequency, day_of_week, time_of_day,
            duration_minutes, price_rub, is_free, end_date, max_occurrences,
            meeting_url, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            series_id,
            lesson.teacher_id,
            lesson.subject_id,
            rec.frequency.as_str(),
            day_of_week,
            time_of_day,
            lesson.duration_minutes,
            lesson.price_rub,
            lesson.is_free as i64,
            rec.end_date.map(|d| d.format(DATE_FMT).to_string()),
            rec.max_occurrences,
            lesson.meeting_url.as_deref(),
            ts,
            ts
        ],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    for (student_id, price_rub) in &participants {
        let override_price = if *price_rub == lesson.price_rub {
            None
        } else {
            Some(*price_rub)
        };
        if let Err(e) = tx.execute(
            "INSERT INTO lesson_series_students(series_id, student_id, price_rub) VALUES(?, ?, ?)",
            params![series_id, student_id, override_price],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.execute(
        "UPDATE lessons SET series_id = ?, updated_at = ? WHERE id = ?",
        params![series_id, ts, lesson.id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let mut created: Vec<JsonValue> =
        vec![json!({ "lessonId": lesson.id, "startAt": lesson.start_at })];
    for occ in occurrences.iter().skip(1) {
        let lesson_id = Uuid::new_v4().to_string();
        let start_s = format_datetime(*occ);
        if let Err(e) = insert_lesson(
            &tx,
            &lesson_id,
            Some(&series_id),
            &lesson.teacher_id,
            &lesson.subject_id,
            &start_s,
            lesson.duration_minutes,
            lesson.price_rub,
            lesson.is_free,
            "",
            lesson.meeting_url.as_deref(),
            lesson.reminder_minutes,
            &ts,
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e, None);
        }
        for (student_id, price_rub) in &participants {
            if let Err(e) = insert_participant(&tx, &lesson_id, student_id, *price_rub, lesson.is_free)
            {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e, None);
            }
        }
        created.push(json!({ "lessonId": lesson_id, "startAt": start_s }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "seriesId": series_id,
            "occurrenceCount": created.len(),
            "occurrences": created
        }),
    )
}

fn handle_lessons_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(changes) = req.params.get("changes") else {
        return err(&req.id, "bad_params", "missing changes", None);
    };
    let scope = match Scope::parse(req.params.get("scope")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let lesson = match load_lesson(conn, &lesson_id) {
        Ok(Some(l)) => l,
        Ok(None) => return err(&req.id, "not_found", "lesson not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    };

    let (template, instance) = match parse_changes(changes) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    // Attaching a recurrence to a standalone lesson is a conversion, not an
    // in-place update.
    if let Some(rec_raw) = changes.get("recurrence").filter(|v| !v.is_null()) {
        if lesson.series_id.is_none() {
            let rec = match parse_recurrence(rec_raw) {
                Ok(r) => r,
                Err(m) => return err(&req.id, "bad_params", m, None),
            };
            if template.any() || instance.any() {
                return err(
                    &req.id,
                    "bad_params",
                    "recurrence cannot be combined with other changes",
                    None,
                );
            }
            return convert_to_series(conn, req, &lesson, &rec);
        }
        return err(&req.id, "conflict", "lesson already belongs to a series", None);
    }

    if !template.any() && !instance.any() {
        return err(&req.id, "bad_params", "changes is empty", None);
    }
    if scope != Scope::This && lesson.series_id.is_none() {
        return err(&req.id, "bad_params", "scope requires a series lesson", None);
    }

    // All checks run before the first write.
    if let Some(subject_id) = &template.subject_id {
        match subject_exists(conn, &lesson.teacher_id, subject_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "subject not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e, None),
        }
    }
    if !template.add_participants.is_empty() {
        let ids: Vec<String> = template
            .add_participants
            .iter()
            .map(|p| p.student_id.clone())
            .collect();
        if let Err(resp) = ensure_students_linked(conn, req, &lesson.teacher_id, &ids) {
            return resp;
        }
        if scope == Scope::This {
            for p in &template.add_participants {
                let on_lesson = conn
                    .query_row(
                        "SELECT 1 FROM lesson_students WHERE lesson_id = ? AND student_id = ?",
                        params![lesson.id, p.student_id],
                        |r| r.get::<_, i64>(0),
                    )
                    .optional();
                match on_lesson {
                    Ok(Some(_)) => {
                        return err(
                            &req.id,
                            "conflict",
                            format!("student {} is already on this lesson", p.student_id),
                            None,
                        )
                    }
                    Ok(None) => {}
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let ts = now_stamp();

    let apply_result = (|| -> Result<(), String> {
        match scope {
            Scope::This => {
                apply_template_to_lesson(
                    &tx,
                    &lesson.id,
                    lesson.price_rub,
                    lesson.is_free,
                    &template,
                    &ts,
                )?;
            }
            Scope::Future | Scope::All => {
                if template.any() {
                    if let Some(series_id) = lesson.series_id.as_deref() {
                        update_series_template(&tx, series_id, &template, &ts)?;
                        let from = match scope {
                            Scope::Future => Some(lesson.start_at.as_str()),
                            _ => None,
                        };
                        for (occ_id, occ_price, occ_free) in series_lesson_ids(&tx, series_id, from)? {
                            apply_template_to_lesson(&tx, &occ_id, occ_price, occ_free, &template, &ts)?;
                        }
                    }
                }
            }
        }
        // Instance fields never bulk-propagate.
        apply_instance_to_lesson(&tx, &lesson.id, &instance, &ts)
    })();
    if let Err(e) = apply_result {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e, None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match lesson_json(conn, &lesson.id) {
        Ok(Some(updated)) => ok(&req.id, json!({ "lesson": updated })),
        Ok(None) => err(&req.id, "db_query_failed", "updated lesson vanished", None),
        Err(e) => err(&req.id, "db_query_failed", e, None),
    }
}

fn delete_lessons(tx: &Transaction<'_>, lesson_ids: &[String]) -> Result<usize, String> {
    for lesson_id in lesson_ids {
        tx.execute(
            "DELETE FROM reminder_queue WHERE lesson_id = ?",
            params![lesson_id],
        )
        .map_err(|e| e.to_string())?;
        tx.execute(
            "DELETE FROM lesson_students WHERE lesson_id = ?",
            params![lesson_id],
        )
        .map_err(|e| e.to_string())?;
        tx.execute("DELETE FROM lessons WHERE id = ?", params![lesson_id])
            .map_err(|e| e.to_string())?;
    }
    Ok(lesson_ids.len())
}

fn handle_lessons_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match Scope::parse(req.params.get("scope")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let lesson = match load_lesson(conn, &lesson_id) {
        Ok(Some(l)) => l,
        Ok(None) => return err(&req.id, "not_found", "lesson not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    };
    if scope != Scope::This && lesson.series_id.is_none() {
        return err(&req.id, "bad_params", "scope requires a series lesson", None);
    }

    let targets: Vec<String> = match (scope, lesson.series_id.as_deref()) {
        (Scope::This, _) | (_, None) => vec![lesson.id.clone()],
        (Scope::Future, Some(series_id)) => {
            match series_lesson_ids(conn, series_id, Some(lesson.start_at.as_str())) {
                Ok(v) => v.into_iter().map(|(id, _, _)| id).collect(),
                Err(e) => return err(&req.id, "db_query_failed", e, None),
            }
        }
        (Scope::All, Some(series_id)) => match series_lesson_ids(conn, series_id, None) {
            Ok(v) => v.into_iter().map(|(id, _, _)| id).collect(),
            Err(e) => return err(&req.id, "db_query_failed", e, None),
        },
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let deleted = match delete_lessons(&tx, &targets) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e, None);
        }
    };
    if scope == Scope::All {
        if let Some(series_id) = lesson.series_id.as_deref() {
            let cascade = tx
                .execute(
                    "DELETE FROM lesson_series_students WHERE series_id = ?",
                    params![series_id],
                )
                .and_then(|_| {
                    tx.execute("DELETE FROM lesson_series WHERE id = ?", params![series_id])
                });
            if let Err(e) = cascade {
                let _ = tx.rollback();
                return err(&req.id, "db_delete_failed", e.to_string(), None);
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "deletedLessons": deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lessons.create" => Some(handle_lessons_create(state, req)),
        "lessons.open" => Some(handle_lessons_open(state, req)),
        "lessons.list" => Some(handle_lessons_list(state, req)),
        "lessons.update" => Some(handle_lessons_update(state, req)),
        "lessons.delete" => Some(handle_lessons_delete(state, req)),
        _ => None,
    }
}
