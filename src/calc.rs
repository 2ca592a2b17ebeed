use crate::recurrence::{parse_date, DATE_FMT};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

pub const STATUS_PLANNED: &str = "planned";
pub const STATUS_DONE: &str = "done";
pub const STATUS_CANCELLED: &str = "cancelled";

pub const ATTENDANCE_UNKNOWN: &str = "unknown";
pub const ATTENDANCE_ATTENDED: &str = "attended";
pub const ATTENDANCE_MISSED: &str = "missed";

pub const PAYMENT_UNPAID: &str = "unpaid";
pub const PAYMENT_PAID: &str = "paid";

pub const PAYMENT_TYPE_FIXED: &str = "fixed";
pub const PAYMENT_TYPE_FREE: &str = "free";
pub const PAYMENT_TYPE_SUBSCRIPTION: &str = "subscription";

pub const CANCELLED_BY_TEACHER: &str = "teacher";
pub const CANCELLED_BY_STUDENT: &str = "student";
/// Canonical cancellation reason feeding the illness bucket.
pub const REASON_ILLNESS: &str = "illness";

pub const SUBSCRIPTION_LESSONS: &str = "lessons";
pub const SUBSCRIPTION_DATE: &str = "date";

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// One participant row joined with its parent lesson, the unit every
/// aggregation below consumes.
#[derive(Debug, Clone)]
pub struct SettlementRow {
    pub lesson_id: String,
    pub teacher_id: String,
    pub subject_id: String,
    pub start_at: String,
    pub lesson_status: String,
    pub cancelled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    pub attendance: String,
    pub rating: Option<i64>,
    pub payment_status: String,
    pub price_rub: i64,
}

impl SettlementRow {
    fn start_date(&self) -> Option<NaiveDate> {
        parse_date(self.start_at.get(0..10).unwrap_or(""))
    }

    fn is_done(&self) -> bool {
        self.lesson_status == STATUS_DONE
    }

    fn is_attended(&self) -> bool {
        self.is_done() && self.attendance == ATTENDANCE_ATTENDED
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStats {
    pub total_lessons: i64,
    pub attended_count: i64,
    pub missed_count: i64,
    pub attendance_rate: i64,
    pub cancelled_by_teacher: i64,
    pub cancelled_by_student: i64,
    pub cancelled_illness: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtInfo {
    pub has_debt: bool,
    pub unpaid_lessons_count: i64,
    pub unpaid_amount_rub: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub id: String,
    pub total_lessons: i64,
    pub attended_count: i64,
    pub missed_count: i64,
    pub attendance_rate: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakInfo {
    pub current: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStats {
    pub overall: AttendanceStats,
    pub per_subject: Vec<GroupStats>,
    pub per_teacher: Vec<GroupStats>,
    pub streak: StreakInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub key: String,
    pub title: String,
    pub target: i64,
    pub progress: i64,
    pub earned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earned_at: Option<String>,
}

pub fn load_settlement_rows(
    conn: &Connection,
    student_id: &str,
    teacher_id: Option<&str>,
) -> Result<Vec<SettlementRow>, CalcError> {
    let base = "SELECT ls.lesson_id, l.teacher_id, l.subject_id, l.start_at, l.status,
                       l.cancelled_by, l.cancellation_reason,
                       ls.attendance, ls.rating, ls.payment_status, ls.price_rub
                FROM lesson_students ls
                JOIN lessons l ON l.id = ls.lesson_id
                WHERE ls.student_id = ?";
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(SettlementRow {
            lesson_id: r.get(0)?,
            teacher_id: r.get(1)?,
            subject_id: r.get(2)?,
            start_at: r.get(3)?,
            lesson_status: r.get(4)?,
            cancelled_by: r.get(5)?,
            cancellation_reason: r.get(6)?,
            attendance: r.get(7)?,
            rating: r.get(8)?,
            payment_status: r.get(9)?,
            price_rub: r.get(10)?,
        })
    };
    let rows = if let Some(tid) = teacher_id {
        let sql = format!("{} AND l.teacher_id = ? ORDER BY l.start_at", base);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        stmt.query_map([student_id, tid], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
    } else {
        let sql = format!("{} ORDER BY l.start_at", base);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        stmt.query_map([student_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
    };
    Ok(rows)
}

fn rate(attended: i64, total: i64) -> i64 {
    if total == 0 {
        return 0;
    }
    ((attended as f64) / (total as f64) * 100.0).round() as i64
}

pub fn attendance_stats(rows: &[SettlementRow]) -> AttendanceStats {
    let mut total = 0i64;
    let mut attended = 0i64;
    let mut missed = 0i64;
    let mut by_teacher = 0i64;
    let mut by_student = 0i64;
    let mut illness = 0i64;
    for row in rows {
        match row.lesson_status.as_str() {
            STATUS_DONE => {
                total += 1;
                match row.attendance.as_str() {
                    ATTENDANCE_ATTENDED => attended += 1,
                    ATTENDANCE_MISSED => missed += 1,
                    _ => {}
                }
            }
            STATUS_CANCELLED => {
                match row.cancelled_by.as_deref() {
                    Some(CANCELLED_BY_TEACHER) => by_teacher += 1,
                    Some(CANCELLED_BY_STUDENT) => by_student += 1,
                    _ => {}
                }
                if row.cancellation_reason.as_deref() == Some(REASON_ILLNESS) {
                    illness += 1;
                }
            }
            _ => {}
        }
    }
    AttendanceStats {
        total_lessons: total,
        attended_count: attended,
        missed_count: missed,
        attendance_rate: rate(attended, total),
        cancelled_by_teacher: by_teacher,
        cancelled_by_student: by_student,
        cancelled_illness: illness,
    }
}

pub fn debt_info(rows: &[SettlementRow]) -> DebtInfo {
    let mut count = 0i64;
    let mut amount = 0i64;
    for row in rows {
        if row.is_attended() && row.payment_status == PAYMENT_UNPAID {
            count += 1;
            amount += row.price_rub;
        }
    }
    DebtInfo {
        has_debt: count > 0,
        unpaid_lessons_count: count,
        unpaid_amount_rub: amount,
    }
}

fn group_stats<F>(rows: &[SettlementRow], key: F) -> Vec<GroupStats>
where
    F: Fn(&SettlementRow) -> &str,
{
    // (total, attended, missed) per key; BTreeMap keeps the output stable.
    let mut groups: BTreeMap<String, (i64, i64, i64)> = BTreeMap::new();
    for row in rows {
        if !row.is_done() {
            continue;
        }
        let entry = groups.entry(key(row).to_string()).or_insert((0, 0, 0));
        entry.0 += 1;
        match row.attendance.as_str() {
            ATTENDANCE_ATTENDED => entry.1 += 1,
            ATTENDANCE_MISSED => entry.2 += 1,
            _ => {}
        }
    }
    groups
        .into_iter()
        .map(|(id, (total, attended, missed))| GroupStats {
            id,
            total_lessons: total,
            attended_count: attended,
            missed_count: missed,
            attendance_rate: rate(attended, total),
        })
        .collect()
}

pub fn per_subject_stats(rows: &[SettlementRow]) -> Vec<GroupStats> {
    group_stats(rows, |r| r.subject_id.as_str())
}

pub fn per_teacher_stats(rows: &[SettlementRow]) -> Vec<GroupStats> {
    group_stats(rows, |r| r.teacher_id.as_str())
}

/// Distinct calendar dates with an attended lesson, newest first.
fn attended_dates_desc(rows: &[SettlementRow]) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = rows
        .iter()
        .filter(|r| r.is_attended())
        .filter_map(|r| r.start_date())
        .collect();
    dates.sort_unstable();
    dates.dedup();
    dates.reverse();
    dates
}

pub fn streak_info(rows: &[SettlementRow]) -> StreakInfo {
    let dates = attended_dates_desc(rows);
    if dates.is_empty() {
        return StreakInfo { current: 0, max: 0 };
    }
    let mut current = 1i64;
    let mut max = 1i64;
    let mut run = 1i64;
    let mut current_open = true;
    for pair in dates.windows(2) {
        let gap = (pair[0] - pair[1]).num_days();
        if gap <= 7 {
            run += 1;
            if current_open {
                current = run;
            }
        } else {
            current_open = false;
            run = 1;
        }
        max = max.max(run);
    }
    StreakInfo { current, max }
}

const ACH_FIRST_LESSON: &str = "first_lesson";
const ACH_TEN_LESSONS: &str = "ten_lessons";
const ACH_PERFECT_WEEK: &str = "perfect_week";
const ACH_STREAK_FIVE: &str = "streak_5";

fn week_start(date: NaiveDate) -> NaiveDate {
    date - ChronoDuration::days(date.weekday().num_days_from_monday() as i64)
}

/// Best ISO-week bucket: (earliest qualifying week start, best zero-miss
/// bucket size). A bucket qualifies with >= 3 done rows and no misses.
fn perfect_week_scan(rows: &[SettlementRow]) -> (Option<NaiveDate>, i64) {
    let mut buckets: BTreeMap<NaiveDate, (i64, i64)> = BTreeMap::new();
    for row in rows {
        if !row.is_done() {
            continue;
        }
        let Some(date) = row.start_date() else {
            continue;
        };
        let entry = buckets.entry(week_start(date)).or_insert((0, 0));
        entry.0 += 1;
        if row.attendance == ATTENDANCE_MISSED {
            entry.1 += 1;
        }
    }
    let mut earned_week: Option<NaiveDate> = None;
    let mut best_clean = 0i64;
    for (week, (count, missed)) in buckets {
        if missed > 0 {
            continue;
        }
        best_clean = best_clean.max(count);
        if count >= 3 && earned_week.is_none() {
            earned_week = Some(week);
        }
    }
    (earned_week, best_clean)
}

pub fn achievements(rows: &[SettlementRow]) -> Vec<Achievement> {
    let mut attended: Vec<&SettlementRow> = rows.iter().filter(|r| r.is_attended()).collect();
    attended.sort_by(|a, b| a.start_at.cmp(&b.start_at));
    let attended_count = attended.len() as i64;

    let first = Achievement {
        key: ACH_FIRST_LESSON.to_string(),
        title: "First lesson".to_string(),
        target: 1,
        progress: attended_count.min(1),
        earned: attended_count >= 1,
        earned_at: attended.first().map(|r| r.start_at.clone()),
    };

    let ten = Achievement {
        key: ACH_TEN_LESSONS.to_string(),
        title: "Ten lessons".to_string(),
        target: 10,
        progress: attended_count.min(10),
        earned: attended_count >= 10,
        earned_at: attended.get(9).map(|r| r.start_at.clone()),
    };

    let (perfect_week_start, best_clean) = perfect_week_scan(rows);
    let perfect = Achievement {
        key: ACH_PERFECT_WEEK.to_string(),
        title: "Perfect week".to_string(),
        target: 3,
        progress: best_clean.min(3),
        earned: perfect_week_start.is_some(),
        earned_at: perfect_week_start.map(|d| d.format(DATE_FMT).to_string()),
    };

    let streak = streak_info(rows);
    let streak_five = Achievement {
        key: ACH_STREAK_FIVE.to_string(),
        title: "Five-lesson streak".to_string(),
        target: 5,
        progress: streak.current.min(5),
        earned: streak.current >= 5,
        earned_at: if streak.current >= 5 {
            attended.last().map(|r| r.start_at.clone())
        } else {
            None
        },
    };

    vec![first, ten, perfect, streak_five]
}

pub fn subscription_remaining(total_lessons: Option<i64>, used_lessons: i64) -> Option<i64> {
    total_lessons.map(|total| (total - used_lessons).max(0))
}

pub fn subscription_expired(
    kind: &str,
    total_lessons: Option<i64>,
    used_lessons: i64,
    expires_at: Option<NaiveDate>,
    today: NaiveDate,
) -> bool {
    match kind {
        SUBSCRIPTION_LESSONS => subscription_remaining(total_lessons, used_lessons)
            .map(|r| r == 0)
            .unwrap_or(false),
        SUBSCRIPTION_DATE => expires_at.map(|e| today > e).unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(start_at: &str, status: &str, attendance: &str, payment: &str, price: i64) -> SettlementRow {
        SettlementRow {
            lesson_id: format!("l-{}", start_at),
            teacher_id: "t1".to_string(),
            subject_id: "s1".to_string(),
            start_at: start_at.to_string(),
            lesson_status: status.to_string(),
            cancelled_by: None,
            cancellation_reason: None,
            attendance: attendance.to_string(),
            rating: None,
            payment_status: payment.to_string(),
            price_rub: price,
        }
    }

    #[test]
    fn attendance_rate_rounds_to_nearest_integer() {
        let rows = vec![
            row("2026-01-05T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-01-12T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-01-19T10:00:00", STATUS_DONE, ATTENDANCE_MISSED, PAYMENT_UNPAID, 1000),
        ];
        let stats = attendance_stats(&rows);
        assert_eq!(stats.total_lessons, 3);
        assert_eq!(stats.attended_count, 2);
        assert_eq!(stats.missed_count, 1);
        assert_eq!(stats.attendance_rate, 67);
    }

    #[test]
    fn attendance_rate_is_zero_without_data() {
        let stats = attendance_stats(&[]);
        assert_eq!(stats.total_lessons, 0);
        assert_eq!(stats.attendance_rate, 0);
    }

    #[test]
    fn cancelled_rows_feed_buckets_not_totals() {
        let mut cancelled = row("2026-01-05T10:00:00", STATUS_CANCELLED, ATTENDANCE_UNKNOWN, PAYMENT_UNPAID, 1000);
        cancelled.cancelled_by = Some(CANCELLED_BY_STUDENT.to_string());
        cancelled.cancellation_reason = Some(REASON_ILLNESS.to_string());
        let rows = vec![
            cancelled,
            row("2026-01-12T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
        ];
        let stats = attendance_stats(&rows);
        assert_eq!(stats.total_lessons, 1);
        assert_eq!(stats.cancelled_by_student, 1);
        assert_eq!(stats.cancelled_by_teacher, 0);
        assert_eq!(stats.cancelled_illness, 1);
    }

    #[test]
    fn debt_counts_only_attended_unpaid_done_rows() {
        let rows = vec![
            row("2026-01-05T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_UNPAID, 1200),
            row("2026-01-12T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1200),
            // Missed rows never owe money.
            row("2026-01-19T10:00:00", STATUS_DONE, ATTENDANCE_MISSED, PAYMENT_UNPAID, 1200),
            // Planned rows are not settled yet.
            row("2026-01-26T10:00:00", STATUS_PLANNED, ATTENDANCE_ATTENDED, PAYMENT_UNPAID, 1200),
        ];
        let debt = debt_info(&rows);
        assert!(debt.has_debt);
        assert_eq!(debt.unpaid_lessons_count, 1);
        assert_eq!(debt.unpaid_amount_rub, 1200);
    }

    #[test]
    fn debt_is_empty_when_nothing_owed() {
        let debt = debt_info(&[]);
        assert!(!debt.has_debt);
        assert_eq!(debt.unpaid_lessons_count, 0);
        assert_eq!(debt.unpaid_amount_rub, 0);
    }

    #[test]
    fn streak_tolerates_week_long_gaps() {
        let rows = vec![
            row("2026-03-02T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-09T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-16T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            // 9-day gap breaks the run.
            row("2026-03-25T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-30T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
        ];
        let streak = streak_info(&rows);
        assert_eq!(streak.current, 2);
        assert_eq!(streak.max, 3);
    }

    #[test]
    fn streak_counts_distinct_dates_once() {
        let rows = vec![
            row("2026-03-02T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-02T15:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-06T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
        ];
        let streak = streak_info(&rows);
        assert_eq!(streak.current, 2);
        assert_eq!(streak.max, 2);
    }

    #[test]
    fn perfect_week_requires_three_clean_lessons() {
        // Mon/Wed/Fri of one ISO week, all attended.
        let rows = vec![
            row("2026-03-02T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-04T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-06T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
        ];
        let earned = achievements(&rows)
            .into_iter()
            .find(|a| a.key == "perfect_week")
            .expect("achievement");
        assert!(earned.earned);
        assert_eq!(earned.earned_at.as_deref(), Some("2026-03-02"));
        assert_eq!(earned.progress, 3);
    }

    #[test]
    fn perfect_week_denied_by_a_single_miss() {
        let rows = vec![
            row("2026-03-02T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-04T10:00:00", STATUS_DONE, ATTENDANCE_ATTENDED, PAYMENT_PAID, 1000),
            row("2026-03-06T10:00:00", STATUS_DONE, ATTENDANCE_MISSED, PAYMENT_UNPAID, 1000),
        ];
        let earned = achievements(&rows)
            .into_iter()
            .find(|a| a.key == "perfect_week")
            .expect("achievement");
        assert!(!earned.earned);
        assert_eq!(earned.earned_at, None);
    }

    #[test]
    fn ten_lessons_stamps_the_tenth_row() {
        let mut rows = Vec::new();
        for week in 0..11 {
            let day = 5 + week * 7;
            let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
                + ChronoDuration::days(day as i64);
            rows.push(row(
                &format!("{}T10:00:00", start.format(DATE_FMT)),
                STATUS_DONE,
                ATTENDANCE_ATTENDED,
                PAYMENT_PAID,
                1000,
            ));
        }
        let ach = achievements(&rows);
        let ten = ach.iter().find(|a| a.key == "ten_lessons").expect("achievement");
        assert!(ten.earned);
        assert_eq!(ten.progress, 10);
        let expected = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + ChronoDuration::days(5 + 9 * 7);
        assert_eq!(
            ten.earned_at.as_deref(),
            Some(format!("{}T10:00:00", expected.format(DATE_FMT)).as_str())
        );
        let streak_five = ach.iter().find(|a| a.key == "streak_5").expect("achievement");
        assert!(streak_five.earned);
        assert_eq!(streak_five.progress, 5);
    }

    #[test]
    fn subscription_derivations() {
        assert_eq!(subscription_remaining(Some(10), 7), Some(3));
        assert_eq!(subscription_remaining(Some(10), 12), Some(0));
        assert_eq!(subscription_remaining(None, 4), None);

        let today = NaiveDate::from_ymd_opt(2026, 8, 6).unwrap();
        assert!(subscription_expired(SUBSCRIPTION_LESSONS, Some(10), 10, None, today));
        assert!(!subscription_expired(SUBSCRIPTION_LESSONS, Some(10), 7, None, today));
        let past = NaiveDate::from_ymd_opt(2026, 8, 5).unwrap();
        let future = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        assert!(subscription_expired(SUBSCRIPTION_DATE, None, 0, Some(past), today));
        assert!(!subscription_expired(SUBSCRIPTION_DATE, None, 0, Some(future), today));
    }
}
