use crate::db;
use crate::recurrence::{format_datetime, parse_datetime};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

const TICK_SECONDS: u64 = 60;
pub const DEFAULT_REMINDER_MINUTES: i64 = 30;
/// Each tick looks this far past "now" so a lesson due on the next minute
/// boundary is not missed by clock skew.
const TOLERANCE_SECONDS: i64 = 30;

/// Background reminder scan with an explicit start/stop lifecycle. Scans run
/// inline on the tick thread, so a slow scan delays the next tick instead of
/// overlapping it.
pub struct ReminderScheduler {
    stop_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ReminderScheduler {
    pub fn start(workspace: PathBuf) -> ReminderScheduler {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(Duration::from_secs(TICK_SECONDS)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let now = chrono::Local::now().naive_local();
            match db::open_scan_db(&workspace) {
                Ok(conn) => {
                    if let Err(e) = run_scan(&conn, now) {
                        eprintln!("tutorbookd: reminder scan failed: {}", e);
                    }
                }
                Err(e) => eprintln!("tutorbookd: reminder scan could not open db: {}", e),
            }
        });
        ReminderScheduler {
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOutcome {
    pub examined: usize,
    pub enqueued: usize,
}

/// One scan pass: every planned, not-yet-reminded lesson whose reminder
/// instant (start minus per-lesson offset) has arrived is enqueued for the
/// delivery collaborator. A lesson that already started is left alone; a
/// failed enqueue is reported and does not abort the rest of the pass.
pub fn run_scan(conn: &Connection, now: NaiveDateTime) -> Result<ScanOutcome, String> {
    let horizon = now + ChronoDuration::seconds(TOLERANCE_SECONDS);
    let now_s = format_datetime(now);

    let mut stmt = conn
        .prepare(
            "SELECT id, start_at, COALESCE(reminder_minutes, ?)
             FROM lessons
             WHERE status = 'planned' AND reminder_sent_at IS NULL AND start_at >= ?
             ORDER BY start_at",
        )
        .map_err(|e| e.to_string())?;
    let candidates = stmt
        .query_map((DEFAULT_REMINDER_MINUTES, &now_s), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| e.to_string())?;

    let mut outcome = ScanOutcome {
        examined: candidates.len(),
        enqueued: 0,
    };
    for (lesson_id, start_at, reminder_minutes) in candidates {
        let Some(start) = parse_datetime(&start_at) else {
            eprintln!("tutorbookd: lesson {} has unreadable start_at", lesson_id);
            continue;
        };
        let remind_at = start - ChronoDuration::minutes(reminder_minutes);
        if remind_at > horizon {
            continue;
        }
        match enqueue_reminder(conn, &lesson_id, &start_at, &now_s) {
            Ok(true) => outcome.enqueued += 1,
            Ok(false) => {}
            Err(e) => eprintln!("tutorbookd: reminder for lesson {} failed: {}", lesson_id, e),
        }
    }
    Ok(outcome)
}

/// Stamps the lesson first; only the scan that wins the stamp inserts the
/// queue row, so concurrent scans cannot double-enqueue.
fn enqueue_reminder(
    conn: &Connection,
    lesson_id: &str,
    start_at: &str,
    now_s: &str,
) -> Result<bool, String> {
    let stamped = conn
        .execute(
            "UPDATE lessons SET reminder_sent_at = ? WHERE id = ? AND reminder_sent_at IS NULL",
            (now_s, lesson_id),
        )
        .map_err(|e| e.to_string())?;
    if stamped == 0 {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO reminder_queue(id, lesson_id, start_at, enqueued_at) VALUES(?, ?, ?, ?)",
        (Uuid::new_v4().to_string(), lesson_id, start_at, now_s),
    )
    .map_err(|e| e.to_string())?;
    Ok(true)
}
