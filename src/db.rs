use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("tutorbook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

/// Second connection for the reminder scan thread. The schema is created by
/// the main connection; this one only needs the pragma.
pub fn open_scan_db(workspace: &Path) -> anyhow::Result<Connection> {
    let db_path = workspace.join("tutorbook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_students(
            teacher_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, student_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_students_student ON teacher_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            UNIQUE(teacher_id, name),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_subjects_teacher_code
         ON subjects(teacher_id, code) WHERE code IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lesson_series(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            frequency TEXT NOT NULL,
            day_of_week INTEGER NOT NULL,
            time_of_day TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            price_rub INTEGER NOT NULL,
            is_free INTEGER NOT NULL DEFAULT 0,
            end_date TEXT,
            max_occurrences INTEGER,
            meeting_url TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lesson_series_teacher ON lesson_series(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            series_id TEXT,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            start_at TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            price_rub INTEGER NOT NULL,
            is_free INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'planned',
            cancelled_by TEXT,
            cancellation_reason TEXT,
            notes TEXT NOT NULL DEFAULT '',
            meeting_url TEXT,
            reminder_minutes INTEGER,
            reminder_sent_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(series_id) REFERENCES lesson_series(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    ensure_lessons_reminder_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_series ON lessons(series_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_teacher_start ON lessons(teacher_id, start_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_status_start ON lessons(status, start_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lesson_students(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            price_rub INTEGER NOT NULL,
            attendance TEXT NOT NULL DEFAULT 'unknown',
            rating INTEGER,
            payment_status TEXT NOT NULL DEFAULT 'unpaid',
            payment_type TEXT NOT NULL DEFAULT 'fixed',
            used_subscription INTEGER NOT NULL DEFAULT 0,
            UNIQUE(lesson_id, student_id),
            FOREIGN KEY(lesson_id) REFERENCES lessons(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lesson_students_lesson ON lesson_students(lesson_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lesson_students_student ON lesson_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lesson_series_students(
            series_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            price_rub INTEGER,
            PRIMARY KEY(series_id, student_id),
            FOREIGN KEY(series_id) REFERENCES lesson_series(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lesson_series_students_student
         ON lesson_series_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subscriptions(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            total_lessons INTEGER,
            used_lessons INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT,
            deleted_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subscriptions_pair ON subscriptions(teacher_id, student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reminder_queue(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL,
            start_at TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            FOREIGN KEY(lesson_id) REFERENCES lessons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reminder_queue_lesson ON reminder_queue(lesson_id)",
        [],
    )?;

    Ok(())
}

fn ensure_lessons_reminder_columns(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before the reminder scan shipped lack these columns.
    if !table_has_column(conn, "lessons", "reminder_minutes")? {
        conn.execute("ALTER TABLE lessons ADD COLUMN reminder_minutes INTEGER", [])?;
    }
    if !table_has_column(conn, "lessons", "reminder_sent_at")? {
        conn.execute("ALTER TABLE lessons ADD COLUMN reminder_sent_at TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
