use rusqlite::Connection;
use std::path::Path;
use uuid::Uuid;

use crate::ledger::FeeCategory;
use crate::session;

pub const DB_FILE: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(department_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_department ON classes(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            register_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            pass_digest TEXT NOT NULL,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            department_id TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS working_days(
            date TEXT PRIMARY KEY,
            working INTEGER NOT NULL,
            description TEXT
        )",
        [],
    )?;

    // Absence-only: a row exists only for a student marked absent on a
    // working day. Presence is implicit.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            recorded_by TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(class_id, student_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_date ON attendance_records(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student ON attendance_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_submissions(
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            submitted_by TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            PRIMARY KEY(class_id, date),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    // One fee profile per student, keyed by the student id. The five
    // category columns plus aggregates are always kept reconciled.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fees(
            student_id TEXT PRIMARY KEY,
            tuition_total REAL NOT NULL DEFAULT 0,
            tuition_paid REAL NOT NULL DEFAULT 0,
            tuition_balance REAL NOT NULL DEFAULT 0,
            exam_total REAL NOT NULL DEFAULT 0,
            exam_paid REAL NOT NULL DEFAULT 0,
            exam_balance REAL NOT NULL DEFAULT 0,
            transport_total REAL NOT NULL DEFAULT 0,
            transport_paid REAL NOT NULL DEFAULT 0,
            transport_balance REAL NOT NULL DEFAULT 0,
            hostel_total REAL NOT NULL DEFAULT 0,
            hostel_paid REAL NOT NULL DEFAULT 0,
            hostel_balance REAL NOT NULL DEFAULT 0,
            registration_total REAL NOT NULL DEFAULT 0,
            registration_paid REAL NOT NULL DEFAULT 0,
            registration_balance REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            total_paid REAL NOT NULL DEFAULT 0,
            total_balance REAL NOT NULL DEFAULT 0,
            updated_at TEXT,
            recorded_by TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_transactions(
            id TEXT PRIMARY KEY,
            fee_id TEXT NOT NULL,
            fee_type TEXT NOT NULL,
            amount REAL NOT NULL,
            date TEXT NOT NULL,
            recorded_by TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(fee_id) REFERENCES fees(student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_transactions_fee ON fee_transactions(fee_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_transactions_fee_type ON fee_transactions(fee_id, fee_type)",
        [],
    )?;

    // Existing workspaces may predate the submission receipt and calendar
    // description columns. Add if needed.
    ensure_working_days_description(&conn)?;
    ensure_students_updated_at(&conn)?;

    seed_default_admin(&conn)?;

    Ok(conn)
}

fn ensure_working_days_description(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "working_days", "description")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE working_days ADD COLUMN description TEXT", [])?;
    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

/// First-run bootstrap: an empty staff table gets a built-in admin
/// (username "admin", password "admin") so the UI can log in and create
/// real accounts.
fn seed_default_admin(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM staff", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    let id = Uuid::new_v4().to_string();
    let digest = session::password_digest(&id, "admin");
    conn.execute(
        "INSERT INTO staff(id, username, pass_digest, name, role, department_id)
         VALUES(?, ?, ?, ?, ?, NULL)",
        (&id, "admin", &digest, "Administrator", "admin"),
    )?;
    Ok(())
}

/// Column names for a fee category's (total, paid, balance) triple.
pub fn fee_columns(category: FeeCategory) -> (&'static str, &'static str, &'static str) {
    match category {
        FeeCategory::Tuition => ("tuition_total", "tuition_paid", "tuition_balance"),
        FeeCategory::Exam => ("exam_total", "exam_paid", "exam_balance"),
        FeeCategory::Transport => ("transport_total", "transport_paid", "transport_balance"),
        FeeCategory::Hostel => ("hostel_total", "hostel_paid", "hostel_balance"),
        FeeCategory::Registration => (
            "registration_total",
            "registration_paid",
            "registration_balance",
        ),
    }
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
