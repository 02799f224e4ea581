use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        id,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
}

#[test]
fn overpayment_is_rejected_and_leaves_no_trace() {
    let workspace = temp_dir("campusd-overpay");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "username": "admin", "password": "admin" }),
    );
    let dep = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "departments.create",
        json!({ "name": "Arts" }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({
            "departmentId": dep.get("departmentId").and_then(|v| v.as_str()).expect("dep"),
            "name": "History 2"
        }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "classId": class.get("classId").and_then(|v| v.as_str()).expect("class"),
            "name": "Noor Khan"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "fees.upsert",
        json!({ "studentId": student_id, "categories": { "hostel": 3000 } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "fees.recordPayment",
        json!({ "studentId": student_id, "category": "hostel", "amount": 2500 }),
    );

    // Balance is 500; paying 501 must fail without touching anything.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "8",
        "fees.recordPayment",
        json!({ "studentId": student_id, "category": "hostel", "amount": 501 }),
    );
    assert_eq!(error_code(&rejected), "overpayment");

    // A payment against a student with no fee profile is not_found.
    let ghost = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({
            "classId": class.get("classId").and_then(|v| v.as_str()).expect("class"),
            "name": "No Profile Yet"
        }),
    );
    let ghost_id = ghost
        .get("result")
        .and_then(|v| v.get("studentId"))
        .and_then(|v| v.as_str())
        .expect("ghost id")
        .to_string();
    let missing = request(
        &mut stdin,
        &mut reader,
        "10",
        "fees.recordPayment",
        json!({ "studentId": ghost_id, "category": "hostel", "amount": 10 }),
    );
    assert_eq!(error_code(&missing), "not_found");

    // Non-positive and unknown-category payments are bad_params.
    let zero = request(
        &mut stdin,
        &mut reader,
        "11",
        "fees.recordPayment",
        json!({ "studentId": student_id, "category": "hostel", "amount": 0 }),
    );
    assert_eq!(error_code(&zero), "bad_params");
    let unknown = request(
        &mut stdin,
        &mut reader,
        "12",
        "fees.recordPayment",
        json!({ "studentId": student_id, "category": "library", "amount": 10 }),
    );
    assert_eq!(error_code(&unknown), "bad_params");

    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "fees.open",
        json!({ "studentId": student_id }),
    );
    let hostel = profile
        .get("profile")
        .and_then(|v| v.get("categories"))
        .and_then(|v| v.get("hostel"))
        .expect("hostel line");
    assert_eq!(hostel.get("paid").and_then(|v| v.as_f64()), Some(2500.0));
    assert_eq!(hostel.get("balance").and_then(|v| v.as_f64()), Some(500.0));

    drop(stdin);
    let _ = child.wait();

    // Exactly one logged transaction: the rejected attempts left no rows.
    let conn = Connection::open(workspace.join("campus.sqlite3")).expect("open db");
    let tx_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM fee_transactions WHERE fee_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .expect("count");
    assert_eq!(tx_count, 1);
}
