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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn summary_field(dashboard: &serde_json::Value, key: &str) -> f64 {
    dashboard
        .get("summary")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_f64())
        .unwrap_or_else(|| panic!("missing summary.{}", key))
}

#[test]
fn dashboard_counts_paid_partial_unpaid() {
    let workspace = temp_dir("campusd-dashboard");
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
        json!({ "name": "Science" }),
    );
    let department_id = dep
        .get("departmentId")
        .and_then(|v| v.as_str())
        .expect("dep")
        .to_string();
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "departmentId": department_id, "name": "Chem 2" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("class")
        .to_string();

    // Three students: fully paid, partial, unpaid — balances 0/500/1000.
    let mut ids = Vec::new();
    for (i, name) in ["Paid Kumar", "Partial Devi", "Unpaid Joshi"].iter().enumerate() {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            &format!("5-{}", i),
            "students.create",
            json!({ "classId": class_id, "name": name }),
        );
        ids.push(
            student
                .get("studentId")
                .and_then(|v| v.as_str())
                .expect("studentId")
                .to_string(),
        );
    }

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "fees.upsert",
        json!({ "studentId": ids[0], "categories": { "tuition": 2000 } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "fees.recordPayment",
        json!({ "studentId": ids[0], "category": "tuition", "amount": 2000 }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "fees.upsert",
        json!({ "studentId": ids[1], "categories": { "tuition": 1500 } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "fees.recordPayment",
        json!({ "studentId": ids[1], "category": "tuition", "amount": 1000 }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "fees.upsert",
        json!({ "studentId": ids[2], "categories": { "tuition": 1000 } }),
    );

    let dashboard = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "fees.dashboard",
        json!({ "classId": class_id }),
    );
    assert_eq!(summary_field(&dashboard, "paidCount"), 1.0);
    assert_eq!(summary_field(&dashboard, "partialCount"), 1.0);
    assert_eq!(summary_field(&dashboard, "unpaidCount"), 1.0);
    assert_eq!(summary_field(&dashboard, "studentCount"), 3.0);
    assert_eq!(summary_field(&dashboard, "totalAmount"), 4500.0);
    assert_eq!(summary_field(&dashboard, "totalPaid"), 3000.0);
    assert_eq!(summary_field(&dashboard, "totalBalance"), 1500.0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn dean_dashboard_is_scoped_to_their_department() {
    let workspace = temp_dir("campusd-dean-scope");
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

    let mut class_ids = Vec::new();
    let mut dep_ids = Vec::new();
    for (i, dep_name) in ["Science", "Arts"].iter().enumerate() {
        let dep = request_ok(
            &mut stdin,
            &mut reader,
            &format!("3-{}", i),
            "departments.create",
            json!({ "name": dep_name }),
        );
        let dep_id = dep
            .get("departmentId")
            .and_then(|v| v.as_str())
            .expect("dep")
            .to_string();
        let class = request_ok(
            &mut stdin,
            &mut reader,
            &format!("4-{}", i),
            "classes.create",
            json!({ "departmentId": dep_id, "name": format!("{} 1", dep_name) }),
        );
        class_ids.push(
            class
                .get("classId")
                .and_then(|v| v.as_str())
                .expect("class")
                .to_string(),
        );
        dep_ids.push(dep_id);
    }

    for (i, class_id) in class_ids.iter().enumerate() {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            &format!("5-{}", i),
            "students.create",
            json!({ "classId": class_id, "name": format!("Student {}", i) }),
        );
        let student_id = student
            .get("studentId")
            .and_then(|v| v.as_str())
            .expect("studentId")
            .to_string();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("6-{}", i),
            "fees.upsert",
            json!({ "studentId": student_id, "categories": { "tuition": 1000 } }),
        );
    }

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "staff.create",
        json!({
            "username": "dean.science",
            "password": "benzene",
            "name": "Dean of Science",
            "role": "dean",
            "departmentId": dep_ids[0]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.login",
        json!({ "username": "dean.science", "password": "benzene" }),
    );

    // No filter requested: the dean still only sees their own department.
    let dashboard = request_ok(&mut stdin, &mut reader, "9", "fees.dashboard", json!({}));
    assert_eq!(
        dashboard.get("departmentId").and_then(|v| v.as_str()),
        Some(dep_ids[0].as_str())
    );
    assert_eq!(summary_field(&dashboard, "studentCount"), 1.0);
    assert_eq!(summary_field(&dashboard, "totalAmount"), 1000.0);

    drop(stdin);
    let _ = child.wait();
}
