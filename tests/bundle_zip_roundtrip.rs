use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::ZipArchive;

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

fn department_names(result: &serde_json::Value) -> Vec<String> {
    result
        .get("departments")
        .and_then(|v| v.as_array())
        .expect("departments")
        .iter()
        .map(|d| {
            d.get("name")
                .and_then(|v| v.as_str())
                .expect("name")
                .to_string()
        })
        .collect()
}

#[test]
fn bundle_export_import_restores_snapshot() {
    let workspace = temp_dir("campusd-bundle");
    let bundle_path = workspace.join("snapshot.campusbackup.zip");
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
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "departments.create",
        json!({ "name": "Original" }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "bundle.export",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("campus-workspace-v1")
    );
    let sha = exported
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .expect("dbSha256");
    assert_eq!(sha.len(), 64);

    // The archive carries a manifest naming the format and the db digest.
    let file = std::fs::File::open(&bundle_path).expect("open bundle");
    let mut archive = ZipArchive::new(file).expect("zip archive");
    let mut manifest_text = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest_text)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest_text).expect("manifest json");
    assert_eq!(
        manifest.get("format").and_then(|v| v.as_str()),
        Some("campus-workspace-v1")
    );
    assert_eq!(manifest.get("dbSha256").and_then(|v| v.as_str()), Some(sha));
    assert!(archive.by_name("db/campus.sqlite3").is_ok());

    // Diverge from the snapshot, then restore it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "departments.create",
        json!({ "name": "Added After Export" }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "bundle.import",
        json!({ "inPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        imported
            .get("bundleFormatDetected")
            .and_then(|v| v.as_str()),
        Some("campus-workspace-v1")
    );

    // Import clears the session; log back in against the restored staff table.
    let stale = request(&mut stdin, &mut reader, "7", "departments.list", json!({}));
    assert_eq!(
        stale
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_logged_in")
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.login",
        json!({ "username": "admin", "password": "admin" }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "9", "departments.list", json!({}));
    let names = department_names(&listed);
    assert_eq!(names, vec!["Original".to_string()]);

    drop(stdin);
    let _ = child.wait();
}
