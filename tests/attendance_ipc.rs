use pretty_assertions::assert_eq;
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
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
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
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn statuses(sheet: &serde_json::Value) -> Vec<(String, String)> {
    sheet["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .map(|e| {
            (
                e["personId"].as_str().expect("personId").to_string(),
                e["status"].as_str().expect("status").to_string(),
            )
        })
        .collect()
}

#[test]
fn student_sheet_default_recorded_and_previous_day() {
    let workspace = temp_dir("schoold-attendance-flow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 7" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let amir = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "name": "Amir", "rollNumber": "1" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let bea = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "classId": class_id, "name": "Bea", "rollNumber": "2" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    // Nothing recorded yet: everyone gets the default status.
    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.students.open",
        json!({ "classId": class_id, "date": "2024-03-01" }),
    );
    assert_eq!(sheet["source"], json!("default"));
    assert_eq!(sheet["prevDate"], json!("2024-02-29"));
    assert_eq!(sheet["nextDate"], json!("2024-03-02"));
    assert_eq!(
        statuses(&sheet),
        vec![
            (amir.clone(), "absent".to_string()),
            (bea.clone(), "absent".to_string())
        ]
    );
    assert_eq!(sheet["students"].as_array().map(|a| a.len()), Some(2));

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.students.save",
        json!({
            "classId": class_id,
            "date": "2024-03-01",
            "markedBy": "office",
            "entries": [
                { "personId": amir, "status": "present" },
                { "personId": bea, "status": "leave", "notes": "dentist" }
            ]
        }),
    );
    assert_eq!(saved["saved"], json!(2));

    // Re-saving the same day replaces the earlier mark.
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.students.save",
        json!({
            "classId": class_id,
            "date": "2024-03-01",
            "entries": [{ "personId": amir, "status": "absent" }]
        }),
    );
    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.students.open",
        json!({ "classId": class_id, "date": "2024-03-01" }),
    );
    assert_eq!(sheet["source"], json!("recorded"));
    assert_eq!(
        statuses(&sheet),
        vec![
            (amir.clone(), "absent".to_string()),
            (bea.clone(), "leave".to_string())
        ]
    );
    assert_eq!(sheet["rollUp"]["total"], json!(2));
    assert_eq!(sheet["rollUp"]["leave"], json!(1));

    // The next day falls back to the previous day's marks.
    let next = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.students.open",
        json!({ "classId": class_id, "date": "2024-03-02" }),
    );
    assert_eq!(next["source"], json!("previousDay"));
    assert_eq!(statuses(&next), statuses(&sheet));

    // Two days later there is nothing to fall back to.
    let later = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.students.open",
        json!({ "classId": class_id, "date": "2024-03-03" }),
    );
    assert_eq!(later["source"], json!("default"));

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.students.history",
        json!({ "studentId": bea, "from": "2024-03-01", "to": "2024-03-31" }),
    );
    let records = history["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["notes"], json!("dentist"));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.classes.summary",
        json!({ "classId": class_id }),
    );
    assert_eq!(summary["rollUp"]["total"], json!(2));
    assert_eq!(summary["rollUp"]["absent"], json!(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn empty_and_unknown_saves_write_nothing() {
    let workspace = temp_dir("schoold-attendance-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 8" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "name": "Chen" }),
    );

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.students.save",
        json!({ "classId": class_id, "date": "2024-05-10", "entries": [] }),
    );
    assert_eq!(empty["saved"], json!(0));
    assert_eq!(empty["warning"], json!("no data to save"));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.students.save",
        json!({
            "classId": class_id,
            "date": "2024-05-10",
            "entries": [{ "personId": "not-a-student", "status": "present" }]
        }),
    );
    assert_eq!(unknown["ok"], json!(false));
    assert_eq!(unknown["error"]["code"], json!("bad_params"));

    let bad_date = request(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.students.open",
        json!({ "classId": class_id, "date": "10/05/2024" }),
    );
    assert_eq!(bad_date["error"]["code"], json!("bad_params"));

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.students.open",
        json!({ "classId": class_id, "date": "2024-05-10" }),
    );
    assert_eq!(sheet["source"], json!("default"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn status_cycle_has_period_three() {
    let workspace = temp_dir("schoold-attendance-cycle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut status = "absent".to_string();
    let mut seen = Vec::new();
    for i in 0..3 {
        let next = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "attendance.cycleStatus",
            json!({ "status": status }),
        );
        status = next["status"].as_str().expect("status").to_string();
        seen.push(status.clone());
    }
    assert_eq!(seen, vec!["present", "leave", "absent"]);

    let bad = request(
        &mut stdin,
        &mut reader,
        "c-bad",
        "attendance.cycleStatus",
        json!({ "status": "late" }),
    );
    assert_eq!(bad["error"]["code"], json!("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_sheet_feeds_admin_stats() {
    let workspace = temp_dir("schoold-attendance-teachers");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let dana = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "name": "Dana", "salary": 1200.0 }),
    )["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();
    let eli = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "name": "Eli" }),
    )["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.teachers.open",
        json!({ "date": "2024-06-03" }),
    );
    assert_eq!(sheet["teachers"].as_array().map(|a| a.len()), Some(2));

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.teachers.save",
        json!({
            "date": "2024-06-03",
            "entries": [
                { "personId": dana, "status": "present" },
                { "personId": eli, "status": "leave" }
            ]
        }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.teachers.summary",
        json!({ "teacherId": dana }),
    );
    let teachers = summary["teachers"].as_array().expect("teachers");
    assert_eq!(teachers.len(), 1);
    assert_eq!(teachers[0]["rollUp"]["present"], json!(1));

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "admin.stats",
        json!({ "date": "2024-06-03" }),
    );
    assert_eq!(stats["teacherAttendance"]["present"], json!(1));
    assert_eq!(stats["teacherAttendance"]["leave"], json!(1));
    assert_eq!(stats["teacherAttendance"]["presentPct"], json!(50.0));
    assert_eq!(stats["studentAttendance"]["total"], json!(0));
    assert_eq!(stats["counts"]["teachers"], json!(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
