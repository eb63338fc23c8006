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

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v[key].as_str().unwrap_or_else(|| panic!("missing {}", key)).to_string()
}

#[test]
fn marks_cover_the_exam_roster_and_validate_scores() {
    let workspace = temp_dir("schoold-marks");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = str_field(
        &request_ok(&mut stdin, &mut reader, "2", "classes.create", json!({ "name": "Grade 9" })),
        "classId",
    );
    let hana = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "students.create",
            json!({ "classId": class_id, "name": "Hana", "rollNumber": "1" }),
        ),
        "studentId",
    );
    let ivan = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "4",
            "students.create",
            json!({ "classId": class_id, "name": "Ivan", "rollNumber": "2" }),
        ),
        "studentId",
    );
    let exam_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "5",
            "exams.create",
            json!({
                "title": "Unit test",
                "classId": class_id,
                "date": "2024-04-15",
                "totalMarks": 40,
                "assignType": "class"
            }),
        ),
        "examId",
    );

    let blank = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "marks.list",
        json!({ "examId": exam_id }),
    );
    let rows = blank["marks"].as_array().expect("marks");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["score"].is_null()));

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "marks.save",
        json!({ "examId": exam_id, "entries": [] }),
    );
    assert_eq!(empty["warning"], json!("no data to save"));

    let too_high = request(
        &mut stdin,
        &mut reader,
        "8",
        "marks.save",
        json!({ "examId": exam_id, "entries": [{ "studentId": hana, "score": 41 }] }),
    );
    assert_eq!(too_high["error"]["code"], json!("bad_params"));

    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "marks.save",
        json!({
            "examId": exam_id,
            "entries": [
                { "studentId": hana, "score": 30, "remarks": "good" },
                { "studentId": ivan, "score": 10 }
            ]
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "marks.save",
        json!({ "examId": exam_id, "entries": [{ "studentId": ivan, "score": 20 }] }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "marks.list",
        json!({ "examId": exam_id }),
    );
    let scores: Vec<(String, f64)> = listed["marks"]
        .as_array()
        .expect("marks")
        .iter()
        .map(|r| {
            (
                r["studentName"].as_str().expect("name").to_string(),
                r["score"].as_f64().expect("score"),
            )
        })
        .collect();
    assert_eq!(
        scores,
        vec![("Hana".to_string(), 30.0), ("Ivan".to_string(), 20.0)]
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "marks.forStudent",
        json!({ "studentId": hana }),
    );
    assert_eq!(report["marks"][0]["percent"], json!(75.0));
    assert_eq!(report["averagePercent"], json!(75.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn payments_lifecycle_and_pending_totals() {
    let workspace = temp_dir("schoold-payments");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = str_field(
        &request_ok(&mut stdin, &mut reader, "2", "students.create", json!({ "name": "Jun" })),
        "studentId",
    );

    let march = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "payments.create",
            json!({ "studentId": student, "amount": 150.5, "month": "2024-03" }),
        ),
        "paymentId",
    );
    let april = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "4",
            "payments.create",
            json!({ "studentId": student, "amount": 150.5, "month": "2024-04" }),
        ),
        "paymentId",
    );
    let bad_amount = request(
        &mut stdin,
        &mut reader,
        "5",
        "payments.create",
        json!({ "studentId": student, "amount": 0, "month": "2024-05" }),
    );
    assert_eq!(bad_amount["error"]["code"], json!("bad_params"));
    let bad_month = request(
        &mut stdin,
        &mut reader,
        "6",
        "payments.create",
        json!({ "studentId": student, "amount": 10, "month": "May" }),
    );
    assert_eq!(bad_month["error"]["code"], json!("bad_params"));

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "admin.stats",
        json!({ "date": "2024-04-01" }),
    );
    assert_eq!(stats["pendingPayments"], json!({ "count": 2, "amount": 301.0 }));

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "payments.markPaid",
        json!({ "paymentId": march, "paidOn": "2024-03-28" }),
    );
    assert_eq!(paid["paidOn"], json!("2024-03-28"));

    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "payments.list",
        json!({ "status": "pending" }),
    );
    let pending_ids: Vec<&str> = pending["payments"]
        .as_array()
        .expect("payments")
        .iter()
        .filter_map(|p| p["id"].as_str())
        .collect();
    assert_eq!(pending_ids, vec![april.as_str()]);
    assert_eq!(pending["outstanding"], json!(150.5));

    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "payments.delete",
        json!({ "paymentId": april }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "11",
        "payments.markPaid",
        json!({ "paymentId": april }),
    );
    assert_eq!(gone["error"]["code"], json!("not_found"));

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "payments.list",
        json!({ "studentId": student }),
    );
    assert_eq!(all["payments"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(all["payments"][0]["status"], json!("paid"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn register_and_profile_never_expose_the_password() {
    let workspace = temp_dir("schoold-accounts");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = str_field(
        &request_ok(&mut stdin, &mut reader, "2", "students.create", json!({ "name": "Kai" })),
        "studentId",
    );

    let user_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "register",
            json!({
                "email": "Kai.Parent@Example.org",
                "name": "Kai's parent",
                "role": "parent",
                "password": "long enough",
                "linkedId": student
            }),
        ),
        "userId",
    );

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "4",
        "register",
        json!({
            "email": "kai.parent@example.org",
            "name": "Someone else",
            "role": "admin",
            "password": "long enough"
        }),
    );
    assert_eq!(duplicate["error"]["code"], json!("conflict"));

    let short = request(
        &mut stdin,
        &mut reader,
        "5",
        "register",
        json!({ "email": "x@example.org", "name": "X", "role": "admin", "password": "short" }),
    );
    assert_eq!(short["error"]["code"], json!("bad_params"));

    let dangling = request(
        &mut stdin,
        &mut reader,
        "6",
        "register",
        json!({
            "email": "t@example.org",
            "name": "T",
            "role": "teacher",
            "password": "long enough",
            "linkedId": "no-such-teacher"
        }),
    );
    assert_eq!(dangling["error"]["code"], json!("not_found"));

    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "profile.get",
        json!({ "id": user_id }),
    );
    let user = &profile["user"];
    assert_eq!(user["email"], json!("kai.parent@example.org"));
    assert_eq!(user["role"], json!("parent"));
    assert_eq!(user["linkedId"], json!(student));
    let text = user.to_string();
    assert!(!text.contains("password"), "{}", text);
    assert!(!text.contains("Hash"), "{}", text);

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "profile.update",
        json!({ "id": user_id, "patch": { "phone": "555-0100", "password": "another long one" } }),
    );
    assert_eq!(updated["user"]["phone"], json!("555-0100"));
    assert_eq!(updated["user"]["name"], json!("Kai's parent"));

    let bad_update = request(
        &mut stdin,
        &mut reader,
        "9",
        "profile.update",
        json!({ "id": user_id, "patch": { "name": "  " } }),
    );
    assert_eq!(bad_update["error"]["code"], json!("bad_params"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "10",
        "profile.get",
        json!({ "id": "nobody" }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_salary_patch_keeps_or_clears() {
    let workspace = temp_dir("schoold-teacher-salary");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "2",
            "teachers.create",
            json!({ "name": "Ines", "salary": 900.0 }),
        ),
        "teacherId",
    );

    // Omitting salary leaves it in place.
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.update",
        json!({ "teacherId": teacher_id, "patch": { "phone": "555-0101" } }),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.get",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(got["teacher"]["salary"], json!(900.0));

    let negative = request(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.update",
        json!({ "teacherId": teacher_id, "patch": { "salary": -1.0 } }),
    );
    assert_eq!(negative["error"]["code"], json!("bad_params"));

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "teachers.update",
        json!({ "teacherId": teacher_id, "patch": { "salary": null } }),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "teachers.get",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(got["teacher"]["salary"], json!(null));
    assert_eq!(got["teacher"]["phone"], json!("555-0101"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
