use crate::attendance::{self, AttendanceStatus};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub class_id: Option<String>,
    pub class_name: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub roll_number: Option<String>,
    pub parent_name: Option<String>,
    pub parent_contact: Option<String>,
    pub active: bool,
}

const STUDENT_SELECT: &str = "SELECT s.id, s.class_id, c.name, s.name, s.email, s.roll_number,
        s.parent_name, s.parent_contact, s.active
   FROM students s
   LEFT JOIN classes c ON c.id = s.class_id";

fn map_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        class_name: r.get(2)?,
        name: r.get(3)?,
        email: r.get(4)?,
        roll_number: r.get(5)?,
        parent_name: r.get(6)?,
        parent_contact: r.get(7)?,
        active: r.get::<_, i64>(8)? != 0,
    })
}

/// Students of a class ordered for roll call (roll number, then name).
pub fn list_students_for_class(
    conn: &Connection,
    class_id: &str,
    include_inactive: bool,
) -> Result<Vec<StudentRow>, HandlerErr> {
    let sql = format!(
        "{} WHERE s.class_id = ?1 AND (?2 OR s.active = 1)
         ORDER BY s.roll_number IS NULL, s.roll_number, s.name",
        STUDENT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((class_id, include_inactive), map_student)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every active student, grouped by class for printing rosters.
pub fn list_active_students(conn: &Connection) -> Result<Vec<StudentRow>, HandlerErr> {
    let sql = format!(
        "{} WHERE s.active = 1
         ORDER BY c.name IS NULL, c.name, s.roll_number IS NULL, s.roll_number, s.name",
        STUDENT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], map_student)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_student(conn: &Connection, student_id: &str) -> Result<StudentRow, HandlerErr> {
    let sql = format!("{} WHERE s.id = ?", STUDENT_SELECT);
    conn.query_row(&sql, [student_id], map_student)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("student"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentsListParams {
    class_id: Option<String>,
    #[serde(default)]
    include_inactive: bool,
}

fn students_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentsListParams = params::parse(params)?;
    let students = match p.class_id.as_deref() {
        Some(cid) => {
            params::ensure_exists(ctx.conn, "classes", "class", cid)?;
            list_students_for_class(ctx.conn, cid, p.include_inactive)?
        }
        None => {
            let sql = format!(
                "{} WHERE (?1 OR s.active = 1) ORDER BY s.name",
                STUDENT_SELECT
            );
            let mut stmt = ctx.conn.prepare(&sql)?;
            let rows = stmt
                .query_map([p.include_inactive], map_student)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(json!({ "students": students }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentIdParams {
    student_id: String,
}

fn students_get(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentIdParams = params::parse(params)?;
    let student = get_student(ctx.conn, &p.student_id)?;

    let mut stmt = ctx.conn.prepare(
        "SELECT status FROM attendance_records
         WHERE person_kind = 'student' AND person_id = ?",
    )?;
    let statuses = stmt
        .query_map([&p.student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let roll_up = attendance::roll_up(
        statuses
            .iter()
            .filter_map(|s| s.parse::<AttendanceStatus>().ok()),
    );

    Ok(json!({
        "student": student,
        "attendance": roll_up,
        "attendancePercentage": roll_up.attendance_rate(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentCreateParams {
    class_id: Option<String>,
    name: String,
    email: Option<String>,
    roll_number: Option<String>,
    parent_name: Option<String>,
    parent_contact: Option<String>,
    active: Option<bool>,
}

fn students_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentCreateParams = params::parse(params)?;
    let name = params::required_text("name", &p.name)?;
    let class_id = params::optional_text(p.class_id);
    if let Some(cid) = class_id.as_deref() {
        params::ensure_exists(ctx.conn, "classes", "class", cid)?;
    }

    let student_id = params::new_id();
    let now = db::now_rfc3339();
    ctx.conn
        .execute(
            "INSERT INTO students(id, class_id, name, email, roll_number, parent_name, parent_contact,
                                  active, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &student_id,
                &class_id,
                &name,
                params::optional_text(p.email),
                params::optional_text(p.roll_number),
                params::optional_text(p.parent_name),
                params::optional_text(p.parent_contact),
                p.active.unwrap_or(true) as i64,
                &now,
                &now,
            ),
        )
        .map_err(HandlerErr::write("db_insert_failed", "students"))?;
    Ok(json!({ "studentId": student_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentUpdateParams {
    student_id: String,
    patch: StudentPatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentPatch {
    class_id: Option<String>,
    name: Option<String>,
    email: Option<String>,
    roll_number: Option<String>,
    parent_name: Option<String>,
    parent_contact: Option<String>,
    active: Option<bool>,
}

fn students_update(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentUpdateParams = params::parse(params)?;
    let mut student = get_student(ctx.conn, &p.student_id)?;
    let patch = p.patch;

    if let Some(cid) = patch.class_id {
        let cid = params::optional_text(Some(cid));
        if let Some(c) = cid.as_deref() {
            params::ensure_exists(ctx.conn, "classes", "class", c)?;
        }
        student.class_id = cid;
    }
    if let Some(name) = patch.name {
        student.name = params::required_text("name", &name)?;
    }
    if let Some(v) = patch.email {
        student.email = params::optional_text(Some(v));
    }
    if let Some(v) = patch.roll_number {
        student.roll_number = params::optional_text(Some(v));
    }
    if let Some(v) = patch.parent_name {
        student.parent_name = params::optional_text(Some(v));
    }
    if let Some(v) = patch.parent_contact {
        student.parent_contact = params::optional_text(Some(v));
    }
    if let Some(v) = patch.active {
        student.active = v;
    }

    ctx.conn
        .execute(
            "UPDATE students SET class_id = ?, name = ?, email = ?, roll_number = ?,
                    parent_name = ?, parent_contact = ?, active = ?, updated_at = ?
             WHERE id = ?",
            (
                &student.class_id,
                &student.name,
                &student.email,
                &student.roll_number,
                &student.parent_name,
                &student.parent_contact,
                student.active as i64,
                db::now_rfc3339(),
                &student.id,
            ),
        )
        .map_err(HandlerErr::write("db_update_failed", "students"))?;
    Ok(json!({ "ok": true }))
}

fn students_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentIdParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "students", "student", &p.student_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE person_kind = 'student' AND person_id = ?",
        [&p.student_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "attendance_records"))?;
    tx.execute("DELETE FROM marks WHERE student_id = ?", [&p.student_id])
        .map_err(HandlerErr::write("db_delete_failed", "marks"))?;
    tx.execute("DELETE FROM payments WHERE student_id = ?", [&p.student_id])
        .map_err(HandlerErr::write("db_delete_failed", "payments"))?;
    tx.execute(
        "DELETE FROM assignment_students WHERE student_id = ?",
        [&p.student_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "assignment_students"))?;
    tx.execute(
        "UPDATE users SET linked_id = NULL WHERE role IN ('student', 'parent') AND linked_id = ?",
        [&p.student_id],
    )
    .map_err(HandlerErr::write("db_update_failed", "users"))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&p.student_id])
        .map_err(HandlerErr::write("db_delete_failed", "students"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(respond(state, req, students_list)),
        "students.get" => Some(respond(state, req, students_get)),
        "students.create" => Some(respond(state, req, students_create)),
        "students.update" => Some(respond(state, req, students_update)),
        "students.delete" => Some(respond(state, req, students_delete)),
        _ => None,
    }
}
