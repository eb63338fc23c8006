use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Pending,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Pending => "pending",
        }
    }

    pub fn from_db(s: &str) -> Self {
        if s == "paid" {
            Self::Paid
        } else {
            Self::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRow {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub salary: Option<f64>,
    pub payment_status: PaymentStatus,
    pub subject_ids: Vec<String>,
}

fn map_teacher(r: &rusqlite::Row<'_>) -> rusqlite::Result<TeacherRow> {
    let status: String = r.get(5)?;
    Ok(TeacherRow {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        phone: r.get(3)?,
        salary: r.get(4)?,
        payment_status: PaymentStatus::from_db(&status),
        subject_ids: Vec::new(),
    })
}

fn teacher_subject_map(conn: &Connection) -> Result<HashMap<String, Vec<String>>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT ts.teacher_id, ts.subject_id
         FROM teacher_subjects ts
         JOIN subjects s ON s.id = ts.subject_id
         ORDER BY s.name",
    )?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (tid, sid) in rows {
        out.entry(tid).or_default().push(sid);
    }
    Ok(out)
}

pub fn list_teachers(conn: &Connection) -> Result<Vec<TeacherRow>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email, phone, salary, payment_status FROM teachers ORDER BY name",
    )?;
    let mut teachers = stmt
        .query_map([], map_teacher)?
        .collect::<Result<Vec<_>, _>>()?;
    let mut subjects = teacher_subject_map(conn)?;
    for t in teachers.iter_mut() {
        t.subject_ids = subjects.remove(&t.id).unwrap_or_default();
    }
    Ok(teachers)
}

fn get_teacher(conn: &Connection, teacher_id: &str) -> Result<TeacherRow, HandlerErr> {
    let mut teacher = conn
        .query_row(
            "SELECT id, name, email, phone, salary, payment_status FROM teachers WHERE id = ?",
            [teacher_id],
            map_teacher,
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("teacher"))?;
    let mut stmt = conn.prepare(
        "SELECT subject_id FROM teacher_subjects WHERE teacher_id = ? ORDER BY subject_id",
    )?;
    teacher.subject_ids = stmt
        .query_map([teacher_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(teacher)
}

fn validate_subject_ids(conn: &Connection, ids: &[String]) -> Result<Vec<String>, HandlerErr> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    let mut missing: Vec<&str> = Vec::new();
    for id in ids {
        if out.contains(id) {
            continue;
        }
        if params::row_exists(conn, "subjects", id)? {
            out.push(id.clone());
        } else {
            missing.push(id);
        }
    }
    if !missing.is_empty() {
        return Err(HandlerErr::bad_params("unknown subjectIds")
            .with_details(json!({ "subjectIds": missing })));
    }
    Ok(out)
}

fn replace_subjects(
    conn: &Connection,
    teacher_id: &str,
    subject_ids: &[String],
) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM teacher_subjects WHERE teacher_id = ?",
        [teacher_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "teacher_subjects"))?;
    for sid in subject_ids {
        conn.execute(
            "INSERT INTO teacher_subjects(teacher_id, subject_id) VALUES(?, ?)",
            (teacher_id, sid),
        )
        .map_err(HandlerErr::write("db_insert_failed", "teacher_subjects"))?;
    }
    Ok(())
}

fn teachers_list(ctx: &Ctx<'_>, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "teachers": list_teachers(ctx.conn)? }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherIdParams {
    teacher_id: String,
}

fn teachers_get(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: TeacherIdParams = params::parse(params)?;
    Ok(json!({ "teacher": get_teacher(ctx.conn, &p.teacher_id)? }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherCreateParams {
    name: String,
    email: Option<String>,
    phone: Option<String>,
    salary: Option<f64>,
    #[serde(default)]
    subject_ids: Vec<String>,
}

fn check_salary(salary: Option<f64>) -> Result<(), HandlerErr> {
    match salary {
        Some(s) if !s.is_finite() || s < 0.0 => {
            Err(HandlerErr::bad_params("salary must be a non-negative number"))
        }
        _ => Ok(()),
    }
}

fn teachers_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: TeacherCreateParams = params::parse(params)?;
    let name = params::required_text("name", &p.name)?;
    check_salary(p.salary)?;
    let subject_ids = validate_subject_ids(ctx.conn, &p.subject_ids)?;

    let teacher_id = params::new_id();
    let now = db::now_rfc3339();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO teachers(id, name, email, phone, salary, payment_status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'pending', ?, ?)",
        (
            &teacher_id,
            &name,
            params::optional_text(p.email),
            params::optional_text(p.phone),
            p.salary,
            &now,
            &now,
        ),
    )
    .map_err(HandlerErr::write("db_insert_failed", "teachers"))?;
    replace_subjects(&tx, &teacher_id, &subject_ids)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "teacherId": teacher_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherUpdateParams {
    teacher_id: String,
    patch: TeacherPatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherPatch {
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    #[serde(default, deserialize_with = "params::nullable")]
    salary: Option<Option<f64>>,
    subject_ids: Option<Vec<String>>,
}

fn teachers_update(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: TeacherUpdateParams = params::parse(params)?;
    let mut teacher = get_teacher(ctx.conn, &p.teacher_id)?;
    let patch = p.patch;

    if let Some(name) = patch.name {
        teacher.name = params::required_text("name", &name)?;
    }
    if let Some(v) = patch.email {
        teacher.email = params::optional_text(Some(v));
    }
    if let Some(v) = patch.phone {
        teacher.phone = params::optional_text(Some(v));
    }
    if let Some(salary) = patch.salary {
        check_salary(salary)?;
        teacher.salary = salary;
    }
    let subject_ids = match patch.subject_ids {
        Some(ids) => Some(validate_subject_ids(ctx.conn, &ids)?),
        None => None,
    };

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE teachers SET name = ?, email = ?, phone = ?, salary = ?, updated_at = ? WHERE id = ?",
        (
            &teacher.name,
            &teacher.email,
            &teacher.phone,
            teacher.salary,
            db::now_rfc3339(),
            &teacher.id,
        ),
    )
    .map_err(HandlerErr::write("db_update_failed", "teachers"))?;
    if let Some(ids) = subject_ids {
        replace_subjects(&tx, &teacher.id, &ids)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPaymentStatusParams {
    teacher_id: String,
    status: PaymentStatus,
}

fn teachers_set_payment_status(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p: SetPaymentStatusParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "teachers", "teacher", &p.teacher_id)?;
    ctx.conn
        .execute(
            "UPDATE teachers SET payment_status = ?, updated_at = ? WHERE id = ?",
            (p.status.as_str(), db::now_rfc3339(), &p.teacher_id),
        )
        .map_err(HandlerErr::write("db_update_failed", "teachers"))?;
    Ok(json!({ "ok": true, "paymentStatus": p.status }))
}

fn teachers_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: TeacherIdParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "teachers", "teacher", &p.teacher_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE person_kind = 'teacher' AND person_id = ?",
        [&p.teacher_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "attendance_records"))?;
    tx.execute(
        "DELETE FROM teacher_subjects WHERE teacher_id = ?",
        [&p.teacher_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "teacher_subjects"))?;
    tx.execute(
        "UPDATE schedules SET teacher_id = NULL WHERE teacher_id = ?",
        [&p.teacher_id],
    )
    .map_err(HandlerErr::write("db_update_failed", "schedules"))?;
    tx.execute(
        "UPDATE users SET linked_id = NULL WHERE role = 'teacher' AND linked_id = ?",
        [&p.teacher_id],
    )
    .map_err(HandlerErr::write("db_update_failed", "users"))?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&p.teacher_id])
        .map_err(HandlerErr::write("db_delete_failed", "teachers"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(respond(state, req, teachers_list)),
        "teachers.get" => Some(respond(state, req, teachers_get)),
        "teachers.create" => Some(respond(state, req, teachers_create)),
        "teachers.update" => Some(respond(state, req, teachers_update)),
        "teachers.delete" => Some(respond(state, req, teachers_delete)),
        "teachers.setPaymentStatus" => Some(respond(state, req, teachers_set_payment_status)),
        _ => None,
    }
}
