use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRow {
    pub id: String,
    pub name: String,
    pub section: Option<String>,
    pub student_count: i64,
    pub subject_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRow {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub class_id: Option<String>,
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    // The dashboard asks for classes before a workspace exists.
    if state.db.is_none() {
        return ok(&req.id, json!({ "classes": [] }));
    }
    respond(state, req, |ctx, _| {
        // Correlated subqueries avoid double-counting from joins.
        let mut stmt = ctx.conn.prepare(
            "SELECT
               c.id,
               c.name,
               c.section,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM subjects sb WHERE sb.class_id = c.id) AS subject_count
             FROM classes c
             ORDER BY c.name",
        )?;
        let classes = stmt
            .query_map([], |row| {
                Ok(ClassRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    section: row.get(2)?,
                    student_count: row.get(3)?,
                    subject_count: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "classes": classes }))
    })
}

#[derive(Deserialize)]
struct ClassCreateParams {
    name: String,
    section: Option<String>,
}

fn classes_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ClassCreateParams = params::parse(params)?;
    let name = params::required_text("name", &p.name)?;
    let section = params::optional_text(p.section);

    let class_id = params::new_id();
    ctx.conn
        .execute(
            "INSERT INTO classes(id, name, section, created_at) VALUES(?, ?, ?, ?)",
            (&class_id, &name, &section, db::now_rfc3339()),
        )
        .map_err(HandlerErr::write("db_insert_failed", "classes"))?;

    Ok(json!({ "classId": class_id, "name": name, "section": section }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassUpdateParams {
    class_id: String,
    patch: ClassPatch,
}

#[derive(Deserialize)]
struct ClassPatch {
    name: Option<String>,
    section: Option<String>,
}

fn classes_update(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ClassUpdateParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "classes", "class", &p.class_id)?;

    if let Some(name) = p.patch.name {
        let name = params::required_text("name", &name)?;
        ctx.conn
            .execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &p.class_id))
            .map_err(HandlerErr::write("db_update_failed", "classes"))?;
    }
    if let Some(section) = p.patch.section {
        ctx.conn
            .execute(
                "UPDATE classes SET section = ? WHERE id = ?",
                (params::optional_text(Some(section)), &p.class_id),
            )
            .map_err(HandlerErr::write("db_update_failed", "classes"))?;
    }
    Ok(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassIdParams {
    class_id: String,
}

fn classes_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ClassIdParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "classes", "class", &p.class_id)?;

    let student_count: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [&p.class_id],
        |r| r.get(0),
    )?;
    if student_count > 0 {
        return Err(HandlerErr::conflict("class still has students")
            .with_details(json!({ "studentCount": student_count })));
    }

    // Class-targeted items would lose their only audience.
    let (exam_count, event_count): (i64, i64) = ctx.conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM exams WHERE class_id = ?1 AND assign_type = 'class'),
           (SELECT COUNT(*) FROM events WHERE class_id = ?1 AND assign_type = 'class')",
        [&p.class_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if exam_count > 0 || event_count > 0 {
        return Err(HandlerErr::conflict("class still has class-wide exams or events")
            .with_details(json!({ "examCount": exam_count, "eventCount": event_count })));
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicit dependency order; there is no ON DELETE CASCADE.
    tx.execute(
        "DELETE FROM assignment_students
         WHERE item_kind = 'schedule'
           AND item_id IN (SELECT id FROM schedules WHERE class_id = ?)",
        [&p.class_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "assignment_students"))?;
    tx.execute("DELETE FROM schedules WHERE class_id = ?", [&p.class_id])
        .map_err(HandlerErr::write("db_delete_failed", "schedules"))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE class_id = ?",
        [&p.class_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "attendance_records"))?;
    tx.execute(
        "UPDATE exams SET subject_id = NULL
         WHERE subject_id IN (SELECT id FROM subjects WHERE class_id = ?)",
        [&p.class_id],
    )
    .map_err(HandlerErr::write("db_update_failed", "exams"))?;
    tx.execute(
        "UPDATE exams SET class_id = NULL WHERE class_id = ?",
        [&p.class_id],
    )
    .map_err(HandlerErr::write("db_update_failed", "exams"))?;
    tx.execute(
        "UPDATE events SET class_id = NULL WHERE class_id = ?",
        [&p.class_id],
    )
    .map_err(HandlerErr::write("db_update_failed", "events"))?;
    tx.execute(
        "DELETE FROM teacher_subjects
         WHERE subject_id IN (SELECT id FROM subjects WHERE class_id = ?)",
        [&p.class_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "teacher_subjects"))?;
    tx.execute("DELETE FROM subjects WHERE class_id = ?", [&p.class_id])
        .map_err(HandlerErr::write("db_delete_failed", "subjects"))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&p.class_id])
        .map_err(HandlerErr::write("db_delete_failed", "classes"))?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectsListParams {
    class_id: Option<String>,
}

pub fn list_subjects(
    conn: &rusqlite::Connection,
    class_id: Option<&str>,
) -> Result<Vec<SubjectRow>, HandlerErr> {
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(SubjectRow {
            id: r.get(0)?,
            name: r.get(1)?,
            code: r.get(2)?,
            class_id: r.get(3)?,
        })
    };
    let rows = match class_id {
        Some(cid) => {
            let mut stmt = conn.prepare(
                "SELECT id, name, code, class_id FROM subjects
                 WHERE class_id = ? OR class_id IS NULL
                 ORDER BY name",
            )?;
            let rows = stmt
                .query_map([cid], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT id, name, code, class_id FROM subjects ORDER BY name")?;
            let rows = stmt
                .query_map([], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

fn subjects_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: SubjectsListParams = params::parse(params)?;
    let subjects = list_subjects(ctx.conn, p.class_id.as_deref())?;
    Ok(json!({ "subjects": subjects }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectCreateParams {
    name: String,
    code: Option<String>,
    class_id: Option<String>,
}

fn subjects_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: SubjectCreateParams = params::parse(params)?;
    let name = params::required_text("name", &p.name)?;
    let class_id = params::optional_text(p.class_id);
    if let Some(cid) = class_id.as_deref() {
        params::ensure_exists(ctx.conn, "classes", "class", cid)?;
    }

    let subject_id = params::new_id();
    ctx.conn
        .execute(
            "INSERT INTO subjects(id, name, code, class_id) VALUES(?, ?, ?, ?)",
            (&subject_id, &name, params::optional_text(p.code), &class_id),
        )
        .map_err(HandlerErr::write("db_insert_failed", "subjects"))?;
    Ok(json!({ "subjectId": subject_id, "name": name }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectIdParams {
    subject_id: String,
}

fn subjects_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: SubjectIdParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "subjects", "subject", &p.subject_id)?;

    let scheduled: Option<i64> = ctx
        .conn
        .query_row(
            "SELECT 1 FROM schedules WHERE subject_id = ? LIMIT 1",
            [&p.subject_id],
            |r| r.get(0),
        )
        .optional()?;
    if scheduled.is_some() {
        return Err(HandlerErr::conflict("subject is used by a schedule"));
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM teacher_subjects WHERE subject_id = ?",
        [&p.subject_id],
    )
    .map_err(HandlerErr::write("db_delete_failed", "teacher_subjects"))?;
    tx.execute(
        "UPDATE exams SET subject_id = NULL WHERE subject_id = ?",
        [&p.subject_id],
    )
    .map_err(HandlerErr::write("db_update_failed", "exams"))?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&p.subject_id])
        .map_err(HandlerErr::write("db_delete_failed", "subjects"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(respond(state, req, classes_create)),
        "classes.update" => Some(respond(state, req, classes_update)),
        "classes.delete" => Some(respond(state, req, classes_delete)),
        "subjects.list" => Some(respond(state, req, subjects_list)),
        "subjects.create" => Some(respond(state, req, subjects_create)),
        "subjects.delete" => Some(respond(state, req, subjects_delete)),
        _ => None,
    }
}
