use crate::attendance;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::assignments::{self, AssignType, ItemKind};
use crate::ipc::handlers::schedule::parse_hhmm;
use crate::ipc::handlers::students::get_student;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRow {
    pub id: String,
    pub title: String,
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    pub class_id: Option<String>,
    pub class_name: Option<String>,
    pub date: String,
    pub time: Option<String>,
    pub duration_minutes: Option<i64>,
    pub total_marks: Option<f64>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub assign_type: AssignType,
    pub selected_students: Vec<String>,
}

const EXAM_SELECT: &str = "SELECT e.id, e.title, e.subject_id, sb.name, e.class_id, c.name,
        e.date, e.time, e.duration_minutes, e.total_marks, e.location, e.description, e.assign_type
   FROM exams e
   LEFT JOIN subjects sb ON sb.id = e.subject_id
   LEFT JOIN classes c ON c.id = e.class_id";

fn map_exam(r: &rusqlite::Row<'_>) -> rusqlite::Result<ExamRow> {
    let assign_type: String = r.get(12)?;
    Ok(ExamRow {
        id: r.get(0)?,
        title: r.get(1)?,
        subject_id: r.get(2)?,
        subject_name: r.get(3)?,
        class_id: r.get(4)?,
        class_name: r.get(5)?,
        date: r.get(6)?,
        time: r.get(7)?,
        duration_minutes: r.get(8)?,
        total_marks: r.get(9)?,
        location: r.get(10)?,
        description: r.get(11)?,
        assign_type: AssignType::from_db(&assign_type),
        selected_students: Vec::new(),
    })
}

fn query_exams(
    conn: &Connection,
    where_sql: &str,
    bind: impl rusqlite::Params,
) -> Result<Vec<ExamRow>, HandlerErr> {
    let sql = format!("{} {} ORDER BY e.date, e.time, e.title", EXAM_SELECT, where_sql);
    let mut stmt = conn.prepare(&sql)?;
    let mut exams = stmt
        .query_map(bind, map_exam)?
        .collect::<Result<Vec<_>, _>>()?;
    let mut links = assignments::load_links(conn, ItemKind::Exam)?;
    for e in exams.iter_mut() {
        e.selected_students = links.remove(&e.id).unwrap_or_default();
    }
    Ok(exams)
}

pub fn get_exam(conn: &Connection, exam_id: &str) -> Result<ExamRow, HandlerErr> {
    let sql = format!("{} WHERE e.id = ?", EXAM_SELECT);
    let mut exam = conn
        .query_row(&sql, [exam_id], map_exam)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("exam"))?;
    exam.selected_students = assignments::load_links(conn, ItemKind::Exam)?
        .remove(exam_id)
        .unwrap_or_default();
    Ok(exam)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExamsListParams {
    class_id: Option<String>,
    from: Option<String>,
}

fn exams_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ExamsListParams = params::parse(params)?;
    let from = params::optional_date_param("from", p.from.as_deref())?.map(attendance::format_date);
    let exams = query_exams(
        ctx.conn,
        "WHERE (?1 IS NULL OR e.class_id = ?1) AND (?2 IS NULL OR e.date >= ?2)",
        (p.class_id.as_deref(), from),
    )?;
    Ok(json!({ "exams": exams }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExamCreateParams {
    title: String,
    subject_id: Option<String>,
    class_id: Option<String>,
    date: String,
    time: Option<String>,
    duration_minutes: Option<i64>,
    total_marks: Option<f64>,
    location: Option<String>,
    description: Option<String>,
    assign_type: AssignType,
    #[serde(default)]
    selected_students: Vec<String>,
}

fn exams_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ExamCreateParams = params::parse(params)?;
    let title = params::required_text("title", &p.title)?;
    let date = params::date_param("date", &p.date)?;
    let time = match params::optional_text(p.time) {
        Some(t) => Some(parse_hhmm("time", &t)?.format("%H:%M").to_string()),
        None => None,
    };
    if matches!(p.duration_minutes, Some(d) if d <= 0) {
        return Err(HandlerErr::bad_params("durationMinutes must be positive"));
    }
    if matches!(p.total_marks, Some(m) if !m.is_finite() || m <= 0.0) {
        return Err(HandlerErr::bad_params("totalMarks must be positive"));
    }
    let subject_id = params::optional_text(p.subject_id);
    if let Some(sid) = subject_id.as_deref() {
        params::ensure_exists(ctx.conn, "subjects", "subject", sid)?;
    }
    let assignment = assignments::validate(
        ctx.conn,
        ItemKind::Exam,
        p.assign_type,
        p.class_id,
        &p.selected_students,
    )?;

    let exam_id = params::new_id();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO exams(id, title, subject_id, class_id, date, time, duration_minutes, total_marks,
                           location, description, assign_type, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &title,
            &subject_id,
            &assignment.class_id,
            attendance::format_date(date),
            &time,
            p.duration_minutes,
            p.total_marks,
            params::optional_text(p.location),
            params::optional_text(p.description),
            assignment.assign_type.as_str(),
            db::now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::write("db_insert_failed", "exams"))?;
    assignments::store_links(&tx, ItemKind::Exam, &exam_id, &assignment.students)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "examId": exam_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExamIdParams {
    exam_id: String,
}

fn exams_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ExamIdParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "exams", "exam", &p.exam_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM marks WHERE exam_id = ?", [&p.exam_id])
        .map_err(HandlerErr::write("db_delete_failed", "marks"))?;
    assignments::delete_links(&tx, ItemKind::Exam, &p.exam_id)?;
    tx.execute("DELETE FROM exams WHERE id = ?", [&p.exam_id])
        .map_err(HandlerErr::write("db_delete_failed", "exams"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

/// Exams a student sits, by class membership, selection, or `all`.
pub fn exams_for_student(conn: &Connection, student_id: &str) -> Result<Vec<ExamRow>, HandlerErr> {
    let student = get_student(conn, student_id)?;
    let where_sql = format!(
        "WHERE {}",
        assignments::visible_to_student_sql(ItemKind::Exam, "e")
    );
    query_exams(
        conn,
        &where_sql,
        (student.id.as_str(), student.class_id.as_deref()),
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentIdParams {
    student_id: String,
}

fn handle_exams_for_student(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentIdParams = params::parse(params)?;
    let exams = exams_for_student(ctx.conn, &p.student_id)?;
    Ok(json!({ "studentId": p.student_id, "exams": exams }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(respond(state, req, exams_list)),
        "exams.create" => Some(respond(state, req, exams_create)),
        "exams.delete" => Some(respond(state, req, exams_delete)),
        "exams.forStudent" => Some(respond(state, req, handle_exams_for_student)),
        _ => None,
    }
}
