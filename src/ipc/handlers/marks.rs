use crate::attendance::round_2;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::assignments::AssignType;
use crate::ipc::handlers::exams::{exams_for_student, get_exam, ExamRow};
use crate::ipc::handlers::students::{
    get_student, list_active_students, list_students_for_class, StudentRow,
};
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkRow {
    student_id: String,
    student_name: String,
    roll_number: Option<String>,
    score: Option<f64>,
    remarks: Option<String>,
    percent: Option<f64>,
}

fn percent(score: f64, total_marks: Option<f64>) -> Option<f64> {
    match total_marks {
        Some(t) if t > 0.0 => Some(round_2(100.0 * score / t)),
        _ => None,
    }
}

/// Students who sit `exam`, in roll-call order where a class applies.
fn exam_roster(conn: &Connection, exam: &ExamRow) -> Result<Vec<StudentRow>, HandlerErr> {
    match exam.assign_type {
        AssignType::Class => match exam.class_id.as_deref() {
            Some(cid) => list_students_for_class(conn, cid, false),
            None => Ok(Vec::new()),
        },
        AssignType::Individual => {
            let mut out = Vec::with_capacity(exam.selected_students.len());
            for sid in &exam.selected_students {
                out.push(get_student(conn, sid)?);
            }
            Ok(out)
        }
        AssignType::All => list_active_students(conn),
    }
}

fn load_marks(
    conn: &Connection,
    exam_id: &str,
) -> Result<HashMap<String, (f64, Option<String>)>, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT student_id, score, remarks FROM marks WHERE exam_id = ?")?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                (r.get::<_, f64>(1)?, r.get::<_, Option<String>>(2)?),
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExamIdParams {
    exam_id: String,
}

fn marks_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ExamIdParams = params::parse(params)?;
    let exam = get_exam(ctx.conn, &p.exam_id)?;
    let roster = exam_roster(ctx.conn, &exam)?;
    let mut marks = load_marks(ctx.conn, &exam.id)?;

    let rows: Vec<MarkRow> = roster
        .into_iter()
        .map(|s| {
            let (score, remarks) = match marks.remove(&s.id) {
                Some((score, remarks)) => (Some(score), remarks),
                None => (None, None),
            };
            MarkRow {
                percent: score.and_then(|v| percent(v, exam.total_marks)),
                student_id: s.id,
                student_name: s.name,
                roll_number: s.roll_number,
                score,
                remarks,
            }
        })
        .collect();

    Ok(json!({ "exam": exam, "marks": rows }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkEntry {
    student_id: String,
    score: f64,
    remarks: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarksSaveParams {
    exam_id: String,
    #[serde(default)]
    entries: Vec<MarkEntry>,
}

fn marks_save(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: MarksSaveParams = params::parse(params)?;
    let exam = get_exam(ctx.conn, &p.exam_id)?;
    if p.entries.is_empty() {
        return Ok(json!({ "saved": 0, "warning": "no data to save" }));
    }

    let roster: HashSet<String> = exam_roster(ctx.conn, &exam)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let unknown: Vec<&str> = p
        .entries
        .iter()
        .map(|e| e.student_id.as_str())
        .filter(|id| !roster.contains(*id))
        .collect();
    if !unknown.is_empty() {
        return Err(HandlerErr::bad_params("students do not sit this exam")
            .with_details(json!({ "unknownIds": unknown })));
    }
    for e in &p.entries {
        let over = matches!(exam.total_marks, Some(t) if e.score > t);
        if !e.score.is_finite() || e.score < 0.0 || over {
            return Err(HandlerErr::bad_params("score out of range").with_details(json!({
                "studentId": e.student_id,
                "score": e.score,
                "totalMarks": exam.total_marks,
            })));
        }
    }

    let now = db::now_rfc3339();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for e in &p.entries {
        tx.execute(
            "INSERT INTO marks(id, exam_id, student_id, score, remarks, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(exam_id, student_id) DO UPDATE SET
               score = excluded.score,
               remarks = excluded.remarks,
               updated_at = excluded.updated_at",
            (
                params::new_id(),
                &exam.id,
                &e.student_id,
                e.score,
                params::optional_text(e.remarks.clone()),
                &now,
            ),
        )
        .map_err(HandlerErr::write("db_update_failed", "marks"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(exam = %exam.id, count = p.entries.len(), "marks saved");
    Ok(json!({ "saved": p.entries.len() }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentMark {
    exam_id: String,
    title: String,
    subject_name: Option<String>,
    date: String,
    score: f64,
    total_marks: Option<f64>,
    percent: Option<f64>,
    remarks: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentIdParams {
    student_id: String,
}

fn marks_for_student(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentIdParams = params::parse(params)?;
    let exams = exams_for_student(ctx.conn, &p.student_id)?;

    let mut stmt = ctx
        .conn
        .prepare("SELECT exam_id, score, remarks FROM marks WHERE student_id = ?")?;
    let mut scores: HashMap<String, (f64, Option<String>)> = stmt
        .query_map([&p.student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                (r.get::<_, f64>(1)?, r.get::<_, Option<String>>(2)?),
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;

    let marks: Vec<StudentMark> = exams
        .into_iter()
        .filter_map(|e| {
            let (score, remarks) = scores.remove(&e.id)?;
            Some(StudentMark {
                percent: percent(score, e.total_marks),
                exam_id: e.id,
                title: e.title,
                subject_name: e.subject_name,
                date: e.date,
                score,
                total_marks: e.total_marks,
                remarks,
            })
        })
        .collect();

    let pcts: Vec<f64> = marks.iter().filter_map(|m| m.percent).collect();
    let average_percent = if pcts.is_empty() {
        None
    } else {
        Some(round_2(pcts.iter().sum::<f64>() / pcts.len() as f64))
    };

    Ok(json!({
        "studentId": p.student_id,
        "marks": marks,
        "averagePercent": average_percent,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.list" => Some(respond(state, req, marks_list)),
        "marks.save" => Some(respond(state, req, marks_save)),
        "marks.forStudent" => Some(respond(state, req, marks_for_student)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_needs_positive_total() {
        assert_eq!(percent(45.0, Some(60.0)), Some(75.0));
        assert_eq!(percent(1.0, Some(3.0)), Some(33.33));
        assert_eq!(percent(10.0, None), None);
        assert_eq!(percent(10.0, Some(0.0)), None);
    }
}
