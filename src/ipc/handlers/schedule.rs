use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::assignments::{self, AssignType, ItemKind};
use crate::ipc::handlers::students::get_student;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Day {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "Monday",
            Self::Tuesday => "Tuesday",
            Self::Wednesday => "Wednesday",
            Self::Thursday => "Thursday",
            Self::Friday => "Friday",
            Self::Saturday => "Saturday",
            Self::Sunday => "Sunday",
        }
    }

    fn from_db(s: &str) -> Option<Self> {
        Some(match s {
            "Monday" => Self::Monday,
            "Tuesday" => Self::Tuesday,
            "Wednesday" => Self::Wednesday,
            "Thursday" => Self::Thursday,
            "Friday" => Self::Friday,
            "Saturday" => Self::Saturday,
            "Sunday" => Self::Sunday,
            _ => return None,
        })
    }
}

pub fn parse_hhmm(field: &str, value: &str) -> Result<NaiveTime, HandlerErr> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be HH:MM", field)))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRow {
    pub id: String,
    pub day: Day,
    pub start_time: String,
    pub end_time: String,
    pub subject_id: Option<String>,
    pub subject: String,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
    pub class_id: String,
    pub class_name: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub assign_type: AssignType,
    pub selected_students: Vec<String>,
}

const SCHEDULE_SELECT: &str = "SELECT sc.id, sc.day, sc.start_time, sc.end_time, sc.subject_id,
        COALESCE(sb.name, sc.subject), sc.teacher_id, t.name, sc.class_id, c.name,
        sc.location, sc.notes, sc.assign_type
   FROM schedules sc
   LEFT JOIN subjects sb ON sb.id = sc.subject_id
   LEFT JOIN teachers t ON t.id = sc.teacher_id
   LEFT JOIN classes c ON c.id = sc.class_id";

fn query_schedules(
    conn: &Connection,
    where_sql: &str,
    bind: impl rusqlite::Params,
) -> Result<Vec<ScheduleRow>, HandlerErr> {
    let sql = format!("{} {}", SCHEDULE_SELECT, where_sql);
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(bind, |r| {
            let day: String = r.get(1)?;
            let assign_type: String = r.get(12)?;
            Ok((
                day,
                ScheduleRow {
                    id: r.get(0)?,
                    day: Day::Monday,
                    start_time: r.get(2)?,
                    end_time: r.get(3)?,
                    subject_id: r.get(4)?,
                    subject: r.get(5)?,
                    teacher_id: r.get(6)?,
                    teacher_name: r.get(7)?,
                    class_id: r.get(8)?,
                    class_name: r.get(9)?,
                    location: r.get(10)?,
                    notes: r.get(11)?,
                    assign_type: AssignType::from_db(&assign_type),
                    selected_students: Vec::new(),
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut links = assignments::load_links(conn, ItemKind::Schedule)?;
    let mut rows: Vec<ScheduleRow> = raw
        .into_iter()
        .filter_map(|(day, mut row)| {
            row.day = Day::from_db(&day)?;
            row.selected_students = links.remove(&row.id).unwrap_or_default();
            Some(row)
        })
        .collect();
    rows.sort_by(|a, b| {
        (a.day, &a.start_time, &a.class_name).cmp(&(b.day, &b.start_time, &b.class_name))
    });
    Ok(rows)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleListParams {
    class_id: Option<String>,
    day: Option<Day>,
}

fn schedule_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ScheduleListParams = params::parse(params)?;
    let schedules = query_schedules(
        ctx.conn,
        "WHERE (?1 IS NULL OR sc.class_id = ?1) AND (?2 IS NULL OR sc.day = ?2)",
        (p.class_id.as_deref(), p.day.map(Day::as_str)),
    )?;
    Ok(json!({ "schedules": schedules }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleCreateParams {
    day: Day,
    start_time: String,
    end_time: String,
    subject_id: Option<String>,
    subject: Option<String>,
    teacher_id: Option<String>,
    class_id: Option<String>,
    location: Option<String>,
    notes: Option<String>,
    #[serde(default = "default_assign_type")]
    assign_type: AssignType,
    #[serde(default)]
    selected_students: Vec<String>,
}

fn default_assign_type() -> AssignType {
    AssignType::Class
}

fn schedule_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ScheduleCreateParams = params::parse(params)?;
    let start = parse_hhmm("startTime", &p.start_time)?;
    let end = parse_hhmm("endTime", &p.end_time)?;
    if start >= end {
        return Err(HandlerErr::bad_params("startTime must be before endTime"));
    }

    // A schedule always belongs to a class, even when only some of its
    // students are assigned.
    let class_id = params::optional_text(p.class_id)
        .ok_or_else(|| HandlerErr::bad_params("missing classId"))?;

    let subject_id = params::optional_text(p.subject_id);
    let subject = match subject_id.as_deref() {
        Some(sid) => ctx
            .conn
            .query_row("SELECT name FROM subjects WHERE id = ?", [sid], |r| {
                r.get::<_, String>(0)
            })
            .optional()?
            .ok_or_else(|| HandlerErr::not_found("subject"))?,
        None => params::required_text("subject", p.subject.as_deref().unwrap_or(""))?,
    };
    let teacher_id = params::optional_text(p.teacher_id);
    if let Some(tid) = teacher_id.as_deref() {
        params::ensure_exists(ctx.conn, "teachers", "teacher", tid)?;
    }

    let assignment = assignments::validate(
        ctx.conn,
        ItemKind::Schedule,
        p.assign_type,
        Some(class_id.clone()),
        &p.selected_students,
    )?;

    let schedule_id = params::new_id();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO schedules(id, day, start_time, end_time, subject_id, subject, teacher_id,
                               class_id, location, notes, assign_type, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &schedule_id,
            p.day.as_str(),
            start.format("%H:%M").to_string(),
            end.format("%H:%M").to_string(),
            &subject_id,
            &subject,
            &teacher_id,
            &class_id,
            params::optional_text(p.location),
            params::optional_text(p.notes),
            assignment.assign_type.as_str(),
            db::now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::write("db_insert_failed", "schedules"))?;
    assignments::store_links(&tx, ItemKind::Schedule, &schedule_id, &assignment.students)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "scheduleId": schedule_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleIdParams {
    schedule_id: String,
}

fn schedule_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ScheduleIdParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "schedules", "schedule", &p.schedule_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    assignments::delete_links(&tx, ItemKind::Schedule, &p.schedule_id)?;
    tx.execute("DELETE FROM schedules WHERE id = ?", [&p.schedule_id])
        .map_err(HandlerErr::write("db_delete_failed", "schedules"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentIdParams {
    student_id: String,
}

fn schedule_for_student(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentIdParams = params::parse(params)?;
    let student = get_student(ctx.conn, &p.student_id)?;
    let where_sql = format!(
        "WHERE {}",
        assignments::visible_to_student_sql(ItemKind::Schedule, "sc")
    );
    let schedules = query_schedules(
        ctx.conn,
        &where_sql,
        (student.id.as_str(), student.class_id.as_deref()),
    )?;
    Ok(json!({ "studentId": student.id, "schedules": schedules }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schedule.list" => Some(respond(state, req, schedule_list)),
        "schedule.create" => Some(respond(state, req, schedule_create)),
        "schedule.delete" => Some(respond(state, req, schedule_delete)),
        "schedule.forStudent" => Some(respond(state, req, schedule_for_student)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhmm_parsing_rejects_free_text() {
        assert!(parse_hhmm("startTime", "09:30").is_ok());
        assert!(parse_hhmm("startTime", " 14:05 ").is_ok());
        assert!(parse_hhmm("startTime", "9am").is_err());
        assert!(parse_hhmm("startTime", "25:00").is_err());
    }

    #[test]
    fn weekdays_sort_monday_first() {
        let mut days = vec![Day::Sunday, Day::Wednesday, Day::Monday];
        days.sort();
        assert_eq!(days, vec![Day::Monday, Day::Wednesday, Day::Sunday]);
        assert_eq!(Day::from_db("Friday"), Some(Day::Friday));
        assert_eq!(Day::from_db("friday"), None);
    }
}
