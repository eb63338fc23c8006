use crate::attendance::{self, AttendanceStatus, DayRecord, PersonKind, RollUp};
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::students::{get_student, list_students_for_class};
use crate::ipc::handlers::teachers::list_teachers;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RosterEntry {
    id: String,
    name: String,
    roll_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkEntry {
    person_id: String,
    status: AttendanceStatus,
    notes: Option<String>,
}

/// Records for one day, oldest write first so later writes win the merge.
fn load_day_records(
    conn: &Connection,
    kind: PersonKind,
    class_id: Option<&str>,
    subject_id: &str,
    date: NaiveDate,
) -> Result<Vec<DayRecord>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT person_id, status, notes
         FROM attendance_records
         WHERE person_kind = ?1
           AND date = ?2
           AND subject_id = ?3
           AND (?4 IS NULL OR class_id = ?4)
         ORDER BY updated_at",
    )?;
    let rows = stmt
        .query_map(
            (kind.as_str(), attendance::format_date(date), subject_id, class_id),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter_map(|(person_id, status, notes)| {
            let status = status.parse::<AttendanceStatus>().ok()?;
            Some(DayRecord {
                person_id,
                status,
                notes,
            })
        })
        .collect())
}

/// Identifies one attendance sheet: who is marked, for which class and
/// subject, on which day. Teachers have no class and an empty subject.
struct SheetKey<'a> {
    kind: PersonKind,
    class_id: Option<&'a str>,
    subject_id: &'a str,
    date: NaiveDate,
}

fn open_sheet(
    ctx: &Ctx<'_>,
    key: &SheetKey<'_>,
    roster: Vec<RosterEntry>,
) -> Result<serde_json::Value, HandlerErr> {
    let SheetKey {
        kind,
        class_id,
        subject_id,
        date,
    } = *key;
    let ids: Vec<&str> = roster.iter().map(|r| r.id.as_str()).collect();
    let today = load_day_records(ctx.conn, kind, class_id, subject_id, date)?;
    let previous = if today.is_empty() && ctx.config.attendance.fallback_to_previous_day {
        load_day_records(
            ctx.conn,
            kind,
            class_id,
            subject_id,
            attendance::shift_day(date, -1),
        )?
    } else {
        Vec::new()
    };
    let sheet = attendance::resolve_day(
        &ids,
        &today,
        &previous,
        ctx.config.attendance.fallback_to_previous_day,
        ctx.config.attendance.default_status,
    );
    let roll_up = attendance::roll_up(sheet.entries.iter().map(|e| e.status));
    let people_key = match kind {
        PersonKind::Student => "students",
        PersonKind::Teacher => "teachers",
    };

    let mut out = json!({
        "date": attendance::format_date(date),
        "prevDate": attendance::format_date(attendance::shift_day(date, -1)),
        "nextDate": attendance::format_date(attendance::shift_day(date, 1)),
        "source": sheet.source,
        "entries": sheet.entries,
        "rollUp": roll_up,
    });
    out[people_key] = json!(roster);
    Ok(out)
}

fn save_sheet(
    conn: &Connection,
    key: &SheetKey<'_>,
    marked_by: Option<String>,
    entries: Vec<MarkEntry>,
    roster_ids: &HashSet<String>,
) -> Result<serde_json::Value, HandlerErr> {
    let SheetKey {
        kind,
        class_id,
        subject_id,
        date,
    } = *key;
    if entries.is_empty() {
        return Ok(json!({ "saved": 0, "warning": "no data to save" }));
    }

    let unknown: Vec<&str> = entries
        .iter()
        .map(|e| e.person_id.as_str())
        .filter(|id| !roster_ids.contains(*id))
        .collect();
    if !unknown.is_empty() {
        return Err(HandlerErr::bad_params(format!(
            "{} ids not on the roster",
            kind.as_str()
        ))
        .with_details(json!({ "unknownIds": unknown })));
    }

    let date_key = attendance::format_date(date);
    let now = db::now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for entry in &entries {
        tx.execute(
            "INSERT INTO attendance_records(
                id, person_kind, person_id, date, class_id, subject_id, status, notes, marked_by, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(person_kind, person_id, date, subject_id) DO UPDATE SET
               class_id = excluded.class_id,
               status = excluded.status,
               notes = excluded.notes,
               marked_by = excluded.marked_by,
               updated_at = excluded.updated_at",
            (
                params::new_id(),
                kind.as_str(),
                &entry.person_id,
                &date_key,
                class_id,
                subject_id,
                entry.status.as_str(),
                params::optional_text(entry.notes.clone()),
                &marked_by,
                &now,
            ),
        )
        .map_err(HandlerErr::write("db_update_failed", "attendance_records"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(
        kind = kind.as_str(),
        date = %date_key,
        count = entries.len(),
        "attendance saved"
    );
    Ok(json!({ "saved": entries.len(), "date": date_key }))
}

fn subject_key(conn: &Connection, subject_id: Option<String>) -> Result<String, HandlerErr> {
    match params::optional_text(subject_id) {
        Some(sid) => {
            params::ensure_exists(conn, "subjects", "subject", &sid)?;
            Ok(sid)
        }
        None => Ok(String::new()),
    }
}

fn student_roster(conn: &Connection, class_id: &str) -> Result<Vec<RosterEntry>, HandlerErr> {
    params::ensure_exists(conn, "classes", "class", class_id)?;
    Ok(list_students_for_class(conn, class_id, false)?
        .into_iter()
        .map(|s| RosterEntry {
            id: s.id,
            name: s.name,
            roll_number: s.roll_number,
        })
        .collect())
}

fn teacher_roster(conn: &Connection) -> Result<Vec<RosterEntry>, HandlerErr> {
    Ok(list_teachers(conn)?
        .into_iter()
        .map(|t| RosterEntry {
            id: t.id,
            name: t.name,
            roll_number: None,
        })
        .collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentsOpenParams {
    class_id: String,
    date: String,
    subject_id: Option<String>,
}

fn students_open(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentsOpenParams = params::parse(params)?;
    let date = params::date_param("date", &p.date)?;
    let roster = student_roster(ctx.conn, &p.class_id)?;
    let subject = subject_key(ctx.conn, p.subject_id)?;
    let key = SheetKey {
        kind: PersonKind::Student,
        class_id: Some(&p.class_id),
        subject_id: &subject,
        date,
    };
    open_sheet(ctx, &key, roster)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentsSaveParams {
    class_id: String,
    date: String,
    subject_id: Option<String>,
    marked_by: Option<String>,
    #[serde(default)]
    entries: Vec<MarkEntry>,
}

fn students_save(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentsSaveParams = params::parse(params)?;
    let date = params::date_param("date", &p.date)?;
    let roster: HashSet<String> = student_roster(ctx.conn, &p.class_id)?
        .into_iter()
        .map(|r| r.id)
        .collect();
    let subject = subject_key(ctx.conn, p.subject_id)?;
    let key = SheetKey {
        kind: PersonKind::Student,
        class_id: Some(&p.class_id),
        subject_id: &subject,
        date,
    };
    save_sheet(
        ctx.conn,
        &key,
        params::optional_text(p.marked_by),
        p.entries,
        &roster,
    )
}

#[derive(Deserialize)]
struct TeachersOpenParams {
    date: String,
}

fn teachers_open(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: TeachersOpenParams = params::parse(params)?;
    let date = params::date_param("date", &p.date)?;
    let roster = teacher_roster(ctx.conn)?;
    let key = SheetKey {
        kind: PersonKind::Teacher,
        class_id: None,
        subject_id: "",
        date,
    };
    open_sheet(ctx, &key, roster)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeachersSaveParams {
    date: String,
    marked_by: Option<String>,
    #[serde(default)]
    entries: Vec<MarkEntry>,
}

fn teachers_save(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: TeachersSaveParams = params::parse(params)?;
    let date = params::date_param("date", &p.date)?;
    let roster: HashSet<String> = teacher_roster(ctx.conn)?
        .into_iter()
        .map(|r| r.id)
        .collect();
    let key = SheetKey {
        kind: PersonKind::Teacher,
        class_id: None,
        subject_id: "",
        date,
    };
    save_sheet(
        ctx.conn,
        &key,
        params::optional_text(p.marked_by),
        p.entries,
        &roster,
    )
}

#[derive(Deserialize)]
struct CycleParams {
    status: String,
}

// Answers without a workspace.
fn handle_cycle_status(req: &Request) -> serde_json::Value {
    let next = params::parse::<CycleParams>(&req.params).and_then(|p| {
        p.status
            .parse::<AttendanceStatus>()
            .map_err(|e| HandlerErr::bad_params(e.to_string()))
    });
    match next {
        Ok(status) => ok(&req.id, json!({ "status": status.next() })),
        Err(e) => e.response(&req.id),
    }
}

#[derive(Deserialize)]
struct Range {
    from: Option<String>,
    to: Option<String>,
}

impl Range {
    fn keys(&self) -> Result<(Option<String>, Option<String>), HandlerErr> {
        let from = params::optional_date_param("from", self.from.as_deref())?;
        let to = params::optional_date_param("to", self.to.as_deref())?;
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(HandlerErr::bad_params("from must not be after to"));
            }
        }
        Ok((from.map(attendance::format_date), to.map(attendance::format_date)))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRow {
    date: String,
    subject_id: Option<String>,
    subject_name: Option<String>,
    status: AttendanceStatus,
    notes: Option<String>,
}

fn load_student_history(
    conn: &Connection,
    student_id: &str,
    range: &Range,
) -> Result<Vec<HistoryRow>, HandlerErr> {
    let (from, to) = range.keys()?;
    let mut stmt = conn.prepare(
        "SELECT a.date, a.subject_id, s.name, a.status, a.notes
         FROM attendance_records a
         LEFT JOIN subjects s ON s.id = a.subject_id
         WHERE a.person_kind = 'student'
           AND a.person_id = ?1
           AND (?2 IS NULL OR a.date >= ?2)
           AND (?3 IS NULL OR a.date <= ?3)
         ORDER BY a.date, s.name",
    )?;
    let rows = stmt
        .query_map((student_id, from, to), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter_map(|(date, subject_id, subject_name, status, notes)| {
            Some(HistoryRow {
                date,
                subject_id: Some(subject_id).filter(|s| !s.is_empty()),
                subject_name,
                status: status.parse().ok()?,
                notes,
            })
        })
        .collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentRangeParams {
    student_id: String,
    #[serde(flatten)]
    range: Range,
}

fn students_history(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentRangeParams = params::parse(params)?;
    let student = get_student(ctx.conn, &p.student_id)?;
    let records = load_student_history(ctx.conn, &p.student_id, &p.range)?;
    let roll_up = attendance::roll_up(records.iter().map(|r| r.status));
    Ok(json!({
        "student": student,
        "records": records,
        "rollUp": roll_up,
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectRollUp {
    subject_id: Option<String>,
    subject_name: String,
    roll_up: RollUp,
}

fn students_summary(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentRangeParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "students", "student", &p.student_id)?;
    let records = load_student_history(ctx.conn, &p.student_id, &p.range)?;

    let overall = attendance::roll_up(records.iter().map(|r| r.status));
    // Keyed by (name, id) so same-named subjects stay apart but sort by name.
    let mut by_subject: BTreeMap<(String, Option<String>), SubjectRollUp> = BTreeMap::new();
    for r in &records {
        let name = r
            .subject_name
            .clone()
            .unwrap_or_else(|| "General".to_string());
        by_subject
            .entry((name.clone(), r.subject_id.clone()))
            .or_insert_with(|| SubjectRollUp {
                subject_id: r.subject_id.clone(),
                subject_name: name,
                roll_up: RollUp::default(),
            })
            .roll_up
            .add(r.status);
    }

    Ok(json!({
        "studentId": p.student_id,
        "rollUp": overall,
        "attendancePercentage": overall.attendance_rate(),
        "bySubject": by_subject.into_values().collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PersonRollUp {
    person_id: String,
    name: String,
    roll_up: RollUp,
}

/// Per-person roll-ups over recorded days only; unrecorded days do not count
/// as absences.
fn roll_up_people(
    conn: &Connection,
    kind: PersonKind,
    roster: Vec<RosterEntry>,
    class_id: Option<&str>,
    subject_id: Option<&str>,
    range: &Range,
) -> Result<Vec<PersonRollUp>, HandlerErr> {
    let (from, to) = range.keys()?;
    let mut stmt = conn.prepare(
        "SELECT person_id, status
         FROM attendance_records
         WHERE person_kind = ?1
           AND (?2 IS NULL OR class_id = ?2)
           AND (?3 IS NULL OR subject_id = ?3)
           AND (?4 IS NULL OR date >= ?4)
           AND (?5 IS NULL OR date <= ?5)",
    )?;
    let rows = stmt
        .query_map((kind.as_str(), class_id, subject_id, from, to), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_person: HashMap<String, RollUp> = HashMap::new();
    for (person_id, status) in rows {
        if let Ok(status) = status.parse::<AttendanceStatus>() {
            by_person.entry(person_id).or_default().add(status);
        }
    }
    Ok(roster
        .into_iter()
        .map(|r| PersonRollUp {
            roll_up: by_person.remove(&r.id).unwrap_or_default(),
            person_id: r.id,
            name: r.name,
        })
        .collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassSummaryParams {
    class_id: String,
    subject_id: Option<String>,
    #[serde(flatten)]
    range: Range,
}

fn classes_summary(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ClassSummaryParams = params::parse(params)?;
    let roster = student_roster(ctx.conn, &p.class_id)?;
    let subject = params::optional_text(p.subject_id);
    let students = roll_up_people(
        ctx.conn,
        PersonKind::Student,
        roster,
        Some(&p.class_id),
        subject.as_deref(),
        &p.range,
    )?;
    let mut class_total = RollUp::default();
    for s in &students {
        class_total.merge(&s.roll_up);
    }
    Ok(json!({
        "classId": p.class_id,
        "students": students,
        "rollUp": class_total,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherSummaryParams {
    teacher_id: Option<String>,
    #[serde(flatten)]
    range: Range,
}

fn teachers_summary(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: TeacherSummaryParams = params::parse(params)?;
    let mut roster = teacher_roster(ctx.conn)?;
    if let Some(tid) = p.teacher_id.as_deref() {
        roster.retain(|r| r.id == tid);
        if roster.is_empty() {
            return Err(HandlerErr::not_found("teacher"));
        }
    }
    let teachers = roll_up_people(ctx.conn, PersonKind::Teacher, roster, None, None, &p.range)?;
    Ok(json!({ "teachers": teachers }))
}

/// Statuses recorded on one day, used by the admin dashboard.
pub fn day_roll_up(
    conn: &Connection,
    kind: PersonKind,
    date: NaiveDate,
) -> Result<RollUp, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT status FROM attendance_records WHERE person_kind = ? AND date = ?",
    )?;
    let statuses = stmt
        .query_map((kind.as_str(), attendance::format_date(date)), |r| {
            r.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(attendance::roll_up(
        statuses
            .iter()
            .filter_map(|s| s.parse::<AttendanceStatus>().ok()),
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.students.open" => Some(respond(state, req, students_open)),
        "attendance.students.save" => Some(respond(state, req, students_save)),
        "attendance.teachers.open" => Some(respond(state, req, teachers_open)),
        "attendance.teachers.save" => Some(respond(state, req, teachers_save)),
        "attendance.cycleStatus" => Some(handle_cycle_status(req)),
        "attendance.students.history" => Some(respond(state, req, students_history)),
        "attendance.students.summary" => Some(respond(state, req, students_summary)),
        "attendance.classes.summary" => Some(respond(state, req, classes_summary)),
        "attendance.teachers.summary" => Some(respond(state, req, teachers_summary)),
        _ => None,
    }
}
