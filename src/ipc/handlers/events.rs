use crate::attendance;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::assignments::{self, AssignType, ItemKind};
use crate::ipc::handlers::schedule::parse_hhmm;
use crate::ipc::handlers::students::get_student;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: String,
    pub title: String,
    pub date: String,
    pub time: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub class_id: Option<String>,
    pub class_name: Option<String>,
    pub assign_type: AssignType,
    pub selected_students: Vec<String>,
}

fn query_events(
    conn: &Connection,
    where_sql: &str,
    bind: impl rusqlite::Params,
) -> Result<Vec<EventRow>, HandlerErr> {
    let sql = format!(
        "SELECT ev.id, ev.title, ev.date, ev.time, ev.location, ev.description,
                ev.class_id, c.name, ev.assign_type
         FROM events ev
         LEFT JOIN classes c ON c.id = ev.class_id
         {}
         ORDER BY ev.date, ev.time, ev.title",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut events = stmt
        .query_map(bind, |r| {
            let assign_type: String = r.get(8)?;
            Ok(EventRow {
                id: r.get(0)?,
                title: r.get(1)?,
                date: r.get(2)?,
                time: r.get(3)?,
                location: r.get(4)?,
                description: r.get(5)?,
                class_id: r.get(6)?,
                class_name: r.get(7)?,
                assign_type: AssignType::from_db(&assign_type),
                selected_students: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut links = assignments::load_links(conn, ItemKind::Event)?;
    for e in events.iter_mut() {
        e.selected_students = links.remove(&e.id).unwrap_or_default();
    }
    Ok(events)
}

#[derive(Deserialize)]
struct EventsListParams {
    from: Option<String>,
}

fn events_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: EventsListParams = params::parse(params)?;
    let from = params::optional_date_param("from", p.from.as_deref())?.map(attendance::format_date);
    let events = query_events(ctx.conn, "WHERE (?1 IS NULL OR ev.date >= ?1)", [from])?;
    Ok(json!({ "events": events }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventCreateParams {
    title: String,
    date: String,
    time: Option<String>,
    location: Option<String>,
    description: Option<String>,
    class_id: Option<String>,
    #[serde(default = "default_assign_type")]
    assign_type: AssignType,
    #[serde(default)]
    selected_students: Vec<String>,
}

fn default_assign_type() -> AssignType {
    AssignType::All
}

fn events_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: EventCreateParams = params::parse(params)?;
    let title = params::required_text("title", &p.title)?;
    let date = params::date_param("date", &p.date)?;
    let time = match params::optional_text(p.time) {
        Some(t) => Some(parse_hhmm("time", &t)?.format("%H:%M").to_string()),
        None => None,
    };
    let assignment = assignments::validate(
        ctx.conn,
        ItemKind::Event,
        p.assign_type,
        p.class_id,
        &p.selected_students,
    )?;

    let event_id = params::new_id();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO events(id, title, date, time, location, description, class_id, assign_type, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &event_id,
            &title,
            attendance::format_date(date),
            &time,
            params::optional_text(p.location),
            params::optional_text(p.description),
            &assignment.class_id,
            assignment.assign_type.as_str(),
            db::now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::write("db_insert_failed", "events"))?;
    assignments::store_links(&tx, ItemKind::Event, &event_id, &assignment.students)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "eventId": event_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventIdParams {
    event_id: String,
}

fn events_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: EventIdParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "events", "event", &p.event_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    assignments::delete_links(&tx, ItemKind::Event, &p.event_id)?;
    tx.execute("DELETE FROM events WHERE id = ?", [&p.event_id])
        .map_err(HandlerErr::write("db_delete_failed", "events"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentIdParams {
    student_id: String,
}

fn events_for_student(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentIdParams = params::parse(params)?;
    let student = get_student(ctx.conn, &p.student_id)?;
    let where_sql = format!(
        "WHERE {}",
        assignments::visible_to_student_sql(ItemKind::Event, "ev")
    );
    let events = query_events(
        ctx.conn,
        &where_sql,
        (student.id.as_str(), student.class_id.as_deref()),
    )?;
    Ok(json!({ "studentId": student.id, "events": events }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "events.list" => Some(respond(state, req, events_list)),
        "events.create" => Some(respond(state, req, events_create)),
        "events.delete" => Some(respond(state, req, events_delete)),
        "events.forStudent" => Some(respond(state, req, events_for_student)),
        _ => None,
    }
}
