use crate::attendance::{self, PersonKind};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::attendance::day_roll_up;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Upcoming {
    id: String,
    title: String,
    date: String,
    time: Option<String>,
    class_name: Option<String>,
}

fn count(conn: &Connection, table: &'static str) -> Result<i64, HandlerErr> {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    Ok(conn.query_row(&sql, [], |r| r.get(0))?)
}

fn upcoming(
    conn: &Connection,
    table: &'static str,
    from: &str,
    until: &str,
) -> Result<Vec<Upcoming>, HandlerErr> {
    let sql = format!(
        "SELECT x.id, x.title, x.date, x.time, c.name
         FROM {} x
         LEFT JOIN classes c ON c.id = x.class_id
         WHERE x.date >= ?1 AND x.date < ?2
         ORDER BY x.date, x.time, x.title",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((from, until), |r| {
            Ok(Upcoming {
                id: r.get(0)?,
                title: r.get(1)?,
                date: r.get(2)?,
                time: r.get(3)?,
                class_name: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Deserialize)]
struct StatsParams {
    date: Option<String>,
}

fn admin_stats(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: StatsParams = params::parse(params)?;
    let date = params::optional_date_param("date", p.date.as_deref())?
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let from = attendance::format_date(date);
    let until = attendance::format_date(attendance::shift_day(
        date,
        i64::from(ctx.config.stats.upcoming_days),
    ));

    let (pending_count, pending_amount): (i64, f64) = ctx.conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(amount), 0.0) FROM payments WHERE status = 'pending'",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let mut stmt = ctx.conn.prepare(
        "SELECT id, name, salary FROM teachers WHERE payment_status = 'pending' ORDER BY name",
    )?;
    let teachers_unpaid = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "salary": r.get::<_, Option<f64>>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "date": from,
        "counts": {
            "classes": count(ctx.conn, "classes")?,
            "students": count(ctx.conn, "students")?,
            "teachers": count(ctx.conn, "teachers")?,
            "subjects": count(ctx.conn, "subjects")?,
        },
        "studentAttendance": day_roll_up(ctx.conn, PersonKind::Student, date)?,
        "teacherAttendance": day_roll_up(ctx.conn, PersonKind::Teacher, date)?,
        "upcomingExams": upcoming(ctx.conn, "exams", &from, &until)?,
        "upcomingEvents": upcoming(ctx.conn, "events", &from, &until)?,
        "pendingPayments": {
            "count": pending_count,
            "amount": attendance::round_2(pending_amount),
        },
        "teachersUnpaid": teachers_unpaid,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admin.stats" => Some(respond(state, req, admin_stats)),
        _ => None,
    }
}
