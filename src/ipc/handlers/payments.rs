use crate::attendance;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::teachers::PaymentStatus;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRow {
    id: String,
    student_id: String,
    student_name: Option<String>,
    amount: f64,
    month: String,
    status: PaymentStatus,
    paid_on: Option<String>,
    method: Option<String>,
    notes: Option<String>,
    created_at: String,
}

/// `YYYY-MM`, normalized.
fn parse_month(value: &str) -> Result<String, HandlerErr> {
    let v = value.trim();
    NaiveDate::parse_from_str(&format!("{}-01", v), "%Y-%m-%d")
        .ok()
        .filter(|_| v.len() == 7)
        .map(|d| d.format("%Y-%m").to_string())
        .ok_or_else(|| HandlerErr::bad_params("month must be YYYY-MM"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentsListParams {
    student_id: Option<String>,
    status: Option<PaymentStatus>,
}

fn payments_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: PaymentsListParams = params::parse(params)?;
    let mut stmt = ctx.conn.prepare(
        "SELECT p.id, p.student_id, s.name, p.amount, p.month, p.status, p.paid_on,
                p.method, p.notes, p.created_at
         FROM payments p
         LEFT JOIN students s ON s.id = p.student_id
         WHERE (?1 IS NULL OR p.student_id = ?1) AND (?2 IS NULL OR p.status = ?2)
         ORDER BY p.month DESC, s.name",
    )?;
    let payments = stmt
        .query_map(
            (p.student_id.as_deref(), p.status.map(PaymentStatus::as_str)),
            |r| {
                let status: String = r.get(5)?;
                Ok(PaymentRow {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    student_name: r.get(2)?,
                    amount: r.get(3)?,
                    month: r.get(4)?,
                    status: PaymentStatus::from_db(&status),
                    paid_on: r.get(6)?,
                    method: r.get(7)?,
                    notes: r.get(8)?,
                    created_at: r.get(9)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let outstanding: f64 = payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Pending)
        .map(|p| p.amount)
        .sum();
    Ok(json!({
        "payments": payments,
        "outstanding": attendance::round_2(outstanding),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentCreateParams {
    student_id: String,
    amount: f64,
    month: String,
    status: Option<PaymentStatus>,
    paid_on: Option<String>,
    method: Option<String>,
    notes: Option<String>,
}

fn payments_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: PaymentCreateParams = params::parse(params)?;
    params::ensure_exists(ctx.conn, "students", "student", &p.student_id)?;
    if !p.amount.is_finite() || p.amount <= 0.0 {
        return Err(HandlerErr::bad_params("amount must be positive"));
    }
    let month = parse_month(&p.month)?;
    let status = p.status.unwrap_or(PaymentStatus::Pending);
    let paid_on = match status {
        PaymentStatus::Paid => Some(
            params::optional_date_param("paidOn", p.paid_on.as_deref())?
                .unwrap_or_else(|| chrono::Local::now().date_naive()),
        ),
        PaymentStatus::Pending => None,
    }
    .map(attendance::format_date);

    let payment_id = params::new_id();
    ctx.conn
        .execute(
            "INSERT INTO payments(id, student_id, amount, month, status, paid_on, method, notes, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &payment_id,
                &p.student_id,
                p.amount,
                &month,
                status.as_str(),
                &paid_on,
                params::optional_text(p.method),
                params::optional_text(p.notes),
                db::now_rfc3339(),
            ),
        )
        .map_err(HandlerErr::write("db_insert_failed", "payments"))?;
    Ok(json!({ "paymentId": payment_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkPaidParams {
    payment_id: String,
    paid_on: Option<String>,
}

fn payments_mark_paid(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: MarkPaidParams = params::parse(params)?;
    let paid_on = params::optional_date_param("paidOn", p.paid_on.as_deref())?
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let changed = ctx
        .conn
        .execute(
            "UPDATE payments SET status = 'paid', paid_on = ? WHERE id = ?",
            (attendance::format_date(paid_on), &p.payment_id),
        )
        .map_err(HandlerErr::write("db_update_failed", "payments"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("payment"));
    }
    Ok(json!({ "ok": true, "paidOn": attendance::format_date(paid_on) }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentIdParams {
    payment_id: String,
}

fn payments_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: PaymentIdParams = params::parse(params)?;
    let changed = ctx
        .conn
        .execute("DELETE FROM payments WHERE id = ?", [&p.payment_id])
        .map_err(HandlerErr::write("db_delete_failed", "payments"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("payment"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.list" => Some(respond(state, req, payments_list)),
        "payments.create" => Some(respond(state, req, payments_create)),
        "payments.markPaid" => Some(respond(state, req, payments_mark_paid)),
        "payments.delete" => Some(respond(state, req, payments_delete)),
        _ => None,
    }
}
