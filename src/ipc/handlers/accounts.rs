use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Teacher => "teacher",
            Self::Student => "student",
            Self::Parent => "parent",
        }
    }

    fn from_db(s: &str) -> Option<Self> {
        Some(match s {
            "admin" => Self::Admin,
            "teacher" => Self::Teacher,
            "student" => Self::Student,
            "parent" => Self::Parent,
            _ => return None,
        })
    }

    /// Table a `linkedId` must point into, if the role links at all.
    fn linked_table(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Admin => None,
            Self::Teacher => Some(("teachers", "teacher")),
            Self::Student | Self::Parent => Some(("students", "student")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserRow {
    id: String,
    email: String,
    name: String,
    role: Role,
    linked_id: Option<String>,
    phone: Option<String>,
    created_at: String,
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn check_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn normalize_email(value: &str) -> Result<String, HandlerErr> {
    let email = params::required_text("email", value)?.to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(HandlerErr::bad_params("email is not valid")),
    }
}

fn get_user(conn: &Connection, user_id: &str) -> Result<UserRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, email, name, role, linked_id, phone, created_at FROM users WHERE id = ?",
            [user_id],
            |r| {
                Ok((
                    r.get::<_, String>(3)?,
                    UserRow {
                        id: r.get(0)?,
                        email: r.get(1)?,
                        name: r.get(2)?,
                        role: Role::Admin,
                        linked_id: r.get(4)?,
                        phone: r.get(5)?,
                        created_at: r.get(6)?,
                    },
                ))
            },
        )
        .optional()?;
    let (role, mut user) = row.ok_or_else(|| HandlerErr::not_found("user"))?;
    user.role = Role::from_db(&role).ok_or_else(|| {
        HandlerErr::new("db_query_failed", format!("user has unknown role '{}'", role))
    })?;
    Ok(user)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterParams {
    email: String,
    name: String,
    role: Role,
    password: String,
    linked_id: Option<String>,
    phone: Option<String>,
}

fn register(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: RegisterParams = params::parse(params)?;
    let email = normalize_email(&p.email)?;
    let name = params::required_text("name", &p.name)?;
    check_password(&p.password)?;

    let linked_id = params::optional_text(p.linked_id);
    match (p.role.linked_table(), linked_id.as_deref()) {
        (Some((table, what)), Some(id)) => params::ensure_exists(ctx.conn, table, what, id)?,
        (None, Some(_)) => {
            return Err(HandlerErr::bad_params("linkedId is not allowed for admin accounts"))
        }
        _ => {}
    }

    let taken: Option<String> = ctx
        .conn
        .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| r.get(0))
        .optional()?;
    if taken.is_some() {
        return Err(HandlerErr::conflict("email already registered")
            .with_details(json!({ "email": email })));
    }

    let user_id = params::new_id();
    let salt = params::new_id();
    ctx.conn
        .execute(
            "INSERT INTO users(id, email, name, role, linked_id, phone, password_salt, password_hash, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &user_id,
                &email,
                &name,
                p.role.as_str(),
                &linked_id,
                params::optional_text(p.phone),
                &salt,
                hash_password(&salt, &p.password),
                db::now_rfc3339(),
            ),
        )
        .map_err(HandlerErr::write("db_insert_failed", "users"))?;

    tracing::info!(user = %user_id, role = p.role.as_str(), "user registered");
    Ok(json!({ "userId": user_id }))
}

#[derive(Deserialize)]
struct ProfileIdParams {
    id: String,
}

fn profile_get(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ProfileIdParams = params::parse(params)?;
    let user = get_user(ctx.conn, &p.id)?;
    Ok(json!({ "user": user }))
}

#[derive(Deserialize)]
struct ProfileUpdateParams {
    id: String,
    patch: ProfilePatch,
}

#[derive(Deserialize)]
struct ProfilePatch {
    name: Option<String>,
    phone: Option<String>,
    password: Option<String>,
}

fn profile_update(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ProfileUpdateParams = params::parse(params)?;
    let mut user = get_user(ctx.conn, &p.id)?;
    if let Some(name) = p.patch.name {
        user.name = params::required_text("name", &name)?;
    }
    if let Some(phone) = p.patch.phone {
        user.phone = params::optional_text(Some(phone));
    }
    if let Some(password) = p.patch.password.as_deref() {
        check_password(password)?;
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE users SET name = ?, phone = ? WHERE id = ?",
        (&user.name, &user.phone, &user.id),
    )
    .map_err(HandlerErr::write("db_update_failed", "users"))?;
    if let Some(password) = p.patch.password.as_deref() {
        let salt = params::new_id();
        tx.execute(
            "UPDATE users SET password_salt = ?, password_hash = ? WHERE id = ?",
            (&salt, hash_password(&salt, password), &user.id),
        )
        .map_err(HandlerErr::write("db_update_failed", "users"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "user": user }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "register" => Some(respond(state, req, register)),
        "profile.get" => Some(respond(state, req, profile_get)),
        "profile.update" => Some(respond(state, req, profile_update)),
        _ => None,
    }
}
