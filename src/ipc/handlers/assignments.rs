//! Targeting shared by schedules, exams and events: a whole class, a list of
//! individual students, or (exams and events only) everyone.

use crate::ipc::error::HandlerErr;
use crate::ipc::params;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignType {
    Class,
    Individual,
    All,
}

impl AssignType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Individual => "individual",
            Self::All => "all",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "individual" => Self::Individual,
            "all" => Self::All,
            _ => Self::Class,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Schedule,
    Exam,
    Event,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Exam => "exam",
            Self::Event => "event",
        }
    }

    fn allows_all(self) -> bool {
        !matches!(self, Self::Schedule)
    }
}

/// Validated targeting, ready to be stored.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub assign_type: AssignType,
    pub class_id: Option<String>,
    pub students: Vec<String>,
}

pub fn validate(
    conn: &Connection,
    kind: ItemKind,
    assign_type: AssignType,
    class_id: Option<String>,
    selected_students: &[String],
) -> Result<Assignment, HandlerErr> {
    let class_id = params::optional_text(class_id);
    if let Some(cid) = class_id.as_deref() {
        params::ensure_exists(conn, "classes", "class", cid)?;
    }

    match assign_type {
        AssignType::All if !kind.allows_all() => Err(HandlerErr::bad_params(format!(
            "assignType 'all' is not supported for {}",
            kind.as_str()
        ))),
        AssignType::Class => {
            if class_id.is_none() {
                return Err(HandlerErr::bad_params(
                    "classId is required when assignType is 'class'",
                ));
            }
            Ok(Assignment {
                assign_type,
                class_id,
                students: Vec::new(),
            })
        }
        AssignType::Individual => {
            let mut students: Vec<String> = Vec::with_capacity(selected_students.len());
            let mut missing: Vec<&str> = Vec::new();
            for sid in selected_students {
                if students.contains(sid) {
                    continue;
                }
                if params::row_exists(conn, "students", sid)? {
                    students.push(sid.clone());
                } else {
                    missing.push(sid);
                }
            }
            if !missing.is_empty() {
                return Err(HandlerErr::bad_params("unknown selectedStudents")
                    .with_details(json!({ "studentIds": missing })));
            }
            if students.is_empty() {
                return Err(HandlerErr::bad_params(
                    "selectedStudents must not be empty when assignType is 'individual'",
                ));
            }
            Ok(Assignment {
                assign_type,
                class_id,
                students,
            })
        }
        AssignType::All => Ok(Assignment {
            assign_type,
            class_id,
            students: Vec::new(),
        }),
    }
}

pub fn store_links(
    conn: &Connection,
    kind: ItemKind,
    item_id: &str,
    students: &[String],
) -> Result<(), HandlerErr> {
    for sid in students {
        conn.execute(
            "INSERT INTO assignment_students(item_kind, item_id, student_id) VALUES(?, ?, ?)",
            (kind.as_str(), item_id, sid),
        )
        .map_err(HandlerErr::write("db_insert_failed", "assignment_students"))?;
    }
    Ok(())
}

pub fn delete_links(conn: &Connection, kind: ItemKind, item_id: &str) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM assignment_students WHERE item_kind = ? AND item_id = ?",
        (kind.as_str(), item_id),
    )
    .map_err(HandlerErr::write("db_delete_failed", "assignment_students"))?;
    Ok(())
}

/// Selected students per item id.
pub fn load_links(
    conn: &Connection,
    kind: ItemKind,
) -> Result<HashMap<String, Vec<String>>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT a.item_id, a.student_id
         FROM assignment_students a
         JOIN students s ON s.id = a.student_id
         WHERE a.item_kind = ?
         ORDER BY s.name",
    )?;
    let rows = stmt
        .query_map([kind.as_str()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (item_id, student_id) in rows {
        out.entry(item_id).or_default().push(student_id);
    }
    Ok(out)
}

/// SQL predicate selecting rows of `alias` visible to one student. Binds
/// `?1` = student id, `?2` = the student's class id (may be NULL).
pub fn visible_to_student_sql(kind: ItemKind, alias: &str) -> String {
    format!(
        "({a}.assign_type = 'all'
          OR ({a}.assign_type = 'class' AND {a}.class_id = ?2)
          OR ({a}.assign_type = 'individual' AND EXISTS(
                SELECT 1 FROM assignment_students x
                WHERE x.item_kind = '{k}' AND x.item_id = {a}.id AND x.student_id = ?1)))",
        a = alias,
        k = kind.as_str()
    )
}
