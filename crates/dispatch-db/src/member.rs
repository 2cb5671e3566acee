use chrono::{DateTime, Utc};
use dispatch_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::write_error;
use crate::timestamp;

/// A site member who can be subscribed to newsletters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn create(conn: &Connection, email: &str, name: Option<&str>) -> Result<Member> {
    let email = email.trim();
    if email.is_empty() {
        return Err(Error::Validation("member email is required".into()));
    }

    let member = Member {
        id: Uuid::new_v4().to_string(),
        email: email.to_string(),
        name: name.map(str::to_string),
        created_at: timestamp::now(),
    };

    conn.execute(
        "INSERT INTO members (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            member.id,
            member.email,
            member.name,
            timestamp::format(&member.created_at)
        ],
    )
    .map_err(|e| write_error("failed to create member", e))?;

    Ok(member)
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Member>> {
    conn.query_row(
        "SELECT id, email, name, created_at FROM members WHERE id = ?1",
        params![id],
        |row| {
            Ok(Member {
                id: row.get(0)?,
                email: row.get(1)?,
                name: row.get(2)?,
                created_at: timestamp::column(row, 3)?,
            })
        },
    )
    .optional()
    .map_err(|e| Error::Database(format!("failed to load member: {e}")))
}
