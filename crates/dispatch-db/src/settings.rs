//! Site-wide `(key, value)` settings.

use dispatch_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;

use crate::database::write_error;
use crate::timestamp;

/// Fetch the rows for `keys` in a single query. Keys without a row are
/// simply absent from the result.
pub fn get_many(conn: &Connection, keys: &[&str]) -> Result<Vec<(String, Option<String>)>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; keys.len()].join(", ");
    let sql = format!("SELECT key, value FROM settings WHERE key IN ({placeholders}) ORDER BY key");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| Error::Database(format!("failed to prepare settings query: {e}")))?;

    let rows = stmt
        .query_map(params_from_iter(keys.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })
        .map_err(|e| Error::Database(format!("failed to query settings: {e}")))?;

    let mut settings = Vec::new();
    for row in rows {
        settings.push(row.map_err(|e| Error::Database(format!("failed to read setting row: {e}")))?);
    }
    Ok(settings)
}

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read setting '{key}': {e}")))?;
    Ok(value.flatten())
}

/// Insert or overwrite a setting.
pub fn set(conn: &Connection, key: &str, value: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (id, key, value, created_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![
            Uuid::new_v4().to_string(),
            key,
            value,
            timestamp::format(&timestamp::now())
        ],
    )
    .map_err(|e| write_error(&format!("failed to write setting '{key}'"), e))?;
    Ok(())
}
