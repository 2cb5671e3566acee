use chrono::{DateTime, NaiveDateTime, ParseError, SecondsFormat, SubsecRound, Utc};
use rusqlite::Row;
use rusqlite::types::Type;

/// Current time at the precision timestamps are stored with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width UTC form so that text ordering matches chronological ordering.
pub(crate) fn format(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse(s: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite datetime('now') produces "YYYY-MM-DD HH:MM:SS"
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
}

/// Read a stored timestamp column. Text that is not a timestamp fails the row.
pub(crate) fn column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
