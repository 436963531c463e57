//! Append-only time series over the shared `samples` table.
//!
//! Every series is a `(ts, value)` sequence keyed by name; callers map the
//! numeric value to their own sample type.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

pub(crate) fn append(conn: &Connection, series: &str, time: DateTime<Utc>, value: f64) -> Result<()> {
    conn.execute(
        "INSERT INTO samples (series, ts, value) VALUES (?1, ?2, ?3)",
        params![series, time.timestamp_millis(), value],
    )?;
    Ok(())
}

/// Samples with `from <= ts <= to`, oldest first.
pub(crate) fn range(
    conn: &Connection,
    series: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<(DateTime<Utc>, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, value FROM samples
         WHERE series = ?1 AND ts >= ?2 AND ts <= ?3
         ORDER BY ts, rowid",
    )?;
    let rows = stmt
        .query_map(
            params![series, from.timestamp_millis(), to.timestamp_millis()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
        )?
        .filter_map(|r| r.ok())
        .filter_map(|(ts, value)| from_millis(ts).map(|t| (t, value)))
        .collect();
    Ok(rows)
}

/// Most recent sample at or before `at`.
pub(crate) fn last_at_or_before(
    conn: &Connection,
    series: &str,
    at: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, f64)>> {
    let row = conn
        .query_row(
            "SELECT ts, value FROM samples
             WHERE series = ?1 AND ts <= ?2
             ORDER BY ts DESC, rowid DESC
             LIMIT 1",
            params![series, at.timestamp_millis()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
        )
        .optional()?;
    Ok(row.and_then(|(ts, value)| from_millis(ts).map(|t| (t, value))))
}

/// Mean of the values in `[from, to]`, `None` when the range is empty.
pub(crate) fn average(
    conn: &Connection,
    series: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Option<f64>> {
    let avg = conn.query_row(
        "SELECT AVG(value) FROM samples WHERE series = ?1 AND ts >= ?2 AND ts <= ?3",
        params![series, from.timestamp_millis(), to.timestamp_millis()],
        |row| row.get::<_, Option<f64>>(0),
    )?;
    Ok(avg)
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
