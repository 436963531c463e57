use rusqlite::Connection;

use crate::error::Result;

/// Initialise the store schema in `conn`.
///
/// Creates the `aggregates` table holding one JSON document per boiler and the
/// append-only `samples` table shared by every time series (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS aggregates (
            name        TEXT    NOT NULL PRIMARY KEY,
            data        TEXT    NOT NULL,   -- JSON-encoded BoilerInfo
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS samples (
            series      TEXT    NOT NULL,   -- e.g. switch:caldaia
            ts          INTEGER NOT NULL,   -- unix milliseconds
            value       REAL    NOT NULL
        ) STRICT;

        -- Range scans: WHERE series = ? AND ts BETWEEN ? AND ?
        CREATE INDEX IF NOT EXISTS idx_samples_series_ts ON samples (series, ts);
        ",
    )?;
    Ok(())
}
