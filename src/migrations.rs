//! Versioned schema for the lead database.
//!
//! Schema steps are SQL files compiled into the binary. `schema_version`
//! records every step applied; each step and its record commit together.

use std::path::PathBuf;

use rusqlite::Connection;

/// `(version, sql)` in ascending order.
const SCHEMA_STEPS: &[(u32, &str)] = &[(1, include_str!("migrations/001_baseline.sql"))];

fn latest_known() -> u32 {
    SCHEMA_STEPS.last().map(|(v, _)| *v).unwrap_or(0)
}

/// Highest applied version, creating the bookkeeping table on first use.
fn applied_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );",
    )?;
    conn.query_row("SELECT IFNULL(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })
}

/// Copy a file-backed database to `<path>.v<from>.bak` before upgrading it.
///
/// Nothing is copied for a database that has no schema yet or lives in memory.
fn snapshot_before_upgrade(conn: &Connection, from: u32) -> Result<Option<PathBuf>, String> {
    if from == 0 {
        return Ok(None);
    }
    let main_file = conn.path().map(str::to_string).unwrap_or_default();
    if main_file.is_empty() || main_file == ":memory:" {
        return Ok(None);
    }

    let target = PathBuf::from(format!("{}.v{}.bak", main_file, from));
    let mut dest = Connection::open(&target)
        .map_err(|e| format!("Cannot create schema snapshot {}: {}", target.display(), e))?;
    rusqlite::backup::Backup::new(conn, &mut dest)
        .and_then(|backup| backup.step(-1).map(|_| ()))
        .map_err(|e| format!("Schema snapshot to {} failed: {}", target.display(), e))?;

    log::info!("Saved v{} snapshot to {}", from, target.display());
    Ok(Some(target))
}

/// Bring the schema up to date. Returns how many steps were applied.
///
/// A database written by a newer pastlead is refused rather than guessed at.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    let from = applied_version(conn).map_err(|e| format!("Cannot read schema version: {}", e))?;
    let latest = latest_known();
    if from > latest {
        return Err(format!(
            "Database is at schema v{from}, newer than this version of pastlead supports (v{latest}); \
             upgrade pastlead first."
        ));
    }
    if from == latest {
        return Ok(0);
    }

    snapshot_before_upgrade(conn, from)?;

    let mut applied = 0;
    for (version, sql) in SCHEMA_STEPS.iter().filter(|(v, _)| *v > from) {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("Cannot start schema step v{}: {}", version, e))?;
        tx.execute_batch(sql)
            .and_then(|_| tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version]))
            .and_then(|_| tx.commit())
            .map_err(|e| format!("Schema step v{} failed: {}", version, e))?;
        log::info!("Schema upgraded to v{}", version);
        applied += 1;
    }
    Ok(applied)
}
