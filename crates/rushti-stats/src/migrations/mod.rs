//! Migration runner — version tracking, forward-only, one transaction per
//! migration (grounded on `cortex-storage`'s migration runner).

mod v001_initial_schema;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::StatsError;

pub const LATEST_VERSION: u32 = 1;

type MigrationFn = fn(&Connection) -> Result<(), StatsError>;

const MIGRATIONS: [(u32, &str, MigrationFn); 1] = [(1, "initial_schema", v001_initial_schema::migrate)];

pub fn current_version(conn: &Connection) -> Result<u32, StatsError> {
    let exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'")?
        .exists([])?;
    if !exists {
        return Ok(0);
    }
    let version: u32 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))?;
    Ok(version)
}

pub fn run_migrations(conn: &mut Connection) -> Result<u32, StatsError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')))",
    )?;

    let current = current_version(conn)?;
    let mut applied = 0;
    if current >= LATEST_VERSION {
        debug!("stats database schema is up to date (v{current})");
        return Ok(0);
    }

    info!("running stats db migrations: v{current} -> v{LATEST_VERSION}");
    for &(version, name, migrate_fn) in &MIGRATIONS {
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        match migrate_fn(&tx) {
            Ok(()) => {
                tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
                tx.commit()?;
                info!("applied migration v{version:03}: {name}");
                applied += 1;
            }
            Err(e) => {
                warn!("migration v{version:03} failed: {e}, rolling back");
                return Err(e);
            }
        }
    }
    Ok(applied)
}
