//! Schema versioning through SQLite's `user_version` pragma.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Step {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        description: "jobs",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Step {
        version: 2,
        description: "tasks",
        sql: include_str!("sql/002_create_tasks.sql"),
    },
];

/// Newest schema version this build knows.
pub fn latest_version() -> u32 {
    STEPS.last().map(|s| s.version).unwrap_or(0)
}

pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |r| r.get(0))?)
}

/// Brings the schema up to `latest_version`. Each step and its version bump
/// commit together. Returns the number of steps applied.
pub fn run_all(conn: &Connection) -> Result<usize, DatabaseError> {
    let current = schema_version(conn)?;
    if current > latest_version() {
        log::warn!(
            "Database schema v{} is newer than this build (v{})",
            current,
            latest_version()
        );
        return Ok(0);
    }

    let mut applied = 0;
    for step in STEPS.iter().filter(|s| s.version > current) {
        log::info!("Applying schema v{}: {}", step.version, step.description);

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(step.sql)
            .map_err(|source| DatabaseError::Migration {
                version: step.version,
                description: step.description,
                source,
            })?;
        tx.pragma_update(None, "user_version", step.version)?;
        tx.commit()?;
        applied += 1;
    }

    Ok(applied)
}
