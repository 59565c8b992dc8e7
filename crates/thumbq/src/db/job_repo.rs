//! Plain SQL over the `jobs` table. State rules live in `job::store`.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// `jobs` row as stored; enums and timestamps are still text.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub owner_id: String,
    pub source_path: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub media_kind: String,
    pub status: String,
    pub thumbnail_file: Option<String>,
    pub error_message: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            source_path: row.get("source_path")?,
            original_name: row.get("original_name")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get("size_bytes")?,
            media_kind: row.get("media_kind")?,
            status: row.get("status")?,
            thumbnail_file: row.get("thumbnail_file")?,
            error_message: row.get("error_message")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Column values written by a status transition.
#[derive(Debug, Clone)]
pub struct StatusUpdate<'a> {
    pub status: &'a str,
    pub thumbnail_file: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub updated_at: &'a str,
}

pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, owner_id, source_path, original_name, mime_type, size_bytes,
             media_kind, status, thumbnail_file, error_message, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id,
                job.owner_id,
                job.source_path,
                job.original_name,
                job.mime_type,
                job.size_bytes,
                job.media_kind,
                job.status,
                job.thumbnail_file,
                job.error_message,
                job.version,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Lists an owner's jobs, newest first. `rowid` breaks ties between jobs
/// created within the same timestamp.
pub fn list_by_owner(db: &Database, owner_id: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE owner_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map(params![owner_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Applies a status update only if the row still carries `expected_version`.
///
/// Returns `true` when the row was updated, `false` when another writer got
/// there first (or the row is gone).
pub fn compare_and_set_status(
    db: &Database,
    id: &str,
    expected_version: i64,
    update: &StatusUpdate<'_>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, thumbnail_file = ?4, error_message = ?5,
             updated_at = ?6, version = version + 1
             WHERE id = ?1 AND version = ?2",
            params![
                id,
                expected_version,
                update.status,
                update.thumbnail_file,
                update.error_message,
                update.updated_at,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Used for the daemon's start/stop summary.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
