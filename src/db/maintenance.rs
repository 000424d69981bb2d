//! Store-wide statistics and housekeeping.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use super::schema::DATA_TABLES;
use super::{format_timestamp, parse_timestamp, FaceStore};
use crate::error::{StoreError, StoreResult};

/// Counts and activity summary for the whole store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub user_count: i64,
    pub analysis_count: i64,
    pub embedding_count: i64,
    pub verification_count: i64,
    /// Analyses created during the last seven days.
    pub recent_analyses_7days: i64,
    pub db_size_bytes: i64,
    pub last_activity_timestamp: Option<DateTime<Utc>>,
}

fn count(conn: &Connection, table: &str) -> StoreResult<i64> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(n)
}

/// Latest `created_at`/`updated_at` across every table.
pub(crate) fn latest_activity(conn: &Connection) -> StoreResult<Option<DateTime<Utc>>> {
    let latest: Option<String> = conn.query_row(
        r#"
        SELECT MAX(ts) FROM (
            SELECT MAX(updated_at) AS ts FROM users
            UNION ALL SELECT MAX(created_at) FROM users
            UNION ALL SELECT MAX(created_at) FROM face_analyses
            UNION ALL SELECT MAX(created_at) FROM face_embeddings
            UNION ALL SELECT MAX(created_at) FROM verification_history
        )
        "#,
        [],
        |row| row.get(0),
    )?;
    latest.as_deref().map(parse_timestamp).transpose()
}

/// Where the record clock resumes on open: the later of the latest record and
/// the mark saved by the last clear.
pub(crate) fn clock_high_water(conn: &Connection) -> StoreResult<Option<DateTime<Utc>>> {
    let saved: Option<String> = conn
        .query_row("SELECT last_timestamp FROM store_meta WHERE id = 1", [], |row| row.get(0))
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e),
        })?;
    let saved = saved.as_deref().map(parse_timestamp).transpose()?;
    Ok(latest_activity(conn)?.max(saved))
}

pub(crate) fn query_stats(conn: &Connection) -> StoreResult<DatabaseStats> {
    let week_ago = format_timestamp(&(Utc::now() - Duration::days(7)));
    let recent_analyses_7days: i64 = conn.query_row(
        "SELECT COUNT(*) FROM face_analyses WHERE created_at >= ?",
        [week_ago],
        |row| row.get(0),
    )?;

    let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
    let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;

    Ok(DatabaseStats {
        user_count: count(conn, "users")?,
        analysis_count: count(conn, "face_analyses")?,
        embedding_count: count(conn, "face_embeddings")?,
        verification_count: count(conn, "verification_history")?,
        recent_analyses_7days,
        db_size_bytes: page_count * page_size,
        last_activity_timestamp: latest_activity(conn)?,
    })
}

impl FaceStore {
    pub fn get_database_stats(&self) -> StoreResult<DatabaseStats> {
        query_stats(&self.state().conn)
    }

    /// Delete every record. Refuses unless `confirm` is set.
    ///
    /// Id counters restart at 1 afterwards. The latest issued timestamp is kept
    /// in `store_meta`, so record timestamps keep moving forward across the
    /// clear and any later reopen.
    pub fn clear_database(&self, confirm: bool) -> StoreResult<()> {
        if !confirm {
            warn!("Refusing to clear face store without confirmation");
            return Err(StoreError::Precondition(
                "clearing the database requires confirmation".to_string(),
            ));
        }

        let mut state = self.state();
        let high_water = state.last_timestamp.as_ref().map(format_timestamp);
        let tx = state.conn.transaction()?;
        tx.execute(
            "INSERT INTO store_meta (id, last_timestamp) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET last_timestamp = excluded.last_timestamp",
            [high_water],
        )?;
        for table in DATA_TABLES {
            tx.execute(&format!("DELETE FROM {}", table), [])?;
        }
        tx.execute(
            &format!(
                "DELETE FROM sqlite_sequence WHERE name IN ({})",
                DATA_TABLES.iter().map(|t| format!("'{}'", t)).collect::<Vec<_>>().join(", ")
            ),
            [],
        )?;
        tx.commit()?;

        info!("Cleared all face store records");
        Ok(())
    }

    /// Reclaim free pages and refresh query planner statistics.
    pub fn optimize(&self) -> StoreResult<()> {
        let state = self.state();
        state.conn.execute_batch("VACUUM; PRAGMA optimize;")?;
        info!("Optimized face store");
        Ok(())
    }
}
