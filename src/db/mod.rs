mod schema;
pub mod analyses;
pub mod embeddings;
pub mod maintenance;
pub mod users;
pub mod verifications;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

pub use analyses::{Analysis, AnalysisType, AnalyzeResult, NewAnalysis, ResultData, VerifyResult};
pub use embeddings::{cosine_similarity, Embedding, FaceLocation, SimilarFace};
pub use maintenance::DatabaseStats;
pub use schema::SCHEMA_VERSION;
pub use users::User;
pub use verifications::{NewVerification, Verification};

use schema::{MIGRATIONS, REQUIRED_COLUMNS};

/// Default file name, created in the working directory when no path is configured.
pub const DEFAULT_DB_FILE: &str = "face_database.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection plus the clock that hands out record timestamps.
/// Both live behind one lock so timestamps are issued in commit order.
pub(crate) struct StoreState {
    pub(crate) conn: Connection,
    last_timestamp: Option<DateTime<Utc>>,
}

impl StoreState {
    /// Next record timestamp: wall clock, but never earlier than the last one issued.
    pub(crate) fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let ts = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

/// The face analysis record store. One instance owns one database file.
///
/// All access funnels through a single connection guarded by a mutex, so the
/// store can be shared across threads with `Arc<FaceStore>`. Writes run in
/// transactions; readers never see half of a write.
pub struct FaceStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl FaceStore {
    /// Open (or create) the database file and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self::initialize(conn, Some(path.to_path_buf()))?;
        info!("Face store opened at {:?}", path);
        Ok(store)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, None)
    }

    fn initialize(mut conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        configure(&conn)?;
        // Nothing is written to the file until its version and existing tables check out.
        let version = schema_version(&conn)?;
        verify_schema(&conn, false)?;
        enable_wal(&conn)?;
        migrate(&mut conn, version)?;
        verify_schema(&conn, true)?;
        let last_timestamp = maintenance::clock_high_water(&conn)?;

        Ok(Self {
            path,
            state: Mutex::new(StoreState { conn, last_timestamp }),
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the connection, surfacing any error SQLite reports on shutdown.
    pub fn close(self) -> StoreResult<()> {
        let state = self.state.into_inner().unwrap_or_else(|e| e.into_inner());
        state.conn.close().map_err(|(_, e)| StoreError::from(e))?;
        debug!("Face store closed");
        Ok(())
    }

    /// Lock the connection. A panic in another thread cannot leave a
    /// transaction half-applied, so a poisoned lock is safe to reuse.
    pub(crate) fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Connection-level settings only; these leave the file alone.
fn configure(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn enable_wal(conn: &Connection) -> StoreResult<()> {
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    Ok(())
}

/// Current `user_version`. First read of the file; a non-database file fails here.
fn schema_version(conn: &Connection) -> StoreResult<i64> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if !(0..=SCHEMA_VERSION).contains(&version) {
        return Err(StoreError::Corruption(format!(
            "schema version {} is not supported (expected at most {})",
            version, SCHEMA_VERSION
        )));
    }
    Ok(version)
}

/// Apply migrations after `version`, one transaction per step. Re-running is a no-op.
fn migrate(conn: &mut Connection, version: i64) -> StoreResult<()> {
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        let target = index as i64 + 1;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", target)?;
        tx.commit()?;
        info!("Migrated face store schema to version {}", target);
    }

    Ok(())
}

/// Refuse to work on tables that lack columns we read or write.
/// With `require_all` unset, tables that do not exist yet are skipped.
fn verify_schema(conn: &Connection, require_all: bool) -> StoreResult<()> {
    for (table, columns) in REQUIRED_COLUMNS {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let present: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;

        if present.is_empty() {
            if !require_all {
                continue;
            }
            return Err(StoreError::Corruption(format!("table {} is missing", table)));
        }
        if let Some(missing) = columns.iter().find(|c| !present.iter().any(|p| p == *c)) {
            return Err(StoreError::Corruption(format!(
                "table {} has no column {}",
                table, missing
            )));
        }
    }
    Ok(())
}

/// Fixed-width RFC 3339 text, so lexical order in SQL equals time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corruption(format!("unreadable timestamp {:?}: {}", text, e)))
}

/// Whether a row with this id exists. `table` is always one of our own table names.
pub(crate) fn row_exists(conn: &Connection, table: &str, id: i64) -> StoreResult<bool> {
    let result = conn.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?", table),
        [id],
        |_| Ok(()),
    );
    match result {
        Ok(()) => Ok(true),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// SQLite LIMIT for a caller-supplied limit; `None` means "return nothing".
pub(crate) fn sql_limit(limit: i64) -> Option<i64> {
    (limit > 0).then_some(limit)
}
