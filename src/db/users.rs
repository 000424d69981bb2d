//! Users analyses can be attributed to.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use super::{format_timestamp, parse_timestamp, row_exists, FaceStore};
use crate::error::{StoreError, StoreResult};

/// A stored user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct UserRow {
    id: i64,
    name: String,
    email: Option<String>,
    created_at: String,
    updated_at: String,
}

impl UserRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_user(self) -> StoreResult<User> {
        Ok(User {
            id: self.id,
            name: self.name,
            email: self.email,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

const USER_COLUMNS: &str = "id, name, email, created_at, updated_at";

fn validate_name(name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("user name must not be empty".to_string()));
    }
    Ok(())
}

pub(crate) fn query_user(conn: &Connection, user_id: i64) -> StoreResult<Option<User>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
        [user_id],
        UserRow::from_row,
    );
    match result {
        Ok(row) => Ok(Some(row.into_user()?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn query_all_users(conn: &Connection) -> StoreResult<Vec<User>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS))?;
    let rows = stmt
        .query_map([], UserRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(UserRow::into_user).collect()
}

impl FaceStore {
    /// Add a user. The email is stored as given; the store does not check its format.
    pub fn add_user(&self, name: &str, email: Option<&str>) -> StoreResult<i64> {
        validate_name(name)?;

        let mut state = self.state();
        let now = format_timestamp(&state.next_timestamp());
        state.conn.execute(
            "INSERT INTO users (name, email, created_at, updated_at) VALUES (?, ?, ?, ?)",
            params![name, email, now, now],
        )?;
        let user_id = state.conn.last_insert_rowid();

        debug!(user_id, "Added user");
        Ok(user_id)
    }

    /// Rename a user or change their email. Only `updated_at` moves.
    pub fn update_user(&self, user_id: i64, name: &str, email: Option<&str>) -> StoreResult<User> {
        validate_name(name)?;

        let mut state = self.state();
        let now = format_timestamp(&state.next_timestamp());
        let tx = state.conn.transaction()?;
        if !row_exists(&tx, "users", user_id)? {
            return Err(StoreError::Reference(format!("user {} does not exist", user_id)));
        }
        tx.execute(
            "UPDATE users SET name = ?, email = ?, updated_at = ? WHERE id = ?",
            params![name, email, now, user_id],
        )?;
        let user = query_user(&tx, user_id)?
            .ok_or_else(|| StoreError::Reference(format!("user {} does not exist", user_id)))?;
        tx.commit()?;

        debug!(user_id, "Updated user");
        Ok(user)
    }

    pub fn get_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        query_user(&self.state().conn, user_id)
    }

    /// All users, oldest first.
    pub fn list_users(&self) -> StoreResult<Vec<User>> {
        query_all_users(&self.state().conn)
    }
}
