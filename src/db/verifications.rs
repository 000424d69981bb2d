//! Pairwise verification outcomes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use super::analyses::validate_duration;
use super::{format_timestamp, parse_timestamp, row_exists, sql_limit, FaceStore};
use crate::error::{StoreError, StoreResult};

/// A stored verification, with the image paths of both compared analyses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub id: i64,
    pub image1_id: i64,
    pub image2_id: i64,
    pub image1_path: String,
    pub image2_path: String,
    pub similarity_score: f64,
    pub verified: bool,
    pub threshold_used: f64,
    pub model_used: Option<String>,
    pub detector_used: Option<String>,
    pub processing_time: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Input for [`FaceStore::save_verification`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewVerification {
    pub image1_id: i64,
    pub image2_id: i64,
    pub similarity_score: f64,
    pub verified: bool,
    pub threshold_used: f64,
    pub model_used: Option<String>,
    pub detector_used: Option<String>,
    pub processing_time: Option<f64>,
}

impl NewVerification {
    pub fn new(image1_id: i64, image2_id: i64, similarity_score: f64, verified: bool, threshold_used: f64) -> Self {
        Self {
            image1_id,
            image2_id,
            similarity_score,
            verified,
            threshold_used,
            model_used: None,
            detector_used: None,
            processing_time: None,
        }
    }

    pub fn with_models(mut self, model_used: Option<String>, detector_used: Option<String>) -> Self {
        self.model_used = model_used;
        self.detector_used = detector_used;
        self
    }

    pub fn with_processing_time(mut self, seconds: Option<f64>) -> Self {
        self.processing_time = seconds;
        self
    }

    pub(crate) fn validate(&self) -> StoreResult<()> {
        if !self.similarity_score.is_finite() {
            return Err(StoreError::Validation(format!(
                "similarity score {} is not finite",
                self.similarity_score
            )));
        }
        if !self.threshold_used.is_finite() {
            return Err(StoreError::Validation(format!(
                "threshold {} is not finite",
                self.threshold_used
            )));
        }
        validate_duration(self.processing_time)
    }
}

/// Insert a validated verification inside the caller's transaction.
pub(crate) fn insert_verification(conn: &Connection, new: &NewVerification, now: &str) -> StoreResult<i64> {
    for image_id in [new.image1_id, new.image2_id] {
        if !row_exists(conn, "face_analyses", image_id)? {
            return Err(StoreError::Reference(format!("analysis {} does not exist", image_id)));
        }
    }

    conn.execute(
        r#"
        INSERT INTO verification_history
            (image1_id, image2_id, similarity_score, verified, threshold_used,
             model_used, detector_used, processing_time, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            new.image1_id,
            new.image2_id,
            new.similarity_score,
            new.verified,
            new.threshold_used,
            new.model_used,
            new.detector_used,
            new.processing_time,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const VERIFICATION_SELECT: &str = r#"
    SELECT vh.id, vh.image1_id, vh.image2_id, fa1.image_path, fa2.image_path,
           vh.similarity_score, vh.verified, vh.threshold_used, vh.model_used,
           vh.detector_used, vh.processing_time, vh.created_at
    FROM verification_history vh
    JOIN face_analyses fa1 ON vh.image1_id = fa1.id
    JOIN face_analyses fa2 ON vh.image2_id = fa2.id
"#;

struct VerificationRow {
    verification: Verification,
    created_at: String,
}

impl VerificationRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            verification: Verification {
                id: row.get(0)?,
                image1_id: row.get(1)?,
                image2_id: row.get(2)?,
                image1_path: row.get(3)?,
                image2_path: row.get(4)?,
                similarity_score: row.get(5)?,
                verified: row.get(6)?,
                threshold_used: row.get(7)?,
                model_used: row.get(8)?,
                detector_used: row.get(9)?,
                processing_time: row.get(10)?,
                created_at: DateTime::<Utc>::UNIX_EPOCH,
            },
            created_at: row.get(11)?,
        })
    }

    fn into_verification(self) -> StoreResult<Verification> {
        Ok(Verification {
            created_at: parse_timestamp(&self.created_at)?,
            ..self.verification
        })
    }
}

fn query_verifications(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<Verification>> {
    let mut stmt = conn.prepare(&format!("{} {}", VERIFICATION_SELECT, clause))?;
    let rows = stmt
        .query_map(params, VerificationRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(VerificationRow::into_verification).collect()
}

/// Every verification, by id. Used for exports.
pub(crate) fn query_all_verifications(conn: &Connection) -> StoreResult<Vec<Verification>> {
    query_verifications(conn, "ORDER BY vh.id", [])
}

impl FaceStore {
    /// Persist a verification between two stored analyses.
    pub fn save_verification(&self, new: &NewVerification) -> StoreResult<i64> {
        new.validate()?;

        let mut state = self.state();
        let now = format_timestamp(&state.next_timestamp());
        let tx = state.conn.transaction()?;
        let verification_id = insert_verification(&tx, new, &now)?;
        tx.commit()?;

        debug!(verification_id, verified = new.verified, "Saved verification");
        Ok(verification_id)
    }

    /// Recent verifications, most recent first.
    pub fn get_verification_history(&self, limit: i64) -> StoreResult<Vec<Verification>> {
        let Some(limit) = sql_limit(limit) else {
            return Ok(Vec::new());
        };
        query_verifications(
            &self.state().conn,
            "ORDER BY vh.created_at DESC, vh.id DESC LIMIT ?",
            [limit],
        )
    }
}
