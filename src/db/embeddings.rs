//! Face embedding storage and similarity search functionality.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

use super::analyses::{query_analysis, Analysis};
use super::{format_timestamp, parse_timestamp, row_exists, sql_limit, FaceStore};
use crate::error::{StoreError, StoreResult};

/// Bounding box of a detected face, in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceLocation {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_eye: Option<(i64, i64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_eye: Option<(i64, i64)>,
}

/// An embedding record as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    pub id: i64,
    pub analysis_id: i64,
    pub embedding: Vec<f64>,
    pub face_location: Option<FaceLocation>,
    pub created_at: DateTime<Utc>,
}

/// Search result: the analysis that owns a matching embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarFace {
    pub analysis: Analysis,
    pub embedding_id: i64,
    /// Cosine similarity to the query, in [-1, 1]. Higher is closer.
    pub similarity: f64,
}

/// Reject vectors the store could not compare later.
pub(crate) fn validate_embedding(embedding: &[f64]) -> StoreResult<()> {
    if embedding.is_empty() {
        return Err(StoreError::Validation("embedding must not be empty".to_string()));
    }
    if let Some(pos) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(StoreError::Validation(format!(
            "embedding value at index {} is not finite",
            pos
        )));
    }
    Ok(())
}

/// Dimension shared by all stored embeddings, if any are stored.
fn stored_dimension(conn: &Connection) -> StoreResult<Option<usize>> {
    let result = conn.query_row("SELECT embedding_dim FROM face_embeddings LIMIT 1", [], |row| {
        row.get::<_, i64>(0)
    });
    match result {
        Ok(dim) => Ok(Some(dim as usize)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn check_dimension(conn: &Connection, len: usize) -> StoreResult<()> {
    match stored_dimension(conn)? {
        Some(dim) if dim != len => Err(StoreError::Validation(format!(
            "embedding has {} dimensions, stored embeddings have {}",
            len, dim
        ))),
        _ => Ok(()),
    }
}

/// Insert a validated embedding inside the caller's transaction.
pub(crate) fn insert_embedding(
    conn: &Connection,
    analysis_id: i64,
    embedding: &[f64],
    face_location: Option<&FaceLocation>,
    now: &str,
) -> StoreResult<i64> {
    if !row_exists(conn, "face_analyses", analysis_id)? {
        return Err(StoreError::Reference(format!("analysis {} does not exist", analysis_id)));
    }
    check_dimension(conn, embedding.len())?;

    let location_json = face_location.map(serde_json::to_string).transpose()?;
    conn.execute(
        r#"
        INSERT INTO face_embeddings (analysis_id, embedding, embedding_dim, face_location, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
        params![
            analysis_id,
            embedding_to_bytes(embedding),
            embedding.len() as i64,
            location_json,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

struct EmbeddingRow {
    id: i64,
    analysis_id: i64,
    bytes: Vec<u8>,
    face_location: Option<String>,
    created_at: String,
}

impl EmbeddingRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            analysis_id: row.get(1)?,
            bytes: row.get(2)?,
            face_location: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_embedding(self) -> StoreResult<Embedding> {
        let face_location = self
            .face_location
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| {
                StoreError::Corruption(format!("embedding {} has unreadable face location: {}", self.id, e))
            })?;

        Ok(Embedding {
            id: self.id,
            analysis_id: self.analysis_id,
            embedding: bytes_to_embedding(self.id, &self.bytes)?,
            face_location,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

const EMBEDDING_COLUMNS: &str = "id, analysis_id, embedding, face_location, created_at";

/// Load every embedding, by id, for exports.
pub(crate) fn query_all_embeddings(conn: &Connection) -> StoreResult<Vec<Embedding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM face_embeddings ORDER BY id",
        EMBEDDING_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], EmbeddingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(EmbeddingRow::into_embedding).collect()
}

impl FaceStore {
    /// Store an embedding for an existing analysis and return its id.
    pub fn save_embedding(
        &self,
        analysis_id: i64,
        embedding: &[f64],
        face_location: Option<&FaceLocation>,
    ) -> StoreResult<i64> {
        validate_embedding(embedding)?;

        let mut state = self.state();
        let now = format_timestamp(&state.next_timestamp());
        let tx = state.conn.transaction()?;
        let embedding_id = insert_embedding(&tx, analysis_id, embedding, face_location, &now)?;
        tx.commit()?;

        debug!(embedding_id, analysis_id, dim = embedding.len(), "Saved embedding");
        Ok(embedding_id)
    }

    /// Return the most recent embedding stored for an analysis, if any.
    pub fn get_embedding_by_analysis_id(&self, analysis_id: i64) -> StoreResult<Option<Embedding>> {
        let state = self.state();
        let result = state.conn.query_row(
            &format!(
                "SELECT {} FROM face_embeddings WHERE analysis_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
                EMBEDDING_COLUMNS
            ),
            [analysis_id],
            EmbeddingRow::from_row,
        );

        match result {
            Ok(row) => Ok(Some(row.into_embedding()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Find stored faces whose cosine similarity to `target` is at least `threshold`.
    ///
    /// Results are ordered best match first; equal similarities put the most
    /// recently stored embedding first. A target whose length differs from the
    /// stored embeddings is rejected rather than truncated or padded.
    pub fn search_similar_faces(
        &self,
        target: &[f64],
        threshold: f64,
        limit: i64,
    ) -> StoreResult<Vec<SimilarFace>> {
        validate_embedding(target)?;
        if max_abs(target) == 0.0 {
            return Err(StoreError::Validation("target embedding has zero length".to_string()));
        }
        if !threshold.is_finite() {
            return Err(StoreError::Validation(format!("threshold {} is not finite", threshold)));
        }

        let state = self.state();
        check_dimension(&state.conn, target.len())?;
        let Some(limit) = sql_limit(limit) else {
            return Ok(Vec::new());
        };

        let mut stmt = state.conn.prepare(
            "SELECT id, analysis_id, embedding, created_at FROM face_embeddings",
        )?;
        let rows: Vec<(i64, i64, Vec<u8>, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<Result<_, _>>()?;

        // Calculate similarities
        let scored = rows
            .par_iter()
            .enumerate()
            .map(|(index, (id, _, bytes, _))| -> StoreResult<(usize, f64)> {
                let stored = bytes_to_embedding(*id, bytes)?;
                let similarity = cosine_similarity(target, &stored);
                if similarity.is_nan() {
                    return Err(StoreError::Corruption(format!(
                        "embedding {} has values that cannot be compared",
                        id
                    )));
                }
                Ok((index, similarity))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let mut matches: Vec<(usize, f64)> =
            scored.into_iter().filter(|(_, sim)| *sim >= threshold).collect();

        // Best first, then newest first
        matches.sort_by(|(a, sim_a), (b, sim_b)| {
            sim_b
                .partial_cmp(sim_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| rows[*b].3.cmp(&rows[*a].3))
                .then_with(|| rows[*b].0.cmp(&rows[*a].0))
        });
        matches.truncate(limit as usize);

        let mut results = Vec::with_capacity(matches.len());
        for (index, similarity) in matches {
            let (embedding_id, analysis_id, _, _) = &rows[index];
            // Foreign keys keep every embedding attached to a live analysis.
            let analysis = query_analysis(&state.conn, *analysis_id)?.ok_or_else(|| {
                StoreError::Corruption(format!(
                    "embedding {} references missing analysis {}",
                    embedding_id, analysis_id
                ))
            })?;
            results.push(SimilarFace { analysis, embedding_id: *embedding_id, similarity });
        }

        debug!(candidates = rows.len(), matches = results.len(), threshold, "Similar face search");
        Ok(results)
    }

    /// Return the number of stored embeddings.
    pub fn count_embeddings(&self) -> StoreResult<i64> {
        let count: i64 = self.state().conn.query_row(
            "SELECT COUNT(*) FROM face_embeddings",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Encode a vector as little-endian f64 bytes for storage.
pub(crate) fn embedding_to_bytes(embedding: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 8);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Decode a stored blob back into a vector, bit for bit.
pub(crate) fn bytes_to_embedding(embedding_id: i64, bytes: &[u8]) -> StoreResult<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(StoreError::Corruption(format!(
            "embedding {} is {} bytes, not a whole number of f64 values",
            embedding_id,
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(chunk);
            f64::from_le_bytes(arr)
        })
        .collect())
}

fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |m, x| m.max(x.abs()))
}

/// Compute the cosine similarity of two vectors, in [-1, 1].
///
/// Each vector is divided by its largest magnitude first, so the sums can
/// neither overflow nor underflow for any finite input. Vectors of different
/// length, empty vectors and all-zero vectors score 0.0. Non-finite input
/// yields NaN.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    if a.iter().chain(b).any(|x| !x.is_finite()) {
        return f64::NAN;
    }

    let (scale_a, scale_b) = (max_abs(a), max_abs(b));
    if scale_a == 0.0 || scale_b == 0.0 {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (x / scale_a, y / scale_b);
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    (dot_product / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}
