use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::info;

use crate::db::analyses::query_all_analyses;
use crate::db::embeddings::query_all_embeddings;
use crate::db::maintenance::query_stats;
use crate::db::users::query_all_users;
use crate::db::verifications::query_all_verifications;
use crate::db::{format_timestamp, Analysis, DatabaseStats, Embedding, FaceStore, User, Verification};
use crate::error::{StoreError, StoreResult};

/// Which records an export contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Users,
    Analyses,
    Verifications,
    All,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Users => "users",
            DataType::Analyses => "analyses",
            DataType::Verifications => "verifications",
            DataType::All => "all",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(DataType::Users),
            "analyses" => Ok(DataType::Analyses),
            "verifications" => Ok(DataType::Verifications),
            "all" => Ok(DataType::All),
            other => Err(StoreError::Validation(format!(
                "unknown export data type {:?} (expected users, analyses, verifications or all)",
                other
            ))),
        }
    }
}

/// Export format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::Csv => "CSV",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(StoreError::Validation(format!("unknown export format {:?}", other))),
        }
    }
}

/// Top-level JSON export document. Lists not selected by the data type are omitted.
#[derive(Debug, Serialize)]
struct ExportDocument {
    export_timestamp: DateTime<Utc>,
    database_stats: DatabaseStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    users: Option<Vec<User>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    analyses: Option<Vec<Analysis>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embeddings: Option<Vec<Embedding>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verifications: Option<Vec<Verification>>,
}

impl ExportDocument {
    fn record_count(&self) -> usize {
        self.users.as_ref().map_or(0, Vec::len)
            + self.analyses.as_ref().map_or(0, Vec::len)
            + self.embeddings.as_ref().map_or(0, Vec::len)
            + self.verifications.as_ref().map_or(0, Vec::len)
    }
}

impl FaceStore {
    /// Export records to `export_path`, replacing any file already there.
    ///
    /// The file appears complete or not at all.
    pub fn export_data(
        &self,
        export_path: impl AsRef<Path>,
        data_type: DataType,
        format: ExportFormat,
    ) -> StoreResult<PathBuf> {
        let export_path = export_path.as_ref();
        if format == ExportFormat::Csv && data_type == DataType::All {
            return Err(StoreError::Validation(
                "CSV export holds a single record kind; choose users, analyses or verifications"
                    .to_string(),
            ));
        }

        let document = self.snapshot(data_type)?;
        write_atomically(export_path, |file| match format {
            ExportFormat::Json => write_json(&document, file),
            ExportFormat::Csv => write_csv(&document, file),
        })?;

        info!(
            "Exported {} {} records as {} to {:?}",
            document.record_count(),
            data_type,
            format.name(),
            export_path
        );
        Ok(export_path.to_path_buf())
    }

    /// Read everything an export needs under one lock.
    fn snapshot(&self, data_type: DataType) -> StoreResult<ExportDocument> {
        let state = self.state();
        let conn = &state.conn;
        let wants = |kind: DataType| data_type == kind || data_type == DataType::All;

        Ok(ExportDocument {
            export_timestamp: Utc::now(),
            database_stats: query_stats(conn)?,
            users: wants(DataType::Users).then(|| query_all_users(conn)).transpose()?,
            analyses: wants(DataType::Analyses).then(|| query_all_analyses(conn)).transpose()?,
            embeddings: (data_type == DataType::All)
                .then(|| query_all_embeddings(conn))
                .transpose()?,
            verifications: wants(DataType::Verifications)
                .then(|| query_all_verifications(conn))
                .transpose()?,
        })
    }
}

/// Write through a temporary file in the destination directory, then rename into place.
fn write_atomically(
    path: &Path,
    write: impl FnOnce(&mut File) -> StoreResult<()>,
) -> StoreResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

fn write_json(document: &ExportDocument, file: &mut File) -> StoreResult<()> {
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, document)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

fn write_csv(document: &ExportDocument, file: &mut File) -> StoreResult<()> {
    let mut wtr = csv::Writer::from_writer(file);

    if let Some(users) = &document.users {
        wtr.write_record(["id", "name", "email", "created_at", "updated_at"])?;
        for user in users {
            wtr.write_record([
                user.id.to_string(),
                user.name.clone(),
                opt(&user.email),
                format_timestamp(&user.created_at),
                format_timestamp(&user.updated_at),
            ])?;
        }
    } else if let Some(analyses) = &document.analyses {
        wtr.write_record([
            "id",
            "user_id",
            "user_name",
            "image_path",
            "analysis_type",
            "result_data",
            "confidence_score",
            "processing_time",
            "model_used",
            "detector_used",
            "created_at",
        ])?;
        for analysis in analyses {
            wtr.write_record([
                analysis.id.to_string(),
                opt(&analysis.user_id),
                opt(&analysis.user_name),
                analysis.image_path.clone(),
                analysis.analysis_type.to_string(),
                analysis.result_data.to_json()?,
                opt(&analysis.confidence_score),
                opt(&analysis.processing_time),
                opt(&analysis.model_used),
                opt(&analysis.detector_used),
                format_timestamp(&analysis.created_at),
            ])?;
        }
    } else if let Some(verifications) = &document.verifications {
        wtr.write_record([
            "id",
            "image1_id",
            "image2_id",
            "image1_path",
            "image2_path",
            "similarity_score",
            "verified",
            "threshold_used",
            "model_used",
            "detector_used",
            "processing_time",
            "created_at",
        ])?;
        for v in verifications {
            wtr.write_record([
                v.id.to_string(),
                v.image1_id.to_string(),
                v.image2_id.to_string(),
                v.image1_path.clone(),
                v.image2_path.clone(),
                v.similarity_score.to_string(),
                v.verified.to_string(),
                v.threshold_used.to_string(),
                opt(&v.model_used),
                opt(&v.detector_used),
                opt(&v.processing_time),
                format_timestamp(&v.created_at),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}
